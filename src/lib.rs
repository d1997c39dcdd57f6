//! # timetag-capture: photon time-tagger capture pipeline
//!
//! Drives a time-tagging acquisition device over its text control protocol,
//! routes its binned photon counts to any number of data outputs, and keeps
//! per-channel rolling buffers and statistics for live display.
//!
//! ## Architecture
//!
//! - **Control**: line protocol client over a stream or message socket, or an
//!   in-process simulated tagger
//! - **Binner**: external binning process (or direct record stream) decoded by
//!   a listener thread into [`types::Bin`]s
//! - **Pipeline**: owns the control session, the capture binner and the
//!   registry of data outputs
//! - **Consumers**: managed binners (buffer, count histogram, FRET,
//!   correlator) that attach and detach themselves as capture starts and stops
//! - **Communication**: crossbeam channels for lifecycle events
//!
//! ## Configuration
//!
//! Settings are read from `config.toml` in the platform config directory
//! under `timetag-capture`:
//!
//! - **Linux**: `~/.config/timetag-capture/config.toml`
//! - **macOS**: `~/Library/Application Support/timetag-capture/config.toml`
//!
//! ## Example
//!
//! ```ignore
//! use timetag_capture::{CaptureConfig, CapturePipeline};
//!
//! let pipeline = CapturePipeline::new(CaptureConfig::load_or_default())?;
//! pipeline.start()?;
//! pipeline.start_capture()?;
//! for stats in pipeline.stats() {
//!     println!("{}: {} photons", stats.channel, stats.photon_count);
//! }
//! pipeline.stop()?;
//! ```

pub mod analysis;
pub mod binner;
pub mod config;
pub mod consumers;
pub mod control;
pub mod error;
pub mod histogram;
pub mod pipeline;
pub mod ring_buffer;
pub mod types;

// Re-export commonly used types
pub use binner::{BinHandler, BinRecord, Binner, BinnerLaunch, RecordLayout};
pub use config::{CaptureConfig, ControlBackend};
pub use consumers::{BinnerConsumer, ConsumerConfig, ManagedBinner, ManagedConsumer};
pub use control::ControlLink;
pub use error::{CaptureError, Result};
pub use pipeline::{CapturePipeline, ChannelStore, OutputRegistry, PipelineEvent};
pub use ring_buffer::RingBuffer;
pub use types::{Bin, ChannelBins, ChannelId, ChannelStats, Sample};
