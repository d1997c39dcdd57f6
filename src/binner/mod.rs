//! Binner workers
//!
//! A [`Binner`] owns one binning agent and the thread that listens to it.
//! The agent's input end is exposed as a descriptor ([`Binner::data_fd`])
//! that gets registered with the acquisition peer as an output. Its output is
//! a stream of fixed-width bin records, decoded by the listener thread and
//! handed to a [`BinHandler`].
//!
//! # Launch modes
//!
//! - [`BinnerLaunch::Process`] spawns the external binning executable with
//!   piped stdin/stdout. The peer writes raw events into its stdin.
//! - [`BinnerLaunch::Direct`] skips the executable: the peer writes bin
//!   records straight into a socket pair. Used with the simulated tagger.
//!
//! # Shutdown
//!
//! [`Binner::stop`] closes our copy of the input end, sends `SIGTERM` to the
//! child, joins the listener and reaps the child. The listener exits on the
//! short read that follows. `stop` is idempotent and runs on drop.

pub mod reader;
pub mod record;

pub use reader::RecordReader;
pub use record::{BinRecord, RecordLayout, PER_CHANNEL_RECORD_SIZE, TAGGED_RECORD_SIZE};

use crate::error::{CaptureError, Result, ResultExt};
use crate::types::{AtomicSeconds, AtomicWallTime, Bin};
use chrono::{DateTime, Utc};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::io::Read;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Receives decoded bins from a listener thread
pub trait BinHandler: Send + Sync + 'static {
    /// Called once per decoded bin, in stream order
    fn handle_bin(&self, bin: &Bin);

    /// Called before every read result is processed, including the final
    /// short read
    fn on_read_attempt(&self) {}
}

/// How to start the binning agent
#[derive(Debug, Clone, PartialEq)]
pub enum BinnerLaunch {
    /// Spawn an executable that reads events on stdin and writes records on stdout
    Process { program: PathBuf, args: Vec<String> },
    /// Records are written directly into the data descriptor
    Direct,
}

/// Counters kept by every binner, readable from any thread
#[derive(Debug, Default)]
pub struct BinnerStats {
    walltime: AtomicWallTime,
    latest_timestamp: AtomicSeconds,
    loss_count: AtomicU64,
    bins: AtomicU64,
}

impl BinnerStats {
    fn record(&self, bin: &Bin) {
        self.bins.fetch_add(1, Ordering::Relaxed);
        self.loss_count
            .fetch_add(u64::from(bin.lost), Ordering::Relaxed);
        self.latest_timestamp.store(bin.time);
    }

    /// Wall-clock time of the most recent read attempt
    pub fn last_bin_walltime(&self) -> Option<DateTime<Utc>> {
        self.walltime.get()
    }

    /// Start time of the most recent bin, in seconds
    pub fn latest_timestamp(&self) -> f64 {
        self.latest_timestamp.load()
    }

    pub fn loss_count(&self) -> u64 {
        self.loss_count.load(Ordering::Relaxed)
    }

    /// Number of bins decoded
    pub fn bins_received(&self) -> u64 {
        self.bins.load(Ordering::Relaxed)
    }
}

/// A running binning agent and its listener thread
pub struct Binner {
    label: String,
    stats: Arc<BinnerStats>,
    sink: Option<OwnedFd>,
    child: Option<Child>,
    listener: Option<JoinHandle<()>>,
}

impl Binner {
    /// Start a binner and its listener.
    ///
    /// `label` names the listener thread and appears in logs.
    pub fn spawn<H: BinHandler>(
        label: &str,
        launch: &BinnerLaunch,
        layout: RecordLayout,
        clockrate: u64,
        handler: Arc<H>,
    ) -> Result<Self> {
        if clockrate == 0 {
            return Err(CaptureError::Binner("clock rate must be non-zero".into()));
        }

        let (sink, source, child): (OwnedFd, Box<dyn Read + Send>, Option<Child>) = match launch
        {
            BinnerLaunch::Process { program, args } => {
                let mut child = Command::new(program)
                    .args(args)
                    .stdin(Stdio::piped())
                    .stdout(Stdio::piped())
                    .spawn()
                    .with_context(|| format!("Failed to spawn binner {}", program.display()))?;
                let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
                    return Err(CaptureError::Binner("binner pipes unavailable".into()));
                };
                tracing::debug!(
                    "Spawned binner {} {:?} (pid {})",
                    program.display(),
                    args,
                    child.id()
                );
                (OwnedFd::from(stdin), Box::new(stdout), Some(child))
            }
            BinnerLaunch::Direct => {
                let (reader, writer) =
                    UnixStream::pair().context("Failed to create binner socket pair")?;
                (OwnedFd::from(writer), Box::new(reader), None)
            }
        };

        let stats = Arc::new(BinnerStats::default());
        let worker_stats = Arc::clone(&stats);
        let thread_label = label.to_string();
        let listener = std::thread::Builder::new()
            .name(format!("binner-{}", label))
            .spawn(move || {
                let reader = RecordReader::new(source, layout);
                listen(&thread_label, reader, clockrate, &*handler, &worker_stats);
            })
            .context("Failed to spawn binner listener")?;

        tracing::info!("Binner {} started", label);
        Ok(Self {
            label: label.to_string(),
            stats,
            sink: Some(sink),
            child,
            listener: Some(listener),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Input end to register with the acquisition peer
    pub fn data_fd(&self) -> Option<BorrowedFd<'_>> {
        self.sink.as_ref().map(|fd| fd.as_fd())
    }

    pub fn stats(&self) -> &Arc<BinnerStats> {
        &self.stats
    }

    /// Whether the listener thread is still reading
    pub fn is_listening(&self) -> bool {
        self.listener.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the agent and wait for the listener to finish
    pub fn stop(&mut self) {
        if self.listener.is_none() && self.child.is_none() {
            return;
        }
        self.sink = None;

        if let Some(child) = &self.child {
            if let Ok(pid) = i32::try_from(child.id()) {
                if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
                    tracing::debug!("Binner {}: SIGTERM failed: {}", self.label, e);
                }
            }
        }

        if let Some(handle) = self.listener.take() {
            if handle.join().is_err() {
                tracing::error!("Binner {} listener panicked", self.label);
            }
        }

        if let Some(mut child) = self.child.take() {
            match child.wait() {
                Ok(status) => tracing::debug!("Binner {} exited: {}", self.label, status),
                Err(e) => tracing::warn!("Binner {}: wait failed: {}", self.label, e),
            }
        }
        tracing::info!("Binner {} stopped", self.label);
    }
}

impl Drop for Binner {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Binner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Binner")
            .field("label", &self.label)
            .field("pid", &self.child.as_ref().map(|c| c.id()))
            .field("listening", &self.is_listening())
            .finish()
    }
}

fn listen<R: Read, H: BinHandler + ?Sized>(
    label: &str,
    mut reader: RecordReader<R>,
    clockrate: u64,
    handler: &H,
    stats: &BinnerStats,
) {
    loop {
        let result = reader.next_record();
        stats.walltime.touch();
        handler.on_read_attempt();
        match result {
            Ok(Some(record)) => {
                let bin = record.to_bin(clockrate);
                stats.record(&bin);
                handler.handle_bin(&bin);
            }
            Ok(None) => {
                tracing::debug!("Binner {}: end of stream", label);
                break;
            }
            Err(e) => {
                tracing::warn!("Binner {}: read failed: {}", label, e);
                break;
            }
        }
    }
}
