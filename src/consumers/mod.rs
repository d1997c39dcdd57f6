//! Managed binning consumers
//!
//! A consumer wants its own binner attached to the pipeline whenever capture
//! is running, and detached otherwise. [`ManagedBinner`] runs that state
//! machine for any [`BinnerConsumer`]:
//!
//! ```text
//!            capture started / start_binner()
//!  Detached ─────────────────────────────────► Attached
//!     ▲                                           │
//!     └───────────────────────────────────────────┘
//!            capture stopped / stop_binner()
//! ```
//!
//! Transitions are driven by pipeline events and by periodic polling of
//! [`OutputRegistry::is_capture_running`]. Both paths may race; whichever
//! gets there second finds the work done and does nothing beyond a warning.
//!
//! # Consumers
//!
//! | Kind | Type | Result |
//! |------|------|--------|
//! | Buffer | [`BufferConsumer`] | per-channel ring buffers |
//! | Histogram | [`HistBinner`] | per-channel count histograms |
//! | FRET | [`FretHistBinner`] | efficiency histogram of donor/acceptor pairs |
//! | Correlator | [`CorrelatorConsumer`] | cross/auto-correlation of two channels |

pub mod buffer;
pub mod correlator;
pub mod fret;
pub mod hist;

pub use buffer::BufferConsumer;
pub use correlator::CorrelatorConsumer;
pub use fret::{FretHistBinner, FretState};
pub use hist::{HistBinner, HistState};

use crate::binner::{BinHandler, Binner};
use crate::config::{ConsumerSettings, CorrelatorSettings, FretSettings, HistogramSettings};
use crate::error::{CaptureError, Result};
use crate::pipeline::{OutputRegistry, PipelineEvent};
use crossbeam_channel::{bounded, select, Sender};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

/// A kind of binning consumer
pub trait BinnerConsumer: Send + Sync + 'static {
    /// Receives this consumer's bins
    type Handler: BinHandler;

    /// Short name, used as the prefix of the output id
    fn name(&self) -> &str;

    /// Bin time the consumer's binner runs with, in seconds
    fn bin_time(&self) -> f64;

    /// Handler for a freshly attached binner
    fn create_handler(&self) -> Result<Arc<Self::Handler>>;

    fn on_started(&self, _handler: &Arc<Self::Handler>) {}

    fn on_stopped(&self, _handler: &Arc<Self::Handler>) {}
}

struct Attached<H> {
    binner: Binner,
    handler: Arc<H>,
}

struct Watcher {
    shutdown: Sender<()>,
    handle: JoinHandle<()>,
}

/// Keeps a consumer's binner attached while capture runs
pub struct ManagedBinner<C: BinnerConsumer> {
    id: String,
    registry: Arc<dyn OutputRegistry>,
    consumer: C,
    poll_period: Duration,
    attached: Mutex<Option<Attached<C::Handler>>>,
    watcher: Mutex<Option<Watcher>>,
}

impl<C: BinnerConsumer> ManagedBinner<C> {
    pub fn new(registry: Arc<dyn OutputRegistry>, consumer: C, poll_period: Duration) -> Self {
        let id = format!(
            "{}:{:x}",
            consumer.name(),
            NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed)
        );
        Self {
            id,
            registry,
            consumer,
            poll_period,
            attached: Mutex::new(None),
            watcher: Mutex::new(None),
        }
    }

    /// Output id this binner registers under
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn consumer(&self) -> &C {
        &self.consumer
    }

    fn lock(&self) -> MutexGuard<'_, Option<Attached<C::Handler>>> {
        self.attached.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self) -> bool {
        self.lock().is_some()
    }

    /// Handler of the attached binner
    pub fn handler(&self) -> Option<Arc<C::Handler>> {
        self.lock().as_ref().map(|a| Arc::clone(&a.handler))
    }

    /// Attach a fresh binner. Does nothing if one is attached.
    pub fn start_binner(&self) -> Result<()> {
        let mut attached = self.lock();
        if attached.is_some() {
            tracing::warn!("Binner {} already running", self.id);
            return Ok(());
        }

        let launch = self
            .registry
            .binner_launch(self.consumer.bin_time())
            .ok_or(CaptureError::NotConnected)?;
        let clockrate = self.registry.clockrate().ok_or(CaptureError::NotConnected)?;
        let handler = self.consumer.create_handler()?;
        let mut binner = Binner::spawn(
            &self.id,
            &launch,
            self.registry.record_layout(),
            clockrate,
            Arc::clone(&handler),
        )?;

        let registered = match binner.data_fd() {
            Some(fd) => self.registry.add_output(&self.id, fd),
            None => Err(CaptureError::Binner(format!("{} has no input", self.id))),
        };
        if let Err(e) = registered {
            binner.stop();
            return Err(e);
        }

        self.consumer.on_started(&handler);
        *attached = Some(Attached { binner, handler });
        tracing::info!("Managed binner {} attached", self.id);
        Ok(())
    }

    /// Detach the binner. Does nothing if none is attached.
    pub fn stop_binner(&self) -> Result<()> {
        let mut attached = self.lock();
        let Some(Attached {
            mut binner,
            handler,
        }) = attached.take()
        else {
            tracing::warn!("Binner {} not running", self.id);
            return Ok(());
        };

        let removed = self.registry.remove_output(&self.id);
        if let Err(e) = &removed {
            tracing::warn!("Failed to unregister {}: {}", self.id, e);
        }
        binner.stop();
        self.consumer.on_stopped(&handler);
        tracing::info!("Managed binner {} detached", self.id);
        removed
    }

    /// Detach, then re-attach with the consumer's current settings if
    /// capture is running
    pub fn restart(&self) -> Result<()> {
        if self.is_running() {
            self.stop_binner()?;
        }
        if self.registry.is_capture_running() {
            self.start_binner()?;
        }
        Ok(())
    }

    /// Bring the attachment in line with the pipeline's capture state
    pub fn sync(&self) {
        let want = self.registry.is_capture_running();
        let have = self.is_running();
        let result = match (want, have) {
            (true, false) => self.start_binner(),
            (false, true) => self.stop_binner(),
            _ => Ok(()),
        };
        if let Err(e) = result {
            tracing::warn!("Managed binner {}: {}", self.id, e);
        }
    }

    fn on_event(&self, event: &PipelineEvent) {
        tracing::debug!("Managed binner {} saw {:?}", self.id, event);
        self.sync();
    }

    /// Follow the pipeline's capture state on a background thread
    pub fn watch(self: &Arc<Self>) -> Result<()> {
        let mut watcher = self.watcher.lock().unwrap_or_else(PoisonError::into_inner);
        if watcher.is_some() {
            tracing::warn!("Binner {} already watched", self.id);
            return Ok(());
        }

        let events = self.registry.subscribe();
        let (shutdown, shutdown_rx) = bounded::<()>(0);
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.poll_period;
        let handle = std::thread::Builder::new()
            .name(format!("watch-{}", self.id))
            .spawn(move || {
                if let Some(managed) = weak.upgrade() {
                    managed.sync();
                }
                loop {
                    select! {
                        recv(shutdown_rx) -> _ => break,
                        recv(events) -> event => {
                            let (Ok(event), Some(managed)) = (event, weak.upgrade()) else {
                                break;
                            };
                            managed.on_event(&event);
                        }
                        default(period) => {
                            let Some(managed) = weak.upgrade() else { break };
                            managed.sync();
                        }
                    }
                }
            })?;
        *watcher = Some(Watcher { shutdown, handle });
        Ok(())
    }

    /// Stop the background watcher, if any
    pub fn unwatch(&self) {
        let watcher = self
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(Watcher { shutdown, handle }) = watcher else {
            return;
        };
        drop(shutdown);
        if handle.thread().id() == std::thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            tracing::error!("Watcher for {} panicked", self.id);
        }
    }
}

impl<C: BinnerConsumer> Drop for ManagedBinner<C> {
    fn drop(&mut self) {
        self.unwatch();
        if self.is_running() {
            if let Err(e) = self.stop_binner() {
                tracing::warn!("Failed to stop {} on drop: {}", self.id, e);
            }
        }
    }
}

/// Object-safe view of a [`ManagedBinner`]
pub trait Managed: Send + Sync {
    fn id(&self) -> &str;
    fn is_running(&self) -> bool;
    fn start_binner(&self) -> Result<()>;
    fn stop_binner(&self) -> Result<()>;
    fn restart(&self) -> Result<()>;
    fn sync(&self);
}

impl<C: BinnerConsumer> Managed for ManagedBinner<C> {
    fn id(&self) -> &str {
        ManagedBinner::id(self)
    }

    fn is_running(&self) -> bool {
        ManagedBinner::is_running(self)
    }

    fn start_binner(&self) -> Result<()> {
        ManagedBinner::start_binner(self)
    }

    fn stop_binner(&self) -> Result<()> {
        ManagedBinner::stop_binner(self)
    }

    fn restart(&self) -> Result<()> {
        ManagedBinner::restart(self)
    }

    fn sync(&self) {
        ManagedBinner::sync(self)
    }
}

/// Which consumer to build, with its settings
#[derive(Debug, Clone, PartialEq)]
pub enum ConsumerConfig {
    Buffer { bin_time: f64, points: usize },
    Histogram(HistogramSettings),
    Fret(FretSettings),
    Correlator(CorrelatorSettings),
}

impl ConsumerConfig {
    /// Every consumer kind with its configured settings
    pub fn all(settings: &ConsumerSettings, points: usize) -> Vec<ConsumerConfig> {
        vec![
            ConsumerConfig::Buffer {
                bin_time: settings.buffer_bin_time,
                points,
            },
            ConsumerConfig::Histogram(settings.histogram.clone()),
            ConsumerConfig::Fret(settings.fret.clone()),
            ConsumerConfig::Correlator(settings.correlator.clone()),
        ]
    }
}

/// A managed consumer of any kind
pub enum ManagedConsumer {
    Buffer(Arc<ManagedBinner<BufferConsumer>>),
    Histogram(Arc<ManagedBinner<HistBinner>>),
    Fret(Arc<ManagedBinner<FretHistBinner>>),
    Correlator(Arc<ManagedBinner<CorrelatorConsumer>>),
}

impl ManagedConsumer {
    /// Build a detached consumer
    pub fn build(
        registry: Arc<dyn OutputRegistry>,
        config: ConsumerConfig,
        poll_period: Duration,
    ) -> Result<Self> {
        let consumer = match config {
            ConsumerConfig::Buffer { bin_time, points } => ManagedConsumer::Buffer(Arc::new(
                ManagedBinner::new(registry, BufferConsumer::new(bin_time, points)?, poll_period),
            )),
            ConsumerConfig::Histogram(s) => ManagedConsumer::Histogram(Arc::new(
                ManagedBinner::new(registry, HistBinner::new(&s), poll_period),
            )),
            ConsumerConfig::Fret(s) => ManagedConsumer::Fret(Arc::new(ManagedBinner::new(
                registry,
                FretHistBinner::new(&s),
                poll_period,
            ))),
            ConsumerConfig::Correlator(s) => ManagedConsumer::Correlator(Arc::new(
                ManagedBinner::new(registry, CorrelatorConsumer::new(&s)?, poll_period),
            )),
        };
        Ok(consumer)
    }

    pub fn managed(&self) -> &dyn Managed {
        match self {
            ManagedConsumer::Buffer(m) => m.as_ref(),
            ManagedConsumer::Histogram(m) => m.as_ref(),
            ManagedConsumer::Fret(m) => m.as_ref(),
            ManagedConsumer::Correlator(m) => m.as_ref(),
        }
    }

    /// Start following the pipeline's capture state
    pub fn watch(&self) -> Result<()> {
        match self {
            ManagedConsumer::Buffer(m) => m.watch(),
            ManagedConsumer::Histogram(m) => m.watch(),
            ManagedConsumer::Fret(m) => m.watch(),
            ManagedConsumer::Correlator(m) => m.watch(),
        }
    }

    pub fn unwatch(&self) {
        match self {
            ManagedConsumer::Buffer(m) => m.unwatch(),
            ManagedConsumer::Histogram(m) => m.unwatch(),
            ManagedConsumer::Fret(m) => m.unwatch(),
            ManagedConsumer::Correlator(m) => m.unwatch(),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory registry standing in for a pipeline

    use super::*;
    use crate::binner::{BinnerLaunch, RecordLayout};
    use crate::pipeline::EventBus;
    use crossbeam_channel::Receiver;
    use std::collections::HashMap;
    use std::os::fd::{BorrowedFd, OwnedFd};
    use std::sync::atomic::AtomicBool;

    #[derive(Default)]
    pub struct FakeRegistry {
        pub running: AtomicBool,
        pub outputs: Mutex<HashMap<String, OwnedFd>>,
        pub adds: AtomicU64,
        pub removes: AtomicU64,
        /// Answer `remove_output` with a protocol error
        pub refuse_removes: AtomicBool,
        pub events: EventBus,
    }

    impl FakeRegistry {
        pub fn set_running(&self, running: bool) {
            self.running.store(running, Ordering::SeqCst);
            self.events.publish(if running {
                PipelineEvent::CaptureStarted
            } else {
                PipelineEvent::CaptureStopped
            });
        }

        /// Write tagged records into every registered output
        pub fn emit(&self, records: &[crate::binner::BinRecord]) {
            use std::io::Write;
            let bytes: Vec<u8> = records
                .iter()
                .flat_map(|r| RecordLayout::Tagged.encode(r))
                .collect();
            for fd in self.outputs.lock().unwrap().values() {
                let mut file = std::fs::File::from(fd.try_clone().unwrap());
                file.write_all(&bytes).unwrap();
            }
        }
    }

    impl OutputRegistry for FakeRegistry {
        fn add_output(&self, id: &str, fd: BorrowedFd<'_>) -> Result<()> {
            self.adds.fetch_add(1, Ordering::SeqCst);
            self.outputs
                .lock()
                .unwrap()
                .insert(id.to_string(), fd.try_clone_to_owned()?);
            Ok(())
        }

        fn remove_output(&self, id: &str) -> Result<()> {
            self.removes.fetch_add(1, Ordering::SeqCst);
            if self.refuse_removes.load(Ordering::SeqCst) {
                return Err(CaptureError::Protocol(format!("error: cannot remove {}", id)));
            }
            self.outputs.lock().unwrap().remove(id);
            Ok(())
        }

        fn is_capture_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }

        fn clockrate(&self) -> Option<u64> {
            Some(1_000)
        }

        fn binner_launch(&self, _bin_time: f64) -> Option<BinnerLaunch> {
            Some(BinnerLaunch::Direct)
        }

        fn record_layout(&self) -> RecordLayout {
            RecordLayout::Tagged
        }

        fn subscribe(&self) -> Receiver<PipelineEvent> {
            self.events.subscribe()
        }
    }
}
