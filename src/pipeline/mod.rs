//! Capture pipeline
//!
//! [`CapturePipeline`] ties a control session to the acquisition peer, the
//! pipeline's own capture binner and the set of named outputs the peer is
//! writing to.
//!
//! # Architecture
//!
//! ```text
//! [acquisition peer] ──"capture"──► [Binner] ──► [ChannelStore] ◄── bins()/stats()
//!        │  ▲        ├──"recording"──► file
//!        │  │        └──"<consumer id>"──► consumer binners
//!        ▼  │
//!    [ControlLink]
//! ```
//!
//! # Threads
//!
//! The capture binner's listener is the only writer to the channel store.
//! Control commands run on the caller's thread and block until the peer
//! replies. State changes are published on the [`EventBus`]; consumers
//! subscribe with [`CapturePipeline::subscribe`].
//!
//! # Failure
//!
//! A fatal error on the control link (see [`CaptureError::is_fatal`]) ends
//! the session: outputs are forgotten, the binner and peer are stopped and
//! [`PipelineEvent::Failed`] is published. Channel data stays readable.

pub mod channel;
pub mod events;

pub use channel::{Channel, ChannelStore};
pub use events::{EventBus, PipelineEvent};

use crate::binner::{Binner, BinnerLaunch, RecordLayout};
use crate::config::{CaptureConfig, ControlBackend, MAX_BUFFER_POINTS};
use crate::control::ControlLink;
use crate::error::{CaptureError, Result, ResultExt};
use crate::types::{ChannelBins, ChannelId, ChannelStats};
use chrono::{DateTime, Utc};
use crossbeam_channel::Receiver;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::collections::{BTreeMap, HashMap};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::path::Path;
use std::process::{Child, Command};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Output id of the pipeline's own binner
pub const CAPTURE_OUTPUT: &str = "capture";

/// Output id of the raw recording file
pub const RECORDING_OUTPUT: &str = "recording";

/// What a managed consumer needs from the pipeline
pub trait OutputRegistry: Send + Sync {
    /// Register `fd` with the peer under `id`
    fn add_output(&self, id: &str, fd: BorrowedFd<'_>) -> Result<()>;

    fn remove_output(&self, id: &str) -> Result<()>;

    fn is_capture_running(&self) -> bool;

    /// Peer clock rate, if a session is up
    fn clockrate(&self) -> Option<u64>;

    /// How to launch a binner with the given bin time
    fn binner_launch(&self, bin_time: f64) -> Option<BinnerLaunch>;

    fn record_layout(&self) -> RecordLayout;

    fn subscribe(&self) -> Receiver<PipelineEvent>;
}

struct Session {
    link: ControlLink,
    binner: Binner,
    peer: Option<Child>,
}

pub struct CapturePipeline {
    config: CaptureConfig,
    channels: Arc<ChannelStore>,
    // lock order: outputs, then session
    outputs: Mutex<HashMap<String, OwnedFd>>,
    session: Mutex<Option<Session>>,
    events: EventBus,
}

impl CapturePipeline {
    /// Create a stopped pipeline
    pub fn new(config: CaptureConfig) -> Result<Self> {
        config.validate()?;
        let channels = Arc::new(ChannelStore::new(config.buffer.points)?);
        Ok(Self {
            config,
            channels,
            outputs: Mutex::new(HashMap::new()),
            session: Mutex::new(None),
            events: EventBus::new(),
        })
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    fn lock_session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_outputs(&self) -> MutexGuard<'_, HashMap<String, OwnedFd>> {
        self.outputs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` against the link. A fatal error takes the session out and
    /// hands it back for teardown; the caller must then call [`Self::fail`]
    /// once it holds no locks.
    fn exchange<T>(
        &self,
        f: impl FnOnce(&mut ControlLink) -> Result<T>,
    ) -> (Result<T>, Option<Session>) {
        let mut guard = self.lock_session();
        let Some(session) = guard.as_mut() else {
            return (Err(CaptureError::NotConnected), None);
        };
        let result = f(&mut session.link);
        let failed = match &result {
            Err(e) if e.is_fatal() => guard.take(),
            _ => None,
        };
        (result, failed)
    }

    fn run<T>(&self, f: impl FnOnce(&mut ControlLink) -> Result<T>) -> Result<T> {
        let (result, failed) = self.exchange(f);
        if let (Some(session), Err(e)) = (failed, &result) {
            self.fail(Some(session), e);
        }
        result
    }

    fn fail(&self, session: Option<Session>, reason: &CaptureError) {
        tracing::error!("Acquisition session failed: {}", reason);
        self.lock_outputs().clear();
        if let Some(session) = session {
            teardown(session, false);
        }
        self.events.publish(PipelineEvent::Failed(reason.to_string()));
    }

    /// Connect to the peer and start the capture binner.
    ///
    /// Spawns the configured acquisition program first, if any. Capture
    /// itself is not started; see [`start_capture`](Self::start_capture).
    pub fn start(&self) -> Result<()> {
        if self.lock_session().is_some() {
            tracing::warn!("Pipeline already started");
            return Ok(());
        }

        let mut peer = self.spawn_peer()?;
        let link = match ControlLink::connect(&self.config) {
            Ok(link) => link,
            Err(e) => {
                if let Some(child) = peer.take() {
                    stop_peer(child);
                }
                return Err(e);
            }
        };

        let clockrate = link.clockrate();
        let launch = self.launch_for(self.config.binner.bin_time, clockrate);
        let binner = match Binner::spawn(
            CAPTURE_OUTPUT,
            &launch,
            self.config.binner.layout,
            clockrate,
            Arc::clone(&self.channels),
        ) {
            Ok(binner) => binner,
            Err(e) => {
                if let Some(child) = peer.take() {
                    stop_peer(child);
                }
                return Err(e);
            }
        };
        let data_fd = binner
            .data_fd()
            .map(|fd| fd.try_clone_to_owned())
            .transpose()?
            .ok_or_else(|| CaptureError::Binner("capture binner has no input".into()))?;

        {
            let mut guard = self.lock_session();
            if guard.is_some() {
                tracing::warn!("Pipeline started concurrently, discarding duplicate session");
                drop(guard);
                teardown(Session { link, binner, peer }, true);
                return Ok(());
            }
            *guard = Some(Session { link, binner, peer });
        }

        if let Err(e) = self.initialize_session(&data_fd) {
            let session = self.lock_session().take();
            if session.is_some() {
                self.fail(session, &e);
            }
            return Err(e.with_context("Failed to initialize acquisition session"));
        }

        tracing::info!(
            "Pipeline started ({} backend, {} Hz)",
            self.config.control.backend,
            clockrate
        );
        self.events.publish(PipelineEvent::Started);
        Ok(())
    }

    fn initialize_session(&self, data_fd: &OwnedFd) -> Result<()> {
        self.add_output(CAPTURE_OUTPUT, data_fd)?;
        self.reset_counter()?;
        if let Some(window) = self.config.buffer.send_window {
            self.set_send_window(window)?;
        }
        Ok(())
    }

    fn spawn_peer(&self) -> Result<Option<Child>> {
        let control = &self.config.control;
        let Some(program) = &control.peer_program else {
            return Ok(None);
        };
        if control.backend == ControlBackend::Simulated {
            return Ok(None);
        }
        let child = Command::new(program)
            .arg(&control.socket_path)
            .spawn()
            .with_context(|| format!("Failed to spawn {}", program.display()))?;
        tracing::info!("Started acquisition peer {} (pid {})", program.display(), child.id());
        Ok(Some(child))
    }

    fn launch_for(&self, bin_time: f64, clockrate: u64) -> BinnerLaunch {
        match self.config.control.backend {
            ControlBackend::Simulated => BinnerLaunch::Direct,
            _ => self.config.binner.launch(bin_time, clockrate),
        }
    }

    /// Tear down the session: unregister outputs, stop the binner and the
    /// peer. Channel data stays readable.
    pub fn stop(&self) -> Result<()> {
        let (outputs, session) = {
            let mut outputs = self.lock_outputs();
            let session = self.lock_session().take();
            (std::mem::take(&mut *outputs), session)
        };
        let Some(mut session) = session else {
            tracing::warn!("Pipeline not running");
            return Ok(());
        };

        for id in outputs.keys() {
            if let Err(e) = session.link.remove_output(id) {
                tracing::warn!("Failed to remove output {}: {}", id, e);
            }
        }
        drop(outputs);
        teardown(session, true);

        tracing::info!("Pipeline stopped");
        self.events.publish(PipelineEvent::Stopped);
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.lock_session().is_some()
    }

    pub fn start_capture(&self) -> Result<()> {
        self.run(|link| link.start_capture())?;
        self.events.publish(PipelineEvent::CaptureStarted);
        Ok(())
    }

    pub fn stop_capture(&self) -> Result<()> {
        self.run(|link| link.stop_capture())?;
        self.events.publish(PipelineEvent::CaptureStopped);
        Ok(())
    }

    pub fn is_capture_running(&self) -> bool {
        self.lock_session()
            .as_ref()
            .is_some_and(|s| s.link.is_capture_running())
    }

    /// Zero the peer's timestamp counter
    pub fn reset_counter(&self) -> Result<()> {
        self.run(|link| link.reset_counter())?;
        self.channels.reset_latest_timestamp();
        Ok(())
    }

    pub fn flush_fifo(&self) -> Result<()> {
        self.run(|link| link.flush_fifo())
    }

    pub fn set_send_window(&self, window: u32) -> Result<()> {
        self.run(|link| link.set_send_window(window))
    }

    /// Register `sink` with the peer as output `id`.
    ///
    /// The pipeline keeps its own duplicate of the descriptor until the
    /// output is removed. Registering a live id again is ignored.
    pub fn add_output(&self, id: &str, sink: impl AsFd) -> Result<()> {
        let fd = sink
            .as_fd()
            .try_clone_to_owned()
            .with_context(|| format!("Failed to duplicate descriptor for output {}", id))?;
        let (result, failed) = {
            let mut outputs = self.lock_outputs();
            if outputs.contains_key(id) {
                tracing::warn!("Output {} already registered, ignoring", id);
                return Ok(());
            }
            let (result, failed) = self.exchange(|link| link.add_output(id, &fd));
            if result.is_ok() {
                tracing::debug!("Output {} added", id);
                outputs.insert(id.to_string(), fd);
            }
            (result, failed)
        };
        if let (Some(session), Err(e)) = (failed, &result) {
            self.fail(Some(session), e);
        }
        result
    }

    /// Unregister output `id`. Unknown ids are ignored.
    pub fn remove_output(&self, id: &str) -> Result<()> {
        let (result, failed) = {
            let mut outputs = self.lock_outputs();
            if !outputs.contains_key(id) {
                tracing::warn!("Output {} not registered, ignoring", id);
                return Ok(());
            }
            let (result, failed) = self.exchange(|link| link.remove_output(id));
            outputs.remove(id);
            tracing::debug!("Output {} removed", id);
            (result, failed)
        };
        if let (Some(session), Err(e)) = (failed, &result) {
            self.fail(Some(session), e);
        }
        result
    }

    /// Ids of the registered outputs
    pub fn output_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock_outputs().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Copy the peer's raw output to `path`
    pub fn start_recording(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let file = std::fs::File::create(path)
            .with_context(|| format!("Failed to create recording {}", path.display()))?;
        self.add_output(RECORDING_OUTPUT, &file)?;
        tracing::info!("Recording to {}", path.display());
        Ok(())
    }

    pub fn stop_recording(&self) -> Result<()> {
        self.remove_output(RECORDING_OUTPUT)
    }

    /// Discard buffered bins and keep `points` bins per channel from now on
    pub fn resize_buffer(&self, points: usize) -> Result<()> {
        if points > MAX_BUFFER_POINTS {
            return Err(CaptureError::Config(format!(
                "Buffer of {} points exceeds the limit of {}",
                points, MAX_BUFFER_POINTS
            )));
        }
        self.channels.resize(points)
    }

    /// Enable (`Some(width)`) or disable per-channel count histograms
    pub fn set_hist_width(&self, width: Option<u32>) {
        self.channels.set_hist_width(width);
    }

    /// Buffered bins for every channel, ordered by channel id
    pub fn bins(&self) -> Vec<ChannelBins> {
        self.channels.bins()
    }

    /// Counters for every channel, ordered by channel id
    pub fn stats(&self) -> Vec<ChannelStats> {
        self.channels.stats()
    }

    pub fn histograms(&self) -> Vec<(ChannelId, BTreeMap<u32, u64>)> {
        self.channels.histograms()
    }

    pub fn channels(&self) -> &Arc<ChannelStore> {
        &self.channels
    }

    /// Peer clock rate in Hz, while a session is up
    pub fn clockrate(&self) -> Option<u64> {
        self.lock_session().as_ref().map(|s| s.link.clockrate())
    }

    /// Peer hardware version, while a session is up
    pub fn hw_version(&self) -> Option<String> {
        self.lock_session()
            .as_ref()
            .map(|s| s.link.version().to_string())
    }

    pub fn last_bin_walltime(&self) -> Option<DateTime<Utc>> {
        self.channels.last_bin_walltime()
    }

    /// Newest bin start time on any channel, in seconds
    pub fn latest_timestamp(&self) -> f64 {
        self.channels.latest_timestamp()
    }

    /// Estimate of the peer's current time, extrapolated from the newest bin
    pub fn time_cursor(&self) -> f64 {
        let latest = self.latest_timestamp();
        match self.last_bin_walltime() {
            Some(at) => {
                let elapsed = (Utc::now() - at).num_microseconds().unwrap_or(0).max(0);
                latest + elapsed as f64 * 1e-6
            }
            None => latest,
        }
    }

    /// Receive pipeline state changes
    pub fn subscribe(&self) -> Receiver<PipelineEvent> {
        self.events.subscribe()
    }
}

impl OutputRegistry for CapturePipeline {
    fn add_output(&self, id: &str, fd: BorrowedFd<'_>) -> Result<()> {
        CapturePipeline::add_output(self, id, fd)
    }

    fn remove_output(&self, id: &str) -> Result<()> {
        CapturePipeline::remove_output(self, id)
    }

    fn is_capture_running(&self) -> bool {
        CapturePipeline::is_capture_running(self)
    }

    fn clockrate(&self) -> Option<u64> {
        CapturePipeline::clockrate(self)
    }

    fn binner_launch(&self, bin_time: f64) -> Option<BinnerLaunch> {
        self.clockrate()
            .map(|clockrate| self.launch_for(bin_time, clockrate))
    }

    fn record_layout(&self) -> RecordLayout {
        self.config.binner.layout
    }

    fn subscribe(&self) -> Receiver<PipelineEvent> {
        CapturePipeline::subscribe(self)
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.outputs
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        let session = self
            .session
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(session) = session {
            teardown(session, true);
        }
    }
}

fn teardown(mut session: Session, graceful: bool) {
    if graceful {
        if session.link.is_capture_running() {
            if let Err(e) = session.link.stop_capture() {
                tracing::warn!("Failed to stop capture: {}", e);
            }
        }
        if session.peer.is_some() {
            if let Err(e) = session.link.quit() {
                tracing::debug!("Peer did not acknowledge quit: {}", e);
            }
        }
    }
    let Session { link, mut binner, peer } = session;
    drop(link);
    binner.stop();
    if let Some(child) = peer {
        stop_peer(child);
    }
}

fn stop_peer(mut child: Child) {
    if let Ok(None) = child.try_wait() {
        if let Ok(pid) = i32::try_from(child.id()) {
            if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
                tracing::debug!("SIGTERM to acquisition peer failed: {}", e);
            }
        }
    }
    match child.wait() {
        Ok(status) => tracing::info!("Acquisition peer exited: {}", status),
        Err(e) => tracing::warn!("Failed to reap acquisition peer: {}", e),
    }
}
