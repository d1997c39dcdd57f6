//! Software stand-in for the acquisition hardware
//!
//! [`SimulatedTagger`] answers the control protocol in process. While
//! capture runs, a generator thread writes bin records with Poisson photon
//! counts into every registered output, paced by the wall clock. Records
//! use the configured [`RecordLayout`]; a per-channel layout only carries
//! its own channel.
//! Outputs therefore carry bin records, so binners attached to the
//! simulator use [`BinnerLaunch::Direct`](crate::binner::BinnerLaunch).

use super::ControlTransport;
use crate::binner::{BinRecord, RecordLayout};
use crate::config::{bin_length, SimulatorConfig};
use crate::error::{CaptureError, Result};
use crate::types::ChannelId;
use rand::Rng;
use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Generator wake-up period
const EMIT_PERIOD: Duration = Duration::from_millis(20);

/// Most bins emitted per wake-up, so a stalled generator does not burst
const MAX_BINS_PER_WAKE: u64 = 10_000;

struct SimState {
    outputs: Mutex<HashMap<String, File>>,
    running: AtomicBool,
    /// Index of the next bin to emit
    next_bin: AtomicU64,
    send_window: AtomicU64,
}

pub struct SimulatedTagger {
    clockrate: u64,
    hw_version: String,
    count_rates: Vec<f64>,
    bin_length: u64,
    layout: RecordLayout,
    state: Arc<SimState>,
    generator: Option<JoinHandle<()>>,
}

impl SimulatedTagger {
    /// Create a stand-in emitting bins of `bin_time` seconds encoded as `layout`
    pub fn new(config: &SimulatorConfig, bin_time: f64, layout: RecordLayout) -> Self {
        let clockrate = config.clockrate.max(1);
        Self {
            clockrate,
            hw_version: config.hw_version.clone(),
            count_rates: config.count_rates.clone(),
            bin_length: bin_length(bin_time, clockrate),
            layout,
            state: Arc::new(SimState {
                outputs: Mutex::new(HashMap::new()),
                running: AtomicBool::new(false),
                next_bin: AtomicU64::new(0),
                send_window: AtomicU64::new(0),
            }),
            generator: None,
        }
    }

    /// Number of registered outputs
    pub fn output_count(&self) -> usize {
        self.state
            .outputs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Last window set with `set_send_window`
    pub fn send_window(&self) -> u64 {
        self.state.send_window.load(Ordering::Relaxed)
    }

    fn start_generator(&mut self) -> Result<()> {
        if self.generator.is_some() {
            return Ok(());
        }
        self.state.running.store(true, Ordering::Release);
        let state = Arc::clone(&self.state);
        let rates: Vec<(ChannelId, f64)> = match self.layout {
            RecordLayout::Tagged => (0..)
                .zip(self.count_rates.iter().copied())
                .collect(),
            RecordLayout::PerChannel { channel } => {
                let rate = usize::try_from(channel)
                    .ok()
                    .and_then(|i| self.count_rates.get(i).copied())
                    .unwrap_or(0.0);
                vec![(channel, rate)]
            }
        };
        let layout = self.layout;
        let bin_length = self.bin_length;
        let bin_time = bin_length as f64 / self.clockrate as f64;
        let ticks_per_sec = self.clockrate as f64;
        let handle = std::thread::Builder::new()
            .name("simulated-tagger".into())
            .spawn(move || {
                generate(&state, layout, &rates, bin_length, bin_time, ticks_per_sec)
            })?;
        self.generator = Some(handle);
        Ok(())
    }

    fn stop_generator(&mut self) {
        self.state.running.store(false, Ordering::Release);
        if let Some(handle) = self.generator.take() {
            if handle.join().is_err() {
                tracing::error!("Simulated tagger generator panicked");
            }
        }
    }

    fn add_output(&mut self, id: &str, fd: &OwnedFd) -> Result<Option<String>> {
        let file = File::from(fd.try_clone()?);
        let mut outputs = self
            .state
            .outputs
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if outputs.contains_key(id) {
            return Err(CaptureError::protocol(format!("error: output {} exists", id)));
        }
        outputs.insert(id.to_string(), file);
        Ok(None)
    }
}

impl ControlTransport for SimulatedTagger {
    fn request(&mut self, command: &str) -> Result<Option<String>> {
        let (verb, arg) = match command.split_once(' ') {
            Some((verb, arg)) => (verb, Some(arg.trim())),
            None => (command, None),
        };
        match (verb, arg) {
            ("clockrate?", None) => Ok(Some(self.clockrate.to_string())),
            ("version?", None) => Ok(Some(self.hw_version.clone())),
            ("reset_counter", None) => {
                self.state.next_bin.store(0, Ordering::Release);
                Ok(None)
            }
            ("start_capture", None) => {
                self.start_generator()?;
                Ok(None)
            }
            ("stop_capture", None) | ("quit", None) => {
                self.stop_generator();
                Ok(None)
            }
            ("flush_fifo", None) => Ok(None),
            ("set_send_window", Some(n)) => {
                let window = n
                    .parse::<u64>()
                    .map_err(|_| CaptureError::protocol(format!("error: bad window {:?}", n)))?;
                self.state.send_window.store(window, Ordering::Relaxed);
                Ok(None)
            }
            ("remove_output", Some(id)) => {
                let removed = self
                    .state
                    .outputs
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(id);
                match removed {
                    Some(_) => Ok(None),
                    None => Err(CaptureError::protocol(format!("error: no output {}", id))),
                }
            }
            ("add_output", _) => Err(CaptureError::protocol("error: add_output needs a descriptor")),
            _ => Err(CaptureError::protocol("error: unknown command")),
        }
    }

    fn request_with_fd(&mut self, command: &str, fd: &OwnedFd) -> Result<Option<String>> {
        match command.split_once(' ') {
            Some(("add_output", id)) if !id.trim().is_empty() => self.add_output(id.trim(), fd),
            _ => Err(CaptureError::protocol("error: unexpected descriptor")),
        }
    }
}

impl Drop for SimulatedTagger {
    fn drop(&mut self) {
        self.stop_generator();
    }
}

fn generate(
    state: &SimState,
    layout: RecordLayout,
    rates: &[(ChannelId, f64)],
    bin_length: u64,
    bin_time: f64,
    ticks_per_sec: f64,
) {
    let mut rng = rand::thread_rng();
    let mut last = Instant::now();
    let mut pending_ticks = 0.0f64;
    let mut chunk = Vec::new();

    while state.running.load(Ordering::Acquire) {
        std::thread::sleep(EMIT_PERIOD);
        let now = Instant::now();
        pending_ticks += now.duration_since(last).as_secs_f64() * ticks_per_sec;
        last = now;

        let n_bins = ((pending_ticks / bin_length as f64) as u64).min(MAX_BINS_PER_WAKE);
        pending_ticks -= (n_bins * bin_length) as f64;
        if n_bins == 0 {
            continue;
        }

        chunk.clear();
        let first = state.next_bin.fetch_add(n_bins, Ordering::AcqRel);
        for bin in first..first + n_bins {
            for &(channel, rate) in rates {
                let record = BinRecord::new(
                    channel,
                    bin * bin_length,
                    poisson(&mut rng, rate * bin_time),
                    0,
                );
                chunk.extend_from_slice(&layout.encode(&record));
            }
        }

        let mut outputs = state.outputs.lock().unwrap_or_else(PoisonError::into_inner);
        outputs.retain(|id, file| match file.write_all(&chunk) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Simulated tagger dropping output {}: {}", id, e);
                false
            }
        });
    }
}

/// Photon count over an interval with `mean` expected arrivals
fn poisson<R: Rng>(rng: &mut R, mean: f64) -> u32 {
    if mean.is_nan() || mean <= 0.0 {
        return 0;
    }
    let mut t = 0.0;
    let mut n = 0u32;
    loop {
        t -= (1.0 - rng.gen::<f64>()).ln();
        if t > mean {
            return n;
        }
        n += 1;
    }
}
