//! Core data types for the capture pipeline
//!
//! This module contains the plain values that flow between the binner
//! workers, the channel store and the consumers polling them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Logical detector channel, as reported in the bin stream.
///
/// Channel ids are small but not necessarily contiguous.
pub type ChannelId = i32;

/// One bin: its start time in seconds and the photons counted in it.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Sample {
    /// Bin start time in seconds
    pub time: f64,
    /// Photon count in the bin
    pub count: u32,
}

impl Sample {
    /// Create a new sample
    pub fn new(time: f64, count: u32) -> Self {
        Self { time, count }
    }
}

/// A decoded bin, as handed to bin handlers by a binner worker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bin {
    /// Channel the bin belongs to
    pub channel: ChannelId,
    /// Bin start time in hardware clock ticks
    pub start_ticks: u64,
    /// Bin start time in seconds (`start_ticks / clockrate`)
    pub time: f64,
    /// Photon count in the bin
    pub count: u32,
    /// Lost-record events flagged in the bin
    pub lost: u32,
}

impl Bin {
    /// The `(time, count)` pair stored in ring buffers
    pub fn sample(&self) -> Sample {
        Sample::new(self.time, self.count)
    }
}

/// Convert hardware clock ticks to seconds
pub fn ticks_to_seconds(ticks: u64, clockrate: u64) -> f64 {
    ticks as f64 / clockrate as f64
}

/// Snapshot of one channel's buffered bins, oldest first.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ChannelBins {
    pub channel: ChannelId,
    pub times: Vec<f64>,
    pub counts: Vec<u32>,
}

/// Snapshot of one channel's running counters.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct ChannelStats {
    pub channel: ChannelId,
    pub photon_count: u64,
    pub loss_count: u64,
    /// Start time (seconds) of the most recent bin seen on this channel
    pub latest_timestamp: f64,
}

/// Wall-clock instant shared between a writer thread and readers
#[derive(Debug, Default)]
pub struct AtomicWallTime(AtomicI64);

impl AtomicWallTime {
    /// Record the current time
    pub fn touch(&self) {
        self.0.store(Utc::now().timestamp_micros(), Ordering::Release);
    }

    /// Last recorded time, or `None` if never touched
    pub fn get(&self) -> Option<DateTime<Utc>> {
        match self.0.load(Ordering::Acquire) {
            0 => None,
            us => DateTime::from_timestamp_micros(us),
        }
    }
}

/// A time in seconds shared between a writer thread and readers
#[derive(Debug, Default)]
pub struct AtomicSeconds(AtomicU64);

impl AtomicSeconds {
    pub fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, seconds: f64) {
        self.0.store(seconds.to_bits(), Ordering::Release);
    }

    /// Raise the stored value to `seconds` if larger.
    ///
    /// Bin times are never negative, and non-negative `f64` bit patterns
    /// order the same way as the values.
    pub fn fetch_max(&self, seconds: f64) {
        self.0.fetch_max(seconds.max(0.0).to_bits(), Ordering::AcqRel);
    }
}
