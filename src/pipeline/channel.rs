//! Per-channel buffers and counters
//!
//! A [`ChannelStore`] maps channel ids to [`Channel`]s, creating channels the
//! first time a bin arrives for them. It is shared between exactly one writer
//! (a binner listener) and any number of readers.
//!
//! # Locking
//!
//! - Each channel guards its ring buffers and histogram with its own mutex.
//!   Readers take the same mutex, so they never see a buffer mid-wrap.
//! - Counters live outside the mutex as atomics.
//! - The channel map sits behind an `RwLock`. The writer holds the read side
//!   for the duration of one bin; resizing and histogram width changes take
//!   the write side and so never interleave with a bin being stored.

use crate::binner::BinHandler;
use crate::error::{CaptureError, Result};
use crate::histogram::Histogram;
use crate::ring_buffer::RingBuffer;
use crate::types::{AtomicSeconds, AtomicWallTime, Bin, ChannelBins, ChannelId, ChannelStats};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug)]
struct ChannelBuffers {
    times: RingBuffer<f64>,
    counts: RingBuffer<u32>,
    histogram: Option<Histogram>,
}

/// One detector channel
#[derive(Debug)]
pub struct Channel {
    id: ChannelId,
    buffers: Mutex<ChannelBuffers>,
    photon_count: AtomicU64,
    loss_count: AtomicU64,
    latest_timestamp: AtomicSeconds,
}

impl Channel {
    fn new(id: ChannelId, capacity: usize, hist_width: Option<u32>) -> Result<Self> {
        Ok(Self {
            id,
            buffers: Mutex::new(ChannelBuffers {
                times: RingBuffer::new(capacity)?,
                counts: RingBuffer::new(capacity)?,
                histogram: hist_width.map(Histogram::new),
            }),
            photon_count: AtomicU64::new(0),
            loss_count: AtomicU64::new(0),
            latest_timestamp: AtomicSeconds::default(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ChannelBuffers> {
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, bin: &Bin) {
        {
            let mut buffers = self.lock();
            buffers.times.append(bin.time);
            buffers.counts.append(bin.count);
            if let Some(hist) = buffers.histogram.as_mut() {
                hist.add(bin.count);
            }
        }
        self.photon_count
            .fetch_add(u64::from(bin.count), Ordering::Relaxed);
        self.loss_count
            .fetch_add(u64::from(bin.lost), Ordering::Relaxed);
        self.latest_timestamp.store(bin.time);
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Buffered bins, oldest first
    pub fn bins(&self) -> ChannelBins {
        let buffers = self.lock();
        ChannelBins {
            channel: self.id,
            times: buffers.times.get(),
            counts: buffers.counts.get(),
        }
    }

    /// The newest `n` counts (or fewer), oldest first
    pub fn recent_counts(&self, n: usize) -> Vec<u32> {
        self.lock().counts.latest(n)
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            channel: self.id,
            photon_count: self.photon_count.load(Ordering::Relaxed),
            loss_count: self.loss_count.load(Ordering::Relaxed),
            latest_timestamp: self.latest_timestamp.load(),
        }
    }

    /// Histogram buckets, if histogramming is enabled
    pub fn histogram(&self) -> Option<BTreeMap<u32, u64>> {
        self.lock().histogram.as_ref().map(|h| h.buckets().clone())
    }

    fn set_hist_width(&self, width: Option<u32>) {
        self.lock().histogram = width.map(Histogram::new);
    }
}

#[derive(Debug)]
struct ChannelMap {
    capacity: usize,
    hist_width: Option<u32>,
    channels: BTreeMap<ChannelId, Arc<Channel>>,
}

impl ChannelMap {
    fn get_or_create(&mut self, id: ChannelId) -> Result<Arc<Channel>> {
        if let Some(channel) = self.channels.get(&id) {
            return Ok(Arc::clone(channel));
        }
        let channel = Arc::new(Channel::new(id, self.capacity, self.hist_width)?);
        tracing::debug!("New channel {} ({} points)", id, self.capacity);
        self.channels.insert(id, Arc::clone(&channel));
        Ok(channel)
    }
}

/// All channels seen by one binner, plus stream-wide timing
#[derive(Debug)]
pub struct ChannelStore {
    map: RwLock<ChannelMap>,
    latest_timestamp: AtomicSeconds,
    last_bin_walltime: AtomicWallTime,
}

impl ChannelStore {
    /// Create an empty store whose channels buffer `capacity` bins each
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(CaptureError::InvalidCapacity);
        }
        Ok(Self {
            map: RwLock::new(ChannelMap {
                capacity,
                hist_width: None,
                channels: BTreeMap::new(),
            }),
            latest_timestamp: AtomicSeconds::default(),
            last_bin_walltime: AtomicWallTime::default(),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, ChannelMap> {
        self.map.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, ChannelMap> {
        self.map.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store one bin, creating its channel if needed
    pub fn push(&self, bin: &Bin) {
        {
            let map = self.read();
            if let Some(channel) = map.channels.get(&bin.channel) {
                channel.push(bin);
                self.latest_timestamp.fetch_max(bin.time);
                return;
            }
        }
        let mut map = self.write();
        match map.get_or_create(bin.channel) {
            Ok(channel) => channel.push(bin),
            Err(e) => {
                tracing::error!("Dropping bin for channel {}: {}", bin.channel, e);
                return;
            }
        }
        self.latest_timestamp.fetch_max(bin.time);
    }

    /// Discard all channels and buffer `capacity` bins per channel from now on
    pub fn resize(&self, capacity: usize) -> Result<()> {
        if capacity == 0 {
            return Err(CaptureError::InvalidCapacity);
        }
        let mut map = self.write();
        tracing::debug!("Resizing channel buffers to {} points", capacity);
        map.capacity = capacity;
        map.channels = BTreeMap::new();
        Ok(())
    }

    /// Enable, disable or re-bin the per-channel histograms.
    ///
    /// Every channel's histogram is cleared in one step.
    pub fn set_hist_width(&self, width: Option<u32>) {
        let width = width.map(|w| w.max(1));
        let mut map = self.write();
        map.hist_width = width;
        for channel in map.channels.values() {
            channel.set_hist_width(width);
        }
    }

    pub fn hist_width(&self) -> Option<u32> {
        self.read().hist_width
    }

    /// Bins buffered per channel
    pub fn capacity(&self) -> usize {
        self.read().capacity
    }

    pub fn channel(&self, id: ChannelId) -> Option<Arc<Channel>> {
        self.read().channels.get(&id).cloned()
    }

    pub fn channel_ids(&self) -> Vec<ChannelId> {
        self.read().channels.keys().copied().collect()
    }

    /// Buffered bins for every channel, ordered by channel id
    pub fn bins(&self) -> Vec<ChannelBins> {
        self.read().channels.values().map(|c| c.bins()).collect()
    }

    /// Counters for every channel, ordered by channel id
    pub fn stats(&self) -> Vec<ChannelStats> {
        self.read().channels.values().map(|c| c.stats()).collect()
    }

    /// Histograms of every channel that has one
    pub fn histograms(&self) -> Vec<(ChannelId, BTreeMap<u32, u64>)> {
        self.read()
            .channels
            .values()
            .filter_map(|c| c.histogram().map(|h| (c.id(), h)))
            .collect()
    }

    /// Newest start time seen on any channel, in seconds
    pub fn latest_timestamp(&self) -> f64 {
        self.latest_timestamp.load()
    }

    /// Forget the newest start time, after the peer's clock was reset
    pub fn reset_latest_timestamp(&self) {
        self.latest_timestamp.store(0.0);
    }

    /// Wall-clock time of the most recent read attempt
    pub fn last_bin_walltime(&self) -> Option<DateTime<Utc>> {
        self.last_bin_walltime.get()
    }
}

impl BinHandler for ChannelStore {
    fn handle_bin(&self, bin: &Bin) {
        self.push(bin);
    }

    fn on_read_attempt(&self) {
        self.last_bin_walltime.touch();
    }
}
