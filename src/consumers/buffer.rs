//! Ring-buffered bins at a consumer's own bin time

use super::BinnerConsumer;
use crate::error::Result;
use crate::pipeline::ChannelStore;
use crate::types::{ChannelBins, ChannelId, ChannelStats};
use std::sync::{Arc, Mutex, PoisonError};

/// Keeps the newest `points` bins of every channel
pub struct BufferConsumer {
    bin_time: Mutex<f64>,
    store: Arc<ChannelStore>,
}

impl BufferConsumer {
    pub fn new(bin_time: f64, points: usize) -> Result<Self> {
        Ok(Self {
            bin_time: Mutex::new(bin_time),
            store: Arc::new(ChannelStore::new(points)?),
        })
    }

    /// Takes effect on the next restart
    pub fn set_bin_time(&self, bin_time: f64) {
        *self.bin_time.lock().unwrap_or_else(PoisonError::into_inner) = bin_time;
    }

    /// Discard buffered bins and keep `points` per channel
    pub fn resize_buffer(&self, points: usize) -> Result<()> {
        self.store.resize(points)
    }

    pub fn bins(&self) -> Vec<ChannelBins> {
        self.store.bins()
    }

    pub fn stats(&self) -> Vec<ChannelStats> {
        self.store.stats()
    }

    /// The newest `n` counts of `channel`, oldest first
    pub fn recent_counts(&self, channel: ChannelId, n: usize) -> Vec<u32> {
        self.store
            .channel(channel)
            .map(|c| c.recent_counts(n))
            .unwrap_or_default()
    }

    pub fn store(&self) -> &Arc<ChannelStore> {
        &self.store
    }
}

impl BinnerConsumer for BufferConsumer {
    type Handler = ChannelStore;

    fn name(&self) -> &str {
        "buffer"
    }

    fn bin_time(&self) -> f64 {
        *self.bin_time.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every attachment starts from empty buffers
    fn create_handler(&self) -> Result<Arc<ChannelStore>> {
        self.store.resize(self.store.capacity())?;
        Ok(Arc::clone(&self.store))
    }
}
