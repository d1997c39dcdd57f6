//! Per-channel count histograms

use super::BinnerConsumer;
use crate::binner::BinHandler;
use crate::config::HistogramSettings;
use crate::error::Result;
use crate::histogram::Histogram;
use crate::types::{Bin, ChannelId};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug)]
struct HistInner {
    width: u32,
    channels: BTreeMap<ChannelId, Histogram>,
}

/// Histograms of every channel, sharing one width.
///
/// One lock covers all channels, so a width change clears them together.
#[derive(Debug)]
pub struct HistState {
    inner: Mutex<HistInner>,
}

impl HistState {
    pub fn new(width: u32) -> Self {
        Self {
            inner: Mutex::new(HistInner {
                width: width.max(1),
                channels: BTreeMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HistInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn width(&self) -> u32 {
        self.lock().width
    }

    /// Change the bucket width and clear every channel
    pub fn set_width(&self, width: u32) {
        let mut inner = self.lock();
        inner.width = width.max(1);
        inner.channels.clear();
    }

    /// Bucket maps of every channel seen, ordered by channel id
    pub fn histograms(&self) -> Vec<(ChannelId, BTreeMap<u32, u64>)> {
        self.lock()
            .channels
            .iter()
            .map(|(&id, h)| (id, h.buckets().clone()))
            .collect()
    }

    pub fn histogram(&self, channel: ChannelId) -> Option<BTreeMap<u32, u64>> {
        self.lock()
            .channels
            .get(&channel)
            .map(|h| h.buckets().clone())
    }
}

impl BinHandler for HistState {
    fn handle_bin(&self, bin: &Bin) {
        let mut inner = self.lock();
        let width = inner.width;
        inner
            .channels
            .entry(bin.channel)
            .or_insert_with(|| Histogram::new(width))
            .add(bin.count);
    }
}

/// Accumulates count histograms across attachments
pub struct HistBinner {
    bin_time: Mutex<f64>,
    state: Arc<HistState>,
}

impl HistBinner {
    pub fn new(settings: &HistogramSettings) -> Self {
        Self {
            bin_time: Mutex::new(settings.bin_time),
            state: Arc::new(HistState::new(settings.width)),
        }
    }

    pub fn state(&self) -> &Arc<HistState> {
        &self.state
    }

    pub fn set_width(&self, width: u32) {
        self.state.set_width(width);
    }

    /// Takes effect on the next restart
    pub fn set_bin_time(&self, bin_time: f64) {
        *self.bin_time.lock().unwrap_or_else(PoisonError::into_inner) = bin_time;
    }

    pub fn histograms(&self) -> Vec<(ChannelId, BTreeMap<u32, u64>)> {
        self.state.histograms()
    }
}

impl BinnerConsumer for HistBinner {
    type Handler = HistState;

    fn name(&self) -> &str {
        "hist"
    }

    fn bin_time(&self) -> f64 {
        *self.bin_time.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn create_handler(&self) -> Result<Arc<HistState>> {
        Ok(Arc::clone(&self.state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binner::BinRecord;

    fn feed(state: &HistState, channel: ChannelId, counts: &[u32]) {
        for (i, &c) in counts.iter().enumerate() {
            state.handle_bin(&BinRecord::new(channel, i as u64, c, 0).to_bin(1000));
        }
    }

    #[test]
    fn test_width_ten_buckets() {
        let state = HistState::new(10);
        feed(&state, 0, &[5, 12, 9, 21]);
        let expected: BTreeMap<u32, u64> = [(0, 2), (10, 1), (20, 1)].into_iter().collect();
        assert_eq!(state.histogram(0), Some(expected));
        assert_eq!(state.histogram(1), None);
    }

    #[test]
    fn test_set_width_resets_all_channels() {
        let binner = HistBinner::new(&HistogramSettings::default());
        feed(binner.state(), 0, &[1, 2]);
        feed(binner.state(), 3, &[30]);
        assert_eq!(binner.histograms().len(), 2);
        binner.set_width(5);
        assert!(binner.histograms().is_empty());
        assert_eq!(binner.state().width(), 5);
        feed(binner.state(), 0, &[7]);
        assert_eq!(binner.state().histogram(0).unwrap().get(&5), Some(&1));
    }

    #[test]
    fn test_accumulates_across_attachments() {
        let binner = HistBinner::new(&HistogramSettings::default());
        let first = binner.create_handler().unwrap();
        feed(&first, 0, &[1]);
        let second = binner.create_handler().unwrap();
        feed(&second, 0, &[2]);
        assert_eq!(binner.state().histogram(0).unwrap().get(&0), Some(&2));
    }
}
