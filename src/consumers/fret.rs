//! FRET efficiency histogram
//!
//! Pairs the newest donor bin with the newest acceptor bin. A pair counts
//! only when both bins start at the same tick and together hold at least
//! `threshold` photons; it then adds `acceptor / (acceptor + donor)` to the
//! efficiency histogram.

use super::BinnerConsumer;
use crate::binner::BinHandler;
use crate::config::FretSettings;
use crate::error::Result;
use crate::histogram::FractionHistogram;
use crate::types::Bin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug)]
struct FretInner {
    settings: FretSettings,
    /// (start ticks, count) of the newest donor bin
    donor: Option<(u64, u32)>,
    acceptor: Option<(u64, u32)>,
    hist: FractionHistogram,
    pairs: u64,
}

#[derive(Debug)]
pub struct FretState {
    inner: Mutex<FretInner>,
}

impl FretState {
    pub fn new(settings: &FretSettings) -> Self {
        Self {
            inner: Mutex::new(FretInner {
                settings: settings.clone(),
                donor: None,
                acceptor: None,
                hist: FractionHistogram::new(settings.width),
                pairs: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FretInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `(bucket start, occurrences)` in ascending order
    pub fn histogram(&self) -> Vec<(f64, u64)> {
        self.lock().hist.buckets()
    }

    /// Coincident pairs accepted so far
    pub fn pair_count(&self) -> u64 {
        self.lock().pairs
    }

    pub fn width(&self) -> f64 {
        self.lock().hist.width()
    }

    /// Change the bucket width, clearing the histogram
    pub fn set_width(&self, width: f64) {
        let mut inner = self.lock();
        inner.settings.width = width;
        inner.hist.set_width(width);
        inner.pairs = 0;
    }

    /// Start over with new settings
    pub fn reset(&self, settings: &FretSettings) {
        let mut inner = self.lock();
        inner.settings = settings.clone();
        inner.donor = None;
        inner.acceptor = None;
        inner.hist = FractionHistogram::new(settings.width);
        inner.pairs = 0;
    }

    /// Forget the pending donor and acceptor bins
    pub fn reset_pending(&self) {
        let mut inner = self.lock();
        inner.donor = None;
        inner.acceptor = None;
    }
}

impl BinHandler for FretState {
    fn handle_bin(&self, bin: &Bin) {
        let mut inner = self.lock();
        let entry = Some((bin.start_ticks, bin.count));
        if bin.channel == inner.settings.donor_channel {
            inner.donor = entry;
        } else if bin.channel == inner.settings.acceptor_channel {
            inner.acceptor = entry;
        } else {
            return;
        }

        let (Some((d_time, d_count)), Some((a_time, a_count))) = (inner.donor, inner.acceptor)
        else {
            return;
        };
        if d_time != a_time {
            return;
        }
        let total = u64::from(a_count) + u64::from(d_count);
        if total < u64::from(inner.settings.threshold) || total == 0 {
            return;
        }

        let efficiency = f64::from(a_count) / total as f64;
        inner.hist.add(efficiency);
        inner.pairs += 1;
    }
}

/// Accumulates a FRET efficiency histogram across attachments
pub struct FretHistBinner {
    settings: Mutex<FretSettings>,
    state: Arc<FretState>,
}

impl FretHistBinner {
    pub fn new(settings: &FretSettings) -> Self {
        Self {
            settings: Mutex::new(settings.clone()),
            state: Arc::new(FretState::new(settings)),
        }
    }

    pub fn state(&self) -> &Arc<FretState> {
        &self.state
    }

    pub fn settings(&self) -> FretSettings {
        self.settings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the settings. Channel, threshold and bin time changes take
    /// effect on the next restart, which also clears the histogram.
    pub fn set_settings(&self, settings: FretSettings) {
        *self.settings.lock().unwrap_or_else(PoisonError::into_inner) = settings;
    }

    pub fn set_width(&self, width: f64) {
        self.settings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .width = width;
        self.state.set_width(width);
    }

    pub fn histogram(&self) -> Vec<(f64, u64)> {
        self.state.histogram()
    }
}

impl BinnerConsumer for FretHistBinner {
    type Handler = FretState;

    fn name(&self) -> &str {
        "fret"
    }

    fn bin_time(&self) -> f64 {
        self.settings().bin_time
    }

    fn create_handler(&self) -> Result<Arc<FretState>> {
        let settings = self.settings();
        let current = self.state.lock().settings.clone();
        if current != settings {
            tracing::debug!("FRET settings changed, clearing histogram");
            self.state.reset(&settings);
        } else {
            self.state.reset_pending();
        }
        Ok(Arc::clone(&self.state))
    }
}
