//! Cross- and auto-correlation of two channels
//!
//! Buffers enough bins to cover the plot width, then correlates the newest
//! `window` counts of the two selected channels on demand.

use super::BinnerConsumer;
use crate::analysis::{Correlation, Correlator};
use crate::config::CorrelatorSettings;
use crate::error::Result;
use crate::pipeline::ChannelStore;
use std::sync::{Arc, Mutex, PoisonError};

pub struct CorrelatorConsumer {
    settings: Mutex<CorrelatorSettings>,
    store: Arc<ChannelStore>,
    correlator: Mutex<Correlator>,
}

impl CorrelatorConsumer {
    pub fn new(settings: &CorrelatorSettings) -> Result<Self> {
        Ok(Self {
            settings: Mutex::new(settings.clone()),
            store: Arc::new(ChannelStore::new(buffer_points(settings))?),
            correlator: Mutex::new(Correlator::new()),
        })
    }

    pub fn settings(&self) -> CorrelatorSettings {
        self.settings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the settings; bin time and plot width take effect on the
    /// next restart
    pub fn set_settings(&self, settings: CorrelatorSettings) {
        *self.settings.lock().unwrap_or_else(PoisonError::into_inner) = settings;
    }

    /// Select the two channels; equal channels give the autocorrelation
    pub fn set_channels(&self, a: i32, b: i32) {
        let mut settings = self.settings.lock().unwrap_or_else(PoisonError::into_inner);
        settings.channel_a = a;
        settings.channel_b = b;
    }

    pub fn store(&self) -> &Arc<ChannelStore> {
        &self.store
    }

    /// Correlate the newest samples of the selected channels up to
    /// `max_lag` bins. `None` until both channels have non-zero counts.
    pub fn correlate(&self, max_lag: usize) -> Option<Correlation> {
        let settings = self.settings();
        let a = self
            .store
            .channel(settings.channel_a)?
            .recent_counts(settings.window);
        let b = if settings.is_autocorrelation() {
            a.clone()
        } else {
            self.store
                .channel(settings.channel_b)?
                .recent_counts(settings.window)
        };
        self.correlator
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .correlate_counts(&a, &b, max_lag, settings.bin_time)
    }
}

fn buffer_points(settings: &CorrelatorSettings) -> usize {
    settings.n_points().max(settings.window.max(1))
}

impl BinnerConsumer for CorrelatorConsumer {
    type Handler = ChannelStore;

    fn name(&self) -> &str {
        "correlator"
    }

    fn bin_time(&self) -> f64 {
        self.settings().bin_time
    }

    fn create_handler(&self) -> Result<Arc<ChannelStore>> {
        self.store.resize(buffer_points(&self.settings()))?;
        Ok(Arc::clone(&self.store))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binner::{BinHandler, BinRecord};

    fn settings() -> CorrelatorSettings {
        CorrelatorSettings {
            bin_time: 1e-3,
            plot_width: 0.1,
            channel_a: 0,
            channel_b: 1,
            window: 50,
        }
    }

    #[test]
    fn test_buffer_covers_window_and_plot() {
        let c = CorrelatorConsumer::new(&settings()).unwrap();
        assert_eq!(c.store().capacity(), 100);
        c.set_settings(CorrelatorSettings {
            plot_width: 0.01,
            ..settings()
        });
        let store = c.create_handler().unwrap();
        assert_eq!(store.capacity(), 50);
    }

    #[test]
    fn test_needs_both_channels() {
        let c = CorrelatorConsumer::new(&settings()).unwrap();
        let store = c.create_handler().unwrap();
        assert!(c.correlate(5).is_none());
        store.handle_bin(&BinRecord::new(0, 1, 3, 0).to_bin(1000));
        assert!(c.correlate(5).is_none());
        c.set_channels(0, 0);
        assert!(c.correlate(5).is_some());
    }

    #[test]
    fn test_constant_counts_correlate_to_one() {
        let c = CorrelatorConsumer::new(&settings()).unwrap();
        let store = c.create_handler().unwrap();
        for t in 0..200u64 {
            store.handle_bin(&BinRecord::new(0, t, 2, 0).to_bin(1000));
            store.handle_bin(&BinRecord::new(1, t, 5, 0).to_bin(1000));
        }
        let corr = c.correlate(10).unwrap();
        assert_eq!(corr.sample_count, 50);
        assert_eq!(corr.values.len(), 11);
        assert!(corr.values.iter().all(|v| (v - 1.0).abs() < 1e-9));
    }
}
