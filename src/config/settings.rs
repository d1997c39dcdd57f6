//! Consumer settings
//!
//! Parameters for the managed binning consumers. Changing any of these on a
//! running consumer means restarting its binner, since they are baked into
//! the binner at construction.

use super::MAX_BUFFER_POINTS;
use crate::error::{CaptureError, Result};
use crate::types::ChannelId;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Number of most recent samples the correlator works over
pub const DEFAULT_CORRELATION_WINDOW: usize = 10_000;

/// Shortest poll period a watcher will sleep for
const MIN_POLL_PERIOD_SECS: f64 = 0.01;

const DEFAULT_POLL_PERIOD_SECS: f64 = 2.0;

/// Settings for every consumer kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerSettings {
    /// How often managed binners re-check the capture state, in seconds
    pub poll_period_secs: f64,

    /// Bin time of the plain buffering consumer in seconds
    pub buffer_bin_time: f64,

    pub histogram: HistogramSettings,

    pub fret: FretSettings,

    pub correlator: CorrelatorSettings,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            poll_period_secs: DEFAULT_POLL_PERIOD_SECS,
            buffer_bin_time: 1e-3,
            histogram: HistogramSettings::default(),
            fret: FretSettings::default(),
            correlator: CorrelatorSettings::default(),
        }
    }
}

impl ConsumerSettings {
    /// Watcher poll period, clamped to at least 10 ms.
    ///
    /// Values that do not fit a [`Duration`] fall back to the default period.
    pub fn poll_period(&self) -> Duration {
        Duration::try_from_secs_f64(self.poll_period_secs.max(MIN_POLL_PERIOD_SECS))
            .unwrap_or_else(|_| Duration::from_secs_f64(DEFAULT_POLL_PERIOD_SECS))
    }

    /// Reject settings a consumer cannot be built from
    pub fn validate(&self) -> Result<()> {
        positive("consumers.poll_period_secs", self.poll_period_secs)?;
        positive("consumers.buffer_bin_time", self.buffer_bin_time)?;
        positive("consumers.histogram.bin_time", self.histogram.bin_time)?;
        if self.histogram.width == 0 {
            return Err(CaptureError::Config(
                "consumers.histogram.width must be at least 1".into(),
            ));
        }
        positive("consumers.fret.bin_time", self.fret.bin_time)?;
        positive("consumers.fret.width", self.fret.width)?;
        positive("consumers.correlator.bin_time", self.correlator.bin_time)?;
        positive("consumers.correlator.plot_width", self.correlator.plot_width)?;
        let points = (self.correlator.plot_width / self.correlator.bin_time).round();
        if points > MAX_BUFFER_POINTS as f64 || self.correlator.window > MAX_BUFFER_POINTS {
            return Err(CaptureError::Config(format!(
                "consumers.correlator needs more than {} buffer points",
                MAX_BUFFER_POINTS
            )));
        }
        Ok(())
    }
}

fn positive(name: &str, value: f64) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(CaptureError::Config(format!(
            "{} must be a positive number, got {}",
            name, value
        )))
    }
}

/// Per-channel count histogram consumer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistogramSettings {
    /// Bin time of the consumer's binner in seconds
    pub bin_time: f64,
    /// Histogram bucket width in photons
    pub width: u32,
}

impl Default for HistogramSettings {
    fn default() -> Self {
        Self {
            bin_time: 1e-3,
            width: 10,
        }
    }
}

/// Donor/acceptor FRET efficiency histogram consumer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FretSettings {
    pub bin_time: f64,
    /// Efficiency bucket width
    pub width: f64,
    pub donor_channel: ChannelId,
    pub acceptor_channel: ChannelId,
    /// Minimum donor + acceptor photons for a coincident pair to count
    pub threshold: u32,
}

impl Default for FretSettings {
    fn default() -> Self {
        Self {
            bin_time: 1e-2,
            width: 0.05,
            donor_channel: 0,
            acceptor_channel: 1,
            threshold: 3,
        }
    }
}

/// Cross-/auto-correlation consumer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelatorSettings {
    pub bin_time: f64,
    /// Time span the buffers must cover, in seconds
    pub plot_width: f64,
    pub channel_a: ChannelId,
    pub channel_b: ChannelId,
    /// Most recent samples used per correlation
    pub window: usize,
}

impl Default for CorrelatorSettings {
    fn default() -> Self {
        Self {
            bin_time: 1e-4,
            plot_width: 1.0,
            channel_a: 0,
            channel_b: 0,
            window: DEFAULT_CORRELATION_WINDOW,
        }
    }
}

impl CorrelatorSettings {
    /// Buffer points needed to cover `plot_width` at `bin_time`
    pub fn n_points(&self) -> usize {
        ((self.plot_width / self.bin_time).round() as usize).max(1)
    }

    /// Whether both selected channels are the same
    pub fn is_autocorrelation(&self) -> bool {
        self.channel_a == self.channel_b
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let s = ConsumerSettings::default();
        assert_eq!(s.poll_period(), Duration::from_secs(2));
        assert_eq!(s.histogram.width, 10);
        assert_eq!(s.fret.threshold, 3);
        assert_eq!(s.correlator.window, 10_000);
        assert_eq!(s.buffer_bin_time, 1e-3);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_poll_period_never_panics() {
        for secs in [f64::INFINITY, f64::NAN, -3.0, 1e300] {
            let s = ConsumerSettings {
                poll_period_secs: secs,
                ..Default::default()
            };
            assert!(s.poll_period() >= Duration::from_millis(10));
            assert!(matches!(s.validate(), Err(CaptureError::Config(_))));
        }
    }

    #[test]
    fn test_bad_consumer_values_rejected() {
        let mut s = ConsumerSettings::default();
        s.fret.width = f64::NAN;
        assert!(s.validate().is_err());

        let mut s = ConsumerSettings::default();
        s.histogram.width = 0;
        assert!(s.validate().is_err());

        let mut s = ConsumerSettings::default();
        s.correlator.bin_time = 1e-12;
        assert!(s.validate().is_err());

        let mut s = ConsumerSettings::default();
        s.buffer_bin_time = 0.0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_correlator_points() {
        let s = CorrelatorSettings {
            bin_time: 1e-3,
            plot_width: 2.0,
            ..Default::default()
        };
        assert_eq!(s.n_points(), 2000);
        assert!(s.is_autocorrelation());
    }
}
