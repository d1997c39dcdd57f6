//! Cross- and auto-correlation of bin count series
//!
//! Computes the normalized correlation
//!
//! ```text
//! G(τ) = mean_t(a[t] · b[t + τ]) / (mean(a) · mean(b))
//! ```
//!
//! for lags `τ = 0..=max_lag`, where the inner mean runs over the `n - τ`
//! overlapping samples. Uncorrelated series give `G ≈ 1`.
//!
//! The lagged products are computed with one forward FFT per series and one
//! inverse FFT, zero-padded to avoid circular wrap-around.

use rustfft::{num_complex::Complex, FftPlanner};

/// Correlation curve over lags
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Correlation {
    /// Lag of each point in seconds
    pub lags: Vec<f64>,
    /// Normalized correlation at each lag
    pub values: Vec<f64>,
    /// Samples per series used
    pub sample_count: usize,
}

impl Correlation {
    /// Data points for plotting (lag, value)
    pub fn plot_points(&self) -> Vec<[f64; 2]> {
        self.lags
            .iter()
            .zip(self.values.iter())
            .map(|(&l, &v)| [l, v])
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// FFT correlator with a reusable planner
pub struct Correlator {
    planner: FftPlanner<f64>,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

impl Correlator {
    pub fn new() -> Self {
        Self {
            planner: FftPlanner::new(),
        }
    }

    /// Normalized cross-correlation of `a` and `b`.
    ///
    /// Both series are truncated to their common length, keeping the newest
    /// samples. Returns `None` if either series is empty or has zero mean.
    pub fn correlate(&mut self, a: &[f64], b: &[f64], max_lag: usize) -> Option<Vec<f64>> {
        let n = a.len().min(b.len());
        if n == 0 {
            return None;
        }
        let a = &a[a.len() - n..];
        let b = &b[b.len() - n..];

        let mean_a = a.iter().sum::<f64>() / n as f64;
        let mean_b = b.iter().sum::<f64>() / n as f64;
        let norm = mean_a * mean_b;
        if norm == 0.0 || !norm.is_finite() {
            return None;
        }

        let max_lag = max_lag.min(n - 1);
        let fft_size = (2 * n).next_power_of_two();
        let forward = self.planner.plan_fft_forward(fft_size);
        let inverse = self.planner.plan_fft_inverse(fft_size);

        let mut freq_a = padded(a, fft_size);
        let mut freq_b = padded(b, fft_size);
        forward.process(&mut freq_a);
        forward.process(&mut freq_b);

        // conj(A) · B transforms to sum_t a[t] · b[t + τ]
        let mut lagged: Vec<Complex<f64>> = freq_a
            .iter()
            .zip(freq_b.iter())
            .map(|(x, y)| x.conj() * y)
            .collect();
        inverse.process(&mut lagged);

        let scale = 1.0 / fft_size as f64;
        Some(
            (0..=max_lag)
                .map(|tau| lagged[tau].re * scale / (n - tau) as f64 / norm)
                .collect(),
        )
    }

    /// Correlate count series sampled every `bin_time` seconds
    pub fn correlate_counts(
        &mut self,
        a: &[u32],
        b: &[u32],
        max_lag: usize,
        bin_time: f64,
    ) -> Option<Correlation> {
        let a: Vec<f64> = a.iter().map(|&c| f64::from(c)).collect();
        let b: Vec<f64> = b.iter().map(|&c| f64::from(c)).collect();
        let values = self.correlate(&a, &b, max_lag)?;
        Some(Correlation {
            lags: (0..values.len()).map(|i| i as f64 * bin_time).collect(),
            values,
            sample_count: a.len().min(b.len()),
        })
    }
}

fn padded(samples: &[f64], size: usize) -> Vec<Complex<f64>> {
    let mut buffer: Vec<Complex<f64>> = samples.iter().map(|&x| Complex::new(x, 0.0)).collect();
    buffer.resize(size, Complex::new(0.0, 0.0));
    buffer
}
