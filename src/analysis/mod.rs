//! Analysis module for bin series
//!
//! This module provides signal analysis tools including:
//! - FFT-based cross-correlation of two channels' counts
//! - Autocorrelation as the single-channel special case

pub mod correlation;

pub use correlation::{Correlation, Correlator};
