//! Count-per-bin histograms
//!
//! Buckets are keyed by `floor(value / width) * width`. Accumulation only
//! resets when the width changes.

use std::collections::BTreeMap;

/// Histogram of integer bin counts
#[derive(Debug, Clone, PartialEq)]
pub struct Histogram {
    width: u32,
    buckets: BTreeMap<u32, u64>,
}

impl Histogram {
    /// Create an empty histogram. A zero width is treated as 1.
    pub fn new(width: u32) -> Self {
        Self {
            width: width.max(1),
            buckets: BTreeMap::new(),
        }
    }

    /// Bucket key for a count
    pub fn bucket_of(&self, count: u32) -> u32 {
        (count / self.width) * self.width
    }

    /// Record one occurrence of `count`
    pub fn add(&mut self, count: u32) {
        *self.buckets.entry(self.bucket_of(count)).or_insert(0) += 1;
    }

    /// Change the width, clearing all buckets
    pub fn set_width(&mut self, width: u32) {
        self.width = width.max(1);
        self.buckets.clear();
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    /// Bucket start → occurrence count
    pub fn buckets(&self) -> &BTreeMap<u32, u64> {
        &self.buckets
    }

    /// Total number of recorded occurrences
    pub fn total(&self) -> u64 {
        self.buckets.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

/// Histogram over a real-valued quantity in `[0, 1]`, such as FRET efficiency.
///
/// Buckets are stored by integer index so that keys compare exactly.
#[derive(Debug, Clone, PartialEq)]
pub struct FractionHistogram {
    width: f64,
    buckets: BTreeMap<i64, u64>,
}

impl FractionHistogram {
    pub fn new(width: f64) -> Self {
        Self {
            width: sanitize_width(width),
            buckets: BTreeMap::new(),
        }
    }

    /// Record one occurrence of `value`
    pub fn add(&mut self, value: f64) {
        let idx = (value / self.width).floor() as i64;
        *self.buckets.entry(idx).or_insert(0) += 1;
    }

    /// Change the width, clearing all buckets
    pub fn set_width(&mut self, width: f64) {
        self.width = sanitize_width(width);
        self.buckets.clear();
    }

    pub fn width(&self) -> f64 {
        self.width
    }

    /// `(floor(value / width) * width, occurrences)` pairs in ascending order
    pub fn buckets(&self) -> Vec<(f64, u64)> {
        self.buckets
            .iter()
            .map(|(&idx, &n)| (idx as f64 * self.width, n))
            .collect()
    }

    pub fn total(&self) -> u64 {
        self.buckets.values().sum()
    }
}

fn sanitize_width(width: f64) -> f64 {
    if width.is_finite() && width > 0.0 {
        width
    } else {
        tracing::warn!("Ignoring invalid histogram width {}, using 1.0", width);
        1.0
    }
}
