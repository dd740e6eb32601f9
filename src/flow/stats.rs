//! Single-pass running statistics

use serde::{Deserialize, Serialize};

/// Running count / mean / variance / min / max over a stream of values
///
/// Uses Welford's algorithm so no samples are retained. Variance and
/// standard deviation are sample statistics (n - 1 denominator).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RunningStats {
    pub count: u64,
    pub mean: f64,
    m2: f64,
    pub min: f64,
    pub max: f64,
    pub sum: f64,
}

impl Default for RunningStats {
    fn default() -> Self {
        Self::new()
    }
}

impl RunningStats {
    pub const fn new() -> Self {
        Self {
            count: 0,
            mean: 0.0,
            m2: 0.0,
            min: f64::MAX,
            max: f64::MIN,
            sum: 0.0,
        }
    }

    /// Fold one value into the statistics
    #[inline]
    pub fn push(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);

        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        let delta2 = value - self.mean;
        self.m2 += delta * delta2;
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / (self.count - 1) as f64
        }
    }

    pub fn std(&self) -> f64 {
        self.variance().sqrt()
    }

    /// Minimum, or 0 when nothing was recorded
    pub fn min_or_zero(&self) -> f64 {
        if self.is_empty() { 0.0 } else { self.min }
    }

    /// Maximum, or 0 when nothing was recorded
    pub fn max_or_zero(&self) -> f64 {
        if self.is_empty() { 0.0 } else { self.max }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch_mean_var(values: &[f64]) -> (f64, f64) {
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let var = if values.len() < 2 {
            0.0
        } else {
            values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0)
        };
        (mean, var)
    }

    #[test]
    fn test_empty_stats() {
        let stats = RunningStats::new();
        assert!(stats.is_empty());
        assert_eq!(stats.mean, 0.0);
        assert_eq!(stats.std(), 0.0);
        assert_eq!(stats.min_or_zero(), 0.0);
        assert_eq!(stats.max_or_zero(), 0.0);
    }

    #[test]
    fn test_single_value_has_zero_variance() {
        let mut stats = RunningStats::new();
        stats.push(42.0);
        assert_eq!(stats.mean, 42.0);
        assert_eq!(stats.variance(), 0.0);
        assert_eq!(stats.min, 42.0);
        assert_eq!(stats.max, 42.0);
    }

    #[test]
    fn test_matches_batch_aggregation() {
        // Deterministic pseudo-random lengths, including large offsets that
        // break the naive sum-of-squares formula.
        let mut seed = 0x2545_f491_u64;
        let mut values = Vec::new();
        for _ in 0..5000 {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            values.push(1_000_000.0 + (seed % 1500) as f64);
        }

        let mut stats = RunningStats::new();
        for v in &values {
            stats.push(*v);
        }

        let (mean, var) = batch_mean_var(&values);
        assert_eq!(stats.count, values.len() as u64);
        assert!((stats.mean - mean).abs() < 1e-4);
        assert!((stats.variance() - var).abs() / var < 1e-6);
        assert_eq!(stats.min, values.iter().cloned().fold(f64::MAX, f64::min));
        assert_eq!(stats.max, values.iter().cloned().fold(f64::MIN, f64::max));
    }

    #[test]
    fn test_known_values() {
        let mut stats = RunningStats::new();
        for v in [100.0, 150.0, 250.0] {
            stats.push(v);
        }
        let expected_std = (((100.0f64 - 500.0 / 3.0).powi(2)
            + (150.0f64 - 500.0 / 3.0).powi(2)
            + (250.0f64 - 500.0 / 3.0).powi(2))
            / 2.0)
            .sqrt();
        assert!((stats.mean - 500.0 / 3.0).abs() < 1e-9);
        assert!((stats.std() - expected_std).abs() < 1e-9);
        assert_eq!(stats.sum, 500.0);
    }
}
