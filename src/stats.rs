//! Latency sample recorder for drivers and benchmarks.

/// Collects nanosecond samples and reports the tail quantiles that matter
/// for a latency distribution. Recording never allocates once the initial
/// capacity is reached, so it is safe to call on a measurement hot path.
#[derive(Debug, Default)]
pub struct Percentiles {
    samples: Vec<u64>,
}

const QUANTILES: [(&str, f64); 8] = [
    ("p50", 0.5),
    ("p75", 0.75),
    ("p90", 0.9),
    ("p95", 0.95),
    ("p99", 0.99),
    ("p99.9", 0.999),
    ("p99.99", 0.9999),
    ("p99.999", 0.99999),
];

impl Percentiles {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            samples: Vec::with_capacity(capacity),
        }
    }

    #[inline]
    pub fn record(&mut self, value_ns: u64) {
        self.samples.push(value_ns);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// The `p`-quantile of the recorded samples (nearest-rank on a sorted
    /// copy is deferred to [`Self::summary`]; here the samples must already
    /// be sorted).
    fn quantile_sorted(&self, p: f64) -> u64 {
        debug_assert!((0.0..=1.0).contains(&p));
        let n = self.samples.len();
        let idx = ((n - 1) as f64 * p).round() as usize;
        self.samples[idx]
    }

    /// Sorts the samples and renders a one-line summary:
    /// `label: n=..., min=..., p50=..., ..., max=...`.
    ///
    /// Returns `label: no samples` when nothing was recorded.
    pub fn summary(&mut self, label: &str) -> String {
        if self.samples.is_empty() {
            return format!("{}: no samples", label);
        }
        self.samples.sort_unstable();
        let mut line = format!(
            "{}: n={}, min={}",
            label,
            self.samples.len(),
            self.samples[0]
        );
        for (label, p) in QUANTILES {
            line.push_str(&format!(", {}={}", label, self.quantile_sorted(p)));
        }
        line.push_str(&format!(", max={}", self.samples[self.samples.len() - 1]));
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_and_counts() {
        let mut p = Percentiles::with_capacity(4);
        assert!(p.is_empty());
        p.record(5);
        p.record(1);
        p.record(9);
        assert_eq!(p.len(), 3);
    }

    #[test]
    fn summary_orders_the_extremes() {
        let mut p = Percentiles::with_capacity(8);
        for v in [9u64, 1, 5, 7, 3] {
            p.record(v);
        }
        let line = p.summary("test");
        assert!(line.starts_with("test: n=5, min=1"));
        assert!(line.ends_with("max=9"));
        assert!(line.contains("p50=5"));
    }

    #[test]
    fn empty_summary_does_not_panic() {
        let mut p = Percentiles::default();
        assert_eq!(p.summary("idle"), "idle: no samples");
    }
}
