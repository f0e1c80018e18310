// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use histogram::Histogram;
use serde::{Deserialize, Serialize};

/// Point-in-time view of a streaming histogram.
///
/// Percentiles come from the estimator, not from retained samples; an
/// empty histogram snapshots as all zeros.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct HistogramSnapshot {
    pub count: u64,
    pub min: u64,
    pub max: u64,
    pub avg: u64,
    pub p50: u64,
    pub p95: u64,
    pub p99: u64,
}

impl HistogramSnapshot {
    pub fn of(h: &Histogram) -> Self {
        if h.entries() == 0 {
            return Self::default();
        }
        Self {
            count: h.entries(),
            min: h.minimum().unwrap_or(0),
            max: h.maximum().unwrap_or(0),
            avg: h.mean().unwrap_or(0),
            p50: h.percentile(50.0).unwrap_or(0),
            p95: h.percentile(95.0).unwrap_or(0),
            p99: h.percentile(99.0).unwrap_or(0),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_histogram_snapshots_to_zeros() {
        let h = Histogram::new();
        assert_eq!(HistogramSnapshot::of(&h), HistogramSnapshot::default());
    }

    #[test]
    fn snapshot_tracks_count_and_extremes() {
        let mut h = Histogram::new();
        for v in [10u64, 20, 30, 40, 1000] {
            h.increment(v).unwrap();
        }
        let s = HistogramSnapshot::of(&h);
        assert_eq!(s.count, 5);
        assert!(s.min <= 10 + 1); // estimator precision
        assert!(s.max >= 990);
        assert!(s.p50 >= s.min && s.p50 <= s.max);
        assert!(s.p95 >= s.p50);
        assert!(s.p99 >= s.p95);
    }
}
