//! Latency, jitter and quality helpers used by network-quality aggregators.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::aggregate::round_to;

/// Summary of a set of latency samples.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    /// Smallest value.
    pub min: f64,
    /// Largest value.
    pub max: f64,
    /// Arithmetic mean.
    pub avg: f64,
    /// 95th percentile (nearest rank).
    pub p95: f64,
    /// Number of finite values summarized.
    pub count: usize,
}

impl LatencyStats {
    /// Computes min, max, average and p95 over the finite values.
    ///
    /// Returns `None` when there are no finite values.
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn from_values(values: &[f64], precision: Option<u8>) -> Option<Self> {
        let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
        if sorted.is_empty() {
            return None;
        }
        sorted.sort_by(f64::total_cmp);

        let count = sorted.len();
        let rank = (count as f64 * 0.95).ceil() as usize;
        let p95 = sorted[rank.saturating_sub(1).min(count - 1)];
        let avg = sorted.iter().sum::<f64>() / count as f64;

        let round = |v: f64| precision.map_or(v, |places| round_to(v, places));
        Some(Self {
            min: round(sorted[0]),
            max: round(sorted[count - 1]),
            avg: round(avg),
            p95: round(p95),
            count,
        })
    }
}

/// Average and peak of an RFC 3550 jitter series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JitterSummary {
    /// Mean of the smoothed jitter after each sample.
    pub avg: f64,
    /// Highest smoothed jitter seen.
    pub max: f64,
}

/// One RFC 3550 smoothing step: `J += (|D| - J) / 16`.
fn smooth(jitter: f64, previous: f64, current: f64) -> f64 {
    let d = (current - previous).abs();
    jitter + (d - jitter) / 16.0
}

/// Computes RFC 3550 jitter over latencies in time order.
///
/// Results are rounded to two decimals. Returns `None` for fewer than two
/// samples.
#[allow(clippy::cast_precision_loss)]
pub fn jitter_from_latencies(latencies: &[f64]) -> Option<JitterSummary> {
    if latencies.len() < 2 {
        return None;
    }

    let mut jitter = 0.0;
    let mut max = 0.0_f64;
    let mut sum = 0.0;
    for pair in latencies.windows(2) {
        jitter = smooth(jitter, pair[0], pair[1]);
        max = max.max(jitter);
        sum += jitter;
    }

    let steps = (latencies.len() - 1) as f64;
    Some(JitterSummary {
        avg: round_to(sum / steps, 2),
        max: round_to(max, 2),
    })
}

#[derive(Debug, Clone, Copy)]
struct JitterState {
    previous: f64,
    jitter: f64,
}

/// Incremental per-host RFC 3550 jitter.
///
/// Lives for one collector process; the first sample of a host only seeds
/// its state.
#[derive(Debug, Default)]
pub struct JitterTracker {
    hosts: HashMap<String, JitterState>,
}

impl JitterTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one latency for `host`, returning the smoothed jitter rounded
    /// to two decimals, or `None` for the host's first sample.
    pub fn observe(&mut self, host: &str, latency: f64) -> Option<f64> {
        let Some(state) = self.hosts.get_mut(host) else {
            self.hosts.insert(
                host.to_string(),
                JitterState {
                    previous: latency,
                    jitter: 0.0,
                },
            );
            return None;
        };

        state.jitter = smooth(state.jitter, state.previous, latency);
        state.previous = latency;
        Some(round_to(state.jitter, 2))
    }

    /// Forgets a host's state.
    pub fn reset(&mut self, host: &str) {
        self.hosts.remove(host);
    }
}

/// Quality rating, ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    /// Below the good threshold.
    Good,
    /// Below the fair threshold.
    Fair,
    /// Below the poor threshold.
    Poor,
    /// At or above the poor threshold.
    Critical,
}

/// Upper bounds (exclusive) for the good, fair and poor ratings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    /// Values below this are good.
    pub good: f64,
    /// Values below this are fair.
    pub fair: f64,
    /// Values below this are poor; anything else is critical.
    pub poor: f64,
}

impl Thresholds {
    /// Round-trip latency in milliseconds.
    pub const LATENCY_MS: Self = Self {
        good: 50.0,
        fair: 100.0,
        poor: 250.0,
    };

    /// Jitter in milliseconds.
    pub const JITTER_MS: Self = Self {
        good: 10.0,
        fair: 20.0,
        poor: 50.0,
    };

    /// Packet loss in percent.
    pub const PACKET_LOSS_PCT: Self = Self {
        good: 1.0,
        fair: 2.0,
        poor: 5.0,
    };

    /// Rates `value` against these thresholds.
    pub fn rate(&self, value: f64) -> Quality {
        if value < self.good {
            Quality::Good
        } else if value < self.fair {
            Quality::Fair
        } else if value < self.poor {
            Quality::Poor
        } else {
            Quality::Critical
        }
    }
}

impl Quality {
    /// The worst of several ratings.
    pub fn overall(ratings: &[Quality]) -> Quality {
        ratings.iter().copied().max().unwrap_or(Quality::Good)
    }

    /// Lowercase name, as stored in rollup records.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Good => "good",
            Self::Fair => "fair",
            Self::Poor => "poor",
            Self::Critical => "critical",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_stats() {
        let values: Vec<f64> = (1..=20).map(f64::from).collect();
        let stats = LatencyStats::from_values(&values, Some(1)).unwrap();

        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.max, 20.0);
        assert_eq!(stats.avg, 10.5);
        // ceil(20 * 0.95) - 1 = 18
        assert_eq!(stats.p95, 19.0);
        assert_eq!(stats.count, 20);
    }

    #[test]
    fn test_latency_stats_single_and_empty() {
        let stats = LatencyStats::from_values(&[7.25, f64::NAN], None).unwrap();
        assert_eq!(stats.p95, 7.25);
        assert_eq!(stats.count, 1);

        assert!(LatencyStats::from_values(&[], None).is_none());
        assert!(LatencyStats::from_values(&[f64::NAN], None).is_none());
    }

    #[test]
    fn test_jitter_from_latencies() {
        assert!(jitter_from_latencies(&[10.0]).is_none());

        // D = 16 -> J = 1.0; D = 0 -> J = 0.9375
        let summary = jitter_from_latencies(&[10.0, 26.0, 26.0]).unwrap();
        assert_eq!(summary.max, 1.0);
        assert_eq!(summary.avg, 0.97);
    }

    #[test]
    fn test_jitter_tracker_per_host() {
        let mut tracker = JitterTracker::new();
        assert_eq!(tracker.observe("a", 10.0), None);
        assert_eq!(tracker.observe("b", 50.0), None);
        assert_eq!(tracker.observe("a", 26.0), Some(1.0));
        assert_eq!(tracker.observe("b", 50.0), Some(0.0));

        tracker.reset("a");
        assert_eq!(tracker.observe("a", 26.0), None);
    }

    #[test]
    fn test_quality_rating() {
        assert_eq!(Thresholds::LATENCY_MS.rate(20.0), Quality::Good);
        assert_eq!(Thresholds::LATENCY_MS.rate(50.0), Quality::Fair);
        assert_eq!(Thresholds::LATENCY_MS.rate(120.0), Quality::Poor);
        assert_eq!(Thresholds::LATENCY_MS.rate(250.0), Quality::Critical);
        assert_eq!(Thresholds::PACKET_LOSS_PCT.rate(0.5), Quality::Good);
        assert_eq!(Thresholds::JITTER_MS.rate(30.0), Quality::Poor);
    }

    #[test]
    fn test_overall_quality_is_worst() {
        assert_eq!(
            Quality::overall(&[Quality::Good, Quality::Poor, Quality::Fair]),
            Quality::Poor
        );
        assert_eq!(Quality::overall(&[Quality::Good; 3]), Quality::Good);
        assert_eq!(Quality::overall(&[]), Quality::Good);
        assert_eq!(Quality::Critical.as_str(), "critical");
    }
}
