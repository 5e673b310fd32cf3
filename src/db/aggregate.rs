//! Probe statistics for daily aggregates.

use std::collections::BTreeMap;
use tdigests::TDigest;

use super::models::ProbeStats;
use crate::probe::{round2, ProbeResult};

#[derive(Default)]
struct Accumulator {
    total: u64,
    successful: u64,
    latencies: Vec<f64>,
}

impl Accumulator {
    fn push(&mut self, result: &ProbeResult) {
        self.total += 1;
        if result.success {
            self.successful += 1;
            if result.latency > 0.0 {
                self.latencies.push(result.latency);
            }
        }
    }

    fn finish(self) -> ProbeStats {
        let success_rate = if self.total > 0 {
            round2(self.successful as f64 / self.total as f64 * 100.0)
        } else {
            0.0
        };
        let average_latency = if self.latencies.is_empty() {
            0.0
        } else {
            round2(self.latencies.iter().sum::<f64>() / self.latencies.len() as f64)
        };
        let p95_latency = if self.latencies.is_empty() {
            0.0
        } else {
            round2(TDigest::from_values(self.latencies).estimate_quantile(0.95))
        };

        ProbeStats {
            total: self.total,
            successful: self.successful,
            failed: self.total - self.successful,
            success_rate,
            average_latency,
            p95_latency,
        }
    }
}

/// Overall and per-target stats over one day's probes.
///
/// Latency averages only count successful probes with a positive latency.
pub fn summarize_day(results: &[&ProbeResult]) -> (ProbeStats, BTreeMap<String, ProbeStats>) {
    let mut overall = Accumulator::default();
    let mut per_target: BTreeMap<String, Accumulator> = BTreeMap::new();

    for result in results {
        overall.push(result);
        per_target.entry(result.target.clone()).or_default().push(result);
    }

    let targets = per_target
        .into_iter()
        .map(|(target, acc)| (target, acc.finish()))
        .collect();
    (overall.finish(), targets)
}
