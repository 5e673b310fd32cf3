//! Best-effort link throughput from interface byte counters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use sysinfo::Networks;

/// Throughput observed between two consecutive samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeedSample {
    pub download_mbps: f64,
    pub upload_mbps: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
struct Counters {
    at: Instant,
    received: u64,
    transmitted: u64,
}

/// Samples non-loopback interface counters and reports the rate since the
/// previous sample. The first sample always reports zero.
pub struct ThroughputSampler {
    networks: Networks,
    last: Option<Counters>,
}

impl Default for ThroughputSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ThroughputSampler {
    pub fn new() -> Self {
        Self {
            networks: Networks::new_with_refreshed_list(),
            last: None,
        }
    }

    pub fn sample(&mut self) -> SpeedSample {
        self.networks.refresh();

        let (mut received, mut transmitted) = (0u64, 0u64);
        for (iface, data) in &self.networks {
            if is_loopback(iface) {
                continue;
            }
            received = received.saturating_add(data.total_received());
            transmitted = transmitted.saturating_add(data.total_transmitted());
        }

        let now = Counters {
            at: Instant::now(),
            received,
            transmitted,
        };
        let (download_mbps, upload_mbps) = match self.last {
            Some(prev) => rates_between(prev, now),
            None => (0.0, 0.0),
        };
        self.last = Some(now);

        SpeedSample {
            download_mbps,
            upload_mbps,
            timestamp: Utc::now(),
        }
    }
}

fn is_loopback(iface: &str) -> bool {
    iface == "lo" || iface.starts_with("lo0") || iface.starts_with("Loopback")
}

fn rates_between(prev: Counters, now: Counters) -> (f64, f64) {
    let secs = now.at.saturating_duration_since(prev.at).as_secs_f64();
    if secs <= 0.0 {
        return (0.0, 0.0);
    }
    let mbps = |bytes: u64| round1(bytes as f64 * 8.0 / 1_000_000.0 / secs);
    (
        mbps(now.received.saturating_sub(prev.received)),
        mbps(now.transmitted.saturating_sub(prev.transmitted)),
    )
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
