//! Probe module for reachability checks.
//!
//! A probe never fails from the caller's point of view: every outcome,
//! including timeouts and lookup failures, becomes a [`ProbeResult`].

mod gateway;
mod ping;
mod speed;

pub use gateway::*;
pub use ping::*;
pub use speed::*;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Extra time a probe may take beyond its own timeout before it is abandoned.
pub const PROBE_GRACE: Duration = Duration::from_secs(1);

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("timeout")]
    Timeout,
    #[error("network error: {0}")]
    Network(String),
    #[error("command failed: {0}")]
    Command(String),
}

/// Outcome of a single probe against one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    /// Target identifier the result is tracked under.
    pub target: String,
    /// Address that was actually probed (differs from `target` for the gateway).
    pub address: String,
    pub success: bool,
    /// Round-trip time in milliseconds, 0 when `success` is false.
    pub latency: f64,
    pub timestamp: DateTime<Utc>,
    pub error: Option<String>,
}

impl ProbeResult {
    pub fn success(target: &str, address: &str, latency_ms: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            target: target.to_string(),
            address: address.to_string(),
            success: true,
            latency: round2(latency_ms.max(0.0)),
            timestamp,
            error: None,
        }
    }

    pub fn failure(target: &str, address: &str, error: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            target: target.to_string(),
            address: address.to_string(),
            success: false,
            latency: 0.0,
            timestamp,
            error: Some(error.into()),
        }
    }
}

/// Network-facing operations used by the monitoring loop.
#[async_trait]
pub trait Prober: Send + Sync {
    /// Probe `address` and report the outcome under `target`.
    async fn probe(&self, target: &str, address: &str, timeout: Duration) -> ProbeResult;

    /// Look up the default gateway in the OS routing table.
    async fn detect_gateway(&self) -> Result<String, ProbeError>;
}

/// Production prober: ICMP echo with a `ping` command fallback.
#[derive(Debug, Default, Clone)]
pub struct PingProber;

#[async_trait]
impl Prober for PingProber {
    async fn probe(&self, target: &str, address: &str, timeout: Duration) -> ProbeResult {
        let started = Utc::now();
        let outcome = tokio::time::timeout(timeout + PROBE_GRACE, run_ping_probe(address, timeout)).await;

        match outcome {
            Ok(Ok(nanos)) => ProbeResult::success(target, address, nanos / 1_000_000.0, started),
            Ok(Err(e)) => ProbeResult::failure(target, address, e.to_string(), started),
            Err(_) => ProbeResult::failure(target, address, ProbeError::Timeout.to_string(), started),
        }
    }

    async fn detect_gateway(&self) -> Result<String, ProbeError> {
        detect_default_gateway().await
    }
}

/// Round to two decimal places.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
