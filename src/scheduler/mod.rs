//! Scheduler module: the monitoring loop and its shared state.
//!
//! One background task probes every target per cycle, feeds results to the
//! failure tracker and history, and publishes events. Everything else runs
//! on caller tasks and reads snapshots under the same locks.

mod history;
mod retention;
mod tracker;

pub use history::*;
pub use retention::*;
pub use tracker::*;

use crate::db::{DbError, FailureReport, Store};
use crate::events::{Event, EventSink};
use crate::probe::{GatewayCache, ProbeResult, Prober, ThroughputSampler};
use crate::registry::{TargetRegistry, GATEWAY};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;

pub const DEFAULT_PING_INTERVAL: u64 = 5;
pub const MIN_PING_INTERVAL: u64 = 1;
pub const MAX_PING_INTERVAL: u64 = 60;
pub const DEFAULT_PROBE_TIMEOUT: u64 = 3;

/// How long `stop` waits for the current cycle before aborting it.
const STOP_GRACE: Duration = Duration::from_secs(5);
/// Pause after a cycle that ended in an error.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Monitor error types.
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("monitor has not been started")]
    NotInitialized,
    #[error("persistence failure: {0}")]
    Persistence(#[from] DbError),
    #[error("worker failure: {0}")]
    Worker(String),
}

/// Runtime-adjustable loop settings. Construction clamps every field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MonitorSettings {
    pub ping_interval: u64,
    pub failure_threshold: u32,
    pub probe_timeout: u64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self::new(DEFAULT_PING_INTERVAL, DEFAULT_FAILURE_THRESHOLD, DEFAULT_PROBE_TIMEOUT)
    }
}

impl MonitorSettings {
    pub fn new(ping_interval: u64, failure_threshold: u32, probe_timeout: u64) -> Self {
        Self {
            ping_interval: clamp_interval(ping_interval),
            failure_threshold: clamp_threshold(failure_threshold),
            probe_timeout: probe_timeout.clamp(1, 30),
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout)
    }
}

pub fn clamp_interval(secs: u64) -> u64 {
    secs.clamp(MIN_PING_INTERVAL, MAX_PING_INTERVAL)
}

/// Aggregate view of the loop for status endpoints.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitorStats {
    pub total_pings: usize,
    pub successful_pings: usize,
    pub success_rate: f64,
    pub custom_targets_count: usize,
    pub is_running: bool,
    pub ping_interval: u64,
    pub failure_threshold: u32,
}

struct Shared {
    registry: Arc<TargetRegistry>,
    store: Arc<Store>,
    prober: Arc<dyn Prober>,
    events: EventSink,
    settings: RwLock<MonitorSettings>,
    tracker: Mutex<FailureTracker>,
    history: Mutex<ProbeHistory>,
    gateway: Mutex<GatewayCache>,
    /// Only written while holding the worker slot lock.
    running: AtomicBool,
    started_at: RwLock<Option<DateTime<Utc>>>,
}

struct Worker {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// One entry of a cycle's probe plan.
struct PlannedProbe {
    id: String,
    address: String,
    name: String,
}

enum CycleOutcome {
    Completed,
    Interrupted,
}

/// Owner of the monitoring loop.
pub struct Scheduler {
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
}

impl Scheduler {
    pub fn new(
        registry: Arc<TargetRegistry>,
        store: Arc<Store>,
        prober: Arc<dyn Prober>,
        events: EventSink,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                registry,
                store,
                prober,
                events,
                settings: RwLock::new(settings),
                tracker: Mutex::new(FailureTracker::new(settings.failure_threshold)),
                history: Mutex::new(ProbeHistory::default()),
                gateway: Mutex::new(GatewayCache::default()),
                running: AtomicBool::new(false),
                started_at: RwLock::new(None),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Start the monitoring loop. Starting a running loop only logs a warning.
    pub async fn start(&self) {
        let mut worker = self.worker.lock().await;
        if let Some(w) = worker.as_ref() {
            if !w.handle.is_finished() {
                tracing::warn!("Monitoring is already running");
                return;
            }
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        self.shared.running.store(true, Ordering::SeqCst);
        self.shared.started_at.write().await.get_or_insert_with(Utc::now);

        let handle = tokio::spawn(run_monitor_loop(self.shared.clone(), stop_rx));
        *worker = Some(Worker { stop_tx, handle });
        tracing::info!("Monitoring started");
    }

    /// Stop the loop, waiting up to 5s for the in-flight probe to finish.
    ///
    /// The worker slot stays locked until the old loop is gone, so a
    /// concurrent `start` cannot run a second loop alongside it.
    pub async fn stop(&self) {
        let mut slot = self.worker.lock().await;
        let Some(worker) = slot.take() else {
            return;
        };

        let _ = worker.stop_tx.send(true);
        let abort = worker.handle.abort_handle();
        match tokio::time::timeout(STOP_GRACE, worker.handle).await {
            Ok(Ok(())) => tracing::info!("Monitoring stopped"),
            Ok(Err(e)) => tracing::error!("Monitoring task ended abnormally: {}", e),
            Err(_) => {
                tracing::warn!("Monitoring cycle did not finish within {:?}, aborting", STOP_GRACE);
                abort.abort();
            }
        }
        self.shared.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub async fn settings(&self) -> MonitorSettings {
        *self.shared.settings.read().await
    }

    /// Change interval and/or threshold; values are clamped. Takes effect
    /// from the next cycle.
    pub async fn update_config(&self, ping_interval: Option<u64>, failure_threshold: Option<u32>) -> MonitorSettings {
        let updated = {
            let mut settings = self.shared.settings.write().await;
            if let Some(secs) = ping_interval {
                settings.ping_interval = clamp_interval(secs);
            }
            if let Some(threshold) = failure_threshold {
                settings.failure_threshold = clamp_threshold(threshold);
            }
            *settings
        };
        self.shared.tracker.lock().await.set_threshold(updated.failure_threshold);

        tracing::info!(
            "Settings updated: interval={}s, threshold={}",
            updated.ping_interval,
            updated.failure_threshold
        );
        updated
    }

    /// Oldest-first copy of the probe history.
    pub async fn history(&self) -> Vec<ProbeResult> {
        self.shared.history.lock().await.snapshot()
    }

    pub async fn active_failures(&self) -> HashMap<String, FailureEpisode> {
        self.shared.tracker.lock().await.active()
    }

    /// Most recently resolved gateway address, if still cached.
    pub async fn gateway_ip(&self) -> Option<String> {
        self.shared.gateway.lock().await.get(Instant::now()).map(str::to_string)
    }

    pub async fn stats(&self) -> MonitorStats {
        let (total, successful, success_rate) = {
            let history = self.shared.history.lock().await;
            let (total, successful) = (history.len(), history.successful());
            let rate = if history.is_empty() {
                0.0
            } else {
                crate::probe::round2(successful as f64 / total as f64 * 100.0)
            };
            (total, successful, rate)
        };
        let settings = self.settings().await;

        MonitorStats {
            total_pings: total,
            successful_pings: successful,
            success_rate,
            custom_targets_count: self.shared.registry.custom().await.len(),
            is_running: self.is_running(),
            ping_interval: settings.ping_interval,
            failure_threshold: settings.failure_threshold,
        }
    }

    /// Write today's aggregate from the current history; returns its name.
    pub async fn generate_daily_report(&self) -> Result<String, MonitorError> {
        if self.shared.started_at.read().await.is_none() {
            return Err(MonitorError::NotInitialized);
        }
        let history = self.history().await;
        Ok(self.shared.store.generate_daily_aggregate(&history)?)
    }
}

async fn run_monitor_loop(shared: Arc<Shared>, mut stop_rx: watch::Receiver<bool>) {
    tracing::info!("Monitoring loop started");
    let mut sampler = ThroughputSampler::new();

    loop {
        if *stop_rx.borrow() {
            break;
        }

        let cycle_start = Instant::now();
        let pause = match run_cycle(&shared, &stop_rx, &mut sampler).await {
            Ok(CycleOutcome::Completed) => {
                let interval = shared.settings.read().await.interval();
                interval.saturating_sub(cycle_start.elapsed())
            }
            Ok(CycleOutcome::Interrupted) => break,
            Err(e) => {
                tracing::error!("Monitoring cycle failed: {}", e);
                ERROR_BACKOFF
            }
        };

        if !pause.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                changed = stop_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
    }

    tracing::info!("Monitoring loop finished");
}

/// Probe every planned target once, in plan order.
async fn run_cycle(
    shared: &Shared,
    stop_rx: &watch::Receiver<bool>,
    sampler: &mut ThroughputSampler,
) -> Result<CycleOutcome, MonitorError> {
    let timeout = shared.settings.read().await.timeout();
    tracing::info!("Monitoring cycle - {}", Utc::now().format("%H:%M:%S"));

    let plan = shared.probe_plan().await;
    let mut probed = HashSet::with_capacity(plan.len());

    for target in plan {
        if *stop_rx.borrow() {
            return Ok(CycleOutcome::Interrupted);
        }

        // Run in its own task so a panicking probe fails the cycle, not the loop.
        let prober = shared.prober.clone();
        let (id, address) = (target.id.clone(), target.address.clone());
        let result = tokio::spawn(async move { prober.probe(&id, &address, timeout).await })
            .await
            .map_err(|e| MonitorError::Worker(format!("probe of {} failed: {}", target.id, e)))?;

        probed.insert(target.id);
        shared.handle_result(result, &target.name).await;
    }

    shared.tracker.lock().await.retain_targets(&probed);

    let speed = sampler.sample();
    tracing::debug!("Throughput: down {} Mbps, up {} Mbps", speed.download_mbps, speed.upload_mbps);
    shared.events.publish(Event::NetworkSpeed(speed));

    Ok(CycleOutcome::Completed)
}

impl Shared {
    /// Fixed targets first, then enabled custom targets in registry order.
    async fn probe_plan(&self) -> Vec<PlannedProbe> {
        let mut plan = Vec::new();
        for fixed in self.registry.fixed() {
            let address = if fixed.id == GATEWAY {
                self.gateway_address().await
            } else {
                fixed.id.clone()
            };
            plan.push(PlannedProbe {
                id: fixed.id.clone(),
                address,
                name: fixed.name.clone(),
            });
        }

        let custom = self.registry.enabled_custom().await;
        if custom.is_empty() {
            tracing::debug!("No enabled custom targets");
        }
        plan.extend(custom.into_iter().map(|t| PlannedProbe {
            address: t.id.clone(),
            id: t.id,
            name: t.name,
        }));

        plan
    }

    async fn gateway_address(&self) -> String {
        if let Some(addr) = self.gateway.lock().await.get(Instant::now()) {
            return addr.to_string();
        }
        let detected = self.prober.detect_gateway().await;
        self.gateway.lock().await.resolve(detected, Instant::now())
    }

    async fn handle_result(&self, result: ProbeResult, name: &str) {
        tracing::info!(
            "Ping {} ({}): {}ms ({})",
            name,
            result.address,
            result.latency,
            if result.success { "ok" } else { result.error.as_deref().unwrap_or("failed") }
        );

        let report = self.tracker.lock().await.observe(&result, name);
        if let Some(report) = report {
            self.persist_report(report);
        }

        self.history.lock().await.push(result.clone());
        self.events.publish(Event::PingResult(result));
    }

    /// Save once; a failed write is logged, announced and not retried.
    fn persist_report(&self, report: FailureReport) {
        match self.store.save_failure_report(&report) {
            Ok(true) => tracing::info!("Failure report saved: {}", report.report_id),
            Ok(false) => tracing::debug!("Failure report {} already stored", report.report_id),
            Err(e) => {
                tracing::error!("Failed to save failure report {}: {}", report.report_id, e);
                self.events.publish(Event::ReportPersistFailed {
                    report_id: report.report_id.clone(),
                    error: e.to_string(),
                });
            }
        }
        self.events.publish(Event::ReportGenerated(report));
    }
}
