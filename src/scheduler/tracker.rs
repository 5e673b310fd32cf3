//! Per-target failure episode state machine.
//!
//! A target with no entry is healthy. The first failed probe opens an
//! episode; the first successful probe closes it, producing a
//! [`FailureReport`] only if the episode reached the threshold.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};

use crate::db::{format_duration, FailureReport, Severity};
use crate::probe::ProbeResult;

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
pub const MIN_FAILURE_THRESHOLD: u32 = 1;
pub const MAX_FAILURE_THRESHOLD: u32 = 10;

/// A run of consecutive failed probes that is still in progress.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureEpisode {
    pub target: String,
    pub target_name: String,
    pub start_time: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub consecutive_failures: u32,
    pub packets_lost: u32,
}

#[derive(Debug)]
pub struct FailureTracker {
    threshold: u32,
    active: HashMap<String, FailureEpisode>,
}

impl Default for FailureTracker {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_THRESHOLD)
    }
}

impl FailureTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: clamp_threshold(threshold),
            active: HashMap::new(),
        }
    }

    #[cfg(test)]
    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Applies to episodes closed from now on, including ones already open.
    pub fn set_threshold(&mut self, threshold: u32) {
        self.threshold = clamp_threshold(threshold);
    }

    #[cfg(test)]
    pub fn episode(&self, target: &str) -> Option<&FailureEpisode> {
        self.active.get(target)
    }

    /// Copy of every in-flight episode.
    pub fn active(&self) -> HashMap<String, FailureEpisode> {
        self.active.clone()
    }

    /// Feed one probe result; returns the report of an episode it closed.
    pub fn observe(&mut self, result: &ProbeResult, target_name: &str) -> Option<FailureReport> {
        if !result.success {
            self.record_failure(result, target_name);
            return None;
        }

        let episode = self.active.remove(&result.target)?;
        if episode.consecutive_failures < self.threshold {
            tracing::info!(
                "Failure on {} resolved after {} probes, below threshold",
                episode.target,
                episode.consecutive_failures
            );
            return None;
        }

        let report = close_episode(episode, result.timestamp);
        tracing::error!(
            "Failure report generated: {} - {} packets lost ({})",
            report.target_name,
            report.packets_lost,
            report.severity
        );
        Some(report)
    }

    /// Drop episodes of targets outside `probed`.
    pub fn retain_targets(&mut self, probed: &HashSet<String>) {
        self.active.retain(|target, _| {
            let keep = probed.contains(target);
            if !keep {
                tracing::debug!("Discarding failure episode of unprobed target {}", target);
            }
            keep
        });
    }

    fn record_failure(&mut self, result: &ProbeResult, target_name: &str) {
        match self.active.get_mut(&result.target) {
            Some(episode) => {
                episode.consecutive_failures += 1;
                episode.packets_lost += 1;
                episode.last_seen = result.timestamp;
                if episode.consecutive_failures >= self.threshold {
                    tracing::warn!(
                        "Failure threshold reached: {} ({} consecutive failures)",
                        result.target,
                        episode.consecutive_failures
                    );
                } else {
                    tracing::warn!(
                        "Consecutive failure #{}: {}",
                        episode.consecutive_failures,
                        result.target
                    );
                }
            }
            None => {
                tracing::info!("First failure detected: {}", result.target);
                self.active.insert(
                    result.target.clone(),
                    FailureEpisode {
                        target: result.target.clone(),
                        target_name: target_name.to_string(),
                        start_time: result.timestamp,
                        last_seen: result.timestamp,
                        consecutive_failures: 1,
                        packets_lost: 1,
                    },
                );
            }
        }
    }
}

fn close_episode(episode: FailureEpisode, recovered_at: DateTime<Utc>) -> FailureReport {
    let duration = recovered_at - episode.start_time;
    FailureReport {
        report_id: FailureReport::make_id(&episode.target, episode.start_time),
        target: episode.target,
        target_name: episode.target_name,
        failure_start: episode.start_time,
        failure_end: recovered_at,
        duration_seconds: duration.num_seconds(),
        duration_human: format_duration(duration),
        packets_lost: episode.packets_lost,
        consecutive_failures: episode.consecutive_failures,
        severity: Severity::classify(episode.consecutive_failures, duration),
        generated_at: Utc::now(),
    }
}

pub fn clamp_threshold(threshold: u32) -> u32 {
    threshold.clamp(MIN_FAILURE_THRESHOLD, MAX_FAILURE_THRESHOLD)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    const TARGET: &str = "203.0.113.9";

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn fail(secs: i64) -> ProbeResult {
        ProbeResult::failure(TARGET, TARGET, "timeout", t(secs))
    }

    fn ok(secs: i64) -> ProbeResult {
        ProbeResult::success(TARGET, TARGET, 12.5, t(secs))
    }

    #[test]
    fn test_three_failures_then_success_reports_medium() {
        let mut tracker = FailureTracker::new(3);
        for i in 0..3 {
            assert!(tracker.observe(&fail(i * 5), "Edge").is_none());
        }

        let episode = tracker.episode(TARGET).unwrap();
        assert_eq!(episode.consecutive_failures, 3);
        assert_eq!(episode.packets_lost, 3);
        assert_eq!(episode.start_time, t(0));
        assert_eq!(episode.last_seen, t(10));

        let report = tracker.observe(&ok(15), "Edge").unwrap();
        assert_eq!(report.consecutive_failures, 3);
        assert_eq!(report.packets_lost, 3);
        assert_eq!(report.severity, Severity::Medium);
        assert_eq!(report.duration_seconds, 15);
        assert_eq!(report.failure_start, t(0));
        assert_eq!(report.failure_end, t(15));
        assert_eq!(report.target_name, "Edge");
        assert_eq!(report.report_id, "FAIL_203_0_113_9_20240501_090000");
        assert!(tracker.episode(TARGET).is_none());
    }

    #[test]
    fn test_below_threshold_is_discarded() {
        let mut tracker = FailureTracker::new(3);
        tracker.observe(&fail(0), "Edge");
        tracker.observe(&fail(5), "Edge");
        assert!(tracker.observe(&ok(10), "Edge").is_none());
        assert!(tracker.active().is_empty());
    }

    #[test]
    fn test_success_while_healthy_is_noop() {
        let mut tracker = FailureTracker::new(3);
        assert!(tracker.observe(&ok(0), "Edge").is_none());
        assert!(tracker.active().is_empty());
    }

    #[test]
    fn test_packets_lost_tracks_consecutive_failures() {
        let mut tracker = FailureTracker::new(10);
        for i in 0..7 {
            tracker.observe(&fail(i), "Edge");
            let ep = tracker.episode(TARGET).unwrap();
            assert_eq!(ep.packets_lost, (i + 1) as u32);
            assert_eq!(ep.packets_lost, ep.consecutive_failures);
        }
    }

    #[test]
    fn test_one_report_per_episode() {
        let mut tracker = FailureTracker::new(2);
        let mut reports = Vec::new();
        let sequence = [false, false, false, true, true, false, true];
        for (i, success) in sequence.iter().enumerate() {
            let r = if *success { ok(i as i64) } else { fail(i as i64) };
            reports.extend(tracker.observe(&r, "Edge"));
        }
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].consecutive_failures, 3);
    }

    #[test]
    fn test_long_episode_escalates_severity() {
        let mut tracker = FailureTracker::new(3);
        for i in 0..4 {
            tracker.observe(&fail(i * 300), "Edge");
        }
        // 4 failures but 15 minutes of downtime.
        let report = tracker.observe(&ok(900), "Edge").unwrap();
        assert_eq!(report.severity, Severity::High);
        assert_eq!(report.duration_human, "0:15:00");
    }

    #[test]
    fn test_threshold_is_clamped() {
        assert_eq!(FailureTracker::new(0).threshold(), 1);
        let mut tracker = FailureTracker::new(3);
        tracker.set_threshold(50);
        assert_eq!(tracker.threshold(), 10);
    }

    #[test]
    fn test_retain_targets_drops_unprobed() {
        let mut tracker = FailureTracker::new(3);
        tracker.observe(&fail(0), "Edge");
        tracker.observe(&ProbeResult::failure("192.0.2.1", "192.0.2.1", "timeout", t(0)), "Other");

        let probed: HashSet<String> = [TARGET.to_string()].into_iter().collect();
        tracker.retain_targets(&probed);
        assert!(tracker.episode(TARGET).is_some());
        assert!(tracker.episode("192.0.2.1").is_none());
    }
}
