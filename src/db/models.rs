//! Persisted report types.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Coarse impact class of a failure episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub const ALL: [Severity; 4] = [Severity::Critical, Severity::High, Severity::Medium, Severity::Low];

    /// Classify by failure count and duration, taking the higher tier of the two.
    pub fn classify(consecutive_failures: u32, duration: Duration) -> Self {
        let minutes = duration.num_seconds() as f64 / 60.0;
        if consecutive_failures >= 10 || minutes >= 30.0 {
            Severity::Critical
        } else if consecutive_failures >= 5 || minutes >= 10.0 {
            Severity::High
        } else if consecutive_failures >= 3 || minutes >= 5.0 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A completed failure episode that reached the threshold. Never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReport {
    pub report_id: String,
    pub target: String,
    pub target_name: String,
    pub failure_start: DateTime<Utc>,
    pub failure_end: DateTime<Utc>,
    pub duration_seconds: i64,
    pub duration_human: String,
    pub packets_lost: u32,
    pub consecutive_failures: u32,
    pub severity: Severity,
    pub generated_at: DateTime<Utc>,
}

impl FailureReport {
    /// Deterministic id from target and episode start.
    pub fn make_id(target: &str, start: DateTime<Utc>) -> String {
        format!(
            "FAIL_{}_{}",
            target.replace(['.', ':'], "_"),
            start.format("%Y%m%d_%H%M%S")
        )
    }
}

/// `H:MM:SS`, hours unbounded.
pub fn format_duration(duration: Duration) -> String {
    let total = duration.num_seconds().max(0);
    format!("{}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
}

/// Probe counts and latency for one scope (the whole day or one target).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProbeStats {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub success_rate: f64,
    pub average_latency: f64,
    pub p95_latency: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatePeriod {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

/// Daily rollup snapshot; regenerating overwrites the day's previous one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyAggregate {
    pub report_type: String,
    pub date: NaiveDate,
    pub generated_at: DateTime<Utc>,
    pub period: AggregatePeriod,
    pub summary: ProbeStats,
    pub targets: BTreeMap<String, ProbeStats>,
    pub failures: Vec<FailureReport>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportKind {
    Failure,
    Daily,
}

impl ReportKind {
    fn prefix(&self) -> &'static str {
        match self {
            ReportKind::Failure => "failures_",
            ReportKind::Daily => "daily_report_",
        }
    }

    /// Stable report name, e.g. `failures_2024-05-01.json`.
    pub fn report_name(&self, date: NaiveDate) -> String {
        format!("{}{}.json", self.prefix(), date.format("%Y-%m-%d"))
    }

    /// Inverse of [`ReportKind::report_name`].
    pub fn parse_name(name: &str) -> Option<(ReportKind, NaiveDate)> {
        let stem = name.strip_suffix(".json")?;
        [ReportKind::Daily, ReportKind::Failure]
            .into_iter()
            .find_map(|kind| {
                let date = stem.strip_prefix(kind.prefix())?;
                NaiveDate::parse_from_str(date, "%Y-%m-%d").ok().map(|d| (kind, d))
            })
    }
}

/// One entry of the report listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportInfo {
    pub name: String,
    pub kind: ReportKind,
    pub date: NaiveDate,
    pub size: i64,
    pub report_count: i64,
    pub modified: DateTime<Utc>,
}

/// Failure totals over the last N days.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureSummary {
    pub period_days: u32,
    pub total_failures: i64,
    pub targets_affected: Vec<String>,
    pub severity_count: BTreeMap<Severity, i64>,
    pub daily_breakdown: BTreeMap<NaiveDate, i64>,
}
