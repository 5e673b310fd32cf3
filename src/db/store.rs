//! SQLite-backed report store.
//!
//! Each UTC calendar day owns one append-only collection of failure reports
//! and at most one daily aggregate snapshot. Both are addressed by the names
//! produced by [`ReportKind::report_name`].

use chrono::{DateTime, Days, Duration as ChronoDuration, NaiveDate, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use super::aggregate::summarize_day;
use super::models::*;
use crate::probe::ProbeResult;

const DB_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";
const DAY_FORMAT: &str = "%Y-%m-%d";

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("report {0} not found")]
    NotFound(String),
    #[error("database lock poisoned")]
    Poisoned,
}

/// Thread-safe report store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the store at `path`.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| DbError::Migration(format!("Migration 1 failed: {}", e)))?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    // --- Failure reports ---

    /// Append a failure report to the collection of the day it was generated.
    ///
    /// Returns `false` when a report with the same id already exists.
    pub fn save_failure_report(&self, report: &FailureReport) -> Result<bool, DbError> {
        let body = serde_json::to_string(report)?;
        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO failure_reports (report_id, day, target, severity, body, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                report.report_id,
                report.generated_at.format(DAY_FORMAT).to_string(),
                report.target,
                report.severity.as_str(),
                body,
                report.generated_at.format(DB_TIME_FORMAT).to_string(),
            ],
        )?;
        Ok(inserted > 0)
    }

    /// Failure reports of one day in insertion order.
    pub fn failures_for_day(&self, day: NaiveDate) -> Result<Vec<FailureReport>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT body FROM failure_reports WHERE day = ?1 ORDER BY seq ASC")?;
        let bodies = stmt
            .query_map(params![day.format(DAY_FORMAT).to_string()], |row| row.get::<_, String>(0))?
            .collect::<SqlResult<Vec<_>>>()?;

        bodies
            .iter()
            .map(|b| serde_json::from_str(b).map_err(DbError::from))
            .collect()
    }

    // --- Daily aggregates ---

    /// Build and store today's aggregate from `history`; returns its report name.
    pub fn generate_daily_aggregate(&self, history: &[ProbeResult]) -> Result<String, DbError> {
        let now = Utc::now();
        let aggregate = self.generate_daily_aggregate_for(now.date_naive(), history, now)?;
        Ok(ReportKind::Daily.report_name(aggregate.date))
    }

    /// Build the aggregate for `day` from the probes in `history` that fall
    /// on that day, replacing any earlier snapshot for the day.
    pub fn generate_daily_aggregate_for(
        &self,
        day: NaiveDate,
        history: &[ProbeResult],
        generated_at: DateTime<Utc>,
    ) -> Result<DailyAggregate, DbError> {
        let todays: Vec<&ProbeResult> = history
            .iter()
            .filter(|r| r.timestamp.date_naive() == day)
            .collect();
        let (summary, targets) = summarize_day(&todays);

        let aggregate = DailyAggregate {
            report_type: "daily".to_string(),
            date: day,
            generated_at,
            period: AggregatePeriod {
                start: todays.first().map(|r| r.timestamp),
                end: todays.last().map(|r| r.timestamp),
            },
            summary,
            targets,
            failures: self.failures_for_day(day)?,
        };

        let body = serde_json::to_string(&aggregate)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO daily_aggregates (day, body, generated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(day) DO UPDATE SET body=excluded.body, generated_at=excluded.generated_at",
            params![
                day.format(DAY_FORMAT).to_string(),
                body,
                generated_at.format(DB_TIME_FORMAT).to_string(),
            ],
        )?;

        tracing::info!(
            "Daily aggregate for {}: {} probes, {}% success, {} failures",
            day,
            aggregate.summary.total,
            aggregate.summary.success_rate,
            aggregate.failures.len()
        );
        Ok(aggregate)
    }

    // --- Listing and retrieval ---

    /// All stored reports, most recently modified first.
    pub fn list_reports(&self) -> Result<Vec<ReportInfo>, DbError> {
        let conn = self.conn()?;
        let mut reports = Vec::new();

        let mut stmt = conn.prepare(
            "SELECT day, COUNT(*), SUM(LENGTH(body)), MAX(created_at) FROM failure_reports GROUP BY day",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        for (day, count, size, modified) in rows {
            if let Some(info) = report_info(ReportKind::Failure, &day, count, size, &modified) {
                reports.push(info);
            }
        }

        let mut stmt = conn.prepare("SELECT day, LENGTH(body), generated_at FROM daily_aggregates")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        for (day, size, modified) in rows {
            if let Some(info) = report_info(ReportKind::Daily, &day, 1, size, &modified) {
                reports.push(info);
            }
        }

        reports.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| a.name.cmp(&b.name)));
        Ok(reports)
    }

    /// Body of the report called `name`.
    ///
    /// A failure collection is returned as a JSON array in insertion order.
    pub fn get_report_content(&self, name: &str) -> Result<serde_json::Value, DbError> {
        let not_found = || DbError::NotFound(name.to_string());
        let (kind, day) = ReportKind::parse_name(name).ok_or_else(not_found)?;

        match kind {
            ReportKind::Failure => {
                let reports = self.failures_for_day(day)?;
                if reports.is_empty() {
                    return Err(not_found());
                }
                Ok(serde_json::to_value(reports)?)
            }
            ReportKind::Daily => {
                let conn = self.conn()?;
                let body: Option<String> = conn
                    .query_row(
                        "SELECT body FROM daily_aggregates WHERE day = ?1",
                        params![day.format(DAY_FORMAT).to_string()],
                        |row| row.get(0),
                    )
                    .optional()?;
                let body = body.ok_or_else(not_found)?;
                Ok(serde_json::from_str(&body)?)
            }
        }
    }

    // --- Retention ---

    /// Delete whole days older than `days` days before today.
    ///
    /// A window reaching past the earliest representable date removes nothing.
    pub fn cleanup_older_than(&self, days: u32) -> Result<usize, DbError> {
        match Utc::now().date_naive().checked_sub_days(Days::new(u64::from(days))) {
            Some(cutoff) => self.cleanup_before(cutoff),
            None => Ok(0),
        }
    }

    /// Delete every day strictly before `cutoff`. Returns the number of
    /// named reports removed.
    pub fn cleanup_before(&self, cutoff: NaiveDate) -> Result<usize, DbError> {
        let cutoff = cutoff.format(DAY_FORMAT).to_string();
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;

        let failure_days: i64 = tx.query_row(
            "SELECT COUNT(DISTINCT day) FROM failure_reports WHERE day < ?1",
            params![cutoff],
            |row| row.get(0),
        )?;
        tx.execute("DELETE FROM failure_reports WHERE day < ?1", params![cutoff])?;
        let aggregates = tx.execute("DELETE FROM daily_aggregates WHERE day < ?1", params![cutoff])?;
        tx.commit()?;

        let removed = failure_days as usize + aggregates;
        if removed > 0 {
            tracing::info!("Removed {} reports older than {}", removed, cutoff);
        }
        Ok(removed)
    }

    // --- Summary ---

    /// Failure totals for the last `days` days including today.
    pub fn failure_summary(&self, days: u32) -> Result<FailureSummary, DbError> {
        self.failure_summary_at(days, Utc::now().date_naive())
    }

    pub fn failure_summary_at(&self, days: u32, today: NaiveDate) -> Result<FailureSummary, DbError> {
        let days = days.clamp(1, 366);
        let first = today - ChronoDuration::days(i64::from(days) - 1);

        let mut daily_breakdown: BTreeMap<NaiveDate, i64> =
            first.iter_days().take(days as usize).map(|d| (d, 0)).collect();
        let mut severity_count: BTreeMap<Severity, i64> = Severity::ALL.iter().map(|s| (*s, 0)).collect();
        let mut targets = BTreeSet::new();
        let mut total_failures = 0;

        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT day, target, body FROM failure_reports WHERE day >= ?1 AND day <= ?2",
        )?;
        let rows = stmt
            .query_map(
                params![first.format(DAY_FORMAT).to_string(), today.format(DAY_FORMAT).to_string()],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?)),
            )?
            .collect::<SqlResult<Vec<_>>>()?;

        for (day, target, body) in rows {
            let report: FailureReport = serde_json::from_str(&body)?;
            if let Ok(day) = NaiveDate::parse_from_str(&day, DAY_FORMAT) {
                *daily_breakdown.entry(day).or_insert(0) += 1;
            }
            *severity_count.entry(report.severity).or_insert(0) += 1;
            targets.insert(target);
            total_failures += 1;
        }

        Ok(FailureSummary {
            period_days: days,
            total_failures,
            targets_affected: targets.into_iter().collect(),
            severity_count,
            daily_breakdown,
        })
    }
}

fn report_info(kind: ReportKind, day: &str, count: i64, size: i64, modified: &str) -> Option<ReportInfo> {
    let date = NaiveDate::parse_from_str(day, DAY_FORMAT).ok()?;
    Some(ReportInfo {
        name: kind.report_name(date),
        kind,
        date,
        size,
        report_count: count,
        modified: parse_db_time(modified)?,
    })
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [DB_TIME_FORMAT, "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.with_timezone(&Utc))
}
