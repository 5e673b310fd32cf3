//! Configuration module for uptrail.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::str::FromStr;

use crate::scheduler::{
    MonitorSettings, DEFAULT_FAILURE_THRESHOLD, DEFAULT_PING_INTERVAL, DEFAULT_PROBE_TIMEOUT,
};

pub const DEFAULT_RETENTION_DAYS: u32 = 30;
pub const MAX_RETENTION_DAYS: u32 = 3650;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// HTTP port for the web server (default: 8000)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "uptrail.db")
    pub db_path: String,
    /// Initial loop settings, already clamped
    pub monitor: MonitorSettings,
    /// Report days kept before cleanup (default: 30)
    pub retention_days: u32,
    /// Start monitoring as soon as the server is up (default: true)
    pub autostart: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8000,
            db_path: "uptrail.db".to_string(),
            monitor: MonitorSettings::default(),
            retention_days: DEFAULT_RETENTION_DAYS,
            autostart: true,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `UPTRAIL_HTTP_PORT`: HTTP port (default: 8000)
    /// - `UPTRAIL_DB_PATH`: Database file path (default: "uptrail.db")
    /// - `UPTRAIL_PING_INTERVAL`: Seconds between cycles, 1-60 (default: 5)
    /// - `UPTRAIL_FAILURE_THRESHOLD`: Failures before a report, 1-10 (default: 3)
    /// - `UPTRAIL_PROBE_TIMEOUT`: Probe timeout in seconds, 1-30 (default: 3)
    /// - `UPTRAIL_RETENTION_DAYS`: Days of reports to keep, 1-3650 (default: 30)
    /// - `UPTRAIL_AUTOSTART`: `true`/`false` (default: true)
    ///
    /// Unparseable values fall back to the default.
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();

        if let Some(port) = parsed(&lookup, "UPTRAIL_HTTP_PORT") {
            cfg.http_port = port;
        }

        if let Some(db_path) = lookup("UPTRAIL_DB_PATH") {
            cfg.db_path = db_path;
        }

        cfg.monitor = MonitorSettings::new(
            parsed(&lookup, "UPTRAIL_PING_INTERVAL").unwrap_or(DEFAULT_PING_INTERVAL),
            parsed(&lookup, "UPTRAIL_FAILURE_THRESHOLD").unwrap_or(DEFAULT_FAILURE_THRESHOLD),
            parsed(&lookup, "UPTRAIL_PROBE_TIMEOUT").unwrap_or(DEFAULT_PROBE_TIMEOUT),
        );

        let retention_days: Option<u32> = parsed(&lookup, "UPTRAIL_RETENTION_DAYS");
        if let Some(days) = retention_days {
            cfg.retention_days = days.clamp(1, MAX_RETENTION_DAYS);
        }

        if let Some(autostart) = parsed(&lookup, "UPTRAIL_AUTOSTART") {
            cfg.autostart = autostart;
        }

        cfg
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Ignoring invalid {}={:?}", key, raw);
            None
        }
    }
}
