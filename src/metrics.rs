//! Platform-health metrics aggregated over finished runs.

use crate::pipeline::{RunReport, RunStatus};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Success rate (percent) at or above which the platform is healthy.
pub const HEALTHY_SUCCESS_RATE: f64 = 90.0;
/// Success rate (percent) at or above which the platform is only degraded.
pub const WARNING_SUCCESS_RATE: f64 = 75.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Healthy,
    Warning,
    Critical,
}

impl Health {
    pub fn from_success_rate(rate: f64) -> Self {
        if rate >= HEALTHY_SUCCESS_RATE {
            Health::Healthy
        } else if rate >= WARNING_SUCCESS_RATE {
            Health::Warning
        } else {
            Health::Critical
        }
    }
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Health::Healthy => "healthy",
            Health::Warning => "warning",
            Health::Critical => "critical",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub total_runs: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Percent of runs that succeeded, rounded to one decimal. 0 with no runs.
    pub success_rate: f64,
    /// Graded on the unrounded success rate.
    pub health: Health,
    pub avg_duration_ms: u64,
    /// `"Xm Ys"` from one minute up, `"Ys"` below.
    pub avg_duration: String,
    /// Runs that finished within the hour before `now`.
    pub throughput_last_hour: usize,
}

impl RunMetrics {
    pub fn from_reports(reports: &[RunReport], now: DateTime<Utc>) -> Self {
        let total_runs = reports.len();
        let count = |status| reports.iter().filter(|r| r.status == status).count();
        let succeeded = count(RunStatus::Succeeded);
        let failed = count(RunStatus::Failed);
        let cancelled = count(RunStatus::Cancelled);

        let rate = if total_runs > 0 {
            succeeded as f64 / total_runs as f64 * 100.0
        } else {
            0.0
        };

        let avg_duration_ms = if total_runs > 0 {
            reports.iter().map(|r| r.duration_ms).sum::<u64>() / total_runs as u64
        } else {
            0
        };

        let hour_ago = now - Duration::hours(1);
        let throughput_last_hour = reports
            .iter()
            .filter(|r| r.finished_at >= hour_ago && r.finished_at <= now)
            .count();

        Self {
            total_runs,
            succeeded,
            failed,
            cancelled,
            success_rate: (rate * 10.0).round() / 10.0,
            health: Health::from_success_rate(rate),
            avg_duration_ms,
            avg_duration: format_duration(avg_duration_ms),
            throughput_last_hour,
        }
    }
}

/// `"Xm Ys"` when at least a minute, otherwise `"Ys"`. Sub-second parts are dropped.
pub fn format_duration(ms: u64) -> String {
    let seconds = ms / 1000;
    let minutes = seconds / 60;
    if minutes > 0 {
        format!("{}m {}s", minutes, seconds % 60)
    } else {
        format!("{}s", seconds)
    }
}
