//! Run report and the results of the auxiliary commands.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::state::RunStatus;
use crate::transfer::{TableMigrationResult, TableStatus};

/// Result of a migration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationReport {
    /// Unique run identifier (kept across resumes).
    pub run_id: String,

    pub status: RunStatus,

    /// Rows were transformed and loaded into an in-memory target only.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub dry_run: bool,

    pub started_at: DateTime<Utc>,

    pub completed_at: DateTime<Utc>,

    pub duration_seconds: f64,

    /// One entry per table, in schedule order, unmapped tables last.
    pub tables: Vec<TableMigrationResult>,

    pub totals: ReportTotals,
}

/// Aggregated counts over all tables of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportTotals {
    pub tables: usize,
    pub tables_success: usize,
    pub tables_partial: usize,
    pub tables_skipped: usize,
    pub tables_fatal: usize,
    pub tables_cancelled: usize,
    pub source_rows: i64,
    pub rows_loaded: u64,
    pub rows_already_present: u64,
    pub rows_failed: u64,
}

impl ReportTotals {
    pub fn from_results(results: &[TableMigrationResult]) -> Self {
        let mut totals = Self {
            tables: results.len(),
            ..Self::default()
        };
        for r in results {
            match r.status {
                TableStatus::Success => totals.tables_success += 1,
                TableStatus::PartialSuccess => totals.tables_partial += 1,
                TableStatus::Skipped => totals.tables_skipped += 1,
                TableStatus::Fatal => totals.tables_fatal += 1,
                TableStatus::Cancelled => totals.tables_cancelled += 1,
            }
            totals.source_rows += r.total_source_rows;
            totals.rows_loaded += r.rows_loaded;
            totals.rows_already_present += r.rows_already_present;
            totals.rows_failed += r.rows_failed;
        }
        totals
    }
}

/// Overall status of a run.
///
/// Cancellation wins over failures; a run is `completed` only when every
/// table succeeded or was skipped.
pub fn overall_status(results: &[TableMigrationResult], cancelled: bool) -> RunStatus {
    if cancelled || results.iter().any(|r| r.status == TableStatus::Cancelled) {
        RunStatus::Cancelled
    } else if results
        .iter()
        .any(|r| r.status == TableStatus::Fatal || r.rows_failed > 0)
    {
        RunStatus::Failed
    } else {
        RunStatus::Completed
    }
}

impl MigrationReport {
    /// Tables that ended `Fatal` or lost rows.
    pub fn failed_tables(&self) -> Vec<&str> {
        self.tables
            .iter()
            .filter(|t| t.status == TableStatus::Fatal || t.rows_failed > 0)
            .map(|t| t.table.as_str())
            .collect()
    }

    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Source vs target row counts of one mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableValidation {
    pub table: String,
    pub target_table: String,
    pub source_rows: Option<i64>,
    pub target_rows: Option<i64>,
    pub matches: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Connectivity of both stores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub source_connected: bool,
    pub source_latency_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_error: Option<String>,
    pub target_connected: bool,
    pub target_latency_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_error: Option<String>,
    pub healthy: bool,
}
