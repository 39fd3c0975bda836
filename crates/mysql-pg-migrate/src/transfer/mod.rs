//! Migration of a single entity: page source rows, transform, load.
//!
//! Reading and loading are strictly sequential within a table, one page at
//! a time, so memory stays bounded by the page size. Row-level failures are
//! counted and sampled. A table ends `Fatal` when it cannot be read or
//! prepared, or when the loader gives up after repeated lost batches; every
//! unprocessed row is then counted as failed.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::value::truncate_chars;
use crate::core::{SequenceOutcome, SourceStore, TargetRow, TargetStore};
use crate::error::MigrateError;
use crate::loader::{BatchLoader, LoaderConfig, ROW_ERROR_CHARS};
use crate::mapping::SchemaMapping;
use crate::transform::{transform, SampleError, SourceHints};

/// Terminal state of one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableStatus {
    /// Every source row was loaded or already present.
    Success,
    /// The table ran to completion but some rows failed.
    PartialSuccess,
    /// Nothing to do: unmapped, empty, or completed in a previous run.
    Skipped,
    /// A connection-level failure stopped the table.
    Fatal,
    /// Interrupted by cancellation, or never started because of it.
    Cancelled,
}

impl TableStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TableStatus::Success => "success",
            TableStatus::PartialSuccess => "partial_success",
            TableStatus::Skipped => "skipped",
            TableStatus::Fatal => "fatal",
            TableStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TableStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-table counts and diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableMigrationResult {
    /// Mapping entity: the source table, or the mapping's name.
    pub table: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_table: Option<String>,
    pub total_source_rows: i64,
    /// Rows newly written to the target.
    pub rows_loaded: u64,
    /// Rows whose key was already present in the target.
    pub rows_already_present: u64,
    pub rows_failed: u64,
    pub status: TableStatus,
    /// Why the table was skipped or stopped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub sample_errors: Vec<SampleError>,
    pub duration_seconds: f64,
    /// Value the id sequence was advanced to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_advanced: Option<i64>,
}

impl TableMigrationResult {
    pub fn new(table: &str, target_table: Option<&str>) -> Self {
        Self {
            table: table.to_string(),
            target_table: target_table.map(str::to_string),
            total_source_rows: 0,
            rows_loaded: 0,
            rows_already_present: 0,
            rows_failed: 0,
            status: TableStatus::Success,
            message: None,
            sample_errors: Vec::new(),
            duration_seconds: 0.0,
            sequence_advanced: None,
        }
    }

    pub fn skipped(table: &str, reason: impl Into<String>) -> Self {
        let mut r = Self::new(table, None);
        r.status = TableStatus::Skipped;
        r.message = Some(reason.into());
        r
    }

    pub fn cancelled(table: &str, target_table: Option<&str>) -> Self {
        let mut r = Self::new(table, target_table);
        r.status = TableStatus::Cancelled;
        r.message = Some("cancelled before start".into());
        r
    }

    fn fatal(mut self, err: &MigrateError) -> Self {
        self.status = TableStatus::Fatal;
        self.message = Some(truncate_chars(&err.to_string(), ROW_ERROR_CHARS));
        self
    }

    /// Rows read from the source that reached a terminal outcome.
    pub fn rows_processed(&self) -> u64 {
        self.rows_loaded + self.rows_already_present + self.rows_failed
    }

    fn push_sample(&mut self, sample: SampleError, limit: usize) {
        if self.sample_errors.len() < limit {
            self.sample_errors.push(sample);
        }
    }

    /// Count every source row without an outcome as failed.
    fn fail_unprocessed(&mut self) {
        let total = self.total_source_rows.max(0) as u64;
        self.rows_failed += total.saturating_sub(self.rows_processed());
    }
}

/// Settings of the table migration unit.
#[derive(Debug, Clone, Copy)]
pub struct TransferConfig {
    pub page_size: usize,
    pub loader: LoaderConfig,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            loader: LoaderConfig::default(),
        }
    }
}

/// Runs one mapped entity from source to target.
pub struct TableMigrator {
    source: Arc<dyn SourceStore>,
    target: Arc<dyn TargetStore>,
    loader: BatchLoader,
    config: TransferConfig,
}

impl TableMigrator {
    pub fn new(
        source: Arc<dyn SourceStore>,
        target: Arc<dyn TargetStore>,
        config: TransferConfig,
    ) -> Self {
        let loader = BatchLoader::new(target.clone(), config.loader);
        Self {
            source,
            target,
            loader,
            config,
        }
    }

    /// Migrate one mapped entity. Never returns an error: every failure is
    /// reflected in the result's status and counts.
    pub async fn run(
        &self,
        table: &str,
        mapping: Option<&SchemaMapping>,
        cancel: &CancellationToken,
    ) -> TableMigrationResult {
        let Some(mapping) = mapping else {
            return TableMigrationResult::skipped(table, "no mapping");
        };
        if cancel.is_cancelled() {
            return TableMigrationResult::cancelled(table, Some(&mapping.target));
        }

        let started = Instant::now();
        info!("{} -> {}: starting", table, mapping.target);
        let mut result = self.migrate(mapping, cancel).await;
        result.duration_seconds = started.elapsed().as_secs_f64();

        match result.status {
            TableStatus::Fatal => error!(
                "{}: fatal after {} rows: {}",
                table,
                result.rows_processed(),
                result.message.as_deref().unwrap_or("")
            ),
            status => info!(
                "{}: {} ({} loaded, {} already present, {} failed of {}) in {:.1}s",
                table,
                status,
                result.rows_loaded,
                result.rows_already_present,
                result.rows_failed,
                result.total_source_rows,
                result.duration_seconds
            ),
        }
        result
    }

    async fn migrate(
        &self,
        mapping: &SchemaMapping,
        cancel: &CancellationToken,
    ) -> TableMigrationResult {
        let table = mapping.source.as_str();
        let filter = mapping.source_filter.as_deref();
        let retry = self.config.loader.retry;
        let sample_limit = self.config.loader.max_sample_errors;
        let mut result = TableMigrationResult::new(mapping.entity(), Some(&mapping.target));

        let columns = match retry.run("describe source", || self.source.describe(table)).await {
            Ok(c) => c,
            Err(e) => return result.fatal(&e),
        };
        let hints = SourceHints::from_columns(&columns);

        let target_info = match retry
            .run("prepare target", || self.target.prepare(&mapping.target))
            .await
        {
            Ok(info) => info,
            Err(e) => return result.fatal(&e),
        };
        let missing: Vec<&str> = mapping
            .fields
            .iter()
            .map(|f| f.target_field.as_str())
            .filter(|f| target_info.column_type(f).is_none())
            .collect();
        if !missing.is_empty() {
            let err = MigrateError::transfer(
                &mapping.target,
                format!("target columns do not exist: {}", missing.join(", ")),
            );
            return result.fatal(&err);
        }

        result.total_source_rows =
            match retry.run("count source", || self.source.count(table, filter)).await {
                Ok(n) => n,
                Err(e) => return result.fatal(&e),
            };
        if result.total_source_rows == 0 {
            result.status = TableStatus::Skipped;
            result.message = Some("no source rows".into());
            return result;
        }

        let page_size = self.config.page_size.max(1);
        let mut offset: i64 = 0;
        let mut failed_streak = 0u32;
        loop {
            if cancel.is_cancelled() {
                result.status = TableStatus::Cancelled;
                break;
            }

            let page = match retry
                .run("read source page", || {
                    self.source.page_rows(table, filter, offset, page_size)
                })
                .await
            {
                Ok(rows) => rows,
                Err(e) => {
                    result.fail_unprocessed();
                    return result.fatal(&e);
                }
            };
            if page.is_empty() {
                break;
            }
            offset += page.len() as i64;
            let last_page = page.len() < page_size;

            let mut rows: Vec<TargetRow> = Vec::with_capacity(page.len());
            for source_row in &page {
                match transform(source_row, mapping, &hints) {
                    Ok(row) => rows.push(row),
                    Err(e) => {
                        warn!("{}: {}", table, e);
                        result.rows_failed += 1;
                        result.push_sample(SampleError::from(&e), sample_limit);
                    }
                }
            }

            let load = self
                .loader
                .load(
                    &mapping.target,
                    &rows,
                    mapping.batch_size,
                    &mut failed_streak,
                    cancel,
                )
                .await;
            result.rows_loaded += load.written;
            result.rows_already_present += load.already_present;
            result.rows_failed += load.failed;
            for sample in load.errors {
                result.push_sample(sample, sample_limit);
            }
            debug!("{}: {} rows processed", table, result.rows_processed());

            if let Some(msg) = load.aborted {
                result.fail_unprocessed();
                result.status = TableStatus::Fatal;
                result.message = Some(msg);
                return result;
            }
            if load.cancelled {
                result.status = TableStatus::Cancelled;
                break;
            }
            if last_page {
                break;
            }
        }

        if result.status != TableStatus::Cancelled {
            result.status = if result.rows_failed == 0 {
                TableStatus::Success
            } else {
                TableStatus::PartialSuccess
            };
        }

        if let Some(SequenceOutcome::Advanced { value, .. }) =
            self.loader.advance_sequence(&mapping.target).await
        {
            result.sequence_advanced = Some(value);
        }
        result
    }
}
