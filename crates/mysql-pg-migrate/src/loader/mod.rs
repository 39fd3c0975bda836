//! Idempotent batch loading into the target store.
//!
//! Rows are written in bounded batches with `ON CONFLICT DO NOTHING`
//! semantics. When a batch fails for a data reason (constraint, bad value)
//! that batch alone is replayed row by row so only the offending rows are
//! lost. Connection-level failures are retried with backoff; a batch whose
//! failure persists is counted as failed and loading moves on. Only after
//! [`MAX_CONSECUTIVE_FAILED_BATCHES`] such batches in a row is the table
//! abandoned.

mod retry;

pub use retry::RetryPolicy;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::value::truncate_chars;
use crate::core::{RowOutcome, SequenceOutcome, TargetRow, TargetStore};
use crate::transform::SampleError;

/// Maximum characters of a store error message kept per failed row.
pub const ROW_ERROR_CHARS: usize = 200;

/// Batches in a row lost to persistent connection failures before a table is abandoned.
pub const MAX_CONSECUTIVE_FAILED_BATCHES: u32 = 3;

/// Tunables of the loader.
#[derive(Debug, Clone, Copy)]
pub struct LoaderConfig {
    pub batch_size: usize,
    pub retry: RetryPolicy,
    /// Failed rows whose details are kept; all failures are still counted.
    pub max_sample_errors: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            retry: RetryPolicy::default(),
            max_sample_errors: 10,
        }
    }
}

/// Outcome of loading a set of rows into one table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadResult {
    /// Rows newly written.
    pub written: u64,
    /// Rows whose key already existed in the target.
    pub already_present: u64,
    /// Rows that could not be written.
    pub failed: u64,
    /// Bounded sample of row failures.
    pub errors: Vec<SampleError>,
    /// Set when repeated connection-level failures stopped the load.
    pub aborted: Option<String>,
    /// Set when cancellation stopped the load between batches.
    pub cancelled: bool,
}

impl LoadResult {
    fn record(&mut self, rows: u64, sample: SampleError, limit: usize) {
        self.failed += rows;
        if self.errors.len() < limit {
            self.errors.push(sample);
        }
    }
}

fn row_key(row: &TargetRow) -> Option<String> {
    row.values().next().map(|v| v.excerpt(64))
}

/// Writes transformed rows into one target store.
pub struct BatchLoader {
    target: Arc<dyn TargetStore>,
    config: LoaderConfig,
}

impl BatchLoader {
    pub fn new(target: Arc<dyn TargetStore>, config: LoaderConfig) -> Self {
        Self { target, config }
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Load `rows` into `table` in batches of `batch_size` (the configured size when `None`).
    ///
    /// `failed_streak` counts batches in a row lost to connection failures.
    /// It is carried across calls so a table loaded page by page is abandoned
    /// once the streak reaches [`MAX_CONSECUTIVE_FAILED_BATCHES`].
    pub async fn load(
        &self,
        table: &str,
        rows: &[TargetRow],
        batch_size: Option<usize>,
        failed_streak: &mut u32,
        cancel: &CancellationToken,
    ) -> LoadResult {
        let batch_size = batch_size.unwrap_or(self.config.batch_size).max(1);
        let mut result = LoadResult::default();
        let mut done = 0usize;

        for batch in rows.chunks(batch_size) {
            if cancel.is_cancelled() {
                result.cancelled = true;
                break;
            }

            let outcome = self
                .config
                .retry
                .run("upsert batch", || self.target.upsert_batch(table, batch))
                .await;

            match outcome {
                Ok(o) => {
                    debug!(
                        "{}: batch of {} rows, {} written, {} already present",
                        table,
                        batch.len(),
                        o.inserted,
                        o.already_present
                    );
                    *failed_streak = 0;
                    result.written += o.inserted;
                    result.already_present += o.already_present;
                }
                Err(e) if e.is_transient() => {
                    warn!("{}: batch of {} rows lost: {}", table, batch.len(), e);
                    let message = truncate_chars(&e.to_string(), ROW_ERROR_CHARS);
                    result.record(
                        batch.len() as u64,
                        SampleError {
                            row_key: batch.first().and_then(row_key),
                            field: None,
                            message: format!("batch of {} rows failed: {}", batch.len(), message),
                        },
                        self.config.max_sample_errors,
                    );
                    *failed_streak += 1;
                    if *failed_streak >= MAX_CONSECUTIVE_FAILED_BATCHES {
                        result.failed += (rows.len() - done - batch.len()) as u64;
                        result.aborted = Some(message);
                        return result;
                    }
                }
                Err(e) => {
                    warn!(
                        "{}: batch of {} rows rejected ({}), retrying row by row",
                        table,
                        batch.len(),
                        e
                    );
                    if let Some(handled) =
                        self.load_rows(table, batch, failed_streak, &mut result).await
                    {
                        result.failed += (rows.len() - done - handled) as u64;
                        return result;
                    }
                }
            }
            done += batch.len();
        }

        result
    }

    /// Replay a rejected batch row by row.
    ///
    /// Returns the number of rows handled when the failure streak abandoned
    /// the table.
    async fn load_rows(
        &self,
        table: &str,
        batch: &[TargetRow],
        failed_streak: &mut u32,
        result: &mut LoadResult,
    ) -> Option<usize> {
        for (i, row) in batch.iter().enumerate() {
            let outcome = self
                .config
                .retry
                .run("upsert row", || self.target.upsert_one(table, row))
                .await;

            let err = match outcome {
                Ok(RowOutcome::Inserted) => {
                    *failed_streak = 0;
                    result.written += 1;
                    continue;
                }
                Ok(RowOutcome::AlreadyPresent) => {
                    *failed_streak = 0;
                    result.already_present += 1;
                    continue;
                }
                Err(e) => e,
            };

            let key = row_key(row);
            warn!(
                "{}: row {} failed: {}",
                table,
                key.as_deref().unwrap_or("?"),
                err
            );
            let message = truncate_chars(&err.to_string(), ROW_ERROR_CHARS);
            result.record(
                1,
                SampleError {
                    row_key: key,
                    field: None,
                    message: message.clone(),
                },
                self.config.max_sample_errors,
            );

            if !err.is_transient() {
                *failed_streak = 0;
                continue;
            }
            *failed_streak += 1;
            if *failed_streak >= MAX_CONSECUTIVE_FAILED_BATCHES {
                result.aborted = Some(message);
                return Some(i + 1);
            }
        }
        None
    }

    /// Advance the table's id sequence past the loaded keys.
    ///
    /// Tables without a sequence and failures are not errors.
    pub async fn advance_sequence(&self, table: &str) -> Option<SequenceOutcome> {
        match self
            .config
            .retry
            .run("advance sequence", || self.target.advance_id_sequence(table))
            .await
        {
            Ok(outcome) => {
                if let SequenceOutcome::Advanced { sequence, value } = &outcome {
                    debug!("{}: sequence {} set to {}", table, sequence, value);
                }
                Some(outcome)
            }
            Err(e) => {
                debug!("{}: sequence not advanced: {}", table, e);
                None
            }
        }
    }
}
