//! Connector traits for the source and target stores.
//!
//! The engine never issues queries of its own; everything it needs from
//! either store goes through one of these shapes:
//!
//! - [`SourceStore`]: list, describe, count and page rows of source tables
//! - [`TargetStore`]: idempotent upserts and id-sequence maintenance
//!
//! Implementations live in `drivers` (MySQL, PostgreSQL, in-memory).

use async_trait::async_trait;

use crate::error::Result;

use super::row::{SourceRow, TargetRow};
use super::schema::ColumnInfo;

/// Read access to the source store.
#[async_trait]
pub trait SourceStore: Send + Sync {
    /// List all base tables.
    async fn list_tables(&self) -> Result<Vec<String>>;

    /// Describe the columns of a table, in ordinal order.
    async fn describe(&self, table: &str) -> Result<Vec<ColumnInfo>>;

    /// Tables referenced by foreign keys of `table`.
    async fn referenced_tables(&self, _table: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    /// Count the rows of a table, optionally restricted by a SQL predicate.
    async fn count(&self, table: &str, filter: Option<&str>) -> Result<i64>;

    /// Read one page of rows in a stable order (primary key when there is one).
    async fn page_rows(
        &self,
        table: &str,
        filter: Option<&str>,
        offset: i64,
        limit: usize,
    ) -> Result<Vec<SourceRow>>;

    /// Round-trip check used by `health-check`.
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    /// Get the store type identifier (e.g., "mysql").
    fn db_type(&self) -> &str;

    /// Close the connection pool.
    async fn close(&self);
}

/// Metadata of a target table needed to write into it.
#[derive(Debug, Clone, Default)]
pub struct TargetTableInfo {
    /// Column name -> declared type (as accepted by a SQL cast).
    pub column_types: Vec<(String, String)>,
    /// Primary key columns, in key order.
    pub primary_key: Vec<String>,
}

impl TargetTableInfo {
    pub fn column_type(&self, name: &str) -> Option<&str> {
        self.column_types
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, t)| t.as_str())
    }
}

/// Result of one batch upsert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Rows newly written.
    pub inserted: u64,
    /// Rows whose primary key already existed (no-op).
    pub already_present: u64,
}

/// Result of a single-row upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowOutcome {
    Inserted,
    AlreadyPresent,
}

/// Result of advancing a table's id generator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SequenceOutcome {
    /// The sequence now returns values above `value`.
    Advanced { sequence: String, value: i64 },
    /// The table has no numeric id generator.
    NoOp,
}

/// Write access to the target store.
///
/// Upserts are idempotent: a row whose primary key already exists is a
/// no-op, never an error and never a duplicate.
#[async_trait]
pub trait TargetStore: Send + Sync {
    /// Load (and cache) the column types and primary key of a target table.
    ///
    /// Fails when the target is unreachable or the table does not exist.
    async fn prepare(&self, table: &str) -> Result<TargetTableInfo>;

    /// Insert a batch of rows as one statement; PK conflicts are skipped.
    ///
    /// Any other violation fails the whole batch.
    async fn upsert_batch(&self, table: &str, rows: &[TargetRow]) -> Result<BatchOutcome>;

    /// Insert a single row; a PK conflict is reported as [`RowOutcome::AlreadyPresent`].
    async fn upsert_one(&self, table: &str, row: &TargetRow) -> Result<RowOutcome>;

    /// Advance the table's id sequence to `max(id)`.
    async fn advance_id_sequence(&self, table: &str) -> Result<SequenceOutcome>;

    /// Count rows in a target table.
    async fn row_count(&self, table: &str) -> Result<i64>;

    /// Round-trip check used by `health-check`.
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    /// Get the store type identifier (e.g., "postgres").
    fn db_type(&self) -> &str;

    /// Close the connection pool.
    async fn close(&self);
}
