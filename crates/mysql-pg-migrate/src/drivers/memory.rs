//! In-memory source and target stores.
//!
//! Used by the engine tests and by `run --dry-run`, which transforms every
//! row against a [`MemoryTarget`] without touching PostgreSQL. The target
//! mimics the PostgreSQL semantics the engine relies on: primary-key
//! conflicts are no-ops, other constraint violations fail the whole
//! statement, and tables can be made unreachable to simulate connection loss.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::core::{
    BatchOutcome, ColumnInfo, RowOutcome, SequenceOutcome, SourceRow, SourceStore, SqlValue,
    TargetRow, TargetStore, TargetTableInfo,
};
use crate::error::{MigrateError, Result};

// ---------------------------------------------------------------------------
// Source
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
struct SourceTable {
    columns: Vec<ColumnInfo>,
    rows: Vec<SourceRow>,
    references: Vec<String>,
}

/// Source store backed by in-memory tables.
#[derive(Debug, Default)]
pub struct MemorySource {
    tables: BTreeMap<String, SourceTable>,
    unavailable: HashSet<String>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(
        mut self,
        name: &str,
        columns: Vec<ColumnInfo>,
        rows: Vec<SourceRow>,
    ) -> Self {
        self.tables.insert(
            name.to_string(),
            SourceTable {
                columns,
                rows,
                references: Vec::new(),
            },
        );
        self
    }

    /// Declare a foreign key from `table` to `referenced`.
    pub fn with_foreign_key(mut self, table: &str, referenced: &str) -> Self {
        if let Some(t) = self.tables.get_mut(table) {
            t.references.push(referenced.to_string());
        }
        self
    }

    /// Make every read of `table` fail with a connection error.
    pub fn with_unavailable(mut self, table: &str) -> Self {
        self.unavailable.insert(table.to_string());
        self
    }

    fn table(&self, name: &str) -> Result<&SourceTable> {
        if self.unavailable.contains(name) {
            return Err(MigrateError::pool(
                "connection refused",
                format!("reading source table {}", name),
            ));
        }
        self.tables
            .get(name)
            .ok_or_else(|| MigrateError::transfer(name, "source table does not exist"))
    }

    fn filtered<'a>(
        table: &'a SourceTable,
        filter: Option<&str>,
    ) -> Result<Vec<&'a SourceRow>> {
        let predicate = match filter {
            Some(f) => Some(EqualityFilter::parse(f)?),
            None => None,
        };
        Ok(table
            .rows
            .iter()
            .filter(|row| predicate.as_ref().map_or(true, |p| p.matches(row)))
            .collect())
    }
}

#[async_trait]
impl SourceStore for MemorySource {
    async fn list_tables(&self) -> Result<Vec<String>> {
        Ok(self.tables.keys().cloned().collect())
    }

    async fn describe(&self, table: &str) -> Result<Vec<ColumnInfo>> {
        Ok(self.table(table)?.columns.clone())
    }

    async fn referenced_tables(&self, table: &str) -> Result<Vec<String>> {
        Ok(self.table(table)?.references.clone())
    }

    async fn count(&self, table: &str, filter: Option<&str>) -> Result<i64> {
        let t = self.table(table)?;
        Ok(Self::filtered(t, filter)?.len() as i64)
    }

    async fn page_rows(
        &self,
        table: &str,
        filter: Option<&str>,
        offset: i64,
        limit: usize,
    ) -> Result<Vec<SourceRow>> {
        let t = self.table(table)?;
        Ok(Self::filtered(t, filter)?
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit)
            .cloned()
            .collect())
    }

    fn db_type(&self) -> &str {
        "memory"
    }

    async fn close(&self) {}
}

/// The subset of SQL predicates the memory source understands:
/// `col = literal [AND col = literal ...]`.
#[derive(Debug)]
struct EqualityFilter {
    terms: Vec<(String, SqlValue)>,
}

impl EqualityFilter {
    fn parse(filter: &str) -> Result<Self> {
        let mut terms = Vec::new();
        for term in split_and(filter) {
            let (col, lit) = term.split_once('=').ok_or_else(|| {
                MigrateError::Config(format!("unsupported in-memory filter: {}", filter))
            })?;
            let lit = lit.trim();
            let value = if let Some(s) = lit.strip_prefix('\'').and_then(|l| l.strip_suffix('\'')) {
                SqlValue::Text(s.to_string())
            } else if let Ok(i) = lit.parse::<i64>() {
                SqlValue::I64(i)
            } else {
                return Err(MigrateError::Config(format!(
                    "unsupported in-memory filter literal: {}",
                    lit
                )));
            };
            terms.push((col.trim().to_string(), value));
        }
        Ok(Self { terms })
    }

    fn matches(&self, row: &SourceRow) -> bool {
        self.terms.iter().all(|(col, expected)| match row.get(col) {
            Some(SqlValue::Bool(b)) => *expected == SqlValue::I64(*b as i64),
            Some(v) => v == expected,
            None => false,
        })
    }
}

fn split_and(filter: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut rest = filter;
    while let Some(pos) = rest.to_ascii_uppercase().find(" AND ") {
        parts.push(&rest[..pos]);
        rest = &rest[pos + 5..];
    }
    parts.push(rest);
    parts
}

// ---------------------------------------------------------------------------
// Target
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
struct TargetTable {
    info: TargetTableInfo,
    unique: Vec<String>,
    rows: Vec<TargetRow>,
    keys: HashSet<String>,
}

impl TargetTable {
    fn key_of(&self, row: &TargetRow) -> String {
        self.info
            .primary_key
            .iter()
            .map(|c| format!("{:?}", row.get(c).unwrap_or(&SqlValue::Null)))
            .collect::<Vec<_>>()
            .join("|")
    }

    /// Check that `row` can be stored next to `others` without a non-key violation.
    fn check_row<'a>(
        &self,
        name: &str,
        row: &TargetRow,
        others: impl Iterator<Item = &'a TargetRow> + Clone,
    ) -> Result<()> {
        for column in row.column_names() {
            if self.info.column_type(column).is_none() {
                return Err(MigrateError::transfer(
                    name,
                    format!("column \"{}\" of relation \"{}\" does not exist", column, name),
                ));
            }
        }
        for column in &self.unique {
            let Some(value) = row.get(column).filter(|v| !v.is_null()) else {
                continue;
            };
            if others.clone().any(|other| other.get(column) == Some(value)) {
                return Err(MigrateError::transfer(
                    name,
                    format!(
                        "duplicate key value violates unique constraint \"{}_{}_key\"",
                        name, column
                    ),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct TargetState {
    tables: HashMap<String, TargetTable>,
    unreachable: HashSet<String>,
    transient_failures: HashMap<String, u32>,
    write_log: Vec<String>,
}

impl TargetState {
    fn reachable(&mut self, table: &str) -> Result<()> {
        if self.unreachable.contains(table) {
            return Err(MigrateError::pool(
                "connection refused",
                format!("writing target table {}", table),
            ));
        }
        if let Some(n) = self.transient_failures.get_mut(table) {
            if *n > 0 {
                *n -= 1;
                return Err(MigrateError::pool(
                    "connection reset by peer",
                    format!("writing target table {}", table),
                ));
            }
        }
        Ok(())
    }

    fn table_mut(&mut self, table: &str) -> Result<&mut TargetTable> {
        self.tables.get_mut(table).ok_or_else(|| {
            MigrateError::transfer(table, format!("relation \"{}\" does not exist", table))
        })
    }
}

/// Target store backed by in-memory tables with PostgreSQL-like upsert semantics.
#[derive(Debug, Default)]
pub struct MemoryTarget {
    state: Mutex<TargetState>,
}

impl MemoryTarget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a table from `(column, type)` pairs and its primary key.
    pub fn with_table(
        self,
        name: &str,
        columns: &[(&str, &str)],
        primary_key: &[&str],
    ) -> Self {
        let info = TargetTableInfo {
            column_types: columns
                .iter()
                .map(|(c, t)| (c.to_string(), t.to_string()))
                .collect(),
            primary_key: primary_key.iter().map(|c| c.to_string()).collect(),
        };
        self.with_table_info(name, info)
    }

    /// Create a table from metadata read from another target store.
    pub fn with_table_info(mut self, name: &str, info: TargetTableInfo) -> Self {
        self.state.get_mut().tables.insert(
            name.to_string(),
            TargetTable {
                info,
                ..Default::default()
            },
        );
        self
    }

    /// Add a unique constraint on a non-key column.
    pub fn with_unique(mut self, table: &str, column: &str) -> Self {
        if let Some(t) = self.state.get_mut().tables.get_mut(table) {
            t.unique.push(column.to_string());
        }
        self
    }

    /// Make every operation on `table` fail with a connection error.
    pub fn with_unreachable(mut self, table: &str) -> Self {
        self.state.get_mut().unreachable.insert(table.to_string());
        self
    }

    /// Fail the next `count` write operations on `table` with a transient error.
    pub fn with_transient_failures(mut self, table: &str, count: u32) -> Self {
        self.state
            .get_mut()
            .transient_failures
            .insert(table.to_string(), count);
        self
    }

    /// Seed rows directly, bypassing constraint checks.
    pub fn with_rows(mut self, table: &str, rows: Vec<TargetRow>) -> Self {
        if let Some(t) = self.state.get_mut().tables.get_mut(table) {
            for row in rows {
                let key = t.key_of(&row);
                if t.keys.insert(key) {
                    t.rows.push(row);
                }
            }
        }
        self
    }

    /// Rows currently stored in `table`, in insertion order.
    pub async fn rows(&self, table: &str) -> Vec<TargetRow> {
        let state = self.state.lock().await;
        state
            .tables
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    /// Table names in the order of every successful write.
    pub async fn write_log(&self) -> Vec<String> {
        self.state.lock().await.write_log.clone()
    }
}

#[async_trait]
impl TargetStore for MemoryTarget {
    async fn prepare(&self, table: &str) -> Result<TargetTableInfo> {
        let mut state = self.state.lock().await;
        if state.unreachable.contains(table) {
            return Err(MigrateError::pool(
                "connection refused",
                format!("preparing target table {}", table),
            ));
        }
        let info = state.table_mut(table)?.info.clone();
        if info.primary_key.is_empty() {
            return Err(MigrateError::NoPrimaryKey(table.to_string()));
        }
        Ok(info)
    }

    async fn upsert_batch(&self, table: &str, rows: &[TargetRow]) -> Result<BatchOutcome> {
        let mut state = self.state.lock().await;
        state.reachable(table)?;
        let t = state.table_mut(table)?;

        // Validate the whole statement before applying any of it.
        let mut fresh: Vec<&TargetRow> = Vec::new();
        let mut fresh_keys = HashSet::new();
        for row in rows {
            let key = t.key_of(row);
            if t.keys.contains(&key) || !fresh_keys.insert(key) {
                continue;
            }
            t.check_row(table, row, t.rows.iter().chain(fresh.iter().copied()))?;
            fresh.push(row);
        }

        let inserted = fresh.len() as u64;
        for row in fresh {
            let key = t.key_of(row);
            t.keys.insert(key);
            t.rows.push(row.clone());
        }
        state.write_log.push(table.to_string());

        Ok(BatchOutcome {
            inserted,
            already_present: rows.len() as u64 - inserted,
        })
    }

    async fn upsert_one(&self, table: &str, row: &TargetRow) -> Result<RowOutcome> {
        let mut state = self.state.lock().await;
        state.reachable(table)?;
        let t = state.table_mut(table)?;

        let key = t.key_of(row);
        if t.keys.contains(&key) {
            return Ok(RowOutcome::AlreadyPresent);
        }
        t.check_row(table, row, t.rows.iter())?;
        t.keys.insert(key);
        t.rows.push(row.clone());
        state.write_log.push(table.to_string());
        Ok(RowOutcome::Inserted)
    }

    async fn advance_id_sequence(&self, table: &str) -> Result<SequenceOutcome> {
        let mut state = self.state.lock().await;
        state.reachable(table)?;
        let t = state.table_mut(table)?;

        let [pk] = t.info.primary_key.as_slice() else {
            return Ok(SequenceOutcome::NoOp);
        };
        let max = t
            .rows
            .iter()
            .filter_map(|r| match r.get(pk) {
                Some(SqlValue::I64(i)) => Some(*i),
                _ => None,
            })
            .max();
        Ok(match max {
            Some(value) => SequenceOutcome::Advanced {
                sequence: format!("{}_{}_seq", table, pk),
                value,
            },
            None => SequenceOutcome::NoOp,
        })
    }

    async fn row_count(&self, table: &str) -> Result<i64> {
        let mut state = self.state.lock().await;
        state.reachable(table)?;
        Ok(state.table_mut(table)?.rows.len() as i64)
    }

    fn db_type(&self) -> &str {
        "memory"
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Row;

    fn users_source() -> MemorySource {
        MemorySource::new().with_table(
            "usuarios",
            vec![
                ColumnInfo::new("id", "int").primary_key(),
                ColumnInfo::new("ativo", "tinyint(1)"),
            ],
            (1..=5)
                .map(|i| Row::new().with("id", i as i64).with("ativo", (i % 2) as i64))
                .collect(),
        )
    }

    fn users_target() -> MemoryTarget {
        MemoryTarget::new()
            .with_table(
                "users",
                &[("id", "bigint"), ("email", "text")],
                &["id"],
            )
            .with_unique("users", "email")
    }

    #[tokio::test]
    async fn test_source_paging_and_filter() {
        let source = users_source();
        assert_eq!(source.count("usuarios", None).await.unwrap(), 5);
        assert_eq!(source.count("usuarios", Some("ativo = 1")).await.unwrap(), 3);

        let page = source.page_rows("usuarios", None, 3, 10).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].get("id"), Some(&SqlValue::I64(4)));

        assert!(source.count("usuarios", Some("ativo > 1")).await.is_err());
    }

    #[tokio::test]
    async fn test_source_unavailable_is_transient() {
        let source = users_source().with_unavailable("usuarios");
        let err = source.describe("usuarios").await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_target_pk_conflict_is_noop() {
        let target = users_target();
        let rows = vec![
            Row::new().with("id", 1i64).with("email", "a@x"),
            Row::new().with("id", 2i64).with("email", "b@x"),
        ];
        let first = target.upsert_batch("users", &rows).await.unwrap();
        assert_eq!(first.inserted, 2);

        let second = target.upsert_batch("users", &rows).await.unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.already_present, 2);
        assert_eq!(target.rows("users").await.len(), 2);
    }

    #[tokio::test]
    async fn test_target_unique_violation_fails_whole_batch() {
        let target = users_target();
        let rows = vec![
            Row::new().with("id", 1i64).with("email", "a@x"),
            Row::new().with("id", 2i64).with("email", "a@x"),
        ];
        let err = target.upsert_batch("users", &rows).await.unwrap_err();
        assert!(!err.is_transient());
        assert!(target.rows("users").await.is_empty());

        assert_eq!(target.upsert_one("users", &rows[0]).await.unwrap(), RowOutcome::Inserted);
        assert!(target.upsert_one("users", &rows[1]).await.is_err());
    }

    #[tokio::test]
    async fn test_target_unknown_column_is_rejected() {
        let target = users_target();
        let row = Row::new().with("id", 1i64).with("nickname", "z");
        assert!(target.upsert_one("users", &row).await.is_err());
    }

    #[tokio::test]
    async fn test_target_sequence_advance() {
        let target = users_target().with_rows(
            "users",
            vec![
                Row::new().with("id", 3i64).with("email", "c@x"),
                Row::new().with("id", 9i64).with("email", "d@x"),
            ],
        );
        assert_eq!(
            target.advance_id_sequence("users").await.unwrap(),
            SequenceOutcome::Advanced {
                sequence: "users_id_seq".into(),
                value: 9
            }
        );
    }

    #[tokio::test]
    async fn test_target_unreachable_and_transient_failures() {
        let target = users_target()
            .with_table("products", &[("id", "bigint")], &["id"])
            .with_unreachable("products")
            .with_transient_failures("users", 1);

        assert!(target.prepare("products").await.unwrap_err().is_transient());

        let row = Row::new().with("id", 1i64);
        assert!(target.upsert_one("users", &row).await.unwrap_err().is_transient());
        assert_eq!(target.upsert_one("users", &row).await.unwrap(), RowOutcome::Inserted);
    }
}
