//! File-based run state used to resume an interrupted migration.
//!
//! The state file is JSON, written atomically (temp file + rename) and
//! signed with HMAC-SHA256 keyed by the config hash, so a state file can
//! only be resumed with the configuration that produced it.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::warn;

use crate::error::{MigrateError, Result};
use crate::transfer::{TableMigrationResult, TableStatus};

type HmacSha256 = Hmac<Sha256>;

/// Persisted state of a migration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationState {
    pub run_id: String,

    /// SHA256 hash of the configuration.
    pub config_hash: String,

    pub started_at: DateTime<Utc>,

    pub status: RunStatus,

    /// Per-table state, keyed by mapping entity. Ordered so the signed
    /// serialization is the same on every save and load.
    pub tables: BTreeMap<String, TableState>,

    pub completed_at: Option<DateTime<Utc>>,

    /// HMAC-SHA256 over the serialized state without this field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hmac: Option<String>,
}

/// Overall run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

/// Last known outcome of one table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableState {
    pub status: TableStatus,
    pub rows_total: i64,
    pub rows_loaded: u64,
    #[serde(default)]
    pub rows_already_present: u64,
    pub rows_failed: u64,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl From<&TableMigrationResult> for TableState {
    fn from(r: &TableMigrationResult) -> Self {
        Self {
            status: r.status,
            rows_total: r.total_source_rows,
            rows_loaded: r.rows_loaded,
            rows_already_present: r.rows_already_present,
            rows_failed: r.rows_failed,
            completed_at: Some(Utc::now()),
            error: r.message.clone().filter(|_| r.status == TableStatus::Fatal),
        }
    }
}

impl MigrationState {
    pub fn new(run_id: String, config_hash: String) -> Self {
        Self {
            run_id,
            config_hash,
            started_at: Utc::now(),
            status: RunStatus::Running,
            tables: BTreeMap::new(),
            completed_at: None,
            hmac: None,
        }
    }

    fn compute_hmac(&self) -> Result<String> {
        let mut unsigned = self.clone();
        unsigned.hmac = None;

        let content = serde_json::to_string(&unsigned)
            .map_err(|e| MigrateError::State(format!("failed to serialize state: {}", e)))?;

        let mut mac = HmacSha256::new_from_slice(self.config_hash.as_bytes())
            .map_err(|e| MigrateError::State(format!("failed to create HMAC: {}", e)))?;
        mac.update(content.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Load state from a file, verifying its signature when present.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let state: Self = serde_json::from_str(&content)?;

        match &state.hmac {
            Some(stored) => {
                if *stored != state.compute_hmac()? {
                    return Err(MigrateError::State(
                        "integrity check failed: HMAC mismatch".into(),
                    ));
                }
            }
            None => warn!("State file has no HMAC signature, integrity cannot be verified"),
        }
        Ok(state)
    }

    /// Sign and save state atomically.
    pub fn save<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        self.hmac = Some(self.compute_hmac()?);

        let content = serde_json::to_string_pretty(self)?;
        let temp_path = path.with_extension("tmp");
        std::fs::write(&temp_path, &content)?;
        std::fs::rename(&temp_path, path)?;
        Ok(())
    }

    /// Resume is only allowed with the configuration that produced the state.
    pub fn validate_config(&self, config_hash: &str) -> Result<()> {
        if self.config_hash != config_hash {
            return Err(MigrateError::ConfigChanged);
        }
        Ok(())
    }

    pub fn record(&mut self, result: &TableMigrationResult) {
        self.tables
            .insert(result.table.clone(), TableState::from(result));
    }

    /// Whether a table fully succeeded in a previous run.
    pub fn is_table_completed(&self, table: &str) -> bool {
        self.tables
            .get(table)
            .map(|t| t.status == TableStatus::Success)
            .unwrap_or(false)
    }

    pub fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.completed_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn result(table: &str, status: TableStatus) -> TableMigrationResult {
        let mut r = TableMigrationResult::new(table, Some(table));
        r.status = status;
        r.total_source_rows = 10;
        r.rows_loaded = 10;
        r
    }

    #[test]
    fn test_state_save_load() {
        let mut state = MigrationState::new("run-1".into(), "abc123".into());
        state.record(&result("usuarios", TableStatus::Success));

        let file = NamedTempFile::new().unwrap();
        state.save(file.path()).unwrap();

        let loaded = MigrationState::load(file.path()).unwrap();
        assert_eq!(loaded.run_id, "run-1");
        assert!(loaded.is_table_completed("usuarios"));
        assert!(!loaded.is_table_completed("pedidos"));
    }

    #[test]
    fn test_many_tables_survive_repeated_save_load() {
        let names = ["usuarios", "pedidos", "produtos", "clientes", "estoque", "faturas"];
        let mut state = MigrationState::new("run-1".into(), "abc".into());
        for name in names {
            state.record(&result(name, TableStatus::Success));
        }
        let file = NamedTempFile::new().unwrap();

        for _ in 0..20 {
            state.save(file.path()).unwrap();
            state = MigrationState::load(file.path()).unwrap();
            for name in names {
                assert!(state.is_table_completed(name), "{} not completed", name);
            }
        }
    }

    #[test]
    fn test_partial_success_is_not_completed() {
        let mut state = MigrationState::new("run-1".into(), "abc".into());
        state.record(&result("pedidos", TableStatus::PartialSuccess));
        assert!(!state.is_table_completed("pedidos"));
    }

    #[test]
    fn test_config_validation() {
        let state = MigrationState::new("run-1".into(), "abc123".into());
        assert!(state.validate_config("abc123").is_ok());
        assert!(matches!(
            state.validate_config("different"),
            Err(MigrateError::ConfigChanged)
        ));
    }

    #[test]
    fn test_tampered_state_is_rejected() {
        let mut state = MigrationState::new("run-1".into(), "abc".into());
        state.record(&result("usuarios", TableStatus::PartialSuccess));
        let file = NamedTempFile::new().unwrap();
        state.save(file.path()).unwrap();

        let content = std::fs::read_to_string(file.path()).unwrap();
        let tampered = content.replace("partial_success", "success");
        std::fs::write(file.path(), tampered).unwrap();

        assert!(matches!(
            MigrationState::load(file.path()),
            Err(MigrateError::State(_))
        ));
    }

    #[test]
    fn test_fatal_error_is_kept() {
        let mut r = result("produtos", TableStatus::Fatal);
        r.message = Some("connection refused".into());
        let mut state = MigrationState::new("run-1".into(), "abc".into());
        state.record(&r);
        assert_eq!(
            state.tables["produtos"].error.as_deref(),
            Some("connection refused")
        );
    }
}
