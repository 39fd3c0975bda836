//! Configuration type definitions.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::mapping::SchemaMapping;

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Source database configuration (MySQL).
    pub source: SourceConfig,

    /// Target database configuration (PostgreSQL).
    pub target: TargetConfig,

    /// Migration behavior configuration.
    #[serde(default)]
    pub migration: MigrationConfig,

    /// One mapping per migrated entity.
    #[serde(default)]
    pub mappings: Vec<SchemaMapping>,
}

/// Source database (MySQL) configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Database type (always "mysql").
    #[serde(default = "default_mysql")]
    pub r#type: String,

    pub host: String,

    /// Database port (default: 3306).
    #[serde(default = "default_mysql_port")]
    pub port: u16,

    pub database: String,

    pub user: String,

    #[serde(default)]
    pub password: String,

    /// SSL mode: disabled, preferred, required, verify_ca, verify_identity (default: preferred).
    #[serde(default = "default_preferred")]
    pub ssl_mode: String,
}

impl fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceConfig")
            .field("type", &self.r#type)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("ssl_mode", &self.ssl_mode)
            .finish()
    }
}

/// Target database (PostgreSQL) configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Database type (always "postgres").
    #[serde(default = "default_postgres")]
    pub r#type: String,

    pub host: String,

    /// Database port (default: 5432).
    #[serde(default = "default_pg_port")]
    pub port: u16,

    pub database: String,

    pub user: String,

    #[serde(default)]
    pub password: String,

    /// Target schema (default: "public").
    #[serde(default = "default_public_schema")]
    pub schema: String,

    /// SSL mode (default: "require").
    #[serde(default = "default_require")]
    pub ssl_mode: String,
}

impl fmt::Debug for TargetConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetConfig")
            .field("type", &self.r#type)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("schema", &self.schema)
            .field("ssl_mode", &self.ssl_mode)
            .finish()
    }
}

/// Migration behavior configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Tables migrated concurrently (default: 1, sequential).
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Rows per upsert statement (default: 100).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Rows read from the source per page (default: 100).
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Retries of a transient store failure (default: 3).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// First retry delay, doubled on each retry (default: 200 ms).
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Deadline of one store round trip (default: 30 s).
    #[serde(default = "default_round_trip_timeout_secs")]
    pub round_trip_timeout_secs: u64,

    /// Failed rows detailed per table in the report (default: 10).
    #[serde(default = "default_max_sample_errors")]
    pub max_sample_errors: usize,

    /// Tables to include (exact names or `*` wildcards). Empty means all.
    #[serde(default)]
    pub include_tables: Vec<String>,

    /// Tables to exclude (exact names or `*` wildcards).
    #[serde(default)]
    pub exclude_tables: Vec<String>,

    /// Merge source foreign keys into the dependency order (default: false).
    #[serde(default)]
    pub use_foreign_keys: bool,

    /// Maximum MySQL connections (default: workers + 2).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_mysql_connections: Option<usize>,

    /// Maximum PostgreSQL connections (default: workers + 2).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pg_connections: Option<usize>,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            batch_size: default_batch_size(),
            page_size: default_page_size(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            round_trip_timeout_secs: default_round_trip_timeout_secs(),
            max_sample_errors: default_max_sample_errors(),
            include_tables: Vec::new(),
            exclude_tables: Vec::new(),
            use_foreign_keys: false,
            max_mysql_connections: None,
            max_pg_connections: None,
        }
    }
}

impl MigrationConfig {
    pub fn get_max_mysql_connections(&self) -> usize {
        self.max_mysql_connections.unwrap_or(self.workers + 2)
    }

    pub fn get_max_pg_connections(&self) -> usize {
        self.max_pg_connections.unwrap_or(self.workers + 2)
    }

    /// Whether a source table passes the include/exclude filters.
    pub fn table_selected(&self, table: &str) -> bool {
        let included = self.include_tables.is_empty()
            || self.include_tables.iter().any(|p| wildcard_match(p, table));
        included && !self.exclude_tables.iter().any(|p| wildcard_match(p, table))
    }

    /// Whether a mapping is scheduled. Patterns match its source table or its name.
    pub fn mapping_selected(&self, mapping: &SchemaMapping) -> bool {
        let matches = |p: &String| {
            wildcard_match(p, &mapping.source) || wildcard_match(p, mapping.entity())
        };
        let included = self.include_tables.is_empty() || self.include_tables.iter().any(matches);
        included && !self.exclude_tables.iter().any(matches)
    }
}

/// Case-insensitive match where `*` stands for any run of characters.
pub(crate) fn wildcard_match(pattern: &str, name: &str) -> bool {
    let pattern = pattern.to_lowercase();
    let name = name.to_lowercase();
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == name;
    }

    let (first, last) = (parts[0], parts[parts.len() - 1]);
    if !name.starts_with(first) || !name.ends_with(last) || name.len() < first.len() + last.len()
    {
        return false;
    }
    let mut rest = &name[first.len()..name.len() - last.len()];
    for part in &parts[1..parts.len() - 1] {
        match rest.find(part) {
            Some(pos) => rest = &rest[pos + part.len()..],
            None => return false,
        }
    }
    true
}

// Default value functions for serde
fn default_mysql() -> String {
    "mysql".to_string()
}

fn default_postgres() -> String {
    "postgres".to_string()
}

fn default_mysql_port() -> u16 {
    3306
}

fn default_pg_port() -> u16 {
    5432
}

fn default_public_schema() -> String {
    "public".to_string()
}

fn default_preferred() -> String {
    "preferred".to_string()
}

fn default_require() -> String {
    "require".to_string()
}

fn default_workers() -> usize {
    1
}

fn default_batch_size() -> usize {
    100
}

fn default_page_size() -> usize {
    100
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    200
}

fn default_round_trip_timeout_secs() -> u64 {
    30
}

fn default_max_sample_errors() -> usize {
    10
}
