//! # mysql-pg-migrate
//!
//! Schema-mapping migration engine from MySQL to PostgreSQL.
//!
//! Each source table is described by a declarative [`SchemaMapping`]: which
//! source field feeds which target field, through which converter, with
//! which default. The engine pages source rows, converts them field by
//! field, and loads them with idempotent upserts (`ON CONFLICT DO NOTHING`),
//! so a migration can be rerun or resumed without duplicating rows.
//!
//! - **Row-level isolation**: a row that fails to convert or load is
//!   counted and sampled; the rest of its batch is still written
//! - **Dependency order**: parents are migrated before children, with
//!   independent tables running concurrently
//! - **Resume capability** via signed JSON state files
//!
//! ## Example
//!
//! ```rust,no_run
//! use mysql_pg_migrate::{Config, Orchestrator};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> mysql_pg_migrate::Result<()> {
//! let config = Config::load("config.yaml")?;
//! let orchestrator = Orchestrator::connect(config).await?;
//! let report = orchestrator.run(CancellationToken::new()).await?;
//! println!("Loaded {} rows", report.totals.rows_loaded);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod convert;
pub mod core;
pub mod drivers;
pub mod error;
pub mod loader;
pub mod mapping;
pub mod orchestrator;
pub mod state;
pub mod transfer;
pub mod transform;

// Re-exports for convenient access
pub use config::{Config, MigrationConfig, SourceConfig, TargetConfig};
pub use convert::{convert, ConversionError, ConverterKind, JsonFallback};
pub use core::{ColumnInfo, Row, SourceStore, SqlValue, TargetStore};
pub use drivers::{MemorySource, MemoryTarget, MysqlSource, PgTarget};
pub use error::{MigrateError, Result};
pub use loader::{BatchLoader, LoadResult, LoaderConfig, RetryPolicy};
pub use mapping::{FieldMapping, MappingRegistry, SchemaMapping};
pub use orchestrator::{
    DependencyGraph, HealthCheckResult, MigrationReport, Orchestrator, TableValidation,
};
pub use state::{MigrationState, RunStatus};
pub use transfer::{TableMigrationResult, TableMigrator, TableStatus, TransferConfig};
pub use transform::{transform, RowError};
