//! Error types for the migration library.

use thiserror::Error;

/// Process exit codes used by the CLI.
pub const EXIT_OK: u8 = 0;
pub const EXIT_CONFIG_ERROR: u8 = 1;
pub const EXIT_MIGRATION_FAILED: u8 = 2;
pub const EXIT_CONNECTION_ERROR: u8 = 3;
pub const EXIT_CANCELLED: u8 = 4;
pub const EXIT_IO_ERROR: u8 = 7;

/// Main error type for migration operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Configuration error (invalid YAML, bad mapping, missing fields, etc.)
    ///
    /// This is the only error that aborts a whole run.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Source database connection or query error
    #[error("Source database error: {0}")]
    Source(#[from] sqlx::Error),

    /// Target database connection or query error
    #[error("Target database error: {0}")]
    Target(#[from] tokio_postgres::Error),

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// A single store round trip exceeded its deadline
    #[error("Timed out after {seconds}s during {operation}")]
    Timeout { operation: String, seconds: u64 },

    /// Data transfer failed for a specific table
    #[error("Transfer failed for table {table}: {message}")]
    Transfer { table: String, message: String },

    /// Target table has no primary key (required for idempotent upsert)
    #[error("Table {0} has no primary key - idempotent upsert requires one")]
    NoPrimaryKey(String),

    /// State file error
    #[error("State file error: {0}")]
    State(String),

    /// Config hash mismatch on resume
    #[error("Config has changed since last run - cannot resume. Use `run` to start fresh.")]
    ConfigChanged,

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Migration was cancelled (SIGINT, deadline, etc.)
    #[error("Migration cancelled")]
    Cancelled,
}

impl MigrateError {
    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl std::fmt::Display, context: impl Into<String>) -> Self {
        MigrateError::Pool {
            message: message.to_string(),
            context: context.into(),
        }
    }

    /// Create a Transfer error
    pub fn transfer(table: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::Transfer {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create a Timeout error
    pub fn timeout(operation: impl Into<String>, seconds: u64) -> Self {
        MigrateError::Timeout {
            operation: operation.into(),
            seconds,
        }
    }

    /// Whether retrying the same round trip may succeed.
    ///
    /// Connection loss, pool exhaustion, timeouts, serialization failures and
    /// deadlocks are transient. Constraint violations and malformed data are
    /// deterministic and must never be retried.
    pub fn is_transient(&self) -> bool {
        match self {
            MigrateError::Pool { .. } | MigrateError::Timeout { .. } => true,
            MigrateError::Source(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
            MigrateError::Target(e) => match e.code() {
                Some(state) => {
                    let code = state.code();
                    code.starts_with("08")
                        || code == "40001"
                        || code == "40P01"
                        || code == "53300"
                        || code == "57P01"
                        || code == "57P03"
                }
                // No SQLSTATE means the failure happened below the protocol
                // (socket closed, TLS, io).
                None => true,
            },
            _ => false,
        }
    }

    /// Map an error to a CLI exit code.
    pub fn exit_code(&self) -> u8 {
        match self {
            MigrateError::Config(_)
            | MigrateError::Yaml(_)
            | MigrateError::ConfigChanged
            | MigrateError::NoPrimaryKey(_) => EXIT_CONFIG_ERROR,
            MigrateError::Source(_)
            | MigrateError::Target(_)
            | MigrateError::Pool { .. }
            | MigrateError::Timeout { .. } => EXIT_CONNECTION_ERROR,
            MigrateError::Transfer { .. } => EXIT_MIGRATION_FAILED,
            MigrateError::Cancelled => EXIT_CANCELLED,
            MigrateError::Io(_) | MigrateError::State(_) | MigrateError::Json(_) => EXIT_IO_ERROR,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;
