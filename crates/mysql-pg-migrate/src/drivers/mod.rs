//! Store implementations of the core connector traits.
//!
//! - [`mysql`]: MySQL source (SQLx)
//! - [`postgres`]: PostgreSQL target (deadpool-postgres)
//! - [`memory`]: in-memory source and target for tests and dry runs
//! - [`tls`]: TLS setup for the target connection

pub mod memory;
pub mod mysql;
pub mod postgres;
pub mod tls;

pub use memory::{MemorySource, MemoryTarget};
pub use mysql::MysqlSource;
pub use postgres::PgTarget;
pub use tls::SslMode;
