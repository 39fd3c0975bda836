//! Configuration validation.

use super::Config;
use crate::drivers::tls::SslMode;
use crate::drivers::mysql::parse_ssl_mode;
use crate::error::{MigrateError, Result};
use crate::mapping::MappingRegistry;

/// Validate connection settings, tunables and mappings.
pub fn validate(config: &Config) -> Result<()> {
    // Source validation
    if config.source.host.is_empty() {
        return Err(MigrateError::Config("source.host is required".into()));
    }
    if config.source.database.is_empty() {
        return Err(MigrateError::Config("source.database is required".into()));
    }
    if config.source.user.is_empty() {
        return Err(MigrateError::Config("source.user is required".into()));
    }
    if config.source.r#type != "mysql" {
        return Err(MigrateError::Config(format!(
            "source.type must be 'mysql', got '{}'",
            config.source.r#type
        )));
    }
    parse_ssl_mode(&config.source.ssl_mode)?;

    // Target validation
    if config.target.host.is_empty() {
        return Err(MigrateError::Config("target.host is required".into()));
    }
    if config.target.database.is_empty() {
        return Err(MigrateError::Config("target.database is required".into()));
    }
    if config.target.user.is_empty() {
        return Err(MigrateError::Config("target.user is required".into()));
    }
    if config.target.r#type != "postgres" {
        return Err(MigrateError::Config(format!(
            "target.type must be 'postgres', got '{}'",
            config.target.r#type
        )));
    }
    SslMode::parse(&config.target.ssl_mode)?;

    let m = &config.migration;
    for (name, value) in [
        ("workers", m.workers),
        ("batch_size", m.batch_size),
        ("page_size", m.page_size),
    ] {
        if value == 0 {
            return Err(MigrateError::Config(format!(
                "migration.{} must be at least 1",
                name
            )));
        }
    }
    if m.round_trip_timeout_secs == 0 {
        return Err(MigrateError::Config(
            "migration.round_trip_timeout_secs must be at least 1".into(),
        ));
    }

    if config.mappings.is_empty() {
        return Err(MigrateError::Config("at least one mapping is required".into()));
    }
    MappingRegistry::new(config.mappings.clone())?;

    Ok(())
}
