//! MySQL source store.
//!
//! Uses SQLx for connection pooling. Column metadata comes from
//! INFORMATION_SCHEMA and is cached per table; rows are paged in primary key
//! order and decoded into [`SqlValue`] by declared column type.
//!
//! Dates and datetimes are read as text so zero dates (`0000-00-00`) can be
//! told apart from values that do not decode. Zero dates become NULL; any
//! other value that cannot be decoded is kept on the row as a decode
//! failure and rejects the row if a mapping reads that column.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions, MySqlRow, MySqlSslMode};
use sqlx::{Row as _, ValueRef};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::SourceConfig;
use crate::core::{ColumnInfo, SourceRow, SourceStore, SqlValue, TypeClass, TypeHint};
use crate::error::{MigrateError, Result};

/// Connection pool timeout.
const POOL_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Parse the source `ssl_mode` setting.
pub fn parse_ssl_mode(mode: &str) -> Result<MySqlSslMode> {
    match mode.to_lowercase().replace('-', "_").as_str() {
        "disabled" | "disable" => Ok(MySqlSslMode::Disabled),
        "preferred" | "prefer" | "" => Ok(MySqlSslMode::Preferred),
        "required" | "require" => Ok(MySqlSslMode::Required),
        "verify_ca" => Ok(MySqlSslMode::VerifyCa),
        "verify_identity" | "verify_full" => Ok(MySqlSslMode::VerifyIdentity),
        other => Err(MigrateError::Config(format!(
            "Invalid source ssl_mode '{}'. Valid values: disabled, preferred, required, verify_ca, verify_identity",
            other
        ))),
    }
}

/// Quote a MySQL identifier.
fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// MySQL source store.
pub struct MysqlSource {
    pool: MySqlPool,
    database: String,
    columns: RwLock<HashMap<String, Vec<ColumnInfo>>>,
}

impl MysqlSource {
    /// Connect to the source and verify the connection.
    pub async fn new(config: &SourceConfig, max_conns: usize) -> Result<Self> {
        let options = MySqlConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .database(&config.database)
            .username(&config.user)
            .password(&config.password)
            .ssl_mode(parse_ssl_mode(&config.ssl_mode)?);

        let pool = MySqlPoolOptions::new()
            .max_connections(max_conns.max(1) as u32)
            .acquire_timeout(POOL_CONNECTION_TIMEOUT)
            .connect_with(options)
            .await
            .map_err(|e| MigrateError::pool(e, "creating MySQL source pool"))?;

        sqlx::query("SELECT 1")
            .fetch_one(&pool)
            .await
            .map_err(|e| MigrateError::pool(e, "testing MySQL source connection"))?;

        info!(
            "Connected to MySQL source: {}:{}/{}",
            config.host, config.port, config.database
        );

        Ok(Self {
            pool,
            database: config.database.clone(),
            columns: RwLock::new(HashMap::new()),
        })
    }

    async fn load_columns(&self, table: &str) -> Result<Vec<ColumnInfo>> {
        // CAST to CHAR: INFORMATION_SCHEMA returns binary strings on some servers.
        let query = r#"
            SELECT
                CAST(COLUMN_NAME AS CHAR(255)) AS column_name,
                CAST(COLUMN_TYPE AS CHAR(255)) AS column_type,
                IF(IS_NULLABLE = 'YES', 1, 0) AS is_nullable,
                IF(COLUMN_KEY = 'PRI', 1, 0) AS is_pk,
                IF(EXTRA LIKE '%auto_increment%', 1, 0) AS is_identity
            FROM INFORMATION_SCHEMA.COLUMNS
            WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ?
            ORDER BY ORDINAL_POSITION
        "#;

        let rows: Vec<MySqlRow> = sqlx::query(query)
            .bind(&self.database)
            .bind(table)
            .fetch_all(&self.pool)
            .await?;

        if rows.is_empty() {
            return Err(MigrateError::transfer(table, "source table does not exist"));
        }

        rows.iter()
            .map(|row| -> Result<ColumnInfo> {
                Ok(ColumnInfo {
                    name: row.try_get::<String, _>("column_name")?,
                    type_hint: TypeHint::new(row.try_get::<String, _>("column_type")?),
                    is_nullable: row.try_get::<i64, _>("is_nullable")? == 1,
                    is_primary_key: row.try_get::<i64, _>("is_pk")? == 1,
                    is_auto_increment: row.try_get::<i64, _>("is_identity")? == 1,
                })
            })
            .collect()
    }

    async fn cached_columns(&self, table: &str) -> Result<Vec<ColumnInfo>> {
        if let Some(cols) = self.columns.read().await.get(table) {
            return Ok(cols.clone());
        }
        let cols = self.load_columns(table).await?;
        self.columns
            .write()
            .await
            .insert(table.to_string(), cols.clone());
        Ok(cols)
    }
}

/// Whether a column is fetched as text and parsed by [`parse_temporal`].
fn reads_as_text(hint: &TypeHint) -> bool {
    hint.class() == TypeClass::Temporal && matches!(hint.base(), "date" | "datetime" | "timestamp")
}

/// `SELECT ... ORDER BY pk LIMIT ? OFFSET ?` for one page.
fn build_page_query(table: &str, columns: &[ColumnInfo], filter: Option<&str>) -> String {
    let select = columns
        .iter()
        .map(|c| {
            let name = quote_ident(&c.name);
            if reads_as_text(&c.type_hint) {
                format!("CAST({} AS CHAR) AS {}", name, name)
            } else {
                name
            }
        })
        .collect::<Vec<_>>()
        .join(", ");

    let pk: Vec<String> = columns
        .iter()
        .filter(|c| c.is_primary_key)
        .map(|c| quote_ident(&c.name))
        .collect();
    // Without a primary key, order by every column for a stable page order.
    let order = if pk.is_empty() {
        columns
            .iter()
            .map(|c| quote_ident(&c.name))
            .collect::<Vec<_>>()
            .join(", ")
    } else {
        pk.join(", ")
    };

    format!(
        "SELECT {} FROM {}{} ORDER BY {} LIMIT ? OFFSET ?",
        select,
        quote_ident(table),
        where_clause(filter),
        order
    )
}

fn build_count_query(table: &str, filter: Option<&str>) -> String {
    format!(
        "SELECT COUNT(*) FROM {}{}",
        quote_ident(table),
        where_clause(filter)
    )
}

fn where_clause(filter: Option<&str>) -> String {
    match filter.map(str::trim).filter(|f| !f.is_empty()) {
        Some(f) => format!(" WHERE ({})", f),
        None => String::new(),
    }
}

/// Outcome of decoding one column; `Err` carries why the value was unreadable.
type Decoded = std::result::Result<SqlValue, String>;

/// Decode one column of a MySQL row by its declared type.
fn decode_value(row: &MySqlRow, idx: usize, hint: &TypeHint) -> Decoded {
    let is_null = row.try_get_raw(idx).map(|r| r.is_null()).unwrap_or(true);
    if is_null {
        return Ok(SqlValue::Null);
    }
    if reads_as_text(hint) {
        return match row.try_get::<String, _>(idx) {
            Ok(text) => parse_temporal(hint.base(), &text),
            Err(e) => Err(format!("unreadable {} value: {}", hint.base(), e)),
        };
    }

    match hint.class() {
        TypeClass::Integer if hint.is_unsigned() => match row.try_get::<u64, _>(idx) {
            Ok(v) => Ok(i64::try_from(v)
                .map(SqlValue::I64)
                .unwrap_or_else(|_| SqlValue::Decimal(Decimal::from(v)))),
            Err(_) => decode_signed(row, idx),
        },
        TypeClass::Integer => decode_signed(row, idx),
        TypeClass::Bit => match row.try_get::<u64, _>(idx) {
            Ok(v) => Ok(SqlValue::Bytes(bit_bytes(v))),
            Err(_) => match row.try_get::<bool, _>(idx) {
                Ok(b) => Ok(SqlValue::Bool(b)),
                Err(_) => decode_bytes(row, idx),
            },
        },
        TypeClass::Decimal => match row.try_get::<Decimal, _>(idx) {
            Ok(v) => Ok(SqlValue::Decimal(v)),
            Err(_) => decode_text(row, idx),
        },
        TypeClass::Float => match row.try_get::<f64, _>(idx) {
            Ok(v) => Ok(SqlValue::F64(v)),
            Err(_) => match row.try_get::<f32, _>(idx) {
                Ok(v) => Ok(SqlValue::F64(v as f64)),
                Err(_) => decode_text(row, idx),
            },
        },
        TypeClass::Binary => decode_bytes(row, idx),
        // TIME may exceed 24h; such values are kept as text.
        TypeClass::Temporal => match row.try_get::<chrono::NaiveTime, _>(idx) {
            Ok(t) => Ok(SqlValue::Time(t)),
            Err(_) => decode_text(row, idx),
        },
        TypeClass::Text | TypeClass::Json | TypeClass::Other | TypeClass::Unknown => {
            decode_text(row, idx)
        }
    }
}

/// Parse a DATE, DATETIME or TIMESTAMP read as text.
///
/// Zero dates (`0000-00-00`, with or without a time part) are NULL.
fn parse_temporal(base: &str, text: &str) -> Decoded {
    let text = text.trim();
    if text.starts_with("0000-00-00") {
        return Ok(SqlValue::Null);
    }
    let parsed = if base == "date" {
        chrono::NaiveDate::parse_from_str(text, "%Y-%m-%d").map(SqlValue::Date)
    } else {
        chrono::NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f").map(SqlValue::DateTime)
    };
    parsed.map_err(|e| format!("invalid {} '{}': {}", base, text, e))
}

fn decode_signed(row: &MySqlRow, idx: usize) -> Decoded {
    match row.try_get::<i64, _>(idx) {
        Ok(v) => Ok(SqlValue::I64(v)),
        Err(_) => match row.try_get::<i32, _>(idx) {
            Ok(v) => Ok(SqlValue::I64(v as i64)),
            Err(_) => decode_text(row, idx),
        },
    }
}

/// Text, or the raw bytes when the value is not valid UTF-8.
fn decode_text(row: &MySqlRow, idx: usize) -> Decoded {
    match row.try_get::<String, _>(idx) {
        Ok(s) => Ok(SqlValue::Text(s)),
        Err(_) => decode_bytes(row, idx),
    }
}

fn decode_bytes(row: &MySqlRow, idx: usize) -> Decoded {
    row.try_get::<Vec<u8>, _>(idx)
        .map(SqlValue::Bytes)
        .map_err(|e| format!("undecodable value: {}", e))
}

/// Big-endian bytes of a BIT value, without leading zero bytes (at least one byte).
fn bit_bytes(v: u64) -> Vec<u8> {
    let bytes = v.to_be_bytes();
    let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len() - 1);
    bytes[first..].to_vec()
}

#[async_trait]
impl SourceStore for MysqlSource {
    async fn list_tables(&self) -> Result<Vec<String>> {
        let query = r#"
            SELECT CAST(TABLE_NAME AS CHAR(255)) AS table_name
            FROM INFORMATION_SCHEMA.TABLES
            WHERE TABLE_SCHEMA = ? AND TABLE_TYPE = 'BASE TABLE'
            ORDER BY TABLE_NAME
        "#;
        let rows: Vec<MySqlRow> = sqlx::query(query)
            .bind(&self.database)
            .fetch_all(&self.pool)
            .await?;
        let tables = rows
            .iter()
            .map(|r| r.try_get::<String, _>("table_name"))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        info!("Found {} source tables", tables.len());
        Ok(tables)
    }

    async fn describe(&self, table: &str) -> Result<Vec<ColumnInfo>> {
        self.cached_columns(table).await
    }

    async fn referenced_tables(&self, table: &str) -> Result<Vec<String>> {
        let query = r#"
            SELECT DISTINCT CAST(REFERENCED_TABLE_NAME AS CHAR(255)) AS referenced
            FROM INFORMATION_SCHEMA.KEY_COLUMN_USAGE
            WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ?
              AND REFERENCED_TABLE_NAME IS NOT NULL
              AND REFERENCED_TABLE_SCHEMA = TABLE_SCHEMA
        "#;
        let rows: Vec<MySqlRow> = sqlx::query(query)
            .bind(&self.database)
            .bind(table)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|r| r.try_get::<String, _>("referenced").map_err(Into::into))
            .collect()
    }

    async fn count(&self, table: &str, filter: Option<&str>) -> Result<i64> {
        let sql = build_count_query(table, filter);
        let count: i64 = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
        Ok(count)
    }

    async fn page_rows(
        &self,
        table: &str,
        filter: Option<&str>,
        offset: i64,
        limit: usize,
    ) -> Result<Vec<SourceRow>> {
        let columns = self.cached_columns(table).await?;
        let sql = build_page_query(table, &columns, filter);
        debug!("{}: page offset={} limit={}", table, offset, limit);

        let rows: Vec<MySqlRow> = sqlx::query(&sql)
            .bind(limit as i64)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let mut out = SourceRow::with_capacity(columns.len());
                for (i, col) in columns.iter().enumerate() {
                    match decode_value(row, i, &col.type_hint) {
                        Ok(value) => out.push(col.name.clone(), value),
                        Err(message) => {
                            warn!("{}: column {}: {}", table, col.name, message);
                            out.push_undecodable(col.name.clone(), message);
                        }
                    }
                }
                out
            })
            .collect())
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| MigrateError::pool(e, "testing MySQL connection"))?;
        Ok(())
    }

    fn db_type(&self) -> &str {
        "mysql"
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
