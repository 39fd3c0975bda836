//! PostgreSQL target store.
//!
//! Uses deadpool-postgres for connection pooling. Every value is sent as
//! text and cast to the declared column type on the server
//! (`$1::text::jsonb`), so the target decides how a value is parsed and
//! a malformed value fails with a data error instead of a client-side
//! encoding error.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_postgres::{Client, Manager, ManagerConfig, Pool, RecyclingMethod};
use tokio::sync::RwLock;
use tokio_postgres::types::ToSql;
use tokio_postgres::Config as PgConfig;
use tracing::{debug, info, warn};

use super::tls::{make_tls_connect, SslMode};
use crate::config::TargetConfig;
use crate::core::{
    BatchOutcome, RowOutcome, SequenceOutcome, SqlValue, TargetRow, TargetStore, TargetTableInfo,
};
use crate::error::{MigrateError, Result};

/// Connection pool timeout.
const POOL_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Bind parameter limit of one PostgreSQL statement.
const MAX_PARAMS: usize = 65_535;

/// PostgreSQL target store.
pub struct PgTarget {
    pool: Pool,
    schema: String,
    tables: RwLock<HashMap<String, TargetTableInfo>>,
}

impl PgTarget {
    /// Connect to the target and verify the connection.
    pub async fn new(config: &TargetConfig, max_conns: usize) -> Result<Self> {
        let mut pg_config = PgConfig::new();
        pg_config.host(&config.host);
        pg_config.port(config.port);
        pg_config.dbname(&config.database);
        pg_config.user(&config.user);
        pg_config.password(&config.password);
        pg_config.keepalives(true);
        pg_config.keepalives_idle(Duration::from_secs(30));
        pg_config.connect_timeout(POOL_CONNECTION_TIMEOUT);

        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };

        let mgr = match make_tls_connect(SslMode::parse(&config.ssl_mode)?)? {
            Some(tls) => Manager::from_config(pg_config, tls, mgr_config),
            None => {
                warn!("PostgreSQL TLS is disabled. Credentials will be transmitted in plaintext.");
                Manager::from_config(pg_config, tokio_postgres::NoTls, mgr_config)
            }
        };
        let pool = Pool::builder(mgr)
            .max_size(max_conns.max(1))
            .build()
            .map_err(|e| MigrateError::pool(e, "creating PostgreSQL target pool"))?;

        let target = Self {
            pool,
            schema: config.schema.clone(),
            tables: RwLock::new(HashMap::new()),
        };
        target.ping().await?;

        info!(
            "Connected to PostgreSQL target: {}:{}/{}",
            config.host, config.port, config.database
        );
        Ok(target)
    }

    async fn client(&self, context: &str) -> Result<Client> {
        self.pool
            .get()
            .await
            .map_err(|e| MigrateError::pool(e, context))
    }

    fn qualified(&self, table: &str) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(table))
    }

    async fn load_table_info(&self, table: &str) -> Result<TargetTableInfo> {
        let client = self.client("loading target table metadata").await?;

        let columns = client
            .query(
                r#"
                SELECT a.attname::text, format_type(a.atttypid, a.atttypmod)
                FROM pg_attribute a
                JOIN pg_class c ON c.oid = a.attrelid
                JOIN pg_namespace n ON n.oid = c.relnamespace
                WHERE n.nspname = $1 AND c.relname = $2
                  AND a.attnum > 0 AND NOT a.attisdropped
                ORDER BY a.attnum
                "#,
                &[&self.schema, &table],
            )
            .await?;
        if columns.is_empty() {
            return Err(MigrateError::transfer(
                table,
                format!("target table {} does not exist", self.qualified(table)),
            ));
        }

        let primary_key = client
            .query(
                r#"
                SELECT a.attname::text
                FROM pg_index i
                JOIN pg_class c ON c.oid = i.indrelid
                JOIN pg_namespace n ON n.oid = c.relnamespace
                JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey)
                WHERE n.nspname = $1 AND c.relname = $2 AND i.indisprimary
                ORDER BY array_position(i.indkey::int2[], a.attnum)
                "#,
                &[&self.schema, &table],
            )
            .await?;

        Ok(TargetTableInfo {
            column_types: columns
                .iter()
                .map(|r| (r.get::<_, String>(0), r.get::<_, String>(1)))
                .collect(),
            primary_key: primary_key.iter().map(|r| r.get::<_, String>(0)).collect(),
        })
    }

    async fn table_info(&self, table: &str) -> Result<TargetTableInfo> {
        if let Some(info) = self.tables.read().await.get(table) {
            return Ok(info.clone());
        }
        let info = self.load_table_info(table).await?;
        if info.primary_key.is_empty() {
            return Err(MigrateError::NoPrimaryKey(table.to_string()));
        }
        debug!(
            "{}: {} target columns, primary key ({})",
            table,
            info.column_types.len(),
            info.primary_key.join(", ")
        );
        self.tables
            .write()
            .await
            .insert(table.to_string(), info.clone());
        Ok(info)
    }

    /// Run one `INSERT ... ON CONFLICT DO NOTHING` and return the inserted count.
    async fn insert(&self, table: &str, rows: &[TargetRow]) -> Result<u64> {
        let Some(first) = rows.first() else {
            return Ok(0);
        };
        let info = self.table_info(table).await?;
        let columns: Vec<&str> = first.column_names().collect();
        let casts = column_casts(table, &info, &columns)?;

        let mut params: Vec<Option<String>> = Vec::with_capacity(rows.len() * columns.len());
        for row in rows {
            for column in &columns {
                params.push(row.get(column).and_then(encode_param));
            }
        }

        let sql = build_insert_sql(
            &self.qualified(table),
            &columns,
            &casts,
            &info.primary_key,
            rows.len(),
        );
        let refs: Vec<&(dyn ToSql + Sync)> =
            params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();

        let client = self.client("writing target rows").await?;
        Ok(client.execute(sql.as_str(), &refs).await?)
    }
}

/// Quote a PostgreSQL identifier.
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Declared target type of each written column, in write order.
fn column_casts(table: &str, info: &TargetTableInfo, columns: &[&str]) -> Result<Vec<String>> {
    columns
        .iter()
        .map(|c| {
            info.column_type(c).map(str::to_string).ok_or_else(|| {
                MigrateError::transfer(
                    table,
                    format!("column \"{}\" of relation \"{}\" does not exist", c, table),
                )
            })
        })
        .collect()
}

fn build_insert_sql(
    qualified_table: &str,
    columns: &[&str],
    casts: &[String],
    primary_key: &[String],
    row_count: usize,
) -> String {
    let column_list = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");

    let mut sql = format!("INSERT INTO {} ({}) VALUES ", qualified_table, column_list);
    let mut param = 1;
    for row in 0..row_count {
        if row > 0 {
            sql.push_str(", ");
        }
        sql.push('(');
        for (i, cast) in casts.iter().enumerate() {
            if i > 0 {
                sql.push_str(", ");
            }
            sql.push_str(&format!("${}::text::{}", param, cast));
            param += 1;
        }
        sql.push(')');
    }

    let pk = primary_key
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    sql.push_str(&format!(" ON CONFLICT ({}) DO NOTHING", pk));
    sql
}

/// Text form of a value as PostgreSQL parses it; `None` is NULL.
fn encode_param(value: &SqlValue) -> Option<String> {
    let text = match value {
        SqlValue::Null => return None,
        SqlValue::Bool(b) => (if *b { "t" } else { "f" }).to_string(),
        SqlValue::I64(v) => v.to_string(),
        SqlValue::F64(v) if v.is_nan() => "NaN".to_string(),
        SqlValue::F64(v) if v.is_infinite() => {
            (if *v > 0.0 { "Infinity" } else { "-Infinity" }).to_string()
        }
        SqlValue::F64(v) => v.to_string(),
        SqlValue::Decimal(v) => v.to_string(),
        SqlValue::Text(s) => s.clone(),
        SqlValue::Bytes(b) => format!("\\x{}", hex::encode(b)),
        SqlValue::Json(v) => v.to_string(),
        SqlValue::DateTime(v) => v.format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
        SqlValue::DateTimeOffset(v) => v.to_rfc3339(),
        SqlValue::Date(v) => v.format("%Y-%m-%d").to_string(),
        SqlValue::Time(v) => v.format("%H:%M:%S%.6f").to_string(),
        SqlValue::Uuid(v) => v.to_string(),
    };
    Some(text)
}

#[async_trait]
impl TargetStore for PgTarget {
    async fn prepare(&self, table: &str) -> Result<TargetTableInfo> {
        self.table_info(table).await
    }

    async fn upsert_batch(&self, table: &str, rows: &[TargetRow]) -> Result<BatchOutcome> {
        let width = rows.first().map(|r| r.len()).unwrap_or(1).max(1);
        let mut inserted = 0;
        // One statement per chunk when the batch exceeds the bind parameter limit.
        for chunk in rows.chunks((MAX_PARAMS / width).max(1)) {
            inserted += self.insert(table, chunk).await?;
        }
        Ok(BatchOutcome {
            inserted,
            already_present: rows.len() as u64 - inserted,
        })
    }

    async fn upsert_one(&self, table: &str, row: &TargetRow) -> Result<RowOutcome> {
        match self.insert(table, std::slice::from_ref(row)).await? {
            0 => Ok(RowOutcome::AlreadyPresent),
            _ => Ok(RowOutcome::Inserted),
        }
    }

    async fn advance_id_sequence(&self, table: &str) -> Result<SequenceOutcome> {
        let info = self.table_info(table).await?;
        let [pk] = info.primary_key.as_slice() else {
            return Ok(SequenceOutcome::NoOp);
        };
        let qualified = self.qualified(table);
        let client = self.client("advancing target sequence").await?;

        let row = client
            .query_one(
                "SELECT pg_get_serial_sequence($1, $2)",
                &[&qualified, pk],
            )
            .await?;
        let Some(sequence) = row.get::<_, Option<String>>(0) else {
            return Ok(SequenceOutcome::NoOp);
        };

        let sql = format!(
            "SELECT setval($1::text::regclass, MAX({pk})::bigint) FROM {table} HAVING MAX({pk}) IS NOT NULL",
            pk = quote_ident(pk),
            table = qualified
        );
        match client.query_opt(sql.as_str(), &[&sequence]).await? {
            Some(row) => {
                let value: i64 = row.get(0);
                debug!("{}: sequence {} set to {}", table, sequence, value);
                Ok(SequenceOutcome::Advanced { sequence, value })
            }
            None => Ok(SequenceOutcome::NoOp),
        }
    }

    async fn row_count(&self, table: &str) -> Result<i64> {
        let client = self.client("counting target rows").await?;
        let sql = format!("SELECT COUNT(*) FROM {}", self.qualified(table));
        let row = client.query_one(sql.as_str(), &[]).await?;
        Ok(row.get(0))
    }

    async fn ping(&self) -> Result<()> {
        let client = self.client("testing PostgreSQL target connection").await?;
        client.simple_query("SELECT 1").await?;
        Ok(())
    }

    fn db_type(&self) -> &str {
        "postgres"
    }

    async fn close(&self) {
        self.pool.close();
    }
}
