//! End-to-end runs of the orchestrator against the in-memory stores.

use std::sync::Arc;

use async_trait::async_trait;
use mysql_pg_migrate::core::{
    BatchOutcome, RowOutcome, SequenceOutcome, TargetRow, TargetTableInfo,
};
use mysql_pg_migrate::{
    ColumnInfo, Config, MemorySource, MemoryTarget, MigrateError, Orchestrator, Result, Row,
    RunStatus, SqlValue, TableMigrationResult, TableStatus, TargetStore,
};
use serde_json::json;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const CONFIG: &str = r#"
source:
  host: mysql.local
  database: loja
  user: app
target:
  host: pg.local
  database: shop
  user: app
  ssl_mode: disable
migration:
  workers: 3
  batch_size: 2
  page_size: 3
  max_retries: 1
  retry_base_delay_ms: 1
mappings:
  - source: usuarios
    target: users
    fields:
      - { source_field: id, target_field: id }
      - { source_field: email, target_field: email }
      - { source_field: ativo, target_field: active, converter: bool_from_int01, default: true }
  - source: pedidos
    target: orders
    depends_on: [usuarios]
    fields:
      - { source_field: id, target_field: id }
      - { source_field: usuario_id, target_field: user_id }
      - { source_field: itens, target_field: items, converter: json_normalize, json_fallback: wrap_array }
  - source: produtos
    target: products
    source_filter: "ativo = 1"
    fields:
      - { source_field: id, target_field: id }
      - { source_field: nome, target_field: name }
"#;

/// Staff members come from the same source table as users.
const TEAM_MAPPING: &str = r#"  - name: equipe
    source: usuarios
    target: team_members
    depends_on: [usuarios]
    source_filter: "tipo = 'equipe'"
    fields:
      - { source_field: id, target_field: user_id }
      - { source_field: email, target_field: email }
"#;

fn config() -> Config {
    Config::from_yaml(CONFIG).unwrap()
}

fn source_with_emails(emails: &[&str]) -> MemorySource {
    let usuarios = emails
        .iter()
        .enumerate()
        .map(|(i, email)| {
            let id = i as i64 + 1;
            let tipo = if id % 2 == 0 { "equipe" } else { "cliente" };
            Row::new()
                .with("id", id)
                .with("email", *email)
                .with("ativo", id % 2)
                .with("tipo", tipo)
        })
        .collect();

    let pedidos = (1..=6i64)
        .map(|id| {
            let itens = if id == 3 {
                "caneta".to_string()
            } else {
                format!(r#"[{{"sku":"P{}","qty":{}}}]"#, id, id)
            };
            Row::new()
                .with("id", id)
                .with("usuario_id", id % 5 + 1)
                .with("itens", itens)
        })
        .collect();

    let produtos = [(1i64, "lapis", 1i64), (2, "borracha", 0), (3, "caderno", 1), (4, "regua", 1)]
        .iter()
        .map(|(id, nome, ativo)| {
            Row::new()
                .with("id", *id)
                .with("nome", *nome)
                .with("ativo", *ativo)
        })
        .collect();

    MemorySource::new()
        .with_table(
            "usuarios",
            vec![
                ColumnInfo::new("id", "int").primary_key().auto_increment(),
                ColumnInfo::new("email", "varchar(120)"),
                ColumnInfo::new("ativo", "tinyint(1)"),
                ColumnInfo::new("tipo", "varchar(20)"),
            ],
            usuarios,
        )
        .with_table(
            "pedidos",
            vec![
                ColumnInfo::new("id", "int").primary_key().auto_increment(),
                ColumnInfo::new("usuario_id", "int"),
                ColumnInfo::new("itens", "longtext"),
            ],
            pedidos,
        )
        .with_table(
            "produtos",
            vec![
                ColumnInfo::new("id", "int").primary_key(),
                ColumnInfo::new("nome", "varchar(80)"),
                ColumnInfo::new("ativo", "tinyint(1)"),
            ],
            produtos,
        )
        .with_table(
            "logs",
            vec![ColumnInfo::new("id", "int").primary_key()],
            vec![Row::new().with("id", 1i64)],
        )
}

fn source() -> MemorySource {
    source_with_emails(&[
        "ana@loja.com",
        "bruno@loja.com",
        "carla@loja.com",
        "davi@loja.com",
        "eva@loja.com",
    ])
}

fn target() -> MemoryTarget {
    MemoryTarget::new()
        .with_table(
            "users",
            &[("id", "bigint"), ("email", "text"), ("active", "boolean")],
            &["id"],
        )
        .with_table(
            "orders",
            &[("id", "bigint"), ("user_id", "bigint"), ("items", "jsonb")],
            &["id"],
        )
        .with_table("products", &[("id", "bigint"), ("name", "text")], &["id"])
}

/// Cancels the run while the first batch of `table` is being written.
struct CancelOnWrite {
    inner: Arc<MemoryTarget>,
    table: &'static str,
    cancel: CancellationToken,
}

#[async_trait]
impl TargetStore for CancelOnWrite {
    async fn prepare(&self, table: &str) -> Result<TargetTableInfo> {
        self.inner.prepare(table).await
    }

    async fn upsert_batch(&self, table: &str, rows: &[TargetRow]) -> Result<BatchOutcome> {
        if table == self.table {
            self.cancel.cancel();
        }
        self.inner.upsert_batch(table, rows).await
    }

    async fn upsert_one(&self, table: &str, row: &TargetRow) -> Result<RowOutcome> {
        self.inner.upsert_one(table, row).await
    }

    async fn advance_id_sequence(&self, table: &str) -> Result<SequenceOutcome> {
        self.inner.advance_id_sequence(table).await
    }

    async fn row_count(&self, table: &str) -> Result<i64> {
        self.inner.row_count(table).await
    }

    fn db_type(&self) -> &str {
        "memory"
    }

    async fn close(&self) {}
}

fn table<'a>(tables: &'a [TableMigrationResult], name: &str) -> &'a TableMigrationResult {
    tables
        .iter()
        .find(|t| t.table == name)
        .unwrap_or_else(|| panic!("no result for {}", name))
}

#[tokio::test]
async fn test_full_run_completes() {
    let target = Arc::new(target());
    let orchestrator =
        Orchestrator::with_stores(config(), Arc::new(source()), target.clone()).unwrap();
    let report = orchestrator.run(CancellationToken::new()).await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(table(&report.tables, "usuarios").rows_loaded, 5);
    assert_eq!(table(&report.tables, "pedidos").rows_loaded, 6);

    let products = table(&report.tables, "produtos");
    assert_eq!(products.total_source_rows, 3);
    assert_eq!(products.rows_loaded, 3);
    assert_eq!(target.rows("products").await.len(), 3);

    let logs = table(&report.tables, "logs");
    assert_eq!(logs.status, TableStatus::Skipped);
    assert_eq!(logs.message.as_deref(), Some("no mapping"));
    assert_eq!(report.totals.tables, 4);
}

#[tokio::test]
async fn test_unparseable_order_items_are_wrapped() {
    let target = Arc::new(target());
    let orchestrator =
        Orchestrator::with_stores(config(), Arc::new(source()), target.clone()).unwrap();
    orchestrator.run(CancellationToken::new()).await.unwrap();

    let orders = target.rows("orders").await;
    let third = orders
        .iter()
        .find(|r| r.get("id") == Some(&SqlValue::I64(3)))
        .unwrap();
    assert_eq!(third.get("items"), Some(&SqlValue::Json(json!(["caneta"]))));

    let first = orders
        .iter()
        .find(|r| r.get("id") == Some(&SqlValue::I64(1)))
        .unwrap();
    assert_eq!(
        first.get("items"),
        Some(&SqlValue::Json(json!([{"sku": "P1", "qty": 1}])))
    );
}

#[tokio::test]
async fn test_rerun_is_idempotent() {
    let source = Arc::new(source());
    let target = Arc::new(target());

    let first = Orchestrator::with_stores(config(), source.clone(), target.clone())
        .unwrap()
        .run(CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(first.totals.rows_loaded, 14);

    let second = Orchestrator::with_stores(config(), source, target.clone())
        .unwrap()
        .run(CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(second.status, RunStatus::Completed);
    assert_eq!(second.totals.rows_loaded, 0);
    assert_eq!(second.totals.rows_already_present, 14);
    assert_eq!(target.rows("users").await.len(), 5);
    assert_eq!(target.rows("orders").await.len(), 6);
}

#[tokio::test]
async fn test_parents_finish_before_children_start() {
    let target = Arc::new(target());
    let orchestrator =
        Orchestrator::with_stores(config(), Arc::new(source()), target.clone()).unwrap();
    orchestrator.run(CancellationToken::new()).await.unwrap();

    let log = target.write_log().await;
    let last_user = log.iter().rposition(|t| t == "users").unwrap();
    let first_order = log.iter().position(|t| t == "orders").unwrap();
    assert!(last_user < first_order, "write order: {:?}", log);
}

#[tokio::test]
async fn test_foreign_keys_order_undeclared_dependencies() {
    let yaml = CONFIG
        .replace("    depends_on: [usuarios]\n", "")
        .replace("  retry_base_delay_ms: 1", "  retry_base_delay_ms: 1\n  use_foreign_keys: true");
    let config = Config::from_yaml(&yaml).unwrap();
    let source = source().with_foreign_key("pedidos", "usuarios");
    let target = Arc::new(target());

    Orchestrator::with_stores(config, Arc::new(source), target.clone())
        .unwrap()
        .run(CancellationToken::new())
        .await
        .unwrap();

    let log = target.write_log().await;
    let last_user = log.iter().rposition(|t| t == "users").unwrap();
    let first_order = log.iter().position(|t| t == "orders").unwrap();
    assert!(last_user < first_order, "write order: {:?}", log);
}

#[tokio::test]
async fn test_unreachable_target_table_fails_only_that_table() {
    let target = Arc::new(target().with_unreachable("products"));
    let orchestrator =
        Orchestrator::with_stores(config(), Arc::new(source()), target.clone()).unwrap();
    let report = orchestrator.run(CancellationToken::new()).await.unwrap();

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(table(&report.tables, "produtos").status, TableStatus::Fatal);
    assert_eq!(table(&report.tables, "usuarios").status, TableStatus::Success);
    assert_eq!(table(&report.tables, "pedidos").status, TableStatus::Success);
    assert_eq!(report.failed_tables(), vec!["produtos"]);
    assert_eq!(target.rows("orders").await.len(), 6);
}

#[tokio::test]
async fn test_rejected_batch_falls_back_to_single_rows() {
    // davi reuses carla's email; the batch [davi, eva] is rejected as a whole.
    let source = source_with_emails(&[
        "ana@loja.com",
        "bruno@loja.com",
        "carla@loja.com",
        "carla@loja.com",
        "eva@loja.com",
    ]);
    let target = Arc::new(target().with_unique("users", "email"));
    let report = Orchestrator::with_stores(config(), Arc::new(source), target.clone())
        .unwrap()
        .run(CancellationToken::new())
        .await
        .unwrap();

    let users = table(&report.tables, "usuarios");
    assert_eq!(users.status, TableStatus::PartialSuccess);
    assert_eq!(users.rows_loaded, 4);
    assert_eq!(users.rows_failed, 1);
    assert_eq!(users.sample_errors[0].row_key.as_deref(), Some("4"));
    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(target.rows("users").await.len(), 4);
}

#[tokio::test]
async fn test_resume_skips_completed_tables() {
    let dir = TempDir::new().unwrap();
    let state_file = dir.path().join("state.json");
    let source = Arc::new(source());

    let first = Orchestrator::with_stores(
        config(),
        source.clone(),
        Arc::new(target().with_unreachable("products")),
    )
    .unwrap()
    .with_state_file(state_file.clone())
    .run(CancellationToken::new())
    .await
    .unwrap();
    assert_eq!(first.status, RunStatus::Failed);

    let target = Arc::new(target());
    let second = Orchestrator::with_stores(config(), source, target.clone())
        .unwrap()
        .with_state_file(state_file)
        .resume()
        .unwrap()
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(second.run_id, first.run_id);
    assert_eq!(second.status, RunStatus::Completed);
    let users = table(&second.tables, "usuarios");
    assert_eq!(users.status, TableStatus::Skipped);
    assert_eq!(users.message.as_deref(), Some("completed in previous run"));
    assert_eq!(table(&second.tables, "produtos").rows_loaded, 3);
    assert!(target.rows("users").await.is_empty());
}

#[tokio::test]
async fn test_split_table_feeds_two_targets() {
    let config = || Config::from_yaml(&format!("{}{}", CONFIG, TEAM_MAPPING)).unwrap();
    let team_target = || {
        target().with_table(
            "team_members",
            &[("user_id", "bigint"), ("email", "text")],
            &["user_id"],
        )
    };
    let dir = TempDir::new().unwrap();
    let state_file = dir.path().join("state.json");
    let source = Arc::new(source());
    let target = Arc::new(team_target());

    let first = Orchestrator::with_stores(config(), source.clone(), target.clone())
        .unwrap()
        .with_state_file(state_file.clone())
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(first.status, RunStatus::Completed);
    assert_eq!(table(&first.tables, "usuarios").rows_loaded, 5);
    let team = table(&first.tables, "equipe");
    assert_eq!(team.target_table.as_deref(), Some("team_members"));
    assert_eq!(team.total_source_rows, 2);
    assert_eq!(team.rows_loaded, 2);
    assert_eq!(target.rows("users").await.len(), 5);
    assert_eq!(target.rows("team_members").await.len(), 2);

    let log = target.write_log().await;
    let last_user = log.iter().rposition(|t| t == "users").unwrap();
    let first_member = log.iter().position(|t| t == "team_members").unwrap();
    assert!(last_user < first_member, "write order: {:?}", log);

    let checks = Orchestrator::with_stores(config(), source.clone(), target)
        .unwrap()
        .validate()
        .await
        .unwrap();
    assert_eq!(checks.len(), 4);
    assert!(checks.iter().all(|c| c.matches));

    let second = Orchestrator::with_stores(config(), source, Arc::new(team_target()))
        .unwrap()
        .with_state_file(state_file)
        .resume()
        .unwrap()
        .run(CancellationToken::new())
        .await
        .unwrap();
    for entity in ["usuarios", "equipe"] {
        let result = table(&second.tables, entity);
        assert_eq!(result.status, TableStatus::Skipped);
        assert_eq!(result.message.as_deref(), Some("completed in previous run"));
    }
}

#[tokio::test]
async fn test_resume_with_changed_config_is_rejected() {
    let dir = TempDir::new().unwrap();
    let state_file = dir.path().join("state.json");

    Orchestrator::with_stores(config(), Arc::new(source()), Arc::new(target()))
        .unwrap()
        .with_state_file(state_file.clone())
        .run(CancellationToken::new())
        .await
        .unwrap();

    let changed = Config::from_yaml(&CONFIG.replace("workers: 3", "workers: 2")).unwrap();
    let result = Orchestrator::with_stores(changed, Arc::new(source()), Arc::new(target()))
        .unwrap()
        .with_state_file(state_file)
        .resume();
    assert!(matches!(result, Err(MigrateError::ConfigChanged)));
}

#[tokio::test]
async fn test_incompatible_mapping_aborts_before_any_write() {
    let yaml = CONFIG.replace("source_field: nome", "source_field: titulo");
    let target = Arc::new(target());
    let result = Orchestrator::with_stores(
        Config::from_yaml(&yaml).unwrap(),
        Arc::new(source()),
        target.clone(),
    )
    .unwrap()
    .run(CancellationToken::new())
    .await;

    let err = result.unwrap_err();
    assert!(matches!(err, MigrateError::Config(_)));
    assert!(err.to_string().contains("titulo"));
    assert!(target.write_log().await.is_empty());
}

#[tokio::test]
async fn test_cancelled_run_starts_nothing() {
    let cancel = CancellationToken::new();
    cancel.cancel();
    let target = Arc::new(target());
    let report = Orchestrator::with_stores(config(), Arc::new(source()), target.clone())
        .unwrap()
        .run(cancel)
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Cancelled);
    assert_eq!(report.totals.tables_cancelled, 3);
    assert!(target.write_log().await.is_empty());
}

#[tokio::test]
async fn test_cancel_mid_table_keeps_finished_parents() {
    let cancel = CancellationToken::new();
    let memory = Arc::new(target());
    let target = Arc::new(CancelOnWrite {
        inner: memory.clone(),
        table: "orders",
        cancel: cancel.clone(),
    });
    let report = Orchestrator::with_stores(config(), Arc::new(source()), target)
        .unwrap()
        .run(cancel)
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Cancelled);
    assert_eq!(table(&report.tables, "usuarios").status, TableStatus::Success);
    let orders = table(&report.tables, "pedidos");
    assert_eq!(orders.status, TableStatus::Cancelled);
    // The batch in flight completes; the next one is never sent.
    assert_eq!(orders.rows_loaded, 2);
    assert_eq!(memory.rows("orders").await.len(), 2);
    assert_eq!(memory.rows("users").await.len(), 5);
    let log = memory.write_log().await;
    assert_eq!(log.iter().filter(|t| *t == "orders").count(), 1);
}

#[tokio::test]
async fn test_validate_compares_filtered_counts() {
    let source = Arc::new(source());
    let target = Arc::new(target());
    Orchestrator::with_stores(config(), source.clone(), target.clone())
        .unwrap()
        .run(CancellationToken::new())
        .await
        .unwrap();

    let checks = Orchestrator::with_stores(config(), source, target)
        .unwrap()
        .validate()
        .await
        .unwrap();
    assert_eq!(checks.len(), 3);
    assert!(checks.iter().all(|c| c.matches));
    let products = checks.iter().find(|c| c.table == "produtos").unwrap();
    assert_eq!(products.source_rows, Some(3));
}

#[tokio::test]
async fn test_health_check_reports_both_stores() {
    let orchestrator =
        Orchestrator::with_stores(config(), Arc::new(source()), Arc::new(target())).unwrap();
    let health = orchestrator.health_check().await.unwrap();
    assert!(health.healthy);
    assert!(health.source_connected && health.target_connected);
}
