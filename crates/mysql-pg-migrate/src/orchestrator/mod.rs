//! Migration orchestrator - main workflow coordinator.
//!
//! A run goes through three phases:
//!
//! 1. Selection: mapped entities that pass the include/exclude filters are
//!    scheduled; unmapped source tables are reported as skipped.
//! 2. Preflight: every scheduled table is described and checked against its
//!    mapping. An incompatible mapping aborts the run before any write.
//! 3. Transfer: tables run on a bounded worker pool in dependency order. A
//!    table starts once all its parents reached a terminal state.

pub mod graph;
mod report;

pub use graph::{DependencyGraph, ReadyQueue};
pub use report::{
    overall_status, HealthCheckResult, MigrationReport, ReportTotals, TableValidation,
};

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Config, MigrationConfig};
use crate::core::{SourceStore, TargetStore};
use crate::drivers::{MemoryTarget, MysqlSource, PgTarget};
use crate::error::Result;
use crate::loader::{LoaderConfig, RetryPolicy};
use crate::mapping::MappingRegistry;
use crate::state::{MigrationState, RunStatus};
use crate::transfer::{TableMigrationResult, TableMigrator, TableStatus, TransferConfig};

/// Migration orchestrator.
pub struct Orchestrator {
    config: Config,
    registry: Arc<MappingRegistry>,
    source: Arc<dyn SourceStore>,
    target: Arc<dyn TargetStore>,
    state_file: Option<PathBuf>,
    state: Option<MigrationState>,
    dry_run: bool,
}

impl Orchestrator {
    /// Connect to MySQL and PostgreSQL as configured.
    pub async fn connect(config: Config) -> Result<Self> {
        let source = MysqlSource::new(
            &config.source,
            config.migration.get_max_mysql_connections(),
        )
        .await?;
        let target =
            PgTarget::new(&config.target, config.migration.get_max_pg_connections()).await?;
        Self::with_stores(config, Arc::new(source), Arc::new(target))
    }

    /// Connect for a dry run: rows are read from MySQL and loaded into an
    /// in-memory copy of the target tables. PostgreSQL is only read for metadata.
    pub async fn connect_dry_run(config: Config) -> Result<Self> {
        let source = MysqlSource::new(
            &config.source,
            config.migration.get_max_mysql_connections(),
        )
        .await?;
        let pg = PgTarget::new(&config.target, 1).await?;

        let mut target = MemoryTarget::new();
        for mapping in &config.mappings {
            match pg.prepare(&mapping.target).await {
                Ok(info) => target = target.with_table_info(&mapping.target, info),
                Err(e) => warn!("{}: target metadata unavailable: {}", mapping.target, e),
            }
        }
        pg.close().await;

        let mut orchestrator = Self::with_stores(config, Arc::new(source), Arc::new(target))?;
        orchestrator.dry_run = true;
        Ok(orchestrator)
    }

    /// Build an orchestrator over existing stores.
    pub fn with_stores(
        config: Config,
        source: Arc<dyn SourceStore>,
        target: Arc<dyn TargetStore>,
    ) -> Result<Self> {
        let registry = Arc::new(config.registry()?);
        Ok(Self {
            config,
            registry,
            source,
            target,
            state_file: None,
            state: None,
            dry_run: false,
        })
    }

    /// Set the state file path for resume capability.
    pub fn with_state_file(mut self, path: PathBuf) -> Self {
        self.state_file = Some(path);
        self
    }

    /// Load existing state for resume.
    pub fn resume(mut self) -> Result<Self> {
        if let Some(ref path) = self.state_file {
            if path.exists() {
                let state = MigrationState::load(path)?;
                state.validate_config(&self.config.hash())?;
                info!("Resuming run {} from state file: {:?}", state.run_id, path);
                self.state = Some(state);
            }
        }
        Ok(self)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run the migration.
    ///
    /// Only configuration problems (including incompatible mappings found
    /// during preflight) and state file failures are returned as errors.
    /// Every table-level outcome is in the report.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<MigrationReport> {
        let started_at = Utc::now();
        let clock = Instant::now();

        let mut state = self.state.take().unwrap_or_else(|| {
            MigrationState::new(uuid::Uuid::new_v4().to_string(), self.config.hash())
        });
        state.status = RunStatus::Running;
        state.completed_at = None;
        let run_id = state.run_id.clone();
        info!("Starting migration run: {}", run_id);

        // Phase 1: selection
        let selected: Vec<String> = self
            .registry
            .mappings()
            .iter()
            .filter(|m| self.config.migration.mapping_selected(m))
            .map(|m| m.entity().to_string())
            .collect();
        let unmapped = self.unmapped_tables().await;
        info!(
            "{} mapped tables selected, {} unmapped source tables",
            selected.len(),
            unmapped.len()
        );

        // Phase 2: preflight
        self.preflight(&selected).await?;
        let graph = self.dependency_graph(&selected).await?;
        let order = graph.topological_order()?;
        debug!("Schedule order: {}", order.join(", "));

        // Phase 3: transfer
        let mut results = self.schedule(&graph, order.clone(), &mut state, &cancel).await?;
        results.extend(
            unmapped
                .iter()
                .map(|t| TableMigrationResult::skipped(t, "no mapping")),
        );
        let position: HashMap<&str, usize> = order
            .iter()
            .enumerate()
            .map(|(i, t)| (t.as_str(), i))
            .collect();
        results.sort_by_key(|r| position.get(r.table.as_str()).copied().unwrap_or(usize::MAX));

        let status = overall_status(&results, cancel.is_cancelled());
        state.finish(status);
        self.save_state(&mut state)?;

        let report = MigrationReport {
            run_id,
            status,
            dry_run: self.dry_run,
            started_at,
            completed_at: Utc::now(),
            duration_seconds: clock.elapsed().as_secs_f64(),
            totals: report::ReportTotals::from_results(&results),
            tables: results,
        };

        info!(
            "Migration {}: {} tables, {} rows loaded, {} already present, {} failed in {:.1}s",
            report.status.as_str(),
            report.totals.tables,
            report.totals.rows_loaded,
            report.totals.rows_already_present,
            report.totals.rows_failed,
            report.duration_seconds
        );

        self.source.close().await;
        self.target.close().await;
        Ok(report)
    }

    /// Source tables passing the filters that have no mapping.
    async fn unmapped_tables(&self) -> Vec<String> {
        match self.source.list_tables().await {
            Ok(tables) => tables
                .into_iter()
                .filter(|t| !self.registry.maps_source(t))
                .filter(|t| self.config.migration.table_selected(t))
                .collect(),
            Err(e) => {
                warn!("Could not list source tables: {}", e);
                Vec::new()
            }
        }
    }

    /// Check every selected mapping against the described source columns.
    ///
    /// Describe failures are left to the table's own run, where they end it as `Fatal`.
    async fn preflight(&self, selected: &[String]) -> Result<()> {
        for entity in selected {
            let Some(mapping) = self.registry.lookup(entity) else {
                continue;
            };
            match self.source.describe(&mapping.source).await {
                Ok(columns) => mapping.check_source_columns(&columns)?,
                Err(e) => debug!("{}: preflight describe deferred: {}", entity, e),
            }
        }
        Ok(())
    }

    /// Declared dependencies, restricted to the selected entities and
    /// optionally merged with source foreign keys.
    ///
    /// A foreign key to a source table orders the entity after every
    /// selected mapping that reads that table.
    async fn dependency_graph(&self, selected: &[String]) -> Result<DependencyGraph> {
        let keep: HashSet<String> = selected.iter().cloned().collect();
        let mut graph = DependencyGraph::from_mappings(self.registry.mappings())?.restrict(&keep);

        if self.config.migration.use_foreign_keys {
            for entity in selected {
                let Some(mapping) = self.registry.lookup(entity) else {
                    continue;
                };
                let referenced = match self.source.referenced_tables(&mapping.source).await {
                    Ok(p) => p,
                    Err(e) => {
                        warn!("{}: could not read foreign keys: {}", entity, e);
                        continue;
                    }
                };
                for table in &referenced {
                    for parent in self
                        .registry
                        .for_source(table)
                        .map(|m| m.entity())
                        .filter(|p| keep.contains(*p) && *p != entity.as_str())
                    {
                        if !graph.add_edge_if_acyclic(entity, parent) {
                            warn!(
                                "{}: ignoring foreign key to {} (would create a dependency cycle)",
                                entity, parent
                            );
                        }
                    }
                }
            }
        }
        Ok(graph)
    }

    /// Run tables on the worker pool in dependency order.
    async fn schedule(
        &self,
        graph: &DependencyGraph,
        order: Vec<String>,
        state: &mut MigrationState,
        cancel: &CancellationToken,
    ) -> Result<Vec<TableMigrationResult>> {
        let workers = self.config.migration.workers.max(1);
        let migrator = Arc::new(TableMigrator::new(
            self.source.clone(),
            self.target.clone(),
            transfer_config(&self.config.migration),
        ));
        info!("Transferring {} tables with {} workers", order.len(), workers);

        let mut queue = ReadyQueue::new(graph, order);
        let mut running = FuturesUnordered::new();
        let mut results = Vec::new();

        loop {
            while running.len() < workers && !cancel.is_cancelled() {
                let Some(table) = queue.next_ready() else {
                    break;
                };
                if state.is_table_completed(&table) {
                    info!("{}: completed in previous run, skipping", table);
                    results.push(TableMigrationResult::skipped(
                        &table,
                        "completed in previous run",
                    ));
                    queue.mark_finished(&table);
                    continue;
                }

                let mapping = self.registry.lookup(&table).cloned();
                let migrator = migrator.clone();
                let cancel = cancel.clone();
                let name = table.clone();
                let handle = tokio::spawn(async move {
                    migrator.run(&name, mapping.as_ref(), &cancel).await
                });
                running.push(async move { (table, handle.await) });
            }

            let Some((table, joined)) = running.next().await else {
                break;
            };
            let result = joined.unwrap_or_else(|e| {
                error!("{}: task panicked - {}", table, e);
                let mut r = TableMigrationResult::new(&table, self.target_of(&table));
                r.status = TableStatus::Fatal;
                r.message = Some(format!("task panicked: {}", e));
                r
            });
            queue.mark_finished(&table);
            state.record(&result);
            self.save_state(state)?;
            results.push(result);
        }

        for table in queue.drain_pending() {
            results.push(TableMigrationResult::cancelled(&table, self.target_of(&table)));
        }
        Ok(results)
    }

    fn target_of(&self, table: &str) -> Option<&str> {
        self.registry.lookup(table).map(|m| m.target.as_str())
    }

    /// Save state to file. Dry runs never write state.
    fn save_state(&self, state: &mut MigrationState) -> Result<()> {
        match self.state_file {
            Some(ref path) if !self.dry_run => state.save(path),
            _ => Ok(()),
        }
    }

    /// Compare source (filtered) and target row counts per selected mapping.
    pub async fn validate(&self) -> Result<Vec<TableValidation>> {
        let mut results = Vec::new();
        for mapping in self.registry.mappings() {
            if !self.config.migration.mapping_selected(mapping) {
                continue;
            }
            let source = self
                .source
                .count(&mapping.source, mapping.source_filter.as_deref())
                .await;
            let target = self.target.row_count(&mapping.target).await;

            let error = match (&source, &target) {
                (Err(e), _) | (_, Err(e)) => Some(e.to_string()),
                _ => None,
            };
            let source_rows = source.ok();
            let target_rows = target.ok();
            let matches = error.is_none() && source_rows == target_rows;

            if matches {
                info!("{}: {} rows (match)", mapping.entity(), source_rows.unwrap_or(0));
            } else {
                warn!(
                    "{} -> {}: source={:?} target={:?} (MISMATCH)",
                    mapping.entity(),
                    mapping.target,
                    source_rows,
                    target_rows
                );
            }
            results.push(TableValidation {
                table: mapping.entity().to_string(),
                target_table: mapping.target.clone(),
                source_rows,
                target_rows,
                matches,
                error,
            });
        }
        Ok(results)
    }

    /// Round-trip both stores.
    pub async fn health_check(&self) -> Result<HealthCheckResult> {
        let start = Instant::now();
        let source = self.source.ping().await;
        let source_latency_ms = start.elapsed().as_millis() as u64;

        let start = Instant::now();
        let target = self.target.ping().await;
        let target_latency_ms = start.elapsed().as_millis() as u64;

        Ok(HealthCheckResult {
            source_connected: source.is_ok(),
            source_latency_ms,
            source_error: source.as_ref().err().map(|e| e.to_string()),
            target_connected: target.is_ok(),
            target_latency_ms,
            target_error: target.as_ref().err().map(|e| e.to_string()),
            healthy: source.is_ok() && target.is_ok(),
        })
    }

    pub async fn close(&self) {
        self.source.close().await;
        self.target.close().await;
    }
}

/// Table migration settings derived from the configuration.
fn transfer_config(m: &MigrationConfig) -> TransferConfig {
    TransferConfig {
        page_size: m.page_size,
        loader: LoaderConfig {
            batch_size: m.batch_size,
            retry: RetryPolicy::new(
                m.max_retries,
                m.retry_base_delay_ms,
                m.round_trip_timeout_secs,
            ),
            max_sample_errors: m.max_sample_errors,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_config_from_migration_config() {
        let mut m = MigrationConfig::default();
        m.batch_size = 250;
        m.page_size = 500;
        m.max_retries = 5;
        let tc = transfer_config(&m);
        assert_eq!(tc.page_size, 500);
        assert_eq!(tc.loader.batch_size, 250);
        assert_eq!(tc.loader.retry.max_retries, 5);
        assert_eq!(tc.loader.max_sample_errors, 10);
    }
}
