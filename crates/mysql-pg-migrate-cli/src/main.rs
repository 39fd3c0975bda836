//! mysql-pg-migrate CLI - schema-mapping MySQL to PostgreSQL migration.

use clap::{Parser, Subcommand};
use mysql_pg_migrate::error::{
    EXIT_CANCELLED, EXIT_CONNECTION_ERROR, EXIT_MIGRATION_FAILED, EXIT_OK,
};
use mysql_pg_migrate::{Config, MigrateError, MigrationReport, Orchestrator, RunStatus};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "mysql-pg-migrate")]
#[command(about = "Schema-mapping MySQL to PostgreSQL migration")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Path to state file for resume capability
    #[arg(long)]
    state_file: Option<PathBuf>,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    /// Seconds to wait for running tables after a shutdown signal
    #[arg(long, default_value = "60")]
    shutdown_timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a new migration
    Run {
        /// Override number of workers
        #[arg(long)]
        workers: Option<usize>,

        /// Dry run: transform every row but load into memory only
        #[arg(long)]
        dry_run: bool,
    },

    /// Resume a previously interrupted migration (requires --state-file)
    Resume,

    /// Validate row counts between source and target
    Validate,

    /// Check the configured mappings without connecting to any database
    CheckMappings,

    /// Test database connections
    HealthCheck,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<u8, MigrateError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format);

    let mut config = Config::load(&cli.config)?;
    info!("Loaded configuration from {:?}", cli.config);

    match cli.command {
        Commands::CheckMappings => check_mappings(&config, cli.output_json),

        Commands::Run { workers, dry_run } => {
            if let Some(w) = workers {
                config.migration.workers = w;
            }
            let cancel = setup_signal_handler(cli.shutdown_timeout);

            let mut orchestrator = if dry_run {
                Orchestrator::connect_dry_run(config).await?
            } else {
                Orchestrator::connect(config).await?
            };
            if let Some(path) = cli.state_file {
                orchestrator = orchestrator.with_state_file(path);
            }

            let report = orchestrator.run(cancel).await?;
            print_report(&report, cli.output_json)?;
            Ok(report_exit_code(&report))
        }

        Commands::Resume => {
            let state_file = cli.state_file.ok_or_else(|| {
                MigrateError::Config("--state-file is required for resume".to_string())
            })?;
            if !state_file.exists() {
                return Err(MigrateError::Config(format!(
                    "State file not found: {:?}",
                    state_file
                )));
            }
            let cancel = setup_signal_handler(cli.shutdown_timeout);

            let orchestrator = Orchestrator::connect(config)
                .await?
                .with_state_file(state_file)
                .resume()?;
            info!("Resuming from previous state");

            let report = orchestrator.run(cancel).await?;
            print_report(&report, cli.output_json)?;
            Ok(report_exit_code(&report))
        }

        Commands::Validate => {
            let orchestrator = Orchestrator::connect(config).await?;
            let checks = orchestrator.validate().await?;
            orchestrator.close().await;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&checks)?);
            } else {
                println!("Row count validation:");
                for c in &checks {
                    let counts = format!(
                        "source={} target={}",
                        c.source_rows.map_or("?".to_string(), |n| n.to_string()),
                        c.target_rows.map_or("?".to_string(), |n| n.to_string())
                    );
                    println!(
                        "  {} {} -> {}: {}",
                        if c.matches { "OK " } else { "MISMATCH" },
                        c.table,
                        c.target_table,
                        counts
                    );
                    if let Some(ref err) = c.error {
                        println!("    Error: {}", err);
                    }
                }
            }

            if checks.iter().all(|c| c.matches) {
                Ok(EXIT_OK)
            } else {
                Ok(EXIT_MIGRATION_FAILED)
            }
        }

        Commands::HealthCheck => {
            let orchestrator = Orchestrator::connect(config).await?;
            let result = orchestrator.health_check().await?;
            orchestrator.close().await;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("Health Check Results:");
                println!(
                    "  Source (MySQL): {} ({}ms)",
                    if result.source_connected { "OK" } else { "FAILED" },
                    result.source_latency_ms
                );
                if let Some(ref err) = result.source_error {
                    println!("    Error: {}", err);
                }
                println!(
                    "  Target (PostgreSQL): {} ({}ms)",
                    if result.target_connected { "OK" } else { "FAILED" },
                    result.target_latency_ms
                );
                if let Some(ref err) = result.target_error {
                    println!("    Error: {}", err);
                }
                println!(
                    "\n  Overall: {}",
                    if result.healthy { "HEALTHY" } else { "UNHEALTHY" }
                );
            }

            Ok(if result.healthy { EXIT_OK } else { EXIT_CONNECTION_ERROR })
        }
    }
}

/// Print a summary of every mapping. The config was already validated by `Config::load`.
fn check_mappings(config: &Config, output_json: bool) -> Result<u8, MigrateError> {
    let registry = config.registry()?;

    if output_json {
        println!("{}", serde_json::to_string_pretty(registry.mappings())?);
        return Ok(EXIT_OK);
    }

    println!("{} mappings OK", registry.len());
    for m in registry.mappings() {
        let selected = if config.migration.mapping_selected(m) {
            ""
        } else {
            " (excluded)"
        };
        match m.name {
            Some(ref name) => println!("  {}: {} -> {}{}", name, m.source, m.target, selected),
            None => println!("  {} -> {}{}", m.source, m.target, selected),
        }
        println!("    fields: {}", m.fields.len());
        if !m.depends_on.is_empty() {
            println!("    depends on: {}", m.depends_on.join(", "));
        }
        if let Some(ref filter) = m.source_filter {
            println!("    filter: {}", filter);
        }
    }
    Ok(EXIT_OK)
}

fn print_report(report: &MigrationReport, output_json: bool) -> Result<(), MigrateError> {
    if output_json {
        println!("{}", report.to_json()?);
        return Ok(());
    }

    let t = &report.totals;
    let heading = match (report.dry_run, report.status) {
        (true, _) => "Dry run finished",
        (false, RunStatus::Completed) => "Migration completed!",
        (false, RunStatus::Cancelled) => "Migration cancelled",
        (false, _) => "Migration finished with failures",
    };
    println!("\n{}", heading);
    println!("  Run ID: {}", report.run_id);
    println!("  Duration: {:.2}s", report.duration_seconds);
    println!(
        "  Tables: {} ok, {} partial, {} skipped, {} fatal, {} cancelled",
        t.tables_success, t.tables_partial, t.tables_skipped, t.tables_fatal, t.tables_cancelled
    );
    println!(
        "  Rows: {} loaded, {} already present, {} failed (source: {})",
        t.rows_loaded, t.rows_already_present, t.rows_failed, t.source_rows
    );

    let failed = report.failed_tables();
    if !failed.is_empty() {
        println!("  Failed tables: {}", failed.join(", "));
    }

    for table in report.tables.iter().filter(|t| t.rows_failed > 0 || t.message.is_some()) {
        println!(
            "  {} [{}]: {}",
            table.table,
            table.status.as_str(),
            table.message.as_deref().unwrap_or("")
        );
        for sample in &table.sample_errors {
            println!("    {}", sample);
        }
    }
    Ok(())
}

fn report_exit_code(report: &MigrationReport) -> u8 {
    match report.status {
        RunStatus::Completed => EXIT_OK,
        RunStatus::Cancelled => EXIT_CANCELLED,
        _ => EXIT_MIGRATION_FAILED,
    }
}

/// Logs go to stderr so `--output-json` keeps stdout clean. `RUST_LOG` wins over `--verbosity`.
fn setup_logging(verbosity: &str, format: &str) {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" | "info" | "warn" | "error" | "trace" => verbosity.to_lowercase(),
        _ => "info".to_string(),
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Cancel on SIGINT or SIGTERM. Running tables get `shutdown_timeout`
/// seconds to stop at a batch boundary before the process exits.
#[cfg(unix)]
fn setup_signal_handler(shutdown_timeout: u64) -> CancellationToken {
    let cancel_token = CancellationToken::new();

    for (kind, name) in [
        (SignalKind::interrupt(), "SIGINT"),
        (SignalKind::terminate(), "SIGTERM"),
    ] {
        let token = cancel_token.clone();
        match signal(kind) {
            Ok(mut stream) => {
                tokio::spawn(async move {
                    stream.recv().await;
                    eprintln!(
                        "\nReceived {}. Shutting down gracefully (timeout: {}s)...",
                        name, shutdown_timeout
                    );
                    token.cancel();
                    force_exit_after(shutdown_timeout).await;
                });
            }
            Err(e) => warn!("Could not install {} handler: {}", name, e),
        }
    }

    cancel_token
}

#[cfg(not(unix))]
fn setup_signal_handler(shutdown_timeout: u64) -> CancellationToken {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl-C. Shutting down gracefully...");
            token.cancel();
            force_exit_after(shutdown_timeout).await;
        }
    });

    cancel_token
}

async fn force_exit_after(shutdown_timeout: u64) {
    tokio::time::sleep(Duration::from_secs(shutdown_timeout)).await;
    eprintln!("Shutdown timeout reached, exiting");
    std::process::exit(i32::from(EXIT_CANCELLED));
}
