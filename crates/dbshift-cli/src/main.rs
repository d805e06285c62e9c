//! dbshift CLI - resumable data migration between SQL databases.

use clap::{Parser, Subcommand};
use dbshift::{config, MigrateError, Migrator, ProgressStore};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[derive(Parser)]
#[command(name = "dbshift")]
#[command(about = "Resumable data migration between SQL databases")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "migration.yaml")]
    config: PathBuf,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a new migration run
    Run {
        /// Preview against the source only; write nothing
        #[arg(long)]
        dry_run: bool,
    },

    /// Resume an interrupted or failed run
    Resume {
        /// Run id to resume (defaults to the most recent resumable run)
        run_id: Option<String>,
    },

    /// Validate the configuration without connecting
    Validate,

    /// Show a stored run's progress
    Show {
        /// Run id (defaults to the most recent run)
        run_id: Option<String>,
    },

    /// List configured databases and their roles
    ListDatabases,

    /// Test connectivity to one database id (or "source"/"target")
    TestConnection {
        /// Database id from the config
        id: String,
    },

    /// Disable or re-enable foreign key checking on a database
    Constraints {
        /// Database id from the config
        id: String,

        /// on or off
        #[arg(value_parser = ["on", "off"])]
        state: String,
    },

    /// Show the safe deletion order for a set of tables
    FkOrder {
        /// Database id to inspect
        id: String,

        /// Tables to order
        #[arg(required = true)]
        tables: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), MigrateError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format)
        .map_err(MigrateError::Config)?;

    let cfg = config::load_config(&cli.config)?;
    let hash = config::config_hash(&cli.config)?;
    let mut migrator = Migrator::new(cfg, hash)?;

    match cli.command {
        Commands::Run { dry_run } => {
            if dry_run {
                let report = migrator.execute_dry_run().await?;
                if cli.output_json {
                    println!("{}", serde_json::to_string_pretty(&report)?);
                } else {
                    print_dry_run(&report);
                }
            } else {
                let report = match migrator.execute_migration(None).await {
                    Ok(report) => report,
                    Err(e) => {
                        print_resume_hint(migrator.progress_store());
                        return Err(e);
                    }
                };
                if cli.output_json {
                    println!("{}", serde_json::to_string_pretty(&report)?);
                } else {
                    print_report(&report);
                }
                if report.failed_queries > 0 {
                    return Err(MigrateError::Query {
                        db_id: "target".to_string(),
                        message: format!("{} queries failed", report.failed_queries),
                    });
                }
            }
        }
        Commands::Resume { run_id } => {
            let run_id = match run_id {
                Some(id) => id,
                None => latest_resumable(migrator.progress_store())?,
            };
            info!(run_id = %run_id, "resuming");
            let report = match migrator.execute_migration(Some(&run_id)).await {
                Ok(report) => report,
                Err(e) => {
                    print_resume_hint(migrator.progress_store());
                    return Err(e);
                }
            };
            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }
            if report.failed_queries > 0 {
                return Err(MigrateError::Query {
                    db_id: "target".to_string(),
                    message: format!("{} queries failed", report.failed_queries),
                });
            }
        }
        Commands::Validate => {
            migrator.validate_configuration()?;
            println!("Configuration is valid");
        }
        Commands::Show { run_id } => {
            let store = migrator.progress_store();
            let run_id = match run_id {
                Some(id) => id,
                None => store
                    .list_runs()?
                    .into_iter()
                    .next()
                    .ok_or_else(|| MigrateError::Resume("no stored runs".to_string()))?,
            };
            let run = store.load(&run_id)?;
            println!("{}", serde_json::to_string_pretty(&run)?);
        }
        Commands::ListDatabases => {
            let infos = migrator.list_databases();
            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&infos)?);
            } else {
                for db in infos {
                    let role = db.role.map(|r| format!(" [{}]", r)).unwrap_or_default();
                    let writable = if db.writable { " (writable)" } else { "" };
                    println!(
                        "{}{}: {} {}/{}{}",
                        db.id, role, db.backend, db.host, db.database, writable
                    );
                }
            }
        }
        Commands::TestConnection { id } => {
            migrator.test_connection(&id).await?;
            println!("Connection to '{}' OK", id);
        }
        Commands::Constraints { id, state } => {
            let enabled = state == "on";
            migrator.set_constraints(&id, enabled).await?;
            println!("Foreign key checks {} on '{}'", state, id);
        }
        Commands::FkOrder { id, tables } => {
            let order = migrator.deletion_order(&id, &tables).await?;
            if cli.output_json {
                let payload = serde_json::json!({
                    "order": order.order,
                    "has_circular_reference": order.has_circular_reference,
                    "circular_tables": order.circular_tables,
                });
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else {
                println!("Deletion order: {}", order.order.join(", "));
                if order.has_circular_reference {
                    println!(
                        "Circular references involving: {}",
                        order.circular_tables.join(", ")
                    );
                }
            }
        }
    }

    Ok(())
}

fn latest_resumable(store: &ProgressStore) -> Result<String, MigrateError> {
    for id in store.list_runs()? {
        if store.load(&id)?.can_resume() {
            return Ok(id);
        }
    }
    Err(MigrateError::Resume("no resumable run found".to_string()))
}

/// On a failed run, tell the operator which run id and progress file to
/// pick the migration back up with.
fn print_resume_hint(store: &ProgressStore) {
    if let Ok(id) = latest_resumable(store) {
        eprintln!(
            "Run {} can be resumed with `dbshift resume {}` (progress file: {})",
            id,
            id,
            store.run_path(&id).display()
        );
    }
}

fn print_report(report: &dbshift::MigrationReport) {
    println!("Run {} {:?}", report.run_id, report.status);
    for q in &report.queries {
        if q.skipped {
            println!("  {}: skipped (already completed)", q.id);
        } else if let Some(err) = &q.error {
            println!("  {}: FAILED - {}", q.id, err);
        } else {
            println!(
                "  {}: {} rows in {} batches ({} deleted first)",
                q.id, q.rows_inserted, q.batches, q.rows_deleted
            );
        }
    }
    println!(
        "Total rows inserted: {} in {:.1}s",
        report.total_rows_inserted, report.duration_secs
    );
    println!("Progress file: {}", report.progress_file);
}

fn print_dry_run(report: &dbshift::DryRunReport) {
    if !report.variables.is_empty() {
        println!("Variables:");
        for (name, value) in &report.variables {
            println!("  {} = {}", name, value);
        }
    }
    println!("Queries:");
    for q in &report.queries {
        println!(
            "  {}: {} rows -> {}{}",
            q.id,
            q.rows_available,
            q.target_table,
            if q.would_delete_first {
                " (delete first)"
            } else {
                ""
            }
        );
    }
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), String> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(std::io::stderr);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    Ok(())
}
