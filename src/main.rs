use anyhow::{bail, Context};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use std::sync::Arc;
use tracing::{info, warn};

use open_cinema_index::admission::FetchAdmission;
use open_cinema_index::config::Config;
use open_cinema_index::logging::init_logging;
use open_cinema_index::metrics::init_metrics;
use open_cinema_index::models::{RunOutcome, SourceDefinition};
use open_cinema_index::registry::default_sources;
use open_cinema_index::storage::{RunLedger, SourceRegistry, SqliteStore};

#[derive(Parser)]
#[command(name = "oci")]
#[command(about = "Open Cinema Index fetch admission")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install configured sources (or the built-in defaults) that are not in the database yet
    Seed,
    /// List data sources
    Sources,
    /// Admit one fetch against a source and print the plan as JSON
    Prepare {
        source: String,
    },
    /// Record the outcome of an admitted run
    Complete {
        run_id: i64,
        #[arg(long, value_enum)]
        status: OutcomeArg,
        /// Error text for a failed run
        #[arg(long)]
        error: Option<String>,
        #[arg(long)]
        fetched: Option<i64>,
        #[arg(long)]
        processed: Option<i64>,
    },
    /// Show recent runs for a source
    Runs {
        source: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Enable a source
    Enable {
        source: String,
    },
    /// Disable a source
    Disable {
        source: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum OutcomeArg {
    Success,
    Failed,
}

fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    let cli = Cli::parse();
    let config = Config::load().context("loading configuration")?;
    let _guard = init_logging(&config.logging.dir)
        .with_context(|| format!("creating log directory {}", config.logging.dir.display()))?;

    if let Some(addr) = config.metrics_addr()? {
        init_metrics(addr);
    }

    let store = Arc::new(
        SqliteStore::open_with_timeout(&config.database.path, config.database.busy_timeout())
            .with_context(|| format!("opening {}", config.database.path.display()))?,
    );

    match cli.command {
        Commands::Seed => {
            let definitions: Vec<SourceDefinition> = if config.sources.is_empty() {
                default_sources()
            } else {
                config.sources
            };
            seed(store.as_ref(), &definitions)?;
        }
        Commands::Sources => {
            for source in store.list_sources()? {
                println!(
                    "{:<12} {:<8} {:<9} last started: {}",
                    source.name,
                    source.kind.as_deref().unwrap_or("-"),
                    if source.enabled { "enabled" } else { "disabled" },
                    source
                        .last_run_started_at
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "never".to_string()),
                );
            }
        }
        Commands::Prepare { source } => {
            let admission = FetchAdmission::new(store);
            match admission.prepare_fetch(&source) {
                Ok(plan) => println!("{}", serde_json::to_string_pretty(&plan)?),
                Err(e) if e.is_retryable() => {
                    eprintln!("⏳ {}", e);
                    std::process::exit(2);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Commands::Complete {
            run_id,
            status,
            error,
            fetched,
            processed,
        } => {
            let now = Utc::now();
            let outcome = match status {
                OutcomeArg::Success => {
                    if error.is_some() {
                        bail!("--error only applies to failed runs");
                    }
                    RunOutcome::success(now, fetched, processed)
                }
                OutcomeArg::Failed => {
                    let mut outcome =
                        RunOutcome::failed(now, error.unwrap_or_else(|| "failed".to_string()));
                    outcome.items_fetched = fetched;
                    outcome.items_processed = processed;
                    outcome
                }
            };
            let run = store.complete_run(run_id, &outcome)?;
            info!(run_id = run.id, status = %run.status, "Run completed");
            println!("{}", serde_json::to_string_pretty(&run)?);
        }
        Commands::Runs { source, limit } => {
            let Some(data_source) = store.find_source(&source)? else {
                bail!("data source '{}' is not configured", source);
            };
            for run in store.recent_runs(data_source.id, limit)? {
                println!(
                    "{:>6} {:<8} {} {}",
                    run.id,
                    run.status,
                    run.started_at.to_rfc3339(),
                    run.error.as_deref().unwrap_or(""),
                );
            }
        }
        Commands::Enable { source } => {
            let updated = store.set_source_enabled(&source, true)?;
            println!("✅ {} enabled", updated.name);
        }
        Commands::Disable { source } => {
            let updated = store.set_source_enabled(&source, false)?;
            println!("⛔ {} disabled", updated.name);
        }
    }

    Ok(())
}

fn seed(store: &SqliteStore, definitions: &[SourceDefinition]) -> anyhow::Result<()> {
    for definition in definitions {
        if store.find_source(&definition.name)?.is_some() {
            warn!(source = %definition.name, "Source already installed, skipping");
            continue;
        }
        let source = store
            .install_source(definition)
            .with_context(|| format!("installing '{}'", definition.name))?;
        println!("📥 installed {} (id {})", source.name, source.id);
    }
    Ok(())
}
