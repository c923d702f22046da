//! Operator CLI for the experiment engine
//!
//! Usage:
//!   gamify-experiments list [--status active]   - List experiments
//!   gamify-experiments create <definition.json> - Create a DRAFT experiment
//!   gamify-experiments start <id>               - Lifecycle transitions (also pause, resume, complete)
//!   gamify-experiments report <id>              - Narrative report as JSON
//!   gamify-experiments stats <id> <variant>     - Detailed per-metric statistics
//!   gamify-experiments summary                  - Experiment counts per status
//!   gamify-experiments env-help                 - Document environment variables
//!
//! All commands operate on the RocksDB store at `EXPERIMENTS_STORAGE_PATH`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;

use gamify_experiments::config::{print_env_help, EngineConfig};
use gamify_experiments::experiment::types::ExperimentDefinition;
use gamify_experiments::experiment::{ExperimentEngine, ExperimentStatus, StaticUserDirectory};
use gamify_experiments::storage::{ExperimentFilter, RocksStore};
use gamify_experiments::{metrics, tracing_setup};

// =============================================================================
// CLI STRUCTURE
// =============================================================================

#[derive(Parser)]
#[command(name = "gamify-experiments")]
#[command(about = "Gamify Experiments - inspect and operate A/B experiments")]
#[command(version)]
struct Cli {
    /// RocksDB directory
    #[arg(long, global = true, env = "EXPERIMENTS_STORAGE_PATH")]
    storage_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List experiments, oldest first
    List {
        /// Only experiments in this status (draft, active, paused, completed)
        #[arg(long)]
        status: Option<ExperimentStatus>,

        #[arg(long, default_value_t = 0)]
        offset: usize,

        #[arg(long)]
        limit: Option<usize>,
    },

    /// Create an experiment from a JSON definition file
    Create {
        definition: PathBuf,
    },

    /// DRAFT → ACTIVE
    Start { experiment_id: String },

    /// ACTIVE → PAUSED
    Pause { experiment_id: String },

    /// PAUSED → ACTIVE
    Resume { experiment_id: String },

    /// ACTIVE or PAUSED → COMPLETED
    Complete { experiment_id: String },

    /// Print the experiment report
    Report { experiment_id: String },

    /// Print detailed statistics for one variant
    Stats {
        experiment_id: String,
        variant_id: String,
    },

    /// Experiment counts per status
    Summary,

    /// Document environment variables
    EnvHelp,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn open_engine(storage_path: Option<PathBuf>) -> Result<ExperimentEngine> {
    let mut config = EngineConfig::from_env();
    if let Some(path) = storage_path {
        config.storage_path = path;
    }
    config.log();

    let store = RocksStore::open(&config.storage_path, config.write_mode)
        .with_context(|| format!("opening store at {:?}", config.storage_path))?;

    // The CLI has no profile source; only untargeted experiments see assignments from here.
    Ok(ExperimentEngine::new(Arc::new(store), Arc::new(StaticUserDirectory::new()))
        .with_config(config))
}

fn main() -> Result<()> {
    tracing_setup::init_tracing();
    metrics::register_metrics().context("registering metrics")?;

    let cli = Cli::parse();

    if let Commands::EnvHelp = cli.command {
        print_env_help();
        return Ok(());
    }

    let engine = open_engine(cli.storage_path)?;

    match cli.command {
        Commands::List {
            status,
            offset,
            limit,
        } => {
            let filter = ExperimentFilter {
                status,
                offset,
                limit,
            };
            print_json(&engine.list_experiments(&filter)?)?;
        }
        Commands::Create { definition } => {
            let raw = std::fs::read_to_string(&definition)
                .with_context(|| format!("reading {definition:?}"))?;
            let definition: ExperimentDefinition =
                serde_json::from_str(&raw).context("parsing experiment definition")?;
            let experiment = engine.create_experiment(definition)?;
            info!(experiment_id = %experiment.id, "Created");
            print_json(&experiment)?;
        }
        Commands::Start { experiment_id } => print_json(&engine.start_experiment(&experiment_id)?)?,
        Commands::Pause { experiment_id } => print_json(&engine.pause_experiment(&experiment_id)?)?,
        Commands::Resume { experiment_id } => {
            print_json(&engine.resume_experiment(&experiment_id)?)?
        }
        Commands::Complete { experiment_id } => {
            print_json(&engine.complete_experiment(&experiment_id)?)?
        }
        Commands::Report { experiment_id } => print_json(&engine.get_report(&experiment_id)?)?,
        Commands::Stats {
            experiment_id,
            variant_id,
        } => print_json(&engine.get_detailed_statistics(&experiment_id, &variant_id)?)?,
        Commands::Summary => print_json(&engine.summary()?)?,
        // Handled above, before the store is opened
        Commands::EnvHelp => {}
    }

    Ok(())
}
