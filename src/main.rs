//! # Archivist CLI (`archivist`)
//!
//! The `archivist` binary drives the pipeline one stage at a time. Each stage
//! command opens a run in the ledger, does its work, and prints a summary of
//! what it processed.
//!
//! ## Usage
//!
//! ```bash
//! archivist --config ./config/archivist.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `archivist init` | Create the SQLite database and run schema migrations |
//! | `archivist scan [ROOT]` | Inventory files under a root by content hash |
//! | `archivist extract` | Extract text for inventoried inputs |
//! | `archivist label` | Label extracted inputs with the inference server |
//! | `archivist plan` | Record placement plans from current labels |
//! | `archivist runs list` | List ledger runs |
//! | `archivist show <path\|hash>` | Show everything recorded for an input |
//! | `archivist stats` | Library statistics |
//! | `archivist completions <shell>` | Print shell completions |

use anyhow::{bail, Result};
use clap::{CommandFactory, Parser, Subcommand};
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::time::Duration;

use archivist::config::{self, Config};
use archivist::extraction::ExtractionStage;
use archivist::labeling::LabelStage;
use archivist::ledger::RunLedger;
use archivist::models::{Run, StageKind};
use archivist::progress::{format_number, ProgressMode};
use archivist::stats::{format_ts_iso, format_ts_relative};
use archivist::{db, history, inventory, logging, migrate, planner, stats};

/// Archivist: inventory, extract, label and plan a personal document library.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/archivist.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "archivist",
    about = "Archivist: a local-first document inventory, extraction and labeling pipeline",
    version,
    long_about = "Archivist inventories a document library by content hash, extracts text with \
    an ordered chain of backends, labels each document with a local OpenAI-compatible model \
    (escalating weak answers to a larger one), and records a reviewable placement plan."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/archivist.toml")]
    config: PathBuf,

    /// Progress reporting on stderr. Defaults to `human` on a terminal and
    /// `off` otherwise.
    #[arg(long, global = true, value_enum)]
    progress: Option<ProgressMode>,

    /// Log at debug level unless `RUST_LOG` says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all tables. Running it again is
    /// harmless.
    Init,

    /// Inventory every file under ROOT.
    ///
    /// Files are identified by content hash. Rescanning an unchanged tree
    /// registers nothing new.
    Scan {
        /// Directory to walk. Defaults to `[scan].root` from the config.
        root: Option<PathBuf>,
    },

    /// Extract text for inventoried inputs.
    ///
    /// Inputs whose current content already has a successful extraction are
    /// skipped unless `--force` is given. Identical content is extracted once.
    Extract {
        /// Re-extract inputs that already succeeded.
        #[arg(long)]
        force: bool,

        /// Process at most this many inputs.
        #[arg(long)]
        limit: Option<usize>,

        /// Override `[extraction].workers`.
        #[arg(long)]
        workers: Option<usize>,
    },

    /// Label extracted inputs.
    ///
    /// Each input is labeled by the default model and, when the answer trips
    /// an escalation trigger, re-labeled by the escalation model.
    Label {
        /// Re-label inputs that already have a label for their content.
        #[arg(long)]
        force: bool,

        /// Process at most this many inputs.
        #[arg(long)]
        limit: Option<usize>,

        /// Never call the escalation model in this run.
        #[arg(long)]
        no_escalation: bool,
    },

    /// Record a placement plan from the current labels.
    Plan,

    /// Inspect the run ledger.
    Runs {
        #[command(subcommand)]
        action: RunsAction,
    },

    /// Show the full history of one input, by path or content hash.
    Show {
        /// A file path or a 64-character content hash.
        key: String,

        /// Print JSON instead of text.
        #[arg(long)]
        json: bool,
    },

    /// Library statistics and stage overview.
    Stats {
        /// Print JSON instead of text.
        #[arg(long)]
        json: bool,
    },

    /// Print shell completions to stdout.
    Completions {
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum RunsAction {
    /// List runs, newest first.
    List {
        /// Only runs of this stage (inventory, extraction, labeling, planning).
        #[arg(long)]
        stage: Option<StageKind>,

        #[arg(long, default_value = "20")]
        limit: i64,
    },
    /// Show one run with its configuration snapshot and stats.
    Show { id: i64 },
    /// List runs still marked running after the given window.
    Stale {
        #[arg(long, default_value = "24")]
        hours: u64,
    },
    /// Close stale runs as failed.
    Reap {
        #[arg(long, default_value = "24")]
        hours: u64,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let runtime = tokio::runtime::Runtime::new()?;
    let result = runtime.block_on(dispatch(cli));
    // Extraction threads abandoned after a timeout are not waited for.
    runtime.shutdown_timeout(Duration::from_secs(1));
    result
}

async fn dispatch(cli: Cli) -> Result<()> {
    // Commands that don't require config
    if let Commands::Completions { shell } = cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(shell, &mut cmd, "archivist", &mut std::io::stdout());
        return Ok(());
    }

    let cfg = config::load_config(&cli.config)?;
    logging::init_tracing(&cfg.logging, cli.verbose);
    let reporter = cli
        .progress
        .unwrap_or_else(ProgressMode::default_for_tty)
        .reporter();

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Scan { root } => {
            let root = match root.or_else(|| cfg.scan.root.clone()) {
                Some(root) => root,
                None => bail!("no scan root given and [scan].root is not set"),
            };
            let pool = open(&cfg).await?;
            let result = inventory::run_scan(&cfg, &pool, &root, &*reporter).await;
            pool.close().await;
            let s = result?;
            println!("scan {}", root.display());
            println!("  discovered: {}", format_number(s.discovered));
            println!("  new: {}", format_number(s.new));
            println!("  unchanged: {}", format_number(s.unchanged));
            println!("  changed: {}", format_number(s.changed));
            println!("  failed: {}", format_number(s.failed));
            println!("ok");
        }
        Commands::Extract {
            force,
            limit,
            workers,
        } => {
            let mut cfg = cfg;
            if let Some(workers) = workers {
                if workers == 0 {
                    bail!("--workers must be > 0");
                }
                cfg.extraction.workers = workers;
            }
            let pool = open(&cfg).await?;
            let result = ExtractionStage::new(pool.clone(), &cfg)
                .run(force, limit, &*reporter)
                .await;
            pool.close().await;
            let (run_id, s) = result?;
            println!("extraction run {}", run_id);
            println!("  candidates: {}", format_number(s.candidates));
            println!("  succeeded: {}", format_number(s.succeeded));
            println!("  deduplicated: {}", format_number(s.deduplicated));
            println!("  failed: {}", format_number(s.failed));
            println!("  skipped: {}", format_number(s.skipped));
            println!("  truncated: {}", format_number(s.truncated));
            for (backend, n) in &s.by_backend {
                println!("  via {}: {}", backend, format_number(*n));
            }
            println!("ok");
        }
        Commands::Label {
            force,
            limit,
            no_escalation,
        } => {
            let pool = open(&cfg).await?;
            let result = match LabelStage::new(pool.clone(), &cfg) {
                Ok(stage) => stage.run(force, limit, no_escalation, &*reporter).await,
                Err(e) => Err(e),
            };
            pool.close().await;
            let (run_id, s) = result?;
            println!("labeling run {}", run_id);
            println!("  candidates: {}", format_number(s.candidates));
            println!("  stored: {}", format_number(s.stored));
            println!("  escalated: {}", format_number(s.escalated));
            println!("  escalation failed: {}", format_number(s.escalation_failed));
            println!("  coerced: {}", format_number(s.coerced));
            println!("  failed: {}", format_number(s.failed));
            println!("  skipped: {}", format_number(s.skipped));
            println!("ok");
        }
        Commands::Plan => {
            let pool = open(&cfg).await?;
            let result = planner::run_plan(&cfg, &pool, &*reporter).await;
            pool.close().await;
            let (run_id, s) = result?;
            println!("planning run {}", run_id);
            println!("  planned: {}", format_number(s.planned));
            println!("  needs review: {}", format_number(s.needs_review));
            println!("ok");
        }
        Commands::Runs { action } => {
            let pool = open(&cfg).await?;
            let result = runs(&pool, action).await;
            pool.close().await;
            result?;
        }
        Commands::Show { key, json } => {
            history::run_show(&cfg, &key, json).await?;
        }
        Commands::Stats { json } => {
            stats::run_stats(&cfg, json).await?;
        }
        Commands::Completions { .. } => {
            // Handled above (before config loading)
            unreachable!()
        }
    }

    Ok(())
}

/// Connect and bring the schema up to date.
async fn open(cfg: &Config) -> Result<SqlitePool> {
    let pool = db::connect(cfg).await?;
    migrate::migrate(&pool).await?;
    Ok(pool)
}

async fn runs(pool: &SqlitePool, action: RunsAction) -> Result<()> {
    let ledger = RunLedger::new(pool.clone());
    match action {
        RunsAction::List { stage, limit } => {
            let runs = ledger.list(stage, limit).await?;
            if runs.is_empty() {
                println!("No runs recorded.");
                return Ok(());
            }
            println!(
                "{:>6}  {:<12} {:<10} {}",
                "ID", "STAGE", "STATUS", "STARTED"
            );
            for run in &runs {
                print_run_line(run);
            }
        }
        RunsAction::Show { id } => match ledger.get(id).await? {
            Some(run) => {
                println!("run:       {}", run.id);
                println!("stage:     {}", run.stage);
                println!("status:    {}", run.status.as_str());
                println!("started:   {}", format_ts_iso(run.started_at));
                if let Some(done) = run.completed_at {
                    println!("finished:  {}", format_ts_iso(done));
                }
                if let Some(err) = &run.error {
                    println!("error:     {}", err);
                }
                if let Some(stats) = &run.stats {
                    println!("stats:     {}", serde_json::to_string_pretty(stats)?);
                }
                println!("config:    {}", serde_json::to_string_pretty(&run.config)?);
            }
            None => bail!("no run with id {}", id),
        },
        RunsAction::Stale { hours } => {
            let stale = ledger.stale(hours_window(hours)).await?;
            if stale.is_empty() {
                println!("No stale runs.");
            }
            for run in &stale {
                print_run_line(run);
            }
        }
        RunsAction::Reap { hours } => {
            let reaped = ledger.reap(hours_window(hours)).await?;
            println!("reaped runs: {}", reaped.len());
            for id in reaped {
                println!("  {}", id);
            }
        }
    }
    Ok(())
}

fn hours_window(hours: u64) -> Duration {
    Duration::from_secs(hours * 3600)
}

fn print_run_line(run: &Run) {
    println!(
        "{:>6}  {:<12} {:<10} {}",
        run.id,
        run.stage.as_str(),
        run.status.as_str(),
        format_ts_relative(run.started_at)
    );
}
