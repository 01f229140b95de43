//! CLI command definitions and dispatch.

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::pipeline::{AppContext, BackendSelector, Orchestrator, RunOptions};
use crate::progress::ProgressState;
use crate::service::ServiceRegistry;
use crate::source::SourceSelector;
use crate::storage::{JsonDocumentStore, JsonlSink};

const DEFAULT_CONFIG: &str = "annoflow.yaml";
const DEFAULT_OUTPUT: &str = "annotations.jsonl";

/// Batch document annotation across rate-governed LLM backends.
#[derive(Parser)]
#[command(name = "annoflow")]
#[command(about = "Distribute document annotation batches across LLM backends")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run an annotation batch.
    Run(RunArgs),

    /// Load and validate the configuration, then exit.
    Validate(ValidateArgs),

    /// Print saved progress checkpoints from the state directory.
    Stats(StatsArgs),
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Backend configuration file.
    #[arg(short, long, default_value = DEFAULT_CONFIG, env = "ANNOFLOW_CONFIG")]
    pub config: PathBuf,

    /// Backend identifier to run. Omit to run every configured backend.
    #[arg(short, long)]
    pub backend: Option<String>,

    /// File of work-item ids, one per line.
    #[arg(long, conflicts_with = "ids_dir", required_unless_present = "ids_dir")]
    pub ids_file: Option<PathBuf>,

    /// Directory of id files (*.txt), paired with backends by the pairing
    /// policy.
    #[arg(long)]
    pub ids_dir: Option<PathBuf>,

    /// JSON file of work items (id, title, author, units).
    #[arg(long)]
    pub items: PathBuf,

    /// File holding the taxonomy block inserted into every prompt.
    #[arg(long)]
    pub taxonomy: PathBuf,

    /// Output file for annotation records (JSON lines, append-only).
    #[arg(short, long, default_value = DEFAULT_OUTPUT)]
    pub output: PathBuf,

    /// Work-item ids per chunk.
    #[arg(long, default_value = "1000")]
    pub chunk_size: usize,

    /// Concurrent items per chunk.
    #[arg(long, default_value = "8")]
    pub max_workers: usize,

    /// Concurrent pipelines across the batch.
    #[arg(long, default_value = "2")]
    pub max_pipelines: usize,

    /// Re-annotate items that already hold a completed record.
    #[arg(long)]
    pub force_rerun: bool,

    /// Discard saved progress and start from the first chunk.
    #[arg(long)]
    pub fresh_start: bool,
}

#[derive(Parser, Debug)]
pub struct ValidateArgs {
    /// Backend configuration file.
    #[arg(short, long, default_value = DEFAULT_CONFIG, env = "ANNOFLOW_CONFIG")]
    pub config: PathBuf,
}

#[derive(Parser, Debug)]
pub struct StatsArgs {
    /// Backend configuration file (used for the state directory).
    #[arg(short, long, default_value = DEFAULT_CONFIG, env = "ANNOFLOW_CONFIG")]
    pub config: PathBuf,
}

/// Parses arguments from the process environment.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Dispatches an already parsed invocation.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_batch(args).await,
        Commands::Validate(args) => validate(args),
        Commands::Stats(args) => stats(args),
    }
}

async fn run_batch(args: RunArgs) -> anyhow::Result<()> {
    let registry = ServiceRegistry::with_builtins();
    let config = AppConfig::load(&args.config, &registry.families())
        .with_context(|| format!("loading {}", args.config.display()))?;

    let source = match (&args.ids_file, &args.ids_dir) {
        (Some(file), None) => SourceSelector::File(file.clone()),
        (None, Some(dir)) => SourceSelector::Dir(dir.clone()),
        _ => anyhow::bail!("exactly one of --ids-file and --ids-dir is required"),
    };
    let backends = match args.backend {
        Some(id) => BackendSelector::One(id),
        None => BackendSelector::All,
    };

    let taxonomy = std::fs::read_to_string(&args.taxonomy)
        .with_context(|| format!("reading {}", args.taxonomy.display()))?;
    let documents = Arc::new(
        JsonDocumentStore::from_file(&args.items)
            .with_context(|| format!("loading {}", args.items.display()))?,
    );
    let sink = Arc::new(
        JsonlSink::open(&args.output)
            .with_context(|| format!("opening {}", args.output.display()))?,
    );

    let ctx = AppContext::new(config, registry, documents, sink, taxonomy);
    let cancel = Arc::clone(&ctx.cancel);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing the current chunk then stopping");
            cancel.store(true, Ordering::SeqCst);
        }
    });

    let orchestrator = Orchestrator::new(ctx);
    let mut options = RunOptions::new(backends, source);
    options.chunk_size = args.chunk_size;
    options.max_workers = args.max_workers;
    options.max_pipelines = args.max_pipelines;
    options.force_rerun = args.force_rerun;
    options.fresh_start = args.fresh_start;

    let summary = orchestrator.run(options).await?;
    for pipeline in &summary.pipelines {
        info!(
            backend = %pipeline.backend,
            source = %pipeline.source.display(),
            processed = pipeline.processed,
            succeeded = pipeline.succeeded,
            failed = pipeline.failed,
            skipped = pipeline.skipped,
            cancelled = pipeline.cancelled,
            "Pipeline summary"
        );
    }
    if !summary.errors.is_empty() {
        for (backend, detail) in &summary.errors {
            tracing::error!(backend = %backend, detail = %detail, "Pipeline failed");
        }
        anyhow::bail!("{} pipeline(s) failed", summary.errors.len());
    }
    if !summary.is_clean() {
        warn!("Run was cancelled; saved progress resumes it on the next invocation");
    }
    Ok(())
}

fn validate(args: ValidateArgs) -> anyhow::Result<()> {
    let registry = ServiceRegistry::with_builtins();
    let config = AppConfig::load(&args.config, &registry.families())
        .with_context(|| format!("loading {}", args.config.display()))?;
    for id in config.backend_ids() {
        let backend = config.backend(&id)?;
        info!(backend = %id, family = %backend.family, "Backend configured");
    }
    println!("configuration valid: {} backend(s)", config.backends.len());
    Ok(())
}

fn stats(args: StatsArgs) -> anyhow::Result<()> {
    let registry = ServiceRegistry::with_builtins();
    let config = AppConfig::load(&args.config, &registry.families())
        .with_context(|| format!("loading {}", args.config.display()))?;

    let entries = match std::fs::read_dir(&config.state_dir) {
        Ok(entries) => entries,
        Err(_) => {
            println!("no state directory at {}", config.state_dir.display());
            return Ok(());
        }
    };
    let mut found = false;
    for entry in entries.filter_map(|e| e.ok()) {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with("state_") || name.ends_with(".backup.json") {
            continue;
        }
        let text = std::fs::read_to_string(entry.path())?;
        match serde_json::from_str::<ProgressState>(&text) {
            Ok(state) => {
                found = true;
                println!(
                    "{name}: last_chunk={} processed={} succeeded={} failed={} duration={:.1}s",
                    state.last_completed_chunk_index,
                    state.total_processed_count,
                    state.total_success_count,
                    state.total_failed_count,
                    state.total_duration_so_far
                );
            }
            Err(e) => warn!(file = %name, error = %e, "Unreadable progress file"),
        }
    }
    if !found {
        println!("no checkpoints in {}", config.state_dir.display());
    }
    Ok(())
}
