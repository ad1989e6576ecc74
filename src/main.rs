use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use track_analyzer::analysis_store::{AnalysisStore, SelectionOrder, SqliteAnalysisStore};
use track_analyzer::catalog_scan::scan_library;
use track_analyzer::config::{
    AppConfig, CliConfig, FileConfig, DEFAULT_ANALYSIS_VERSION, DEFAULT_BATCH_SIZE,
    DEFAULT_MAX_WORKERS,
};
use track_analyzer::extractor::{
    EssentiaExtractorFactory, DEFAULT_EXTRACTOR_BINARY, DEFAULT_HIGHLEVEL_BINARY,
};
use track_analyzer::orchestrator::{AnalysisOrchestrator, BatchSummary};

fn parse_path(s: &str) -> Result<PathBuf> {
    let path_buf = PathBuf::from(s);
    if path_buf.is_absolute() {
        return Ok(path_buf);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(path_buf))
}

#[derive(Parser, Debug)]
#[clap(version, about = "Extracts audio descriptors for catalog tracks")]
struct CliArgs {
    /// Path to the SQLite analysis database file.
    #[clap(long, env = "DATABASE_PATH", value_parser = parse_path, global = true)]
    pub db_path: Option<PathBuf>,

    /// Optional TOML config file. Its values override command line values.
    #[clap(long, value_parser = parse_path, global = true)]
    pub config: Option<PathBuf>,

    /// Version tag written with every record; records with another tag are stale.
    #[clap(long, env = "ANALYSIS_VERSION", default_value = DEFAULT_ANALYSIS_VERSION, global = true)]
    pub analysis_version: String,

    /// Items per run when no explicit limit is given.
    #[clap(long, env = "ANALYSIS_BATCH_SIZE", default_value_t = DEFAULT_BATCH_SIZE, global = true)]
    pub batch_size: usize,

    /// Upper bound on parallel execution units.
    #[clap(long, env = "ANALYSIS_MAX_WORKERS", default_value_t = DEFAULT_MAX_WORKERS, global = true)]
    pub max_workers: usize,

    /// Re-analyze items even when their record is current.
    #[clap(long, env = "ANALYSIS_FORCE_REANALYZE", global = true)]
    pub force_reanalyze: bool,

    /// Directory with high-level classifier models.
    #[clap(long, env = "ANALYSIS_MODEL_DIR", value_parser = parse_path, global = true)]
    pub model_dir: Option<PathBuf>,

    /// Do not store embedding vectors.
    #[clap(long, env = "ANALYSIS_NO_EMBEDDINGS", global = true)]
    pub no_embeddings: bool,

    /// Essentia music extractor binary.
    #[clap(long, env = "ANALYSIS_EXTRACTOR_BIN", default_value = DEFAULT_EXTRACTOR_BINARY, global = true)]
    pub extractor_bin: PathBuf,

    /// Essentia high-level classifier binary.
    #[clap(long, env = "ANALYSIS_HIGHLEVEL_BIN", default_value = DEFAULT_HIGHLEVEL_BINARY, global = true)]
    pub highlevel_bin: PathBuf,

    /// Extractor profile passed to the music extractor.
    #[clap(long, env = "ANALYSIS_PROFILE", value_parser = parse_path, global = true)]
    pub profile: Option<PathBuf>,

    /// Order in which pending items are picked.
    #[clap(long, env = "ANALYSIS_SELECTION_ORDER", value_enum, default_value = "recently-updated", global = true)]
    pub selection_order: SelectionOrder,

    /// Debug logging unless LOG_LEVEL says otherwise.
    #[clap(short, long, global = true)]
    pub verbose: bool,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Analyze items with no record for the configured version.
    AnalyzePending {
        #[clap(long)]
        limit: Option<usize>,
    },
    /// Analyze the given track ids.
    AnalyzeTracks {
        #[clap(required = true)]
        ids: Vec<String>,
    },
    /// Retry unresolved failures, oldest first.
    RetryFailures {
        #[clap(long)]
        limit: Option<usize>,
    },
    /// Register the audio files under a directory as tracks.
    Scan { dir: PathBuf },
    /// Print database statistics.
    Status,
    /// Periodically retry failures and analyze pending items until Ctrl-C.
    Watch {
        #[clap(long, default_value_t = 30)]
        interval_minutes: u64,
        #[clap(long)]
        limit: Option<usize>,
    },
}

impl CliArgs {
    fn to_cli_config(&self) -> CliConfig {
        CliConfig {
            db_path: self.db_path.clone(),
            analysis_version: self.analysis_version.clone(),
            batch_size: self.batch_size,
            max_workers: self.max_workers,
            force_reanalyze: self.force_reanalyze,
            model_dir: self.model_dir.clone(),
            enable_embeddings: !self.no_embeddings,
            extractor_binary: self.extractor_bin.clone(),
            highlevel_binary: self.highlevel_bin.clone(),
            profile: self.profile.clone(),
            selection_order: self.selection_order,
        }
    }
}

fn init_tracing(verbose: bool) -> Result<()> {
    let default_level = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    // stdout carries the JSON result, so logs go to stderr
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(default_level.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .context("Failed to initialize logging")
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

fn main() -> Result<()> {
    let cli_args = CliArgs::parse();
    init_tracing(cli_args.verbose)?;

    let file_config = match &cli_args.config {
        Some(path) => {
            info!("Loading config from {:?}", path);
            Some(FileConfig::load(path)?)
        }
        None => None,
    };
    let config = AppConfig::resolve(&cli_args.to_cli_config(), file_config)?;

    info!("Opening analysis database at {:?}...", config.db_path);
    let store = Arc::new(
        SqliteAnalysisStore::new(&config.db_path)?.with_selection_order(config.selection_order),
    );

    let build_orchestrator = || {
        let factory = Arc::new(EssentiaExtractorFactory::from_config(&config.extractor));
        AnalysisOrchestrator::new(store.clone(), factory, config.orchestrator_settings())
    };

    match cli_args.command {
        Command::Scan { dir } => print_json(&scan_library(store.as_ref(), &dir)?),
        Command::Status => print_json(&store.get_stats(&config.analysis_version)?),
        Command::AnalyzePending { limit } => {
            print_json(&build_orchestrator()?.analyze_pending(limit)?)
        }
        Command::AnalyzeTracks { ids } => print_json(&build_orchestrator()?.analyze_specific(&ids)?),
        Command::RetryFailures { limit } => {
            print_json(&build_orchestrator()?.retry_failures(limit)?)
        }
        Command::Watch {
            interval_minutes,
            limit,
        } => run_watch(build_orchestrator()?, interval_minutes, limit),
    }
}

#[derive(Serialize)]
struct WatchRun {
    retried: BatchSummary,
    pending: BatchSummary,
}

fn run_watch(
    orchestrator: AnalysisOrchestrator,
    interval_minutes: u64,
    limit: Option<usize>,
) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    let period = Duration::from_secs(interval_minutes.max(1) * 60);
    info!("Watch mode: running every {}s", period.as_secs());

    let run_once = move || -> Result<WatchRun> {
        let retried = orchestrator.retry_failures(limit)?;
        let pending = orchestrator.analyze_pending(limit)?;
        Ok(WatchRun { retried, pending })
    };
    runtime.block_on(watch_loop(period, run_once, ctrl_c_received()))
}

async fn ctrl_c_received() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}

/// Calls `run_once` on a blocking thread every `period` until `shutdown`
/// resolves. A shutdown that fires during a run ends the loop as soon as the
/// run finishes.
async fn watch_loop<R, S>(period: Duration, run_once: R, shutdown: S) -> Result<()>
where
    R: Fn() -> Result<WatchRun> + Send + Sync + 'static,
    S: Future<Output = ()>,
{
    let run_once = Arc::new(run_once);
    tokio::pin!(shutdown);
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => {
                info!("Received Ctrl-C, leaving watch mode");
                return Ok(());
            }
            _ = ticker.tick() => {}
        }

        let job = Arc::clone(&run_once);
        let run = tokio::task::spawn_blocking(move || job())
            .await
            .context("Watch run panicked")?;

        match run {
            Ok(run) => print_json(&run)?,
            Err(e) => error!("Watch run failed: {:#}", e),
        }
    }
}
