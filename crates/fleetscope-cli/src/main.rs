//! Fleetscope CLI
//!
//! The `fleetscope` command investigates a fleet of repositories and inspects
//! the cached results.
//!
//! ## Commands
//!
//! - `run`: investigate every repository in a manifest, once or as a daemon
//! - `classify`: classify a local directory
//! - `pipeline`: print the step pipeline for a category
//! - `cache`: list, show or evict cached analysis records
//! - `runs`: list checkpointed investigation runs
//! - `health`: check the analysis store

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn, Level};

use fleetscope_core::config::{DEFAULT_CACHE_TTL_DAYS, DEFAULT_CHUNK_SIZE, DEFAULT_SLEEP_HOURS};
use fleetscope_core::{
    shutdown_channel, AnalysisStore, CachePolicy, Category, CheckpointLog, Collaborators,
    EngineContext, FileTree, FleetConfig, FleetCoordinator, FleetManifest, FleetSummary,
    FsResultPublisher, GitCloneProvider, HttpAnalysisProvider, ModelConfig, RecordSlot, RunMode,
    StepRegistry, TemplateCatalog, TypeClassifier,
};
use fleetscope_state::fakes::{MemoryAnalysisStore, MemoryCheckpointLog};
use fleetscope_state::{
    FsAnalysisStore, FsCheckpointLog, SurrealAnalysisStore, SurrealCheckpointLog,
};

const DEFAULT_STORE_DIR: &str = ".fleetscope/store";

#[derive(Parser)]
#[command(name = "fleetscope")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Fleet repository investigation engine", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines and JSON command output
    #[arg(long, global = true)]
    json: bool,

    /// Analysis store: `mem`, `file:<dir>` or `surreal`
    #[arg(
        long,
        global = true,
        env = "FLEETSCOPE_STORE",
        default_value = "file",
        value_parser = StoreSpec::from_str
    )]
    store: StoreSpec,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Investigate every repository in a manifest
    Run(RunArgs),

    /// Classify a local directory tree
    Classify {
        /// Directory to scan
        path: PathBuf,

        /// Skip scoring and use this category
        #[arg(long = "type")]
        category: Option<String>,
    },

    /// Print the step pipeline for a category
    Pipeline {
        /// infra-as-code, libraries, frontend, backend or generic
        category: String,

        /// Directory of template overrides
        #[arg(long, env = "FLEETSCOPE_TEMPLATES")]
        templates_dir: Option<PathBuf>,
    },

    /// Inspect cached analysis records
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// List investigation runs, newest first
    Runs {
        /// Only runs for this repository
        repo: Option<String>,

        /// Also print each run's events
        #[arg(long)]
        events: bool,
    },

    /// Check that the analysis store is reachable
    Health,
}

#[derive(Subcommand)]
enum CacheAction {
    /// List every cached record
    List,

    /// Show one record's merged result
    Show {
        repo: String,
        #[arg(short, long, default_value = "main")]
        branch: String,
    },

    /// Delete one record so the next run re-analyses the repository
    Evict {
        repo: String,
        #[arg(short, long, default_value = "main")]
        branch: String,
    },
}

#[derive(clap::Args)]
struct RunArgs {
    /// JSON manifest: {"repositories": {"<name>": {"url", "type"?, "branch"?}}}
    #[arg(long, env = "FLEETSCOPE_MANIFEST")]
    manifest: PathBuf,

    /// Repositories investigated concurrently (1-20)
    #[arg(long, env = "FLEETSCOPE_CHUNK_SIZE", default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,

    /// Hours between daemon passes (0.01-168)
    #[arg(long, env = "FLEETSCOPE_SLEEP_HOURS", default_value_t = DEFAULT_SLEEP_HOURS)]
    sleep_hours: f64,

    /// Ignore the cache on the first pass
    #[arg(long)]
    force: bool,

    /// Re-run one step on the first pass, reusing the others
    #[arg(long)]
    force_step: Option<String>,

    #[arg(long, env = "FLEETSCOPE_MODEL", default_value = ModelConfig::DEFAULT_MODEL)]
    model: String,

    /// Response token limit per step (100-8000)
    #[arg(long, env = "FLEETSCOPE_MAX_TOKENS", default_value_t = ModelConfig::DEFAULT_MAX_TOKENS)]
    max_tokens: u32,

    /// Use this category for every repository
    #[arg(long = "type", env = "FLEETSCOPE_TYPE")]
    category: Option<String>,

    /// What to do when the cache store is unavailable
    #[arg(
        long,
        value_enum,
        env = "FLEETSCOPE_CACHE_POLICY",
        default_value_t = PolicyArg::FailClosed
    )]
    cache_policy: PolicyArg,

    #[arg(long, env = "FLEETSCOPE_CACHE_TTL_DAYS", default_value_t = DEFAULT_CACHE_TTL_DAYS)]
    cache_ttl_days: i64,

    /// Directory of template overrides
    #[arg(long, env = "FLEETSCOPE_TEMPLATES")]
    templates_dir: Option<PathBuf>,

    /// Where merged results are written
    #[arg(long, env = "FLEETSCOPE_OUT_DIR", default_value = "arch-docs")]
    out_dir: PathBuf,

    /// Scratch directory for clones (default: system temp dir)
    #[arg(long, env = "FLEETSCOPE_WORKDIR")]
    workdir: Option<PathBuf>,

    /// Keep running passes until interrupted
    #[arg(long)]
    daemon: bool,

    /// Stop the daemon after this many passes
    #[arg(long, requires = "daemon")]
    max_passes: Option<u64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum PolicyArg {
    FailOpen,
    FailClosed,
}

impl From<PolicyArg> for CachePolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::FailOpen => CachePolicy::FailOpen,
            PolicyArg::FailClosed => CachePolicy::FailClosed,
        }
    }
}

/// Which backend holds analysis records and run checkpoints.
#[derive(Clone, Debug, PartialEq, Eq)]
enum StoreSpec {
    Memory,
    File(PathBuf),
    Surreal,
}

impl FromStr for StoreSpec {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "mem" | "memory" => Ok(StoreSpec::Memory),
            "surreal" => Ok(StoreSpec::Surreal),
            "file" => Ok(StoreSpec::File(PathBuf::from(DEFAULT_STORE_DIR))),
            other => match other.strip_prefix("file:") {
                Some(dir) if !dir.is_empty() => Ok(StoreSpec::File(PathBuf::from(dir))),
                _ => Err(format!(
                    "unknown store {other:?} (expected mem, file:<dir> or surreal)"
                )),
            },
        }
    }
}

struct Stores {
    analysis: Arc<dyn AnalysisStore>,
    checkpoints: Arc<dyn CheckpointLog>,
}

async fn open_stores(spec: &StoreSpec) -> Result<Stores> {
    let stores = match spec {
        StoreSpec::Memory => Stores {
            analysis: Arc::new(MemoryAnalysisStore::new()),
            checkpoints: Arc::new(MemoryCheckpointLog::new()),
        },
        StoreSpec::File(dir) => Stores {
            analysis: Arc::new(
                FsAnalysisStore::open(dir)
                    .with_context(|| format!("Failed to open store at {}", dir.display()))?,
            ),
            checkpoints: Arc::new(
                FsCheckpointLog::open(dir)
                    .with_context(|| format!("Failed to open run log at {}", dir.display()))?,
            ),
        },
        StoreSpec::Surreal => {
            let store = SurrealAnalysisStore::from_env()
                .await
                .context("Failed to connect to SurrealDB")?;
            let checkpoints = SurrealCheckpointLog::new(store.connection());
            Stores {
                analysis: Arc::new(store),
                checkpoints: Arc::new(checkpoints),
            }
        }
    };
    Ok(stores)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    fleetscope_core::init_tracing(cli.json, level);

    match cli.command {
        Commands::Classify { path, category } => cmd_classify(&path, category.as_deref(), cli.json),
        Commands::Pipeline {
            category,
            templates_dir,
        } => cmd_pipeline(&category, templates_dir.as_deref(), cli.json),
        Commands::Run(args) => {
            let stores = open_stores(&cli.store).await?;
            cmd_run(args, stores, cli.json).await
        }
        Commands::Cache { action } => {
            let stores = open_stores(&cli.store).await?;
            match action {
                CacheAction::List => cmd_cache_list(stores.analysis.as_ref(), cli.json).await,
                CacheAction::Show { repo, branch } => {
                    cmd_cache_show(stores.analysis.as_ref(), &repo, &branch, cli.json).await
                }
                CacheAction::Evict { repo, branch } => {
                    cmd_cache_evict(stores.analysis.as_ref(), &repo, &branch).await
                }
            }
        }
        Commands::Runs { repo, events } => {
            let stores = open_stores(&cli.store).await?;
            cmd_runs(stores.checkpoints.as_ref(), repo.as_deref(), events, cli.json).await
        }
        Commands::Health => {
            let stores = open_stores(&cli.store).await?;
            cmd_health(stores.analysis.as_ref()).await
        }
    }
}

fn build_config(args: &RunArgs) -> Result<FleetConfig> {
    let config = FleetConfig {
        chunk_size: args.chunk_size,
        sleep_interval: FleetConfig::sleep_hours(args.sleep_hours)?,
        force: args.force,
        force_step: args.force_step.clone(),
        model: ModelConfig {
            model: args.model.clone(),
            max_tokens: args.max_tokens,
        },
        category_override: args.category.clone(),
        cache_ttl: chrono::Duration::days(args.cache_ttl_days),
        cache_policy: args.cache_policy.into(),
        templates_dir: args.templates_dir.clone(),
        ..FleetConfig::default()
    };
    config.validate()?;
    Ok(config)
}

/// Run the fleet
async fn cmd_run(args: RunArgs, stores: Stores, json: bool) -> Result<()> {
    let config = build_config(&args)?;
    let manifest = FleetManifest::load(&args.manifest)?;
    let repos = manifest.descriptors();
    if repos.is_empty() {
        bail!("manifest {} lists no repositories", args.manifest.display());
    }

    let workdir = args
        .workdir
        .clone()
        .unwrap_or_else(|| std::env::temp_dir().join("fleetscope"));
    std::fs::create_dir_all(&workdir)
        .with_context(|| format!("Failed to create workdir {}", workdir.display()))?;

    let collaborators = Collaborators {
        clone: Arc::new(GitCloneProvider::from_env(&workdir)),
        analysis: Arc::new(HttpAnalysisProvider::from_env()?),
        publisher: Arc::new(FsResultPublisher::new(&args.out_dir)),
        store: stores.analysis,
        checkpoints: stores.checkpoints,
    };
    let engine = Arc::new(EngineContext::new(config, collaborators)?);
    let coordinator = FleetCoordinator::new(engine, repos);

    let (trigger, cancel) = shutdown_channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight steps");
            trigger.trigger();
        }
    });

    let mode = if args.daemon {
        RunMode::Daemon {
            max_passes: args.max_passes,
        }
    } else {
        RunMode::SinglePass
    };
    info!(
        repos = coordinator.repos().len(),
        out_dir = %args.out_dir.display(),
        daemon = args.daemon,
        "starting fleet investigation"
    );

    let mut last_failed = 0;
    coordinator
        .run_with(mode, &cancel, |summary| {
            last_failed = summary.failed;
            print_summary(summary, json);
        })
        .await;

    if !args.daemon && last_failed > 0 {
        bail!("{last_failed} repositories failed");
    }
    Ok(())
}

fn print_summary(summary: &FleetSummary, json: bool) {
    if json {
        match serde_json::to_string(summary) {
            Ok(line) => println!("{line}"),
            Err(e) => warn!(error = %e, "failed to serialise summary"),
        }
    } else {
        println!("{}", summary.render());
    }
}

/// Classify a local directory
fn cmd_classify(path: &Path, category: Option<&str>, json: bool) -> Result<()> {
    let tree = FileTree::scan(path)?;
    let classification = TypeClassifier::new().classify(&tree, category)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&classification)?);
        return Ok(());
    }

    println!(
        "{} (confidence {:.2}, {:?})",
        classification.category, classification.score.confidence, classification.source
    );
    for score in &classification.score.breakdown {
        println!(
            "  {:<14} {:.3}{}  files {:.2} dirs {:.2} manifests {:.2} source {:.2}",
            score.category.as_str(),
            score.total,
            if score.boosted { " *" } else { "" },
            score.file_score,
            score.dir_score,
            score.manifest_score,
            score.source_score,
        );
    }
    Ok(())
}

/// Print the step pipeline for a category
fn cmd_pipeline(category: &str, templates_dir: Option<&Path>, json: bool) -> Result<()> {
    let category = Category::parse(category)?;
    let mut catalog = TemplateCatalog::builtin();
    if let Some(dir) = templates_dir {
        catalog.load_dir(dir)?;
    }
    let pipeline = StepRegistry::with_catalog(catalog).build_pipeline(category)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&pipeline)?);
        return Ok(());
    }

    println!(
        "{} pipeline: {} steps, fingerprint {}",
        category,
        pipeline.len(),
        pipeline.fingerprint.short()
    );
    for (idx, resolved) in pipeline.steps.iter().enumerate() {
        let deps = if resolved.step.depends_on.is_empty() {
            String::new()
        } else {
            format!(" <- {}", resolved.step.depends_on.join(", "))
        };
        println!(
            "{:>3}. {} (v{}){}",
            idx + 1,
            resolved.id(),
            resolved.template.version,
            deps
        );
    }
    Ok(())
}

/// List cached records
async fn cmd_cache_list(store: &dyn AnalysisStore, json: bool) -> Result<()> {
    let records = store.list_records().await?;

    if json {
        let rows: Vec<_> = records
            .iter()
            .map(|r| {
                serde_json::json!({
                    "repo_id": r.repo_id,
                    "branch": r.branch,
                    "commit_id": r.commit_id,
                    "category": r.category,
                    "steps": r.steps.len(),
                    "created_at": r.created_at,
                    "expires_at": r.expires_at,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if records.is_empty() {
        println!("No cached records.");
        return Ok(());
    }
    let now = chrono::Utc::now();
    for record in records {
        println!(
            "{}@{} {} {} {} steps, analysed {}{}",
            record.repo_id,
            record.branch,
            &record.commit_id[..8.min(record.commit_id.len())],
            record.category,
            record.steps.len(),
            record.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
            if record.is_expired(now) { " (expired)" } else { "" }
        );
    }
    Ok(())
}

/// Show one record's merged result
async fn cmd_cache_show(
    store: &dyn AnalysisStore,
    repo: &str,
    branch: &str,
    json: bool,
) -> Result<()> {
    let Some(record) = store.get_record(&RecordSlot::new(repo, branch)).await? else {
        bail!("no cached record for {repo}@{branch}");
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&record)?);
    } else {
        println!("{}", fleetscope_core::MergedResult::from_record(&record).to_markdown());
    }
    Ok(())
}

/// Evict one record
async fn cmd_cache_evict(store: &dyn AnalysisStore, repo: &str, branch: &str) -> Result<()> {
    store
        .delete_record(&RecordSlot::new(repo, branch))
        .await
        .with_context(|| format!("Failed to evict {repo}@{branch}"))?;
    println!("Evicted {repo}@{branch}");
    Ok(())
}

/// List checkpointed runs
async fn cmd_runs(
    log: &dyn CheckpointLog,
    repo: Option<&str>,
    events: bool,
    json: bool,
) -> Result<()> {
    let mut runs = log.list_runs(repo).await?;
    runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    if json {
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(());
    }

    if runs.is_empty() {
        println!("No runs recorded.");
        return Ok(());
    }
    for run in runs {
        println!(
            "{} {} {} {}{}",
            run.run_id,
            run.repo_id,
            run.status.as_str(),
            run.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
            run.detail
                .as_deref()
                .map(|d| format!(" ({d})"))
                .unwrap_or_default()
        );
        if events {
            for event in log.events(&run.run_id).await? {
                println!("    #{} {} {}", event.seq, event.kind, event.payload);
            }
        }
    }
    Ok(())
}

/// Check store health
async fn cmd_health(store: &dyn AnalysisStore) -> Result<()> {
    store.ping().await.context("Analysis store is unreachable")?;
    println!("ok");
    Ok(())
}
