use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use benchdag::cache::FingerprintCache;
use benchdag::config::{hours, Config};
use benchdag::git::GitFetcher;
use benchdag::orchestration::{ExecutionPlan, ProcessExecutor, Resolver, Scheduler, SchedulerEvent};
use benchdag::pipeline::Pipeline;
use benchdag::report::{EXIT_CONFIG, EXIT_INFRASTRUCTURE};
use benchdag::{blog, blog_error, blog_warn, Result};

/// benchdag - parametrized benchmark pipeline runner with a cached source fetcher
#[derive(Parser, Debug)]
#[command(name = "benchdag")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    BENCHDAG_DEBUG=1     Enable debug logging (alternative to --debug)\n    BENCHDAG_LOG_LEVEL   error, warn, info, debug or trace\n    BENCHDAG_LOG=PATH    Log file (default ~/.benchdag/benchdag.log)")]
pub struct Cli {
    /// Enable debug logging
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Fetch a git repository through the cache and copy it to a destination
    Fetch {
        /// Repository URL or path
        locator: String,

        /// Destination directory (default: repository name)
        destination: Option<PathBuf>,

        /// Branch to check out
        #[arg(short = 'b', long)]
        branch: Option<String>,

        /// Reuse a cached clone younger than this many hours
        #[arg(long)]
        max_age_hours: Option<u64>,

        /// Cache directory
        #[arg(long)]
        cache_root: Option<PathBuf>,
    },

    /// Manage the fetch cache
    Cache {
        #[command(subcommand)]
        action: CacheCommand,
    },

    /// Resolve a pipeline and print its execution waves
    Plan {
        /// Pipeline definition (TOML)
        pipeline: PathBuf,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Run every instance of a pipeline
    Run {
        /// Pipeline definition (TOML)
        pipeline: PathBuf,

        /// Maximum number of stages running at once
        #[arg(short = 'j', long)]
        jobs: Option<usize>,

        /// Root of the per-instance working directories
        #[arg(long)]
        work_root: Option<PathBuf>,

        /// Run only this kind and the kinds it depends on
        #[arg(long)]
        only: Option<String>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,

        /// Reuse cached fetches younger than this many hours
        #[arg(long)]
        max_age_hours: Option<u64>,

        /// Cache directory
        #[arg(long)]
        cache_root: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CacheCommand {
    /// Remove expired cache slots and leftover staging directories
    Prune {
        /// Freshness window in hours
        #[arg(long)]
        max_age_hours: Option<u64>,

        /// Cache directory
        #[arg(long)]
        cache_root: Option<PathBuf>,
    },
}

fn main() {
    let cli = Cli::parse();

    benchdag::log::init_with_debug(cli.debug);
    blog!("benchdag starting: {:?}", cli.command);

    let code = match dispatch(cli.command) {
        Ok(code) => code,
        Err(e) => {
            blog_error!("{}", e);
            eprintln!("error: {}", e);
            if let Some(path) = benchdag::log::log_path() {
                eprintln!("details in {}", path.display());
            }
            if e.is_config() {
                EXIT_CONFIG
            } else {
                EXIT_INFRASTRUCTURE
            }
        }
    };
    std::process::exit(code);
}

fn dispatch(command: Command) -> Result<i32> {
    let config = Config::load()?;
    match command {
        Command::Fetch {
            locator,
            destination,
            branch,
            max_age_hours,
            cache_root,
        } => run_fetch(&config, &locator, destination, branch, max_age_hours, cache_root),
        Command::Cache {
            action: CacheCommand::Prune {
                max_age_hours,
                cache_root,
            },
        } => run_prune(&config, max_age_hours, cache_root),
        Command::Plan { pipeline, json } => run_plan(&config, &pipeline, json),
        Command::Run {
            pipeline,
            jobs,
            work_root,
            only,
            json,
            max_age_hours,
            cache_root,
        } => {
            let cache = open_cache(&config, cache_root, max_age_hours)?;
            let options = RunOptions {
                jobs: jobs.filter(|j| *j > 0).unwrap_or_else(|| config.jobs()),
                work_root: work_root.unwrap_or_else(|| config.work_root()),
                only,
                json,
            };
            run_pipeline(&pipeline, options, cache)
        }
    }
}

/// Build the fetch cache, command-line overrides first.
fn open_cache(
    config: &Config,
    cache_root: Option<PathBuf>,
    max_age_hours: Option<u64>,
) -> Result<Arc<FingerprintCache>> {
    let root = match cache_root {
        Some(root) => root,
        None => config.cache_root()?,
    };
    let max_age = max_age_hours
        .map(hours)
        .unwrap_or_else(|| config.max_age());
    let fetcher = Arc::new(GitFetcher::new(config.fetch_depth()));
    let mut cache = FingerprintCache::new(root, max_age, fetcher);
    if let Some(timeout) = config.fetch_timeout() {
        cache = cache.with_fetch_timeout(timeout);
    }
    Ok(Arc::new(cache))
}

/// Repository name from a locator: last path component without `.git`.
fn default_destination(locator: &str) -> PathBuf {
    let trimmed = locator.trim_end_matches('/');
    let name = trimmed
        .rsplit(['/', ':'])
        .next()
        .unwrap_or(trimmed);
    let name = name.strip_suffix(".git").unwrap_or(name);
    PathBuf::from(if name.is_empty() { "checkout" } else { name })
}

fn run_fetch(
    config: &Config,
    locator: &str,
    destination: Option<PathBuf>,
    branch: Option<String>,
    max_age_hours: Option<u64>,
    cache_root: Option<PathBuf>,
) -> Result<i32> {
    let cache = open_cache(config, cache_root, max_age_hours)?;
    let dest = destination.unwrap_or_else(|| default_destination(locator));
    let rt = tokio::runtime::Runtime::new()?;
    let resolution = rt.block_on(cache.materialize(locator, branch.as_deref(), &dest))?;
    println!(
        "{} {} -> {}",
        if resolution.is_hit() { "Reused" } else { "Fetched" },
        locator,
        dest.display()
    );
    Ok(0)
}

fn run_prune(
    config: &Config,
    max_age_hours: Option<u64>,
    cache_root: Option<PathBuf>,
) -> Result<i32> {
    let cache = open_cache(config, cache_root, max_age_hours)?;
    let rt = tokio::runtime::Runtime::new()?;
    let removed = rt.block_on(cache.prune())?;
    println!("Removed {} cache entries from {}", removed, cache.root().display());
    Ok(0)
}

fn run_plan(config: &Config, path: &Path, json: bool) -> Result<i32> {
    let pipeline = Pipeline::load(path)?;
    let (_, plan) = Resolver::new(&pipeline, &config.work_root()).plan()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
    } else {
        print!("{}", plan);
        println!("{} instances in {} waves", plan.instance_count(), plan.waves.len());
    }
    Ok(0)
}

struct RunOptions {
    jobs: usize,
    work_root: PathBuf,
    only: Option<String>,
    json: bool,
}

fn run_pipeline(path: &Path, options: RunOptions, cache: Arc<FingerprintCache>) -> Result<i32> {
    let mut pipeline = Pipeline::load(path)?;
    if let Some(kind) = &options.only {
        pipeline = pipeline.restrict_to(kind)?;
    }
    let (dag, plan) = Resolver::new(&pipeline, &options.work_root).plan()?;
    blog!(
        "running {} with {} instances in {} waves, {} jobs, work root {}",
        path.display(),
        dag.instance_count(),
        plan.waves.len(),
        options.jobs,
        options.work_root.display()
    );

    let rt = tokio::runtime::Runtime::new()?;
    let report = rt.block_on(async {
        let cancel = CancellationToken::new();
        let on_interrupt = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                blog_warn!("interrupt received, cancelling run");
                eprintln!("interrupted, cancelling running stages");
                on_interrupt.cancel();
            }
        });

        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let progress = tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                if let Some(line) = progress_line(&event, &plan) {
                    eprintln!("{}", line);
                }
            }
        });

        let executor = Arc::new(ProcessExecutor::with_cache(cache));
        let report = Scheduler::new(dag, &pipeline, executor, options.jobs)
            .with_events(event_tx)
            .run(cancel)
            .await;
        let _ = progress.await;
        report
    });

    if options.json {
        println!("{}", report.to_json()?);
    } else {
        print!("{}", report.render_table());
    }
    Ok(report.exit_code())
}

/// One stderr progress line per scheduler event.
fn progress_line(event: &SchedulerEvent, plan: &ExecutionPlan) -> Option<String> {
    match event {
        SchedulerEvent::InstanceStarted { key } => Some(match plan.wave_of(key) {
            Some(wave) => format!("[start]   {} (wave {}/{})", key, wave + 1, plan.waves.len()),
            None => format!("[start]   {}", key),
        }),
        SchedulerEvent::InstanceFinished { key, status } => {
            Some(format!("[{:<7}] {}", status.label(), key))
        }
        SchedulerEvent::InstanceBlocked { key, by } => {
            Some(format!("[blocked] {} (by {})", key, by))
        }
        SchedulerEvent::AllInstancesSettled => None,
    }
}
