//! Stage execution: run a kind's external program for one instance.
//!
//! Each instance runs inside its own working directory. The executor renders
//! the stage templates, materializes the cached fetch if the kind declares
//! one, runs the program, keeps the captured output next to it as
//! `stdout.log`/`stderr.log`, and reports the declared artifacts.

use crate::cache::FingerprintCache;
use crate::core::instance::{ArtifactManifest, InstanceKey};
use crate::core::template::{render, TemplateContext};
use crate::error::{Error, Result};
use crate::pipeline::{KindSpec, FETCH_DIR, WORKDIR};
use crate::util::{blocking, remove_path};
use crate::{blog, blog_debug, blog_trace};
use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;

pub const STDOUT_LOG: &str = "stdout.log";
pub const STDERR_LOG: &str = "stderr.log";

/// What a dependent sees of one finished upstream.
#[derive(Debug, Clone, Default)]
pub struct UpstreamOutput {
    pub work_dir: PathBuf,
    pub artifacts: ArtifactManifest,
}

/// Everything needed to run one instance.
#[derive(Debug, Clone)]
pub struct StageJob {
    pub key: InstanceKey,
    pub work_dir: PathBuf,
    pub kind: Arc<KindSpec>,
    /// Upstream outputs keyed by dependency alias.
    pub upstream: BTreeMap<String, UpstreamOutput>,
}

impl StageJob {
    /// Template context with the instance's axes and working directory.
    pub fn local_context(&self) -> TemplateContext {
        let mut ctx = TemplateContext::from_params(&self.key.params);
        ctx.set_path(WORKDIR, &self.work_dir);
        ctx
    }

    /// Template context for the stage command: local names plus every
    /// upstream's working directory and artifacts.
    pub fn stage_context(&self) -> TemplateContext {
        let mut ctx = self.local_context();
        for (alias, upstream) in &self.upstream {
            ctx.set_path(&format!("upstream.{}.{}", alias, WORKDIR), &upstream.work_dir);
            for (name, path) in &upstream.artifacts {
                ctx.set_path(&format!("upstream.{}.{}", alias, name), path);
            }
        }
        ctx
    }

    /// Resolve a possibly relative path against the working directory.
    pub fn resolve_path(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.work_dir.join(path)
        }
    }
}

/// Captured result of a stage run.
#[derive(Debug, Clone, Default)]
pub struct StageOutput {
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub artifacts: ArtifactManifest,
    pub duration: Duration,
}

impl StageOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs the external collaborator of a ready instance.
///
/// An `Err` means the stage could not be run to completion at all (launch
/// failure, timeout, fetch failure) and marks the instance Errored; a
/// non-zero exit is a normal [`StageOutput`] left to the sanity gate.
pub trait StageExecutor: Send + Sync + 'static {
    fn execute(&self, job: &StageJob) -> impl Future<Output = Result<StageOutput>> + Send;
}

/// Runs stages as child processes.
#[derive(Default)]
pub struct ProcessExecutor {
    cache: Option<Arc<FingerprintCache>>,
}

impl ProcessExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `cache` for kinds that declare a fetch.
    pub fn with_cache(cache: Arc<FingerprintCache>) -> Self {
        Self { cache: Some(cache) }
    }

    async fn materialize_fetch(&self, job: &StageJob, ctx: &mut TemplateContext) -> Result<()> {
        let Some(fetch) = &job.kind.stage.fetch else {
            return Ok(());
        };
        let local = job.local_context();
        let locator = render(&fetch.locator, &local)?;
        let selector = fetch
            .selector
            .as_deref()
            .map(|s| render(s, &local))
            .transpose()?;
        let dest = job.resolve_path(&render(&fetch.into, &local)?);

        let cache = self.cache.as_ref().ok_or_else(|| Error::Fetch {
            locator: locator.clone(),
            reason: "no fetch cache configured".to_string(),
        })?;
        let resolution = cache.materialize(&locator, selector.as_deref(), &dest).await?;
        blog_debug!(
            "{}: fetched {} into {} (cache hit: {})",
            job.key,
            locator,
            dest.display(),
            resolution.is_hit()
        );
        ctx.set_path(FETCH_DIR, &dest);
        Ok(())
    }

    fn collect_artifacts(job: &StageJob) -> Result<ArtifactManifest> {
        let ctx = job.local_context();
        job.kind
            .artifacts
            .iter()
            .map(|(name, template)| Ok((name.clone(), job.resolve_path(&render(template, &ctx)?))))
            .collect()
    }
}

impl StageExecutor for ProcessExecutor {
    async fn execute(&self, job: &StageJob) -> Result<StageOutput> {
        // Leftovers from an earlier run must not satisfy this run's checks.
        let work_dir = job.work_dir.clone();
        blocking(move || {
            remove_path(&work_dir)?;
            std::fs::create_dir_all(&work_dir)?;
            Ok(())
        })
        .await?;

        let mut ctx = job.stage_context();
        self.materialize_fetch(job, &mut ctx).await?;

        let stage = &job.kind.stage;
        let program = render(&stage.program, &ctx)?;
        let args = stage
            .args
            .iter()
            .map(|arg| render(arg, &ctx))
            .collect::<Result<Vec<_>>>()?;
        let env = stage
            .env
            .iter()
            .map(|(name, value)| Ok((name.clone(), render(value, &ctx)?)))
            .collect::<Result<Vec<_>>>()?;

        let resolved = which::which_in(&program, std::env::var_os("PATH"), &job.work_dir)
            .map_err(|_| Error::ProgramNotFound(program.clone()))?;

        blog!("{}: running {} {}", job.key, resolved.display(), args.join(" "));
        let started = Instant::now();
        let child = Command::new(&resolved)
            .args(&args)
            .envs(env)
            .current_dir(&job.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| Error::Launch {
                program: program.clone(),
                source,
            })?;

        let output = match stage.timeout_secs.map(Duration::from_secs) {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| Error::Timeout(limit))??,
            None => child.wait_with_output().await?,
        };
        let duration = started.elapsed();

        tokio::fs::write(job.work_dir.join(STDOUT_LOG), &output.stdout).await?;
        tokio::fs::write(job.work_dir.join(STDERR_LOG), &output.stderr).await?;

        let exit_code = output.status.code();
        blog_debug!("{}: exit {:?} after {:?}", job.key, exit_code, duration);
        blog_trace!(
            "{}: stdout\n{}\nstderr\n{}",
            job.key,
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );

        Ok(StageOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            artifacts: Self::collect_artifacts(job)?,
            duration,
        })
    }
}
