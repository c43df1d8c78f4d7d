//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Creating temporary git repositories
//! - A counting mock fetcher
//! - A scripted stage executor
//! - The build/mesh/simulate pipeline used by several tests

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tempfile::TempDir;

use benchdag::cache::Fetcher;
use benchdag::core::{ArtifactManifest, InstanceKey, ParameterVector};
use benchdag::orchestration::{StageExecutor, StageJob, StageOutput};
use benchdag::pipeline::{DependencyTemplate, KindSpec, Pipeline};
use benchdag::{Error, Result};

/// A test repository with a temporary directory and initialized git.
pub struct TestRepo {
    /// The temporary directory containing the repo.
    pub temp_dir: TempDir,
    /// Path to the repository root.
    pub path: PathBuf,
}

impl TestRepo {
    /// Create a new test repository on `master` with an initial commit.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().join("origin");
        std::fs::create_dir_all(&path).expect("Failed to create repo dir");

        git(&path, &["init", "-q", "-b", "master"]);
        git(&path, &["config", "user.email", "test@test.com"]);
        git(&path, &["config", "user.name", "Test User"]);
        std::fs::write(path.join("README.md"), "# sod2d\n").expect("Failed to write README");
        git(&path, &["add", "."]);
        git(&path, &["commit", "-q", "-m", "Initial commit"]);

        Self { temp_dir, path }
    }

    /// Create `branch` from master with one extra file committed on it.
    pub fn branch_with_file(&self, branch: &str, filename: &str, content: &str) {
        git(&self.path, &["checkout", "-q", "-b", branch]);
        std::fs::write(self.path.join(filename), content).expect("Failed to write file");
        git(&self.path, &["add", filename]);
        git(&self.path, &["commit", "-q", "-m", &format!("add {}", filename)]);
        git(&self.path, &["checkout", "-q", "master"]);
    }

    /// Commit a new file on master.
    pub fn commit_on_master(&self, filename: &str, content: &str) {
        std::fs::write(self.path.join(filename), content).expect("Failed to write file");
        git(&self.path, &["add", filename]);
        git(&self.path, &["commit", "-q", "-m", &format!("add {}", filename)]);
    }

    pub fn locator(&self) -> String {
        self.path.to_string_lossy().to_string()
    }

    /// A scratch directory next to the repository.
    pub fn scratch(&self, name: &str) -> PathBuf {
        self.temp_dir.path().join(name)
    }
}

fn git(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("Failed to run git");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
}

/// Fetcher that writes a marker file and counts its invocations.
#[derive(Default)]
pub struct MockFetcher {
    pub calls: AtomicUsize,
    pub fail: AtomicBool,
    stall_ms: AtomicU64,
}

impl MockFetcher {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Make the next fetch sleep for `stall` before finishing.
    pub fn stall_next(&self, stall: Duration) {
        self.stall_ms.store(stall.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Fetcher for MockFetcher {
    fn fetch(&self, locator: &str, selector: Option<&str>, dest: &Path) -> Result<()> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let failing = self.fail.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(self.stall_ms.swap(0, Ordering::SeqCst)));
        std::fs::create_dir_all(dest)?;
        std::fs::write(dest.join("CMakeLists.txt"), format!("{} {:?} #{}", locator, selector, n))?;
        if failing {
            return Err(Error::Fetch {
                locator: locator.to_string(),
                reason: "connection reset".to_string(),
            });
        }
        Ok(())
    }
}

/// What a scripted stage does.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Script {
    Pass,
    Exit(i32),
    Error,
    Panic,
}

/// Executor that follows a per-kind script and records what it ran.
#[derive(Default)]
pub struct ScriptedExecutor {
    scripts: HashMap<String, Script>,
    delay: Duration,
    calls: Mutex<Vec<StageJob>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(mut self, kind: &str, script: Script) -> Self {
        self.scripts.insert(kind.to_string(), script);
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> Vec<StageJob> {
        self.calls.lock().unwrap().clone()
    }

    pub fn ran(&self, key: &InstanceKey) -> bool {
        self.calls.lock().unwrap().iter().any(|job| &job.key == key)
    }
}

impl StageExecutor for ScriptedExecutor {
    async fn execute(&self, job: &StageJob) -> Result<StageOutput> {
        self.calls.lock().unwrap().push(job.clone());
        tokio::time::sleep(self.delay).await;
        let exit_code = match self.scripts.get(&job.key.kind).copied().unwrap_or(Script::Pass) {
            Script::Pass => 0,
            Script::Exit(code) => code,
            Script::Error => return Err(Error::ProgramNotFound(job.kind.stage.program.clone())),
            Script::Panic => panic!("{} crashed", job.key),
        };
        let artifacts: ArtifactManifest = job
            .kind
            .artifacts
            .iter()
            .map(|(name, path)| (name.clone(), job.work_dir.join(path)))
            .collect();
        Ok(StageOutput {
            exit_code: Some(exit_code),
            artifacts,
            ..Default::default()
        })
    }
}

/// Build, mesh and simulate over `p_order ∈ {3,4}` and `n_elements ∈ {8,16}`.
pub fn sod2d_pipeline() -> Pipeline {
    Pipeline::new(vec![
        KindSpec::new("build", "cmake")
            .axis("p_order", [3i64, 4])
            .artifact("binary", "build/sod2d"),
        KindSpec::new("mesh", "gmsh")
            .axis("p_order", [3i64, 4])
            .axis("n_elements", [8i64, 16])
            .artifact("mesh", "mesh_{n_elements}_{p_order}.hdf"),
        KindSpec::new("simulate", "mpirun")
            .axis("p_order", [3i64, 4])
            .axis("n_elements", [8i64, 16])
            .depends(DependencyTemplate::new("build").join("p_order", "p_order"))
            .depends(
                DependencyTemplate::new("mesh")
                    .join("p_order", "p_order")
                    .join("n_elements", "n_elements"),
            )
            .args(["{upstream.build.binary}", "-m", "{upstream.mesh.mesh}"]),
    ])
    .expect("sod2d pipeline is valid")
}

pub fn key(kind: &str, pairs: &[(&str, i64)]) -> InstanceKey {
    let params = pairs
        .iter()
        .fold(ParameterVector::new(), |v, (axis, value)| v.with(axis, *value));
    InstanceKey::new(kind, params)
}

/// Path of the demo pipeline shipped with the crate.
pub fn demo_pipeline_path() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("demos").join("sod2d.toml")
}
