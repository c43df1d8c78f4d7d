//! Execution integration tests.
//!
//! These tests run whole pipelines through the scheduler, with the scripted
//! executor for control flow and with real `sh` stages for the process
//! executor and sanity gate.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use benchdag::core::{InstanceKey, InstanceStatus};
use benchdag::orchestration::{ProcessExecutor, Resolver, Scheduler, STDOUT_LOG};
use benchdag::pipeline::{CheckSpec, DependencyTemplate, KindSpec, Pipeline, Stream};
use benchdag::report::{RunReport, EXIT_INFRASTRUCTURE, EXIT_REGRESSION};

use crate::fixtures::{key, sod2d_pipeline, Script, ScriptedExecutor};

fn status_of(report: &RunReport, key: &InstanceKey) -> InstanceStatus {
    report
        .instances
        .iter()
        .find(|i| i.kind == key.kind && i.params == key.params)
        .map(|i| i.status.clone())
        .unwrap_or_else(|| panic!("{} not in report", key))
}

async fn run<E: benchdag::orchestration::StageExecutor>(
    pipeline: &Pipeline,
    work_root: &Path,
    executor: Arc<E>,
    jobs: usize,
) -> RunReport {
    let dag = Resolver::new(pipeline, work_root).build().unwrap();
    Scheduler::new(dag, pipeline, executor, jobs)
        .run(CancellationToken::new())
        .await
}

/// Test: an errored stage blocks its whole chain
/// Given A -> B -> C where A cannot be launched
/// When the pipeline runs
/// Then A is Errored, B and C are Blocked by A, and neither B nor C ever runs
#[tokio::test]
async fn test_errored_stage_blocks_chain() {
    let pipeline = Pipeline::new(vec![
        KindSpec::new("a", "cmake").axis("n", [1i64]),
        KindSpec::new("b", "gmsh")
            .axis("n", [1i64])
            .depends(DependencyTemplate::new("a").join("n", "n")),
        KindSpec::new("c", "mpirun")
            .axis("n", [1i64])
            .depends(DependencyTemplate::new("b").join("n", "n")),
    ])
    .unwrap();
    let executor = Arc::new(ScriptedExecutor::new().script("a", Script::Error));
    let report = run(&pipeline, Path::new("/tmp/benchdag-chain"), executor.clone(), 4).await;

    let a = key("a", &[("n", 1)]);
    let b = key("b", &[("n", 1)]);
    let c = key("c", &[("n", 1)]);
    assert!(matches!(status_of(&report, &a), InstanceStatus::Errored { .. }));
    for blocked in [&b, &c] {
        assert_eq!(
            status_of(&report, blocked),
            InstanceStatus::Blocked { by: a.to_string() }
        );
        assert!(!executor.ran(blocked));
    }
    assert!(executor.ran(&a));
    assert_eq!(report.exit_code(), EXIT_INFRASTRUCTURE);
}

/// Test: E2E scheduling of build, mesh and simulate
/// Given the sod2d pipeline and an executor where every stage passes
/// When it runs with two workers
/// Then all 12 instances pass and every simulation saw its build's binary
#[tokio::test]
async fn test_sod2d_pipeline_passes() {
    let pipeline = sod2d_pipeline();
    let executor = Arc::new(ScriptedExecutor::new().delay(Duration::from_millis(5)));
    let report = run(&pipeline, Path::new("/tmp/benchdag-e2e"), executor.clone(), 2).await;

    assert_eq!(report.passed, 12);
    assert_eq!(report.exit_code(), 0);

    let calls = executor.calls();
    assert_eq!(calls.len(), 12);
    for job in calls.iter().filter(|j| j.key.kind == "simulate") {
        let build = &job.upstream["build"];
        assert_eq!(build.artifacts["binary"], build.work_dir.join("build/sod2d"));
        assert!(job.upstream.contains_key("mesh"));
        let build_ran_first = calls
            .iter()
            .position(|j| j.work_dir == build.work_dir)
            .unwrap()
            < calls.iter().position(|j| j.key == job.key).unwrap();
        assert!(build_ran_first);
    }
}

/// Test: a failing mesh stops its simulations but not the builds
#[tokio::test]
async fn test_failed_mesh_is_a_regression() {
    let pipeline = sod2d_pipeline();
    let executor = Arc::new(ScriptedExecutor::new().script("mesh", Script::Exit(1)));
    let report = run(&pipeline, Path::new("/tmp/benchdag-e2e-fail"), executor.clone(), 3).await;

    assert_eq!(report.passed, 2);
    assert_eq!(report.failed, 4);
    assert_eq!(report.blocked, 4);
    assert_eq!(report.exit_code(), EXIT_REGRESSION);
    assert!(executor.calls().iter().all(|j| j.key.kind != "simulate"));
    assert_eq!(
        status_of(&report, &key("mesh", &[("p_order", 3), ("n_elements", 8)])),
        InstanceStatus::Failed {
            reasons: vec!["exited with code 1".to_string()]
        }
    );
}

fn shell_pipeline() -> Pipeline {
    Pipeline::new(vec![
        KindSpec::new("build", "sh")
            .axis("p", [3i64, 4])
            .args(["-c", "echo p={p} > binary.txt && echo nodes: {p}0"])
            .artifact("binary", "binary.txt")
            .check(CheckSpec::ExtractEq {
                pattern: r"nodes: (\d+)".to_string(),
                expected: "{p} * 10".to_string(),
                stream: Stream::Stdout,
            })
            .check(CheckSpec::FileExists {
                path: "binary.txt".to_string(),
            }),
        KindSpec::new("simulate", "sh")
            .axis("p", [3i64, 4])
            .depends(DependencyTemplate::new("build").join("p", "p"))
            .args(["-c", "cat {upstream.build.binary}"])
            .check(CheckSpec::Found {
                pattern: r"p=\d".to_string(),
                stream: Stream::Stdout,
            })
            .check(CheckSpec::NotFound {
                pattern: "p=4".to_string(),
                stream: Stream::Both,
            }),
    ])
    .unwrap()
}

/// Test: real stages and checks
/// Given sh stages where the p=4 simulation trips a not_found check
/// When the pipeline runs with the process executor
/// Then builds pass their extract check, simulate p=3 passes and p=4 fails
#[tokio::test]
async fn test_process_executor_pipeline() {
    let dir = tempfile::TempDir::new().unwrap();
    let pipeline = shell_pipeline();
    let report = run(&pipeline, dir.path(), Arc::new(ProcessExecutor::new()), 2).await;

    assert_eq!(status_of(&report, &key("build", &[("p", 3)])), InstanceStatus::Passed);
    assert_eq!(status_of(&report, &key("build", &[("p", 4)])), InstanceStatus::Passed);
    assert_eq!(status_of(&report, &key("simulate", &[("p", 3)])), InstanceStatus::Passed);
    assert!(matches!(
        status_of(&report, &key("simulate", &[("p", 4)])),
        InstanceStatus::Failed { .. }
    ));
    assert_eq!(report.exit_code(), EXIT_REGRESSION);

    let build = report
        .instances
        .iter()
        .find(|i| i.kind == "build" && i.params == key("build", &[("p", 3)]).params)
        .unwrap();
    assert_eq!(build.exit_code, Some(0));
    assert_eq!(
        std::fs::read_to_string(build.work_dir.join(STDOUT_LOG)).unwrap(),
        "nodes: 30\n"
    );
    assert_eq!(build.artifacts["binary"], build.work_dir.join("binary.txt"));
}

/// Test: the JSON report carries one entry per instance with its state
#[tokio::test]
async fn test_json_report() {
    let dir = tempfile::TempDir::new().unwrap();
    let pipeline = shell_pipeline();
    let report = run(&pipeline, dir.path(), Arc::new(ProcessExecutor::new()), 4).await;

    let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
    assert_eq!(json["passed"], 3);
    assert_eq!(json["failed"], 1);
    assert_eq!(json["cancelled"], false);
    let instances = json["instances"].as_array().unwrap();
    assert_eq!(instances.len(), 4);
    let failed: Vec<_> = instances.iter().filter(|i| i["state"] == "failed").collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0]["kind"], "simulate");
    assert!(failed[0]["reasons"][0].as_str().unwrap().contains("p=4"));
}

/// Test: cancellation stops a real running process
/// Given a stage sleeping for 30s and a dependent kind
/// When the run is cancelled shortly after it starts
/// Then the run ends promptly with the sleeper Errored and its dependent Blocked
#[tokio::test]
async fn test_cancel_running_process() {
    let dir = tempfile::TempDir::new().unwrap();
    let pipeline = Pipeline::new(vec![
        KindSpec::new("slow", "sleep").axis("n", [1i64]).args(["30"]),
        KindSpec::new("after", "true")
            .axis("n", [1i64])
            .depends(DependencyTemplate::new("slow").join("n", "n")),
    ])
    .unwrap();
    let dag = Resolver::new(&pipeline, dir.path()).build().unwrap();
    let scheduler = Scheduler::new(dag, &pipeline, Arc::new(ProcessExecutor::new()), 2);

    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let report = tokio::time::timeout(Duration::from_secs(10), scheduler.run(token))
        .await
        .expect("cancelled run should finish promptly");
    assert!(report.cancelled);
    assert_eq!(
        status_of(&report, &key("slow", &[("n", 1)])),
        InstanceStatus::Errored {
            error: "cancelled".to_string()
        }
    );
    assert!(matches!(
        status_of(&report, &key("after", &[("n", 1)])),
        InstanceStatus::Blocked { .. }
    ));
    assert_eq!(report.exit_code(), EXIT_INFRASTRUCTURE);
}

/// Test: a panicking stage is an infrastructure fault, not a hang
/// Given build -> mesh -> simulate where every mesh stage panics
/// When the pipeline runs
/// Then the run finishes, meshes are Errored and simulations are Blocked
#[tokio::test]
async fn test_panicking_stage_does_not_hang() {
    let pipeline = sod2d_pipeline();
    let executor = Arc::new(ScriptedExecutor::new().script("mesh", Script::Panic));
    let report = tokio::time::timeout(
        Duration::from_secs(10),
        run(&pipeline, Path::new("/tmp/benchdag-panic"), executor, 2),
    )
    .await
    .expect("a panicking stage must not hang the run");

    assert_eq!(report.passed, 2);
    assert_eq!(report.errored, 4);
    assert_eq!(report.blocked, 4);
    match status_of(&report, &key("mesh", &[("p_order", 3), ("n_elements", 8)])) {
        InstanceStatus::Errored { error } => assert!(error.contains("panicked"), "{}", error),
        other => panic!("expected Errored, got {:?}", other),
    }
    assert_eq!(report.exit_code(), EXIT_INFRASTRUCTURE);
}

/// Test: a re-run does not see the previous run's files
/// Given a stage that wrote its mesh in a first run
/// When the stage is changed to produce nothing and run again in the same work root
/// Then its file_exists check fails
#[tokio::test]
async fn test_rerun_over_existing_work_dir() {
    let dir = tempfile::TempDir::new().unwrap();
    let mesh = |script: &str| {
        Pipeline::new(vec![KindSpec::new("mesh", "sh")
            .axis("n", [8i64])
            .args(["-c", script])
            .check(CheckSpec::FileExists {
                path: "mesh_{n}.hdf".to_string(),
            })])
        .unwrap()
    };
    let mesh_key = key("mesh", &[("n", 8)]);

    let first = run(&mesh("touch mesh_{n}.hdf"), dir.path(), Arc::new(ProcessExecutor::new()), 1).await;
    assert_eq!(status_of(&first, &mesh_key), InstanceStatus::Passed);

    let second = run(&mesh("echo produced nothing"), dir.path(), Arc::new(ProcessExecutor::new()), 1).await;
    assert!(matches!(status_of(&second, &mesh_key), InstanceStatus::Failed { .. }));
    assert_eq!(second.exit_code(), EXIT_REGRESSION);
}
