//! Pipeline resolution integration tests.
//!
//! These tests verify that parameter spaces enumerate deterministically and
//! that dependency templates resolve to exactly one upstream instance.

use std::path::Path;

use tokio_test::assert_err;

use benchdag::core::{enumerate, ParamValue, ParameterVector};
use benchdag::orchestration::Resolver;
use benchdag::pipeline::{DependencyTemplate, KindSpec, Pipeline};
use benchdag::{ConfigError, Error};

use crate::fixtures::{demo_pipeline_path, key, sod2d_pipeline};

fn work_root() -> &'static Path {
    Path::new("/tmp/benchdag-it")
}

/// Test: enumeration order is fixed
/// Given the simulate kind declared as p_order then n_elements
/// When it is enumerated twice
/// Then both runs agree and p_order varies slowest
#[test]
fn test_enumeration_is_deterministic() {
    let pipeline = sod2d_pipeline();
    let sim = pipeline.kind("simulate").unwrap();

    let first = enumerate(&sim.name, &sim.axes).unwrap();
    let second = enumerate(&sim.name, &sim.axes).unwrap();
    assert_eq!(first, second);

    let rendered: Vec<String> = first.iter().map(ParameterVector::to_string).collect();
    assert_eq!(
        rendered,
        vec![
            "p_order=3,n_elements=8",
            "p_order=3,n_elements=16",
            "p_order=4,n_elements=8",
            "p_order=4,n_elements=16",
        ]
    );
}

/// Test: E2E resolution of the sod2d shape
/// Given build(p_order), mesh(p_order, n_elements), simulate(p_order, n_elements)
/// When the DAG is built
/// Then each of the 4 simulate instances has exactly one build and one mesh upstream
#[test]
fn test_each_simulation_has_one_build_and_one_mesh() {
    let pipeline = sod2d_pipeline();
    let dag = Resolver::new(&pipeline, work_root()).build().unwrap();

    let simulations: Vec<_> = dag.instances_of("simulate").map(|i| i.key.clone()).collect();
    assert_eq!(simulations.len(), 4);

    for sim in &simulations {
        let ups = dag.upstreams(sim);
        assert_eq!(ups.len(), 2, "{} should have two upstreams", sim);
        let build = ups.iter().find(|(alias, _)| *alias == "build").unwrap().1;
        let mesh = ups.iter().find(|(alias, _)| *alias == "mesh").unwrap().1;
        assert_eq!(build.key.params.get("p_order"), sim.params.get("p_order"));
        assert_eq!(mesh.key.params, sim.params);
    }

    // p_order=3 resolves to build p_order=3 regardless of n_elements.
    for n in [8, 16] {
        assert!(dag.has_dependency(
            &key("build", &[("p_order", 3)]),
            &key("simulate", &[("p_order", 3), ("n_elements", n)])
        ));
        assert!(!dag.has_dependency(
            &key("build", &[("p_order", 4)]),
            &key("simulate", &[("p_order", 3), ("n_elements", n)])
        ));
    }
}

/// Test: work directories never collide
#[test]
fn test_work_dirs_are_unique() {
    let pipeline = sod2d_pipeline();
    let dag = Resolver::new(&pipeline, work_root()).build().unwrap();
    let mut dirs: Vec<_> = dag.instances().map(|i| i.work_dir.clone()).collect();
    let total = dirs.len();
    dirs.sort();
    dirs.dedup();
    assert_eq!(dirs.len(), total);
    assert!(dirs.iter().all(|d| d.starts_with(work_root())));
}

/// Test: a template without join axes is ambiguous
/// Given simulate depending on build with no predicate
/// When build has two instances
/// Then resolution fails with AmbiguousMatch before anything runs
#[test]
fn test_unconstrained_dependency_is_ambiguous() {
    let pipeline = Pipeline::new(vec![
        KindSpec::new("build", "cmake").axis("p_order", [3i64, 4]),
        KindSpec::new("simulate", "mpirun")
            .axis("p_order", [3i64])
            .depends(DependencyTemplate::new("build")),
    ])
    .unwrap();

    let err = assert_err!(Resolver::new(&pipeline, work_root()).build());
    assert!(matches!(
        err,
        Error::Config(ConfigError::AmbiguousMatch { count: 2, .. })
    ));
}

/// Test: kind cycles are rejected up front
/// Given build depending on simulate and simulate depending on build
/// When the pipeline is loaded
/// Then a Cycle configuration error names both kinds
#[test]
fn test_build_simulate_cycle_is_rejected() {
    let source = r#"
[[kind]]
name = "build"
axes = [{ name = "p_order", values = [3] }]
depends = [{ target = "simulate", on = { p_order = "p_order" } }]
stage = { program = "cmake" }

[[kind]]
name = "simulate"
axes = [{ name = "p_order", values = [3] }]
depends = [{ target = "build", on = { p_order = "p_order" } }]
stage = { program = "mpirun" }
"#;
    match Pipeline::from_toml_str(source) {
        Err(Error::Config(ConfigError::Cycle(msg))) => {
            assert!(msg.contains("build") && msg.contains("simulate"), "{}", msg);
        }
        Err(other) => panic!("expected a cycle, got {}", other),
        Ok(_) => panic!("expected a cycle, got a pipeline"),
    }
}

/// Test: the shipped demo pipeline resolves
#[test]
fn test_demo_pipeline_plans() {
    let pipeline = Pipeline::load(&demo_pipeline_path()).unwrap();
    let (dag, plan) = Resolver::new(&pipeline, work_root()).plan().unwrap();

    assert_eq!(dag.instance_count(), 20);
    assert_eq!(plan.waves.len(), 4);
    let kinds_in_wave: Vec<Vec<&str>> = plan
        .waves
        .iter()
        .map(|wave| {
            let mut kinds: Vec<&str> = wave.iter().map(|k| k.kind.as_str()).collect();
            kinds.dedup();
            kinds
        })
        .collect();
    assert_eq!(
        kinds_in_wave,
        vec![vec!["build"], vec!["mesh"], vec!["simulate"], vec!["analyze"]]
    );

    // The reference side of every comparison is the master simulation.
    for analyze in dag.instances_of("analyze") {
        let ups = dag.upstreams(&analyze.key);
        let reference = ups.iter().find(|(alias, _)| *alias == "reference").unwrap().1;
        let candidate = ups.iter().find(|(alias, _)| *alias == "candidate").unwrap().1;
        assert_eq!(
            reference.key.params.get("branch"),
            Some(&ParamValue::from("master"))
        );
        assert_eq!(
            candidate.key.params.get("branch"),
            Some(&ParamValue::from("bsc-epicure-opt"))
        );
    }

    // Meshes are built with the master tools only.
    for mesh in dag.instances_of("mesh") {
        let ups = dag.upstreams(&mesh.key);
        assert_eq!(ups.len(), 1);
        assert_eq!(ups[0].0, "tools");
        assert_eq!(ups[0].1.key.params.get("branch"), Some(&ParamValue::from("master")));
    }
}

/// Test: --only keeps the requested kind and its ancestors
#[test]
fn test_restrict_demo_to_mesh() {
    let pipeline = Pipeline::load(&demo_pipeline_path()).unwrap();
    let only_mesh = pipeline.restrict_to("mesh").unwrap();
    let names: Vec<&str> = only_mesh.kinds().iter().map(|k| k.name.as_str()).collect();
    assert_eq!(names, vec!["build", "mesh"]);
    let dag = Resolver::new(&only_mesh, work_root()).build().unwrap();
    assert_eq!(dag.instance_count(), 8);
}
