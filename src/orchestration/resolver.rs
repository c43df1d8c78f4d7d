//! Task graph resolution.
//!
//! The resolver enumerates every kind's parameter space, then wires each
//! instance to the one upstream instance per dependency template that its
//! translated predicate selects.

use crate::blog_debug;
use crate::core::dag::{Dependency, InstanceDAG};
use crate::core::instance::{InstanceKey, TaskInstance};
use crate::core::param::{enumerate, ParamValue};
use crate::error::{ConfigError, Result};
use crate::pipeline::Pipeline;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

/// Waves of instances: everything in wave `n` depends only on earlier waves.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ExecutionPlan {
    pub waves: Vec<Vec<InstanceKey>>,
}

impl ExecutionPlan {
    pub fn instance_count(&self) -> usize {
        self.waves.iter().map(Vec::len).sum()
    }

    /// Index of the wave containing `key`.
    pub fn wave_of(&self, key: &InstanceKey) -> Option<usize> {
        self.waves.iter().position(|wave| wave.contains(key))
    }
}

impl std::fmt::Display for ExecutionPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (n, wave) in self.waves.iter().enumerate() {
            writeln!(f, "wave {} ({} instances)", n, wave.len())?;
            for key in wave {
                writeln!(f, "  {}", key)?;
            }
        }
        Ok(())
    }
}

fn describe(predicate: &BTreeMap<String, ParamValue>) -> String {
    if predicate.is_empty() {
        return "{}".to_string();
    }
    let pairs: Vec<String> = predicate
        .iter()
        .map(|(axis, value)| format!("{}={}", axis, value))
        .collect();
    format!("{{{}}}", pairs.join(", "))
}

/// Builds the instance DAG for a pipeline.
pub struct Resolver<'a> {
    pipeline: &'a Pipeline,
    work_root: PathBuf,
}

impl<'a> Resolver<'a> {
    pub fn new(pipeline: &'a Pipeline, work_root: &Path) -> Self {
        Self {
            pipeline,
            work_root: work_root.to_path_buf(),
        }
    }

    /// Enumerate and connect every instance.
    ///
    /// # Errors
    /// Any [`ConfigError`]: kind cycles, empty axes, or a dependency
    /// predicate that selects zero or several upstream instances.
    pub fn build(&self) -> Result<InstanceDAG> {
        self.pipeline.validate()?;

        let mut dag = InstanceDAG::new();
        let mut by_kind: HashMap<&str, Vec<InstanceKey>> = HashMap::new();

        for kind in self.pipeline.kinds() {
            let keys: Vec<InstanceKey> = enumerate(&kind.name, &kind.axes)?
                .into_iter()
                .map(|params| InstanceKey::new(&kind.name, params))
                .collect();
            for key in &keys {
                dag.add_instance(TaskInstance::new(key.clone(), &self.work_root));
            }
            blog_debug!("kind {} enumerated {} instances", kind.name, keys.len());
            by_kind.insert(kind.name.as_str(), keys);
        }

        for kind in self.pipeline.kinds() {
            let dependents = by_kind.get(kind.name.as_str()).cloned().unwrap_or_default();
            for dependent in &dependents {
                for template in &kind.dependencies {
                    let predicate = template.predicate(&dependent.params);
                    let candidates = by_kind
                        .get(template.target.as_str())
                        .map(Vec::as_slice)
                        .unwrap_or_default();
                    let matches: Vec<&InstanceKey> = candidates
                        .iter()
                        .filter(|candidate| candidate.params.satisfies(&predicate))
                        .collect();
                    match matches.as_slice() {
                        [upstream] => {
                            dag.add_dependency(upstream, dependent, Dependency::new(template.alias()))?;
                        }
                        [] => {
                            return Err(ConfigError::NoMatch {
                                instance: dependent.to_string(),
                                target: template.target.clone(),
                                predicate: describe(&predicate),
                            }
                            .into())
                        }
                        many => {
                            return Err(ConfigError::AmbiguousMatch {
                                instance: dependent.to_string(),
                                target: template.target.clone(),
                                predicate: describe(&predicate),
                                count: many.len(),
                            }
                            .into())
                        }
                    }
                }
            }
        }

        blog_debug!(
            "resolved {} instances with {} dependencies",
            dag.instance_count(),
            dag.dependency_count()
        );
        Ok(dag)
    }

    /// Group the DAG into execution waves.
    pub fn schedule(dag: &InstanceDAG) -> Result<ExecutionPlan> {
        Ok(ExecutionPlan { waves: dag.waves()? })
    }

    /// [`build`](Self::build) followed by [`schedule`](Self::schedule).
    pub fn plan(&self) -> Result<(InstanceDAG, ExecutionPlan)> {
        let dag = self.build()?;
        let plan = Self::schedule(&dag)?;
        Ok((dag, plan))
    }
}
