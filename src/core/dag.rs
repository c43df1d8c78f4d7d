//! Instance DAG (Directed Acyclic Graph) for dependency management.
//!
//! Nodes are task instances; an edge `upstream -> dependent` carries the alias
//! under which the dependent sees the upstream's artifacts.

use crate::core::instance::{InstanceKey, InstanceStatus, TaskInstance};
use crate::error::{ConfigError, Error, Result};
use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, EdgeRef, Walker};
use petgraph::Direction;
use std::collections::HashMap;

/// Edge weight: the dependency alias declared on the dependent's kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub alias: String,
}

impl Dependency {
    pub fn new(alias: &str) -> Self {
        Self {
            alias: alias.to_string(),
        }
    }
}

/// The instance dependency graph.
pub struct InstanceDAG {
    graph: DiGraph<TaskInstance, Dependency>,
    index: HashMap<InstanceKey, NodeIndex>,
}

impl InstanceDAG {
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            index: HashMap::new(),
        }
    }

    /// Add an instance to the DAG.
    ///
    /// Instances are identified by their key; adding an equal key again
    /// returns the existing node.
    pub fn add_instance(&mut self, instance: TaskInstance) -> NodeIndex {
        if let Some(&index) = self.index.get(&instance.key) {
            return index;
        }
        let key = instance.key.clone();
        let index = self.graph.add_node(instance);
        self.index.insert(key, index);
        index
    }

    /// Record that `dependent` must wait for `upstream`.
    ///
    /// # Errors
    /// Returns an error if either instance is unknown, or a configuration
    /// error if the edge would close a cycle (the edge is rolled back).
    pub fn add_dependency(
        &mut self,
        upstream: &InstanceKey,
        dependent: &InstanceKey,
        dependency: Dependency,
    ) -> Result<()> {
        let from = self.node(upstream)?;
        let to = self.node(dependent)?;

        if let Some(existing) = self.graph.find_edge(from, to) {
            if self.graph[existing] == dependency {
                return Ok(());
            }
        }

        let edge = self.graph.add_edge(from, to, dependency);
        if is_cyclic_directed(&self.graph) {
            self.graph.remove_edge(edge);
            return Err(ConfigError::Cycle(format!("{} -> {}", upstream, dependent)).into());
        }
        Ok(())
    }

    fn node(&self, key: &InstanceKey) -> Result<NodeIndex> {
        self.index
            .get(key)
            .copied()
            .ok_or_else(|| Error::InstanceNotFound(key.to_string()))
    }

    pub fn get(&self, key: &InstanceKey) -> Option<&TaskInstance> {
        self.index
            .get(key)
            .and_then(|&index| self.graph.node_weight(index))
    }

    pub fn get_mut(&mut self, key: &InstanceKey) -> Option<&mut TaskInstance> {
        let index = *self.index.get(key)?;
        self.graph.node_weight_mut(index)
    }

    pub fn contains(&self, key: &InstanceKey) -> bool {
        self.index.contains_key(key)
    }

    pub fn instance_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn has_dependency(&self, upstream: &InstanceKey, dependent: &InstanceKey) -> bool {
        match (self.index.get(upstream), self.index.get(dependent)) {
            (Some(&a), Some(&b)) => self.graph.find_edge(a, b).is_some(),
            _ => false,
        }
    }

    /// Direct upstreams of an instance, with the alias of each edge.
    pub fn upstreams(&self, key: &InstanceKey) -> Vec<(&str, &TaskInstance)> {
        let Some(&index) = self.index.get(key) else {
            return Vec::new();
        };
        self.graph
            .edges_directed(index, Direction::Incoming)
            .map(|edge| (edge.weight().alias.as_str(), &self.graph[edge.source()]))
            .collect()
    }

    /// Direct dependents of an instance.
    pub fn dependents(&self, key: &InstanceKey) -> Vec<&TaskInstance> {
        let Some(&index) = self.index.get(key) else {
            return Vec::new();
        };
        self.graph
            .neighbors_directed(index, Direction::Outgoing)
            .map(|n| &self.graph[n])
            .collect()
    }

    /// Every instance reachable from `key` along dependency edges, excluding
    /// `key` itself.
    pub fn descendants(&self, key: &InstanceKey) -> Vec<InstanceKey> {
        let Some(&index) = self.index.get(key) else {
            return Vec::new();
        };
        Dfs::new(&self.graph, index)
            .iter(&self.graph)
            .filter(|&n| n != index)
            .map(|n| self.graph[n].key.clone())
            .collect()
    }

    /// All instances in insertion order.
    pub fn instances(&self) -> impl Iterator<Item = &TaskInstance> {
        self.graph.node_weights()
    }

    pub fn instances_of<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = &'a TaskInstance> + 'a {
        self.graph.node_weights().filter(move |i| i.key.kind == kind)
    }

    // ========== Scheduling Operations ==========

    /// Pending instances whose upstreams have all passed.
    pub fn ready_frontier(&self) -> Vec<InstanceKey> {
        self.graph
            .node_indices()
            .filter(|&index| {
                let instance = &self.graph[index];
                instance.status == InstanceStatus::Pending
                    && self
                        .graph
                        .neighbors_directed(index, Direction::Incoming)
                        .all(|up| self.graph[up].status == InstanceStatus::Passed)
            })
            .map(|index| self.graph[index].key.clone())
            .collect()
    }

    /// Instances currently marked Ready.
    pub fn ready_instances(&self) -> Vec<InstanceKey> {
        self.instances()
            .filter(|i| i.status == InstanceStatus::Ready)
            .map(|i| i.key.clone())
            .collect()
    }

    /// Block every not-yet-finished descendant of `key`.
    ///
    /// Returns the keys that changed state.
    pub fn block_descendants(&mut self, key: &InstanceKey) -> Vec<InstanceKey> {
        let by = key.to_string();
        let mut blocked = Vec::new();
        for descendant in self.descendants(key) {
            if let Some(instance) = self.get_mut(&descendant) {
                if instance.can_start() {
                    instance.block(&by);
                    blocked.push(descendant);
                }
            }
        }
        blocked
    }

    pub fn all_finished(&self) -> bool {
        self.instances().all(|i| i.is_finished())
    }

    pub fn count_where(&self, pred: impl Fn(&InstanceStatus) -> bool) -> usize {
        self.instances().filter(|i| pred(&i.status)).count()
    }

    /// Instances in topological order (every upstream before its dependents).
    pub fn topological_order(&self) -> Result<Vec<&TaskInstance>> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| {
            ConfigError::Cycle(format!("at {}", self.graph[cycle.node_id()].key))
        })?;
        Ok(sorted.into_iter().map(|index| &self.graph[index]).collect())
    }

    /// Partition the instances into waves: each instance sits one wave after
    /// its deepest upstream.
    pub fn waves(&self) -> Result<Vec<Vec<InstanceKey>>> {
        let mut depth: HashMap<&InstanceKey, usize> = HashMap::new();
        let mut waves: Vec<Vec<InstanceKey>> = Vec::new();
        for instance in self.topological_order()? {
            let level = self
                .upstreams(&instance.key)
                .into_iter()
                .filter_map(|(_, up)| depth.get(&up.key))
                .map(|d| d + 1)
                .max()
                .unwrap_or(0);
            depth.insert(&instance.key, level);
            if waves.len() <= level {
                waves.resize_with(level + 1, Vec::new);
            }
            waves[level].push(instance.key.clone());
        }
        Ok(waves)
    }
}

impl Default for InstanceDAG {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InstanceDAG {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceDAG")
            .field("instances", &self.instance_count())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}
