//! Pipeline definition: task kinds, their axes, dependency templates, stage
//! hooks, artifacts and sanity checks.
//!
//! A pipeline is declared in TOML and validated as a whole before anything is
//! enumerated, so that a broken definition never reaches the scheduler:
//!
//! ```toml
//! [[kind]]
//! name = "simulate"
//! axes = [
//!   { name = "p_order", values = [3, 4] },
//!   { name = "n_elements", values = [8, 16] },
//! ]
//! depends = [
//!   { target = "build", on = { p_order = "p_order" } },
//!   { target = "mesh", on = { p_order = "p_order", n_elements = "n_elements" } },
//! ]
//! stage = { program = "mpirun", args = ["-np", "4", "{upstream.build.binary}"] }
//! ```

use crate::core::expr::{self, ExprError};
use crate::core::param::{ParamValue, ParameterAxis, ParameterVector};
use crate::core::template;
use crate::error::{ConfigError, Result};
use petgraph::algo::tarjan_scc;
use petgraph::graph::DiGraph;
use regex::Regex;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

/// Placeholder naming the instance working directory.
pub const WORKDIR: &str = "workdir";
/// Placeholder naming the materialized fetch directory.
pub const FETCH_DIR: &str = "fetch_dir";

/// A whole pipeline: every task kind, in declaration order.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Pipeline {
    #[serde(rename = "kind", default)]
    kinds: Vec<KindSpec>,
}

/// A named stage type.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KindSpec {
    pub name: String,
    #[serde(default)]
    pub axes: Vec<ParameterAxis>,
    #[serde(default, rename = "depends")]
    pub dependencies: Vec<DependencyTemplate>,
    pub stage: StageSpec,
    #[serde(default)]
    pub checks: Vec<CheckSpec>,
    /// Artifact name to path template, relative to the working directory.
    #[serde(default)]
    pub artifacts: BTreeMap<String, String>,
}

/// Which upstream instance a dependent waits for.
///
/// `on` maps this kind's axis names to the target kind's axis names; `pin`
/// fixes target axes to literal values. Every target instance satisfying
/// both is a match, and exactly one must match.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DependencyTemplate {
    pub target: String,
    #[serde(default)]
    pub on: BTreeMap<String, String>,
    #[serde(default)]
    pub pin: BTreeMap<String, ParamValue>,
    pub alias: Option<String>,
}

/// How to run a kind's external collaborator.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct StageSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub timeout_secs: Option<u64>,
    pub fetch: Option<FetchSpec>,
}

/// A cached source fetch materialized into the working directory before the
/// stage runs.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FetchSpec {
    pub locator: String,
    pub selector: Option<String>,
    #[serde(default = "default_fetch_into")]
    pub into: String,
}

fn default_fetch_into() -> String {
    "src".to_string()
}

/// Which captured stream a check inspects.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Stream {
    #[default]
    Stdout,
    Stderr,
    Both,
}

/// One structured sanity check.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum CheckSpec {
    Found {
        pattern: String,
        #[serde(default)]
        stream: Stream,
    },
    NotFound {
        pattern: String,
        #[serde(default)]
        stream: Stream,
    },
    ExtractEq {
        pattern: String,
        expected: String,
        #[serde(default)]
        stream: Stream,
    },
    CountEq {
        pattern: String,
        expected: String,
        #[serde(default)]
        stream: Stream,
    },
    FileExists {
        path: String,
    },
    FileContains {
        path: String,
        pattern: String,
    },
    ExitCode {
        expected: i32,
    },
}

impl CheckSpec {
    fn pattern(&self) -> Option<&str> {
        match self {
            CheckSpec::Found { pattern, .. }
            | CheckSpec::NotFound { pattern, .. }
            | CheckSpec::ExtractEq { pattern, .. }
            | CheckSpec::CountEq { pattern, .. }
            | CheckSpec::FileContains { pattern, .. } => Some(pattern),
            CheckSpec::FileExists { .. } | CheckSpec::ExitCode { .. } => None,
        }
    }

    fn expected_expr(&self) -> Option<&str> {
        match self {
            CheckSpec::ExtractEq { expected, .. } | CheckSpec::CountEq { expected, .. } => {
                Some(expected)
            }
            _ => None,
        }
    }

    fn path(&self) -> Option<&str> {
        match self {
            CheckSpec::FileExists { path } | CheckSpec::FileContains { path, .. } => Some(path),
            _ => None,
        }
    }
}

impl DependencyTemplate {
    pub fn new(target: &str) -> Self {
        Self {
            target: target.to_string(),
            on: BTreeMap::new(),
            pin: BTreeMap::new(),
            alias: None,
        }
    }

    /// Join this kind's `axis` to the target's `target_axis`.
    pub fn join(mut self, axis: &str, target_axis: &str) -> Self {
        self.on.insert(axis.to_string(), target_axis.to_string());
        self
    }

    pub fn pin(mut self, target_axis: &str, value: impl Into<ParamValue>) -> Self {
        self.pin.insert(target_axis.to_string(), value.into());
        self
    }

    pub fn with_alias(mut self, alias: &str) -> Self {
        self.alias = Some(alias.to_string());
        self
    }

    /// Name under which the upstream's artifacts are visible.
    pub fn alias(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.target)
    }

    /// The predicate in the target's axis space for a dependent with `params`.
    pub fn predicate(&self, params: &ParameterVector) -> BTreeMap<String, ParamValue> {
        let mut predicate = self.pin.clone();
        for (axis, target_axis) in &self.on {
            if let Some(value) = params.get(axis) {
                predicate.insert(target_axis.clone(), value.clone());
            }
        }
        predicate
    }
}

impl KindSpec {
    pub fn new(name: &str, program: &str) -> Self {
        Self {
            name: name.to_string(),
            axes: Vec::new(),
            dependencies: Vec::new(),
            stage: StageSpec {
                program: program.to_string(),
                ..Default::default()
            },
            checks: Vec::new(),
            artifacts: BTreeMap::new(),
        }
    }

    pub fn axis<V: Into<ParamValue>>(mut self, name: &str, values: impl IntoIterator<Item = V>) -> Self {
        self.axes.push(ParameterAxis::new(name, values));
        self
    }

    pub fn depends(mut self, template: DependencyTemplate) -> Self {
        self.dependencies.push(template);
        self
    }

    pub fn args<S: Into<String>>(mut self, args: impl IntoIterator<Item = S>) -> Self {
        self.stage.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn check(mut self, check: CheckSpec) -> Self {
        self.checks.push(check);
        self
    }

    pub fn artifact(mut self, name: &str, path: &str) -> Self {
        self.artifacts.insert(name.to_string(), path.to_string());
        self
    }

    pub fn fetch(mut self, fetch: FetchSpec) -> Self {
        self.stage.fetch = Some(fetch);
        self
    }

    fn has_axis(&self, axis: &str) -> bool {
        self.axes.iter().any(|a| a.name == axis)
    }
}

impl Pipeline {
    /// Build and validate a pipeline from kinds declared in code.
    pub fn new(kinds: Vec<KindSpec>) -> Result<Self> {
        let pipeline = Self { kinds };
        pipeline.validate()?;
        Ok(pipeline)
    }

    pub fn from_toml_str(source: &str) -> Result<Self> {
        let pipeline: Self = toml::from_str(source)?;
        pipeline.validate()?;
        Ok(pipeline)
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::from_toml_str(&std::fs::read_to_string(path)?)
    }

    pub fn kinds(&self) -> &[KindSpec] {
        &self.kinds
    }

    pub fn kind(&self, name: &str) -> Option<&KindSpec> {
        self.kinds.iter().find(|k| k.name == name)
    }

    /// Keep only `target` and the kinds it transitively depends on.
    pub fn restrict_to(&self, target: &str) -> Result<Self> {
        if self.kind(target).is_none() {
            return Err(ConfigError::UnknownKind {
                kind: "--only".to_string(),
                target: target.to_string(),
            }
            .into());
        }
        let mut keep = BTreeSet::new();
        let mut stack = vec![target.to_string()];
        while let Some(name) = stack.pop() {
            if !keep.insert(name.clone()) {
                continue;
            }
            if let Some(kind) = self.kind(&name) {
                stack.extend(kind.dependencies.iter().map(|d| d.target.clone()));
            }
        }
        Self::new(
            self.kinds
                .iter()
                .filter(|k| keep.contains(&k.name))
                .cloned()
                .collect(),
        )
    }

    /// Check the whole definition.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let mut by_name: HashMap<&str, &KindSpec> = HashMap::new();
        for kind in &self.kinds {
            if by_name.insert(kind.name.as_str(), kind).is_some() {
                return Err(ConfigError::DuplicateKind(kind.name.clone()));
            }
        }

        for kind in &self.kinds {
            validate_axes(kind)?;
            validate_dependencies(kind, &by_name)?;
        }

        self.check_kind_cycles()?;

        for kind in &self.kinds {
            validate_templates(kind, &by_name)?;
            validate_checks(kind)?;
        }
        Ok(())
    }

    fn check_kind_cycles(&self) -> std::result::Result<(), ConfigError> {
        let mut graph = DiGraph::<&str, ()>::new();
        let nodes: HashMap<&str, _> = self
            .kinds
            .iter()
            .map(|k| (k.name.as_str(), graph.add_node(k.name.as_str())))
            .collect();
        for kind in &self.kinds {
            for dep in &kind.dependencies {
                graph.add_edge(nodes[dep.target.as_str()], nodes[kind.name.as_str()], ());
            }
        }
        for component in tarjan_scc(&graph) {
            let cyclic = component.len() > 1
                || graph.find_edge(component[0], component[0]).is_some();
            if cyclic {
                let mut names: Vec<&str> = component.iter().map(|&n| graph[n]).collect();
                names.sort_unstable();
                return Err(ConfigError::Cycle(format!("between kinds {}", names.join(", "))));
            }
        }
        Ok(())
    }
}

fn validate_axes(kind: &KindSpec) -> std::result::Result<(), ConfigError> {
    let mut seen = BTreeSet::new();
    for axis in &kind.axes {
        if !seen.insert(axis.name.as_str()) {
            return Err(ConfigError::DuplicateAxis {
                kind: kind.name.clone(),
                axis: axis.name.clone(),
            });
        }
        if axis.values.is_empty() {
            return Err(ConfigError::EmptyAxis {
                kind: kind.name.clone(),
                axis: axis.name.clone(),
            });
        }
    }
    Ok(())
}

fn validate_dependencies(
    kind: &KindSpec,
    by_name: &HashMap<&str, &KindSpec>,
) -> std::result::Result<(), ConfigError> {
    let mut aliases = BTreeSet::new();
    for dep in &kind.dependencies {
        let target = by_name
            .get(dep.target.as_str())
            .ok_or_else(|| ConfigError::UnknownKind {
                kind: kind.name.clone(),
                target: dep.target.clone(),
            })?;
        if !aliases.insert(dep.alias()) {
            return Err(ConfigError::DuplicateAlias {
                kind: kind.name.clone(),
                alias: dep.alias().to_string(),
            });
        }
        for (axis, target_axis) in &dep.on {
            if !kind.has_axis(axis) {
                return Err(unknown_axis(kind, &kind.name, axis));
            }
            if !target.has_axis(target_axis) {
                return Err(unknown_axis(kind, &target.name, target_axis));
            }
        }
        for target_axis in dep.pin.keys() {
            if !target.has_axis(target_axis) {
                return Err(unknown_axis(kind, &target.name, target_axis));
            }
        }
    }
    Ok(())
}

fn unknown_axis(kind: &KindSpec, owner: &str, axis: &str) -> ConfigError {
    ConfigError::UnknownAxis {
        kind: kind.name.clone(),
        owner: owner.to_string(),
        axis: axis.to_string(),
    }
}

/// Placeholders a kind's stage may use.
fn stage_names(kind: &KindSpec, by_name: &HashMap<&str, &KindSpec>) -> BTreeSet<String> {
    let mut names: BTreeSet<String> = kind.axes.iter().map(|a| a.name.clone()).collect();
    names.insert(WORKDIR.to_string());
    if kind.stage.fetch.is_some() {
        names.insert(FETCH_DIR.to_string());
    }
    for dep in &kind.dependencies {
        names.insert(format!("upstream.{}.{}", dep.alias(), WORKDIR));
        if let Some(target) = by_name.get(dep.target.as_str()) {
            for artifact in target.artifacts.keys() {
                names.insert(format!("upstream.{}.{}", dep.alias(), artifact));
            }
        }
    }
    names
}

fn check_placeholders(
    kind: &KindSpec,
    text: &str,
    allowed: &BTreeSet<String>,
) -> std::result::Result<(), ConfigError> {
    let names = template::placeholders(text).map_err(|e| ConfigError::InvalidPattern {
        kind: kind.name.clone(),
        pattern: text.to_string(),
        reason: e.to_string(),
    })?;
    for name in names {
        if !allowed.contains(&name) {
            return Err(ConfigError::UnknownPlaceholder {
                kind: kind.name.clone(),
                placeholder: name,
            });
        }
    }
    Ok(())
}

fn validate_templates(
    kind: &KindSpec,
    by_name: &HashMap<&str, &KindSpec>,
) -> std::result::Result<(), ConfigError> {
    let stage = stage_names(kind, by_name);
    check_placeholders(kind, &kind.stage.program, &stage)?;
    for text in kind.stage.args.iter().chain(kind.stage.env.values()) {
        check_placeholders(kind, text, &stage)?;
    }

    let mut local: BTreeSet<String> = kind.axes.iter().map(|a| a.name.clone()).collect();
    if let Some(fetch) = &kind.stage.fetch {
        check_placeholders(kind, &fetch.locator, &local)?;
        check_placeholders(kind, &fetch.into, &local)?;
        if let Some(selector) = &fetch.selector {
            check_placeholders(kind, selector, &local)?;
        }
    }
    local.insert(WORKDIR.to_string());
    for path in kind.artifacts.values() {
        check_placeholders(kind, path, &local)?;
    }
    Ok(())
}

fn validate_checks(kind: &KindSpec) -> std::result::Result<(), ConfigError> {
    let axes: BTreeSet<String> = kind.axes.iter().map(|a| a.name.clone()).collect();
    let mut with_workdir = axes.clone();
    with_workdir.insert(WORKDIR.to_string());

    for check in &kind.checks {
        if let Some(pattern) = check.pattern() {
            Regex::new(pattern).map_err(|e| ConfigError::InvalidPattern {
                kind: kind.name.clone(),
                pattern: pattern.to_string(),
                reason: e.to_string(),
            })?;
        }
        if let Some(path) = check.path() {
            check_placeholders(kind, path, &with_workdir)?;
        }
        if let Some(expected) = check.expected_expr() {
            check_placeholders(kind, expected, &axes)?;
            validate_expression(kind, expected)?;
        }
    }
    Ok(())
}

/// Check an expected-value expression at load time.
///
/// Every placeholder must name an axis whose values all have a numeric
/// view. The expression is then evaluated with each axis set to `(1)`.
fn validate_expression(kind: &KindSpec, expected: &str) -> std::result::Result<(), ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidExpression {
        kind: kind.name.clone(),
        expr: expected.to_string(),
        reason,
    };
    let names = template::placeholders(expected).map_err(|e| invalid(e.to_string()))?;
    for axis in kind.axes.iter().filter(|a| names.contains(&a.name)) {
        if let Some(bad) = axis.values.iter().find(|v| v.as_f64().is_none()) {
            return Err(invalid(format!(
                "axis '{}' has non-numeric value '{}'",
                axis.name, bad
            )));
        }
    }

    let mut ctx = template::TemplateContext::new();
    for axis in &kind.axes {
        ctx.set(&axis.name, "(1)");
    }
    let rendered = template::render(expected, &ctx).map_err(|e| invalid(e.to_string()))?;
    match expr::evaluate(&rendered) {
        Ok(_) | Err(ExprError::DivisionByZero) => Ok(()),
        Err(e) => Err(invalid(e.to_string())),
    }
}
