//! Run summary: the final state of every instance.

use crate::core::dag::InstanceDAG;
use crate::core::instance::{ArtifactManifest, InstanceStatus, TaskInstance};
use crate::core::param::ParameterVector;
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::Write as _;
use std::path::PathBuf;

/// Process exit code: every instance passed.
pub const EXIT_PASSED: i32 = 0;
/// Process exit code: at least one sanity check failed.
pub const EXIT_REGRESSION: i32 = 1;
/// Process exit code: something could not be run.
pub const EXIT_INFRASTRUCTURE: i32 = 2;
/// Process exit code: the pipeline definition is invalid.
pub const EXIT_CONFIG: i32 = 3;

#[derive(Debug, Clone, Serialize)]
pub struct InstanceReport {
    pub kind: String,
    pub params: ParameterVector,
    #[serde(flatten)]
    pub status: InstanceStatus,
    pub work_dir: PathBuf,
    pub exit_code: Option<i32>,
    pub duration_secs: Option<f64>,
    pub artifacts: ArtifactManifest,
}

impl From<&TaskInstance> for InstanceReport {
    fn from(instance: &TaskInstance) -> Self {
        Self {
            kind: instance.key.kind.clone(),
            params: instance.key.params.clone(),
            status: instance.status.clone(),
            work_dir: instance.work_dir.clone(),
            exit_code: instance.exit_code,
            duration_secs: instance
                .duration()
                .and_then(|d| d.to_std().ok())
                .map(|d| d.as_secs_f64()),
            artifacts: instance.artifacts.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub cancelled: bool,
    pub passed: usize,
    pub failed: usize,
    pub errored: usize,
    pub blocked: usize,
    pub instances: Vec<InstanceReport>,
}

impl RunReport {
    pub fn from_dag(
        dag: &InstanceDAG,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        cancelled: bool,
    ) -> Self {
        Self {
            started_at,
            finished_at,
            cancelled,
            passed: dag.count_where(|s| matches!(s, InstanceStatus::Passed)),
            failed: dag.count_where(|s| matches!(s, InstanceStatus::Failed { .. })),
            errored: dag.count_where(|s| matches!(s, InstanceStatus::Errored { .. })),
            blocked: dag.count_where(|s| matches!(s, InstanceStatus::Blocked { .. })),
            instances: dag.instances().map(InstanceReport::from).collect(),
        }
    }

    pub fn total(&self) -> usize {
        self.instances.len()
    }

    /// Failed outranks Errored/Blocked, so a regression is never hidden by
    /// an unrelated infrastructure problem.
    pub fn exit_code(&self) -> i32 {
        if self.failed > 0 {
            EXIT_REGRESSION
        } else if self.passed < self.total() {
            EXIT_INFRASTRUCTURE
        } else {
            EXIT_PASSED
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Plain-text table, one row per instance, followed by a summary line.
    pub fn render_table(&self) -> String {
        let rows: Vec<(String, String, String, String)> = self
            .instances
            .iter()
            .map(|i| {
                let name = format!("{}[{}]", i.kind, i.params);
                let duration = i
                    .duration_secs
                    .map(|s| format!("{:.1}s", s))
                    .unwrap_or_else(|| "-".to_string());
                let detail = match &i.status {
                    InstanceStatus::Failed { reasons } => reasons.join("; "),
                    InstanceStatus::Errored { error } => error.clone(),
                    InstanceStatus::Blocked { by } => format!("by {}", by),
                    _ => String::new(),
                };
                (i.status.label().to_string(), name, duration, detail)
            })
            .collect();

        let status_w = rows.iter().map(|r| r.0.len()).max().unwrap_or(0).max(6);
        let name_w = rows.iter().map(|r| r.1.len()).max().unwrap_or(0).max(8);

        let mut out = String::new();
        let _ = writeln!(
            out,
            "{:<sw$}  {:<nw$}  {:>8}  DETAIL",
            "STATUS",
            "INSTANCE",
            "TIME",
            sw = status_w,
            nw = name_w
        );
        for (status, name, duration, detail) in rows {
            let line = format!(
                "{:<sw$}  {:<nw$}  {:>8}  {}",
                status,
                name,
                duration,
                detail,
                sw = status_w,
                nw = name_w
            );
            let _ = writeln!(out, "{}", line.trim_end());
        }
        let _ = writeln!(
            out,
            "\n{} instances: {} passed, {} failed, {} errored, {} blocked{}",
            self.total(),
            self.passed,
            self.failed,
            self.errored,
            self.blocked,
            if self.cancelled { " (cancelled)" } else { "" }
        );
        out
    }
}
