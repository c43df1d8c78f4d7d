//! Task instance data model for the execution DAG.
//!
//! An instance is one (kind, parameter vector) pair. Its identity is that pair;
//! everything else on [`TaskInstance`] is run-time state owned by the
//! scheduler.

use crate::core::param::{ParamValue, ParameterVector};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Identity of a task instance: its kind name plus its parameter vector.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct InstanceKey {
    pub kind: String,
    pub params: ParameterVector,
}

impl InstanceKey {
    pub fn new(kind: &str, params: ParameterVector) -> Self {
        Self {
            kind: kind.to_string(),
            params,
        }
    }

    /// First 8 hex characters of a digest over the typed key, so `3`, `3.0`
    /// and `"3"` hash differently even though they display alike.
    pub fn short(&self) -> String {
        let mut hasher = Sha256::new();
        hash_field(&mut hasher, self.kind.as_bytes());
        for (axis, value) in self.params.iter() {
            hash_field(&mut hasher, axis.as_bytes());
            match value {
                ParamValue::Bool(b) => {
                    hasher.update(b"b");
                    hasher.update([u8::from(*b)]);
                }
                ParamValue::Int(i) => {
                    hasher.update(b"i");
                    hasher.update(i.to_le_bytes());
                }
                ParamValue::Float(f) => {
                    hasher.update(b"f");
                    hasher.update(f.to_bits().to_le_bytes());
                }
                ParamValue::Str(text) => {
                    hasher.update(b"s");
                    hash_field(&mut hasher, text.as_bytes());
                }
            }
        }
        format!("{:x}", hasher.finalize())[..8].to_string()
    }

    /// Working directory of this instance under `root`.
    ///
    /// The directory name spells out the parameters for humans and carries the
    /// short digest so that two distinct instances never share a directory,
    /// even when sanitizing their values maps them onto the same text.
    pub fn work_dir(&self, root: &Path) -> PathBuf {
        let readable = if self.params.is_empty() {
            "default".to_string()
        } else {
            self.params
                .iter()
                .map(|(axis, value)| format!("{}-{}", axis, value))
                .collect::<Vec<_>>()
                .join("_")
        };
        let slug: String = readable
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                    c
                } else {
                    '+'
                }
            })
            .collect();
        root.join(sanitize(&self.kind))
            .join(format!("{}.{}", slug, self.short()))
    }
}

fn hash_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '_' | '-') { c } else { '_' })
        .collect()
}

impl std::fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]", self.kind, self.params)
    }
}

/// Artifact name to absolute path, as produced by a finished instance.
pub type ArtifactManifest = BTreeMap<String, PathBuf>;

/// Instance status in its lifecycle.
///
/// `Pending → Ready → Running → {Passed | Failed | Errored}`; `Blocked` is
/// terminal and reached without running when an ancestor did not pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum InstanceStatus {
    #[default]
    Pending,
    Ready,
    Running,
    Passed,
    /// The stage ran but a sanity check did not hold.
    Failed { reasons: Vec<String> },
    /// The stage could not be run or its output could not be inspected.
    Errored { error: String },
    Blocked { by: String },
}

impl InstanceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Passed
                | InstanceStatus::Failed { .. }
                | InstanceStatus::Errored { .. }
                | InstanceStatus::Blocked { .. }
        )
    }

    /// Terminal states that block every dependent.
    pub fn is_unsuccessful(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Failed { .. }
                | InstanceStatus::Errored { .. }
                | InstanceStatus::Blocked { .. }
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            InstanceStatus::Pending => "pending",
            InstanceStatus::Ready => "ready",
            InstanceStatus::Running => "running",
            InstanceStatus::Passed => "passed",
            InstanceStatus::Failed { .. } => "failed",
            InstanceStatus::Errored { .. } => "errored",
            InstanceStatus::Blocked { .. } => "blocked",
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceStatus::Failed { reasons } => write!(f, "failed: {}", reasons.join("; ")),
            InstanceStatus::Errored { error } => write!(f, "errored: {}", error),
            InstanceStatus::Blocked { by } => write!(f, "blocked by {}", by),
            other => write!(f, "{}", other.label()),
        }
    }
}

/// A single instance in the execution DAG.
#[derive(Debug, Clone, Serialize)]
pub struct TaskInstance {
    pub key: InstanceKey,
    pub status: InstanceStatus,
    pub work_dir: PathBuf,
    pub exit_code: Option<i32>,
    /// Artifacts exposed to dependents once the instance has passed.
    pub artifacts: ArtifactManifest,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskInstance {
    /// Create a pending instance whose working directory lives under `work_root`.
    pub fn new(key: InstanceKey, work_root: &Path) -> Self {
        let work_dir = key.work_dir(work_root);
        Self {
            key,
            status: InstanceStatus::Pending,
            work_dir,
            exit_code: None,
            artifacts: ArtifactManifest::new(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn mark_ready(&mut self) {
        self.status = InstanceStatus::Ready;
    }

    pub fn start(&mut self) {
        self.status = InstanceStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn pass(&mut self, artifacts: ArtifactManifest) {
        self.status = InstanceStatus::Passed;
        self.artifacts = artifacts;
        self.finished_at = Some(Utc::now());
    }

    pub fn fail(&mut self, reasons: Vec<String>) {
        self.status = InstanceStatus::Failed { reasons };
        self.finished_at = Some(Utc::now());
    }

    pub fn error(&mut self, error: &str) {
        self.status = InstanceStatus::Errored {
            error: error.to_string(),
        };
        self.finished_at = Some(Utc::now());
    }

    pub fn block(&mut self, by: &str) {
        self.status = InstanceStatus::Blocked { by: by.to_string() };
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// Pending or Ready instances have not been started yet.
    pub fn can_start(&self) -> bool {
        matches!(self.status, InstanceStatus::Pending | InstanceStatus::Ready)
    }

    /// Wall-clock duration of the run, once finished.
    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.finished_at? - self.started_at?)
    }
}
