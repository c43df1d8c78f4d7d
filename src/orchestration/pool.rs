//! Worker pool for concurrent stage execution.
//!
//! The `WorkerPool` runs up to `capacity` instances at once. Each worker is a
//! tokio task that executes the stage, evaluates the sanity gate and reports a
//! [`WorkerEvent`] back over a channel.

use crate::core::instance::{ArtifactManifest, InstanceKey};
use crate::error::{Error, Result};
use crate::orchestration::executor::{StageExecutor, StageJob};
use crate::orchestration::gate::{SanityGate, Verdict};
use crate::{blog_debug, blog_error};
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

/// Events emitted by workers when they settle.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// The stage ran and the gate produced a verdict.
    Finished {
        key: InstanceKey,
        exit_code: Option<i32>,
        artifacts: ArtifactManifest,
        duration: Duration,
        verdict: Verdict,
    },
    /// The stage could not be run.
    Errored { key: InstanceKey, error: String },
}

impl WorkerEvent {
    pub fn key(&self) -> &InstanceKey {
        match self {
            WorkerEvent::Finished { key, .. } | WorkerEvent::Errored { key, .. } => key,
        }
    }
}

/// Bounded set of running workers.
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use tokio::sync::mpsc;
/// use benchdag::orchestration::{ProcessExecutor, WorkerPool};
///
/// let (tx, mut rx) = mpsc::channel(64);
/// let mut pool = WorkerPool::new(Arc::new(ProcessExecutor::new()), 4, tx);
/// assert!(pool.has_capacity());
/// ```
pub struct WorkerPool<E: StageExecutor> {
    executor: Arc<E>,
    capacity: usize,
    running: HashMap<InstanceKey, AbortHandle>,
    event_tx: mpsc::Sender<WorkerEvent>,
}

impl<E: StageExecutor> WorkerPool<E> {
    /// Create a pool running at most `capacity` workers (at least one).
    pub fn new(executor: Arc<E>, capacity: usize, event_tx: mpsc::Sender<WorkerEvent>) -> Self {
        Self {
            executor,
            capacity: capacity.max(1),
            running: HashMap::new(),
            event_tx,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn active_count(&self) -> usize {
        self.running.len()
    }

    pub fn has_capacity(&self) -> bool {
        self.running.len() < self.capacity
    }

    pub fn is_running(&self, key: &InstanceKey) -> bool {
        self.running.contains_key(key)
    }

    /// Start a worker for `job`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WorkerPoolFull`] if every worker slot is taken.
    pub fn spawn(&mut self, job: StageJob) -> Result<()> {
        if !self.has_capacity() {
            return Err(Error::WorkerPoolFull { max: self.capacity });
        }

        let key = job.key.clone();
        let executor = Arc::clone(&self.executor);
        let tx = self.event_tx.clone();
        let worker = tokio::spawn(async move {
            match executor.execute(&job).await {
                Ok(output) => {
                    let verdict = SanityGate::evaluate(&job, &output);
                    WorkerEvent::Finished {
                        key: job.key.clone(),
                        exit_code: output.exit_code,
                        artifacts: output.artifacts,
                        duration: output.duration,
                        verdict,
                    }
                }
                Err(e) => WorkerEvent::Errored {
                    key: job.key.clone(),
                    error: e.to_string(),
                },
            }
        });
        let abort = worker.abort_handle();

        // An aborted worker reports nothing; a panicked one still settles.
        let watched = key.clone();
        tokio::spawn(async move {
            let event = match worker.await {
                Ok(event) => event,
                Err(e) if e.is_panic() => {
                    let error = format!("worker panicked: {}", panic_message(e.into_panic()));
                    blog_error!("{} {}", watched, error);
                    WorkerEvent::Errored { key: watched, error }
                }
                Err(_) => return,
            };
            let _ = tx.send(event).await;
        });

        blog_debug!("worker started for {}", key);
        self.running.insert(key, abort);
        Ok(())
    }

    /// Forget a worker whose event has been received.
    pub fn finish(&mut self, key: &InstanceKey) -> bool {
        self.running.remove(key).is_some()
    }

    /// Abort every running worker. Dropping a worker kills its child process.
    ///
    /// Returns the keys of the aborted workers.
    pub fn abort_all(&mut self) -> Vec<InstanceKey> {
        self.running
            .drain()
            .map(|(key, handle)| {
                handle.abort();
                key
            })
            .collect()
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
