//! Scheduler for parallel instance execution.
//!
//! The Scheduler owns the instance DAG and is the only writer of instance
//! state. It dispatches Ready instances to the worker pool while respecting
//! dependencies and capacity, folds worker results back into the DAG, blocks
//! the descendants of anything that did not pass, and reacts to cancellation.

use crate::core::dag::InstanceDAG;
use crate::core::instance::{InstanceKey, InstanceStatus};
use crate::error::Error;
use crate::orchestration::executor::{StageExecutor, StageJob, UpstreamOutput};
use crate::orchestration::gate::Verdict;
use crate::orchestration::pool::{WorkerEvent, WorkerPool};
use crate::pipeline::{KindSpec, Pipeline};
use crate::report::RunReport;
use crate::{blog, blog_debug, blog_warn};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Events emitted by the scheduler for instance lifecycle changes.
///
/// These let a front end (the CLI progress output, tests) follow a run
/// without polling the DAG.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    /// An instance has been handed to a worker.
    InstanceStarted { key: InstanceKey },
    /// An instance reached Passed, Failed or Errored.
    InstanceFinished { key: InstanceKey, status: InstanceStatus },
    /// An instance will not run because `by` did not pass.
    InstanceBlocked { key: InstanceKey, by: String },
    /// Nothing is running and nothing else can start.
    AllInstancesSettled,
}

/// Drains the Ready frontier of an [`InstanceDAG`].
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use tokio_util::sync::CancellationToken;
/// use benchdag::orchestration::{ProcessExecutor, Resolver, Scheduler};
///
/// let dag = Resolver::new(&pipeline, &work_root).build()?;
/// let scheduler = Scheduler::new(dag, &pipeline, Arc::new(ProcessExecutor::new()), 4);
/// let report = scheduler.run(CancellationToken::new()).await;
/// std::process::exit(report.exit_code());
/// ```
pub struct Scheduler<E: StageExecutor> {
    dag: InstanceDAG,
    kinds: HashMap<String, Arc<KindSpec>>,
    pool: WorkerPool<E>,
    worker_rx: mpsc::Receiver<WorkerEvent>,
    event_tx: Option<mpsc::UnboundedSender<SchedulerEvent>>,
}

impl<E: StageExecutor> Scheduler<E> {
    /// Create a scheduler running at most `jobs` instances at once.
    pub fn new(dag: InstanceDAG, pipeline: &Pipeline, executor: Arc<E>, jobs: usize) -> Self {
        let (worker_tx, worker_rx) = mpsc::channel(jobs.max(1) * 2);
        let kinds = pipeline
            .kinds()
            .iter()
            .map(|k| (k.name.clone(), Arc::new(k.clone())))
            .collect();
        Self {
            dag,
            kinds,
            pool: WorkerPool::new(executor, jobs, worker_tx),
            worker_rx,
            event_tx: None,
        }
    }

    /// Emit [`SchedulerEvent`]s on `tx`.
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<SchedulerEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn dag(&self) -> &InstanceDAG {
        &self.dag
    }

    /// Number of instances currently held by a worker.
    pub fn active_count(&self) -> usize {
        self.pool.active_count()
    }

    fn emit(&self, event: SchedulerEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }

    fn job_for(&self, key: &InstanceKey) -> Option<StageJob> {
        let instance = self.dag.get(key)?;
        let kind = self.kinds.get(&key.kind)?;
        let upstream = self
            .dag
            .upstreams(key)
            .into_iter()
            .map(|(alias, up)| {
                (
                    alias.to_string(),
                    UpstreamOutput {
                        work_dir: up.work_dir.clone(),
                        artifacts: up.artifacts.clone(),
                    },
                )
            })
            .collect();
        Some(StageJob {
            key: key.clone(),
            work_dir: instance.work_dir.clone(),
            kind: Arc::clone(kind),
            upstream,
        })
    }

    /// Promote the frontier to Ready and hand Ready instances to workers
    /// until the pool is full. Returns the number dispatched.
    pub fn dispatch_ready(&mut self) -> usize {
        for key in self.dag.ready_frontier() {
            if let Some(instance) = self.dag.get_mut(&key) {
                instance.mark_ready();
            }
        }

        let mut dispatched = 0;
        for key in self.dag.ready_instances() {
            if !self.pool.has_capacity() {
                break;
            }
            let Some(job) = self.job_for(&key) else {
                blog_warn!("no kind definition for {}, marking errored", key);
                self.settle(&key, InstanceStatus::Errored {
                    error: format!("unknown kind '{}'", key.kind),
                });
                continue;
            };
            match self.pool.spawn(job) {
                Ok(()) => {
                    if let Some(instance) = self.dag.get_mut(&key) {
                        instance.start();
                    }
                    blog!("started {}", key);
                    self.emit(SchedulerEvent::InstanceStarted { key });
                    dispatched += 1;
                }
                Err(e) => {
                    blog_warn!("could not start {}: {}", key, e);
                    break;
                }
            }
        }
        dispatched
    }

    /// Apply a terminal status and cascade Blocked if it is not Passed.
    fn settle(&mut self, key: &InstanceKey, status: InstanceStatus) {
        if let Some(instance) = self.dag.get_mut(key) {
            match &status {
                InstanceStatus::Passed => {}
                InstanceStatus::Failed { reasons } => instance.fail(reasons.clone()),
                InstanceStatus::Errored { error } => instance.error(error),
                _ => {}
            }
        }
        blog!("{} {}", key, status.label());
        self.emit(SchedulerEvent::InstanceFinished {
            key: key.clone(),
            status: status.clone(),
        });
        if status.is_unsuccessful() {
            self.block_descendants(key);
        }
    }

    /// Block every not-yet-started descendant of `key`.
    pub fn block_descendants(&mut self, key: &InstanceKey) -> Vec<InstanceKey> {
        let blocked = self.dag.block_descendants(key);
        let by = key.to_string();
        for descendant in &blocked {
            blog_debug!("{} blocked by {}", descendant, by);
            self.emit(SchedulerEvent::InstanceBlocked {
                key: descendant.clone(),
                by: by.clone(),
            });
        }
        blocked
    }

    /// Fold one worker event into the DAG.
    pub fn handle_event(&mut self, event: WorkerEvent) {
        if !self.pool.finish(event.key()) {
            blog_debug!("ignoring event for {} (not running)", event.key());
            return;
        }
        match event {
            WorkerEvent::Finished {
                key,
                exit_code,
                artifacts,
                verdict,
                ..
            } => {
                if let Some(instance) = self.dag.get_mut(&key) {
                    instance.exit_code = exit_code;
                }
                match verdict {
                    Verdict::Passed => {
                        if let Some(instance) = self.dag.get_mut(&key) {
                            instance.pass(artifacts);
                        }
                        self.settle(&key, InstanceStatus::Passed);
                    }
                    Verdict::Failed(reasons) => {
                        self.settle(&key, InstanceStatus::Failed { reasons })
                    }
                    Verdict::Errored(error) => self.settle(&key, InstanceStatus::Errored { error }),
                }
            }
            WorkerEvent::Errored { key, error } => {
                self.settle(&key, InstanceStatus::Errored { error });
            }
        }
    }

    /// Abort running workers and stop everything that has not started.
    fn cancel(&mut self) {
        let reason = Error::Cancelled.to_string();
        for key in self.pool.abort_all() {
            blog_warn!("cancelling {}", key);
            self.settle(&key, InstanceStatus::Errored {
                error: reason.clone(),
            });
        }
        self.block_remaining(&reason);
    }

    /// Block any instance that can no longer start.
    fn block_remaining(&mut self, by: &str) {
        let stuck: Vec<InstanceKey> = self
            .dag
            .instances()
            .filter(|i| i.can_start())
            .map(|i| i.key.clone())
            .collect();
        for key in stuck {
            if let Some(instance) = self.dag.get_mut(&key) {
                instance.block(by);
            }
            self.emit(SchedulerEvent::InstanceBlocked {
                key,
                by: by.to_string(),
            });
        }
    }

    /// Run until every instance is settled or `cancel` fires.
    ///
    /// The scheduling loop:
    /// 1. Dispatches Ready instances to workers
    /// 2. Stops once nothing is running and nothing could be dispatched
    /// 3. Otherwise waits for a worker event or cancellation
    pub async fn run(mut self, cancel: CancellationToken) -> RunReport {
        let started_at = Utc::now();
        let mut cancelled = false;
        blog!(
            "run started: {} instances, {} workers",
            self.dag.instance_count(),
            self.pool.capacity()
        );

        loop {
            if cancel.is_cancelled() {
                self.cancel();
                cancelled = true;
                break;
            }

            self.dispatch_ready();

            if self.pool.active_count() == 0 {
                break;
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    self.cancel();
                    cancelled = true;
                    break;
                }
                event = self.worker_rx.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
            }
        }

        // Anything still waiting depends on an instance that never passed.
        self.block_remaining("unreachable");
        self.emit(SchedulerEvent::AllInstancesSettled);

        let report = RunReport::from_dag(&self.dag, started_at, Utc::now(), cancelled);
        blog!(
            "run finished: {} passed, {} failed, {} errored, {} blocked",
            report.passed,
            report.failed,
            report.errored,
            report.blocked
        );
        report
    }
}
