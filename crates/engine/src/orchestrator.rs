//! Job orchestrator for OptiMux
//!
//! Runs the encode tasks of the store's task list strictly one after the
//! other, resolves concat inputs from the results of earlier tasks, stops at
//! the first failure and finally hands trash tasks to the deferred delete
//! protocol.

use crate::delete::{
    AutoApprove, DeleteApproval, DeleteFailure, DeleteProtocol, DeleteService, DeleteTarget,
    PendingDeletes,
};
use crate::encode::{ProcessError, ProcessRunner};
use crate::events::{self, EngineEvent, EventSink};
use crate::metrics::JobMetrics;
use crate::request::{EncodeRequest, EncodeResult};
use crate::store::{JobStore, RunPhase};
use crate::task::{current_timestamp_ms, Task, TaskId, TaskKind, TaskStatus, TransitionError};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Error type for a single task of a run
#[derive(Debug, Error)]
pub enum TaskError {
    /// None of the producers of a concat task left a usable output.
    #[error("Could not resolve any input for concat task {0}")]
    DependencyResolution(TaskId),

    #[error("{0}")]
    Process(#[from] ProcessError),

    #[error("cancelled")]
    Cancelled,
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Every encode task finished and the trash phase ran.
    Completed,
    /// A task failed; nothing after it was started.
    Aborted { task: TaskId, reason: String },
    /// The run was cancelled through its [`CancelHandle`].
    Cancelled,
}

#[derive(Debug)]
pub struct RunReport {
    pub outcome: RunOutcome,
    /// Results of the encode tasks that finished.
    pub results: HashMap<TaskId, EncodeResult>,
    /// Trash entries that could not be deleted.
    pub delete_failures: Vec<DeleteFailure>,
    /// Metrics at the moment the run ended.
    pub metrics: JobMetrics,
}

/// Cancels the run of the orchestrator it came from.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Paths a concat task reads, in reference order.
///
/// Each producer contributes its temp chunk, or its main output when it has
/// no chunk. Producers without a result are left out.
pub fn resolve_dependencies(
    refs: &[TaskId],
    results: &HashMap<TaskId, EncodeResult>,
) -> Vec<PathBuf> {
    refs.iter()
        .filter_map(|id| results.get(id))
        .filter_map(|result| result.chunk_path())
        .map(PathBuf::from)
        .collect()
}

async fn cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|c| *c).await.is_err() {
        std::future::pending::<()>().await;
    }
}

pub struct Orchestrator {
    store: JobStore,
    runner: Arc<dyn ProcessRunner>,
    deletes: DeleteProtocol,
    approval: Arc<dyn DeleteApproval>,
    cancel_tx: Arc<watch::Sender<bool>>,
}

impl Orchestrator {
    pub fn new(
        store: JobStore,
        runner: Arc<dyn ProcessRunner>,
        delete_service: Arc<dyn DeleteService>,
    ) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        Self {
            store,
            runner,
            deletes: DeleteProtocol::new(delete_service),
            approval: Arc::new(AutoApprove),
            cancel_tx: Arc::new(cancel_tx),
        }
    }

    /// Gate asked before trash tasks are committed.
    pub fn with_approval(mut self, approval: Arc<dyn DeleteApproval>) -> Self {
        self.approval = approval;
        self
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            tx: self.cancel_tx.clone(),
        }
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    /// Run the store's task list to the end.
    pub async fn run(&self) -> RunReport {
        let tasks = self.store.tasks().await;
        self.store.set_phase(RunPhase::Converting).await;
        self.store.set_started_at(Some(current_timestamp_ms())).await;
        info!(tasks = tasks.len(), "Run started");

        let mut results = HashMap::new();
        let mut outcome = self.encode_phase(&tasks, &mut results).await;

        let mut delete_failures = Vec::new();
        if outcome == RunOutcome::Completed {
            outcome = self.trash_phase(&tasks, &mut delete_failures).await;
        }

        let reason = match &outcome {
            RunOutcome::Completed => None,
            RunOutcome::Aborted { .. } => Some("not started: run aborted"),
            RunOutcome::Cancelled => Some("not started: run cancelled"),
        };
        if let Some(reason) = reason {
            self.skip_waiting(&tasks, reason).await;
        }

        let now = current_timestamp_ms();
        let metrics = self.store.metrics(now).await;
        match &outcome {
            RunOutcome::Completed => info!(
                done = metrics.completed_tasks,
                errors = metrics.error_count,
                "Run completed"
            ),
            RunOutcome::Aborted { task, reason } => {
                error!(task_id = %task, %reason, "Run aborted")
            }
            RunOutcome::Cancelled => warn!("Run cancelled"),
        }

        RunReport {
            outcome,
            results,
            delete_failures,
            metrics,
        }
    }

    async fn encode_phase(
        &self,
        tasks: &[Task],
        results: &mut HashMap<TaskId, EncodeResult>,
    ) -> RunOutcome {
        let (tx, mut rx) = events::channel();
        let mut cancel_rx = self.cancel_tx.subscribe();

        for task in tasks.iter().filter(|t| t.kind.is_encode()) {
            if self.is_cancelled() {
                return RunOutcome::Cancelled;
            }

            let started = self
                .store
                .update_task(task.id, |t| t.start(current_timestamp_ms()))
                .await;
            match started {
                Some(Ok(())) => {}
                Some(Err(e)) => {
                    warn!(task_id = %task.id, error = %e, "Task not runnable, passing over it");
                    continue;
                }
                None => {
                    warn!(task_id = %task.id, "Task removed before it started");
                    continue;
                }
            }
            self.store.append_log(format!("Started {}", task.label)).await;
            info!(task_id = %task.id, kind = task.kind.name(), label = %task.label, "Task started");

            let result = match self.request_for(task, results) {
                Ok(request) => {
                    self.store.track(Some(task.id)).await;
                    let sink = EventSink::new(task.id, tx.clone());
                    let result = self
                        .submit(&request, sink, &mut rx, &mut cancel_rx)
                        .await;
                    self.store.track(None).await;
                    result
                }
                Err(e) => Err(e),
            };

            let now = current_timestamp_ms();
            match result {
                Ok(result) => {
                    let size = result.main_size();
                    let settled = self
                        .store
                        .update_task(task.id, |t| t.complete(size, now))
                        .await;
                    self.check_settled(task, settled).await;
                    self.store.append_log(format!("Finished {}", task.label)).await;
                    info!(task_id = %task.id, encoded_size = size, "Task done");
                    results.insert(task.id, result);
                }
                Err(e) => {
                    let reason = e.to_string();
                    let settled = self
                        .store
                        .update_task(task.id, |t| t.fail(&reason, now))
                        .await;
                    self.check_settled(task, settled).await;
                    self.store
                        .append_log(format!("Failed {}: {}", task.label, reason))
                        .await;
                    error!(task_id = %task.id, error = %reason, "Task failed");
                    return match e {
                        TaskError::Cancelled => RunOutcome::Cancelled,
                        _ => RunOutcome::Aborted {
                            task: task.id,
                            reason,
                        },
                    };
                }
            }
        }

        RunOutcome::Completed
    }

    fn request_for(
        &self,
        task: &Task,
        results: &HashMap<TaskId, EncodeResult>,
    ) -> Result<EncodeRequest, TaskError> {
        match &task.kind {
            TaskKind::Convert { request, .. } => Ok(request.clone()),
            TaskKind::Concat {
                request,
                dependency_refs,
            } => {
                let paths = resolve_dependencies(dependency_refs, results);
                if paths.is_empty() {
                    return Err(TaskError::DependencyResolution(task.id));
                }
                if paths.len() < dependency_refs.len() {
                    warn!(
                        task_id = %task.id,
                        resolved = paths.len(),
                        referenced = dependency_refs.len(),
                        "Some concat inputs are missing"
                    );
                }
                Ok(request.with_inputs(paths))
            }
            TaskKind::Trash { .. } => Err(TaskError::DependencyResolution(task.id)),
        }
    }

    /// Run one request while feeding its events into the store.
    async fn submit(
        &self,
        request: &EncodeRequest,
        sink: EventSink,
        rx: &mut mpsc::UnboundedReceiver<EngineEvent>,
        cancel_rx: &mut watch::Receiver<bool>,
    ) -> Result<EncodeResult, TaskError> {
        let run = self.runner.run(request, sink);
        tokio::pin!(run);

        let result = loop {
            tokio::select! {
                biased;
                _ = cancelled(cancel_rx) => break Err(TaskError::Cancelled),
                Some(event) = rx.recv() => self.apply(event).await,
                result = &mut run => break result.map_err(TaskError::from),
            }
        };

        while let Ok(event) = rx.try_recv() {
            self.apply(event).await;
        }
        result
    }

    /// Report a final status change the store did not take.
    async fn check_settled(&self, task: &Task, settled: Option<Result<(), TransitionError>>) {
        match settled {
            Some(Ok(())) => {}
            Some(Err(e)) => {
                warn!(task_id = %task.id, error = %e, "Final status rejected");
                self.store
                    .append_log(format!("Could not update {}: {}", task.label, e))
                    .await;
            }
            None => warn!(task_id = %task.id, "Task removed while running"),
        }
    }

    async fn apply(&self, event: EngineEvent) {
        let task_id = event.task_id();
        if !self.store.apply_event(event).await {
            debug!(%task_id, "Discarded event for untracked task");
        }
    }

    async fn trash_phase(&self, tasks: &[Task], failures: &mut Vec<DeleteFailure>) -> RunOutcome {
        let trash: Vec<&Task> = tasks
            .iter()
            .filter(|t| matches!(t.kind, TaskKind::Trash { .. }))
            .collect();
        if trash.is_empty() {
            return RunOutcome::Completed;
        }
        if self.is_cancelled() {
            return RunOutcome::Cancelled;
        }

        let mut targets = Vec::with_capacity(trash.len());
        for task in &trash {
            let TaskKind::Trash { path } = &task.kind else {
                continue;
            };
            let started = self
                .store
                .update_task(task.id, |t| t.start(current_timestamp_ms()))
                .await;
            if matches!(started, Some(Ok(()))) {
                targets.push(DeleteTarget {
                    id: task.id,
                    path: path.clone(),
                    staged: true,
                });
            }
        }

        let request = self.deletes.request(&targets).await;
        self.record_failures(&request.failures).await;
        failures.extend(request.failures);

        let pending = request.pending;
        if pending.is_empty() {
            return RunOutcome::Completed;
        }

        if self.is_cancelled() {
            self.release(pending, "run cancelled", failures).await;
            return RunOutcome::Cancelled;
        }

        if !self.approval.approve(&pending).await {
            info!(files = pending.len(), "Deletion declined");
            self.release(pending, "deletion declined", failures).await;
            return RunOutcome::Completed;
        }

        let report = self.deletes.confirm(pending).await;
        let now = current_timestamp_ms();
        for id in &report.completed {
            self.store.update_task(*id, |t| t.complete(0, now)).await;
        }
        self.record_failures(&report.failures).await;
        for id in &report.completed {
            if let Some(task) = self.store.task(*id).await {
                self.store.append_log(format!("Trashed {}", task.label)).await;
            }
        }
        failures.extend(report.failures);

        RunOutcome::Completed
    }

    /// Cancel every pending token and skip the tasks whose token was released.
    /// Tasks whose token could not be released are failed.
    async fn release(&self, pending: PendingDeletes, reason: &str, failures: &mut Vec<DeleteFailure>) {
        let report = self.deletes.cancel(pending).await;
        for id in &report.completed {
            self.store.update_task(*id, |t| t.skip(reason)).await;
        }
        self.record_failures(&report.failures).await;
        failures.extend(report.failures);
    }

    async fn record_failures(&self, failures: &[DeleteFailure]) {
        let now = current_timestamp_ms();
        for failure in failures {
            self.store
                .update_task(failure.id, |t| t.fail(&failure.reason, now))
                .await;
            self.store
                .append_log(format!(
                    "Could not delete {}: {}",
                    failure.path.display(),
                    failure.reason
                ))
                .await;
        }
    }

    async fn skip_waiting(&self, tasks: &[Task], reason: &str) {
        for task in tasks {
            self.store
                .update_task(task.id, |t| {
                    if t.status == TaskStatus::Waiting {
                        let _ = t.skip(reason);
                    }
                })
                .await;
        }
    }
}
