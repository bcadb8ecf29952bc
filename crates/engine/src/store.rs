//! Job store: the single owner of source list, task list and run state.
//!
//! Every mutation goes through one of the commands below; readers get cloned
//! snapshots. The store is cheap to clone and shares its state.

use crate::events::EngineEvent;
use crate::metrics::{source_metrics, task_metrics, JobMetrics};
use crate::task::{SourceFile, Task, TaskId, TaskStatus};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Default number of log lines kept.
pub const DEFAULT_LOG_WINDOW: usize = 100;

/// What the session is currently doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    #[default]
    Idle,
    Importing,
    Converting,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunPhase::Idle => write!(f, "idle"),
            RunPhase::Importing => write!(f, "importing"),
            RunPhase::Converting => write!(f, "converting"),
        }
    }
}

/// Bounded trailing window of log lines.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    lines: VecDeque<String>,
    capacity: usize,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, line: String) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }
}

#[derive(Debug)]
struct StoreState {
    sources: Vec<SourceFile>,
    tasks: Vec<Task>,
    phase: RunPhase,
    /// Imports still analyzing.
    imports: usize,
    started_at: Option<i64>,
    tracked: Option<TaskId>,
    log: LogBuffer,
}

#[derive(Debug, Clone)]
pub struct JobStore {
    inner: Arc<RwLock<StoreState>>,
}

impl Default for JobStore {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_WINDOW)
    }
}

impl JobStore {
    pub fn new(log_window: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(StoreState {
                sources: Vec::new(),
                tasks: Vec::new(),
                phase: RunPhase::Idle,
                imports: 0,
                started_at: None,
                tracked: None,
                log: LogBuffer::new(log_window),
            })),
        }
    }

    // Source list

    pub async fn add_sources(&self, files: impl IntoIterator<Item = SourceFile>) {
        self.inner.write().await.sources.extend(files);
    }

    /// Apply `f` to the source with `id`. Returns false if no such source exists.
    pub async fn update_source<F>(&self, id: TaskId, f: F) -> bool
    where
        F: FnOnce(&mut SourceFile),
    {
        let mut state = self.inner.write().await;
        match state.sources.iter_mut().find(|s| s.id == id) {
            Some(source) => {
                f(source);
                true
            }
            None => false,
        }
    }

    pub async fn remove_sources(&self, ids: &[TaskId]) {
        self.inner
            .write()
            .await
            .sources
            .retain(|s| !ids.contains(&s.id));
    }

    pub async fn source(&self, id: TaskId) -> Option<SourceFile> {
        self.inner
            .read()
            .await
            .sources
            .iter()
            .find(|s| s.id == id)
            .cloned()
    }

    pub async fn sources(&self) -> Vec<SourceFile> {
        self.inner.read().await.sources.clone()
    }

    // Task list

    pub async fn set_tasks(&self, tasks: Vec<Task>) {
        self.inner.write().await.tasks = tasks;
    }

    /// Apply `f` to the task with `id`; `None` if no such task exists.
    pub async fn update_task<F, R>(&self, id: TaskId, f: F) -> Option<R>
    where
        F: FnOnce(&mut Task) -> R,
    {
        let mut state = self.inner.write().await;
        state.tasks.iter_mut().find(|t| t.id == id).map(f)
    }

    pub async fn task(&self, id: TaskId) -> Option<Task> {
        self.inner
            .read()
            .await
            .tasks
            .iter()
            .find(|t| t.id == id)
            .cloned()
    }

    pub async fn tasks(&self) -> Vec<Task> {
        self.inner.read().await.tasks.clone()
    }

    // Run state

    pub async fn set_phase(&self, phase: RunPhase) {
        let mut state = self.inner.write().await;
        if state.phase != phase {
            debug!(from = %state.phase, to = %phase, "Run phase changed");
            state.phase = phase;
        }
    }

    pub async fn phase(&self) -> RunPhase {
        self.inner.read().await.phase
    }

    /// Register an import; the phase becomes importing if the store was idle.
    pub async fn begin_import(&self) {
        let mut state = self.inner.write().await;
        state.imports += 1;
        if state.phase == RunPhase::Idle {
            state.phase = RunPhase::Importing;
        }
    }

    /// Unregister an import; the last one to finish returns the store to idle.
    pub async fn end_import(&self) {
        let mut state = self.inner.write().await;
        state.imports = state.imports.saturating_sub(1);
        if state.imports == 0 && state.phase == RunPhase::Importing {
            state.phase = RunPhase::Idle;
        }
    }

    /// Whether a loaded task list has not finished yet.
    pub async fn is_busy(&self) -> bool {
        let state = self.inner.read().await;
        state.phase == RunPhase::Converting && state.tasks.iter().any(|t| t.is_active())
    }

    /// Load `tasks` and enter the converting phase, unless a run is busy.
    ///
    /// Returns false and leaves the store untouched when busy.
    pub async fn claim_run(&self, tasks: Vec<Task>) -> bool {
        let mut state = self.inner.write().await;
        if state.phase == RunPhase::Converting && state.tasks.iter().any(|t| t.is_active()) {
            return false;
        }
        state.tasks = tasks;
        state.tracked = None;
        state.phase = RunPhase::Converting;
        true
    }

    pub async fn set_started_at(&self, started_at: Option<i64>) {
        self.inner.write().await.started_at = started_at;
    }

    pub async fn started_at(&self) -> Option<i64> {
        self.inner.read().await.started_at
    }

    /// Track the task whose events are accepted; `None` accepts none.
    pub async fn track(&self, id: Option<TaskId>) {
        self.inner.write().await.tracked = id;
    }

    pub async fn tracked(&self) -> Option<TaskId> {
        self.inner.read().await.tracked
    }

    // Log window

    pub async fn append_log(&self, line: impl Into<String>) {
        self.inner.write().await.log.push(line.into());
    }

    pub async fn log(&self) -> Vec<String> {
        self.inner.read().await.log.lines()
    }

    /// Apply an encoder event to the tracked task.
    ///
    /// Returns false, leaving every record untouched, when the event belongs
    /// to any other task.
    pub async fn apply_event(&self, event: EngineEvent) -> bool {
        let mut state = self.inner.write().await;
        if state.tracked != Some(event.task_id()) {
            return false;
        }

        match event {
            EngineEvent::Progress {
                task_id,
                time_sec,
                size,
            } => {
                let Some(task) = state.tasks.iter_mut().find(|t| t.id == task_id) else {
                    return false;
                };
                if task.status != TaskStatus::Processing {
                    return false;
                }
                let expected = task.expected_duration();
                if expected > 0.0 {
                    task.record_progress(time_sec / expected * 100.0);
                }
                task.encoded_size = size;
                true
            }
            EngineEvent::Log { line, .. } => {
                state.log.push(line);
                true
            }
        }
    }

    /// Drop every source, task and log line and return to idle.
    pub async fn clear_all(&self) {
        let mut state = self.inner.write().await;
        state.sources.clear();
        state.tasks.clear();
        state.phase = RunPhase::Idle;
        state.imports = 0;
        state.started_at = None;
        state.tracked = None;
        state.log.clear();
    }

    /// Metrics at `now_ms`: over the task list while converting, otherwise
    /// over the source list.
    pub async fn metrics(&self, now_ms: i64) -> JobMetrics {
        let state = self.inner.read().await;
        match state.phase {
            RunPhase::Converting => task_metrics(&state.tasks, state.phase, state.started_at, now_ms),
            _ => source_metrics(&state.sources, state.phase, state.started_at, now_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{MediaInfo, TaskKind};
    use proptest::prelude::*;
    use std::path::PathBuf;

    fn timed_task(duration: f64) -> Task {
        Task::new(
            TaskId::new(),
            TaskKind::Trash {
                path: PathBuf::from("/media/a.mov"),
            },
            "a.mov",
        )
        .with_media(1000, duration)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_log_window_is_bounded(
            capacity in 1usize..50,
            count in 0usize..200,
        ) {
            let mut log = LogBuffer::new(capacity);
            for i in 0..count {
                log.push(format!("line {}", i));
            }
            prop_assert_eq!(log.len(), count.min(capacity));
            if count > 0 {
                let last = log.lines().pop().unwrap();
                prop_assert_eq!(last, format!("line {}", count - 1));
            }
        }
    }

    #[tokio::test]
    async fn test_event_for_other_task_is_discarded() {
        let store = JobStore::default();
        let tracked = timed_task(100.0);
        let other = timed_task(100.0);
        let (tracked_id, other_id) = (tracked.id, other.id);
        store.set_tasks(vec![tracked, other]).await;
        store.update_task(tracked_id, |t| t.start(0)).await;
        store.update_task(other_id, |t| t.start(0)).await;
        store.track(Some(tracked_id)).await;

        let before = store.tasks().await;
        let applied = store
            .apply_event(EngineEvent::Progress {
                task_id: other_id,
                time_sec: 50.0,
                size: 999,
            })
            .await;
        let log_applied = store
            .apply_event(EngineEvent::Log {
                task_id: other_id,
                line: "stale".to_string(),
            })
            .await;

        assert!(!applied);
        assert!(!log_applied);
        assert_eq!(store.tasks().await, before);
        assert!(store.log().await.is_empty());
    }

    #[tokio::test]
    async fn test_progress_event_updates_tracked_task() {
        let store = JobStore::default();
        let task = timed_task(600.0).with_time_scale(60.0);
        let id = task.id;
        store.set_tasks(vec![task]).await;
        store.update_task(id, |t| t.start(0)).await;
        store.track(Some(id)).await;

        // 5s of a 10s expected output.
        assert!(
            store
                .apply_event(EngineEvent::Progress {
                    task_id: id,
                    time_sec: 5.0,
                    size: 4096,
                })
                .await
        );
        let task = store.task(id).await.unwrap();
        assert!((task.progress - 50.0).abs() < 1e-9);
        assert_eq!(task.encoded_size, 4096);

        // Going backwards keeps the higher value.
        store
            .apply_event(EngineEvent::Progress {
                task_id: id,
                time_sec: 2.0,
                size: 5000,
            })
            .await;
        let task = store.task(id).await.unwrap();
        assert!((task.progress - 50.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_untracked_store_accepts_nothing() {
        let store = JobStore::default();
        let task = timed_task(10.0);
        let id = task.id;
        store.set_tasks(vec![task]).await;

        let applied = store
            .apply_event(EngineEvent::Log {
                task_id: id,
                line: "x".into(),
            })
            .await;
        assert!(!applied);
    }

    #[tokio::test]
    async fn test_update_source_by_id() {
        let store = JobStore::default();
        let first = SourceFile::pending("/media/a.mov");
        let second = SourceFile::pending("/media/b.mov");
        let second_id = second.id;
        store.add_sources([first, second]).await;

        let found = store
            .update_source(second_id, |s| {
                s.apply_analysis(MediaInfo {
                    path: PathBuf::from("/media/b.mov"),
                    size: 10,
                    has_video: true,
                    has_audio: true,
                    duration: 3.0,
                })
            })
            .await;

        assert!(found);
        let sources = store.sources().await;
        assert_eq!(sources[0].status, crate::task::SourceStatus::Analyzing);
        assert_eq!(sources[1].duration, 3.0);
        assert!(!store.update_source(TaskId::new(), |_| {}).await);
    }

    #[tokio::test]
    async fn test_metrics_follow_phase() {
        let store = JobStore::default();
        store.add_sources([SourceFile::pending("/media/a.mov")]).await;
        store.set_tasks(vec![timed_task(1.0), timed_task(1.0)]).await;

        assert_eq!(store.metrics(0).await.total_tasks, 1);
        store.set_phase(RunPhase::Converting).await;
        assert_eq!(store.metrics(0).await.total_tasks, 2);
    }

    #[tokio::test]
    async fn test_overlapping_imports_keep_phase() {
        let store = JobStore::default();
        store.begin_import().await;
        store.begin_import().await;
        assert_eq!(store.phase().await, RunPhase::Importing);

        store.end_import().await;
        assert_eq!(store.phase().await, RunPhase::Importing);
        store.end_import().await;
        assert_eq!(store.phase().await, RunPhase::Idle);
    }

    #[tokio::test]
    async fn test_claim_run_rejects_second_claim() {
        let store = JobStore::default();
        assert!(store.claim_run(vec![timed_task(1.0)]).await);
        assert!(store.is_busy().await);
        assert!(!store.claim_run(vec![timed_task(1.0), timed_task(2.0)]).await);
        assert_eq!(store.tasks().await.len(), 1);

        let id = store.tasks().await[0].id;
        store.update_task(id, |t| t.skip("done")).await;
        assert!(!store.is_busy().await);
        assert!(store.claim_run(vec![timed_task(1.0), timed_task(2.0)]).await);
        assert_eq!(store.tasks().await.len(), 2);
    }

    #[tokio::test]
    async fn test_clear_all() {
        let store = JobStore::new(3);
        store.add_sources([SourceFile::pending("/media/a.mov")]).await;
        store.set_phase(RunPhase::Converting).await;
        store.set_started_at(Some(5)).await;
        store.append_log("hello").await;

        store.clear_all().await;

        assert!(store.sources().await.is_empty());
        assert_eq!(store.phase().await, RunPhase::Idle);
        assert_eq!(store.started_at().await, None);
        assert!(store.log().await.is_empty());
    }
}
