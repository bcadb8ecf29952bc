//! Task model shared by the recipe compiler, the job store, the orchestrator
//! and the metrics engine.
//!
//! A [`Task`] is one unit of orchestrated work. The per-kind data lives in
//! [`TaskKind`] so that a trash task cannot carry an encode request and a
//! concat task cannot lose its producer references.

use crate::request::EncodeRequest;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use uuid::Uuid;

/// Opaque task identifier, stable for the lifetime of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Status of a task.
///
/// `waiting -> (uploading) -> processing -> done | error`. `skipped` marks
/// tasks that were never reached because an earlier task aborted the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Waiting,
    Uploading,
    Processing,
    Done,
    Error,
    Skipped,
}

impl TaskStatus {
    fn rank(self) -> u8 {
        match self {
            TaskStatus::Waiting => 0,
            TaskStatus::Uploading => 1,
            TaskStatus::Processing => 2,
            TaskStatus::Done | TaskStatus::Error | TaskStatus::Skipped => 3,
        }
    }

    /// Whether the status is one of the three terminal values.
    pub fn is_terminal(self) -> bool {
        self.rank() == 3
    }

    /// Whether `next` is reachable from `self`.
    ///
    /// Transitions only move forward; terminal states accept nothing.
    pub fn can_advance_to(self, next: TaskStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Waiting => write!(f, "waiting"),
            TaskStatus::Uploading => write!(f, "uploading"),
            TaskStatus::Processing => write!(f, "processing"),
            TaskStatus::Done => write!(f, "done"),
            TaskStatus::Error => write!(f, "error"),
            TaskStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Rejected status change.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("Illegal transition for task {task}: {from} -> {to}")]
pub struct TransitionError {
    pub task: TaskId,
    pub from: TaskStatus,
    pub to: TaskStatus,
}

/// Per-kind payload of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskKind {
    /// Encode a single source file.
    Convert {
        source: PathBuf,
        request: EncodeRequest,
    },
    /// Stream-copy merge of outputs produced by earlier tasks.
    ///
    /// `dependency_refs` are resolved at execution time against the results
    /// of tasks that already finished.
    Concat {
        request: EncodeRequest,
        dependency_refs: Vec<TaskId>,
    },
    /// Physically remove a file after the encode phase.
    Trash { path: PathBuf },
}

impl TaskKind {
    pub fn name(&self) -> &'static str {
        match self {
            TaskKind::Convert { .. } => "convert",
            TaskKind::Concat { .. } => "concat",
            TaskKind::Trash { .. } => "trash",
        }
    }

    /// Encode request for convert and concat tasks.
    pub fn request(&self) -> Option<&EncodeRequest> {
        match self {
            TaskKind::Convert { request, .. } | TaskKind::Concat { request, .. } => Some(request),
            TaskKind::Trash { .. } => None,
        }
    }

    /// True for tasks handled by the encoder.
    pub fn is_encode(&self) -> bool {
        !matches!(self, TaskKind::Trash { .. })
    }
}

/// One unit of orchestrated work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub kind: TaskKind,
    /// Human readable name shown in listings.
    pub label: String,
    pub status: TaskStatus,
    /// 0-100, never decreases while processing.
    pub progress: f64,
    /// Source size in bytes.
    pub size: u64,
    /// Source duration in seconds.
    pub duration: f64,
    /// Live or final output size in bytes.
    pub encoded_size: u64,
    /// Declared output size, when a recipe knows it up front.
    pub expected_size: Option<u64>,
    /// Unix timestamp (milliseconds) when processing started.
    pub started_at: Option<i64>,
    /// Unix timestamp (milliseconds) when the task reached a terminal state.
    pub completed_at: Option<i64>,
    /// Transient artifact eligible for staged deletion.
    pub is_temp: bool,
    /// Playback-speed multiplier of the produced output.
    pub time_scale: Option<f64>,
    pub error_reason: Option<String>,
}

impl Task {
    /// Create a waiting task.
    pub fn new(id: TaskId, kind: TaskKind, label: impl Into<String>) -> Self {
        Self {
            id,
            kind,
            label: label.into(),
            status: TaskStatus::Waiting,
            progress: 0.0,
            size: 0,
            duration: 0.0,
            encoded_size: 0,
            expected_size: None,
            started_at: None,
            completed_at: None,
            is_temp: false,
            time_scale: None,
            error_reason: None,
        }
    }

    /// Source metrics of the file the task reads.
    pub fn with_media(mut self, size: u64, duration: f64) -> Self {
        self.size = size;
        self.duration = duration;
        self
    }

    pub fn with_time_scale(mut self, scale: f64) -> Self {
        self.time_scale = Some(scale);
        self
    }

    pub fn with_temp(mut self, is_temp: bool) -> Self {
        self.is_temp = is_temp;
        self
    }

    /// Expected output duration: the source duration compressed by the time scale.
    pub fn expected_duration(&self) -> f64 {
        match self.time_scale {
            Some(scale) if scale > 0.0 => self.duration / scale,
            _ => self.duration,
        }
    }

    fn advance(&mut self, next: TaskStatus) -> Result<(), TransitionError> {
        if !self.status.can_advance_to(next) {
            return Err(TransitionError {
                task: self.id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Mark the task as uploading its input.
    pub fn begin_upload(&mut self) -> Result<(), TransitionError> {
        self.advance(TaskStatus::Uploading)
    }

    /// Mark the task as processing, zero its progress and stamp the start time.
    pub fn start(&mut self, now_ms: i64) -> Result<(), TransitionError> {
        self.advance(TaskStatus::Processing)?;
        self.progress = 0.0;
        self.started_at = Some(now_ms);
        Ok(())
    }

    /// Raise the progress; lower values are ignored.
    pub fn record_progress(&mut self, percent: f64) {
        if self.status != TaskStatus::Processing || !percent.is_finite() {
            return;
        }
        let clamped = percent.clamp(0.0, 100.0);
        if clamped > self.progress {
            self.progress = clamped;
        }
    }

    /// Mark the task as done with its final output size.
    pub fn complete(&mut self, encoded_size: u64, now_ms: i64) -> Result<(), TransitionError> {
        self.advance(TaskStatus::Done)?;
        self.progress = 100.0;
        self.encoded_size = encoded_size;
        self.completed_at = Some(now_ms);
        Ok(())
    }

    /// Mark the task as failed with a reason.
    pub fn fail(&mut self, reason: &str, now_ms: i64) -> Result<(), TransitionError> {
        self.advance(TaskStatus::Error)?;
        self.error_reason = Some(reason.to_string());
        self.completed_at = Some(now_ms);
        Ok(())
    }

    /// Mark the task as skipped with a reason.
    pub fn skip(&mut self, reason: &str) -> Result<(), TransitionError> {
        self.advance(TaskStatus::Skipped)?;
        self.error_reason = Some(reason.to_string());
        Ok(())
    }

    /// Check if the task is in a terminal state (done, error, or skipped).
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Check if the task is active (waiting, uploading or processing).
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

/// Result of analysing one media file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaInfo {
    pub path: PathBuf,
    pub size: u64,
    pub has_video: bool,
    pub has_audio: bool,
    /// Duration in seconds.
    pub duration: f64,
}

/// Lifecycle of an imported file in the source list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    #[default]
    Analyzing,
    Uploading,
    Ready,
    Error,
}

impl fmt::Display for SourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceStatus::Analyzing => write!(f, "analyzing"),
            SourceStatus::Uploading => write!(f, "uploading"),
            SourceStatus::Ready => write!(f, "ready"),
            SourceStatus::Error => write!(f, "error"),
        }
    }
}

/// An imported file waiting to be fed to a recipe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceFile {
    pub id: TaskId,
    pub path: PathBuf,
    pub size: u64,
    pub duration: f64,
    pub has_video: bool,
    pub has_audio: bool,
    /// The file lives in our own staging area (chunked import or intermediate).
    pub is_temp: bool,
    pub status: SourceStatus,
    /// Transfer progress, 0-100.
    pub progress: f64,
    pub error_reason: Option<String>,
}

impl SourceFile {
    /// A file known by path that still needs analysis.
    pub fn pending(path: impl Into<PathBuf>) -> Self {
        Self {
            id: TaskId::new(),
            path: path.into(),
            size: 0,
            duration: 0.0,
            has_video: false,
            has_audio: false,
            is_temp: false,
            status: SourceStatus::Analyzing,
            progress: 0.0,
            error_reason: None,
        }
    }

    /// A byte blob being transferred into the imports directory.
    pub fn uploading(name: &str, size: u64) -> Self {
        Self {
            size,
            is_temp: true,
            status: SourceStatus::Uploading,
            ..Self::pending(name)
        }
    }

    /// A file that is already analysed.
    pub fn ready(info: MediaInfo) -> Self {
        let mut file = Self::pending(info.path.clone());
        file.apply_analysis(info);
        file
    }

    pub fn apply_analysis(&mut self, info: MediaInfo) {
        self.path = info.path;
        self.size = info.size;
        self.duration = info.duration;
        self.has_video = info.has_video;
        self.has_audio = info.has_audio;
        self.status = SourceStatus::Ready;
    }

    pub fn fail(&mut self, reason: &str) {
        self.status = SourceStatus::Error;
        self.error_reason = Some(reason.to_string());
    }

    pub fn file_name(&self) -> String {
        file_name_of(&self.path)
    }
}

/// Last path component as a display string.
pub fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

/// Get current timestamp in milliseconds since Unix epoch.
pub fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
