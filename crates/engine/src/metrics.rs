//! Metrics engine for OptiMux
//!
//! Aggregate progress, size projection and ETA are a pure function of a row
//! list, the run phase, the run start time and "now". Nothing is cached
//! between calls.

use crate::store::RunPhase;
use crate::task::{SourceFile, SourceStatus, Task, TaskStatus};
use serde::{Deserialize, Serialize};

/// The per-entry values the metrics engine looks at.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricRow {
    pub status: TaskStatus,
    pub progress: f64,
    pub size: u64,
    pub duration: f64,
    pub time_scale: Option<f64>,
    pub encoded_size: u64,
    pub expected_size: Option<u64>,
}

impl MetricRow {
    /// Progress weight: expected output duration, else raw duration, else 1.
    pub fn weight(&self) -> f64 {
        let expected = match self.time_scale {
            Some(scale) if scale > 0.0 => self.duration / scale,
            _ => self.duration,
        };
        if expected > 0.0 {
            expected
        } else if self.duration > 0.0 {
            self.duration
        } else {
            1.0
        }
    }

    fn completed_fraction(&self) -> f64 {
        match self.status {
            TaskStatus::Done => 1.0,
            TaskStatus::Processing | TaskStatus::Uploading => {
                (self.progress / 100.0).clamp(0.0, 1.0)
            }
            _ => 0.0,
        }
    }

    fn counts_encoded(&self) -> bool {
        matches!(
            self.status,
            TaskStatus::Done | TaskStatus::Processing | TaskStatus::Uploading
        )
    }
}

impl From<&Task> for MetricRow {
    fn from(task: &Task) -> Self {
        Self {
            status: task.status,
            progress: task.progress,
            size: task.size,
            duration: task.duration,
            time_scale: task.time_scale,
            encoded_size: task.encoded_size,
            expected_size: task.expected_size,
        }
    }
}

impl From<&SourceFile> for MetricRow {
    fn from(file: &SourceFile) -> Self {
        // A ready source has not been converted yet, so it still counts as waiting.
        let status = match file.status {
            SourceStatus::Analyzing | SourceStatus::Ready => TaskStatus::Waiting,
            SourceStatus::Uploading => TaskStatus::Uploading,
            SourceStatus::Error => TaskStatus::Error,
        };
        Self {
            status,
            progress: file.progress,
            size: file.size,
            duration: file.duration,
            time_scale: None,
            encoded_size: 0,
            expected_size: None,
        }
    }
}

/// Aggregate metrics of one observation.
///
/// `None` marks a value that cannot be computed yet (zero denominator).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct JobMetrics {
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub success_count: usize,
    pub error_count: usize,
    pub skipped_count: usize,

    pub total_original_bytes: u64,
    pub current_encoded_bytes: u64,
    pub projected_total_bytes: u64,
    pub reduction_rate_percent: Option<f64>,

    /// 0-100.
    pub global_progress: f64,
    pub total_weight: f64,
    pub processed_weight: f64,
    pub elapsed_secs: f64,
    pub throughput_weight_per_sec: Option<f64>,
    pub eta_secs: Option<f64>,
    pub realtime_speed: Option<f64>,
    pub current_speed_bps: Option<f64>,

    pub has_active_job: bool,
    pub is_job_finished: bool,
}

fn ratio(num: f64, den: f64) -> Option<f64> {
    if den > 0.0 && num.is_finite() {
        Some(num / den)
    } else {
        None
    }
}

/// Compute metrics over `rows`.
///
/// `started_at` and `now_ms` are Unix milliseconds; elapsed time is zero
/// while no run has been started.
pub fn compute_metrics(
    rows: &[MetricRow],
    phase: RunPhase,
    started_at: Option<i64>,
    now_ms: i64,
) -> JobMetrics {
    let mut m = JobMetrics {
        total_tasks: rows.len(),
        ..JobMetrics::default()
    };

    for row in rows {
        match row.status {
            TaskStatus::Done => m.completed_tasks += 1,
            TaskStatus::Error => m.error_count += 1,
            TaskStatus::Skipped => m.skipped_count += 1,
            _ => {}
        }

        let weight = row.weight();
        m.total_weight += weight;
        m.processed_weight += weight * row.completed_fraction();
        m.total_original_bytes += row.size;
        if row.counts_encoded() {
            m.current_encoded_bytes += row.encoded_size;
        }
    }
    m.success_count = m.completed_tasks;

    m.has_active_job = rows.iter().any(|r| !r.status.is_terminal());
    m.is_job_finished = !rows.is_empty() && !m.has_active_job;

    m.global_progress = ratio(m.processed_weight * 100.0, m.total_weight).unwrap_or(0.0);

    m.projected_total_bytes = if rows.iter().any(|r| r.expected_size.is_some()) {
        rows.iter()
            .map(|r| match r.status {
                TaskStatus::Done => r.encoded_size,
                _ => r.expected_size.unwrap_or(r.size),
            })
            .sum()
    } else if m.global_progress > 0.0 {
        (m.current_encoded_bytes as f64 / (m.global_progress / 100.0)).round() as u64
    } else {
        m.total_original_bytes
    };

    m.reduction_rate_percent = ratio(
        (m.total_original_bytes as f64 - m.projected_total_bytes as f64) * 100.0,
        m.total_original_bytes as f64,
    );

    m.elapsed_secs = match started_at {
        Some(start) => (now_ms.saturating_sub(start)).max(0) as f64 / 1000.0,
        None => 0.0,
    };

    m.throughput_weight_per_sec = ratio(m.processed_weight, m.elapsed_secs);
    m.eta_secs = match m.throughput_weight_per_sec {
        Some(rate) if rate > 0.0 => Some(((m.total_weight - m.processed_weight) / rate).max(0.0)),
        _ => None,
    };
    m.current_speed_bps = ratio(m.current_encoded_bytes as f64, m.elapsed_secs);

    if phase == RunPhase::Converting {
        let consumed: f64 = rows
            .iter()
            .map(|r| match r.status {
                TaskStatus::Done => r.duration,
                TaskStatus::Processing => r.duration * (r.progress / 100.0).clamp(0.0, 1.0),
                _ => 0.0,
            })
            .sum();
        m.realtime_speed = ratio(consumed, m.elapsed_secs);
    }

    m
}

/// Metrics over a task list.
pub fn task_metrics(tasks: &[Task], phase: RunPhase, started_at: Option<i64>, now_ms: i64) -> JobMetrics {
    let rows: Vec<MetricRow> = tasks.iter().map(MetricRow::from).collect();
    compute_metrics(&rows, phase, started_at, now_ms)
}

/// Metrics over the imported source list.
pub fn source_metrics(
    sources: &[SourceFile],
    phase: RunPhase,
    started_at: Option<i64>,
    now_ms: i64,
) -> JobMetrics {
    let rows: Vec<MetricRow> = sources.iter().map(MetricRow::from).collect();
    compute_metrics(&rows, phase, started_at, now_ms)
}
