//! Out-of-band signals from the process runner.
//!
//! A runner gets an [`EventSink`] bound to the task it is executing, so every
//! event carries the id of the task that produced it. The store drops events
//! whose id is not the one it currently tracks.

use crate::task::TaskId;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Encoder position and live output size.
    Progress {
        task_id: TaskId,
        time_sec: f64,
        size: u64,
    },
    /// One line of encoder diagnostics.
    Log { task_id: TaskId, line: String },
}

impl EngineEvent {
    pub fn task_id(&self) -> TaskId {
        match self {
            EngineEvent::Progress { task_id, .. } | EngineEvent::Log { task_id, .. } => *task_id,
        }
    }
}

/// Sending half of the event channel, bound to one task.
#[derive(Debug, Clone)]
pub struct EventSink {
    task_id: TaskId,
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl EventSink {
    pub fn new(task_id: TaskId, tx: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self { task_id, tx }
    }

    /// A sink whose events go nowhere.
    pub fn detached(task_id: TaskId) -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { task_id, tx }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn progress(&self, time_sec: f64, size: u64) {
        self.send(EngineEvent::Progress {
            task_id: self.task_id,
            time_sec,
            size,
        });
    }

    pub fn log(&self, line: impl Into<String>) {
        self.send(EngineEvent::Log {
            task_id: self.task_id,
            line: line.into(),
        });
    }

    fn send(&self, event: EngineEvent) {
        // The receiver is gone once the run is over; late events are dropped.
        let _ = self.tx.send(event);
    }
}

/// Create the channel shared by every sink of a run.
pub fn channel() -> (
    mpsc::UnboundedSender<EngineEvent>,
    mpsc::UnboundedReceiver<EngineEvent>,
) {
    mpsc::unbounded_channel()
}
