//! Deferred delete protocol.
//!
//! Deleting staged files is a two step saga: every selected file first gets
//! a token from the [`DeleteService`], then the whole pending set is either
//! confirmed or cancelled. Files that are not staged are only delisted and
//! never touch the service.
//!
//! Partial failures never stop a batch. Each step returns the entries that
//! failed next to the ones that went through.

use crate::task::TaskId;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum DeleteError {
    #[error("File not found: {0}")]
    NotFound(PathBuf),

    #[error("Unknown delete token: {0}")]
    UnknownToken(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Delete service failed: {0}")]
    Service(String),
}

/// Backend that physically removes files.
#[async_trait]
pub trait DeleteService: Send + Sync {
    /// Stage `path` for deletion and return an opaque token.
    async fn request_delete(&self, path: &Path) -> Result<String, DeleteError>;
    /// Remove the file staged under `token`.
    async fn confirm_delete(&self, token: &str) -> Result<(), DeleteError>;
    /// Forget `token` without touching the file.
    async fn cancel_delete(&self, token: &str) -> Result<(), DeleteError>;
}

/// Asked once before a pending set is committed.
#[async_trait]
pub trait DeleteApproval: Send + Sync {
    async fn approve(&self, pending: &PendingDeletes) -> bool;
}

/// Approves everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoApprove;

#[async_trait]
impl DeleteApproval for AutoApprove {
    async fn approve(&self, _pending: &PendingDeletes) -> bool {
        true
    }
}

/// Approves nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct Decline;

#[async_trait]
impl DeleteApproval for Decline {
    async fn approve(&self, _pending: &PendingDeletes) -> bool {
        false
    }
}

/// A file selected for deletion.
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteTarget {
    pub id: TaskId,
    pub path: PathBuf,
    /// Staged files go through the token flow; others are only delisted.
    pub staged: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingDelete {
    pub id: TaskId,
    pub path: PathBuf,
    pub token: String,
}

/// Tokens waiting for confirm or cancel.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PendingDeletes {
    entries: Vec<PendingDelete>,
}

impl PendingDeletes {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ids(&self) -> Vec<TaskId> {
        self.entries.iter().map(|e| e.id).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingDelete> {
        self.entries.iter()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteFailure {
    pub id: TaskId,
    pub path: PathBuf,
    pub reason: String,
}

/// Outcome of the request step.
#[derive(Debug, Default)]
pub struct DeleteRequest {
    /// Unstaged entries to drop from the list right away.
    pub delisted: Vec<TaskId>,
    pub pending: PendingDeletes,
    pub failures: Vec<DeleteFailure>,
}

/// Outcome of the confirm or cancel step.
#[derive(Debug, Default, PartialEq)]
pub struct DeleteReport {
    pub completed: Vec<TaskId>,
    pub failures: Vec<DeleteFailure>,
}

#[derive(Clone)]
pub struct DeleteProtocol {
    service: Arc<dyn DeleteService>,
}

impl DeleteProtocol {
    pub fn new(service: Arc<dyn DeleteService>) -> Self {
        Self { service }
    }

    /// Issue a token for every staged target.
    pub async fn request(&self, targets: &[DeleteTarget]) -> DeleteRequest {
        let mut out = DeleteRequest::default();

        for target in targets {
            if !target.staged {
                out.delisted.push(target.id);
                continue;
            }
            match self.service.request_delete(&target.path).await {
                Ok(token) => {
                    debug!(path = %target.path.display(), "Delete staged");
                    out.pending.entries.push(PendingDelete {
                        id: target.id,
                        path: target.path.clone(),
                        token,
                    });
                }
                Err(e) => {
                    warn!(path = %target.path.display(), error = %e, "Delete request failed");
                    out.failures.push(DeleteFailure {
                        id: target.id,
                        path: target.path.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        out
    }

    /// Commit every pending token. The pending set is consumed.
    pub async fn confirm(&self, pending: PendingDeletes) -> DeleteReport {
        let mut report = DeleteReport::default();
        for entry in pending.entries {
            match self.service.confirm_delete(&entry.token).await {
                Ok(()) => {
                    info!(path = %entry.path.display(), "Deleted");
                    report.completed.push(entry.id);
                }
                Err(e) => {
                    warn!(path = %entry.path.display(), error = %e, "Delete confirm failed");
                    report.failures.push(DeleteFailure {
                        id: entry.id,
                        path: entry.path,
                        reason: e.to_string(),
                    });
                }
            }
        }
        report
    }

    /// Release every pending token. The pending set is consumed.
    pub async fn cancel(&self, pending: PendingDeletes) -> DeleteReport {
        let mut report = DeleteReport::default();
        for entry in pending.entries {
            match self.service.cancel_delete(&entry.token).await {
                Ok(()) => report.completed.push(entry.id),
                Err(e) => {
                    warn!(path = %entry.path.display(), error = %e, "Delete cancel failed");
                    report.failures.push(DeleteFailure {
                        id: entry.id,
                        path: entry.path,
                        reason: e.to_string(),
                    });
                }
            }
        }
        report
    }
}

/// Delete service that moves files into a trash directory.
#[derive(Debug)]
pub struct LocalDeleteService {
    trash_dir: PathBuf,
    pending: Mutex<HashMap<String, PathBuf>>,
}

impl LocalDeleteService {
    pub fn new(trash_dir: impl Into<PathBuf>) -> Self {
        Self {
            trash_dir: trash_dir.into(),
            pending: Mutex::new(HashMap::new()),
        }
    }

    async fn move_to_trash(&self, path: &Path, token: &str) -> Result<PathBuf, DeleteError> {
        fs::create_dir_all(&self.trash_dir).await?;

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| token.to_string());
        let mut dest = self.trash_dir.join(&name);
        if fs::try_exists(&dest).await.unwrap_or(false) {
            dest = self.trash_dir.join(format!("{}-{}", token, name));
        }

        if fs::rename(path, &dest).await.is_err() {
            // Different filesystem.
            fs::copy(path, &dest).await?;
            fs::remove_file(path).await?;
        }
        Ok(dest)
    }
}

#[async_trait]
impl DeleteService for LocalDeleteService {
    async fn request_delete(&self, path: &Path) -> Result<String, DeleteError> {
        if !fs::try_exists(path).await.unwrap_or(false) {
            return Err(DeleteError::NotFound(path.to_path_buf()));
        }
        let token = Uuid::new_v4().to_string();
        self.pending
            .lock()
            .await
            .insert(token.clone(), path.to_path_buf());
        Ok(token)
    }

    async fn confirm_delete(&self, token: &str) -> Result<(), DeleteError> {
        let path = self
            .pending
            .lock()
            .await
            .remove(token)
            .ok_or_else(|| DeleteError::UnknownToken(token.to_string()))?;
        let dest = self.move_to_trash(&path, token).await?;
        debug!(from = %path.display(), to = %dest.display(), "Moved to trash");
        Ok(())
    }

    async fn cancel_delete(&self, token: &str) -> Result<(), DeleteError> {
        self.pending
            .lock()
            .await
            .remove(token)
            .map(|_| ())
            .ok_or_else(|| DeleteError::UnknownToken(token.to_string()))
    }
}
