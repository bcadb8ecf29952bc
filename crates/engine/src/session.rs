//! Session wiring for OptiMux
//!
//! A [`Session`] owns the job store and the external collaborators and
//! exposes the user-level operations: import, run a recipe, delete sources.

use crate::analyzer::{FfprobeAnalyzer, MediaAnalyzer};
use crate::config::Config;
use crate::delete::{DeleteApproval, DeleteFailure, DeleteProtocol, DeleteService, DeleteTarget, LocalDeleteService};
use crate::encode::{FfmpegRunner, ProcessRunner};
use crate::metrics_server::run_metrics_server;
use crate::orchestrator::{Orchestrator, RunReport};
use crate::placement::StorageDirs;
use crate::recipe::{Recipe, RecipeError};
use crate::startup::{run_startup_checks, StartupError};
use crate::store::JobStore;
use crate::task::{SourceFile, SourceStatus, TaskId};
use crate::transfer::{transfer, ChunkPolicy, ChunkSink, LocalChunkSink, TransferError};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Error type for session operations
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    #[error("Recipe error: {0}")]
    Recipe(#[from] RecipeError),

    #[error("Transfer failed: {0}")]
    Transfer(#[from] TransferError),

    #[error("Imported file could not be analyzed: {0}")]
    Analysis(String),

    /// A run is still executing tasks.
    #[error("A run is already in progress")]
    Busy,
}

/// Outcome of deleting imported sources.
#[derive(Debug, Default)]
pub struct SourceDeleteSummary {
    /// Removed from the list without touching the file.
    pub delisted: Vec<TaskId>,
    /// Physically deleted and removed from the list.
    pub deleted: Vec<TaskId>,
    /// Still listed, marked as error.
    pub failures: Vec<DeleteFailure>,
    /// The approval gate declined; staged files were kept.
    pub declined: bool,
}

pub struct Session {
    config: Config,
    dirs: StorageDirs,
    store: JobStore,
    chunk_policy: ChunkPolicy,
    analyzer: Arc<dyn MediaAnalyzer>,
    runner: Arc<dyn ProcessRunner>,
    chunks: Arc<dyn ChunkSink>,
    deletes: Arc<dyn DeleteService>,
}

impl Session {
    /// Build a session after verifying the external tools.
    ///
    /// The check is skipped when `[encoder].skip_checks` is set.
    pub fn new(config: Config) -> Result<Self, SessionError> {
        if config.encoder.skip_checks {
            info!("Skipping startup checks");
        } else {
            run_startup_checks(&config)?;
        }
        Ok(Self::new_without_checks(config))
    }

    /// Build a session without running startup checks
    ///
    /// Useful for testing when ffmpeg is not available.
    pub fn new_without_checks(config: Config) -> Self {
        let dirs = StorageDirs::from_config(&config.storage);
        let store = JobStore::new(config.log.window);
        let chunk_policy = ChunkPolicy::from(&config.transfer);
        let analyzer = Arc::new(FfprobeAnalyzer::new(config.encoder.ffprobe.clone()));
        let runner = Arc::new(FfmpegRunner::new(config.encoder.ffmpeg.clone(), dirs.clone()));
        let chunks = Arc::new(LocalChunkSink::new(dirs.imports_dir.clone()));
        let deletes = Arc::new(LocalDeleteService::new(dirs.trash_dir.clone()));

        Self {
            config,
            dirs,
            store,
            chunk_policy,
            analyzer,
            runner,
            chunks,
            deletes,
        }
    }

    pub fn with_analyzer(mut self, analyzer: Arc<dyn MediaAnalyzer>) -> Self {
        self.analyzer = analyzer;
        self
    }

    pub fn with_runner(mut self, runner: Arc<dyn ProcessRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_chunk_sink(mut self, chunks: Arc<dyn ChunkSink>) -> Self {
        self.chunks = chunks;
        self
    }

    pub fn with_delete_service(mut self, deletes: Arc<dyn DeleteService>) -> Self {
        self.deletes = deletes;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn dirs(&self) -> &StorageDirs {
        &self.dirs
    }

    pub fn store(&self) -> JobStore {
        self.store.clone()
    }

    /// Spawn the metrics endpoint as a background task.
    pub fn start_metrics_server(&self) -> tokio::task::JoinHandle<()> {
        let store = self.store.clone();
        let bind = self.config.metrics.bind.clone();
        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(store, &bind).await {
                error!(error = %e, "Metrics server error");
            }
        })
    }

    /// Import files by path and analyze them concurrently.
    ///
    /// Every path gets a source entry right away; each analysis result is
    /// applied to its entry by id, in whatever order they finish.
    pub async fn import_paths(&self, paths: &[PathBuf]) -> Vec<TaskId> {
        let files: Vec<SourceFile> = paths.iter().map(|p| SourceFile::pending(p.clone())).collect();
        let ids: Vec<TaskId> = files.iter().map(|f| f.id).collect();

        self.store.begin_import().await;
        self.store.add_sources(files.clone()).await;

        let mut analyses = JoinSet::new();
        for file in files {
            let analyzer = self.analyzer.clone();
            analyses.spawn(async move {
                let result = analyzer.analyze(&file.path).await;
                (file.id, file.path, result)
            });
        }

        while let Some(joined) = analyses.join_next().await {
            let (id, path, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    error!(error = %e, "Analysis task panicked");
                    continue;
                }
            };
            let applied = match result {
                Ok(info) => {
                    debug!(path = %path.display(), "Source ready");
                    self.store.update_source(id, |s| s.apply_analysis(info)).await
                }
                Err(e) => {
                    let reason = e.to_string();
                    warn!(path = %path.display(), error = %reason, "Analysis failed");
                    self.store
                        .append_log(format!("Could not analyze {}: {}", path.display(), reason))
                        .await;
                    self.store.update_source(id, |s| s.fail(&reason)).await
                }
            };
            if !applied {
                debug!(source_id = %id, "Source removed before analysis finished");
            }
        }

        self.store.end_import().await;
        info!(files = ids.len(), "Import finished");
        ids
    }

    /// Import an in-memory file through the chunked transfer.
    ///
    /// The source entry tracks upload progress and is analyzed once the last
    /// chunk has landed. A failed transfer marks only this entry as error.
    pub async fn import_blob(&self, file_name: &str, data: &[u8]) -> Result<TaskId, SessionError> {
        let source = SourceFile::uploading(file_name, data.len() as u64);
        let id = source.id;
        self.store.add_sources([source]).await;

        let (tx, mut rx) = mpsc::unbounded_channel::<u8>();
        let upload = transfer(
            self.chunks.as_ref(),
            &self.chunk_policy,
            file_name,
            data,
            move |percent| {
                let _ = tx.send(percent);
            },
        );
        let track = async {
            while let Some(percent) = rx.recv().await {
                self.store
                    .update_source(id, |s| s.progress = f64::from(percent))
                    .await;
            }
        };
        let (result, ()) = tokio::join!(upload, track);

        let path = match result {
            Ok(path) => path,
            Err(e) => {
                let reason = e.to_string();
                warn!(file = file_name, error = %reason, "Upload failed");
                self.store.update_source(id, |s| s.fail(&reason)).await;
                return Err(e.into());
            }
        };

        self.store
            .update_source(id, |s| {
                s.path = path.clone();
                s.status = SourceStatus::Analyzing;
            })
            .await;
        match self.analyzer.analyze(&path).await {
            Ok(info) => {
                self.store.update_source(id, |s| s.apply_analysis(info)).await;
                info!(file = file_name, path = %path.display(), "Upload imported");
                Ok(id)
            }
            Err(e) => {
                let reason = e.to_string();
                self.store.update_source(id, |s| s.fail(&reason)).await;
                Err(SessionError::Analysis(reason))
            }
        }
    }

    /// Compile `recipe` over the ready sources and load the task list.
    ///
    /// The store is claimed for the run right away, so a second `prepare`
    /// fails with [`SessionError::Busy`] until this task list has finished.
    /// The returned orchestrator has not started; take its cancel handle
    /// before calling `run`.
    pub async fn prepare(
        &self,
        recipe: &Recipe,
        approval: Arc<dyn DeleteApproval>,
    ) -> Result<Orchestrator, SessionError> {
        if self.store.is_busy().await {
            return Err(SessionError::Busy);
        }

        let ready: Vec<SourceFile> = self
            .store
            .sources()
            .await
            .into_iter()
            .filter(|s| s.status == SourceStatus::Ready)
            .collect();
        let tasks = recipe.compile(&ready)?;
        info!(recipe = recipe.name(), files = ready.len(), tasks = tasks.len(), "Recipe compiled");

        if !self.store.claim_run(tasks).await {
            return Err(SessionError::Busy);
        }
        Ok(
            Orchestrator::new(self.store.clone(), self.runner.clone(), self.deletes.clone())
                .with_approval(approval),
        )
    }

    /// Compile and run `recipe` to the end.
    pub async fn run_recipe(
        &self,
        recipe: &Recipe,
        approval: Arc<dyn DeleteApproval>,
    ) -> Result<RunReport, SessionError> {
        let orchestrator = self.prepare(recipe, approval).await?;
        Ok(orchestrator.run().await)
    }

    /// Remove sources from the list, deleting staged temp files.
    ///
    /// Non-temp sources are only delisted. Temp sources go through the
    /// request/confirm flow and stay listed (as error) if that fails.
    pub async fn delete_sources(
        &self,
        ids: &[TaskId],
        approval: &dyn DeleteApproval,
    ) -> SourceDeleteSummary {
        let targets: Vec<DeleteTarget> = self
            .store
            .sources()
            .await
            .into_iter()
            .filter(|s| ids.contains(&s.id))
            .map(|s| DeleteTarget {
                id: s.id,
                path: s.path,
                staged: s.is_temp,
            })
            .collect();

        let protocol = DeleteProtocol::new(self.deletes.clone());
        let request = protocol.request(&targets).await;

        let mut summary = SourceDeleteSummary {
            delisted: request.delisted,
            failures: request.failures,
            ..Default::default()
        };
        self.store.remove_sources(&summary.delisted).await;

        let pending = request.pending;
        if !pending.is_empty() {
            if approval.approve(&pending).await {
                let report = protocol.confirm(pending).await;
                self.store.remove_sources(&report.completed).await;
                summary.deleted = report.completed;
                summary.failures.extend(report.failures);
            } else {
                let report = protocol.cancel(pending).await;
                summary.failures.extend(report.failures);
                summary.declined = true;
            }
        }

        for failure in &summary.failures {
            self.store
                .update_source(failure.id, |s| s.fail(&failure.reason))
                .await;
        }
        info!(
            delisted = summary.delisted.len(),
            deleted = summary.deleted.len(),
            failed = summary.failures.len(),
            "Sources removed"
        );
        summary
    }

    /// Forget every source, task and log line.
    pub async fn clear(&self) -> Result<(), SessionError> {
        if self.store.is_busy().await {
            return Err(SessionError::Busy);
        }
        self.store.clear_all().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::AnalysisError;
    use crate::delete::{AutoApprove, Decline, DeleteError};
    use crate::store::RunPhase;
    use crate::encode::ProcessError;
    use crate::events::EventSink;
    use crate::orchestrator::RunOutcome;
    use crate::recipe::PlainConvertParams;
    use crate::request::{EncodeRequest, EncodeResult, OutputArtifact, MAIN_LABEL};
    use crate::task::{MediaInfo, TaskStatus};
    use async_trait::async_trait;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Reports every `.mov` as a 10s clip, anything else as unsupported.
    struct FakeAnalyzer;

    #[async_trait]
    impl MediaAnalyzer for FakeAnalyzer {
        async fn analyze(&self, path: &Path) -> Result<MediaInfo, AnalysisError> {
            // Delay the first path so results complete out of order.
            let delay = if path.to_string_lossy().contains("slow") { 30 } else { 0 };
            tokio::time::sleep(Duration::from_millis(delay)).await;
            if path.extension().and_then(|e| e.to_str()) != Some("mov") {
                return Err(AnalysisError::Unsupported(path.display().to_string()));
            }
            Ok(MediaInfo {
                path: path.to_path_buf(),
                size: 2048,
                has_video: true,
                has_audio: false,
                duration: 10.0,
            })
        }
    }

    struct EchoRunner;

    #[async_trait]
    impl ProcessRunner for EchoRunner {
        async fn run(&self, request: &EncodeRequest, _events: EventSink) -> Result<EncodeResult, ProcessError> {
            Ok(EncodeResult {
                outputs: vec![OutputArtifact {
                    label: MAIN_LABEL.to_string(),
                    path: request.input.paths[0].with_extension("out.mp4"),
                    size: 512,
                }],
            })
        }
    }

    fn session(root: &Path) -> Session {
        let mut config = Config::default();
        config.storage.imports_dir = Some(root.join("imports"));
        config.storage.trash_dir = Some(root.join("trash"));
        config.storage.temp_dir = Some(root.join("tmp"));
        Session::new_without_checks(config)
            .with_analyzer(Arc::new(FakeAnalyzer))
            .with_runner(Arc::new(EchoRunner))
    }

    #[tokio::test]
    async fn test_import_applies_results_by_id() {
        let temp = TempDir::new().unwrap();
        let s = session(temp.path());

        let ids = s
            .import_paths(&[
                PathBuf::from("/m/slow.mov"),
                PathBuf::from("/m/fast.mov"),
                PathBuf::from("/m/notes.txt"),
            ])
            .await;

        let store = s.store();
        let slow = store.source(ids[0]).await.unwrap();
        let fast = store.source(ids[1]).await.unwrap();
        let text = store.source(ids[2]).await.unwrap();
        assert_eq!(slow.path, PathBuf::from("/m/slow.mov"));
        assert_eq!(slow.status, SourceStatus::Ready);
        assert_eq!(fast.status, SourceStatus::Ready);
        assert_eq!(fast.duration, 10.0);
        assert_eq!(text.status, SourceStatus::Error);
        assert_eq!(store.phase().await, RunPhase::Idle);
    }

    #[tokio::test]
    async fn test_import_blob_lands_in_imports_dir() {
        let temp = TempDir::new().unwrap();
        let s = session(temp.path());
        let data = vec![7u8; 4096];

        let id = s.import_blob("phone.mov", &data).await.unwrap();

        let source = s.store().source(id).await.unwrap();
        assert_eq!(source.status, SourceStatus::Ready);
        assert!(source.is_temp);
        assert_eq!(source.progress, 100.0);
        assert_eq!(source.path, temp.path().join("imports").join("phone.mov"));
        assert_eq!(std::fs::read(&source.path).unwrap(), data);
    }

    #[tokio::test]
    async fn test_empty_blob_fails_only_its_entry() {
        let temp = TempDir::new().unwrap();
        let s = session(temp.path());
        s.import_paths(&[PathBuf::from("/m/a.mov")]).await;

        let err = s.import_blob("empty.mov", &[]).await.unwrap_err();
        assert!(matches!(err, SessionError::Transfer(TransferError::Empty(_))));

        let sources = s.store().sources().await;
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].status, SourceStatus::Ready);
        assert_eq!(sources[1].status, SourceStatus::Error);
    }

    #[tokio::test]
    async fn test_run_recipe_uses_only_ready_sources() {
        let temp = TempDir::new().unwrap();
        let s = session(temp.path());
        s.import_paths(&[PathBuf::from("/m/a.mov"), PathBuf::from("/m/b.txt")])
            .await;

        let recipe = Recipe::PlainConvert(PlainConvertParams::default());
        let report = s.run_recipe(&recipe, Arc::new(AutoApprove)).await.unwrap();

        assert_eq!(report.outcome, RunOutcome::Completed);
        let tasks = s.store().tasks().await;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].status, TaskStatus::Done);
        assert_eq!(tasks[0].encoded_size, 512);
        assert_eq!(report.metrics.total_tasks, 1);
        assert!(report.metrics.is_job_finished);
    }

    #[tokio::test]
    async fn test_run_without_ready_sources() {
        let temp = TempDir::new().unwrap();
        let s = session(temp.path());
        let recipe = Recipe::PlainConvert(PlainConvertParams::default());
        let err = s.run_recipe(&recipe, Arc::new(AutoApprove)).await.unwrap_err();
        assert!(matches!(err, SessionError::Recipe(RecipeError::NoInputs)));
    }

    #[tokio::test]
    async fn test_delete_sources_delists_and_trashes() {
        let temp = TempDir::new().unwrap();
        let s = session(temp.path());
        let kept = s.import_paths(&[PathBuf::from("/m/library.mov")]).await[0];
        let a = s.import_blob("a.mov", b"aaaa").await.unwrap();
        let b = s.import_blob("b.mov", b"bbbb").await.unwrap();
        let staged_a = s.store().source(a).await.unwrap().path;

        let summary = s.delete_sources(&[kept, a, b], &AutoApprove).await;

        assert_eq!(summary.delisted, vec![kept]);
        assert_eq!(summary.deleted.len(), 2);
        assert!(summary.failures.is_empty());
        assert!(s.store().sources().await.is_empty());
        assert!(!staged_a.exists());
        assert!(temp.path().join("trash").join("a.mov").exists());
    }

    #[tokio::test]
    async fn test_declined_delete_keeps_staged_files() {
        let temp = TempDir::new().unwrap();
        let s = session(temp.path());
        let a = s.import_blob("a.mov", b"aaaa").await.unwrap();

        let summary = s.delete_sources(&[a], &Decline).await;

        assert!(summary.declined);
        let source = s.store().source(a).await.unwrap();
        assert!(source.path.exists());
    }

    /// Moves nothing; refuses to release tokens.
    struct RefusingDeletes;

    #[async_trait]
    impl DeleteService for RefusingDeletes {
        async fn request_delete(&self, _path: &Path) -> Result<String, DeleteError> {
            Ok("token".to_string())
        }

        async fn confirm_delete(&self, _token: &str) -> Result<(), DeleteError> {
            Ok(())
        }

        async fn cancel_delete(&self, _token: &str) -> Result<(), DeleteError> {
            Err(DeleteError::Service("cancel refused".to_string()))
        }
    }

    #[tokio::test]
    async fn test_refused_cancel_marks_source_error() {
        let temp = TempDir::new().unwrap();
        let s = session(temp.path());
        let a = s.import_blob("a.mov", b"aaaa").await.unwrap();
        let s = s.with_delete_service(Arc::new(RefusingDeletes));

        let summary = s.delete_sources(&[a], &Decline).await;

        assert!(summary.declined);
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].id, a);
        let source = s.store().source(a).await.unwrap();
        assert_eq!(source.status, SourceStatus::Error);
        assert!(source.error_reason.unwrap().contains("cancel refused"));
    }

    #[tokio::test]
    async fn test_overlapping_imports_stay_importing() {
        let temp = TempDir::new().unwrap();
        let s = Arc::new(session(temp.path()));

        let slow = tokio::spawn({
            let s = s.clone();
            async move { s.import_paths(&[PathBuf::from("/m/slow.mov")]).await }
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        s.import_paths(&[PathBuf::from("/m/fast.mov")]).await;

        assert_eq!(s.store().phase().await, RunPhase::Importing);
        slow.await.unwrap();
        assert_eq!(s.store().phase().await, RunPhase::Idle);
    }

    #[tokio::test]
    async fn test_second_prepare_is_busy() {
        let temp = TempDir::new().unwrap();
        let s = session(temp.path());
        s.import_paths(&[PathBuf::from("/m/a.mov")]).await;
        let recipe = Recipe::PlainConvert(PlainConvertParams::default());

        let first = s.prepare(&recipe, Arc::new(AutoApprove)).await.unwrap();
        let err = s.prepare(&recipe, Arc::new(AutoApprove)).await.err();
        assert!(matches!(err, Some(SessionError::Busy)));
        assert!(matches!(s.clear().await, Err(SessionError::Busy)));

        let report = first.run().await;
        assert_eq!(report.outcome, RunOutcome::Completed);
        assert!(s.prepare(&recipe, Arc::new(AutoApprove)).await.is_ok());
    }

    #[tokio::test]
    async fn test_clear_resets_store() {
        let temp = TempDir::new().unwrap();
        let s = session(temp.path());
        s.import_paths(&[PathBuf::from("/m/a.mov")]).await;
        s.clear().await.unwrap();
        assert!(s.store().sources().await.is_empty());
        assert_eq!(s.store().phase().await, RunPhase::Idle);
    }
}
