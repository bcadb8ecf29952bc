//! OptiMux engine
//!
//! Batch transcode orchestration: imports media files, compiles recipes into
//! task lists, runs them through ffmpeg one at a time and reports live metrics.

pub mod analyzer;
pub mod delete;
pub mod encode;
pub mod events;
pub mod metrics;
pub mod metrics_server;
pub mod orchestrator;
pub mod placement;
pub mod recipe;
pub mod request;
pub mod scan;
pub mod session;
pub mod startup;
pub mod store;
pub mod task;
pub mod transfer;

pub use optimux_config as config;
pub use optimux_config::Config;
pub use analyzer::{AnalysisError, FfprobeAnalyzer, MediaAnalyzer};
pub use delete::{
    AutoApprove, Decline, DeleteApproval, DeleteError, DeleteProtocol, DeleteService,
    LocalDeleteService, PendingDeletes,
};
pub use encode::{FfmpegRunner, ProcessError, ProcessRunner};
pub use events::{EngineEvent, EventSink};
pub use metrics::{compute_metrics, JobMetrics, MetricRow};
pub use metrics_server::{create_metrics_router, run_metrics_server, ServerError};
pub use orchestrator::{CancelHandle, Orchestrator, RunOutcome, RunReport, TaskError};
pub use placement::StorageDirs;
pub use recipe::{AudioMode, Codec, DualTimescaleParams, PlainConvertParams, Recipe, RecipeError};
pub use request::{EncodeRequest, EncodeResult, OutputSpec};
pub use scan::collect_media;
pub use session::{Session, SessionError, SourceDeleteSummary};
pub use startup::{parse_ffmpeg_version, run_startup_checks, StartupError};
pub use store::{JobStore, RunPhase};
pub use task::{SourceFile, SourceStatus, Task, TaskId, TaskKind, TaskStatus};
pub use transfer::{ChunkPolicy, ChunkSink, LocalChunkSink, TransferError};
