//! Encoding modules for OptiMux

pub mod ffmpeg;

pub use ffmpeg::{build_ffmpeg_command, FfmpegRunner, LineSplitter, ProgressParser};

use crate::events::EventSink;
use crate::request::{EncodeRequest, EncodeResult};
use async_trait::async_trait;
use std::path::PathBuf;
use thiserror::Error;

/// Error type for encoding operations
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The request cannot be executed as given.
    #[error("Invalid encode request: {0}")]
    InvalidRequest(String),

    /// Encoder exited with non-zero status
    #[error("ffmpeg failed with exit code {code}: {detail}")]
    Failed { code: i32, detail: String },

    /// Encoder was terminated by signal
    #[error("ffmpeg was terminated by signal")]
    Terminated,

    /// Encoder reported success but an output is missing.
    #[error("Output not found after encoding: {0}")]
    MissingOutput(PathBuf),

    /// IO error during encoding
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Executes one encode request.
///
/// Dropping the returned future must stop the underlying process.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(&self, request: &EncodeRequest, events: EventSink)
        -> Result<EncodeResult, ProcessError>;
}
