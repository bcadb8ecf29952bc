//! Media analysis through ffprobe.

use crate::task::MediaInfo;
use async_trait::async_trait;
use std::path::Path;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Error)]
pub enum AnalysisError {
    /// ffprobe ran but rejected the file.
    #[error("ffprobe failed: {0}")]
    ProbeFailed(String),

    #[error("Failed to parse ffprobe output: {0}")]
    Parse(String),

    #[error("Not a media file: {0}")]
    Unsupported(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Inspects a file and reports its media properties.
#[async_trait]
pub trait MediaAnalyzer: Send + Sync {
    async fn analyze(&self, path: &Path) -> Result<MediaInfo, AnalysisError>;
}

/// Raw ffprobe JSON structures for parsing.
mod ffprobe_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub streams: Option<Vec<Stream>>,
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub codec_type: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub duration: Option<String>,
        pub size: Option<String>,
    }
}

/// Stream presence and duration from ffprobe output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeSummary {
    pub has_video: bool,
    pub has_audio: bool,
    pub duration: f64,
    /// Size as reported by the container, when present.
    pub size: Option<u64>,
}

/// Parses `ffprobe -show_streams -show_format -of json` output.
pub fn parse_ffprobe_output(json_str: &str) -> Result<ProbeSummary, AnalysisError> {
    let probe: ffprobe_json::FfprobeOutput =
        serde_json::from_str(json_str).map_err(|e| AnalysisError::Parse(e.to_string()))?;

    let streams = probe.streams.unwrap_or_default();
    let has_stream = |kind: &str| streams.iter().any(|s| s.codec_type.as_deref() == Some(kind));
    let has_video = has_stream("video");
    let has_audio = has_stream("audio");

    let format = probe.format;
    let duration = format
        .as_ref()
        .and_then(|f| f.duration.as_deref())
        .and_then(|d| d.parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d >= 0.0)
        .unwrap_or(0.0);
    let size = format
        .as_ref()
        .and_then(|f| f.size.as_deref())
        .and_then(|s| s.parse::<u64>().ok());

    Ok(ProbeSummary {
        has_video,
        has_audio,
        duration,
        size,
    })
}

/// Analyzer backed by the `ffprobe` binary.
#[derive(Debug, Clone)]
pub struct FfprobeAnalyzer {
    program: String,
}

impl Default for FfprobeAnalyzer {
    fn default() -> Self {
        Self::new("ffprobe")
    }
}

impl FfprobeAnalyzer {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl MediaAnalyzer for FfprobeAnalyzer {
    async fn analyze(&self, path: &Path) -> Result<MediaInfo, AnalysisError> {
        let meta = tokio::fs::metadata(path).await?;
        if !meta.is_file() {
            return Err(AnalysisError::Unsupported(path.display().to_string()));
        }

        let output = Command::new(&self.program)
            .args(["-v", "error", "-show_streams", "-show_format", "-of", "json"])
            .arg(path)
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AnalysisError::ProbeFailed(format!(
                "exit status {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let summary = parse_ffprobe_output(&String::from_utf8_lossy(&output.stdout))?;
        if !summary.has_video && !summary.has_audio {
            return Err(AnalysisError::Unsupported(path.display().to_string()));
        }
        debug!(
            path = %path.display(),
            duration = summary.duration,
            has_video = summary.has_video,
            has_audio = summary.has_audio,
            "Analyzed"
        );

        Ok(MediaInfo {
            path: path.to_path_buf(),
            size: meta.len(),
            has_video: summary.has_video,
            has_audio: summary.has_audio,
            duration: summary.duration,
        })
    }
}
