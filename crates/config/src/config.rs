//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Error type for configuration operations
#[derive(Debug, Error)]
pub enum ConfigError {
    /// IO error reading config file
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    /// TOML parsing error
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Storage locations used for output placement, imports and staged deletion.
///
/// Every entry is optional; the engine resolves unset entries against the
/// user's home and the OS temp directory.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct StorageConfig {
    /// Destination for the `video-library` rule
    pub video_dir: Option<PathBuf>,
    /// Destination for the `download` rule
    pub downloads_dir: Option<PathBuf>,
    /// Destination for the `temp` rule (intermediate artifacts)
    pub temp_dir: Option<PathBuf>,
    /// Where chunked uploads are reassembled
    pub imports_dir: Option<PathBuf>,
    /// Where confirmed deletions are moved to
    pub trash_dir: Option<PathBuf>,
}

/// External encoder configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncoderConfig {
    /// ffmpeg program name or path
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg: String,
    /// ffprobe program name or path
    #[serde(default = "default_ffprobe")]
    pub ffprobe: String,
    /// Skip the startup tool checks
    #[serde(default)]
    pub skip_checks: bool,
}

fn default_ffmpeg() -> String {
    "ffmpeg".to_string()
}

fn default_ffprobe() -> String {
    "ffprobe".to_string()
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg: default_ffmpeg(),
            ffprobe: default_ffprobe(),
            skip_checks: false,
        }
    }
}

/// Chunked transfer bounds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransferConfig {
    /// Lower bound of a chunk (default 2 MiB)
    #[serde(default = "default_min_chunk_bytes")]
    pub min_chunk_bytes: u64,
    /// Upper bound of a chunk (default 128 MiB)
    #[serde(default = "default_max_chunk_bytes")]
    pub max_chunk_bytes: u64,
    /// A file is split into roughly this many chunks (default 10)
    #[serde(default = "default_chunk_divisor")]
    pub chunk_divisor: u64,
}

fn default_min_chunk_bytes() -> u64 {
    2 * 1024 * 1024
}

fn default_max_chunk_bytes() -> u64 {
    128 * 1024 * 1024
}

fn default_chunk_divisor() -> u64 {
    10
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            min_chunk_bytes: default_min_chunk_bytes(),
            max_chunk_bytes: default_max_chunk_bytes(),
            chunk_divisor: default_chunk_divisor(),
        }
    }
}

/// Log window configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogConfig {
    /// Number of trailing log lines retained for display
    #[serde(default = "default_log_window")]
    pub window: usize,
}

fn default_log_window() -> usize {
    100
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            window: default_log_window(),
        }
    }
}

/// Defaults for the recipe parameters when the command line omits them
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecipeConfig {
    /// `hevc` or `av1`
    #[serde(default = "default_codec")]
    pub codec: String,
    /// `copy` or `none`
    #[serde(default = "default_audio")]
    pub audio: String,
    /// Target length of the digest produced by the dual-timescale recipe
    #[serde(default = "default_digest_target_secs")]
    pub digest_target_secs: f64,
}

fn default_codec() -> String {
    "hevc".to_string()
}

fn default_audio() -> String {
    "copy".to_string()
}

fn default_digest_target_secs() -> f64 {
    60.0
}

impl Default for RecipeConfig {
    fn default() -> Self {
        Self {
            codec: default_codec(),
            audio: default_audio(),
            digest_target_secs: default_digest_target_secs(),
        }
    }
}

/// Metrics endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsConfig {
    /// Serve `/metrics` while a run is active
    #[serde(default)]
    pub enabled: bool,
    /// Bind address of the metrics endpoint
    #[serde(default = "default_metrics_bind")]
    pub bind: String,
}

fn default_metrics_bind() -> String {
    "127.0.0.1:7879".to_string()
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: default_metrics_bind(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub recipes: RecipeConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - OPTIMUX_FFMPEG -> encoder.ffmpeg
    /// - OPTIMUX_FFPROBE -> encoder.ffprobe
    /// - OPTIMUX_TEMP_DIR -> storage.temp_dir
    /// - OPTIMUX_VIDEO_DIR -> storage.video_dir
    /// - OPTIMUX_LOG_WINDOW -> log.window
    /// - OPTIMUX_METRICS_BIND -> metrics.bind
    /// - OPTIMUX_METRICS_ENABLED -> metrics.enabled
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("OPTIMUX_FFMPEG") {
            if !val.trim().is_empty() {
                self.encoder.ffmpeg = val;
            }
        }

        if let Ok(val) = env::var("OPTIMUX_FFPROBE") {
            if !val.trim().is_empty() {
                self.encoder.ffprobe = val;
            }
        }

        if let Ok(val) = env::var("OPTIMUX_TEMP_DIR") {
            if !val.trim().is_empty() {
                self.storage.temp_dir = Some(PathBuf::from(val));
            }
        }

        if let Ok(val) = env::var("OPTIMUX_VIDEO_DIR") {
            if !val.trim().is_empty() {
                self.storage.video_dir = Some(PathBuf::from(val));
            }
        }

        if let Ok(val) = env::var("OPTIMUX_LOG_WINDOW") {
            if let Ok(window) = val.parse::<usize>() {
                self.log.window = window;
            }
        }

        if let Ok(val) = env::var("OPTIMUX_METRICS_BIND") {
            if !val.trim().is_empty() {
                self.metrics.bind = val;
            }
        }

        if let Ok(val) = env::var("OPTIMUX_METRICS_ENABLED") {
            // Accept "true", "1", "yes" as true; "false", "0", "no" as false
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" => self.metrics.enabled = true,
                "false" | "0" | "no" => self.metrics.enabled = false,
                _ => {} // Invalid value, keep existing
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Defaults plus environment overrides, for runs without a config file
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }
}
