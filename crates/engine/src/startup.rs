//! Startup checks module for OptiMux
//!
//! Verifies that the external tools the engine drives are runnable before any
//! file is imported.

use crate::config::Config;
use std::process::Command;
use thiserror::Error;
use tracing::{info, warn};

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("{tool} not available: {reason}")]
    ToolUnavailable { tool: String, reason: String },
}

/// Major versions reported by the external tools, when parseable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ToolVersions {
    pub ffmpeg: Option<u32>,
    pub ffprobe: Option<u32>,
}

/// Extract the major version from `<tool> -version` output.
///
/// Handles standard (`ffmpeg version 7.1.2`) and n-prefixed git builds
/// (`ffmpeg version n8.0-123-gabcdef`).
pub fn parse_tool_version(version_output: &str, tool: &str) -> Option<u32> {
    let marker = format!("{} version", tool.to_lowercase());
    let version_line = version_output
        .lines()
        .map(|line| line.to_lowercase())
        .find(|line| line.contains(&marker))?;

    let version_part = version_line
        .split(&marker)
        .nth(1)?
        .split_whitespace()
        .next()?
        .to_string();

    let version_str = version_part.trim_start_matches('n');
    let major_str = version_str.split(|c| c == '.' || c == '-').next()?;

    major_str.parse().ok()
}

/// Parse FFmpeg version string and extract major version number
pub fn parse_ffmpeg_version(version_output: &str) -> Option<u32> {
    parse_tool_version(version_output, "ffmpeg")
}

/// Run `<program> -version` and return the parsed major version.
///
/// `tool` names the binary in messages and in the version banner, `program`
/// is what gets executed (it may be a full path).
pub fn check_tool(program: &str, tool: &str) -> Result<Option<u32>, StartupError> {
    let output = Command::new(program)
        .arg("-version")
        .output()
        .map_err(|e| StartupError::ToolUnavailable {
            tool: tool.to_string(),
            reason: format!("{} -version failed; is it installed and in PATH? Error: {}", program, e),
        })?;

    if !output.status.success() {
        return Err(StartupError::ToolUnavailable {
            tool: tool.to_string(),
            reason: format!("{} -version exited with {}", program, output.status),
        });
    }

    let version_output = String::from_utf8_lossy(&output.stdout);
    let major = parse_tool_version(&version_output, tool);
    match major {
        Some(major) => info!(tool, major, "Found"),
        None => warn!(
            tool,
            banner = version_output.lines().next().unwrap_or("(empty)"),
            "Could not parse version"
        ),
    }
    Ok(major)
}

/// Run all startup checks in order: ffmpeg, then ffprobe.
pub fn run_startup_checks(cfg: &Config) -> Result<ToolVersions, StartupError> {
    let ffmpeg = check_tool(&cfg.encoder.ffmpeg, "ffmpeg")?;
    let ffprobe = check_tool(&cfg.encoder.ffprobe, "ffprobe")?;
    Ok(ToolVersions { ffmpeg, ffprobe })
}
