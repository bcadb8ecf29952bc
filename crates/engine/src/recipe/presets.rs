//! Encoder option presets.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Video codec preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Codec {
    /// x265, CRF 23, tagged `hvc1` for Apple players.
    #[default]
    Hevc,
    /// SVT-AV1, CRF 32, preset 8.
    Av1,
}

impl Codec {
    /// `-c:v ...` and rate-control arguments for this codec.
    pub fn video_options(self) -> Vec<String> {
        let args: &[&str] = match self {
            Codec::Hevc => &[
                "-c:v", "libx265", "-crf", "23", "-tag:v", "hvc1", "-preset", "medium",
            ],
            Codec::Av1 => &["-c:v", "libsvtav1", "-crf", "32", "-preset", "8"],
        };
        to_args(args)
    }

    /// Name suffix used for auto-named outputs, e.g. `_hevc`.
    pub fn suffix(self) -> String {
        format!("_{}", self)
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Codec::Hevc => write!(f, "hevc"),
            Codec::Av1 => write!(f, "av1"),
        }
    }
}

impl FromStr for Codec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hevc" | "h265" | "x265" => Ok(Codec::Hevc),
            "av1" | "svt-av1" => Ok(Codec::Av1),
            other => Err(format!("unknown codec '{}', expected hevc or av1", other)),
        }
    }
}

/// What happens to the audio track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AudioMode {
    #[default]
    Copy,
    Drop,
}

impl AudioMode {
    pub fn options(self) -> Vec<String> {
        match self {
            AudioMode::Copy => to_args(&["-c:a", "copy"]),
            AudioMode::Drop => to_args(&["-an"]),
        }
    }
}

impl fmt::Display for AudioMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AudioMode::Copy => write!(f, "copy"),
            AudioMode::Drop => write!(f, "none"),
        }
    }
}

impl FromStr for AudioMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "copy" => Ok(AudioMode::Copy),
            "none" | "drop" | "remove" => Ok(AudioMode::Drop),
            other => Err(format!("unknown audio mode '{}', expected copy or none", other)),
        }
    }
}

/// Copy container and stream metadata from the first input.
pub fn copy_metadata() -> Vec<String> {
    to_args(&["-map_metadata", "0"])
}

/// Copy container metadata plus the video stream's own metadata.
pub fn copy_video_metadata() -> Vec<String> {
    to_args(&["-map_metadata", "0", "-map_metadata:s:v", "0:s:v"])
}

pub(crate) fn to_args(args: &[&str]) -> Vec<String> {
    args.iter().map(|a| a.to_string()).collect()
}
