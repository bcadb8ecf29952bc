//! Dual-timescale digest recipe.
//!
//! Every input is encoded once into two branches: a fixed 60x timelapse kept
//! in the video library, and a rotated chunk compressed by a shared speed
//! factor so that all chunks together last about `target_duration_secs`.
//! A trailing concat task stitches the chunks into one digest file.

use super::presets::{copy_video_metadata, to_args};
use super::RecipeError;
use crate::request::{
    DestinationRule, EncodeRequest, NamingRule, OutputSpec, MAIN_LABEL, TEMP_CHUNK_LABEL,
};
use crate::task::{SourceFile, Task, TaskId, TaskKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Time compression of the per-file timelapse output.
pub const MAIN_TIME_SCALE: f64 = 60.0;
/// Frame rate both branches are re-clocked to.
const OUTPUT_FPS: u32 = 60;

/// Parameters of the dual-timescale recipe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DualTimescaleParams {
    /// Desired length of the merged digest, in seconds.
    pub target_duration_secs: f64,
    /// Append one trash task per original input.
    pub trash_originals: bool,
    /// Timestamp the digest file is named after.
    pub digest_stamp: DateTime<Utc>,
}

/// `max(1, total / target)`; 1 when there is nothing to compress.
pub fn speed_factor(total_duration: f64, target_duration: f64) -> f64 {
    if total_duration > 0.0 && target_duration > 0.0 {
        (total_duration / target_duration).max(1.0)
    } else {
        1.0
    }
}

/// Filter graph splitting `[0:v]` into `[v_main]` and `[v_temp]`.
pub fn filter_graph(speed: f64) -> String {
    format!(
        "[0:v]split=2[v_in1][v_in2];\
         [v_in1]setpts=PTS/{main},fps={fps}[v_main];\
         [v_in2]setpts=PTS/{speed},fps={fps},transpose=1[v_temp]",
        main = MAIN_TIME_SCALE,
        speed = speed,
        fps = OUTPUT_FPS,
    )
}

/// Stem of the digest file, e.g. `Digest_2024-05-01_10-00-00`.
pub fn digest_name(stamp: &DateTime<Utc>) -> String {
    format!("Digest_{}", stamp.format("%Y-%m-%d_%H-%M-%S"))
}

fn branch_options(stream: &str, codec: &[&str]) -> Vec<String> {
    let mut options = to_args(&["-map", stream]);
    options.extend(to_args(codec));
    options.extend(copy_video_metadata());
    options.push("-an".to_string());
    options
}

fn split_request(file: &SourceFile, speed: f64) -> EncodeRequest {
    EncodeRequest::single(file.path.clone())
        .with_global_options(["-filter_complex".to_string(), filter_graph(speed)])
        .with_output(OutputSpec {
            label: MAIN_LABEL.to_string(),
            destination: DestinationRule::VideoLibrary,
            naming: NamingRule::AutoSuffix("_60x".to_string()),
            extension: "mp4".to_string(),
            encoder_options: branch_options("[v_main]", &["-c:v", "libsvtav1"]),
        })
        .with_output(OutputSpec {
            label: TEMP_CHUNK_LABEL.to_string(),
            destination: DestinationRule::Temp,
            naming: NamingRule::GeneratedId,
            extension: "mov".to_string(),
            encoder_options: branch_options(
                "[v_temp]",
                &["-c:v", "libx265", "-crf", "23", "-tag:v", "hvc1"],
            ),
        })
}

fn merge_request(params: &DualTimescaleParams) -> EncodeRequest {
    EncodeRequest::concat().with_output(OutputSpec {
        label: MAIN_LABEL.to_string(),
        destination: DestinationRule::VideoLibrary,
        naming: NamingRule::FixedName(digest_name(&params.digest_stamp)),
        extension: "mov".to_string(),
        encoder_options: to_args(&["-c", "copy", "-an"]),
    })
}

pub fn compile(files: &[SourceFile], params: &DualTimescaleParams) -> Result<Vec<Task>, RecipeError> {
    if files.is_empty() {
        return Err(RecipeError::NoInputs);
    }
    if !(params.target_duration_secs > 0.0) {
        return Err(RecipeError::InvalidTarget(params.target_duration_secs));
    }

    let total: f64 = files.iter().map(|f| f.duration).sum();
    let speed = speed_factor(total, params.target_duration_secs);
    debug!(
        total_secs = total,
        target_secs = params.target_duration_secs,
        speed_factor = speed,
        "Planned dual-timescale digest"
    );

    let mut tasks = Vec::with_capacity(files.len() * 2 + 1);
    let mut producers = Vec::with_capacity(files.len());

    for file in files {
        let id = TaskId::new();
        producers.push(id);
        let kind = TaskKind::Convert {
            source: file.path.clone(),
            request: split_request(file, speed),
        };
        tasks.push(
            Task::new(id, kind, file.file_name())
                .with_media(file.size, file.duration)
                .with_temp(file.is_temp)
                .with_time_scale(MAIN_TIME_SCALE),
        );
    }

    let merge = TaskKind::Concat {
        request: merge_request(params),
        dependency_refs: producers,
    };
    tasks.push(
        Task::new(TaskId::new(), merge, format!("Merging {} clips", files.len()))
            .with_media(0, params.target_duration_secs),
    );

    if params.trash_originals {
        for file in files {
            let kind = TaskKind::Trash {
                path: file.path.clone(),
            };
            tasks.push(Task::new(TaskId::new(), kind, file.file_name()).with_media(file.size, 0.0));
        }
    }

    Ok(tasks)
}
