//! Plain-convert recipe: one convert task per input file.

use super::presets::{copy_metadata, AudioMode, Codec};
use super::RecipeError;
use crate::request::{DestinationRule, EncodeRequest, NamingRule, OutputSpec, MAIN_LABEL};
use crate::task::{SourceFile, Task, TaskId, TaskKind};
use serde::{Deserialize, Serialize};

/// Parameters of the plain-convert recipe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlainConvertParams {
    pub codec: Codec,
    pub audio: AudioMode,
    pub destination: DestinationRule,
    pub extension: String,
}

impl Default for PlainConvertParams {
    fn default() -> Self {
        Self {
            codec: Codec::default(),
            audio: AudioMode::default(),
            destination: DestinationRule::SameAsSource,
            extension: "mp4".to_string(),
        }
    }
}

/// Build the request converting one file with the chosen presets.
///
/// Source metadata is always copied to the output.
pub fn convert_request(file: &SourceFile, params: &PlainConvertParams) -> EncodeRequest {
    let mut encoder_options = params.codec.video_options();
    encoder_options.extend(params.audio.options());
    encoder_options.extend(copy_metadata());

    EncodeRequest::single(file.path.clone()).with_output(OutputSpec {
        label: MAIN_LABEL.to_string(),
        destination: params.destination.clone(),
        naming: NamingRule::AutoSuffix(params.codec.suffix()),
        extension: params.extension.clone(),
        encoder_options,
    })
}

pub fn compile(files: &[SourceFile], params: &PlainConvertParams) -> Result<Vec<Task>, RecipeError> {
    if files.is_empty() {
        return Err(RecipeError::NoInputs);
    }

    Ok(files
        .iter()
        .map(|file| {
            let kind = TaskKind::Convert {
                source: file.path.clone(),
                request: convert_request(file, params),
            };
            Task::new(TaskId::new(), kind, file.file_name())
                .with_media(file.size, file.duration)
                .with_temp(file.is_temp)
        })
        .collect())
}
