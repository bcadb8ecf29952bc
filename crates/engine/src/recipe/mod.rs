//! Recipe compiler: file set + parameters -> ordered task list.
//!
//! Compilation is pure. Encode tasks come first in execution order, a concat
//! task only references producers listed before it, and trash tasks trail
//! everything else.

pub mod dual_timescale;
pub mod plain;
pub mod presets;

pub use dual_timescale::{speed_factor, DualTimescaleParams};
pub use plain::PlainConvertParams;
pub use presets::{AudioMode, Codec};

use crate::task::{SourceFile, Task};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecipeError {
    #[error("Recipe needs at least one input file")]
    NoInputs,

    #[error("Target duration must be positive, got {0}")]
    InvalidTarget(f64),
}

/// A recipe with its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "recipe", rename_all = "snake_case")]
pub enum Recipe {
    PlainConvert(PlainConvertParams),
    DualTimescale(DualTimescaleParams),
}

impl Recipe {
    pub fn name(&self) -> &'static str {
        match self {
            Recipe::PlainConvert(_) => "plain_convert",
            Recipe::DualTimescale(_) => "dual_timescale",
        }
    }

    pub fn compile(&self, files: &[SourceFile]) -> Result<Vec<Task>, RecipeError> {
        match self {
            Recipe::PlainConvert(params) => plain::compile(files, params),
            Recipe::DualTimescale(params) => dual_timescale::compile(files, params),
        }
    }
}
