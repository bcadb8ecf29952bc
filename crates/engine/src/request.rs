//! Request/response contract with the external process runner.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Label of the primary output of a request.
pub const MAIN_LABEL: &str = "main";
/// Label of an intermediate output consumed by a later concat task.
pub const TEMP_CHUNK_LABEL: &str = "temp_chunk";

/// How the listed input paths are fed to the encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputMode {
    /// Each path is an independent input.
    Single,
    /// The paths are joined back to back into one input stream.
    Concat,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSpec {
    pub mode: InputMode,
    pub paths: Vec<PathBuf>,
}

/// Where an output file is placed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", content = "path", rename_all = "kebab-case")]
pub enum DestinationRule {
    /// Next to the (first) input file.
    SameAsSource,
    /// The user's video library folder.
    VideoLibrary,
    /// The user's downloads folder.
    Download,
    /// Intermediate storage, eligible for cleanup.
    Temp,
    /// An explicit directory; relative paths are taken from the source directory.
    Path(PathBuf),
}

/// How an output file is named.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", content = "value", rename_all = "kebab-case")]
pub enum NamingRule {
    /// Source file stem followed by the suffix, e.g. `clip` + `_hevc`.
    AutoSuffix(String),
    /// Exactly this stem.
    FixedName(String),
    /// A freshly generated unique stem.
    GeneratedId,
}

/// One output of an encode request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSpec {
    pub label: String,
    pub destination: DestinationRule,
    pub naming: NamingRule,
    /// Extension without the leading dot.
    pub extension: String,
    /// Encoder arguments applied to this output.
    pub encoder_options: Vec<String>,
}

/// What to submit to the process runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodeRequest {
    pub input: InputSpec,
    /// Arguments placed after the inputs and before any output.
    pub global_options: Vec<String>,
    pub outputs: Vec<OutputSpec>,
}

impl EncodeRequest {
    /// A request reading one file.
    pub fn single(path: impl Into<PathBuf>) -> Self {
        Self {
            input: InputSpec {
                mode: InputMode::Single,
                paths: vec![path.into()],
            },
            global_options: Vec::new(),
            outputs: Vec::new(),
        }
    }

    /// A concat request whose inputs are filled in at execution time.
    pub fn concat() -> Self {
        Self {
            input: InputSpec {
                mode: InputMode::Concat,
                paths: Vec::new(),
            },
            global_options: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn with_global_options<I, S>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.global_options.extend(options.into_iter().map(Into::into));
        self
    }

    pub fn with_output(mut self, output: OutputSpec) -> Self {
        self.outputs.push(output);
        self
    }

    /// Copy of the request reading `paths` instead of its own inputs.
    pub fn with_inputs(&self, paths: Vec<PathBuf>) -> Self {
        let mut resolved = self.clone();
        resolved.input.paths = paths;
        resolved
    }

    pub fn output(&self, label: &str) -> Option<&OutputSpec> {
        self.outputs.iter().find(|o| o.label == label)
    }
}

/// One file produced by a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputArtifact {
    pub label: String,
    pub path: PathBuf,
    pub size: u64,
}

/// What the process runner reports back.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EncodeResult {
    pub outputs: Vec<OutputArtifact>,
}

impl EncodeResult {
    pub fn output(&self, label: &str) -> Option<&OutputArtifact> {
        self.outputs.iter().find(|o| o.label == label)
    }

    /// Path a downstream concat should read: the temp chunk if there is one,
    /// otherwise the main output.
    pub fn chunk_path(&self) -> Option<&Path> {
        self.output(TEMP_CHUNK_LABEL)
            .or_else(|| self.output(MAIN_LABEL))
            .map(|o| o.path.as_path())
    }

    /// Size of the main output, 0 when absent.
    pub fn main_size(&self) -> u64 {
        self.output(MAIN_LABEL).map(|o| o.size).unwrap_or(0)
    }
}
