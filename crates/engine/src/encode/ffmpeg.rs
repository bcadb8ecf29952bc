//! ffmpeg process runner
//!
//! Builds the ffmpeg command line for an [`EncodeRequest`], streams
//! `-progress pipe:1` output back as progress events and stderr as log
//! lines, and reports the produced files.

use super::{ProcessError, ProcessRunner};
use crate::events::EventSink;
use crate::placement::{resolve_output_path, StorageDirs};
use crate::request::{EncodeRequest, EncodeResult, InputMode, OutputArtifact};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// stderr lines kept for the error message of a failed run.
const STDERR_TAIL: usize = 8;

/// One output with its resolved path.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedOutput {
    pub label: String,
    pub path: PathBuf,
}

/// Build the ffmpeg command for `request`.
///
/// `outputs` must hold one path per requested output, in order. `concat_list` is
/// the list file read by the concat demuxer and is required for concat
/// requests.
pub fn build_ffmpeg_command(
    program: &str,
    request: &EncodeRequest,
    outputs: &[PlannedOutput],
    concat_list: Option<&Path>,
) -> Command {
    let mut cmd = Command::new(program);
    cmd.arg("-y").arg("-hide_banner");

    match (request.input.mode, concat_list) {
        (InputMode::Concat, Some(list)) => {
            cmd.args(["-f", "concat", "-safe", "0", "-i"]).arg(list);
        }
        _ => {
            for path in &request.input.paths {
                cmd.arg("-i").arg(path);
            }
        }
    }

    cmd.args(&request.global_options);

    for (spec, planned) in request.outputs.iter().zip(outputs) {
        cmd.args(&spec.encoder_options);
        cmd.arg(&planned.path);
    }

    cmd.args(["-progress", "pipe:1", "-nostats"]);
    cmd
}

/// Contents of a concat demuxer list file.
pub fn concat_list_contents(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| format!("file '{}'\n", p.to_string_lossy().replace('\'', "'\\''")))
        .collect()
}

/// Accumulates `key=value` lines from `-progress` output.
#[derive(Debug, Default, Clone)]
pub struct ProgressParser {
    time_sec: f64,
    size: u64,
}

impl ProgressParser {
    /// Feed one line; returns `(time_sec, size)` when a progress block ends.
    pub fn feed(&mut self, line: &str) -> Option<(f64, u64)> {
        let (key, value) = line.split_once('=')?;
        let value = value.trim();
        match key.trim() {
            "total_size" => {
                if let Ok(size) = value.parse::<u64>() {
                    self.size = size;
                }
            }
            "out_time_us" => {
                if let Ok(us) = value.parse::<f64>() {
                    if us >= 0.0 {
                        self.time_sec = us / 1_000_000.0;
                    }
                }
            }
            "progress" if value == "continue" || value == "end" => {
                return Some((self.time_sec, self.size));
            }
            _ => {}
        }
        None
    }
}

/// Splits a byte stream into lines on `\r` or `\n`.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    /// Append bytes and return every completed non-blank line.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &b in bytes {
            if b == b'\r' || b == b'\n' {
                let line = std::mem::take(&mut self.pending);
                if let Some(line) = non_blank(&line) {
                    lines.push(line);
                }
            } else {
                self.pending.push(b);
            }
        }
        lines
    }

    /// Whatever is left once the stream ends.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        non_blank(&rest)
    }
}

fn non_blank(bytes: &[u8]) -> Option<String> {
    let line = String::from_utf8_lossy(bytes);
    if line.trim().is_empty() {
        None
    } else {
        Some(line.into_owned())
    }
}

async fn pump_progress<R: AsyncRead + Unpin>(stdout: R, events: &EventSink) {
    let mut parser = ProgressParser::default();
    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if let Some((time_sec, size)) = parser.feed(&line) {
            events.progress(time_sec, size);
        }
    }
}

async fn pump_log<R: AsyncRead + Unpin>(mut stderr: R, events: &EventSink) -> VecDeque<String> {
    let mut splitter = LineSplitter::default();
    let mut tail = VecDeque::with_capacity(STDERR_TAIL);
    let mut buf = [0u8; 4096];

    let keep = |line: String, tail: &mut VecDeque<String>| {
        events.log(line.clone());
        if tail.len() == STDERR_TAIL {
            tail.pop_front();
        }
        tail.push_back(line);
    };

    loop {
        match stderr.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                for line in splitter.push(&buf[..n]) {
                    keep(line, &mut tail);
                }
            }
        }
    }
    if let Some(line) = splitter.finish() {
        keep(line, &mut tail);
    }
    tail
}

/// Process runner backed by the `ffmpeg` binary.
#[derive(Debug, Clone)]
pub struct FfmpegRunner {
    program: String,
    dirs: StorageDirs,
}

impl FfmpegRunner {
    pub fn new(program: impl Into<String>, dirs: StorageDirs) -> Self {
        Self {
            program: program.into(),
            dirs,
        }
    }

    /// Resolve every output path of `request`.
    pub fn plan_outputs(&self, request: &EncodeRequest) -> Vec<PlannedOutput> {
        let source = request.input.paths.first().map(PathBuf::as_path);
        request
            .outputs
            .iter()
            .map(|spec| PlannedOutput {
                label: spec.label.clone(),
                path: resolve_output_path(spec, source, &self.dirs),
            })
            .collect()
    }

    async fn write_concat_list(&self, paths: &[PathBuf]) -> Result<PathBuf, ProcessError> {
        fs::create_dir_all(&self.dirs.temp_dir).await?;
        let list = self
            .dirs
            .temp_dir
            .join(format!("concat-{}.txt", Uuid::new_v4()));
        fs::write(&list, concat_list_contents(paths)).await?;
        Ok(list)
    }

    async fn execute(
        &self,
        request: &EncodeRequest,
        outputs: &[PlannedOutput],
        concat_list: Option<&Path>,
        events: &EventSink,
    ) -> Result<(), ProcessError> {
        let mut std_cmd = build_ffmpeg_command(&self.program, request, outputs, concat_list);
        std_cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut cmd = tokio::process::Command::from(std_cmd);
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn()?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let progress = async {
            if let Some(out) = stdout {
                pump_progress(out, events).await;
            }
        };
        let log = async {
            match stderr {
                Some(err) => pump_log(err, events).await,
                None => VecDeque::new(),
            }
        };

        let ((), tail, status) = tokio::join!(progress, log, child.wait());
        let status = status?;

        if status.success() {
            return Ok(());
        }
        match status.code() {
            Some(code) => Err(ProcessError::Failed {
                code,
                detail: tail.into_iter().collect::<Vec<_>>().join(" | "),
            }),
            None => Err(ProcessError::Terminated),
        }
    }
}

#[async_trait]
impl ProcessRunner for FfmpegRunner {
    async fn run(
        &self,
        request: &EncodeRequest,
        events: EventSink,
    ) -> Result<EncodeResult, ProcessError> {
        if request.input.paths.is_empty() {
            return Err(ProcessError::InvalidRequest("no input paths".to_string()));
        }
        if request.outputs.is_empty() {
            return Err(ProcessError::InvalidRequest("no outputs".to_string()));
        }

        let outputs = self.plan_outputs(request);
        for planned in &outputs {
            if let Some(parent) = planned.path.parent() {
                fs::create_dir_all(parent).await?;
            }
        }

        let concat_list = match request.input.mode {
            InputMode::Concat => Some(self.write_concat_list(&request.input.paths).await?),
            InputMode::Single => None,
        };

        info!(
            task_id = %events.task_id(),
            inputs = request.input.paths.len(),
            outputs = outputs.len(),
            "Starting ffmpeg"
        );
        let result = self
            .execute(request, &outputs, concat_list.as_deref(), &events)
            .await;

        if let Some(list) = &concat_list {
            if let Err(e) = fs::remove_file(list).await {
                warn!(path = %list.display(), error = %e, "Failed to remove concat list");
            }
        }
        result?;

        let mut artifacts = Vec::with_capacity(outputs.len());
        for planned in outputs {
            let meta = fs::metadata(&planned.path)
                .await
                .map_err(|_| ProcessError::MissingOutput(planned.path.clone()))?;
            debug!(label = %planned.label, path = %planned.path.display(), size = meta.len(), "Output ready");
            artifacts.push(OutputArtifact {
                label: planned.label,
                path: planned.path,
                size: meta.len(),
            });
        }

        Ok(EncodeResult { outputs: artifacts })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{DestinationRule, NamingRule, OutputSpec, MAIN_LABEL, TEMP_CHUNK_LABEL};

    /// Helper to extract args from a Command as strings
    fn get_args(cmd: &Command) -> Vec<String> {
        cmd.get_args()
            .map(|s| s.to_string_lossy().to_string())
            .collect()
    }

    /// Helper to check if args contain a flag with a specific value
    fn has_flag_with_value(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|pair| pair[0] == flag && pair[1] == value)
    }

    fn output(label: &str, options: &[&str]) -> OutputSpec {
        OutputSpec {
            label: label.to_string(),
            destination: DestinationRule::SameAsSource,
            naming: NamingRule::AutoSuffix("_x".to_string()),
            extension: "mp4".to_string(),
            encoder_options: options.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn planned(label: &str, path: &str) -> PlannedOutput {
        PlannedOutput {
            label: label.to_string(),
            path: PathBuf::from(path),
        }
    }

    #[test]
    fn test_single_input_command_order() {
        let request = EncodeRequest::single("/media/in.mov")
            .with_global_options(["-filter_complex", "[0:v]split=2[a][b]"])
            .with_output(output(MAIN_LABEL, &["-map", "[a]", "-c:v", "libsvtav1"]))
            .with_output(output(TEMP_CHUNK_LABEL, &["-map", "[b]", "-c:v", "libx265"]));
        let outs = [planned(MAIN_LABEL, "/out/a.mp4"), planned(TEMP_CHUNK_LABEL, "/tmp/b.mov")];

        let cmd = build_ffmpeg_command("ffmpeg", &request, &outs, None);
        let args = get_args(&cmd);

        assert_eq!(cmd.get_program(), "ffmpeg");
        assert_eq!(args[0], "-y");
        assert!(has_flag_with_value(&args, "-i", "/media/in.mov"));
        assert!(has_flag_with_value(&args, "-filter_complex", "[0:v]split=2[a][b]"));

        let pos = |s: &str| args.iter().position(|a| a == s).unwrap();
        assert!(pos("-i") < pos("-filter_complex"));
        assert!(pos("-filter_complex") < pos("libsvtav1"));
        assert!(pos("libsvtav1") < pos("/out/a.mp4"));
        assert!(pos("/out/a.mp4") < pos("libx265"));
        assert!(pos("libx265") < pos("/tmp/b.mov"));
        assert!(has_flag_with_value(&args, "-progress", "pipe:1"));
        assert!(args.contains(&"-nostats".to_string()));
    }

    #[test]
    fn test_concat_command_uses_list_file() {
        let request = EncodeRequest::concat()
            .with_output(output(MAIN_LABEL, &["-c", "copy", "-an"]))
            .with_inputs(vec![PathBuf::from("/tmp/1.mov"), PathBuf::from("/tmp/2.mov")]);
        let outs = [planned(MAIN_LABEL, "/videos/Digest.mov")];

        let cmd = build_ffmpeg_command("ffmpeg", &request, &outs, Some(Path::new("/tmp/list.txt")));
        let args = get_args(&cmd);

        assert!(has_flag_with_value(&args, "-f", "concat"));
        assert!(has_flag_with_value(&args, "-safe", "0"));
        assert!(has_flag_with_value(&args, "-i", "/tmp/list.txt"));
        assert!(!args.contains(&"/tmp/1.mov".to_string()));
        assert!(has_flag_with_value(&args, "-c", "copy"));
    }

    #[test]
    fn test_concat_list_escapes_quotes() {
        let contents = concat_list_contents(&[
            PathBuf::from("/tmp/a.mov"),
            PathBuf::from("/tmp/it's.mov"),
        ]);
        assert_eq!(contents, "file '/tmp/a.mov'\nfile '/tmp/it'\\''s.mov'\n");
    }

    #[test]
    fn test_progress_parser_emits_on_block_end() {
        let mut parser = ProgressParser::default();
        assert_eq!(parser.feed("frame=120"), None);
        assert_eq!(parser.feed("total_size=524288"), None);
        assert_eq!(parser.feed("out_time_us=2500000"), None);
        assert_eq!(parser.feed("progress=continue"), Some((2.5, 524288)));

        // N/A keeps the previous value.
        assert_eq!(parser.feed("out_time_us=N/A"), None);
        assert_eq!(parser.feed("progress=end"), Some((2.5, 524288)));
        assert_eq!(parser.feed("garbage"), None);
    }

    #[test]
    fn test_line_splitter_handles_carriage_returns() {
        let mut splitter = LineSplitter::default();
        let lines = splitter.push(b"frame=  1 fps=0\rframe=  2 fps=1\r\nInput #0");
        assert_eq!(lines, vec!["frame=  1 fps=0", "frame=  2 fps=1"]);

        let lines = splitter.push(b", mov\n\n   \n");
        assert_eq!(lines, vec!["Input #0, mov"]);
        assert_eq!(splitter.finish(), None);

        splitter.push(b"trailing");
        assert_eq!(splitter.finish(), Some("trailing".to_string()));
    }

    #[test]
    fn test_plan_outputs_uses_first_input() {
        let runner = FfmpegRunner::new("ffmpeg", StorageDirs::under(Path::new("/srv")));
        let request = EncodeRequest::single("/media/trip/clip.mov")
            .with_output(output(MAIN_LABEL, &[]));

        let outs = runner.plan_outputs(&request);
        assert_eq!(outs, vec![planned(MAIN_LABEL, "/media/trip/clip_x.mp4")]);
    }

    #[tokio::test]
    async fn test_run_rejects_empty_request() {
        let runner = FfmpegRunner::new("ffmpeg", StorageDirs::under(Path::new("/srv")));
        let events = EventSink::detached(crate::task::TaskId::new());

        let err = runner
            .run(&EncodeRequest::concat(), events)
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_run_missing_binary_is_io_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let runner = FfmpegRunner::new(
            "optimux-no-such-ffmpeg",
            StorageDirs::under(dir.path()),
        );
        let request = EncodeRequest::single(dir.path().join("in.mov"))
            .with_output(output(MAIN_LABEL, &[]));
        let events = EventSink::detached(crate::task::TaskId::new());

        let err = runner.run(&request, events).await.unwrap_err();
        assert!(matches!(err, ProcessError::Io(_)));
    }
}
