//! CLI entry point for OptiMux
//!
//! Imports the given files, compiles a recipe over them and runs it.

use async_trait::async_trait;
use chrono::Utc;
use clap::{Parser, Subcommand};
use optimux_engine::recipe::{AudioMode, Codec, DualTimescaleParams, PlainConvertParams, Recipe};
use optimux_engine::request::DestinationRule;
use optimux_engine::{
    collect_media, AutoApprove, Config, DeleteApproval, JobMetrics, PendingDeletes, RunOutcome,
    Session, SourceStatus,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// OptiMux - batch transcoding through ffmpeg
#[derive(Parser, Debug)]
#[command(name = "optimux")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Skip startup checks (ffmpeg, ffprobe)
    #[arg(long, default_value = "false")]
    skip_checks: bool,

    /// Serve /metrics, /tasks and /log while running
    #[arg(long, default_value = "false")]
    serve_metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert every file with one codec preset
    Convert {
        /// Video codec: hevc or av1 (default from config)
        #[arg(long)]
        codec: Option<String>,

        /// Audio handling: copy or none (default from config)
        #[arg(long)]
        audio: Option<String>,

        /// Output location: same, videos, downloads, temp or a directory
        #[arg(long, default_value = "same")]
        dest: String,

        /// Output container extension
        #[arg(long, default_value = "mp4")]
        ext: String,

        /// Files or directories to import
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Build a 60x timelapse per clip plus a merged digest of all clips
    Digest {
        /// Length of the merged digest in seconds (default from config)
        #[arg(long)]
        target: Option<f64>,

        /// Move the original clips to the trash once everything succeeded
        #[arg(long, default_value = "false")]
        trash_originals: bool,

        /// Do not ask before trashing originals
        #[arg(short, long, default_value = "false")]
        yes: bool,

        /// Files or directories to import
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
}

/// Asks on the terminal before staged files are deleted.
struct PromptApproval;

#[async_trait]
impl DeleteApproval for PromptApproval {
    async fn approve(&self, pending: &PendingDeletes) -> bool {
        eprintln!("About to move {} file(s) to the trash:", pending.len());
        for entry in pending.iter() {
            eprintln!("  {}", entry.path.display());
        }
        eprint!("Proceed? [y/N] ");

        let mut line = String::new();
        let mut stdin = BufReader::new(tokio::io::stdin());
        match stdin.read_line(&mut line).await {
            Ok(_) => matches!(line.trim().to_lowercase().as_str(), "y" | "yes"),
            Err(e) => {
                warn!(error = %e, "Could not read answer, keeping files");
                false
            }
        }
    }
}

fn parse_destination(value: &str) -> DestinationRule {
    match value {
        "same" => DestinationRule::SameAsSource,
        "videos" => DestinationRule::VideoLibrary,
        "downloads" => DestinationRule::Download,
        "temp" => DestinationRule::Temp,
        dir => DestinationRule::Path(PathBuf::from(dir)),
    }
}

fn build_recipe(command: &Command, config: &Config) -> Result<(Recipe, Arc<dyn DeleteApproval>), String> {
    match command {
        Command::Convert {
            codec,
            audio,
            dest,
            ext,
            ..
        } => {
            let codec: Codec = codec.as_deref().unwrap_or(&config.recipes.codec).parse()?;
            let audio: AudioMode = audio.as_deref().unwrap_or(&config.recipes.audio).parse()?;
            let params = PlainConvertParams {
                codec,
                audio,
                destination: parse_destination(dest),
                extension: ext.trim_start_matches('.').to_string(),
            };
            let approval: Arc<dyn DeleteApproval> = Arc::new(AutoApprove);
            Ok((Recipe::PlainConvert(params), approval))
        }
        Command::Digest {
            target,
            trash_originals,
            yes,
            ..
        } => {
            let params = DualTimescaleParams {
                target_duration_secs: target.unwrap_or(config.recipes.digest_target_secs),
                trash_originals: *trash_originals,
                digest_stamp: Utc::now(),
            };
            let approval: Arc<dyn DeleteApproval> = if *yes {
                Arc::new(AutoApprove)
            } else {
                Arc::new(PromptApproval)
            };
            Ok((Recipe::DualTimescale(params), approval))
        }
    }
}

fn print_summary(metrics: &JobMetrics) {
    println!(
        "Tasks: {} total, {} done, {} failed, {} skipped",
        metrics.total_tasks, metrics.completed_tasks, metrics.error_count, metrics.skipped_count
    );
    println!(
        "Size: {} -> {} bytes",
        metrics.total_original_bytes, metrics.current_encoded_bytes
    );
    if let Some(rate) = metrics.reduction_rate_percent {
        println!("Reduction: {:.1}%", rate);
    }
    if let Some(speed) = metrics.realtime_speed {
        println!("Speed: {:.2}x realtime", speed);
    }
    println!("Elapsed: {:.1}s", metrics.elapsed_secs);
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "optimux=info,optimux_engine=info".into()),
        )
        .with(fmt::layer())
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Failed to load {}: {}", path.display(), e);
                return ExitCode::FAILURE;
            }
        },
        None => Config::from_env(),
    };
    if args.skip_checks {
        warn!("Skipping startup checks (--skip-checks enabled)");
        config.encoder.skip_checks = true;
    }
    if args.serve_metrics {
        config.metrics.enabled = true;
    }

    let (recipe, approval) = match build_recipe(&args.command, &config) {
        Ok(built) => built,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let session = match Session::new(config) {
        Ok(session) => session,
        Err(e) => {
            eprintln!("Failed to initialize: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if session.config().metrics.enabled {
        let _metrics = session.start_metrics_server();
    }

    let paths = match &args.command {
        Command::Convert { paths, .. } | Command::Digest { paths, .. } => collect_media(paths),
    };
    if paths.is_empty() {
        eprintln!("No media files found");
        return ExitCode::FAILURE;
    }

    session.import_paths(&paths).await;
    for source in session.store().sources().await {
        if source.status == SourceStatus::Error {
            eprintln!(
                "Skipping {}: {}",
                source.path.display(),
                source.error_reason.as_deref().unwrap_or("unknown error")
            );
        }
    }

    let orchestrator = match session.prepare(&recipe, approval).await {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let cancel = orchestrator.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping after cleanup");
            cancel.cancel();
        }
    });

    info!(recipe = recipe.name(), files = paths.len(), "Starting");
    let report = orchestrator.run().await;
    print_summary(&report.metrics);
    for failure in &report.delete_failures {
        eprintln!("Could not trash {}: {}", failure.path.display(), failure.reason);
    }

    match report.outcome {
        RunOutcome::Completed => ExitCode::SUCCESS,
        RunOutcome::Aborted { reason, .. } => {
            error!(%reason, "Run aborted");
            ExitCode::FAILURE
        }
        RunOutcome::Cancelled => ExitCode::from(130),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_destination() {
        assert_eq!(parse_destination("same"), DestinationRule::SameAsSource);
        assert_eq!(parse_destination("videos"), DestinationRule::VideoLibrary);
        assert_eq!(parse_destination("downloads"), DestinationRule::Download);
        assert_eq!(parse_destination("temp"), DestinationRule::Temp);
        assert_eq!(
            parse_destination("/srv/out"),
            DestinationRule::Path(PathBuf::from("/srv/out"))
        );
    }

    #[test]
    fn test_convert_args_fall_back_to_config() {
        let args = Args::try_parse_from(["optimux", "convert", "a.mov"]).unwrap();
        let mut config = Config::default();
        config.recipes.codec = "av1".to_string();

        let (recipe, _) = build_recipe(&args.command, &config).unwrap();
        match recipe {
            Recipe::PlainConvert(params) => {
                assert_eq!(params.codec, Codec::Av1);
                assert_eq!(params.audio, AudioMode::Copy);
                assert_eq!(params.extension, "mp4");
            }
            other => panic!("unexpected recipe {:?}", other),
        }
    }

    #[test]
    fn test_unknown_codec_is_rejected() {
        let args = Args::try_parse_from(["optimux", "convert", "--codec", "vp9", "a.mov"]).unwrap();
        let Err(err) = build_recipe(&args.command, &Config::default()) else {
            panic!("expected vp9 to be rejected");
        };
        assert!(err.contains("vp9"));
    }

    #[test]
    fn test_digest_args() {
        let args = Args::try_parse_from([
            "optimux",
            "--skip-checks",
            "digest",
            "--target",
            "30",
            "--trash-originals",
            "clips/",
        ])
        .unwrap();
        assert!(args.skip_checks);

        let (recipe, _) = build_recipe(&args.command, &Config::default()).unwrap();
        match recipe {
            Recipe::DualTimescale(params) => {
                assert_eq!(params.target_duration_secs, 30.0);
                assert!(params.trash_originals);
            }
            other => panic!("unexpected recipe {:?}", other),
        }
    }

    #[test]
    fn test_paths_are_required() {
        assert!(Args::try_parse_from(["optimux", "digest"]).is_err());
    }
}
