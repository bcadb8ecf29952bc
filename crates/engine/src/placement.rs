//! Output placement: turns an [`OutputSpec`] into a concrete file path.
//!
//! The directory comes from the destination rule, the file stem from the
//! naming rule, and the extension from the output itself (defaulting to `mp4`).

use crate::config::StorageConfig;
use crate::request::{DestinationRule, NamingRule, OutputSpec};
use std::env;
use std::path::{Path, PathBuf};
use uuid::Uuid;

const APP_DIR: &str = "OptiMux";
const DEFAULT_EXTENSION: &str = "mp4";

/// Resolved storage directories.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageDirs {
    pub video_dir: PathBuf,
    pub downloads_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub imports_dir: PathBuf,
    pub trash_dir: PathBuf,
}

impl StorageDirs {
    /// Fill unset entries with the platform defaults.
    pub fn from_config(cfg: &StorageConfig) -> Self {
        let home = dirs::home_dir().unwrap_or_else(env::temp_dir);
        let os_temp = env::temp_dir().join(APP_DIR);

        let library_root = if cfg!(windows) { "Videos" } else { "Movies" };

        Self {
            video_dir: cfg
                .video_dir
                .clone()
                .unwrap_or_else(|| home.join(library_root).join(APP_DIR)),
            downloads_dir: cfg
                .downloads_dir
                .clone()
                .unwrap_or_else(|| home.join("Downloads").join(APP_DIR)),
            temp_dir: cfg
                .temp_dir
                .clone()
                .unwrap_or_else(|| os_temp.join("Intermediate")),
            imports_dir: cfg
                .imports_dir
                .clone()
                .unwrap_or_else(|| os_temp.join("Imports")),
            trash_dir: cfg
                .trash_dir
                .clone()
                .unwrap_or_else(|| os_temp.join("Trash")),
        }
    }

    /// Every directory under one root, for tests and sandboxed runs.
    pub fn under(root: &Path) -> Self {
        Self {
            video_dir: root.join("videos"),
            downloads_dir: root.join("downloads"),
            temp_dir: root.join("temp"),
            imports_dir: root.join("imports"),
            trash_dir: root.join("trash"),
        }
    }
}

/// Directory an output lands in.
pub fn output_dir(rule: &DestinationRule, source: Option<&Path>, dirs: &StorageDirs) -> PathBuf {
    let source_dir = source
        .and_then(Path::parent)
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    match rule {
        DestinationRule::SameAsSource => source_dir,
        DestinationRule::VideoLibrary => dirs.video_dir.clone(),
        DestinationRule::Download => dirs.downloads_dir.clone(),
        DestinationRule::Temp => dirs.temp_dir.clone(),
        DestinationRule::Path(path) if path.is_absolute() => path.clone(),
        DestinationRule::Path(path) => source_dir.join(path),
    }
}

/// File name of an output, extension included.
pub fn output_file_name(spec: &OutputSpec, source: Option<&Path>) -> String {
    let extension = match spec.extension.trim_start_matches('.') {
        "" => DEFAULT_EXTENSION,
        ext => ext,
    };

    let stem = match &spec.naming {
        NamingRule::AutoSuffix(suffix) => {
            let base = source
                .and_then(Path::file_stem)
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "output".to_string());
            format!("{}{}", base, suffix)
        }
        NamingRule::FixedName(name) => name.clone(),
        NamingRule::GeneratedId => Uuid::new_v4().to_string(),
    };

    format!("{}.{}", stem, extension)
}

/// Full path of an output. `source` is the first input of the request.
pub fn resolve_output_path(spec: &OutputSpec, source: Option<&Path>, dirs: &StorageDirs) -> PathBuf {
    output_dir(&spec.destination, source, dirs).join(output_file_name(spec, source))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(destination: DestinationRule, naming: NamingRule, extension: &str) -> OutputSpec {
        OutputSpec {
            label: "main".to_string(),
            destination,
            naming,
            extension: extension.to_string(),
            encoder_options: Vec::new(),
        }
    }

    fn dirs() -> StorageDirs {
        StorageDirs::under(Path::new("/srv/optimux"))
    }

    #[test]
    fn test_same_as_source_with_suffix() {
        let out = spec(
            DestinationRule::SameAsSource,
            NamingRule::AutoSuffix("_hevc".into()),
            "mp4",
        );
        let path = resolve_output_path(&out, Some(Path::new("/media/trip/clip.mov")), &dirs());
        assert_eq!(path, PathBuf::from("/media/trip/clip_hevc.mp4"));
    }

    #[test]
    fn test_video_library_fixed_name() {
        let out = spec(
            DestinationRule::VideoLibrary,
            NamingRule::FixedName("Digest_2024-05-01_10-00-00".into()),
            "mov",
        );
        let path = resolve_output_path(&out, None, &dirs());
        assert_eq!(
            path,
            PathBuf::from("/srv/optimux/videos/Digest_2024-05-01_10-00-00.mov")
        );
    }

    #[test]
    fn test_temp_generated_name() {
        let out = spec(DestinationRule::Temp, NamingRule::GeneratedId, "mov");
        let path = resolve_output_path(&out, Some(Path::new("/media/a.mov")), &dirs());

        assert_eq!(path.parent(), Some(Path::new("/srv/optimux/temp")));
        let stem = path.file_stem().unwrap().to_string_lossy().into_owned();
        assert!(Uuid::parse_str(&stem).is_ok());
        assert_eq!(path.extension().unwrap(), "mov");
    }

    #[test]
    fn test_generated_names_differ() {
        let out = spec(DestinationRule::Temp, NamingRule::GeneratedId, "mov");
        assert_ne!(output_file_name(&out, None), output_file_name(&out, None));
    }

    #[test]
    fn test_download_and_missing_extension() {
        let out = spec(
            DestinationRule::Download,
            NamingRule::AutoSuffix("_av1".into()),
            "",
        );
        let path = resolve_output_path(&out, Some(Path::new("/media/b.mkv")), &dirs());
        assert_eq!(path, PathBuf::from("/srv/optimux/downloads/b_av1.mp4"));
    }

    #[test]
    fn test_relative_and_absolute_paths() {
        let relative = spec(
            DestinationRule::Path(PathBuf::from("encoded")),
            NamingRule::FixedName("x".into()),
            ".mkv",
        );
        assert_eq!(
            resolve_output_path(&relative, Some(Path::new("/media/c.mov")), &dirs()),
            PathBuf::from("/media/encoded/x.mkv")
        );

        let absolute = spec(
            DestinationRule::Path(PathBuf::from("/exports")),
            NamingRule::FixedName("x".into()),
            "mkv",
        );
        assert_eq!(
            resolve_output_path(&absolute, Some(Path::new("/media/c.mov")), &dirs()),
            PathBuf::from("/exports/x.mkv")
        );
    }

    #[test]
    fn test_from_config_prefers_explicit_dirs() {
        let cfg = StorageConfig {
            temp_dir: Some(PathBuf::from("/scratch")),
            ..StorageConfig::default()
        };
        let resolved = StorageDirs::from_config(&cfg);
        assert_eq!(resolved.temp_dir, PathBuf::from("/scratch"));
        assert!(resolved.video_dir.ends_with(APP_DIR));
        assert!(resolved.imports_dir.ends_with("Imports"));
    }
}
