//! Chunked transfer of in-memory byte blobs into the imports directory.
//!
//! The blob is cut into base64 chunks whose size scales with the blob,
//! bounded on both sides. The sink reports the same destination path for
//! every chunk of one transfer.

use crate::config::TransferConfig;
use crate::task::file_name_of;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use std::ops::Range;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Nothing to transfer for {0}")]
    Empty(String),

    #[error("Invalid file name: {0:?}")]
    InvalidName(String),

    #[error("Chunk for {name} starts at {offset} but {written} bytes are on disk")]
    OffsetMismatch {
        name: String,
        offset: u64,
        written: u64,
    },

    #[error("Invalid base64 payload: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Chunk sink failed: {0}")]
    Sink(String),
}

/// Chunk size bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPolicy {
    pub min_bytes: u64,
    pub max_bytes: u64,
    pub divisor: u64,
}

impl Default for ChunkPolicy {
    fn default() -> Self {
        Self {
            min_bytes: 2 * 1024 * 1024,
            max_bytes: 128 * 1024 * 1024,
            divisor: 10,
        }
    }
}

impl From<&TransferConfig> for ChunkPolicy {
    fn from(cfg: &TransferConfig) -> Self {
        let min_bytes = cfg.min_chunk_bytes.max(1);
        Self {
            min_bytes,
            max_bytes: cfg.max_chunk_bytes.max(min_bytes),
            divisor: cfg.chunk_divisor.max(1),
        }
    }
}

impl ChunkPolicy {
    /// `clamp(ceil(size / divisor), min, max)`.
    pub fn chunk_size(&self, file_size: u64) -> u64 {
        file_size
            .div_ceil(self.divisor.max(1))
            .clamp(self.min_bytes, self.max_bytes)
    }

    /// Byte ranges covering `0..file_size` in order.
    pub fn ranges(&self, file_size: u64) -> impl Iterator<Item = Range<u64>> {
        let step = self.chunk_size(file_size).max(1);
        (0..file_size)
            .step_by(step as usize)
            .map(move |start| start..(start + step).min(file_size))
    }
}

/// Receives one chunk of a transfer.
#[async_trait]
pub trait ChunkSink: Send + Sync {
    /// Store `payload` (base64) at `offset` of `file_name`; returns where the
    /// file ends up.
    async fn put_chunk(
        &self,
        file_name: &str,
        payload: &str,
        offset: u64,
    ) -> Result<PathBuf, TransferError>;
}

/// `min(100, round(done / total * 100))`.
pub fn percent_of(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    let pct = (done as f64 / total as f64 * 100.0).round();
    pct.min(100.0) as u8
}

/// Push `data` through `sink` chunk by chunk.
///
/// `on_progress` receives the percentage after every chunk. The first failing
/// chunk aborts this transfer only.
pub async fn transfer<S, F>(
    sink: &S,
    policy: &ChunkPolicy,
    file_name: &str,
    data: &[u8],
    mut on_progress: F,
) -> Result<PathBuf, TransferError>
where
    S: ChunkSink + ?Sized,
    F: FnMut(u8),
{
    let total = data.len() as u64;
    if total == 0 {
        return Err(TransferError::Empty(file_name.to_string()));
    }

    debug!(
        file = file_name,
        size = total,
        chunk = policy.chunk_size(total),
        "Starting chunked transfer"
    );

    let mut destination = None;
    for range in policy.ranges(total) {
        let slice = &data[range.start as usize..range.end as usize];
        let payload = STANDARD.encode(slice);
        let path = sink.put_chunk(file_name, &payload, range.start).await?;
        destination = Some(path);
        on_progress(percent_of(range.end, total));
    }

    destination.ok_or_else(|| TransferError::Empty(file_name.to_string()))
}

/// Strip a `data:<mime>;base64,` prefix if present.
fn strip_data_url(payload: &str) -> &str {
    if payload.starts_with("data:") {
        if let Some((_, body)) = payload.split_once(',') {
            return body;
        }
    }
    payload
}

/// Chunk sink writing into a local directory.
#[derive(Debug, Clone)]
pub struct LocalChunkSink {
    dir: PathBuf,
}

impl LocalChunkSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn destination(&self, file_name: &str) -> Result<PathBuf, TransferError> {
        let name = file_name_of(Path::new(file_name));
        if name.is_empty() || name == "." || name == ".." || name.contains('/') {
            return Err(TransferError::InvalidName(file_name.to_string()));
        }
        Ok(self.dir.join(name))
    }
}

#[async_trait]
impl ChunkSink for LocalChunkSink {
    async fn put_chunk(
        &self,
        file_name: &str,
        payload: &str,
        offset: u64,
    ) -> Result<PathBuf, TransferError> {
        let bytes = STANDARD.decode(strip_data_url(payload))?;
        let path = self.destination(file_name)?;
        fs::create_dir_all(&self.dir).await?;

        let mut file = if offset == 0 {
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&path)
                .await?
        } else {
            let written = fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);
            if written != offset {
                warn!(file = file_name, offset, written, "Out-of-order chunk");
                return Err(TransferError::OffsetMismatch {
                    name: file_name.to_string(),
                    offset,
                    written,
                });
            }
            OpenOptions::new().append(true).open(&path).await?
        };

        file.write_all(&bytes).await?;
        file.flush().await?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;
    use tempfile::TempDir;

    const MIB: u64 = 1024 * 1024;

    /// Reassembles chunks in memory and records every offset.
    #[derive(Default)]
    struct MemorySink {
        data: Mutex<Vec<u8>>,
        offsets: Mutex<Vec<u64>>,
        fail_at: Option<u64>,
    }

    #[async_trait]
    impl ChunkSink for MemorySink {
        async fn put_chunk(
            &self,
            file_name: &str,
            payload: &str,
            offset: u64,
        ) -> Result<PathBuf, TransferError> {
            if self.fail_at == Some(offset) {
                return Err(TransferError::Sink("connection reset".to_string()));
            }
            let bytes = STANDARD.decode(payload)?;
            self.data.lock().unwrap().extend_from_slice(&bytes);
            self.offsets.lock().unwrap().push(offset);
            Ok(PathBuf::from("/imports").join(file_name))
        }
    }

    fn tiny_policy() -> ChunkPolicy {
        ChunkPolicy {
            min_bytes: 4,
            max_bytes: 64,
            divisor: 10,
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_chunk_size_bounded_and_monotone(a in 0u64..(4 * 1024 * MIB), b in 0u64..(4 * 1024 * MIB)) {
            let policy = ChunkPolicy::default();
            let (small, large) = if a <= b { (a, b) } else { (b, a) };
            let cs = policy.chunk_size(small);
            prop_assert!(cs >= 2 * MIB && cs <= 128 * MIB);
            prop_assert!(cs <= policy.chunk_size(large));

            let raw = small.div_ceil(10);
            if (2 * MIB..=128 * MIB).contains(&raw) {
                prop_assert_eq!(cs, raw);
            }
        }

        #[test]
        fn prop_ranges_reconstruct_exactly(data in prop::collection::vec(any::<u8>(), 1..2000)) {
            let policy = tiny_policy();
            let mut rebuilt = Vec::new();
            let mut expected_start = 0;
            for range in policy.ranges(data.len() as u64) {
                prop_assert_eq!(range.start, expected_start);
                rebuilt.extend_from_slice(&data[range.start as usize..range.end as usize]);
                expected_start = range.end;
            }
            prop_assert_eq!(rebuilt, data);
        }
    }

    #[test]
    fn test_chunk_size_examples() {
        let policy = ChunkPolicy::default();
        assert_eq!(policy.chunk_size(500 * MIB), 50 * MIB);
        assert_eq!(policy.chunk_size(1), 2 * MIB);
        assert_eq!(policy.chunk_size(10 * 1024 * MIB), 128 * MIB);
    }

    #[test]
    fn test_policy_from_config() {
        let cfg = TransferConfig {
            min_chunk_bytes: 0,
            max_chunk_bytes: 0,
            chunk_divisor: 0,
        };
        let policy = ChunkPolicy::from(&cfg);
        assert_eq!(policy.min_bytes, 1);
        assert_eq!(policy.max_bytes, 1);
        assert_eq!(policy.divisor, 1);
    }

    #[tokio::test]
    async fn test_transfer_reports_progress_to_100() {
        let sink = MemorySink::default();
        let data: Vec<u8> = (0..100u8).collect();
        let mut reports = Vec::new();

        let path = transfer(&sink, &tiny_policy(), "clip.mp4", &data, |p| reports.push(p))
            .await
            .unwrap();

        assert_eq!(path, PathBuf::from("/imports/clip.mp4"));
        assert_eq!(*sink.data.lock().unwrap(), data);
        // ceil(100/10) = 10 byte chunks
        assert_eq!(*sink.offsets.lock().unwrap(), (0..10).map(|i| i * 10).collect::<Vec<u64>>());
        assert_eq!(reports.len(), 10);
        assert!(reports.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(reports.last(), Some(&100));
    }

    #[tokio::test]
    async fn test_failed_chunk_aborts_transfer() {
        let sink = MemorySink {
            fail_at: Some(20),
            ..MemorySink::default()
        };
        let data = vec![7u8; 100];
        let mut reports = Vec::new();

        let err = transfer(&sink, &tiny_policy(), "clip.mp4", &data, |p| reports.push(p))
            .await
            .unwrap_err();

        assert!(matches!(err, TransferError::Sink(_)));
        assert_eq!(reports, vec![10, 20]);
    }

    #[tokio::test]
    async fn test_empty_blob_is_rejected() {
        let sink = MemorySink::default();
        let err = transfer(&sink, &tiny_policy(), "empty.mp4", &[], |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Empty(_)));
    }

    #[tokio::test]
    async fn test_local_sink_writes_file() {
        let dir = TempDir::new().unwrap();
        let sink = LocalChunkSink::new(dir.path().join("imports"));
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();

        let path = transfer(&sink, &tiny_policy(), "drop.mov", &data, |_| {})
            .await
            .unwrap();

        assert_eq!(path, dir.path().join("imports").join("drop.mov"));
        assert_eq!(std::fs::read(&path).unwrap(), data);
    }

    #[tokio::test]
    async fn test_local_sink_restart_truncates() {
        let dir = TempDir::new().unwrap();
        let sink = LocalChunkSink::new(dir.path());

        sink.put_chunk("a.bin", &STANDARD.encode(b"old data"), 0)
            .await
            .unwrap();
        let path = sink
            .put_chunk("a.bin", &STANDARD.encode(b"new"), 0)
            .await
            .unwrap();

        assert_eq!(std::fs::read(path).unwrap(), b"new");
    }

    #[tokio::test]
    async fn test_local_sink_accepts_data_url() {
        let dir = TempDir::new().unwrap();
        let sink = LocalChunkSink::new(dir.path());
        let payload = format!("data:video/mp4;base64,{}", STANDARD.encode(b"abc"));

        let path = sink.put_chunk("a.mp4", &payload, 0).await.unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"abc");
    }

    #[tokio::test]
    async fn test_local_sink_rejects_gap() {
        let dir = TempDir::new().unwrap();
        let sink = LocalChunkSink::new(dir.path());
        sink.put_chunk("a.bin", &STANDARD.encode(b"1234"), 0)
            .await
            .unwrap();

        let err = sink
            .put_chunk("a.bin", &STANDARD.encode(b"5678"), 8)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::OffsetMismatch { written: 4, .. }));
    }

    #[tokio::test]
    async fn test_local_sink_strips_directories() {
        let dir = TempDir::new().unwrap();
        let sink = LocalChunkSink::new(dir.path());
        let path = sink
            .put_chunk("../../etc/evil.mp4", &STANDARD.encode(b"x"), 0)
            .await
            .unwrap();
        assert_eq!(path, dir.path().join("evil.mp4"));
    }
}
