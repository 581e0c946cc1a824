//! File-backed JSON IPC.
//!
//! All cross-worker state lives in a pipe directory so an operator can
//! `tail -F` any of it live. Replace-writes frame the payload with a clip
//! tag on both ends; a reader that catches a half-written file fails to
//! find the frame and retries with a growing delay. Append-writes add one
//! newline-prefixed JSON object per call and are used for the monthly
//! chronicle archives.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::AsyncWriteExt;

use crate::error::IpcError;

/// Frame marker for replace-writes. Clipping on read discards anything left
/// over from a longer previous payload.
const CLIP_TAG: &str = "<<< JSON IPC >>>";

/// Subdirectory holding the append-only chronicle archives.
const ARCHIVE_DIR: &str = "archives";

const DEFAULT_ATTEMPTS: u32 = 12;

#[derive(Debug, Clone)]
pub struct JsonIpc {
    pipe: PathBuf,
    attempts: u32,
}

impl JsonIpc {
    pub fn new(pipe: impl Into<PathBuf>) -> Self {
        JsonIpc {
            pipe: pipe.into(),
            attempts: DEFAULT_ATTEMPTS,
        }
    }

    /// Bound the retry loop; tests use small values to fail fast.
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn pipe_dir(&self) -> &Path {
        &self.pipe
    }

    fn doc_path(&self, doc: &str) -> PathBuf {
        self.pipe.join(doc)
    }

    fn archive_path(&self, doc: &str) -> PathBuf {
        self.pipe.join(ARCHIVE_DIR).join(doc)
    }

    /// Create the pipe directory tree.
    pub async fn initialize(&self) -> Result<(), IpcError> {
        let archive = self.pipe.join(ARCHIVE_DIR);
        tokio::fs::create_dir_all(&archive)
            .await
            .map_err(|source| IpcError::Io {
                doc: archive.display().to_string(),
                source,
            })
    }

    /// Replace-write a framed JSON payload.
    pub async fn write<T: Serialize>(&self, doc: &str, value: &T) -> Result<(), IpcError> {
        let json = serde_json::to_string(value).map_err(|_| IpcError::Malformed {
            doc: doc.to_string(),
        })?;
        let framed = format!("{CLIP_TAG}{json}{CLIP_TAG}");
        let path = self.doc_path(doc);
        let mut last_io: Option<std::io::Error> = None;
        for iteration in 0..self.attempts {
            tokio::time::sleep(backoff(iteration)).await;
            if iteration == 5 {
                // maybe there is no pipe yet
                let _ = self.initialize().await;
            }
            match tokio::fs::write(&path, &framed).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    if iteration == 1 {
                        tracing::warn!(doc, error = %err, "ipc write failed, retrying");
                    }
                    last_io = Some(err);
                }
            }
        }
        Err(match last_io {
            Some(source) => IpcError::Io {
                doc: doc.to_string(),
                source,
            },
            None => IpcError::Exhausted {
                doc: doc.to_string(),
                attempts: self.attempts,
            },
        })
    }

    /// Read a framed JSON payload. `Ok(None)` when the document does not
    /// exist yet; retries with growing backoff while the frame is missing
    /// or the JSON is torn mid-write.
    pub async fn read<T: DeserializeOwned>(&self, doc: &str) -> Result<Option<T>, IpcError> {
        let path = self.doc_path(doc);
        for iteration in 0..self.attempts {
            tokio::time::sleep(backoff(iteration)).await;
            if !path.exists() {
                return Ok(None);
            }
            if iteration == 5 {
                let _ = self.initialize().await;
            }
            let raw = match tokio::fs::read_to_string(&path).await {
                Ok(raw) => raw,
                Err(err) => {
                    if iteration == 1 {
                        tracing::warn!(doc, error = %err, "ipc read failed, retrying");
                    }
                    continue;
                }
            };
            let Some(clipped) = raw.split(CLIP_TAG).nth(1) else {
                continue;
            };
            match serde_json::from_str(clipped) {
                Ok(value) => return Ok(Some(value)),
                Err(_) => continue,
            }
        }
        Err(IpcError::Exhausted {
            doc: doc.to_string(),
            attempts: self.attempts,
        })
    }

    /// Append one newline-prefixed JSON object to an archive document.
    pub async fn append<T: Serialize>(&self, doc: &str, value: &T) -> Result<(), IpcError> {
        let json = serde_json::to_string(value).map_err(|_| IpcError::Malformed {
            doc: doc.to_string(),
        })?;
        let line = format!("\n{json}");
        let path = self.archive_path(doc);
        for iteration in 0..self.attempts {
            tokio::time::sleep(backoff(iteration)).await;
            if iteration == 5 {
                let _ = self.initialize().await;
            }
            let open = tokio::fs::OpenOptions::new()
                .append(true)
                .create(true)
                .open(&path)
                .await;
            match open {
                Ok(mut handle) => {
                    if handle.write_all(line.as_bytes()).await.is_ok() {
                        return Ok(());
                    }
                }
                Err(err) => {
                    if iteration == 1 {
                        tracing::warn!(doc, error = %err, "ipc append failed, retrying");
                    }
                }
            }
        }
        Err(IpcError::Exhausted {
            doc: doc.to_string(),
            attempts: self.attempts,
        })
    }
}

/// Growing delay between attempts: 0.02 * iteration^2 seconds.
fn backoff(iteration: u32) -> Duration {
    Duration::from_secs_f64(0.02 * f64::from(iteration * iteration))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ParachainFragment, Transfer};

    fn scratch() -> (tempfile::TempDir, JsonIpc) {
        let dir = tempfile::tempdir().unwrap();
        let ipc = JsonIpc::new(dir.path()).with_attempts(4);
        (dir, ipc)
    }

    #[tokio::test]
    async fn test_write_read_roundtrip() {
        let (_dir, ipc) = scratch();
        ipc.initialize().await.unwrap();
        let state = vec![1u8, 0, 1];
        ipc.write("btc_gateway_state", &state).await.unwrap();
        let back: Option<Vec<u8>> = ipc.read("btc_gateway_state").await.unwrap();
        assert_eq!(back, Some(state));
    }

    #[tokio::test]
    async fn test_read_missing_doc_is_none() {
        let (_dir, ipc) = scratch();
        ipc.initialize().await.unwrap();
        let got: Option<Vec<u8>> = ipc.read("nonexistent").await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_framed_payload_on_disk() {
        let (dir, ipc) = scratch();
        ipc.initialize().await.unwrap();
        ipc.write("block_number", &[42u64]).await.unwrap();
        let raw = std::fs::read_to_string(dir.path().join("block_number")).unwrap();
        assert_eq!(raw, format!("{CLIP_TAG}[42]{CLIP_TAG}"));
    }

    #[tokio::test]
    async fn test_unframed_garbage_errors_out() {
        let (dir, ipc) = scratch();
        ipc.initialize().await.unwrap();
        std::fs::write(dir.path().join("torn"), "{\"partial\":").unwrap();
        let got: Result<Option<Vec<u8>>, _> = ipc.read("torn").await;
        assert!(matches!(got, Err(IpcError::Exhausted { .. })));
    }

    #[tokio::test]
    async fn test_append_accumulates_lines() {
        let (dir, ipc) = scratch();
        ipc.initialize().await.unwrap();
        ipc.append("BTC_2021_01_archive", &serde_json::json!({"msg": "one"}))
            .await
            .unwrap();
        ipc.append("BTC_2021_01_archive", &serde_json::json!({"msg": "two"}))
            .await
            .unwrap();
        let raw = std::fs::read_to_string(
            dir.path().join(ARCHIVE_DIR).join("BTC_2021_01_archive"),
        )
        .unwrap();
        let lines: Vec<&str> = raw.lines().filter(|l| !l.is_empty()).collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("one"));
        assert!(lines[1].contains("two"));
    }

    #[tokio::test]
    async fn test_parachain_cache_roundtrip() {
        let (_dir, ipc) = scratch();
        ipc.initialize().await.unwrap();
        let mut fragment = ParachainFragment::new();
        fragment.insert(7, vec![]);
        fragment.insert(
            8,
            vec![Transfer {
                to: "a".into(),
                from: String::new(),
                memo: String::new(),
                hash: "h".into(),
                asset: "BTC".into(),
                amount: 0.5,
            }],
        );
        ipc.write("parachain_btc.cache", &fragment).await.unwrap();
        let back: ParachainFragment = ipc
            .read("parachain_btc.cache")
            .await
            .unwrap()
            .expect("cache present");
        assert_eq!(back, fragment);
        assert_eq!(back.keys().copied().collect::<Vec<_>>(), vec![7, 8]);
    }
}
