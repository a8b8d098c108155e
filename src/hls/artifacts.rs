//! On-disk HLS artifact store
//!
//! Layout for one stream:
//!
//! ```text
//! <root>/<key>/master.m3u8
//! <root>/<key>/<N>/playlist.m3u8
//! <root>/<key>/<N>/segment_<SSS>.ts
//! <root>/<key>/.stream_ended        (JSON sentinel)
//! ```
//!
//! Writes from this module are atomic (temp file + rename) so HTTP readers
//! never observe a half-written playlist. The sentinel is the sole signal
//! that publishing ended; the retention sweeper refuses to touch any
//! directory that does not carry one.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::ladder::{render_ended_playlist, render_master_playlist, LadderProfile};
use crate::error::Error;
use crate::registry::StreamKey;

/// Sentinel file name inside a stream directory
pub const SENTINEL_FILE: &str = ".stream_ended";

/// End-of-stream sentinel contents
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEnded {
    pub key: String,
    pub ended_at: DateTime<Utc>,
    pub remote_addr: String,
    pub retention_hours: u32,
}

/// Canonical paths plus prepare/cleanup/retention for the artifact tree
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn stream_dir(&self, key: &StreamKey) -> PathBuf {
        self.root.join(key.as_str())
    }

    pub fn master_playlist_path(&self, key: &StreamKey) -> PathBuf {
        self.stream_dir(key).join("master.m3u8")
    }

    pub fn rung_dir(&self, key: &StreamKey, rung: usize) -> PathBuf {
        self.stream_dir(key).join(rung.to_string())
    }

    pub fn rung_playlist_path(&self, key: &StreamKey, rung: usize) -> PathBuf {
        self.rung_dir(key, rung).join("playlist.m3u8")
    }

    pub fn sentinel_path(&self, key: &StreamKey) -> PathBuf {
        self.stream_dir(key).join(SENTINEL_FILE)
    }

    /// Clear any prior tree for the key and create a fresh one with a
    /// directory per rung.
    pub async fn prepare(&self, key: &StreamKey, rung_count: usize) -> Result<(), Error> {
        let dir = self.stream_dir(key);

        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(artifact_io(&dir, e)),
        }

        for rung in 0..rung_count {
            let rung_dir = self.rung_dir(key, rung);
            tokio::fs::create_dir_all(&rung_dir)
                .await
                .map_err(|e| artifact_io(&rung_dir, e))?;
        }

        Ok(())
    }

    /// Write the master playlist for a freshly prepared tree
    pub async fn write_master(&self, key: &StreamKey, ladder: &[LadderProfile]) -> Result<(), Error> {
        let path = self.master_playlist_path(key);
        atomic_write(&path, render_master_playlist(ladder).as_bytes()).await
    }

    /// Replace the master playlist with the ended-stream marker
    pub async fn write_ended_master(&self, key: &StreamKey) -> Result<(), Error> {
        let path = self.master_playlist_path(key);
        atomic_write(&path, render_ended_playlist().as_bytes()).await
    }

    /// Write the end-of-stream sentinel, authorizing retention sweeping
    pub async fn write_sentinel(&self, key: &StreamKey, sentinel: &StreamEnded) -> Result<(), Error> {
        let path = self.sentinel_path(key);
        let json = serde_json::to_vec_pretty(sentinel)
            .map_err(|e| artifact_io(&path, std::io::Error::other(e)))?;
        atomic_write(&path, &json).await
    }

    /// Remove a stream's whole tree
    pub async fn remove_stream_dir(&self, key: &StreamKey) -> Result<(), Error> {
        let dir = self.stream_dir(key);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(artifact_io(&dir, e)),
        }
    }

    /// One retention pass: delete every stream directory whose sentinel
    /// has outlived its retention. Directories without a sentinel are
    /// never touched. Returns how many trees were removed.
    pub async fn sweep_once(&self) -> Result<usize, Error> {
        let mut removed = 0;

        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(artifact_io(&self.root, e)),
        };

        let now = Utc::now();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| artifact_io(&self.root, e))?
        {
            let dir = entry.path();
            if !dir.is_dir() {
                continue;
            }

            let Some(sentinel) = read_sentinel(&dir).await else {
                continue;
            };

            let deadline = sentinel.ended_at + chrono::Duration::hours(i64::from(sentinel.retention_hours));
            if deadline <= now {
                match tokio::fs::remove_dir_all(&dir).await {
                    Ok(()) => {
                        removed += 1;
                        tracing::info!(
                            stream = %sentinel.key,
                            ended_at = %sentinel.ended_at,
                            "Retention sweeper removed expired artifacts"
                        );
                    }
                    Err(e) => {
                        tracing::warn!(path = %dir.display(), error = %e, "Retention sweep failed");
                    }
                }
            }
        }

        Ok(removed)
    }

    /// Run the retention sweeper until cancelled: once immediately (to
    /// collect leftovers from a crashed process), then on the interval.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = store.sweep_once().await {
                            tracing::warn!(error = %e, "Retention sweep errored");
                        }
                    }
                }
            }
        })
    }
}

/// Read and parse a sentinel; unreadable or malformed sentinels are
/// treated as absent
async fn read_sentinel(dir: &Path) -> Option<StreamEnded> {
    let bytes = tokio::fs::read(dir.join(SENTINEL_FILE)).await.ok()?;
    match serde_json::from_slice(&bytes) {
        Ok(sentinel) => Some(sentinel),
        Err(e) => {
            tracing::warn!(path = %dir.display(), error = %e, "Unreadable stream-ended sentinel");
            None
        }
    }
}

/// Write via temp file + rename so readers never see partial contents
async fn atomic_write(path: &Path, contents: &[u8]) -> Result<(), Error> {
    let tmp = match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => parent.join(format!(".{}.tmp", name.to_string_lossy())),
        _ => return Err(artifact_io(path, std::io::Error::other("no parent directory"))),
    };

    tokio::fs::write(&tmp, contents)
        .await
        .map_err(|e| artifact_io(&tmp, e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| artifact_io(path, e))
}

fn artifact_io(path: &Path, source: std::io::Error) -> Error {
    Error::ArtifactIo {
        path: path.to_path_buf(),
        source,
    }
}
