//! HLS artifact freshness checks
//!
//! The monitor is read-only: it inspects segment mtimes under the artifact
//! root and reports; it never mutates artifacts and never signals anyone.
//! The per-stream supervisor asks it for a verdict on every tick, and the
//! HTTP index uses the same scan for its freshness column.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::registry::StreamKey;

/// Freshness verdict for one stream's artifact tree
#[derive(Debug, Clone)]
pub struct HealthReport {
    /// True iff every rung has at least one segment and the freshest
    /// segment across all rungs is within the freshness window
    pub active: bool,

    /// Age of the newest segment across all rungs; `None` when no rung
    /// has produced a segment yet
    pub last_segment_age: Option<Duration>,

    /// Indices of rungs that have at least one segment on disk
    pub present_rungs: Vec<usize>,
}

impl HealthReport {
    fn empty() -> Self {
        Self {
            active: false,
            last_segment_age: None,
            present_rungs: Vec::new(),
        }
    }

    /// Whether every expected rung has produced at least one segment
    pub fn all_rungs_present(&self, rung_count: usize) -> bool {
        self.present_rungs.len() == rung_count
    }
}

/// Read-only artifact freshness monitor
#[derive(Debug, Clone)]
pub struct HlsHealthMonitor {
    root: PathBuf,
    freshness: Duration,
}

impl HlsHealthMonitor {
    pub fn new(root: impl Into<PathBuf>, freshness: Duration) -> Self {
        Self {
            root: root.into(),
            freshness,
        }
    }

    pub fn freshness(&self) -> Duration {
        self.freshness
    }

    /// Scan a stream's artifact tree and report freshness.
    pub async fn scan(&self, key: &StreamKey, rung_count: usize) -> HealthReport {
        let stream_dir = self.root.join(key.as_str());
        let mut report = HealthReport::empty();
        let mut newest: Option<SystemTime> = None;

        for rung in 0..rung_count {
            let rung_dir = stream_dir.join(rung.to_string());
            if let Some(mtime) = newest_segment_mtime(&rung_dir).await {
                report.present_rungs.push(rung);
                newest = Some(match newest {
                    Some(current) if current >= mtime => current,
                    _ => mtime,
                });
            }
        }

        report.last_segment_age = newest.and_then(|t| t.elapsed().ok());
        report.active = report.present_rungs.len() == rung_count
            && report
                .last_segment_age
                .is_some_and(|age| age <= self.freshness);

        report
    }
}

/// Most recent mtime among `segment_*.ts` files in a rung directory
async fn newest_segment_mtime(rung_dir: &Path) -> Option<SystemTime> {
    let mut entries = tokio::fs::read_dir(rung_dir).await.ok()?;
    let mut newest: Option<SystemTime> = None;

    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.starts_with("segment_") || !name.ends_with(".ts") {
            continue;
        }

        let Ok(metadata) = entry.metadata().await else {
            continue;
        };
        let Ok(mtime) = metadata.modified() else {
            continue;
        };

        newest = Some(match newest {
            Some(current) if current >= mtime => current,
            _ => mtime,
        });
    }

    newest
}
