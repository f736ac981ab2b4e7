//! On-disk record of every generation request and response.
//!
//! Layout: `<root>/<task_id>/<prefix>_input.md`, `<prefix>_output_raw.txt`
//! and `<prefix>_meta.json`.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::core::TaskId;
use crate::{wlog, wlog_debug, Result};

/// Snapshots older than this many days are removed by default.
pub const DEFAULT_RETENTION_DAYS: u64 = 7;

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotMeta {
    pub step_id: String,
    pub attempt: u32,
    pub duration_ms: u64,
    pub ambiguous: bool,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn task_dir(&self, task_id: &TaskId) -> PathBuf {
        self.root.join(task_id.as_str())
    }

    /// Write one prompt/response pair. Returns the task's snapshot directory.
    pub async fn save(
        &self,
        task_id: &TaskId,
        prefix: &str,
        input: &str,
        output_raw: &str,
        meta: &SnapshotMeta,
    ) -> Result<PathBuf> {
        let dir = self.task_dir(task_id);
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join(format!("{prefix}_input.md")), input).await?;
        tokio::fs::write(dir.join(format!("{prefix}_output_raw.txt")), output_raw).await?;
        let meta_json = serde_json::to_string_pretty(meta)?;
        tokio::fs::write(dir.join(format!("{prefix}_meta.json")), meta_json).await?;
        wlog_debug!("Snapshot {} saved under {}", prefix, dir.display());
        Ok(dir)
    }

    /// Remove task snapshot directories not modified for `days` days.
    ///
    /// A missing root is not an error. Returns the removed directory names.
    pub fn clean(&self, days: u64) -> Result<Vec<String>> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut dirs = Vec::new();
        for entry in entries.flatten() {
            let Ok(meta) = entry.metadata() else { continue };
            if !meta.is_dir() {
                continue;
            }
            if let Ok(mtime) = meta.modified() {
                dirs.push((entry.file_name().to_string_lossy().into_owned(), mtime));
            }
        }

        let stale = stale_entries(&dirs, days, SystemTime::now());
        for name in &stale {
            std::fs::remove_dir_all(self.root.join(name))?;
            wlog!("Removed old snapshot: {}", name);
        }
        Ok(stale)
    }
}

/// Names whose modification time is at least `days` days before `now`, sorted.
pub fn stale_entries(entries: &[(String, SystemTime)], days: u64, now: SystemTime) -> Vec<String> {
    let threshold = Duration::from_secs(days * 24 * 60 * 60);
    let mut stale: Vec<String> = entries
        .iter()
        .filter(|(_, mtime)| now.duration_since(*mtime).unwrap_or_default() >= threshold)
        .map(|(name, _)| name.clone())
        .collect();
    stale.sort();
    stale
}
