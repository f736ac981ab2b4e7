//! Filesystem-backed task queue.
//!
//! Each queued step is one JSON file named `<task_id>_step_<step_id>.json`.
//! Its state is the directory it sits in (`todo/`, `doing/`, `done/`,
//! `failed/`); transitions are renames, so the filename never changes.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::core::{plan_batches, Plan, Step, TaskId};
use crate::{wlog, wlog_debug, wlog_warn, Error, Result};

/// Position of a queued step in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueState {
    Todo,
    Doing,
    Done,
    Failed,
}

impl QueueState {
    pub const ALL: [QueueState; 4] = [
        QueueState::Todo,
        QueueState::Doing,
        QueueState::Done,
        QueueState::Failed,
    ];

    pub fn dir_name(&self) -> &'static str {
        match self {
            QueueState::Todo => "todo",
            QueueState::Doing => "doing",
            QueueState::Done => "done",
            QueueState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for QueueState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Location of the four state directories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuePaths {
    root: PathBuf,
}

impl QueuePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dir(&self, state: QueueState) -> PathBuf {
        self.root.join(state.dir_name())
    }

    pub fn file(&self, state: QueueState, filename: &str) -> PathBuf {
        self.dir(state).join(filename)
    }
}

/// A step as persisted in the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueTask {
    pub task_id: TaskId,
    #[serde(flatten)]
    pub step: Step,
    pub enqueued_at: String,
}

impl QueueTask {
    pub fn filename(task_id: &TaskId, step: &Step) -> String {
        format!("{}_step_{}.json", task_id, step.id)
    }
}

/// Number of task files in each state.
pub type QueueCounts = BTreeMap<QueueState, usize>;

#[derive(Debug, Clone)]
pub struct TaskQueue {
    paths: QueuePaths,
}

impl TaskQueue {
    pub fn new(paths: QueuePaths) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &QueuePaths {
        &self.paths
    }

    /// Create all state directories. Idempotent; a refusal is a setup fault.
    pub async fn init_dirs(&self) -> Result<()> {
        for state in QueueState::ALL {
            let dir = self.paths.dir(state);
            tokio::fs::create_dir_all(&dir).await.map_err(|e| {
                Error::Setup(format!(
                    "Failed to create queue directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    /// Write a step into `todo/`. Returns the task filename.
    pub async fn enqueue(&self, task_id: &TaskId, step: &Step) -> Result<String> {
        let filename = QueueTask::filename(task_id, step);
        let task = QueueTask {
            task_id: task_id.clone(),
            step: step.clone(),
            enqueued_at: Utc::now().to_rfc3339(),
        };
        let json = serde_json::to_string_pretty(&task)?;
        tokio::fs::write(self.paths.file(QueueState::Todo, &filename), json)
            .await
            .map_err(|e| Error::Setup(format!("Failed to enqueue task: {} - {}", filename, e)))?;
        wlog!("Enqueued {}", filename);
        Ok(filename)
    }

    /// Enqueue every step of a valid plan, in batch order.
    pub async fn enqueue_plan(&self, task_id: &TaskId, plan: &Plan) -> Result<Vec<String>> {
        let batches = plan_batches(&plan.steps)?;
        let mut filenames = Vec::with_capacity(plan.steps.len());
        for step in batches.iter().flat_map(|b| b.steps.iter()) {
            filenames.push(self.enqueue(task_id, step).await?);
        }
        Ok(filenames)
    }

    /// Rename a task file between state directories.
    ///
    /// A missing source usually means another worker already claimed it.
    pub async fn move_task(&self, filename: &str, from: QueueState, to: QueueState) -> Result<()> {
        let src = self.paths.file(from, filename);
        let dst = self.paths.file(to, filename);
        tokio::fs::rename(&src, &dst)
            .await
            .map_err(|e| Error::QueueIo {
                filename: filename.to_string(),
                from,
                to,
                message: e.to_string(),
            })?;
        wlog_debug!("Moved {} ({} -> {})", filename, from, to);
        Ok(())
    }

    /// Move every file of `task_id` from one state to another.
    ///
    /// Best effort: failures are logged and the remaining files still move.
    /// Returns the number of files moved.
    pub async fn move_all_steps(&self, task_id: &TaskId, from: QueueState, to: QueueState) -> usize {
        let files = match self.list(from).await {
            Ok(files) => files,
            Err(e) => {
                wlog_warn!("Error while moving queue entries ({} -> {}): {}", from, to, e);
                return 0;
            }
        };

        let mut moved = 0;
        for file in files.iter().filter(|f| f.starts_with(task_id.as_str())) {
            match self.move_task(file, from, to).await {
                Ok(()) => moved += 1,
                Err(e) => wlog_warn!("{}", e),
            }
        }
        moved
    }

    /// Sorted `.json` filenames in a state directory.
    pub async fn list(&self, state: QueueState) -> Result<Vec<String>> {
        let mut entries = tokio::fs::read_dir(self.paths.dir(state)).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(".json") {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    pub async fn read_task(&self, state: QueueState, filename: &str) -> Result<QueueTask> {
        let content = tokio::fs::read_to_string(self.paths.file(state, filename)).await?;
        Ok(serde_json::from_str(&content)?)
    }

    pub async fn counts(&self) -> Result<QueueCounts> {
        let mut counts = QueueCounts::new();
        for state in QueueState::ALL {
            counts.insert(state, self.list(state).await?.len());
        }
        Ok(counts)
    }
}
