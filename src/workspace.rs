//! Isolated workspaces where generated changes are applied and tested.
//!
//! A [`Workspace`] is an opaque directory root: every file read, write and
//! test invocation for a task goes through it. A [`Provisioner`] creates,
//! merges and removes those roots; [`WorktreeProvisioner`] backs each task
//! with its own git worktree and branch.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;

use crate::config::TestProbe;
use crate::core::{TaskId, TestResult};
use crate::git::GitOps;
use crate::util::blocking;
use crate::{wlog, wlog_debug, Error, Result};

/// Working directory root for one task's changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolve(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    /// Current contents of a file, `None` if it does not exist yet.
    pub async fn read_file(&self, relative: &str) -> Option<String> {
        match tokio::fs::read_to_string(self.resolve(relative)).await {
            Ok(content) => Some(content),
            Err(e) => {
                wlog_debug!("Treating {} as new file: {}", relative, e);
                None
            }
        }
    }

    /// Write a file, creating parent directories as needed.
    pub async fn write_file(&self, relative: &str, contents: &str) -> Result<()> {
        let path = self.resolve(relative);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, contents).await?;
        Ok(())
    }

    /// Register a changed file with git. Fails when the root is not a repository.
    pub async fn stage(&self, relative: &str) -> Result<()> {
        let root = self.root.clone();
        let relative = PathBuf::from(relative);
        blocking(move || GitOps::stage_path(&root, &relative)).await
    }

    /// Run a shell command with the workspace root as working directory.
    pub async fn run_command(&self, command: &str) -> Result<TestResult> {
        wlog_debug!("Running `{}` in {}", command, self.root.display());
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.root)
            .output()
            .await?;
        Ok(TestResult {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    /// The regression command for this workspace, from the first probe whose
    /// descriptor file exists at the root.
    pub fn regression_command<'a>(&self, probes: &'a [TestProbe]) -> Option<&'a str> {
        probes
            .iter()
            .find(|p| self.root.join(&p.descriptor).is_file())
            .map(|p| p.command.as_str())
    }
}

/// Creates and tears down per-task workspaces.
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn create(&self, task_id: &TaskId) -> Result<Workspace>;
    async fn merge(&self, task_id: &TaskId) -> Result<()>;
    async fn remove(&self, path: &Path, task_id: &TaskId) -> Result<()>;
}

/// One git worktree per task, on branch `weft/<task_id>`.
#[derive(Debug, Clone)]
pub struct WorktreeProvisioner {
    repo_path: PathBuf,
    worktrees_dir: PathBuf,
}

impl WorktreeProvisioner {
    pub fn new(repo_path: &Path, worktrees_dir: &Path) -> Self {
        Self {
            repo_path: repo_path.to_path_buf(),
            worktrees_dir: worktrees_dir.to_path_buf(),
        }
    }

    pub fn branch_name(task_id: &TaskId) -> String {
        format!("weft/{}", task_id)
    }

    pub fn worktree_path(&self, task_id: &TaskId) -> PathBuf {
        self.worktrees_dir.join(task_id.as_str())
    }

    /// Drop worktree references whose directories have disappeared.
    pub async fn prune(&self) -> Result<usize> {
        let repo = self.repo_path.clone();
        blocking(move || GitOps::new(&repo)?.prune_worktrees()).await
    }
}

#[async_trait]
impl Provisioner for WorktreeProvisioner {
    async fn create(&self, task_id: &TaskId) -> Result<Workspace> {
        let path = self.worktree_path(task_id);
        if path.exists() {
            wlog_debug!("Reusing worktree {}", path.display());
            return Ok(Workspace::new(path));
        }

        let repo = self.repo_path.clone();
        let dir = self.worktrees_dir.clone();
        let branch = Self::branch_name(task_id);
        let target = path.clone();
        blocking(move || {
            std::fs::create_dir_all(&dir)?;
            GitOps::new(&repo)?.create_worktree(&branch, &target)
        })
        .await
        .map_err(|e| Error::Setup(format!("Cannot provision workspace for {}: {}", task_id, e)))?;

        wlog!("Isolated workspace for {}: {}", task_id, path.display());
        Ok(Workspace::new(path))
    }

    async fn merge(&self, task_id: &TaskId) -> Result<()> {
        let repo = self.repo_path.clone();
        let path = self.worktree_path(task_id);
        let branch = Self::branch_name(task_id);
        let message = format!("weft: apply {}", task_id);
        blocking(move || {
            if path.exists() {
                GitOps::commit_all(&path, &message)?;
            }
            GitOps::new(&repo)?.merge_branch(&branch)
        })
        .await?;
        wlog!("Merged {} into main checkout", task_id);
        Ok(())
    }

    async fn remove(&self, path: &Path, task_id: &TaskId) -> Result<()> {
        let repo = self.repo_path.clone();
        let path = path.to_path_buf();
        let branch = Self::branch_name(task_id);
        blocking(move || {
            let git = GitOps::new(&repo)?;
            git.remove_worktree(&path)?;
            git.delete_branch(&branch)
        })
        .await?;
        wlog!("Removed workspace for {}", task_id);
        Ok(())
    }
}
