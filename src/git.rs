use std::path::{Path, PathBuf};

use git2::{
    build::CheckoutBuilder, BranchType, ErrorCode, IndexAddOption, MergeAnalysis, Repository,
    Signature, WorktreePruneOptions,
};

use crate::{wlog_debug, wlog_warn, Error, Result};

/// Git operations on the main repository and its task worktrees.
pub struct GitOps {
    repo_path: PathBuf,
}

impl GitOps {
    pub fn new(repo_path: &Path) -> Result<Self> {
        wlog_debug!("GitOps::new path={}", repo_path.display());
        let _ = Repository::discover(repo_path)?;
        Ok(Self {
            repo_path: repo_path.to_path_buf(),
        })
    }

    fn repo(&self) -> Result<Repository> {
        Ok(Repository::discover(&self.repo_path)?)
    }

    /// Working directory of the main checkout, even when opened from a worktree.
    pub fn main_root(&self) -> Result<PathBuf> {
        let repo = self.repo()?;
        let common = repo.commondir().to_path_buf();
        common
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| Error::Setup(format!("No main checkout for {}", common.display())))
    }

    pub fn create_worktree(&self, branch: &str, worktree_path: &Path) -> Result<()> {
        wlog_debug!(
            "GitOps::create_worktree branch={} path={}",
            branch,
            worktree_path.display()
        );
        let repo = self.repo()?;
        let commit = repo.head()?.peel_to_commit()?;
        let branch_ref = match repo.find_branch(branch, BranchType::Local) {
            Ok(existing) => existing.into_reference(),
            Err(e) if e.code() == ErrorCode::NotFound => {
                wlog_debug!("Creating branch {} from commit {}", branch, commit.id());
                repo.branch(branch, &commit, false)?.into_reference()
            }
            Err(e) => return Err(e.into()),
        };

        let mut opts = git2::WorktreeAddOptions::new();
        opts.reference(Some(&branch_ref));
        // Branch names contain slashes; the folder name is a safe worktree name.
        let worktree_name = worktree_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(branch);
        repo.worktree(worktree_name, worktree_path, Some(&opts))?;
        Ok(())
    }

    pub fn remove_worktree(&self, worktree_path: &Path) -> Result<()> {
        wlog_debug!("GitOps::remove_worktree path={}", worktree_path.display());
        let repo = self.repo()?;
        let folder_name = worktree_path
            .file_name()
            .and_then(|n| n.to_str())
            .map(String::from);

        if let Some(name) = &folder_name {
            if let Ok(worktree) = repo.find_worktree(name) {
                let _ = worktree.unlock();
                if let Err(e) = worktree.prune(Some(&mut prune_all())) {
                    wlog_warn!("Worktree prune failed for '{}': {}", name, e);
                }
            }
        }

        if worktree_path.exists() {
            std::fs::remove_dir_all(worktree_path)?;
        }

        // A leftover admin dir makes git think the branch is still checked out.
        if let Some(name) = &folder_name {
            let admin_dir = repo.path().join("worktrees").join(name);
            if admin_dir.exists() {
                let _ = std::fs::remove_dir_all(&admin_dir);
            }
        }
        Ok(())
    }

    /// Prune worktree references whose directories are gone. Returns the count.
    pub fn prune_worktrees(&self) -> Result<usize> {
        let repo = self.repo()?;
        let mut pruned = 0;
        for name in repo.worktrees()?.iter().flatten() {
            if let Ok(wt) = repo.find_worktree(name) {
                if !wt.path().exists() && wt.prune(Some(&mut prune_all())).is_ok() {
                    wlog_debug!("Pruned stale worktree reference: {}", name);
                    pruned += 1;
                }
            }
        }
        Ok(pruned)
    }

    pub fn list_worktrees(&self) -> Result<Vec<String>> {
        let repo = self.repo()?;
        Ok(repo
            .worktrees()?
            .iter()
            .flatten()
            .map(String::from)
            .collect())
    }

    /// Stage a single path (relative to the worktree root).
    pub fn stage_path(worktree_path: &Path, relative: &Path) -> Result<()> {
        let repo = Repository::open(worktree_path)?;
        let mut index = repo.index()?;
        index.add_path(relative)?;
        index.write()?;
        Ok(())
    }

    /// Commit everything in the worktree. Returns `None` when nothing changed.
    pub fn commit_all(worktree_path: &Path, message: &str) -> Result<Option<String>> {
        wlog_debug!(
            "GitOps::commit_all path={} message={}",
            worktree_path.display(),
            message
        );
        let repo = Repository::open(worktree_path)?;
        let mut index = repo.index()?;
        index.add_all(["."].iter(), IndexAddOption::DEFAULT, None)?;
        index.write()?;

        let tree_id = index.write_tree()?;
        let parent = match repo.head() {
            Ok(head) => Some(head.peel_to_commit()?),
            Err(e) if e.code() == ErrorCode::UnbornBranch => None,
            Err(e) => return Err(e.into()),
        };
        if let Some(parent) = &parent {
            if parent.tree_id() == tree_id {
                return Ok(None);
            }
        }

        let tree = repo.find_tree(tree_id)?;
        let sig = signature(&repo)?;
        let parents: Vec<&git2::Commit> = parent.iter().collect();
        let commit_id = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
        wlog_debug!("Commit created: {}", commit_id);
        Ok(Some(commit_id.to_string()))
    }

    /// Merge `branch` into the main checkout's current branch.
    ///
    /// Fast-forwards when possible, otherwise creates a merge commit.
    /// Conflicts abort the merge and leave the main checkout untouched.
    pub fn merge_branch(&self, branch: &str) -> Result<()> {
        let root = self.main_root()?;
        wlog_debug!("GitOps::merge_branch branch={} into={}", branch, root.display());
        let repo = Repository::open(&root)?;
        let branch_ref = repo.find_branch(branch, BranchType::Local)?.into_reference();
        let annotated = repo.reference_to_annotated_commit(&branch_ref)?;
        let (analysis, _) = repo.merge_analysis(&[&annotated])?;

        if analysis.contains(MergeAnalysis::ANALYSIS_UP_TO_DATE) {
            wlog_debug!("Branch {} already merged", branch);
            return Ok(());
        }

        let theirs = repo.find_commit(annotated.id())?;
        if analysis.contains(MergeAnalysis::ANALYSIS_FASTFORWARD) {
            repo.checkout_tree(theirs.as_object(), Some(CheckoutBuilder::new().safe()))?;
            let mut head = repo.head()?;
            head.set_target(theirs.id(), &format!("weft: fast-forward {}", branch))?;
            return Ok(());
        }

        let ours = repo.head()?.peel_to_commit()?;
        let mut index = repo.merge_commits(&ours, &theirs, None)?;
        if index.has_conflicts() {
            return Err(Error::MergeConflict(branch.to_string()));
        }
        let tree_id = index.write_tree_to(&repo)?;
        let tree = repo.find_tree(tree_id)?;
        repo.checkout_tree(tree.as_object(), Some(CheckoutBuilder::new().safe()))?;
        let sig = signature(&repo)?;
        repo.commit(
            Some("HEAD"),
            &sig,
            &sig,
            &format!("Merge branch '{}'", branch),
            &tree,
            &[&ours, &theirs],
        )?;
        Ok(())
    }

    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let repo = self.repo()?;
        // Bound so the branch temporary drops before `repo`.
        let exists = match repo.find_branch(branch, BranchType::Local) {
            Ok(_) => Ok(true),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        };
        exists
    }

    /// Delete a local branch. Missing branches and delete failures are logged, not raised.
    pub fn delete_branch(&self, branch: &str) -> Result<()> {
        let repo = self.repo()?;
        match repo.find_branch(branch, BranchType::Local) {
            Ok(mut branch_ref) => {
                if let Err(e) = branch_ref.delete() {
                    wlog_warn!("Failed to delete branch '{}': {}", branch, e);
                }
            }
            Err(e) if e.code() == ErrorCode::NotFound => {
                wlog_debug!("Branch '{}' not found (already deleted?)", branch);
            }
            Err(e) => {
                wlog_warn!("Error looking up branch '{}': {}", branch, e);
            }
        }
        Ok(())
    }
}

fn prune_all() -> WorktreePruneOptions {
    let mut opts = WorktreePruneOptions::new();
    opts.valid(true).working_tree(true).locked(true);
    opts
}

fn signature(repo: &Repository) -> Result<Signature<'static>> {
    Ok(repo
        .signature()
        .or_else(|_| Signature::now("weft", "weft@localhost"))?)
}
