//! Worktree provisioning tests against real git repositories.

use weft::core::TaskId;
use weft::workspace::{Provisioner, WorktreeProvisioner};
use weft::ErrorKind;

use crate::fixtures::{git, TestRepo};

/// Test: Provision and reuse
/// Given a repository
/// When a workspace is provisioned twice for the same task
/// Then the same worktree on branch weft/<id> is returned
#[tokio::test]
async fn test_create_worktree_and_reuse() {
    let repo = TestRepo::new();
    let provisioner = repo.provisioner();
    let task = TaskId::from("task_a");

    let ws = provisioner.create(&task).await.unwrap();
    assert!(ws.root().join("README.md").exists());
    assert!(repo.branch_exists("weft/task_a"));
    assert_eq!(
        git(ws.root(), &["rev-parse", "--abbrev-ref", "HEAD"]),
        "weft/task_a"
    );

    std::fs::write(ws.root().join("scratch.txt"), "keep me").unwrap();
    let again = provisioner.create(&task).await.unwrap();
    assert_eq!(again.root(), ws.root());
    assert!(again.root().join("scratch.txt").exists());
}

/// Test: Merge and remove
/// Given a workspace with a generated file
/// When merged and removed
/// Then the file is on the main branch and the worktree and branch are gone
#[tokio::test]
async fn test_merge_then_remove() {
    let repo = TestRepo::new();
    let provisioner = repo.provisioner();
    let task = TaskId::from("task_m");
    let before = repo.commit_count();

    let ws = provisioner.create(&task).await.unwrap();
    ws.write_file("src/new.rs", "pub fn new() {}\n").await.unwrap();
    ws.stage("src/new.rs").await.unwrap();

    provisioner.merge(&task).await.unwrap();
    assert_eq!(repo.read("src/new.rs").as_deref(), Some("pub fn new() {}\n"));
    assert_eq!(repo.commit_count(), before + 1);
    assert!(git(&repo.path, &["log", "-1", "--format=%s"]).contains("weft: apply task_m"));

    let path = provisioner.worktree_path(&task);
    provisioner.remove(&path, &task).await.unwrap();
    assert!(!path.exists());
    assert!(!repo.branch_exists("weft/task_m"));
}

/// Test: Diverged merge
/// Given main and the task branch both changed different files
/// When merged
/// Then a merge commit joins them
#[tokio::test]
async fn test_merge_creates_merge_commit_when_diverged() {
    let repo = TestRepo::new();
    let provisioner = repo.provisioner();
    let task = TaskId::from("task_d");

    let ws = provisioner.create(&task).await.unwrap();
    ws.write_file("task.txt", "from task\n").await.unwrap();
    repo.create_and_commit("main.txt", "from main\n", "Main work");

    provisioner.merge(&task).await.unwrap();
    assert_eq!(repo.read("task.txt").as_deref(), Some("from task\n"));
    assert_eq!(repo.read("main.txt").as_deref(), Some("from main\n"));
    assert_eq!(
        git(&repo.path, &["log", "-1", "--format=%s"]),
        "Merge branch 'weft/task_d'"
    );
}

/// Test: Conflicting merge
/// Given main and the task branch both rewrote README.md
/// When merged
/// Then a merge conflict is reported and main keeps its content
#[tokio::test]
async fn test_merge_conflict_is_reported() {
    let repo = TestRepo::new();
    let provisioner = repo.provisioner();
    let task = TaskId::from("task_x");

    let ws = provisioner.create(&task).await.unwrap();
    ws.write_file("README.md", "# Task version\n").await.unwrap();
    repo.create_and_commit("README.md", "# Main version\n", "Main README");

    let err = provisioner.merge(&task).await.unwrap_err();
    assert!(matches!(err, weft::Error::MergeConflict(_)));
    assert_eq!(err.kind(), ErrorKind::Other);
    assert_eq!(repo.read("README.md").as_deref(), Some("# Main version\n"));
}

/// Test: Prune stale references
/// Given a worktree whose directory was deleted by hand
/// When pruned
/// Then exactly one reference is removed
#[tokio::test]
async fn test_prune_after_manual_removal() {
    let repo = TestRepo::new();
    let provisioner = repo.provisioner();
    let task = TaskId::from("task_p");

    provisioner.create(&task).await.unwrap();
    provisioner.create(&TaskId::from("task_live")).await.unwrap();
    std::fs::remove_dir_all(provisioner.worktree_path(&task)).unwrap();

    assert_eq!(provisioner.prune().await.unwrap(), 1);
    assert_eq!(repo.git_ops().unwrap().list_worktrees().unwrap().len(), 1);
    assert_eq!(WorktreeProvisioner::branch_name(&task), "weft/task_p");
}
