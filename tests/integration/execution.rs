//! Batch executor integration tests.
//!
//! Plans are planned, then executed against a scripted generator. Test
//! and regression commands are `sh -c` one-liners that inspect the files
//! the executor wrote.

use std::sync::Arc;

use tempfile::TempDir;
use tokio::sync::mpsc;

use weft::config::TestProbe;
use weft::core::{plan_batches, Caution, TaskId};
use weft::orchestration::{BatchExecutor, ExecutorEvent, SnapshotStore, StepExecutor};
use weft::workspace::{Provisioner, Workspace};
use weft::{Error, ErrorKind};

use crate::fixtures::{diamond_steps, fenced, git, step, ScriptedGenerator, TestRepo};

/// Test: Step self-healing
/// Given a step whose test fails on the first output and passes on the second
/// When executed as a one-step plan
/// Then the run succeeds with exit code 0 and the generator is called twice
#[tokio::test]
async fn test_step_test_fails_once_then_passes() {
    let tmp = TempDir::new().unwrap();
    let ws = Workspace::new(tmp.path());
    let gen = Arc::new(
        ScriptedGenerator::new().on("Write the version", &[&fenced("v0"), &fenced("v1")]),
    );
    let steps = vec![step(1, "Write the version", &["VERSION"], &[])
        .with_test("grep -q v1 VERSION || { echo expected v1; exit 1; }")];
    let batches = plan_batches(&steps).unwrap();

    let executor = BatchExecutor::new(StepExecutor::new(gen.clone()), vec![]);
    let reports = executor
        .execute_batches(&batches, &[], &TaskId::from("task_heal"), &ws)
        .await
        .unwrap();

    assert_eq!(reports.len(), 1);
    let test = reports[0].result.test_result.as_ref().unwrap();
    assert_eq!(test.exit_code, 0);
    assert_eq!(gen.calls("Write the version"), 2);
    assert_eq!(std::fs::read_to_string(tmp.path().join("VERSION")).unwrap(), "v1\n");

    let retry_prompt = &gen.prompts_for("Write the version")[1];
    assert!(retry_prompt.contains("expected v1"));
    assert!(retry_prompt.contains("v0"));
}

/// Test: Persistent regression failure
/// Given a batch of two steps and a regression suite that always fails
/// When executed
/// Then the run aborts and each step was generated exactly twice
#[tokio::test]
async fn test_regression_fails_twice_aborts() {
    let tmp = TempDir::new().unwrap();
    std::fs::write(tmp.path().join("Makefile"), "").unwrap();
    let ws = Workspace::new(tmp.path());
    let gen = Arc::new(
        ScriptedGenerator::new()
            .on("Create module a", &[&fenced("a")])
            .on("Create module b", &[&fenced("b")]),
    );
    let steps = vec![
        step(1, "Create module a", &["src/a.rs"], &[]),
        step(2, "Create module b", &["src/b.rs"], &[]),
        step(3, "Never reached", &["src/c.rs"], &[1]),
    ];
    let batches = plan_batches(&steps).unwrap();
    let executor = BatchExecutor::new(
        StepExecutor::new(gen.clone()),
        vec![TestProbe::new("Makefile", "echo suite broken >&2; exit 2")],
    );

    let err = executor
        .execute_batches(&batches, &[], &TaskId::from("task_reg"), &ws)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::RegressionFailure);
    match err {
        Error::RegressionFailure { batch, output } => {
            assert_eq!(batch, 1);
            assert!(output.contains("suite broken"));
        }
        other => panic!("Expected RegressionFailure, got {other:?}"),
    }
    assert_eq!(gen.calls("Create module a"), 2);
    assert_eq!(gen.calls("Create module b"), 2);
    assert_eq!(gen.calls("Never reached"), 0);

    // Completed writes stay in place.
    assert!(tmp.path().join("src/a.rs").exists());

    let retry = &gen.prompts_for("Create module a")[1];
    assert!(retry.contains("suite broken"));
}

/// Test: Descriptor created mid-plan
/// Given a first batch that creates the project descriptor and a red suite
/// When executed
/// Then the regression check runs after that batch and the plan aborts
#[tokio::test]
async fn test_regression_check_after_descriptor_created() {
    let tmp = TempDir::new().unwrap();
    let ws = Workspace::new(tmp.path());
    let gen = Arc::new(
        ScriptedGenerator::new()
            .on("Write the makefile", &[&fenced("all:")])
            .on("Add the build target", &[&fenced("build")]),
    );
    let steps = vec![
        step(1, "Write the makefile", &["Makefile"], &[]),
        step(2, "Add the build target", &["build.mk"], &[1]),
    ];
    let batches = plan_batches(&steps).unwrap();
    assert_eq!(batches.len(), 2);
    let executor = BatchExecutor::new(
        StepExecutor::new(gen.clone()),
        vec![TestProbe::new("Makefile", "echo suite red; exit 1")],
    );

    let err = executor
        .execute_batches(&batches, &[], &TaskId::from("task_new"), &ws)
        .await
        .unwrap_err();

    match err {
        Error::RegressionFailure { batch, output } => {
            assert_eq!(batch, 1);
            assert!(output.contains("suite red"));
        }
        other => panic!("Expected RegressionFailure, got {other:?}"),
    }
    assert_eq!(gen.calls("Write the makefile"), 2);
    assert_eq!(gen.calls("Add the build target"), 0);
}

/// Test: Regression recovery carries the caution forward
/// Given a suite that passes only once module b says "ok"
/// When the first generation of b is wrong
/// Then the batch is regenerated once and later batches see the caution
#[tokio::test]
async fn test_regression_retry_recovers() {
    let tmp = TempDir::new().unwrap();
    std::fs::write(tmp.path().join("Makefile"), "").unwrap();
    let ws = Workspace::new(tmp.path());
    let gen = Arc::new(
        ScriptedGenerator::new()
            .on("Create module a", &[&fenced("a")])
            .on("Create module b", &[&fenced("bad"), &fenced("ok")])
            .on("Wire a and b", &[&fenced("lib")]),
    );
    let (tx, mut rx) = mpsc::channel(100);
    let executor = BatchExecutor::new(
        StepExecutor::new(gen.clone()).with_events(tx),
        vec![TestProbe::new(
            "Makefile",
            "grep -q ok src/b.rs || { echo b is wrong; exit 1; }",
        )],
    );
    let batches = plan_batches(&diamond_steps()).unwrap();
    let cautions = vec![Caution::new("style", "keep modules small")];

    let reports = executor
        .execute_batches(&batches, &cautions, &TaskId::from("task_ok"), &ws)
        .await
        .unwrap();

    assert_eq!(reports.len(), 3);
    assert_eq!(gen.calls("Create module a"), 2);
    assert_eq!(gen.calls("Create module b"), 2);
    assert_eq!(gen.calls("Wire a and b"), 1);
    let wire = &gen.prompts_for("Wire a and b")[0];
    assert!(wire.contains("keep modules small"));
    assert!(wire.contains("b is wrong"));

    drop(executor);
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    assert!(events.contains(&ExecutorEvent::BatchRetried { batch: 1 }));
    assert!(events.contains(&ExecutorEvent::BatchCompleted { batch: 2 }));
    assert_eq!(
        events.iter().filter(|e| matches!(e, ExecutorEvent::RegressionFailed { .. })).count(),
        1
    );
    assert_eq!(events.last(), Some(&ExecutorEvent::AllBatchesComplete));
}

/// Test: Ambiguity is not an error
/// Given one step that asks for clarification and one that writes code
/// When executed in the same batch
/// Then the ambiguous step writes nothing and the run still succeeds
#[tokio::test]
async fn test_ambiguous_step_is_reported_not_fatal() {
    let tmp = TempDir::new().unwrap();
    let ws = Workspace::new(tmp.path());
    let gen = Arc::new(
        ScriptedGenerator::new()
            .on("Create module a", &["AMBIGUITY: which error type should a use?"])
            .on("Create module b", &[&fenced("pub fn b() {}")]),
    );
    let steps = vec![
        step(1, "Create module a", &["src/a.rs"], &[]).with_test("false"),
        step(2, "Create module b", &["src/b.rs"], &[]),
    ];
    let batches = plan_batches(&steps).unwrap();
    let executor = BatchExecutor::new(StepExecutor::new(gen.clone()), vec![]);

    let reports = executor
        .execute_batches(&batches, &[], &TaskId::from("task_amb"), &ws)
        .await
        .unwrap();

    let a = reports.iter().find(|r| r.step.to_string() == "1").unwrap();
    assert!(a.result.is_ambiguous());
    assert!(a.result.test_result.is_none());
    assert!(!tmp.path().join("src/a.rs").exists());
    assert_eq!(
        std::fs::read_to_string(tmp.path().join("src/b.rs")).unwrap(),
        "pub fn b() {}\n"
    );
    assert_eq!(gen.calls("Create module a"), 1);
}

/// Test: Generation failure in one step
/// Given a batch where one step's generator call fails
/// When executed
/// Then siblings still finish before the error is returned
#[tokio::test]
async fn test_generation_error_waits_for_siblings() {
    use async_trait::async_trait;
    use weft::orchestration::{Generation, Generator};

    struct HalfBroken;

    #[async_trait]
    impl Generator for HalfBroken {
        async fn generate(&self, prompt: &str) -> weft::Result<Generation> {
            if prompt.contains("broken step") {
                return Err(Error::Generation("backend down".into()));
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            Ok(Generation::from_text("```\nslow\n```"))
        }
    }

    let tmp = TempDir::new().unwrap();
    let ws = Workspace::new(tmp.path());
    let steps = vec![
        step(1, "broken step", &["one.txt"], &[]),
        step(2, "slow step", &["two.txt"], &[]),
    ];
    let batches = plan_batches(&steps).unwrap();
    let executor = BatchExecutor::new(StepExecutor::new(Arc::new(HalfBroken)), vec![]);

    let err = executor
        .execute_batches(&batches, &[], &TaskId::from("t"), &ws)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Generation(_)));
    assert_eq!(
        std::fs::read_to_string(tmp.path().join("two.txt")).unwrap(),
        "slow\n"
    );
}

/// Test: Execution inside a provisioned worktree
/// Given a git repository and a worktree provisioned for the task
/// When a plan runs with snapshots enabled
/// Then generated files are staged in the worktree and snapshots are written
#[tokio::test]
async fn test_plan_runs_in_worktree_with_snapshots() {
    let repo = TestRepo::new();
    let snapshots = TempDir::new().unwrap();
    let task = TaskId::from("task_wt");
    let ws = repo.provisioner().create(&task).await.unwrap();

    let gen = Arc::new(ScriptedGenerator::new().with_default(&fenced("generated")));
    let executor = BatchExecutor::new(
        StepExecutor::new(gen.clone()).with_snapshots(SnapshotStore::new(snapshots.path())),
        vec![],
    );
    let batches = plan_batches(&diamond_steps()).unwrap();
    executor
        .execute_batches(&batches, &[], &task, &ws)
        .await
        .unwrap();

    let status = git(ws.root(), &["status", "--porcelain"]);
    assert!(status.contains("A  src/a.rs"));
    assert!(status.contains("A  src/lib.rs"));
    assert!(repo.read("src/a.rs").is_none());

    let task_dir = snapshots.path().join("task_wt");
    for id in 1..=3 {
        assert!(task_dir.join(format!("step_{id}_input.md")).exists());
        assert!(task_dir.join(format!("step_{id}_meta.json")).exists());
    }
}
