//! Queue worker loop.
//!
//! The worker claims one task at a time: `todo -> doing`, run the step in a
//! workspace provisioned for the task's id, then `doing -> done` or
//! `doing -> failed`. What to do next is decided by a [`SchedulingPolicy`]:
//! [`DrainPolicy`] executes whatever is first in `todo/`, [`OraclePolicy`]
//! asks the generator.

use async_trait::async_trait;
use notify::{Config as WatchConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::store::{QueueCounts, QueueState, TaskQueue};
use crate::config::DEFAULT_POLL_INTERVAL_MS;
use crate::orchestration::executor::StepExecutor;
use crate::orchestration::generator::{json_span, Generator};
use crate::orchestration::prompt::extract_code_block;
use crate::orchestration::snapshot::SnapshotStore;
use crate::util::blocking;
use crate::workspace::{Provisioner, WorktreeProvisioner};
use crate::{wlog, wlog_debug, wlog_error, wlog_warn, Error, Result};

/// Reports kept in the oracle prompt.
const ORACLE_HISTORY_LEN: usize = 10;

/// Next thing the worker should do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerAction {
    Wait,
    Execute(String),
    SelfMaintenance,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub action: WorkerAction,
    pub reasoning: Option<String>,
}

impl Decision {
    pub fn new(action: WorkerAction) -> Self {
        Self {
            action,
            reasoning: None,
        }
    }
}

/// What a policy sees when deciding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStatus {
    pub counts: QueueCounts,
    /// Sorted filenames in `todo/`.
    pub todo: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Done,
    Failed(String),
}

#[async_trait]
pub trait SchedulingPolicy: Send + Sync {
    async fn decide(&self, status: &QueueStatus) -> Result<Decision>;

    /// Called after each executed task.
    async fn report(&self, _filename: &str, _outcome: &TaskOutcome) {}
}

/// Execute the first pending task; wait when there is none.
#[derive(Debug, Default)]
pub struct DrainPolicy;

#[async_trait]
impl SchedulingPolicy for DrainPolicy {
    async fn decide(&self, status: &QueueStatus) -> Result<Decision> {
        Ok(Decision::new(match status.todo.first() {
            Some(file) => WorkerAction::Execute(file.clone()),
            None => WorkerAction::Wait,
        }))
    }
}

/// Defers the decision to the generator.
pub struct OraclePolicy {
    generator: Arc<dyn Generator>,
    history: Mutex<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct RawDecision {
    action: String,
    #[serde(default)]
    task_file: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
}

impl OraclePolicy {
    pub fn new(generator: Arc<dyn Generator>) -> Self {
        Self {
            generator,
            history: Mutex::new(Vec::new()),
        }
    }

    pub fn build_prompt(&self, status: &QueueStatus) -> String {
        let counts = QueueState::ALL
            .iter()
            .map(|s| format!("- {}: {}", s, status.counts.get(s).copied().unwrap_or(0)))
            .collect::<Vec<_>>()
            .join("\n");
        let pending = if status.todo.is_empty() {
            "(none)".to_string()
        } else {
            status
                .todo
                .iter()
                .map(|f| format!("- {}", f))
                .collect::<Vec<_>>()
                .join("\n")
        };
        let history = match self.history.lock() {
            Ok(h) if !h.is_empty() => h.join("\n"),
            _ => "(none)".to_string(),
        };

        format!(
            "You schedule an autonomous coding worker. Decide its next action.\n\n\
             ## Queue status\n{counts}\n\n\
             ## Pending tasks\n{pending}\n\n\
             ## Recent reports\n{history}\n\n\
             ## Reply\n\
             Reply with one JSON object in a fenced block:\n\
             {{\"action\": \"WAIT\" | \"EXECUTE_TASK\" | \"SELF_MAINTENANCE\", \
             \"task_file\": \"<pending file, for EXECUTE_TASK>\", \
             \"reasoning\": \"<one sentence>\"}}\n"
        )
    }
}

/// Parse an oracle reply. Anything unusable becomes `WAIT`.
pub fn parse_decision(text: &str) -> Decision {
    let block = extract_code_block(text);
    let raw = json_span(&block)
        .and_then(|span| serde_json::from_str::<RawDecision>(span).ok());
    let Some(raw) = raw else {
        wlog_warn!("Unreadable oracle reply, waiting: {}", text.trim());
        return Decision::new(WorkerAction::Wait);
    };

    let action = match (raw.action.to_ascii_uppercase().as_str(), raw.task_file) {
        ("EXECUTE_TASK", Some(file)) if !file.trim().is_empty() => {
            WorkerAction::Execute(file.trim().to_string())
        }
        ("SELF_MAINTENANCE", _) => WorkerAction::SelfMaintenance,
        ("WAIT", _) => WorkerAction::Wait,
        (other, _) => {
            wlog_warn!("Oracle action {} unusable, waiting", other);
            WorkerAction::Wait
        }
    };
    Decision {
        action,
        reasoning: raw.reasoning,
    }
}

#[async_trait]
impl SchedulingPolicy for OraclePolicy {
    async fn decide(&self, status: &QueueStatus) -> Result<Decision> {
        let prompt = self.build_prompt(status);
        let generation = self.generator.generate(&prompt).await?;
        let decision = parse_decision(&generation.text);
        if let Some(reason) = &decision.reasoning {
            wlog!("Oracle: {:?} ({})", decision.action, reason);
        }
        Ok(decision)
    }

    async fn report(&self, filename: &str, outcome: &TaskOutcome) {
        let line = match outcome {
            TaskOutcome::Done => format!("TASK_COMPLETED: {}", filename),
            TaskOutcome::Failed(reason) => format!("TASK_FAILED: {} ({})", filename, reason),
        };
        if let Ok(mut history) = self.history.lock() {
            history.push(line);
            let excess = history.len().saturating_sub(ORACLE_HISTORY_LEN);
            history.drain(..excess);
        }
    }
}

/// Housekeeping run on `SELF_MAINTENANCE`.
#[async_trait]
pub trait MaintenanceHook: Send + Sync {
    async fn run(&self) -> Result<()>;
}

/// Removes stale snapshots and prunes dead worktree references.
pub struct Housekeeping {
    pub snapshots: Option<SnapshotStore>,
    pub retention_days: u64,
    pub worktrees: Option<WorktreeProvisioner>,
}

#[async_trait]
impl MaintenanceHook for Housekeeping {
    async fn run(&self) -> Result<()> {
        if let Some(store) = self.snapshots.clone() {
            let days = self.retention_days;
            let removed = blocking(move || store.clean(days)).await?;
            wlog!("Maintenance removed {} snapshot directories", removed.len());
        }
        if let Some(worktrees) = &self.worktrees {
            let pruned = worktrees.prune().await?;
            wlog!("Maintenance pruned {} worktree references", pruned);
        }
        Ok(())
    }
}

/// Result of one scheduling cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tick {
    Idle,
    Executed { filename: String, outcome: TaskOutcome },
    Maintained,
}

pub struct Worker {
    queue: TaskQueue,
    executor: StepExecutor,
    provisioner: Arc<dyn Provisioner>,
    policy: Box<dyn SchedulingPolicy>,
    maintenance: Option<Box<dyn MaintenanceHook>>,
    poll_interval: Duration,
    fail_on_clarification: bool,
}

impl Worker {
    pub fn new(queue: TaskQueue, executor: StepExecutor, provisioner: Arc<dyn Provisioner>) -> Self {
        Self {
            queue,
            executor,
            provisioner,
            policy: Box::new(DrainPolicy),
            maintenance: None,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            fail_on_clarification: false,
        }
    }

    pub fn with_policy(mut self, policy: Box<dyn SchedulingPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_maintenance(mut self, hook: Box<dyn MaintenanceHook>) -> Self {
        self.maintenance = Some(hook);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Send steps that came back with a clarification request to `failed/`
    /// instead of `done/`.
    pub fn with_fail_on_clarification(mut self, enabled: bool) -> Self {
        self.fail_on_clarification = enabled;
        self
    }

    pub async fn status(&self) -> Result<QueueStatus> {
        Ok(QueueStatus {
            counts: self.queue.counts().await?,
            todo: self.queue.list(QueueState::Todo).await?,
        })
    }

    /// Ask the policy once and act on its decision.
    pub async fn tick(&self) -> Result<Tick> {
        let status = self.status().await?;
        let decision = self.policy.decide(&status).await?;
        match decision.action {
            WorkerAction::Wait => Ok(Tick::Idle),
            WorkerAction::SelfMaintenance => {
                if let Some(hook) = &self.maintenance {
                    if let Err(e) = hook.run().await {
                        wlog_warn!("Maintenance failed: {}", e);
                    }
                } else {
                    wlog_debug!("No maintenance hook configured");
                }
                Ok(Tick::Maintained)
            }
            WorkerAction::Execute(filename) => {
                if !status.todo.contains(&filename) {
                    wlog_warn!("Requested task {} is not pending", filename);
                    return Ok(Tick::Idle);
                }
                match self.process(&filename).await {
                    Ok(outcome) => {
                        self.policy.report(&filename, &outcome).await;
                        Ok(Tick::Executed { filename, outcome })
                    }
                    Err(e) => {
                        wlog_warn!("Could not claim {}: {}", filename, e);
                        Ok(Tick::Idle)
                    }
                }
            }
        }
    }

    /// Claim and execute one task file from `todo/`.
    ///
    /// Only a failed claim is returned as an error; execution failures end
    /// in `failed/` and are reported as [`TaskOutcome::Failed`]. A task whose
    /// final move fails keeps its outcome and stays in `doing/`.
    pub async fn process(&self, filename: &str) -> Result<TaskOutcome> {
        wlog!("New task detected: {}", filename);
        self.queue
            .move_task(filename, QueueState::Todo, QueueState::Doing)
            .await?;

        let outcome = match self.execute(filename).await {
            Ok(()) => TaskOutcome::Done,
            Err(e) => TaskOutcome::Failed(e.to_string()),
        };

        match &outcome {
            TaskOutcome::Done => {
                match self
                    .queue
                    .move_task(filename, QueueState::Doing, QueueState::Done)
                    .await
                {
                    Ok(()) => wlog!("Task completed: {}", filename),
                    Err(e) => {
                        wlog_error!("Critical: failed to move {} to done queue: {}", filename, e)
                    }
                }
            }
            TaskOutcome::Failed(reason) => {
                wlog_error!("Task failed: {} - {}", filename, reason);
                if let Err(e) = self
                    .queue
                    .move_task(filename, QueueState::Doing, QueueState::Failed)
                    .await
                {
                    wlog_error!("Critical: failed to move {} to failed queue: {}", filename, e);
                }
            }
        }
        Ok(outcome)
    }

    async fn execute(&self, filename: &str) -> Result<()> {
        let task = self.queue.read_task(QueueState::Doing, filename).await?;
        wlog!("Executing step {} for task {}", task.step.id, task.task_id);
        let workspace = self.provisioner.create(&task.task_id).await?;
        let result = self
            .executor
            .execute_step(&task.step, &[], &task.task_id, &workspace)
            .await?;

        if result.is_ambiguous() && self.fail_on_clarification {
            return Err(Error::StepAmbiguous {
                step: task.step.id.to_string(),
                message: result.text,
            });
        }
        match result.test_result {
            Some(test) if !test.passed() => Err(Error::TestFailure {
                step: task.step.id.to_string(),
                exit_code: test.exit_code,
                output: test.output(),
            }),
            _ => Ok(()),
        }
    }

    /// Single-shot mode: act until the policy has nothing more to do.
    ///
    /// Stops after a maintenance pass so an oracle that keeps asking for
    /// maintenance cannot spin, and on a scheduling error. Returns the
    /// number of tasks executed.
    pub async fn run_once(&self) -> Result<usize> {
        self.queue.init_dirs().await?;
        let mut executed = 0;
        loop {
            match self.tick().await {
                Ok(Tick::Executed { .. }) => executed += 1,
                Ok(Tick::Idle | Tick::Maintained) => return Ok(executed),
                Err(e) => {
                    wlog_warn!("Scheduling failed, stopping: {}", e);
                    return Ok(executed);
                }
            }
        }
    }

    /// Run until `cancel` fires, waking on new files in `todo/` or after
    /// the poll interval.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        self.queue.init_dirs().await?;
        let (wake_tx, mut wake_rx) = mpsc::unbounded_channel();
        let _watcher = match watch_dir(self.queue.paths().dir(QueueState::Todo), wake_tx) {
            Ok(w) => Some(w),
            Err(e) => {
                wlog_warn!("File watching unavailable, polling only: {}", e);
                None
            }
        };
        wlog!(
            "Worker watching {} (Ctrl+C to stop)",
            self.queue.paths().dir(QueueState::Todo).display()
        );

        loop {
            if cancel.is_cancelled() {
                break;
            }
            let tick = tokio::select! {
                _ = cancel.cancelled() => break,
                tick = self.tick() => tick.unwrap_or_else(|e| {
                    wlog_warn!("Scheduling failed, waiting before the next attempt: {}", e);
                    Tick::Idle
                }),
            };
            if tick != Tick::Idle {
                continue;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = wake_rx.recv() => {
                    wlog_debug!("Queue change detected");
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
        wlog!("Worker stopped");
        Ok(())
    }
}

fn watch_dir(dir: PathBuf, wake: mpsc::UnboundedSender<()>) -> Result<RecommendedWatcher> {
    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| {
            if let Ok(event) = res {
                if matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                    let _ = wake.send(());
                }
            }
        },
        WatchConfig::default(),
    )?;
    watcher.watch(&dir, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}
