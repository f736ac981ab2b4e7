//! Batch executor with self-healing retries.
//!
//! [`StepExecutor`] runs one step: read its target files, ask the generator
//! for new contents, write the first target and run the step's test. A
//! failing test triggers exactly one regeneration with the failure folded
//! into the cautions.
//!
//! [`BatchExecutor`] drains planner batches in order. Steps inside a batch
//! run as concurrent tasks and are all joined before any outcome is looked
//! at. After each batch the workspace regression suite runs when the
//! workspace has a project descriptor at that point; a failure
//! regenerates the whole batch once, a second failure aborts the plan.

use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::TestProbe;
use crate::core::{Batch, Caution, ExecutionResult, Step, StepId, TaskId, TestResult};
use crate::orchestration::generator::Generator;
use crate::orchestration::prompt::{
    build_step_prompt, extract_code_block, is_ambiguous, regression_caution,
    test_failure_caution, FileContext,
};
use crate::orchestration::snapshot::{SnapshotMeta, SnapshotStore};
use crate::workspace::Workspace;
use crate::{wlog, wlog_debug, wlog_error, wlog_warn, Error, Result};

/// Progress notifications from the executors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutorEvent {
    BatchStarted {
        /// 1-based batch number.
        batch: usize,
        total: usize,
        steps: Vec<StepId>,
    },
    StepCompleted {
        step: StepId,
        /// Exit code of the step test, if it has one.
        exit_code: Option<i32>,
    },
    StepAmbiguous {
        step: StepId,
        message: String,
    },
    StepTestFailed {
        step: StepId,
        exit_code: i32,
    },
    StepRetried {
        step: StepId,
    },
    RegressionFailed {
        batch: usize,
        output: String,
    },
    BatchRetried {
        batch: usize,
    },
    BatchCompleted {
        batch: usize,
    },
    AllBatchesComplete,
}

/// Final outcome of one step within a plan run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReport {
    pub step: StepId,
    pub result: ExecutionResult,
}

/// Runs a single step against a workspace.
#[derive(Clone)]
pub struct StepExecutor {
    generator: Arc<dyn Generator>,
    snapshots: Option<SnapshotStore>,
    events: Option<mpsc::Sender<ExecutorEvent>>,
}

impl StepExecutor {
    pub fn new(generator: Arc<dyn Generator>) -> Self {
        Self {
            generator,
            snapshots: None,
            events: None,
        }
    }

    pub fn with_snapshots(mut self, store: SnapshotStore) -> Self {
        self.snapshots = Some(store);
        self
    }

    pub fn with_events(mut self, tx: mpsc::Sender<ExecutorEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    async fn emit(&self, event: ExecutorEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event).await;
        }
    }

    /// Execute a step, retrying once if its test command fails.
    ///
    /// The returned result carries the final test outcome; deciding whether
    /// a non-zero exit is fatal is left to the caller.
    pub async fn execute_step(
        &self,
        step: &Step,
        cautions: &[Caution],
        task_id: &TaskId,
        workspace: &Workspace,
    ) -> Result<ExecutionResult> {
        wlog!("Executing step {}: {}", step.id, step.description);
        let first = self.run_once(step, cautions, task_id, workspace, 1).await?;
        if first.is_ambiguous() {
            return Ok(first);
        }
        let Some(command) = step.test_command.as_deref() else {
            self.emit(ExecutorEvent::StepCompleted {
                step: step.id.clone(),
                exit_code: None,
            })
            .await;
            return Ok(first);
        };

        let test = workspace.run_command(command).await?;
        if test.passed() {
            wlog!("Step {} passed `{}`", step.id, command);
            return Ok(self.finish(step, first.text, test).await);
        }

        wlog_warn!(
            "Step {} test `{}` failed with exit code {}, regenerating",
            step.id,
            command,
            test.exit_code
        );
        self.emit(ExecutorEvent::StepTestFailed {
            step: step.id.clone(),
            exit_code: test.exit_code,
        })
        .await;

        let mut retry_cautions = cautions.to_vec();
        retry_cautions.push(test_failure_caution(command, test.exit_code, &test.output()));
        self.emit(ExecutorEvent::StepRetried {
            step: step.id.clone(),
        })
        .await;
        let second = self
            .run_once(step, &retry_cautions, task_id, workspace, 2)
            .await?;
        if second.is_ambiguous() {
            // Nothing was rewritten, so the earlier failure still stands.
            return Ok(ExecutionResult {
                test_result: Some(test),
                ..second
            });
        }

        let retest = workspace.run_command(command).await?;
        if retest.passed() {
            wlog!("Step {} passed `{}` after retry", step.id, command);
        } else {
            wlog_error!(
                "Step {} still failing `{}` after retry (exit code {})",
                step.id,
                command,
                retest.exit_code
            );
        }
        Ok(self.finish(step, second.text, retest).await)
    }

    async fn finish(&self, step: &Step, text: String, test: TestResult) -> ExecutionResult {
        self.emit(ExecutorEvent::StepCompleted {
            step: step.id.clone(),
            exit_code: Some(test.exit_code),
        })
        .await;
        ExecutionResult {
            test_result: Some(test),
            ..ExecutionResult::applied(text)
        }
    }

    /// One generate-and-apply pass. Never runs the step test.
    async fn run_once(
        &self,
        step: &Step,
        cautions: &[Caution],
        task_id: &TaskId,
        workspace: &Workspace,
        attempt: u32,
    ) -> Result<ExecutionResult> {
        let mut files = Vec::with_capacity(step.target_files.len());
        for path in &step.target_files {
            files.push(FileContext {
                path: path.clone(),
                content: workspace.read_file(path).await,
            });
        }
        let prompt = build_step_prompt(&step.description, &files, cautions);

        wlog_debug!("Step {} attempt {}: sending generation request", step.id, attempt);
        let generation = self.generator.generate(&prompt).await?;
        let ambiguous = is_ambiguous(&generation.text);

        if let Some(store) = &self.snapshots {
            let prefix = if attempt == 1 {
                format!("step_{}", step.id)
            } else {
                format!("step_{}_retry", step.id)
            };
            let meta = SnapshotMeta {
                step_id: step.id.to_string(),
                attempt,
                duration_ms: generation.duration_ms,
                ambiguous,
                created_at: chrono::Utc::now().to_rfc3339(),
            };
            if let Err(e) = store
                .save(task_id, &prefix, &prompt, &generation.raw, &meta)
                .await
            {
                wlog_warn!("Failed to save snapshot for step {}: {}", step.id, e);
            }
        }

        if ambiguous {
            wlog!("Step {} needs clarification: {}", step.id, generation.text.trim_end());
            self.emit(ExecutorEvent::StepAmbiguous {
                step: step.id.clone(),
                message: generation.text.clone(),
            })
            .await;
            return Ok(ExecutionResult::clarification(generation.text));
        }

        let code = extract_code_block(&generation.text);
        if let Some(target) = step.primary_target() {
            match workspace.write_file(target, &code).await {
                Ok(()) => {
                    wlog_debug!("Step {} wrote {}", step.id, target);
                    if let Err(e) = workspace.stage(target).await {
                        wlog_debug!("Could not stage {}: {}", target, e);
                    }
                }
                Err(e) => wlog_error!("Step {} could not write {}: {}", step.id, target, e),
            }
        }

        Ok(ExecutionResult::applied(code))
    }
}

/// Drains planner batches through a [`StepExecutor`].
pub struct BatchExecutor {
    steps: StepExecutor,
    probes: Vec<TestProbe>,
}

impl BatchExecutor {
    pub fn new(steps: StepExecutor, probes: Vec<TestProbe>) -> Self {
        Self { steps, probes }
    }

    /// Execute every batch in order.
    ///
    /// Fails on a step whose test is still red after its retry, on a
    /// regression suite that fails twice for the same batch, and on any
    /// generation error. Changes from completed batches stay in place.
    pub async fn execute_batches(
        &self,
        batches: &[Batch],
        cautions: &[Caution],
        task_id: &TaskId,
        workspace: &Workspace,
    ) -> Result<Vec<StepReport>> {
        wlog!("Starting execution of {} batches for {}", batches.len(), task_id);
        let mut cautions = cautions.to_vec();
        let mut reports = Vec::new();

        for (i, batch) in batches.iter().enumerate() {
            let number = i + 1;
            wlog!(
                "Executing batch {}/{} (steps: [{}])",
                number,
                batches.len(),
                batch.label()
            );
            self.steps
                .emit(ExecutorEvent::BatchStarted {
                    batch: number,
                    total: batches.len(),
                    steps: batch.ids().into_iter().cloned().collect(),
                })
                .await;

            let mut batch_reports = self.run_batch(batch, &cautions, task_id, workspace).await?;

            // Steps may have just created the project descriptor.
            let regression = workspace.regression_command(&self.probes).map(str::to_string);
            if regression.is_none() {
                wlog_debug!("No project descriptor after batch {}, skipping regression check", number);
            }
            if let Some(command) = &regression {
                let check = workspace.run_command(command).await?;
                if !check.passed() {
                    let output = check.output();
                    wlog_warn!("Regression check failed after batch {}, retrying batch", number);
                    self.steps
                        .emit(ExecutorEvent::RegressionFailed {
                            batch: number,
                            output: output.clone(),
                        })
                        .await;
                    cautions.push(regression_caution(command, &output));
                    self.steps
                        .emit(ExecutorEvent::BatchRetried { batch: number })
                        .await;

                    batch_reports = self.run_batch(batch, &cautions, task_id, workspace).await?;
                    let recheck = workspace.run_command(command).await?;
                    if !recheck.passed() {
                        let output = recheck.output();
                        wlog_error!("Regression check failed again after batch {}", number);
                        self.steps
                            .emit(ExecutorEvent::RegressionFailed {
                                batch: number,
                                output: output.clone(),
                            })
                            .await;
                        return Err(Error::RegressionFailure {
                            batch: number,
                            output,
                        });
                    }
                }
            }

            reports.extend(batch_reports);
            wlog!("Batch {} completed", number);
            self.steps
                .emit(ExecutorEvent::BatchCompleted { batch: number })
                .await;
        }

        wlog!("All batches executed for {}", task_id);
        self.steps.emit(ExecutorEvent::AllBatchesComplete).await;
        Ok(reports)
    }

    /// Run every step of a batch concurrently and join them all.
    ///
    /// The first error is returned only once every sibling has finished.
    async fn run_batch(
        &self,
        batch: &Batch,
        cautions: &[Caution],
        task_id: &TaskId,
        workspace: &Workspace,
    ) -> Result<Vec<StepReport>> {
        let cautions = Arc::new(cautions.to_vec());
        let handles: Vec<_> = batch
            .steps
            .iter()
            .cloned()
            .map(|step| {
                let executor = self.steps.clone();
                let cautions = Arc::clone(&cautions);
                let task_id = task_id.clone();
                let workspace = workspace.clone();
                tokio::spawn(async move {
                    let result = executor
                        .execute_step(&step, &cautions, &task_id, &workspace)
                        .await;
                    (step, result)
                })
            })
            .collect();

        let mut first_error = None;
        let mut reports = Vec::with_capacity(batch.len());
        for joined in join_all(handles).await {
            let (step, result) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    first_error.get_or_insert(Error::TaskJoin(e.to_string()));
                    continue;
                }
            };
            match result {
                Ok(result) => {
                    if let Some(test) = result.test_result.as_ref().filter(|t| !t.passed()) {
                        first_error.get_or_insert(Error::TestFailure {
                            step: step.id.to_string(),
                            exit_code: test.exit_code,
                            output: test.output(),
                        });
                    }
                    reports.push(StepReport {
                        step: step.id,
                        result,
                    });
                }
                Err(e) => {
                    wlog_error!("Step {} failed: {}", step.id, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(reports),
        }
    }
}
