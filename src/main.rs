use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use weft::config::Config;
use weft::core::{plan_batches, Plan, TaskId};
use weft::git::GitOps;
use weft::orchestration::{
    BatchExecutor, CommandGenerator, ExecutorEvent, Generator, SnapshotStore, StepExecutor,
    DEFAULT_RETENTION_DAYS,
};
use weft::queue::{Housekeeping, MaintenanceHook, OraclePolicy, QueueState, TaskQueue, Worker};
use weft::workspace::{Provisioner, WorktreeProvisioner};
use weft::{wlog, wlog_warn, Result};

/// Weft - dependency-ordered plan execution with self-healing retries
#[derive(Parser, Debug)]
#[command(name = "weft")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    WEFT_DEBUG=1     Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.weft/weft.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Check a plan and print its batches
    Validate {
        /// Plan file (.json or .toml)
        plan: PathBuf,
    },

    /// Execute a plan in an isolated worktree
    Run {
        plan: PathBuf,

        /// Reuse or name the task (defaults to task_YYYYMMDD_HHMMSS)
        #[arg(long)]
        task_id: Option<String>,
    },

    /// Put every step of a plan into the queue
    Enqueue {
        plan: PathBuf,

        #[arg(long)]
        task_id: Option<String>,
    },

    /// Process queued steps
    Worker {
        /// Drain what is pending and exit
        #[arg(long)]
        once: bool,

        /// Let the generator decide what to do next
        #[arg(long)]
        oracle: bool,

        /// Treat a clarification request as a failed task
        #[arg(long)]
        fail_ambiguous: bool,
    },

    /// Show queue counts
    Queue,

    /// Merge a task's worktree into the main checkout and remove it
    Merge { task_id: String },

    /// Remove old snapshots and prune stale worktrees
    Clean {
        #[arg(long, default_value_t = DEFAULT_RETENTION_DAYS)]
        days: u64,
    },

    /// Write the default config to ~/.weft/weft.toml
    Init,
}

fn main() {
    let cli = Cli::parse();
    weft::log::init_with_debug(cli.debug);
    weft::log::set_echo(true);

    if let Err(e) = dispatch(cli.command) {
        weft::wlog_error!("{}", e);
        std::process::exit(1);
    }
}

fn dispatch(command: Command) -> Result<()> {
    match command {
        Command::Validate { plan } => run_validate(&plan),
        Command::Init => run_init(),
        command => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(async move {
                match command {
                    Command::Run { plan, task_id } => run_plan(&plan, task_id).await,
                    Command::Enqueue { plan, task_id } => run_enqueue(&plan, task_id).await,
                    Command::Worker {
                        once,
                        oracle,
                        fail_ambiguous,
                    } => run_worker(once, oracle, fail_ambiguous).await,
                    Command::Queue => run_queue_status().await,
                    Command::Merge { task_id } => run_merge(TaskId(task_id)).await,
                    Command::Clean { days } => run_clean(days).await,
                    Command::Validate { .. } | Command::Init => Ok(()),
                }
            })
        }
    }
}

/// Shared setup for commands that touch the repository.
struct Context {
    config: Config,
    repo_root: PathBuf,
}

impl Context {
    fn load() -> Result<Self> {
        let config = Config::load()?;
        let cwd = std::env::current_dir()?;
        let repo_root = GitOps::new(&cwd)?.main_root()?;
        Ok(Self { config, repo_root })
    }

    fn queue(&self) -> TaskQueue {
        TaskQueue::new(self.config.queue_paths(&self.repo_root))
    }

    fn snapshots(&self) -> SnapshotStore {
        SnapshotStore::new(self.config.snapshot_dir(&self.repo_root))
    }

    fn provisioner(&self) -> Result<WorktreeProvisioner> {
        self.config.ensure_dirs()?;
        Ok(WorktreeProvisioner::new(
            &self.repo_root,
            &self.config.worktrees_dir()?,
        ))
    }

    fn generator(&self) -> Result<Arc<dyn Generator>> {
        Ok(Arc::new(CommandGenerator::from_config(&self.config.generator)?))
    }
}

fn load_checked_plan(path: &Path) -> Result<Plan> {
    let plan = Plan::load(path)?;
    for warning in plan.validate()? {
        wlog_warn!("{}", warning);
    }
    Ok(plan)
}

fn run_validate(path: &Path) -> Result<()> {
    let plan = load_checked_plan(path)?;
    let batches = plan_batches(&plan.steps)?;
    println!("Plan is valid: {} steps in {} batches", plan.steps.len(), batches.len());
    for (i, batch) in batches.iter().enumerate() {
        println!("  Batch {}: [{}]", i + 1, batch.label());
    }
    Ok(())
}

fn run_init() -> Result<()> {
    let path = Config::config_path()?;
    if path.exists() {
        println!("Config already exists: {}", path.display());
        return Ok(());
    }
    Config::default().save()?;
    println!("Wrote {}", path.display());
    Ok(())
}

async fn run_plan(path: &Path, task_id: Option<String>) -> Result<()> {
    let plan = load_checked_plan(path)?;
    let batches = plan_batches(&plan.steps)?;
    let ctx = Context::load()?;
    let task_id = task_id.map(TaskId).unwrap_or_else(TaskId::generate);

    let provisioner = ctx.provisioner()?;
    let workspace = provisioner.create(&task_id).await?;

    let (tx, mut rx) = mpsc::channel(100);
    let reporter = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                ExecutorEvent::StepAmbiguous { step, message } => {
                    println!("Step {} needs clarification: {}", step, message)
                }
                ExecutorEvent::StepRetried { step } => println!("Step {} retrying", step),
                ExecutorEvent::BatchRetried { batch } => println!("Batch {} retrying", batch),
                _ => {}
            }
        }
    });

    let steps = StepExecutor::new(ctx.generator()?)
        .with_snapshots(ctx.snapshots())
        .with_events(tx);
    let executor = BatchExecutor::new(steps, ctx.config.regression.probes.clone());
    let result = executor
        .execute_batches(&batches, &plan.cautions, &task_id, &workspace)
        .await;
    drop(executor);
    let _ = reporter.await;

    let reports = result?;
    let ambiguous = reports.iter().filter(|r| r.result.is_ambiguous()).count();
    println!(
        "Task {} finished: {} steps applied, {} need clarification",
        task_id,
        reports.len() - ambiguous,
        ambiguous
    );
    println!("Workspace: {}", workspace.root().display());
    println!("Merge with: weft merge {}", task_id);
    Ok(())
}

async fn run_enqueue(path: &Path, task_id: Option<String>) -> Result<()> {
    let plan = load_checked_plan(path)?;
    let ctx = Context::load()?;
    let task_id = task_id.map(TaskId).unwrap_or_else(TaskId::generate);
    let queue = ctx.queue();
    queue.init_dirs().await?;
    let files = queue.enqueue_plan(&task_id, &plan).await?;
    println!("Enqueued {} steps for {}", files.len(), task_id);
    Ok(())
}

async fn run_worker(once: bool, oracle: bool, fail_ambiguous: bool) -> Result<()> {
    let ctx = Context::load()?;
    let generator = ctx.generator()?;
    let provisioner = ctx.provisioner()?;
    let executor = StepExecutor::new(Arc::clone(&generator)).with_snapshots(ctx.snapshots());

    let mut worker = Worker::new(ctx.queue(), executor, Arc::new(provisioner.clone()))
        .with_poll_interval(Duration::from_millis(ctx.config.worker.poll_interval_ms))
        .with_fail_on_clarification(fail_ambiguous)
        .with_maintenance(Box::new(Housekeeping {
            snapshots: Some(ctx.snapshots()),
            retention_days: DEFAULT_RETENTION_DAYS,
            worktrees: Some(provisioner),
        }));
    if oracle {
        worker = worker.with_policy(Box::new(OraclePolicy::new(generator)));
    }

    if once {
        let executed = worker.run_once().await?;
        println!("Processed {} tasks", executed);
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            wlog!("Interrupt received, stopping worker");
            on_signal.cancel();
        }
    });
    worker.run(cancel).await
}

async fn run_queue_status() -> Result<()> {
    let ctx = Context::load()?;
    let queue = ctx.queue();
    queue.init_dirs().await?;
    let counts = queue.counts().await?;
    for state in QueueState::ALL {
        println!("{:>7}: {}", state, counts.get(&state).copied().unwrap_or(0));
    }
    Ok(())
}

async fn run_merge(task_id: TaskId) -> Result<()> {
    let ctx = Context::load()?;
    let provisioner = ctx.provisioner()?;
    provisioner.merge(&task_id).await?;
    provisioner
        .remove(&provisioner.worktree_path(&task_id), &task_id)
        .await?;
    println!("Merged {}", task_id);
    Ok(())
}

async fn run_clean(days: u64) -> Result<()> {
    let ctx = Context::load()?;
    let hook = Housekeeping {
        snapshots: Some(ctx.snapshots()),
        retention_days: days,
        worktrees: Some(ctx.provisioner()?),
    };
    hook.run().await?;
    println!("Cleanup complete");
    Ok(())
}
