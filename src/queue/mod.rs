//! Durable task queue and the worker that drains it.

pub mod store;
pub mod worker;

pub use store::{QueueCounts, QueuePaths, QueueState, QueueTask, TaskQueue};
pub use worker::{
    parse_decision, Decision, DrainPolicy, Housekeeping, MaintenanceHook, OraclePolicy,
    QueueStatus, SchedulingPolicy, TaskOutcome, Tick, Worker, WorkerAction,
};
