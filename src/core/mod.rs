//! Plan data model and batch planning.

pub mod dag;
pub mod step;

pub use dag::{plan_batches, Batch, StepGraph};
pub use step::{
    Caution, ExecutionResult, Plan, Requirements, Step, StepId, TaskId, TestResult,
    AMBIGUITY_MARKER,
};
