//! Generation, prompting and plan execution.
//!
//! The executor drives planner batches through a [`Generator`] into a
//! [`Workspace`](crate::workspace::Workspace), recording every exchange in a
//! [`SnapshotStore`].

pub mod executor;
pub mod generator;
pub mod prompt;
pub mod snapshot;

pub use executor::{BatchExecutor, ExecutorEvent, StepExecutor, StepReport};
pub use generator::{CommandGenerator, Generation, Generator};
pub use snapshot::{SnapshotMeta, SnapshotStore, DEFAULT_RETENTION_DAYS};
