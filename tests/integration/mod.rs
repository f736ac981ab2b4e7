//! Integration test suite for weft.
//!
//! These tests drive plans from loading through batch execution and the
//! queue worker, against temporary git repositories.
//!
//! # Test Categories
//!
//! - `planning`: Plan loading, validation and batch planning
//! - `execution`: Batch execution, step and regression retries
//! - `queue_worker`: Queue transitions and the worker loop
//! - `provisioning`: Worktree creation, merge and cleanup
//!
//! # CI Compatibility
//!
//! Generator output is scripted, so no model backend is needed.


mod planning;
mod execution;
mod provisioning;
