//! This crate provides a tree-based batch reduction scheduler. A table of runs is held as a tree
//! of groups and rows; each row is reduced by a processing algorithm, and the outputs of a
//! multi-row group are combined by a post-processing algorithm once all of its rows are done.
//!
//! Reductions are driven from a single logical thread by the
//! [ReductionScheduler](scheduler::ReductionScheduler), which dispatches one row or group at a
//! time to a background execution slot and keeps processed nodes consistent with the workspace
//! store that holds inputs and outputs.
//!
//! The scheduler is built on top of a number of open source components.
//!
//! * [Tokio](tokio), the most popular asynchronous Rust runtime, runs algorithm executions on
//!   its blocking thread pool and carries completions, store notifications and progress.
//! * [Serde](serde) performs (de)serialisation of settings, tables and reduction plans.
//! * [validator] checks the settings document.
//! * The `tracing` crate provides structured logging.
//! * [prometheus] counts processed rows and groups and measures execution times.

pub mod algorithm;
pub mod cli;
pub mod engine;
pub mod error;
pub mod executor;
pub mod hooks;
pub mod metrics;
pub mod models;
pub mod plan;
pub mod postprocessing;
pub mod preprocessing;
pub mod row_data;
pub mod scheduler;
pub mod settings;
pub mod table;
#[cfg(test)]
pub mod test_utils;
pub mod time_slicing;
pub mod tracing;
pub mod tree_manager;
pub mod workspace_store;
