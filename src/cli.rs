//! Command Line Interface (CLI) arguments.

use crate::error::ReductionError;

use clap::Parser;
use expanduser::expanduser;
use std::path::PathBuf;

/// Batch reduction planner command line interface
#[derive(Clone, Debug, Parser)]
pub struct CommandLineArgs {
    /// Path to the reduction settings JSON document
    #[arg(
        long,
        default_value = "~/.config/batchreduce/settings.json",
        env = "BATCHREDUCE_SETTINGS"
    )]
    pub settings: String,
    /// Path to the JSON table to plan a reduction for
    #[arg(long, env = "BATCHREDUCE_TABLE")]
    pub table: String,
    /// Whether to pretty-print the plan
    #[arg(long, default_value_t = false, env = "BATCHREDUCE_PRETTY")]
    pub pretty: bool,
}

impl CommandLineArgs {
    /// Settings path with `~` expanded.
    pub fn settings_path(&self) -> Result<PathBuf, ReductionError> {
        expand(&self.settings)
    }

    /// Table path with `~` expanded.
    pub fn table_path(&self) -> Result<PathBuf, ReductionError> {
        expand(&self.table)
    }
}

fn expand(path: &str) -> Result<PathBuf, ReductionError> {
    expanduser(path).map_err(|source| ReductionError::Io {
        path: path.to_string(),
        source,
    })
}

/// Returns parsed command line arguments.
pub fn parse() -> CommandLineArgs {
    CommandLineArgs::parse()
}
