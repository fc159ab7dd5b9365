//! This file defines the batchreduce binary entry point.
//!
//! The binary plans a reduction: it loads the settings and a table, builds the tree and prints
//! what each row and group would produce as JSON, without executing any algorithm.

use batchreduce::cli::{self, CommandLineArgs};
use batchreduce::error::{ErrorReport, ReductionError};
use batchreduce::plan::{described_registry, ReductionPlan};
use batchreduce::settings::ReductionSettings;
use batchreduce::table::TableWorkspace;
use batchreduce::tracing;
use batchreduce::tree_manager::TreeManager;

use std::process::ExitCode;

fn run(args: &CommandLineArgs) -> Result<String, ReductionError> {
    let settings = ReductionSettings::load(&args.settings_path()?)?;
    let registry = described_registry(&settings.algorithms)?;
    let context = settings.context(&registry)?;
    let table = TableWorkspace::load(&args.table_path()?)?;
    let tree = TreeManager::from_table(settings.shape, settings.whitelist()?, &table)?;
    ::tracing::info!(
        groups = tree.groups().len(),
        rows = tree.number_of_rows(),
        "table loaded"
    );
    let plan = ReductionPlan::build(&context, &tree);
    if plan.errors > 0 {
        ::tracing::warn!("{} rows have invalid options", plan.errors);
    }
    let json = if args.pretty {
        serde_json::to_string_pretty(&plan)?
    } else {
        serde_json::to_string(&plan)?
    };
    Ok(json)
}

/// Application entry point
fn main() -> ExitCode {
    let args = cli::parse();
    tracing::init_tracing();
    match run(&args) {
        Ok(json) => {
            println!("{}", json);
            ExitCode::SUCCESS
        }
        Err(error) => {
            ::tracing::error!(kind = %error.kind(), "{}", ErrorReport::new(&error));
            ExitCode::FAILURE
        }
    }
}
