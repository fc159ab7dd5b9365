//! Combination of multi-run values into a single input workspace.

use crate::algorithm::{run_algorithm, ProcessingAlgorithm};
use crate::error::ReductionError;
use crate::hooks::ReductionHooks;
use crate::models::{split_runs, OptionsMap};
use crate::workspace_store::WorkspaceStore;

use std::sync::Arc;
use tracing::{debug, warn};

/// Combines the runs of a multi-run cell (`13460+13462`) with a binary algorithm.
#[derive(Clone)]
pub struct PreprocessingStep {
    algorithm: Arc<dyn ProcessingAlgorithm>,
    /// Left hand side input property of the binary algorithm
    lhs_property: String,
    /// Right hand side input property of the binary algorithm
    rhs_property: String,
    /// Output property of the binary algorithm
    output_property: String,
    /// Prefix of the combined workspace name
    prefix: String,
    /// Separator between runs in the combined workspace name
    separator: String,
    /// Prefix used to locate each individual run
    input_prefix: String,
    options: OptionsMap,
}

impl std::fmt::Debug for PreprocessingStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreprocessingStep")
            .field("algorithm", &self.algorithm.descriptor().name)
            .field("prefix", &self.prefix)
            .field("separator", &self.separator)
            .field("input_prefix", &self.input_prefix)
            .field("options", &self.options)
            .finish()
    }
}

impl PreprocessingStep {
    /// Return a new PreprocessingStep using the first two input properties of `algorithm` as the
    /// left and right hand sides, and its default output property for the result.
    pub fn new(
        algorithm: Arc<dyn ProcessingAlgorithm>,
        prefix: &str,
        separator: &str,
    ) -> Result<Self, ReductionError> {
        let descriptor = algorithm.descriptor();
        let (lhs, rhs) = match descriptor.input_properties.as_slice() {
            [lhs, rhs, ..] => (lhs.clone(), rhs.clone()),
            _ => {
                return Err(ReductionError::validation(format!(
                    "pre-processing algorithm {} needs two input properties",
                    descriptor.name
                )))
            }
        };
        let output_property = descriptor.default_output_property.clone();
        Ok(PreprocessingStep {
            algorithm,
            lhs_property: lhs,
            rhs_property: rhs,
            output_property,
            prefix: prefix.to_string(),
            separator: separator.to_string(),
            input_prefix: String::new(),
            options: OptionsMap::new(),
        })
    }

    pub fn with_input_prefix(mut self, input_prefix: &str) -> Self {
        self.input_prefix = input_prefix.to_string();
        self
    }

    /// Options passed to the binary algorithm. The input properties are never overridden.
    pub fn with_options(mut self, options: OptionsMap) -> Self {
        self.options = options;
        self
    }

    pub fn algorithm_name(&self) -> &str {
        &self.algorithm.descriptor().name
    }

    /// Name of the combined workspace: the prefix followed by the runs joined by the separator.
    pub fn output_name(&self, runs: &[String]) -> String {
        format!("{}{}", self.prefix, runs.join(&self.separator))
    }

    /// Name [PreprocessingStep::prepare] is expected to return for `value`, without touching a
    /// store. A single run is assumed to be found under the input prefix.
    pub fn planned_name(&self, value: &str) -> Option<String> {
        let runs = split_runs(value);
        match runs.as_slice() {
            [] => None,
            [run] => Some(format!("{}{}", self.input_prefix, run)),
            _ => Some(self.output_name(&runs)),
        }
    }

    /// Resolve a raw cell value into a single input workspace, combining runs as needed.
    ///
    /// A single run resolves to its own workspace. Otherwise the first run seeds an accumulator
    /// which each following run is added to. On failure the accumulator is removed from the store.
    #[tracing::instrument(level = "DEBUG", skip(self, store, hooks))]
    pub fn prepare(
        &self,
        store: &dyn WorkspaceStore,
        hooks: &dyn ReductionHooks,
        value: &str,
    ) -> Result<String, ReductionError> {
        let runs = split_runs(value);
        match runs.as_slice() {
            [] => Err(ReductionError::validation("no runs given")),
            [run] => hooks.resolve_input_workspace(store, run, &self.input_prefix),
            [first, rest @ ..] => {
                let accumulator = self.output_name(&runs);
                if store.exists(&accumulator) {
                    debug!(%accumulator, "reusing pre-processed workspace");
                    return Ok(accumulator);
                }
                match self.combine(store, hooks, first, rest, &accumulator) {
                    Ok(()) => Ok(accumulator),
                    Err(error) => {
                        warn!(%accumulator, %error, "pre-processing failed, discarding workspace");
                        store.remove(&accumulator);
                        Err(error)
                    }
                }
            }
        }
    }

    fn combine(
        &self,
        store: &dyn WorkspaceStore,
        hooks: &dyn ReductionHooks,
        first: &str,
        rest: &[String],
        accumulator: &str,
    ) -> Result<(), ReductionError> {
        let seed = hooks.resolve_input_workspace(store, first, &self.input_prefix)?;
        let workspace = store
            .get(&seed)
            .ok_or_else(|| ReductionError::WorkspaceNotFound { name: seed.clone() })?;
        store.put(accumulator, workspace);

        let mut properties = self.options.clone();
        properties.remove(&self.lhs_property);
        properties.remove(&self.rhs_property);
        properties.set(&self.output_property, accumulator);
        for run in rest {
            let next = hooks.resolve_input_workspace(store, run, &self.input_prefix)?;
            properties.set(&self.lhs_property, accumulator);
            properties.set(&self.rhs_property, &next);
            run_algorithm(self.algorithm.as_ref(), &properties, store)?;
        }
        Ok(())
    }
}
