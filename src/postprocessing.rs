//! Combination of the outputs of a group's rows into one group-level output.

use crate::algorithm::{run_algorithm, ProcessingAlgorithm};
use crate::error::ReductionError;
use crate::models::OptionsMap;
use crate::row_data::RowData;
use crate::workspace_store::WorkspaceStore;

use std::sync::Arc;
use tracing::debug;

/// Post-processing of a group.
#[derive(Clone)]
pub struct PostprocessingStep {
    algorithm: Arc<dyn ProcessingAlgorithm>,
    /// Property receiving the comma separated list of inputs
    input_property: String,
    /// Property receiving the group output name
    output_property: String,
    /// Prefix of the row outputs to combine
    input_prefix: String,
    /// Prefix of the group output
    prefix: String,
    options: OptionsMap,
}

impl std::fmt::Debug for PostprocessingStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostprocessingStep")
            .field("algorithm", &self.algorithm.descriptor().name)
            .field("input_prefix", &self.input_prefix)
            .field("prefix", &self.prefix)
            .field("options", &self.options)
            .finish()
    }
}

impl PostprocessingStep {
    /// Return a new PostprocessingStep using the default input and output properties of
    /// `algorithm`.
    pub fn new(algorithm: Arc<dyn ProcessingAlgorithm>, input_prefix: &str, prefix: &str) -> Self {
        let descriptor = algorithm.descriptor();
        PostprocessingStep {
            input_property: descriptor.default_input_property.clone(),
            output_property: descriptor.default_output_property.clone(),
            algorithm,
            input_prefix: input_prefix.to_string(),
            prefix: prefix.to_string(),
            options: OptionsMap::new(),
        }
    }

    pub fn with_options(mut self, options: OptionsMap) -> Self {
        self.options = options;
        self
    }

    pub fn algorithm_name(&self) -> &str {
        &self.algorithm.descriptor().name
    }

    /// Name of the row output used as post-processing input.
    pub fn input_name(&self, row: &RowData) -> String {
        format!("{}{}", self.input_prefix, row.reduced_name())
    }

    /// Name of the group output: the prefix followed by the rows' canonical names.
    pub fn output_name<'a>(&self, rows: impl IntoIterator<Item = &'a RowData>) -> String {
        let names: Vec<&str> = rows.into_iter().map(RowData::reduced_name).collect();
        format!("{}{}", self.prefix, names.join("_"))
    }

    /// Combine `inputs` into `output`.
    ///
    /// Any existing workspace called `output` is removed first. Inputs missing from the store are
    /// skipped; it is an error if none remain.
    #[tracing::instrument(level = "DEBUG", skip(self, store, overrides))]
    pub fn execute(
        &self,
        store: &dyn WorkspaceStore,
        inputs: &[String],
        output: &str,
        overrides: &OptionsMap,
    ) -> Result<(), ReductionError> {
        let available: Vec<&str> = inputs
            .iter()
            .map(String::as_str)
            .filter(|name| store.exists(name))
            .collect();
        if available.is_empty() {
            return Err(ReductionError::algorithm(
                self.algorithm_name(),
                format!("none of the inputs for {} exist", output),
            ));
        }
        if store.remove(output) {
            debug!(%output, "removed previous post-processed workspace");
        }
        let mut properties = self.options.clone();
        properties.merge(overrides);
        properties.set(&self.input_property, available.join(","));
        properties.set(&self.output_property, output);
        run_algorithm(self.algorithm.as_ref(), &properties, store)?;
        Ok(())
    }
}
