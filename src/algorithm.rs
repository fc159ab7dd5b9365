//! Processing algorithm capability.

use crate::error::ReductionError;
use crate::models::OptionsMap;
use crate::workspace_store::WorkspaceStore;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Static description of a processing algorithm.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AlgorithmDescriptor {
    /// Algorithm name
    pub name: String,
    /// Names of the workspace input properties
    pub input_properties: Vec<String>,
    /// Names of the workspace output properties
    pub output_properties: Vec<String>,
    /// Input property receiving the run(s) of a row
    pub default_input_property: String,
    /// Output property holding the main result
    pub default_output_property: String,
    /// Prefix for each output property, in the same order as `output_properties`
    #[serde(default)]
    pub output_prefixes: Vec<String>,
}

impl AlgorithmDescriptor {
    /// Check that the descriptor is self-consistent.
    pub fn validate(&self) -> Result<(), ReductionError> {
        if self.output_prefixes.len() != self.output_properties.len() {
            return Err(ReductionError::validation(format!(
                "algorithm {} has {} output properties but {} output prefixes",
                self.name,
                self.output_properties.len(),
                self.output_prefixes.len()
            )));
        }
        if !self.input_properties.contains(&self.default_input_property) {
            return Err(ReductionError::validation(format!(
                "algorithm {} has no input property {}",
                self.name, self.default_input_property
            )));
        }
        if !self.output_properties.contains(&self.default_output_property) {
            return Err(ReductionError::validation(format!(
                "algorithm {} has no output property {}",
                self.name, self.default_output_property
            )));
        }
        Ok(())
    }

    /// Pairs of (output property, prefix).
    pub fn outputs(&self) -> Vec<(String, String)> {
        self.output_properties
            .iter()
            .cloned()
            .zip(self.output_prefixes.iter().cloned())
            .collect()
    }

    /// Prefix of the default output property.
    pub fn default_output_prefix(&self) -> &str {
        self.output_properties
            .iter()
            .position(|property| *property == self.default_output_property)
            .and_then(|i| self.output_prefixes.get(i))
            .map(String::as_str)
            .unwrap_or("")
    }
}

/// Result of a single algorithm execution.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AlgorithmResult {
    /// Whether the algorithm reported success
    pub success: bool,
    /// Values of the algorithm's output properties after execution
    pub outputs: OptionsMap,
}

impl AlgorithmResult {
    pub fn success(outputs: OptionsMap) -> Self {
        AlgorithmResult {
            success: true,
            outputs,
        }
    }

    pub fn failure() -> Self {
        AlgorithmResult::default()
    }
}

/// Trait for processing algorithms.
///
/// This forms the contract between the scheduler and the scientific algorithms it runs. Algorithms
/// read their input workspaces from, and write their outputs to, the workspace store.
pub trait ProcessingAlgorithm: Send + Sync {
    fn descriptor(&self) -> &AlgorithmDescriptor;

    /// Execute the algorithm.
    ///
    /// # Arguments
    ///
    /// * `properties`: Property values to run the algorithm with
    /// * `store`: Workspace store holding inputs and receiving outputs
    fn execute(
        &self,
        properties: &OptionsMap,
        store: &dyn WorkspaceStore,
    ) -> Result<AlgorithmResult, ReductionError>;
}

/// Execute `algorithm` and turn a reported failure into an error.
pub fn run_algorithm(
    algorithm: &dyn ProcessingAlgorithm,
    properties: &OptionsMap,
    store: &dyn WorkspaceStore,
) -> Result<AlgorithmResult, ReductionError> {
    let name = &algorithm.descriptor().name;
    tracing::debug!(algorithm = %name, %properties, "executing");
    let result = algorithm.execute(properties, store)?;
    if !result.success {
        return Err(ReductionError::algorithm(name, "execution reported failure"));
    }
    Ok(result)
}

/// Algorithms available to a reduction, by name.
#[derive(Clone, Default)]
pub struct AlgorithmRegistry {
    algorithms: HashMap<String, Arc<dyn ProcessingAlgorithm>>,
}

impl AlgorithmRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `algorithm` under its descriptor name, replacing any previous entry.
    pub fn register(&mut self, algorithm: Arc<dyn ProcessingAlgorithm>) {
        let name = algorithm.descriptor().name.clone();
        self.algorithms.insert(name, algorithm);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn ProcessingAlgorithm>, ReductionError> {
        self.algorithms
            .get(name)
            .cloned()
            .ok_or_else(|| ReductionError::validation(format!("unknown algorithm {}", name)))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.algorithms.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for AlgorithmRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils;
    use crate::workspace_store::InMemoryWorkspaceStore;

    #[test]
    fn descriptor_outputs() {
        let descriptor = test_utils::get_test_descriptor();
        descriptor.validate().unwrap();
        assert_eq!(
            vec![
                ("OutputWorkspace".to_string(), "IvsQ_".to_string()),
                ("OutputWorkspaceBinned".to_string(), "IvsQ_binned_".to_string()),
                ("OutputWorkspaceWavelength".to_string(), "IvsLam_".to_string()),
            ],
            descriptor.outputs()
        );
        assert_eq!("IvsQ_binned_", descriptor.default_output_prefix());
    }

    #[test]
    #[should_panic(expected = "has 3 output properties but 2 output prefixes")]
    fn descriptor_prefix_mismatch() {
        let mut descriptor = test_utils::get_test_descriptor();
        descriptor.output_prefixes.pop();
        descriptor.validate().unwrap();
    }

    #[test]
    #[should_panic(expected = "has no input property Foo")]
    fn descriptor_unknown_default_input() {
        let mut descriptor = test_utils::get_test_descriptor();
        descriptor.default_input_property = "Foo".to_string();
        descriptor.validate().unwrap();
    }

    #[test]
    fn run_algorithm_reported_failure() {
        let algorithm = test_utils::MockAlgorithm::new(test_utils::get_test_descriptor())
            .reporting_failure();
        let store = InMemoryWorkspaceStore::new();
        let error = run_algorithm(&algorithm, &OptionsMap::new(), &store).unwrap_err();
        assert_eq!(
            "algorithm ReflectometryReductionOneAuto failed: execution reported failure",
            error.to_string()
        );
    }

    #[test]
    fn registry_lookup() {
        let mut registry = AlgorithmRegistry::new();
        registry.register(Arc::new(test_utils::get_test_plus()));
        registry.register(Arc::new(test_utils::get_test_stitch()));
        assert_eq!(vec!["Plus", "Stitch1DMany"], registry.names());
        assert_eq!("Plus", registry.get("Plus").unwrap().descriptor().name);
        let error = registry.get("Minus").err().unwrap();
        assert_eq!("unknown algorithm Minus", error.to_string());
    }
}
