use crate::algorithm::{AlgorithmDescriptor, AlgorithmRegistry, AlgorithmResult, ProcessingAlgorithm};
use crate::engine::ReductionContext;
use crate::error::ReductionError;
use crate::models::{ColumnSpec, OptionsMap, WhiteList};
use crate::row_data::RowData;
use crate::settings::ReductionSettings;
use crate::tree_manager::{TreeManager, TreeShape};
use crate::workspace_store::{InMemoryWorkspaceStore, Workspace, WorkspaceStore};

use std::sync::{Arc, Mutex};

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}

/// Whitelist of a reflectometry-like table: run, angle, transmission run and Q min.
pub(crate) fn get_test_whitelist() -> WhiteList {
    WhiteList::new(vec![
        ColumnSpec::new("Run(s)", "InputWorkspace", "", true),
        ColumnSpec::new("Angle", "ThetaIn", "th=", true),
        ColumnSpec::new("Transmission Run(s)", "FirstTransmissionRun", "", false),
        ColumnSpec::new("Q min", "MomentumTransferMin", "", false),
    ])
    .unwrap()
}

/// Descriptor of the processing algorithm.
pub(crate) fn get_test_descriptor() -> AlgorithmDescriptor {
    AlgorithmDescriptor {
        name: "ReflectometryReductionOneAuto".to_string(),
        input_properties: strings(&["InputWorkspace", "FirstTransmissionRun"]),
        output_properties: strings(&[
            "OutputWorkspace",
            "OutputWorkspaceBinned",
            "OutputWorkspaceWavelength",
        ]),
        default_input_property: "InputWorkspace".to_string(),
        default_output_property: "OutputWorkspaceBinned".to_string(),
        output_prefixes: strings(&["IvsQ_", "IvsQ_binned_", "IvsLam_"]),
    }
}

/// Descriptor of the processing algorithm with different input properties.
pub(crate) fn get_test_descriptor_with_inputs(inputs: &[&str]) -> AlgorithmDescriptor {
    AlgorithmDescriptor {
        input_properties: strings(inputs),
        default_input_property: inputs.first().unwrap_or(&"").to_string(),
        ..get_test_descriptor()
    }
}

pub(crate) fn get_test_global_options() -> OptionsMap {
    OptionsMap::parse("AnalysisMode=PointDetectorAnalysis,WavelengthMin=1.5,ScaleFactor=1").unwrap()
}

pub(crate) fn get_test_row(id: u64, values: &[&str]) -> RowData {
    RowData::new(id, strings(values))
}

/// Algorithm that records its executions and writes its outputs to the store.
pub(crate) struct MockAlgorithm {
    descriptor: AlgorithmDescriptor,
    executions: Mutex<Vec<OptionsMap>>,
    report_failure: bool,
    fail_on: Option<(String, String)>,
    counter: Option<(String, f64)>,
}

impl MockAlgorithm {
    pub(crate) fn new(descriptor: AlgorithmDescriptor) -> Self {
        MockAlgorithm {
            descriptor,
            executions: Mutex::new(Vec::new()),
            report_failure: false,
            fail_on: None,
            counter: None,
        }
    }

    /// Every execution reports failure without writing outputs.
    pub(crate) fn reporting_failure(mut self) -> Self {
        self.report_failure = true;
        self
    }

    /// Executions with `property` set to `value` return an error.
    pub(crate) fn failing_on(mut self, property: &str, value: &str) -> Self {
        self.fail_on = Some((property.to_string(), value.to_string()));
        self
    }

    /// Each execution reports `property` as `start` plus the number of earlier executions.
    pub(crate) fn reporting_counter(mut self, property: &str, start: f64) -> Self {
        self.counter = Some((property.to_string(), start));
        self
    }

    pub(crate) fn executions(&self) -> Vec<OptionsMap> {
        self.executions.lock().unwrap().clone()
    }
}

impl ProcessingAlgorithm for MockAlgorithm {
    fn descriptor(&self) -> &AlgorithmDescriptor {
        &self.descriptor
    }

    fn execute(
        &self,
        properties: &OptionsMap,
        store: &dyn WorkspaceStore,
    ) -> Result<AlgorithmResult, ReductionError> {
        let index = {
            let mut executions = self.executions.lock().unwrap();
            executions.push(properties.clone());
            executions.len() - 1
        };
        if let Some((property, value)) = &self.fail_on {
            if properties.get(property) == Some(value.as_str()) {
                return Err(ReductionError::algorithm(
                    &self.descriptor.name,
                    format!("failed on {}={}", property, value),
                ));
            }
        }
        if self.report_failure {
            return Ok(AlgorithmResult::failure());
        }
        let mut outputs = OptionsMap::new();
        for property in &self.descriptor.output_properties {
            if let Some(name) = properties.get(property) {
                store.put(name, Workspace::histogram());
                outputs.set(property, name);
            }
        }
        if let Some((property, start)) = &self.counter {
            outputs.set(property, (start + index as f64).to_string());
        }
        Ok(AlgorithmResult::success(outputs))
    }
}

/// The processing algorithm, reporting ThetaIn 0.7, 1.7, 2.7...
pub(crate) fn get_test_processor() -> MockAlgorithm {
    MockAlgorithm::new(get_test_descriptor()).reporting_counter("ThetaIn", 0.7)
}

/// Binary algorithm used for pre-processing.
pub(crate) fn get_test_plus() -> MockAlgorithm {
    MockAlgorithm::new(AlgorithmDescriptor {
        name: "Plus".to_string(),
        input_properties: strings(&["LHSWorkspace", "RHSWorkspace"]),
        output_properties: strings(&["OutputWorkspace"]),
        default_input_property: "LHSWorkspace".to_string(),
        default_output_property: "OutputWorkspace".to_string(),
        output_prefixes: strings(&[""]),
    })
}

/// Algorithm used for post-processing.
pub(crate) fn get_test_stitch() -> MockAlgorithm {
    MockAlgorithm::new(AlgorithmDescriptor {
        name: "Stitch1DMany".to_string(),
        input_properties: strings(&["InputWorkspaces"]),
        output_properties: strings(&["OutputWorkspace"]),
        default_input_property: "InputWorkspaces".to_string(),
        default_output_property: "OutputWorkspace".to_string(),
        output_prefixes: strings(&["IvsQ_"]),
    })
}

/// Context with the test processor, returned alongside it.
pub(crate) fn get_test_context() -> (ReductionContext, Arc<MockAlgorithm>) {
    let processor = Arc::new(get_test_processor());
    (get_test_context_with(processor.clone()), processor)
}

pub(crate) fn get_test_context_with(processor: Arc<MockAlgorithm>) -> ReductionContext {
    ReductionContext::new(get_test_whitelist(), processor)
        .unwrap()
        .with_input_prefix("TOF_")
        .with_global_options(get_test_global_options())
        .with_round_precision(Some(3))
}

/// Store holding three event runs of 100 s and a proton charge of 10.
pub(crate) fn get_test_store() -> InMemoryWorkspaceStore {
    let store = InMemoryWorkspaceStore::new();
    for run in ["13460", "13462", "13464"] {
        store.put(&format!("TOF_{}", run), Workspace::event(100.0, 10.0));
    }
    store
}

pub(crate) fn get_test_settings() -> ReductionSettings {
    let algorithms = serde_json::to_value(vec![
        get_test_descriptor(),
        get_test_plus().descriptor().clone(),
        get_test_stitch().descriptor().clone(),
    ])
    .unwrap();
    serde_json::from_value(serde_json::json!({
        "shape": "grouped",
        "columns": [
            {"name": "Run(s)", "algorithm_property": "InputWorkspace", "show_value": true},
            {"name": "Angle", "algorithm_property": "ThetaIn", "prefix": "th=", "show_value": true},
            {"name": "Transmission Run(s)", "algorithm_property": "FirstTransmissionRun"},
            {"name": "Q min", "algorithm_property": "MomentumTransferMin"}
        ],
        "processing": "ReflectometryReductionOneAuto",
        "algorithms": algorithms,
        "input_prefix": "TOF_",
        "global_options": "AnalysisMode=PointDetectorAnalysis,WavelengthMin=1.5",
        "preprocessing": [
            {"column": "Run(s)", "algorithm": "Plus", "prefix": "TOF_", "input_prefix": "TOF_"}
        ],
        "postprocessing": {
            "algorithm": "Stitch1DMany",
            "input_prefix": "IvsQ_",
            "prefix": "IvsQ_",
            "options": "Params=\"-0.03\""
        },
        "postprocessing_overrides": [
            {"row_option": "dQ/Q", "property": "Params", "negate": true}
        ],
        "time_slicing": null,
        "round_precision": 3
    }))
    .unwrap()
}

pub(crate) fn get_test_registry() -> AlgorithmRegistry {
    let mut registry = AlgorithmRegistry::new();
    registry.register(Arc::new(get_test_processor()));
    registry.register(Arc::new(get_test_plus()));
    registry.register(Arc::new(get_test_stitch()));
    registry
}

/// Grouped tree from (group name, row values) pairs, creating groups in order of appearance.
pub(crate) fn get_test_tree(rows: &[(&str, &[&str])]) -> TreeManager {
    let mut tree = TreeManager::new(TreeShape::Grouped, get_test_whitelist());
    for (group, values) in rows {
        let index = match tree.groups().iter().position(|g| g.name() == *group) {
            Some(index) => index,
            None => tree.append_group(group).unwrap(),
        };
        tree.append_row(index, strings(values)).unwrap();
    }
    tree
}

/// Tree with group A (13460, 13462) and group B (13464), options resolved.
pub(crate) fn get_test_resolved_tree() -> TreeManager {
    let mut tree = get_test_tree(&[
        ("A", &["13460", "0.7"]),
        ("A", &["13462", "2.3"]),
        ("B", &["13464", "0.7"]),
    ]);
    let whitelist = get_test_whitelist();
    let global = get_test_global_options();
    let outputs = get_test_descriptor().outputs();
    for (g, r) in [(0, 0), (0, 1), (1, 0)] {
        tree.row_mut(g, r)
            .unwrap()
            .resolve_options(&whitelist, &global, &outputs)
            .unwrap();
    }
    tree
}
