//! Dry-run reduction plans.
//!
//! A [ReductionPlan] describes what a reduction of a tree would do without executing anything:
//! the resolved options, inputs and canonical output names of every row, and the output name of
//! every group that would be post-processed.

use crate::algorithm::{AlgorithmDescriptor, AlgorithmRegistry, AlgorithmResult, ProcessingAlgorithm};
use crate::engine::ReductionContext;
use crate::error::ReductionError;
use crate::models::OptionsMap;
use crate::time_slicing::SlicingType;
use crate::tree_manager::{TreeManager, TreeShape};
use crate::workspace_store::WorkspaceStore;

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// An algorithm known only by its descriptor. Executing it is an error.
#[derive(Debug)]
pub struct DescribedAlgorithm {
    descriptor: AlgorithmDescriptor,
}

impl DescribedAlgorithm {
    pub fn new(descriptor: AlgorithmDescriptor) -> Self {
        DescribedAlgorithm { descriptor }
    }
}

impl ProcessingAlgorithm for DescribedAlgorithm {
    fn descriptor(&self) -> &AlgorithmDescriptor {
        &self.descriptor
    }

    fn execute(
        &self,
        _properties: &OptionsMap,
        _store: &dyn WorkspaceStore,
    ) -> Result<AlgorithmResult, ReductionError> {
        Err(ReductionError::algorithm(
            &self.descriptor.name,
            "only a description of the algorithm is available",
        ))
    }
}

/// Registry of [DescribedAlgorithm]s, one per descriptor.
pub fn described_registry(
    descriptors: &[AlgorithmDescriptor],
) -> Result<AlgorithmRegistry, ReductionError> {
    let mut registry = AlgorithmRegistry::new();
    for descriptor in descriptors {
        descriptor.validate()?;
        registry.register(Arc::new(DescribedAlgorithm::new(descriptor.clone())));
    }
    Ok(registry)
}

/// Planned reduction of one row.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RowPlan {
    pub reduced_name: String,
    /// Resolved options as a key=value list
    pub options: String,
    /// Input workspace names by algorithm property
    pub inputs: BTreeMap<String, String>,
    pub output_names: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Planned post-processing of a group.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PostprocessingPlan {
    pub algorithm: String,
    pub inputs: Vec<String>,
    pub output: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GroupPlan {
    pub name: String,
    pub rows: Vec<RowPlan>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub postprocessing: Option<PostprocessingPlan>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SlicingSummary {
    #[serde(rename = "type")]
    pub slicing_type: SlicingType,
    pub values: String,
}

/// What a reduction of a whole tree would do.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ReductionPlan {
    pub processing: String,
    pub shape: TreeShape,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slicing: Option<SlicingSummary>,
    pub groups: Vec<GroupPlan>,
    /// Number of rows whose options could not be resolved
    pub errors: usize,
}

impl ReductionPlan {
    /// Plan a reduction of every row of `tree`. The tree is left untouched.
    pub fn build(context: &ReductionContext, tree: &TreeManager) -> Self {
        let default_input = &context.processor.descriptor().default_input_property;
        let mut errors = 0;
        let mut groups = Vec::with_capacity(tree.groups().len());
        for group in tree.groups() {
            let mut rows = Vec::with_capacity(group.len());
            let mut resolved = Vec::with_capacity(group.len());
            for row in group.rows() {
                let mut row = row.clone();
                match context.resolve_row(&mut row) {
                    Ok(()) => {
                        let mut inputs = BTreeMap::new();
                        for (i, column) in context.whitelist.data_columns().iter().enumerate() {
                            let value = row.value(i).trim();
                            if value.is_empty() || column.algorithm_property.is_empty() {
                                continue;
                            }
                            let name = match context.preprocessing.get(&column.name) {
                                Some(step) => step.planned_name(value),
                                None if column.algorithm_property == *default_input => {
                                    Some(format!("{}{}", context.input_prefix, value))
                                }
                                None => None,
                            };
                            if let Some(name) = name {
                                inputs.insert(column.algorithm_property.clone(), name);
                            }
                        }
                        rows.push(RowPlan {
                            reduced_name: row.reduced_name().to_string(),
                            options: row.options().to_string(),
                            inputs,
                            output_names: row.output_names().to_vec(),
                            error: None,
                        });
                        resolved.push(row);
                    }
                    Err(error) => {
                        errors += 1;
                        rows.push(RowPlan {
                            reduced_name: String::new(),
                            options: String::new(),
                            inputs: BTreeMap::new(),
                            output_names: Vec::new(),
                            error: Some(error.node_message()),
                        });
                    }
                }
            }
            let postprocessing = match &context.postprocessing {
                Some(step) if tree.is_grouped() && group.len() > 1 && !resolved.is_empty() => {
                    Some(PostprocessingPlan {
                        algorithm: step.algorithm_name().to_string(),
                        inputs: resolved.iter().map(|row| step.input_name(row)).collect(),
                        output: step.output_name(&resolved),
                    })
                }
                _ => None,
            };
            groups.push(GroupPlan {
                name: group.name().to_string(),
                rows,
                postprocessing,
            });
        }
        ReductionPlan {
            processing: context.processor.descriptor().name.clone(),
            shape: tree.shape(),
            slicing: context.slicing.as_ref().map(|plan| SlicingSummary {
                slicing_type: plan.slicing_type(),
                values: plan.values().to_string(),
            }),
            groups,
            errors,
        }
    }
}
