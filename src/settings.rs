//! Reduction settings document.
//!
//! Settings are read from a JSON document, deserialised with serde and validated with the
//! validator crate before they are turned into a [ReductionContext].

use crate::algorithm::{AlgorithmDescriptor, AlgorithmRegistry};
use crate::engine::ReductionContext;
use crate::error::ReductionError;
use crate::hooks::{ParameterOverride, StoreHooks};
use crate::models::{parse_key_value_string, ColumnSpec, OptionsMap, WhiteList};
use crate::postprocessing::PostprocessingStep;
use crate::preprocessing::PreprocessingStep;
use crate::time_slicing::{SlicingType, TimeSlicingPlan};
use crate::tree_manager::TreeShape;

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use validator::{Validate, ValidationError};

/// Which slice fills the blank cells of a sliced row
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SliceDisplay {
    /// Each slice overwrites the previous one, leaving the last slice's values
    #[default]
    LastSlice,
    FirstSlice,
    /// Blank cells are left untouched
    None,
}

/// Pre-processing of one column
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct PreprocessingSettings {
    /// Column whose values are pre-processed
    #[validate(length(min = 1, message = "pre-processing column must not be empty"))]
    pub column: String,
    /// Binary algorithm combining two runs
    #[validate(length(min = 1, message = "pre-processing algorithm must not be empty"))]
    pub algorithm: String,
    /// Prefix of the combined workspace
    #[serde(default)]
    pub prefix: String,
    /// Separator between runs in the combined workspace name
    #[serde(default = "default_separator")]
    pub separator: String,
    /// Prefix used to locate each run
    #[serde(default)]
    pub input_prefix: String,
    /// Extra options, as a key=value list
    #[serde(default)]
    #[validate(custom = "validate_options")]
    pub options: String,
}

fn default_separator() -> String {
    "_".to_string()
}

/// Post-processing of groups
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct PostprocessingSettings {
    #[validate(length(min = 1, message = "post-processing algorithm must not be empty"))]
    pub algorithm: String,
    /// Prefix of the row outputs to combine
    #[serde(default)]
    pub input_prefix: String,
    /// Prefix of the group output
    #[serde(default)]
    pub prefix: String,
    /// Extra options, as a key=value list
    #[serde(default)]
    #[validate(custom = "validate_options")]
    pub options: String,
}

/// Time slicing applied to every row
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TimeSlicingSettings {
    #[serde(rename = "type")]
    pub slicing_type: SlicingType,
    /// Slicing specification; empty to disable slicing
    #[serde(default)]
    pub values: String,
}

/// Batch reduction settings
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize, Validate)]
#[serde(deny_unknown_fields)]
#[validate(schema(function = "validate_settings"))]
pub struct ReductionSettings {
    /// Shape of the tree
    #[serde(default)]
    pub shape: TreeShape,
    /// Table columns, excluding the reserved option columns
    #[validate]
    #[validate(length(min = 1, message = "at least one column must be given"))]
    pub columns: Vec<ColumnSpec>,
    /// Name of the processing algorithm
    #[validate(length(min = 1, message = "processing algorithm must not be empty"))]
    pub processing: String,
    /// Descriptors of the algorithms referred to by name
    #[serde(default)]
    pub algorithms: Vec<AlgorithmDescriptor>,
    /// Prefix used to locate the workspace of a run
    #[serde(default)]
    pub input_prefix: String,
    /// Options applied to every row, as a key=value list
    #[serde(default)]
    #[validate(custom = "validate_options")]
    pub global_options: String,
    #[serde(default)]
    #[validate]
    pub preprocessing: Vec<PreprocessingSettings>,
    #[validate]
    pub postprocessing: Option<PostprocessingSettings>,
    /// Post-processing properties copied from the first row of a group
    #[serde(default)]
    #[validate]
    pub postprocessing_overrides: Vec<ParameterOverride>,
    pub time_slicing: Option<TimeSlicingSettings>,
    /// Decimal places of values filled in from algorithm outputs
    #[validate(range(max = 15, message = "round precision must be at most 15"))]
    pub round_precision: Option<usize>,
    #[serde(default)]
    pub slice_display: SliceDisplay,
}

fn validate_options(options: &str) -> Result<(), ValidationError> {
    parse_key_value_string(options)
        .map(|_| ())
        .map_err(|_| ValidationError::new("options must be a list of key=value pairs"))
}

fn validate_settings(settings: &ReductionSettings) -> Result<(), ValidationError> {
    // Validation across multiple fields of ReductionSettings.
    for preprocessing in &settings.preprocessing {
        if !settings
            .columns
            .iter()
            .any(|column| column.name == preprocessing.column)
        {
            let mut error = ValidationError::new("pre-processing refers to an unknown column");
            error.add_param("column".into(), &preprocessing.column);
            return Err(error);
        }
    }
    if let Some(slicing) = &settings.time_slicing {
        if TimeSlicingPlan::new(slicing.slicing_type, &slicing.values).is_err() {
            let mut error = ValidationError::new("time slicing values are not valid");
            error.add_param("values".into(), &slicing.values);
            return Err(error);
        }
    }
    if !settings.postprocessing_overrides.is_empty() && settings.postprocessing.is_none() {
        return Err(ValidationError::new(
            "post-processing overrides require post-processing",
        ));
    }
    Ok(())
}

impl ReductionSettings {
    /// Read and validate settings from a JSON file.
    pub fn load(path: &Path) -> Result<Self, ReductionError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ReductionError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&contents)
    }

    /// Parse and validate settings from a JSON string.
    pub fn from_json(contents: &str) -> Result<Self, ReductionError> {
        let settings: ReductionSettings = serde_json::from_str(contents)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn whitelist(&self) -> Result<WhiteList, ReductionError> {
        WhiteList::new(self.columns.clone())
    }

    /// The slicing plan, if slicing is configured and enabled.
    pub fn slicing_plan(&self) -> Result<Option<TimeSlicingPlan>, ReductionError> {
        match &self.time_slicing {
            Some(slicing) => {
                let plan = TimeSlicingPlan::new(slicing.slicing_type, &slicing.values)?;
                Ok(Some(plan).filter(TimeSlicingPlan::is_enabled))
            }
            None => Ok(None),
        }
    }

    /// Build the runtime context, looking algorithms up in `registry`.
    pub fn context(&self, registry: &AlgorithmRegistry) -> Result<ReductionContext, ReductionError> {
        let mut context = ReductionContext::new(self.whitelist()?, registry.get(&self.processing)?)?
            .with_hooks(Arc::new(StoreHooks::new(
                self.postprocessing_overrides.clone(),
            )))
            .with_input_prefix(&self.input_prefix)
            .with_global_options(OptionsMap::parse(&self.global_options)?)
            .with_round_precision(self.round_precision)
            .with_slice_display(self.slice_display);
        for preprocessing in &self.preprocessing {
            let step = PreprocessingStep::new(
                registry.get(&preprocessing.algorithm)?,
                &preprocessing.prefix,
                &preprocessing.separator,
            )?
            .with_input_prefix(&preprocessing.input_prefix)
            .with_options(OptionsMap::parse(&preprocessing.options)?);
            context = context.with_preprocessing(&preprocessing.column, step)?;
        }
        if let Some(postprocessing) = &self.postprocessing {
            let step = PostprocessingStep::new(
                registry.get(&postprocessing.algorithm)?,
                &postprocessing.input_prefix,
                &postprocessing.prefix,
            )
            .with_options(OptionsMap::parse(&postprocessing.options)?);
            context = context.with_postprocessing(step);
        }
        if let Some(plan) = self.slicing_plan()? {
            context = context.with_slicing(plan);
        }
        Ok(context)
    }
}
