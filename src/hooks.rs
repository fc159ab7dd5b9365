//! Technique-specific hooks called by the generic scheduling code.
//!
//! The scheduler never inspects workspaces itself. Locating input runs, deciding whether an
//! input can be sliced, and materialising slices all go through [ReductionHooks].

use crate::error::ReductionError;
use crate::models::OptionsMap;
use crate::row_data::RowData;
use crate::time_slicing::TimeWindow;
use crate::workspace_store::{Workspace, WorkspaceKind, WorkspaceStore};

use serde::{Deserialize, Serialize};
use validator::Validate;

/// Kind of input a row resolves to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InputKind {
    /// Event data, which can be time sliced
    Event,
    /// Already binned data
    Histogram,
}

/// Request to materialise one time slice of an input.
#[derive(Clone, Debug, PartialEq)]
pub struct SliceRequest<'a> {
    /// Input workspace holding the whole run
    pub input: &'a str,
    /// Name for the sliced workspace
    pub output: &'a str,
    /// Time window of the slice
    pub window: TimeWindow,
    /// Log to filter by instead of time, for log value slicing
    pub log_filter: Option<&'a str>,
}

/// Copy a row option into a postprocessing property, optionally negating it.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct ParameterOverride {
    /// Option of the group's first row to read
    #[validate(length(min = 1, message = "row option must not be empty"))]
    pub row_option: String,
    /// Postprocessing property to set
    #[validate(length(min = 1, message = "postprocessing property must not be empty"))]
    pub property: String,
    /// Whether to flip the sign of the value
    #[serde(default)]
    pub negate: bool,
}

/// Strategy interface for technique-specific behaviour.
pub trait ReductionHooks: Send + Sync {
    /// Return the name of the workspace holding `run`, loading it if needed.
    fn resolve_input_workspace(
        &self,
        store: &dyn WorkspaceStore,
        run: &str,
        prefix: &str,
    ) -> Result<String, ReductionError>;

    fn classify_input_kind(
        &self,
        store: &dyn WorkspaceStore,
        name: &str,
    ) -> Result<InputKind, ReductionError>;

    /// Total duration of the run held in `name`, in seconds.
    fn run_duration(&self, store: &dyn WorkspaceStore, name: &str)
        -> Result<f64, ReductionError>;

    /// Filter, rebin and renormalise one slice of an input into `request.output`.
    fn take_slice(
        &self,
        store: &dyn WorkspaceStore,
        request: &SliceRequest,
    ) -> Result<(), ReductionError>;

    /// Extra postprocessing properties derived from the first row of a group.
    fn postprocessing_overrides(&self, _first_row: &RowData) -> OptionsMap {
        OptionsMap::new()
    }
}

/// [ReductionHooks] working directly on the logical workspaces of the store.
#[derive(Clone, Debug, Default)]
pub struct StoreHooks {
    overrides: Vec<ParameterOverride>,
}

impl StoreHooks {
    pub fn new(overrides: Vec<ParameterOverride>) -> Self {
        StoreHooks { overrides }
    }

    fn workspace(store: &dyn WorkspaceStore, name: &str) -> Result<Workspace, ReductionError> {
        store
            .get(name)
            .ok_or_else(|| ReductionError::WorkspaceNotFound {
                name: name.to_string(),
            })
    }
}

impl ReductionHooks for StoreHooks {
    /// Looks for the run under its own name first, then with `prefix`.
    fn resolve_input_workspace(
        &self,
        store: &dyn WorkspaceStore,
        run: &str,
        prefix: &str,
    ) -> Result<String, ReductionError> {
        let run = run.trim();
        if store.exists(run) {
            return Ok(run.to_string());
        }
        let prefixed = format!("{}{}", prefix, run);
        if store.exists(&prefixed) {
            return Ok(prefixed);
        }
        Err(ReductionError::WorkspaceNotFound { name: prefixed })
    }

    fn classify_input_kind(
        &self,
        store: &dyn WorkspaceStore,
        name: &str,
    ) -> Result<InputKind, ReductionError> {
        match Self::workspace(store, name)?.kind {
            WorkspaceKind::Event => Ok(InputKind::Event),
            _ => Ok(InputKind::Histogram),
        }
    }

    fn run_duration(
        &self,
        store: &dyn WorkspaceStore,
        name: &str,
    ) -> Result<f64, ReductionError> {
        Self::workspace(store, name)?
            .run_duration
            .ok_or_else(|| ReductionError::algorithm("RunDuration", format!("{} has no duration", name)))
    }

    /// Assumes the proton charge accumulates uniformly over the run.
    #[tracing::instrument(level = "DEBUG", skip(self, store))]
    fn take_slice(
        &self,
        store: &dyn WorkspaceStore,
        request: &SliceRequest,
    ) -> Result<(), ReductionError> {
        let input = Self::workspace(store, request.input)?;
        let duration = input.run_duration.unwrap_or(0.0);
        let total_charge = input.proton_charge.unwrap_or(0.0);
        if duration <= 0.0 || total_charge <= 0.0 {
            return Err(ReductionError::algorithm(
                "FilterEvents",
                format!("{} has no proton charge to normalise by", request.input),
            ));
        }
        let start = request.window.start.clamp(0.0, duration);
        let stop = request.window.stop.clamp(0.0, duration);
        let slice_charge = total_charge * (stop - start) / duration;
        let mut slice = Workspace::histogram();
        slice.run_duration = Some(stop - start);
        slice.proton_charge = Some(slice_charge);
        slice.scale_factor = input.scale_factor * slice_charge / total_charge;
        slice
            .properties
            .insert("slice_source".to_string(), request.input.to_string());
        slice.properties.insert(
            "slice_window".to_string(),
            format!("{}-{}", request.window.start, request.window.stop),
        );
        if let Some(log_filter) = request.log_filter {
            slice
                .properties
                .insert("slice_log_filter".to_string(), log_filter.to_string());
        }
        store.put(request.output, slice);
        Ok(())
    }

    fn postprocessing_overrides(&self, first_row: &RowData) -> OptionsMap {
        let mut result = OptionsMap::new();
        let options = first_row
            .preprocessed_options()
            .unwrap_or_else(|| first_row.options());
        for parameter in &self.overrides {
            if let Some(value) = options.get(&parameter.row_option) {
                let value = if parameter.negate {
                    negate(value)
                } else {
                    value.to_string()
                };
                result.set(&parameter.property, value);
            }
        }
        result
    }
}

/// Flip the sign of a numeric value, leaving anything else unchanged.
fn negate(value: &str) -> String {
    match value.trim().parse::<f64>() {
        Ok(number) => (-number).to_string(),
        Err(_) => value.to_string(),
    }
}
