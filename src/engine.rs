//! Row, slice and group execution.
//!
//! Everything in this module runs on the background execution slot. Functions take exclusive
//! ownership of copies of the rows they work on and hand them back to the scheduler on
//! completion; they never touch the tree.

use crate::algorithm::{run_algorithm, AlgorithmResult, ProcessingAlgorithm};
use crate::error::ReductionError;
use crate::hooks::{InputKind, ReductionHooks, SliceRequest, StoreHooks};
use crate::metrics::EXECUTION_TIME;
use crate::models::{OptionsMap, WhiteList};
use crate::postprocessing::PostprocessingStep;
use crate::preprocessing::PreprocessingStep;
use crate::row_data::{slice_suffix, RowData};
use crate::settings::SliceDisplay;
use crate::time_slicing::TimeSlicingPlan;
use crate::workspace_store::{Workspace, WorkspaceStore};

use hashbrown::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Runtime configuration shared by the scheduler and background work.
#[derive(Clone)]
pub struct ReductionContext {
    pub whitelist: WhiteList,
    pub processor: Arc<dyn ProcessingAlgorithm>,
    /// Pre-processing steps by column name
    pub preprocessing: HashMap<String, PreprocessingStep>,
    pub postprocessing: Option<PostprocessingStep>,
    pub hooks: Arc<dyn ReductionHooks>,
    /// Prefix used to locate the workspace of a run given in the default input column
    pub input_prefix: String,
    pub global_options: OptionsMap,
    pub slicing: Option<TimeSlicingPlan>,
    /// Decimal places used when filling blank cells from algorithm outputs
    pub round_precision: Option<usize>,
    pub slice_display: SliceDisplay,
}

impl std::fmt::Debug for ReductionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReductionContext")
            .field("whitelist", &self.whitelist)
            .field("processor", &self.processor.descriptor().name)
            .field("preprocessing", &self.preprocessing)
            .field("postprocessing", &self.postprocessing)
            .field("input_prefix", &self.input_prefix)
            .field("global_options", &self.global_options)
            .field("slicing", &self.slicing)
            .field("round_precision", &self.round_precision)
            .field("slice_display", &self.slice_display)
            .finish()
    }
}

impl ReductionContext {
    /// Returns a context with no pre- or post-processing, no slicing and [StoreHooks].
    pub fn new(
        whitelist: WhiteList,
        processor: Arc<dyn ProcessingAlgorithm>,
    ) -> Result<Self, ReductionError> {
        processor.descriptor().validate()?;
        Ok(ReductionContext {
            whitelist,
            processor,
            preprocessing: HashMap::new(),
            postprocessing: None,
            hooks: Arc::new(StoreHooks::default()),
            input_prefix: String::new(),
            global_options: OptionsMap::new(),
            slicing: None,
            round_precision: None,
            slice_display: SliceDisplay::LastSlice,
        })
    }

    pub fn with_preprocessing(
        mut self,
        column: &str,
        step: PreprocessingStep,
    ) -> Result<Self, ReductionError> {
        if self.whitelist.index_of(column).is_none() {
            return Err(ReductionError::validation(format!(
                "cannot pre-process unknown column {}",
                column
            )));
        }
        self.preprocessing.insert(column.to_string(), step);
        Ok(self)
    }

    pub fn with_postprocessing(mut self, step: PostprocessingStep) -> Self {
        self.postprocessing = Some(step);
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn ReductionHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_input_prefix(mut self, input_prefix: &str) -> Self {
        self.input_prefix = input_prefix.to_string();
        self
    }

    pub fn with_global_options(mut self, options: OptionsMap) -> Self {
        self.global_options = options;
        self
    }

    /// Use `plan` for every row. Disabled plans are dropped.
    pub fn with_slicing(mut self, plan: TimeSlicingPlan) -> Self {
        self.slicing = Some(plan).filter(TimeSlicingPlan::is_enabled);
        self
    }

    pub fn with_round_precision(mut self, precision: Option<usize>) -> Self {
        self.round_precision = precision;
        self
    }

    pub fn with_slice_display(mut self, slice_display: SliceDisplay) -> Self {
        self.slice_display = slice_display;
        self
    }

    /// Pairs of (output property, prefix) of the processing algorithm.
    pub fn outputs(&self) -> Vec<(String, String)> {
        self.processor.descriptor().outputs()
    }

    /// Resolve the options of `row` from its cells and the global options.
    pub fn resolve_row(&self, row: &mut RowData) -> Result<(), ReductionError> {
        row.resolve_options(&self.whitelist, &self.global_options, &self.outputs())?;
        let input = &self.processor.descriptor().default_input_property;
        if !row.options().contains_key(input) {
            return Err(ReductionError::validation(format!(
                "no value given for {}",
                input
            )));
        }
        Ok(())
    }
}

/// Reduce one row: pre-process its inputs, then run the processing algorithm once, or once per
/// time slice when slicing is enabled.
///
/// `row` must have its options resolved. The returned row carries pre-processed options, slices
/// and back-filled cells; its processed state is left to the caller.
#[tracing::instrument(level = "DEBUG", skip_all, fields(row = row.reduced_name()))]
pub fn reduce_row(
    context: &ReductionContext,
    store: &dyn WorkspaceStore,
    mut row: RowData,
) -> Result<RowData, ReductionError> {
    let start = Instant::now();
    preprocess_row(context, store, &mut row)?;
    match &context.slicing {
        Some(plan) => reduce_sliced(context, store, &mut row, plan.clone())?,
        None => {
            let result = execute(context, store, row.execution_options())?;
            row.backfill(&context.whitelist, &result.outputs, context.round_precision);
        }
    }
    EXECUTION_TIME
        .with_label_values(&["row"])
        .observe(start.elapsed().as_secs_f64());
    info!(row = row.reduced_name(), "row reduced");
    Ok(row)
}

/// Substitute pre-processed workspace names for the row's raw input values.
fn preprocess_row(
    context: &ReductionContext,
    store: &dyn WorkspaceStore,
    row: &mut RowData,
) -> Result<(), ReductionError> {
    let default_input = &context.processor.descriptor().default_input_property;
    let mut options = row.options().clone();
    for (i, column) in context.whitelist.data_columns().iter().enumerate() {
        let value = row.value(i).trim();
        if value.is_empty() || column.algorithm_property.is_empty() {
            continue;
        }
        let name = if let Some(step) = context.preprocessing.get(&column.name) {
            step.prepare(store, context.hooks.as_ref(), value)?
        } else if column.algorithm_property == *default_input {
            context
                .hooks
                .resolve_input_workspace(store, value, &context.input_prefix)?
        } else {
            continue;
        };
        debug!(column = %column.name, %value, %name, "pre-processed");
        options.set(&column.algorithm_property, name);
    }
    row.set_preprocessed_options(options)
}

fn execute(
    context: &ReductionContext,
    store: &dyn WorkspaceStore,
    options: &OptionsMap,
) -> Result<AlgorithmResult, ReductionError> {
    run_algorithm(context.processor.as_ref(), options, store)
}

/// Reduce each time slice of a row in order.
fn reduce_sliced(
    context: &ReductionContext,
    store: &dyn WorkspaceStore,
    row: &mut RowData,
    mut plan: TimeSlicingPlan,
) -> Result<(), ReductionError> {
    let descriptor = context.processor.descriptor();
    let input_property = &descriptor.default_input_property;
    let input = row
        .execution_options()
        .get(input_property)
        .map(str::to_string)
        .ok_or_else(|| ReductionError::validation(format!("no value given for {}", input_property)))?;
    if context.hooks.classify_input_kind(store, &input)? != InputKind::Event {
        return Err(ReductionError::algorithm(
            &descriptor.name,
            format!("cannot slice {}: it does not contain event data", input),
        ));
    }
    let duration = context.hooks.run_duration(store, &input)?;
    plan.resolve(duration)?;
    let count = plan.number_of_slices()?;

    let blank = row.blank_columns(&context.whitelist);
    row.clear_slices();
    for index in 0..count {
        let suffix = slice_suffix(index);
        let slice_input = format!("{}{}", input, suffix);
        context.hooks.take_slice(
            store,
            &SliceRequest {
                input: &input,
                output: &slice_input,
                window: plan.window(index)?,
                log_filter: plan.log_filter(),
            },
        )?;
        let slice = row.add_slice(&suffix, &descriptor.output_properties);
        slice.set_preprocessed_option(input_property, &slice_input)?;
        let result = execute(context, store, slice.execution_options())?;
        let display = match context.slice_display {
            SliceDisplay::LastSlice => true,
            SliceDisplay::FirstSlice => index == 0,
            SliceDisplay::None => false,
        };
        if display {
            row.fill_columns(
                &context.whitelist,
                &blank,
                &result.outputs,
                context.round_precision,
            );
        }
    }

    // Group the slice outputs under the row's canonical output names.
    for (i, property) in descriptor.output_properties.iter().enumerate() {
        let members: Vec<String> = row
            .slices()
            .iter()
            .filter_map(|slice| slice.options().get(property).map(str::to_string))
            .collect();
        if let Some(name) = row.output_names().get(i) {
            store.put(name, Workspace::group(members));
        }
    }
    Ok(())
}

/// Post-process a group from the reduced copies of its rows.
#[tracing::instrument(level = "DEBUG", skip_all, fields(output))]
pub fn postprocess_group(
    context: &ReductionContext,
    store: &dyn WorkspaceStore,
    rows: &[RowData],
) -> Result<String, ReductionError> {
    let start = Instant::now();
    let step = context
        .postprocessing
        .as_ref()
        .ok_or_else(|| ReductionError::validation("no post-processing configured"))?;
    let first = rows
        .first()
        .ok_or_else(|| ReductionError::validation("cannot post-process an empty group"))?;
    let overrides = context.hooks.postprocessing_overrides(first);
    let output = step.output_name(rows);
    tracing::Span::current().record("output", output.as_str());

    let counts: Vec<usize> = rows.iter().map(RowData::number_of_slices).collect();
    if counts.iter().all(|count| *count == 0) {
        let inputs: Vec<String> = rows.iter().map(|row| step.input_name(row)).collect();
        step.execute(store, &inputs, &output, &overrides)?;
    } else {
        if counts.iter().any(|count| *count != counts[0]) {
            return Err(ReductionError::algorithm(
                step.algorithm_name(),
                "cannot post-process rows with different numbers of slices",
            ));
        }
        let mut members = Vec::with_capacity(counts[0]);
        for index in 0..counts[0] {
            let inputs = rows
                .iter()
                .map(|row| Ok(step.input_name(row.slice(index)?)))
                .collect::<Result<Vec<String>, ReductionError>>()?;
            let slice_output = format!("{}{}", output, slice_suffix(index));
            step.execute(store, &inputs, &slice_output, &overrides)?;
            members.push(slice_output);
        }
        store.put(&output, Workspace::group(members));
    }
    EXECUTION_TIME
        .with_label_values(&["group"])
        .observe(start.elapsed().as_secs_f64());
    info!(%output, "group post-processed");
    Ok(output)
}
