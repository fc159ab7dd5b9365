//! The unit of work: one row of the table.

use crate::error::ReductionError;
use crate::models::{round_value, split_runs, OptionsMap, WhiteList};

use strum_macros::Display;

/// Identity of a row, stable across structural edits and asynchronous execution.
pub type RowId = u64;

/// Processing state of a row or group.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum NodeState {
    Unprocessed,
    Processing,
    Processed,
    Failed,
}

/// Suffix appended to names derived from the slice at `index`.
pub fn slice_suffix(index: usize) -> String {
    format!("_slice_{}", index)
}

/// Canonical name of a row, built from the columns marked `show_value`.
///
/// Multi-run values are normalised to `+` separated runs and the parts are joined with `_`.
pub fn reduced_name(whitelist: &WhiteList, values: &[String]) -> String {
    whitelist
        .data_columns()
        .iter()
        .enumerate()
        .filter(|(_, column)| column.show_value)
        .filter_map(|(i, column)| {
            let value = values.get(i)?.trim();
            if value.is_empty() {
                None
            } else {
                Some(format!("{}{}", column.prefix, split_runs(value).join("+")))
            }
        })
        .collect::<Vec<String>>()
        .join("_")
}

/// Row values, resolved algorithm options and processing state.
///
/// A failed row is a processed row with a non-empty error.
#[derive(Clone, Debug, PartialEq)]
pub struct RowData {
    id: RowId,
    data: Vec<String>,
    options: OptionsMap,
    options_resolved: bool,
    preprocessed_options: Option<OptionsMap>,
    output_names: Vec<String>,
    reduced_name: String,
    processed: bool,
    error: String,
    slices: Vec<RowData>,
}

impl RowData {
    pub fn new(id: RowId, data: Vec<String>) -> Self {
        RowData {
            id,
            data,
            options: OptionsMap::new(),
            options_resolved: false,
            preprocessed_options: None,
            output_names: Vec::new(),
            reduced_name: String::new(),
            processed: false,
            error: String::new(),
            slices: Vec::new(),
        }
    }

    pub fn id(&self) -> RowId {
        self.id
    }

    pub fn values(&self) -> &[String] {
        &self.data
    }

    /// Value of column `index`; empty for columns the row does not have.
    pub fn value(&self, index: usize) -> &str {
        self.data.get(index).map(String::as_str).unwrap_or("")
    }

    /// Set the value of a column, invalidating resolved options.
    pub fn set_value(&mut self, index: usize, value: &str) -> Result<(), ReductionError> {
        let count = self.data.len();
        let cell = self
            .data
            .get_mut(index)
            .ok_or(ReductionError::InvalidIndex { index, count })?;
        if cell.as_str() != value {
            *cell = value.to_string();
            self.options_resolved = false;
            self.preprocessed_options = None;
        }
        Ok(())
    }

    /// Whether every cell is blank.
    pub fn is_blank(&self) -> bool {
        self.data.iter().all(|value| value.trim().is_empty())
    }

    /// Resolve the algorithm options of the row.
    ///
    /// Sources are merged in increasing order of precedence: `global` defaults, the hidden
    /// options column, the options column, per-column values and finally the output workspace
    /// names, one per `(property, prefix)` pair in `outputs`.
    pub fn resolve_options(
        &mut self,
        whitelist: &WhiteList,
        global: &OptionsMap,
        outputs: &[(String, String)],
    ) -> Result<&OptionsMap, ReductionError> {
        let mut options = global.clone();
        options.merge(&OptionsMap::parse(
            self.value(whitelist.hidden_options_column()),
        )?);
        options.merge(&OptionsMap::parse(self.value(whitelist.options_column()))?);
        for (i, column) in whitelist.data_columns().iter().enumerate() {
            let value = self.value(i).trim();
            if !value.is_empty() && !column.algorithm_property.is_empty() {
                options.set(&column.algorithm_property, value);
            }
        }
        let name = reduced_name(whitelist, &self.data);
        if name.is_empty() && !outputs.is_empty() {
            return Err(ReductionError::validation(
                "row has no values to build its output name from",
            ));
        }
        let mut output_names = Vec::with_capacity(outputs.len());
        for (property, prefix) in outputs {
            let output_name = format!("{}{}", prefix, name);
            options.set(property, &output_name);
            output_names.push(output_name);
        }
        self.options = options;
        self.options_resolved = true;
        self.preprocessed_options = None;
        self.output_names = output_names;
        self.reduced_name = name;
        Ok(&self.options)
    }

    pub fn options_resolved(&self) -> bool {
        self.options_resolved
    }

    pub fn options(&self) -> &OptionsMap {
        &self.options
    }

    /// Options after pre-processing substitution, once set.
    pub fn preprocessed_options(&self) -> Option<&OptionsMap> {
        self.preprocessed_options.as_ref()
    }

    pub fn set_preprocessed_options(&mut self, options: OptionsMap) -> Result<(), ReductionError> {
        if !self.options_resolved {
            return Err(ReductionError::validation(
                "options must be resolved before they are pre-processed",
            ));
        }
        self.preprocessed_options = Some(options);
        Ok(())
    }

    /// Set one pre-processed option, starting from the resolved options if needed.
    pub fn set_preprocessed_option(&mut self, key: &str, value: &str) -> Result<(), ReductionError> {
        if !self.options_resolved {
            return Err(ReductionError::validation(
                "options must be resolved before they are pre-processed",
            ));
        }
        self.preprocessed_options
            .get_or_insert_with(|| self.options.clone())
            .set(key, value);
        Ok(())
    }

    /// Options to execute the row with: pre-processed if available, resolved otherwise.
    pub fn execution_options(&self) -> &OptionsMap {
        self.preprocessed_options.as_ref().unwrap_or(&self.options)
    }

    /// Canonical name cached by the last [RowData::resolve_options].
    pub fn reduced_name(&self) -> &str {
        &self.reduced_name
    }

    /// Canonical output workspace names cached by the last [RowData::resolve_options].
    pub fn output_names(&self) -> &[String] {
        &self.output_names
    }

    pub fn is_processed(&self) -> bool {
        self.processed
    }

    pub fn has_error(&self) -> bool {
        !self.error.is_empty()
    }

    pub fn error(&self) -> &str {
        &self.error
    }

    pub fn state(&self) -> NodeState {
        match (self.processed, self.error.is_empty()) {
            (false, _) => NodeState::Unprocessed,
            (true, true) => NodeState::Processed,
            (true, false) => NodeState::Failed,
        }
    }

    /// Set the terminal state of the row, and of its slices on success.
    pub fn mark_processed(&mut self, error: Option<&str>) {
        self.processed = true;
        self.error = error.unwrap_or_default().to_string();
        if error.is_none() {
            for slice in self.slices.iter_mut() {
                slice.mark_processed(None);
            }
        }
    }

    /// Record an error against an already processed row.
    pub fn invalidate(&mut self, message: &str) {
        self.error = message.to_string();
    }

    /// Return the row to the unprocessed state.
    pub fn reset(&mut self) {
        self.processed = false;
        self.error.clear();
        self.slices.clear();
        self.preprocessed_options = None;
    }

    /// Add a slice of this row.
    ///
    /// The slice starts from the parent's options with each property in `rename` suffixed with
    /// `suffix`.
    pub fn add_slice(&mut self, suffix: &str, rename: &[String]) -> &mut RowData {
        let mut options = self.execution_options().clone();
        for property in rename {
            if let Some(value) = options.get(property).map(str::to_string) {
                options.set(property, format!("{}{}", value, suffix));
            }
        }
        let slice = RowData {
            id: self.id,
            data: self.data.clone(),
            options: options.clone(),
            options_resolved: true,
            preprocessed_options: Some(options),
            output_names: self
                .output_names
                .iter()
                .map(|name| format!("{}{}", name, suffix))
                .collect(),
            reduced_name: format!("{}{}", self.reduced_name, suffix),
            processed: false,
            error: String::new(),
            slices: Vec::new(),
        };
        let index = self.slices.len();
        self.slices.push(slice);
        &mut self.slices[index]
    }

    pub fn slice(&self, index: usize) -> Result<&RowData, ReductionError> {
        self.slices.get(index).ok_or(ReductionError::InvalidIndex {
            index,
            count: self.slices.len(),
        })
    }

    pub fn slice_mut(&mut self, index: usize) -> Result<&mut RowData, ReductionError> {
        let count = self.slices.len();
        self.slices
            .get_mut(index)
            .ok_or(ReductionError::InvalidIndex { index, count })
    }

    pub fn slices(&self) -> &[RowData] {
        &self.slices
    }

    pub fn number_of_slices(&self) -> usize {
        self.slices.len()
    }

    pub fn clear_slices(&mut self) {
        self.slices.clear();
    }

    /// Indices of columns the user left blank that an algorithm output could fill.
    pub fn blank_columns(&self, whitelist: &WhiteList) -> Vec<usize> {
        whitelist
            .data_columns()
            .iter()
            .enumerate()
            .filter(|(i, column)| {
                !column.algorithm_property.is_empty() && self.value(*i).trim().is_empty()
            })
            .map(|(i, _)| i)
            .collect()
    }

    /// Fill `columns` from the algorithm's reported `outputs`.
    ///
    /// Numeric values are rounded to `precision` decimals when given.
    pub fn fill_columns(
        &mut self,
        whitelist: &WhiteList,
        columns: &[usize],
        outputs: &OptionsMap,
        precision: Option<usize>,
    ) {
        for &i in columns {
            let Some(column) = whitelist.data_columns().get(i) else {
                continue;
            };
            if let (Some(value), Some(cell)) =
                (outputs.get(&column.algorithm_property), self.data.get_mut(i))
            {
                *cell = round_value(value, precision);
            }
        }
    }

    /// Fill every blank column from the algorithm's reported `outputs`.
    pub fn backfill(&mut self, whitelist: &WhiteList, outputs: &OptionsMap, precision: Option<usize>) {
        let columns = self.blank_columns(whitelist);
        self.fill_columns(whitelist, &columns, outputs, precision);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils;

    fn resolved_row(values: &[&str]) -> RowData {
        let whitelist = test_utils::get_test_whitelist();
        let mut row = test_utils::get_test_row(1, values);
        row.resolve_options(
            &whitelist,
            &test_utils::get_test_global_options(),
            &test_utils::get_test_descriptor().outputs(),
        )
        .unwrap();
        row
    }

    #[test]
    fn test_reduced_name() {
        let whitelist = test_utils::get_test_whitelist();
        let values: Vec<String> = ["13460, 13462", "0.7", "13463", "", "", ""]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!("13460+13462_th=0.7", reduced_name(&whitelist, &values));
    }

    #[test]
    fn test_resolve_options_precedence() {
        let row = resolved_row(&[
            "13460",
            "0.7",
            "",
            "",
            "ThetaIn=0.5,WavelengthMin=2,AnalysisMode=MultiDetectorAnalysis",
            "WavelengthMin=1,Debug=1",
        ]);
        let options = row.options();
        // Global default.
        assert_eq!(Some("1"), options.get("ScaleFactor"));
        // Hidden options overrides global.
        assert_eq!(Some("1"), options.get("Debug"));
        // Options column overrides hidden options and global.
        assert_eq!(Some("2"), options.get("WavelengthMin"));
        assert_eq!(Some("MultiDetectorAnalysis"), options.get("AnalysisMode"));
        // Column value overrides options column.
        assert_eq!(Some("0.7"), options.get("ThetaIn"));
        assert_eq!(Some("13460"), options.get("InputWorkspace"));
        // Blank columns are not passed on.
        assert!(!options.contains_key("MomentumTransferMin"));
        // Output names are computed.
        assert_eq!(Some("IvsQ_13460_th=0.7"), options.get("OutputWorkspace"));
        assert_eq!(
            Some("IvsQ_binned_13460_th=0.7"),
            options.get("OutputWorkspaceBinned")
        );
        assert_eq!("13460_th=0.7", row.reduced_name());
        assert_eq!(3, row.output_names().len());
        assert!(row.options_resolved());
        assert!(row.preprocessed_options().is_none());
    }

    #[test]
    fn test_output_name_overrides_options_column() {
        let row = resolved_row(&["13460", "0.7", "", "", "OutputWorkspace=foo", ""]);
        assert_eq!(Some("IvsQ_13460_th=0.7"), row.options().get("OutputWorkspace"));
    }

    #[test]
    #[should_panic(expected = "invalid option 'foo': expected key=value")]
    fn test_resolve_options_malformed() {
        resolved_row(&["13460", "0.7", "", "", "foo", ""]);
    }

    #[test]
    #[should_panic(expected = "row has no values to build its output name from")]
    fn test_resolve_options_no_name() {
        resolved_row(&["", "", "13463", "", "", ""]);
    }

    #[test]
    fn test_set_value_invalidates() {
        let mut row = resolved_row(&["13460", "0.7", "", "", "", ""]);
        row.set_preprocessed_option("InputWorkspace", "TOF_13460").unwrap();
        row.set_value(1, "0.7").unwrap();
        assert!(row.options_resolved());
        row.set_value(1, "0.8").unwrap();
        assert!(!row.options_resolved());
        assert!(row.preprocessed_options().is_none());
        assert!(row.set_value(10, "x").is_err());
    }

    #[test]
    fn test_preprocessed_requires_resolved() {
        let mut row = test_utils::get_test_row(1, &["13460", "0.7", "", "", "", ""]);
        assert!(row.set_preprocessed_options(OptionsMap::new()).is_err());
        assert!(row.set_preprocessed_option("a", "b").is_err());
    }

    #[test]
    fn test_preprocessed_option() {
        let mut row = resolved_row(&["13460+13462", "0.7", "", "", "", ""]);
        row.set_preprocessed_option("InputWorkspace", "TOF_13460_13462")
            .unwrap();
        let preprocessed = row.preprocessed_options().unwrap();
        assert_eq!(Some("TOF_13460_13462"), preprocessed.get("InputWorkspace"));
        assert_eq!(Some("0.7"), preprocessed.get("ThetaIn"));
        assert_eq!(Some("13460+13462"), row.options().get("InputWorkspace"));
        assert_eq!(
            Some("TOF_13460_13462"),
            row.execution_options().get("InputWorkspace")
        );
    }

    #[test]
    fn test_state_transitions() {
        let mut row = resolved_row(&["13460", "0.7", "", "", "", ""]);
        assert_eq!(NodeState::Unprocessed, row.state());
        row.mark_processed(None);
        assert_eq!(NodeState::Processed, row.state());
        row.invalidate("gone");
        assert_eq!(NodeState::Failed, row.state());
        assert!(row.is_processed());
        row.reset();
        assert_eq!(NodeState::Unprocessed, row.state());
        row.mark_processed(Some("bad"));
        assert_eq!(NodeState::Failed, row.state());
        assert_eq!("bad", row.error());
    }

    #[test]
    fn test_add_slice() {
        let mut row = resolved_row(&["13460", "0.7", "", "", "", ""]);
        let rename = vec!["OutputWorkspace".to_string(), "InputWorkspace".to_string()];
        row.add_slice(&slice_suffix(0), &rename);
        let slice = row.add_slice(&slice_suffix(1), &rename);
        assert_eq!(Some("IvsQ_13460_th=0.7_slice_1"), slice.options().get("OutputWorkspace"));
        assert_eq!(Some("13460_slice_1"), slice.options().get("InputWorkspace"));
        assert_eq!(
            Some("IvsQ_binned_13460_th=0.7"),
            slice.options().get("OutputWorkspaceBinned")
        );
        assert_eq!("13460_th=0.7_slice_1", slice.reduced_name());
        assert_eq!(2, row.number_of_slices());
        assert_eq!(
            "13460_th=0.7_slice_0",
            row.slice(0).unwrap().reduced_name()
        );
        row.mark_processed(None);
        assert!(row.slices().iter().all(RowData::is_processed));
    }

    #[test]
    fn test_slice_out_of_range() {
        let mut row = resolved_row(&["13460", "0.7", "", "", "", ""]);
        row.add_slice("_slice_0", &[]);
        assert!(matches!(
            row.slice(1),
            Err(ReductionError::InvalidIndex { index: 1, count: 1 })
        ));
        assert!(row.slice_mut(3).is_err());
    }

    #[test]
    fn test_backfill() {
        let whitelist = test_utils::get_test_whitelist();
        let mut row = resolved_row(&["13460", "", "", "0.01", "", ""]);
        assert_eq!(vec![1, 2], row.blank_columns(&whitelist));
        let outputs: OptionsMap = [
            ("ThetaIn", "0.69999"),
            ("MomentumTransferMin", "0.5"),
            ("FirstTransmissionRun", "TRANS_1"),
        ]
        .into_iter()
        .collect();
        row.backfill(&whitelist, &outputs, Some(3));
        assert_eq!("0.700", row.value(1));
        assert_eq!("TRANS_1", row.value(2));
        // Values given by the user are kept.
        assert_eq!("0.01", row.value(3));
    }

    #[test]
    fn test_is_blank() {
        assert!(test_utils::get_test_row(1, &["", " ", "", "", "", ""]).is_blank());
        assert!(!test_utils::get_test_row(1, &["1", "", "", "", "", ""]).is_blank());
    }
}
