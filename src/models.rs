//! Data types and associated functions and methods

use crate::error::ReductionError;

use serde::{Deserialize, Serialize};
use validator::Validate;

/// Name of the free-form options column.
pub const OPTIONS_COLUMN: &str = "Options";
/// Name of the hidden options column.
pub const HIDDEN_OPTIONS_COLUMN: &str = "HiddenOptions";
/// Name of the group key column in two-level tables.
pub const GROUP_COLUMN: &str = "Group";

/// One column of the table and the algorithm property it maps to
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct ColumnSpec {
    /// Column name, as shown in the table header
    #[validate(length(min = 1, message = "column name must not be empty"))]
    pub name: String,
    /// Algorithm property the column value is passed to. Empty for display-only columns.
    #[serde(default)]
    pub algorithm_property: String,
    /// Prefix used when the value contributes to the canonical output name
    #[serde(default)]
    pub prefix: String,
    /// Whether the value contributes to the canonical output name
    #[serde(default)]
    pub show_value: bool,
    /// Free-form description
    #[serde(default)]
    pub description: String,
}

impl ColumnSpec {
    /// Return a new ColumnSpec.
    pub fn new(name: &str, algorithm_property: &str, prefix: &str, show_value: bool) -> Self {
        ColumnSpec {
            name: name.to_string(),
            algorithm_property: algorithm_property.to_string(),
            prefix: prefix.to_string(),
            show_value,
            description: String::new(),
        }
    }
}

/// Ordered list of table columns ("whitelist").
///
/// The two reserved columns `Options` and `HiddenOptions` are always the last two entries.
#[derive(Clone, Debug, PartialEq)]
pub struct WhiteList {
    columns: Vec<ColumnSpec>,
}

impl WhiteList {
    /// Returns a whitelist made of `columns` followed by the two reserved option columns.
    pub fn new(columns: Vec<ColumnSpec>) -> Result<Self, ReductionError> {
        if columns.is_empty() {
            return Err(ReductionError::validation(
                "the whitelist must contain at least one column",
            ));
        }
        for (i, column) in columns.iter().enumerate() {
            if column.name == OPTIONS_COLUMN
                || column.name == HIDDEN_OPTIONS_COLUMN
                || column.name == GROUP_COLUMN
            {
                return Err(ReductionError::validation(format!(
                    "column name {} is reserved",
                    column.name
                )));
            }
            if columns[..i].iter().any(|other| other.name == column.name) {
                return Err(ReductionError::validation(format!(
                    "duplicate column {}",
                    column.name
                )));
            }
        }
        let mut columns = columns;
        columns.push(ColumnSpec::new(OPTIONS_COLUMN, "", "", false));
        columns.push(ColumnSpec::new(HIDDEN_OPTIONS_COLUMN, "", "", false));
        Ok(WhiteList { columns })
    }

    /// Number of columns, including the reserved option columns.
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Never true; a whitelist holds at least the reserved columns.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    /// Columns mapping to data, i.e. everything but the reserved option columns.
    pub fn data_columns(&self) -> &[ColumnSpec] {
        &self.columns[..self.columns.len() - 2]
    }

    pub fn column(&self, index: usize) -> Result<&ColumnSpec, ReductionError> {
        self.columns.get(index).ok_or(ReductionError::InvalidIndex {
            index,
            count: self.columns.len(),
        })
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column.name == name)
    }

    /// Index of the column mapping to `property`, if any.
    pub fn index_of_property(&self, property: &str) -> Option<usize> {
        self.data_columns()
            .iter()
            .position(|column| !property.is_empty() && column.algorithm_property == property)
    }

    pub fn options_column(&self) -> usize {
        self.columns.len() - 2
    }

    pub fn hidden_options_column(&self) -> usize {
        self.columns.len() - 1
    }

    pub fn names(&self) -> Vec<String> {
        self.columns.iter().map(|column| column.name.clone()).collect()
    }
}

/// Ordered association list of algorithm property names to values.
///
/// Setting an existing key overwrites its value in place, so the position of a key is the
/// position at which it was first set.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct OptionsMap(Vec<(String, String)>);

impl OptionsMap {
    pub fn new() -> Self {
        OptionsMap(Vec::new())
    }

    /// Parse a `key=value,key=value` string.
    pub fn parse(options: &str) -> Result<Self, ReductionError> {
        parse_key_value_string(options)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, value)| value.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.iter().any(|(k, _)| k == key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.0.push((key, value)),
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let index = self.0.iter().position(|(k, _)| k == key)?;
        Some(self.0.remove(index).1)
    }

    /// Overwrite entries with those of `other`, which takes precedence.
    pub fn merge(&mut self, other: &OptionsMap) {
        for (key, value) in other.iter() {
            self.set(key, value);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(k, _)| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for OptionsMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut options = OptionsMap::new();
        for (key, value) in iter {
            options.set(key, value);
        }
        options
    }
}

impl std::fmt::Display for OptionsMap {
    /// Formats the map as a `key=value` string that [OptionsMap::parse] accepts.
    ///
    /// Values containing a comma or a double quote are quoted, with each double quote doubled.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, (key, value)) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            if value.contains([',', '"']) {
                write!(f, "{}=\"{}\"", key, value.replace('"', "\"\""))?;
            } else {
                write!(f, "{}={}", key, value)?;
            }
        }
        Ok(())
    }
}

/// Parse a comma separated list of `key=value` pairs.
///
/// Values may be enclosed in double quotes to contain commas; a doubled quote inside a quoted
/// value stands for one double quote. Empty entries are skipped.
pub fn parse_key_value_string(options: &str) -> Result<OptionsMap, ReductionError> {
    let mut result = OptionsMap::new();
    for entry in split_outside_quotes(options, ',')? {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let (key, value) = entry.split_once('=').ok_or_else(|| {
            ReductionError::validation(format!("invalid option '{}': expected key=value", entry))
        })?;
        let key = key.trim();
        if key.is_empty() {
            return Err(ReductionError::validation(format!(
                "invalid option '{}': empty key",
                entry
            )));
        }
        result.set(key, unquote(value.trim()));
    }
    Ok(result)
}

/// Split `input` on `separator`, ignoring separators enclosed in double quotes.
fn split_outside_quotes(input: &str, separator: char) -> Result<Vec<&str>, ReductionError> {
    let mut parts = Vec::new();
    let mut quoted = false;
    let mut start = 0;
    for (i, c) in input.char_indices() {
        if c == '"' {
            quoted = !quoted;
        } else if c == separator && !quoted {
            parts.push(&input[start..i]);
            start = i + c.len_utf8();
        }
    }
    if quoted {
        return Err(ReductionError::validation(format!(
            "unterminated quote in '{}'",
            input
        )));
    }
    parts.push(&input[start..]);
    Ok(parts)
}

fn unquote(value: &str) -> String {
    match value.strip_prefix('"').and_then(|v| v.strip_suffix('"')) {
        Some(quoted) => quoted.replace("\"\"", "\""),
        None => value.to_string(),
    }
}

/// Split a multi-run value such as `13460+13462` or `13460, 13462` into trimmed runs.
pub fn split_runs(value: &str) -> Vec<String> {
    value
        .split(['+', ','])
        .map(str::trim)
        .filter(|run| !run.is_empty())
        .map(str::to_string)
        .collect()
}

/// Format a value for display with a fixed number of decimals, if it is numeric.
pub fn round_value(value: &str, precision: Option<usize>) -> String {
    match (precision, value.trim().parse::<f64>()) {
        (Some(precision), Ok(number)) => format!("{:.*}", precision, number),
        _ => value.to_string(),
    }
}
