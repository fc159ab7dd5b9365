//! Persisted tabular representation of the tree.

use crate::error::ReductionError;

use serde::{Deserialize, Serialize};
use std::path::Path;

/// A table of string cells with a header row.
///
/// In two-level tables column 0 holds the group key; the remaining columns match the whitelist
/// one to one.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TableWorkspace {
    /// Column names
    pub columns: Vec<String>,
    /// Row cells, each with one entry per column
    #[serde(default)]
    pub rows: Vec<Vec<String>>,
}

impl TableWorkspace {
    pub fn new(columns: Vec<String>) -> Self {
        TableWorkspace {
            columns,
            rows: Vec::new(),
        }
    }

    /// Append a row, checking its width against the header.
    pub fn push_row(&mut self, row: Vec<String>) -> Result<(), ReductionError> {
        if row.len() != self.columns.len() {
            return Err(ReductionError::validation(format!(
                "row has {} cells but the table has {} columns",
                row.len(),
                self.columns.len()
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    /// Load a table from a JSON file.
    pub fn load(path: &Path) -> Result<Self, ReductionError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ReductionError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Save the table to a JSON file.
    pub fn save(&self, path: &Path) -> Result<(), ReductionError> {
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents).map_err(|source| ReductionError::Io {
            path: path.display().to_string(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_test::{assert_de_tokens, assert_de_tokens_error, Token};

    #[test]
    fn test_deserialise() {
        let mut table = TableWorkspace::new(vec!["Group".to_string(), "Run(s)".to_string()]);
        table
            .push_row(vec!["0".to_string(), "13460".to_string()])
            .unwrap();
        assert_de_tokens(
            &table,
            &[
                Token::Struct {
                    name: "TableWorkspace",
                    len: 2,
                },
                Token::Str("columns"),
                Token::Seq { len: Some(2) },
                Token::Str("Group"),
                Token::Str("Run(s)"),
                Token::SeqEnd,
                Token::Str("rows"),
                Token::Seq { len: Some(1) },
                Token::Seq { len: Some(2) },
                Token::Str("0"),
                Token::Str("13460"),
                Token::SeqEnd,
                Token::SeqEnd,
                Token::StructEnd,
            ],
        );
    }

    #[test]
    fn test_missing_columns() {
        assert_de_tokens_error::<TableWorkspace>(
            &[
                Token::Struct {
                    name: "TableWorkspace",
                    len: 1,
                },
                Token::StructEnd,
            ],
            "missing field `columns`",
        );
    }

    #[test]
    #[should_panic(expected = "row has 1 cells but the table has 2 columns")]
    fn test_push_row_width() {
        let mut table = TableWorkspace::new(vec!["a".to_string(), "b".to_string()]);
        table.push_row(vec!["x".to_string()]).unwrap();
    }

    #[test]
    fn test_save_and_load() {
        let mut table = TableWorkspace::new(vec!["Run(s)".to_string()]);
        table.push_row(vec!["13460".to_string()]).unwrap();
        let path = std::env::temp_dir().join(format!("batchreduce-table-{}.json", std::process::id()));
        table.save(&path).unwrap();
        let loaded = TableWorkspace::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(table, loaded);
    }

    #[test]
    fn test_load_missing_file() {
        let error = TableWorkspace::load(Path::new("/nonexistent/table.json")).unwrap_err();
        assert_eq!("failed to read /nonexistent/table.json", error.to_string());
    }
}
