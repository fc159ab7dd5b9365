//! The two-level Group → Row hierarchy.
//!
//! A [TreeManager] holds the rows of a reduction table, either in named groups
//! ([TreeShape::Grouped]) or in a single hidden group ([TreeShape::Flat]). Flat trees have no
//! group-level state and are never post-processed.

use crate::error::ReductionError;
use crate::models::{WhiteList, GROUP_COLUMN};
use crate::row_data::{NodeState, RowData, RowId};
use crate::table::TableWorkspace;
use crate::workspace_store::{Workspace, WorkspaceKind, WorkspaceStore};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Shape of the tree
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TreeShape {
    /// Rows only
    Flat,
    /// Rows in named groups
    #[default]
    Grouped,
}

/// An ordered set of rows whose outputs may be post-processed together.
#[derive(Clone, Debug, PartialEq)]
pub struct Group {
    name: String,
    rows: Vec<RowData>,
    processed: bool,
    error: String,
    output_name: String,
}

impl Group {
    fn new(name: &str) -> Self {
        Group {
            name: name.to_string(),
            rows: Vec::new(),
            processed: false,
            error: String::new(),
            output_name: String::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rows(&self) -> &[RowData] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn row(&self, index: usize) -> Result<&RowData, ReductionError> {
        self.rows.get(index).ok_or(ReductionError::InvalidIndex {
            index,
            count: self.rows.len(),
        })
    }

    pub(crate) fn row_mut(&mut self, index: usize) -> Result<&mut RowData, ReductionError> {
        let count = self.rows.len();
        self.rows
            .get_mut(index)
            .ok_or(ReductionError::InvalidIndex { index, count })
    }

    /// Whether every row has reached a terminal state.
    pub fn all_rows_processed(&self) -> bool {
        self.rows.iter().all(RowData::is_processed)
    }

    /// Number of rows in the failed state.
    pub fn failed_rows(&self) -> usize {
        self.rows.iter().filter(|row| row.has_error()).count()
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

    /// Canonical name of the post-processed output; empty until the group is post-processed.
    pub fn output_name(&self) -> &str {
        &self.output_name
    }

    pub(crate) fn set_output_name(&mut self, name: &str) {
        self.output_name = name.to_string();
    }

    pub(crate) fn mark_processed(&mut self, error: Option<&str>) {
        self.processed = true;
        self.error = error.unwrap_or_default().to_string();
    }

    pub(crate) fn invalidate(&mut self, message: &str) {
        self.error = message.to_string();
    }

    pub(crate) fn reset(&mut self) {
        self.processed = false;
        self.error.clear();
        self.output_name.clear();
    }
}

/// A selection of groups and rows.
///
/// Selecting a group selects all of its rows.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Selection {
    all: bool,
    groups: BTreeSet<usize>,
    rows: BTreeMap<usize, BTreeSet<usize>>,
}

impl Selection {
    /// Everything in the tree.
    pub fn all() -> Self {
        Selection {
            all: true,
            ..Default::default()
        }
    }

    pub fn groups(groups: impl IntoIterator<Item = usize>) -> Self {
        Selection {
            groups: groups.into_iter().collect(),
            ..Default::default()
        }
    }

    /// Individual rows, as (group, row) pairs.
    pub fn rows(rows: impl IntoIterator<Item = (usize, usize)>) -> Self {
        let mut selection = Selection::default();
        for (group, row) in rows {
            selection.rows.entry(group).or_default().insert(row);
        }
        selection
    }

    pub fn is_empty(&self) -> bool {
        !self.all && self.groups.is_empty() && self.rows.is_empty()
    }
}

/// One successfully processed node and its canonical output names.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ProcessedOutput {
    pub group: usize,
    /// Row index, or None for a post-processed group
    pub row: Option<usize>,
    pub output_names: Vec<String>,
    /// Whether every output is still in the workspace store
    pub in_store: bool,
}

/// Owner of the Group → Row hierarchy.
#[derive(Clone, Debug)]
pub struct TreeManager {
    shape: TreeShape,
    whitelist: WhiteList,
    groups: Vec<Group>,
    next_id: RowId,
}

impl TreeManager {
    /// Returns an empty tree. A flat tree holds its single hidden group from the start.
    pub fn new(shape: TreeShape, whitelist: WhiteList) -> Self {
        let mut tree = TreeManager {
            shape,
            whitelist,
            groups: Vec::new(),
            next_id: 0,
        };
        tree.new_table();
        tree
    }

    pub fn shape(&self) -> TreeShape {
        self.shape
    }

    pub fn whitelist(&self) -> &WhiteList {
        &self.whitelist
    }

    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    pub fn group(&self, index: usize) -> Result<&Group, ReductionError> {
        self.groups.get(index).ok_or(ReductionError::InvalidIndex {
            index,
            count: self.groups.len(),
        })
    }

    pub(crate) fn group_mut(&mut self, index: usize) -> Result<&mut Group, ReductionError> {
        let count = self.groups.len();
        self.groups
            .get_mut(index)
            .ok_or(ReductionError::InvalidIndex { index, count })
    }

    pub fn row(&self, group: usize, row: usize) -> Result<&RowData, ReductionError> {
        self.group(group)?.row(row)
    }

    pub(crate) fn row_mut(&mut self, group: usize, row: usize) -> Result<&mut RowData, ReductionError> {
        self.group_mut(group)?.row_mut(row)
    }

    /// Current location of the row with identity `id`.
    pub fn find_row(&self, id: RowId) -> Option<(usize, usize)> {
        self.groups.iter().enumerate().find_map(|(g, group)| {
            group
                .rows
                .iter()
                .position(|row| row.id() == id)
                .map(|r| (g, r))
        })
    }

    pub fn number_of_rows(&self) -> usize {
        self.groups.iter().map(Group::len).sum()
    }

    /// Whether the tree carries group-level state and post-processing.
    pub fn is_grouped(&self) -> bool {
        self.shape == TreeShape::Grouped
    }

    fn require_grouped(&self, operation: &str) -> Result<(), ReductionError> {
        if self.is_grouped() {
            Ok(())
        } else {
            Err(ReductionError::validation(format!(
                "cannot {} in a flat table",
                operation
            )))
        }
    }

    /// Remove every row and group.
    pub fn new_table(&mut self) {
        self.groups.clear();
        if !self.is_grouped() {
            self.groups.push(Group::new(""));
        }
    }

    fn new_row(&mut self, mut values: Vec<String>) -> Result<RowData, ReductionError> {
        let width = self.whitelist.len();
        if values.len() > width {
            return Err(ReductionError::validation(format!(
                "row has {} values but the table has {} columns",
                values.len(),
                width
            )));
        }
        values.resize(width, String::new());
        let id = self.next_id;
        self.next_id += 1;
        Ok(RowData::new(id, values))
    }

    /// Insert an empty group named `name` at `index`.
    pub fn insert_group(&mut self, index: usize, name: &str) -> Result<usize, ReductionError> {
        self.require_grouped("insert a group")?;
        if index > self.groups.len() {
            return Err(ReductionError::InvalidIndex {
                index,
                count: self.groups.len(),
            });
        }
        self.groups.insert(index, Group::new(name));
        Ok(index)
    }

    pub fn append_group(&mut self, name: &str) -> Result<usize, ReductionError> {
        self.insert_group(self.groups.len(), name)
    }

    /// Insert a row at `index` of `group`. Missing trailing values are left blank.
    pub fn insert_row(
        &mut self,
        group: usize,
        index: usize,
        values: Vec<String>,
    ) -> Result<RowId, ReductionError> {
        let count = self.group(group)?.len();
        if index > count {
            return Err(ReductionError::InvalidIndex { index, count });
        }
        let row = self.new_row(values)?;
        let id = row.id();
        let target = self.group_mut(group)?;
        target.rows.insert(index, row);
        target.reset();
        Ok(id)
    }

    pub fn append_row(&mut self, group: usize, values: Vec<String>) -> Result<RowId, ReductionError> {
        let index = self.group(group)?.len();
        self.insert_row(group, index, values)
    }

    /// Delete rows given as (group, row) pairs. The groups are kept, even if emptied.
    pub fn delete_rows(&mut self, rows: &[(usize, usize)]) -> Result<(), ReductionError> {
        for &(group, row) in rows {
            self.row(group, row)?;
        }
        let selection: BTreeSet<(usize, usize)> = rows.iter().copied().collect();
        for &(group, row) in selection.iter().rev() {
            let target = self.group_mut(group)?;
            target.rows.remove(row);
            target.reset();
        }
        Ok(())
    }

    pub fn delete_groups(&mut self, groups: &[usize]) -> Result<(), ReductionError> {
        self.require_grouped("delete groups")?;
        for &group in groups {
            self.group(group)?;
        }
        let selection: BTreeSet<usize> = groups.iter().copied().collect();
        for &group in selection.iter().rev() {
            self.groups.remove(group);
        }
        Ok(())
    }

    /// Move the given rows, in tree order, into a new group appended at the end.
    ///
    /// Moved rows keep their identity but lose their processed state.
    pub fn group_rows(&mut self, rows: &[(usize, usize)], name: &str) -> Result<usize, ReductionError> {
        self.require_grouped("group rows")?;
        if rows.is_empty() {
            return Err(ReductionError::validation("no rows selected"));
        }
        for &(group, row) in rows {
            self.row(group, row)?;
        }
        let selection: BTreeSet<(usize, usize)> = rows.iter().copied().collect();
        let mut moved = Vec::with_capacity(selection.len());
        for &(group, row) in selection.iter().rev() {
            let source = self.group_mut(group)?;
            let mut data = source.rows.remove(row);
            source.reset();
            data.reset();
            moved.push(data);
        }
        moved.reverse();
        let mut target = Group::new(name);
        target.rows = moved;
        self.groups.push(target);
        Ok(self.groups.len() - 1)
    }

    /// Add rows given as column name → value maps.
    ///
    /// In a grouped tree each row goes to the group named by its `Group` entry, created at the
    /// end if needed. A tree holding nothing but blank rows is replaced.
    pub fn transfer(
        &mut self,
        rows: Vec<BTreeMap<String, String>>,
    ) -> Result<Vec<RowId>, ReductionError> {
        if self.groups.iter().all(|group| group.rows.iter().all(RowData::is_blank)) {
            self.new_table();
        }
        let names = self.whitelist.names();
        let mut ids = Vec::with_capacity(rows.len());
        for row in rows {
            let values: Vec<String> = names
                .iter()
                .map(|name| row.get(name).cloned().unwrap_or_default())
                .collect();
            let group = if self.is_grouped() {
                let name = row.get(GROUP_COLUMN).map(String::as_str).unwrap_or("");
                match self.groups.iter().position(|group| group.name == name) {
                    Some(index) => index,
                    None => self.append_group(name)?,
                }
            } else {
                0
            };
            ids.push(self.append_row(group, values)?);
        }
        debug!(rows = ids.len(), "transferred rows");
        Ok(ids)
    }

    /// Set one cell. A changed value returns the row and its group to the unprocessed state.
    pub fn set_cell(
        &mut self,
        group: usize,
        row: usize,
        column: usize,
        value: &str,
    ) -> Result<(), ReductionError> {
        self.whitelist.column(column)?;
        let target = self.row_mut(group, row)?;
        if target.value(column) == value {
            return Ok(());
        }
        target.set_value(column, value)?;
        target.reset();
        self.group_mut(group)?.reset();
        Ok(())
    }

    /// Validated (group → rows) map of a selection.
    pub fn selected(
        &self,
        selection: &Selection,
    ) -> Result<BTreeMap<usize, BTreeSet<usize>>, ReductionError> {
        let mut result: BTreeMap<usize, BTreeSet<usize>> = BTreeMap::new();
        if selection.all {
            for (g, group) in self.groups.iter().enumerate() {
                result.insert(g, (0..group.len()).collect());
            }
            return Ok(result);
        }
        for &g in &selection.groups {
            result.insert(g, (0..self.group(g)?.len()).collect());
        }
        for (&g, rows) in &selection.rows {
            for &r in rows {
                self.row(g, r)?;
            }
            result.entry(g).or_default().extend(rows.iter().copied());
        }
        Ok(result)
    }

    /// Record `message` against every processed node that produced `name`.
    ///
    /// Returns the number of nodes affected.
    pub fn invalidate_output(&mut self, name: &str, message: &str) -> usize {
        let mut count = 0;
        for group in self.groups.iter_mut() {
            if group.processed && !group.output_name.is_empty() && group.output_name == name {
                group.invalidate(message);
                count += 1;
            }
            for row in group.rows.iter_mut() {
                if row.is_processed() && produces(row, name) {
                    row.invalidate(message);
                    count += 1;
                }
            }
        }
        count
    }

    /// Record `message` against every processed node.
    pub fn invalidate_all(&mut self, message: &str) -> usize {
        let mut count = 0;
        for group in self.groups.iter_mut() {
            if group.processed {
                group.invalidate(message);
                count += 1;
            }
            for row in group.rows.iter_mut().filter(|row| row.is_processed()) {
                row.invalidate(message);
                count += 1;
            }
        }
        count
    }

    /// Re-check the outputs of every successfully processed node with `exists`, recording
    /// `message(name)` against nodes with a missing output.
    pub fn revalidate(
        &mut self,
        exists: impl Fn(&str) -> bool,
        message: impl Fn(&str) -> String,
    ) -> usize {
        let mut count = 0;
        for group in self.groups.iter_mut() {
            if group.state() == NodeState::Processed
                && !group.output_name.is_empty()
                && !exists(group.output_name.as_str())
            {
                let text = message(group.output_name.as_str());
                group.invalidate(&text);
                count += 1;
            }
            for row in group.rows.iter_mut() {
                if row.state() != NodeState::Processed {
                    continue;
                }
                let missing = row
                    .output_names()
                    .iter()
                    .find(|name| !exists(name.as_str()))
                    .cloned();
                if let Some(name) = missing {
                    row.invalidate(&message(name.as_str()));
                    count += 1;
                }
            }
        }
        count
    }

    /// Every successfully processed row and post-processed group, in tree order.
    pub fn processed_outputs(&self, exists: impl Fn(&str) -> bool) -> Vec<ProcessedOutput> {
        let mut outputs = Vec::new();
        for (g, group) in self.groups.iter().enumerate() {
            for (r, row) in group.rows.iter().enumerate() {
                if row.state() == NodeState::Processed {
                    outputs.push(ProcessedOutput {
                        group: g,
                        row: Some(r),
                        output_names: row.output_names().to_vec(),
                        in_store: row.output_names().iter().all(|name| exists(name.as_str())),
                    });
                }
            }
            if group.state() == NodeState::Processed && !group.output_name.is_empty() {
                outputs.push(ProcessedOutput {
                    group: g,
                    row: None,
                    output_names: vec![group.output_name.clone()],
                    in_store: exists(group.output_name.as_str()),
                });
            }
        }
        outputs
    }

    /// Header of the persisted table.
    fn table_columns(&self) -> Vec<String> {
        let mut columns = Vec::with_capacity(self.whitelist.len() + 1);
        if self.is_grouped() {
            columns.push(GROUP_COLUMN.to_string());
        }
        columns.extend(self.whitelist.names());
        columns
    }

    /// Build a tree from a persisted table. Rows sharing a group key form one group, ordered
    /// by first appearance.
    pub fn from_table(
        shape: TreeShape,
        whitelist: WhiteList,
        table: &TableWorkspace,
    ) -> Result<Self, ReductionError> {
        let mut tree = TreeManager::new(shape, whitelist);
        let expected = tree.table_columns();
        if table.columns != expected {
            return Err(ReductionError::validation(format!(
                "table columns [{}] do not match [{}]",
                table.columns.join(", "),
                expected.join(", ")
            )));
        }
        for (i, cells) in table.rows.iter().enumerate() {
            if cells.len() != expected.len() {
                return Err(ReductionError::validation(format!(
                    "table row {} has {} cells but the table has {} columns",
                    i,
                    cells.len(),
                    expected.len()
                )));
            }
            let (group, values) = if tree.is_grouped() {
                let name = &cells[0];
                let group = match tree.groups.iter().position(|group| group.name == *name) {
                    Some(index) => index,
                    None => tree.append_group(name)?,
                };
                (group, cells[1..].to_vec())
            } else {
                (0, cells.clone())
            };
            tree.append_row(group, values)?;
        }
        Ok(tree)
    }

    pub fn to_table(&self) -> TableWorkspace {
        let mut table = TableWorkspace::new(self.table_columns());
        for group in &self.groups {
            for row in &group.rows {
                let mut cells = Vec::with_capacity(table.columns.len());
                if self.is_grouped() {
                    cells.push(group.name.clone());
                }
                cells.extend(row.values().iter().cloned());
                table.rows.push(cells);
            }
        }
        table
    }

    /// Replace the contents of the tree with the table workspace `name`.
    pub fn open(&mut self, store: &dyn WorkspaceStore, name: &str) -> Result<(), ReductionError> {
        let workspace = store
            .get(name)
            .ok_or_else(|| ReductionError::WorkspaceNotFound {
                name: name.to_string(),
            })?;
        let table = match (workspace.kind, workspace.table) {
            (WorkspaceKind::Table, Some(table)) => table,
            _ => {
                return Err(ReductionError::validation(format!(
                    "{} is not a table workspace",
                    name
                )))
            }
        };
        let opened = TreeManager::from_table(self.shape, self.whitelist.clone(), &table)?;
        // Keep identities unique across tables.
        let offset = self.next_id;
        self.groups = opened.groups;
        for group in self.groups.iter_mut() {
            for row in group.rows.iter_mut() {
                *row = RowData::new(row.id() + offset, row.values().to_vec());
            }
        }
        self.next_id = offset + opened.next_id;
        Ok(())
    }

    /// Store the tree as the table workspace `name`.
    pub fn save(&self, store: &dyn WorkspaceStore, name: &str) {
        store.put(name, Workspace::table(self.to_table()));
    }
}

/// Whether `row`, or one of its slices, produced `name`.
fn produces(row: &RowData, name: &str) -> bool {
    row.output_names().iter().any(|output| output == name)
        || row.slices().iter().any(|slice| produces(slice, name))
}
