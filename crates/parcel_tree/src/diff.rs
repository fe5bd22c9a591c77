//! Comparison of the tabular data behind two [`TableNode`]s.
//!
//! Comparing two leaves is cheap when they reference the same objects: equal
//! digests mean equal data. Otherwise the tables are loaded through a
//! [`TableSource`] and compared with a pluggable [`TableDiff`].

use std::collections::HashMap;

use itertools::Itertools;

use crate::{ContentNode, TableNode};

/// An in-memory table with named columns and rows of cell values.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    /// Constructs an empty table with the given columns.
    pub fn new<S: Into<String>>(columns: impl IntoIterator<Item = S>) -> Self {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    /// Appends a row. Missing trailing cells are filled with empty strings and
    /// surplus cells are dropped.
    pub fn push_row<S: Into<String>>(&mut self, row: impl IntoIterator<Item = S>) {
        let mut row: Vec<String> = row.into_iter().map(Into::into).collect();
        row.resize(self.columns.len(), String::new());
        self.rows.push(row);
    }

    /// Builder style variant of [`Self::push_row`].
    pub fn with_row<S: Into<String>>(mut self, row: impl IntoIterator<Item = S>) -> Self {
        self.push_row(row);
        self
    }

    /// Returns the column names.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Returns the rows.
    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }
}

/// A single cell that differs between two versions of a row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellChange {
    /// The column of the cell.
    pub column: String,
    /// The old value.
    pub old: String,
    /// The new value.
    pub new: String,
}

/// A row that exists in both tables but with different values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangedRow {
    /// Identifies the row: its position, or its key value when diffing by key.
    pub key: String,
    /// The cells that differ, in column order of the old table.
    pub cells: Vec<CellChange>,
}

/// The result of comparing two tables.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TableDiffReport {
    /// Columns only present in the new table.
    pub added_columns: Vec<String>,
    /// Columns only present in the old table.
    pub removed_columns: Vec<String>,
    /// Rows only present in the new table, identified by key.
    pub added_rows: Vec<String>,
    /// Rows only present in the old table, identified by key.
    pub removed_rows: Vec<String>,
    /// Rows present in both tables whose shared columns differ.
    pub changed_rows: Vec<ChangedRow>,
}

impl TableDiffReport {
    /// Returns true if the tables are equal.
    pub fn is_empty(&self) -> bool {
        self.added_columns.is_empty()
            && self.removed_columns.is_empty()
            && self.added_rows.is_empty()
            && self.removed_rows.is_empty()
            && self.changed_rows.is_empty()
    }
}

/// A strategy for comparing two tables.
pub trait TableDiff {
    /// Compares `old` against `new`.
    fn diff(&self, old: &Table, new: &Table) -> TableDiffReport;
}

/// Loads the table referenced by a [`TableNode`], typically by reading and
/// decoding its objects from a store.
pub trait TableSource {
    /// The error returned when a table cannot be loaded.
    type Error;

    /// Loads the table behind `node`.
    fn load(&self, node: &TableNode) -> Result<Table, Self::Error>;
}

/// Compares rows by position, or by the value of a key column.
#[derive(Debug, Default, Clone)]
pub struct RowDiff {
    key_column: Option<String>,
}

impl RowDiff {
    /// Compares rows by their position in the table.
    pub fn by_position() -> Self {
        Self::default()
    }

    /// Compares rows by the value in `column`. Falls back to positional
    /// comparison if either table lacks the column.
    pub fn by_key(column: impl Into<String>) -> Self {
        Self {
            key_column: Some(column.into()),
        }
    }

    fn row_keys(&self, table: &Table) -> Option<Vec<String>> {
        match &self.key_column {
            Some(column) => {
                let idx = table.column_index(column)?;
                Some(table.rows.iter().map(|row| row[idx].clone()).collect())
            }
            None => None,
        }
    }
}

impl TableDiff for RowDiff {
    fn diff(&self, old: &Table, new: &Table) -> TableDiffReport {
        let mut report = TableDiffReport {
            added_columns: new
                .columns
                .iter()
                .filter(|c| old.column_index(c).is_none())
                .cloned()
                .collect(),
            removed_columns: old
                .columns
                .iter()
                .filter(|c| new.column_index(c).is_none())
                .cloned()
                .collect(),
            ..TableDiffReport::default()
        };

        // Pairs of (old index, new index) for the columns both tables share.
        let shared: Vec<(usize, usize, &str)> = old
            .columns
            .iter()
            .enumerate()
            .filter_map(|(i, c)| new.column_index(c).map(|j| (i, j, c.as_str())))
            .collect();

        let (old_keys, new_keys) = match (self.row_keys(old), self.row_keys(new)) {
            (Some(old_keys), Some(new_keys)) => (old_keys, new_keys),
            _ => (
                (0..old.rows.len()).map(|i| i.to_string()).collect(),
                (0..new.rows.len()).map(|i| i.to_string()).collect(),
            ),
        };

        let new_by_key: HashMap<&str, usize> = new_keys
            .iter()
            .enumerate()
            .map(|(idx, key)| (key.as_str(), idx))
            .collect();

        for (old_idx, key) in old_keys.iter().enumerate() {
            let Some(&new_idx) = new_by_key.get(key.as_str()) else {
                report.removed_rows.push(key.clone());
                continue;
            };
            let (old_row, new_row) = (&old.rows[old_idx], &new.rows[new_idx]);
            let cells = shared
                .iter()
                .filter(|(i, j, _)| old_row[*i] != new_row[*j])
                .map(|(i, j, column)| CellChange {
                    column: column.to_string(),
                    old: old_row[*i].clone(),
                    new: new_row[*j].clone(),
                })
                .collect_vec();
            if !cells.is_empty() {
                report.changed_rows.push(ChangedRow {
                    key: key.clone(),
                    cells,
                });
            }
        }

        let old_key_set: std::collections::HashSet<&str> =
            old_keys.iter().map(String::as_str).collect();
        report.added_rows = new_keys
            .iter()
            .filter(|key| !old_key_set.contains(key.as_str()))
            .cloned()
            .collect();

        report
    }
}

/// The outcome of comparing two leaves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeafComparison {
    /// Both leaves reference identical objects.
    Identical,
    /// The leaves are tables whose data differs (the report may still be empty
    /// if the serialized bytes differ but the decoded rows are equal).
    Table(TableDiffReport),
    /// The leaves differ and cannot be compared row-wise.
    Different,
}

/// Compares the data referenced by two leaves.
pub fn compare_leaves<S: TableSource>(
    source: &S,
    differ: &dyn TableDiff,
    old: &ContentNode,
    new: &ContentNode,
) -> Result<LeafComparison, S::Error> {
    if old.is_leaf() && old.object_hashes() == new.object_hashes() {
        return Ok(LeafComparison::Identical);
    }
    match (old, new) {
        (ContentNode::Table(old), ContentNode::Table(new)) => {
            let old = source.load(old)?;
            let new = source.load(new)?;
            Ok(LeafComparison::Table(differ.diff(&old, &new)))
        }
        _ => Ok(LeafComparison::Different),
    }
}
