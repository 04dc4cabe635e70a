//! In-memory tabular batch passed between extract, transform and load.

use serde_json::{Map, Value};

/// One row, keyed by column name.
pub type Row = Map<String, Value>;

/// Ordered columns plus rows keyed by column.
///
/// A row may lack a column listed in `columns`; readers treat that as null.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TabularBatch {
    columns: Vec<String>,
    rows: Vec<Row>,
}

impl TabularBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a batch from rows, taking columns in first-seen order.
    pub fn from_rows(rows: Vec<Row>) -> Self {
        let mut batch = Self::new();
        for row in rows {
            batch.push_row(row);
        }
        batch
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c == name)
    }

    pub fn push_row(&mut self, row: Row) {
        for key in row.keys() {
            if !self.has_column(key) {
                self.columns.push(key.clone());
            }
        }
        self.rows.push(row);
    }

    /// Append all rows of another batch.
    pub fn append(&mut self, other: TabularBatch) {
        for column in other.columns {
            if !self.has_column(&column) {
                self.columns.push(column);
            }
        }
        self.rows.extend(other.rows);
    }

    /// Cell value, `Null` when the row lacks the column.
    pub fn value<'a>(row: &'a Row, column: &str) -> &'a Value {
        row.get(column).unwrap_or(&Value::Null)
    }

    /// Add or overwrite a column with a value computed per row.
    pub fn set_column(&mut self, name: &str, mut f: impl FnMut(&Row) -> Value) {
        for row in &mut self.rows {
            let value = f(row);
            row.insert(name.to_string(), value);
        }
        if !self.has_column(name) {
            self.columns.push(name.to_string());
        }
    }

    /// Rename a column, replacing any existing column with the new name.
    ///
    /// No-op when `from` is not a column.
    pub fn rename_column(&mut self, from: &str, to: &str) {
        if from == to || !self.has_column(from) {
            return;
        }

        for row in &mut self.rows {
            row.remove(to);
            if let Some(value) = row.remove(from) {
                row.insert(to.to_string(), value);
            }
        }

        self.columns.retain(|c| c != to);
        for column in &mut self.columns {
            if column == from {
                *column = to.to_string();
            }
        }
    }

    /// Keep only rows matching the predicate.
    pub fn retain(&mut self, f: impl FnMut(&Row) -> bool) {
        self.rows.retain(f);
    }

    /// Project onto an exact column list.
    ///
    /// Output columns follow `columns` order; missing columns are null and
    /// columns not listed are dropped.
    pub fn select(&self, columns: &[&str]) -> TabularBatch {
        let rows = self
            .rows
            .iter()
            .map(|row| {
                columns
                    .iter()
                    .map(|c| (c.to_string(), Self::value(row, c).clone()))
                    .collect::<Row>()
            })
            .collect();

        TabularBatch {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows,
        }
    }

    /// Split the rows into batches of at most `size` rows.
    pub fn chunks(&self, size: usize) -> impl Iterator<Item = TabularBatch> + '_ {
        self.rows.chunks(size.max(1)).map(|rows| TabularBatch {
            columns: self.columns.clone(),
            rows: rows.to_vec(),
        })
    }
}
