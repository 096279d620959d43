//! Columnar datasets handed to the loader.
//!
//! A [`Dataset`] is an ordered list of named columns of nullable scalar
//! [`Value`]s. Extraction collaborators (the CSV reader in [`reader`], or any
//! library caller) build a [`DatasetMap`] keyed by dataset name; the loader only
//! ever reads from it and works on its own copies.

mod reader;

pub use reader::{read_csv_dir, read_csv_file};

use chrono::NaiveDateTime;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;
use std::path::PathBuf;
use thiserror::Error;

/// Datasets keyed by dataset key (usually the destination table name).
pub type DatasetMap = BTreeMap<String, Dataset>;

/// A nullable scalar cell value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Timestamp(NaiveDateTime),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Text(s) => write!(f, "{}", s),
            Value::Int(n) => write!(f, "{}", n),
            Value::Float(x) => write!(f, "{}", x),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Timestamp(ts) => write!(f, "{}", ts.format("%Y-%m-%d %H:%M:%S%.f")),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(ts: NaiveDateTime) -> Self {
        Value::Timestamp(ts)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// One named column. Its length is owned by the [`Dataset`] holding it.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    name: String,
    values: Vec<Value>,
}

impl Column {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }
}

/// Errors raised while building or reading datasets
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("column '{column}' has {found} values, expected {expected}")]
    RaggedColumn {
        column: String,
        expected: usize,
        found: usize,
    },

    #[error("duplicate column '{0}'")]
    DuplicateColumn(String),

    #[error("data directory not found: {}", .0.display())]
    NotADirectory(PathBuf),

    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid CSV in {}: {source}", path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

/// An ordered collection of equally long columns.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    columns: Vec<Column>,
    rows: usize,
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`Dataset::push_column`].
    pub fn with_column(
        mut self,
        name: impl Into<String>,
        values: Vec<Value>,
    ) -> Result<Self, DatasetError> {
        self.push_column(name, values)?;
        Ok(self)
    }

    /// Append a column. The first column fixes the row count.
    pub fn push_column(
        &mut self,
        name: impl Into<String>,
        values: Vec<Value>,
    ) -> Result<(), DatasetError> {
        let name = name.into();
        if self.column(&name).is_some() {
            return Err(DatasetError::DuplicateColumn(name));
        }
        if self.columns.is_empty() {
            self.rows = values.len();
        } else if values.len() != self.rows {
            return Err(DatasetError::RaggedColumn {
                column: name,
                expected: self.rows,
                found: values.len(),
            });
        }
        self.columns.push(Column { name, values });
        Ok(())
    }

    pub fn row_count(&self) -> usize {
        self.rows
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// A dataset without rows has nothing to load.
    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    fn column_mut(&mut self, name: &str) -> Option<&mut Column> {
        self.columns.iter_mut().find(|c| c.name == name)
    }

    /// Rewrite every cell of `name` in place; returns false when the column
    /// does not exist.
    pub fn map_values<F>(&mut self, name: &str, f: F) -> bool
    where
        F: FnMut(&mut Value),
    {
        match self.column_mut(name) {
            Some(column) => {
                column.values.iter_mut().for_each(f);
                true
            }
            None => false,
        }
    }

    /// Replace the cells of `name`, adding the column when it is absent.
    pub fn replace_values(
        &mut self,
        name: impl Into<String>,
        values: Vec<Value>,
    ) -> Result<(), DatasetError> {
        let name = name.into();
        if self.columns.is_empty() || self.column(&name).is_none() {
            return self.push_column(name, values);
        }
        if values.len() != self.rows {
            return Err(DatasetError::RaggedColumn {
                column: name,
                expected: self.rows,
                found: values.len(),
            });
        }
        if let Some(column) = self.column_mut(&name) {
            column.values = values;
        }
        Ok(())
    }

    /// Rename a column; returns false when `from` does not exist.
    pub fn rename_column(&mut self, from: &str, to: &str) -> bool {
        match self.column_mut(from) {
            Some(column) => {
                column.name = to.to_string();
                true
            }
            None => false,
        }
    }

    pub fn remove_column(&mut self, name: &str) -> Option<Column> {
        let pos = self.columns.iter().position(|c| c.name == name)?;
        Some(self.columns.remove(pos))
    }

    /// Strip surrounding whitespace from every column name. Fails when two
    /// names collide after trimming.
    pub fn trim_column_names(&mut self) -> Result<(), DatasetError> {
        for column in &mut self.columns {
            let trimmed = column.name.trim();
            if trimmed.len() != column.name.len() {
                column.name = trimmed.to_string();
            }
        }
        for (i, column) in self.columns.iter().enumerate() {
            if self.columns[..i].iter().any(|c| c.name == column.name) {
                return Err(DatasetError::DuplicateColumn(column.name.clone()));
            }
        }
        Ok(())
    }

    /// Replace NaN/infinite floats with `Null`.
    pub fn normalize_nulls(&mut self) {
        for column in &mut self.columns {
            for value in &mut column.values {
                if matches!(value, Value::Float(f) if !f.is_finite()) {
                    *value = Value::Null;
                }
            }
        }
    }

    /// Keep only `names`, in that order. Unknown names are ignored.
    pub fn project(mut self, names: &[String]) -> Dataset {
        let mut columns = Vec::with_capacity(names.len());
        for name in names {
            if let Some(column) = self.remove_column(name) {
                columns.push(column);
            }
        }
        let rows = if columns.is_empty() { 0 } else { self.rows };
        Dataset { columns, rows }
    }

    /// Materialize the rows in `range` (clamped to the dataset).
    pub fn rows(&self, range: Range<usize>) -> Vec<Vec<Value>> {
        let end = range.end.min(self.rows);
        (range.start.min(end)..end)
            .map(|row| self.columns.iter().map(|c| c.values[row].clone()).collect())
            .collect()
    }
}
