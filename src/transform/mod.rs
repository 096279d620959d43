//! Per-table dataset transforms.
//!
//! A [`DatasetTransform`] takes ownership of a table's dataset copy and returns
//! the reshaped dataset. Transforms are registered per destination table in a
//! [`TransformRegistry`] built once at startup and applied by the loader, in
//! registration order, before validation against the live schema.
//!
//! The built-in transforms are generic column operations; they can be declared
//! in the manifest through [`TransformConfig`].

use crate::dataset::{Dataset, DatasetError, DatasetMap, Value};
use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors raised by a transform
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("column '{column}' not found")]
    MissingColumn { column: String },

    #[error(transparent)]
    Dataset(#[from] DatasetError),

    #[error("{0}")]
    Other(String),
}

/// Read-only view shared by every transform in a run.
#[derive(Debug, Clone, Copy)]
pub struct TransformContext<'a> {
    /// All input datasets, keyed by dataset key
    pub datasets: &'a DatasetMap,
}

impl<'a> TransformContext<'a> {
    pub fn new(datasets: &'a DatasetMap) -> Self {
        Self { datasets }
    }
}

/// Strategy for reshaping one table's dataset.
pub trait DatasetTransform: Send + Sync {
    fn apply(&self, dataset: Dataset, ctx: &TransformContext<'_>) -> Result<Dataset, TransformError>;

    /// Short name used in logs
    fn name(&self) -> &str;
}

/// Transforms keyed by destination table name.
#[derive(Default)]
pub struct TransformRegistry {
    by_table: AHashMap<String, Vec<Box<dyn DatasetTransform>>>,
}

impl TransformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `transform` to the chain for `table`.
    pub fn register(&mut self, table: impl Into<String>, transform: Box<dyn DatasetTransform>) {
        self.by_table.entry(table.into()).or_default().push(transform);
    }

    pub fn with(mut self, table: impl Into<String>, transform: impl DatasetTransform + 'static) -> Self {
        self.register(table, Box::new(transform));
        self
    }

    pub fn has_transforms(&self, table: &str) -> bool {
        self.by_table.get(table).is_some_and(|t| !t.is_empty())
    }

    /// Run every transform registered for `table`, in order.
    pub fn apply(
        &self,
        table: &str,
        mut dataset: Dataset,
        ctx: &TransformContext<'_>,
    ) -> Result<Dataset, TransformError> {
        let Some(chain) = self.by_table.get(table) else {
            return Ok(dataset);
        };
        for transform in chain {
            tracing::debug!(table, transform = transform.name(), "applying transform");
            dataset = transform.apply(dataset, ctx)?;
        }
        Ok(dataset)
    }
}

impl std::fmt::Debug for TransformRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for (table, chain) in &self.by_table {
            let names: Vec<&str> = chain.iter().map(|t| t.name()).collect();
            map.entry(table, &names);
        }
        map.finish()
    }
}

/// Rename columns; missing source columns are ignored.
#[derive(Debug, Clone, Default)]
pub struct RenameColumns {
    pub renames: BTreeMap<String, String>,
}

impl DatasetTransform for RenameColumns {
    fn apply(&self, mut dataset: Dataset, _ctx: &TransformContext<'_>) -> Result<Dataset, TransformError> {
        for (from, to) in &self.renames {
            if from == to {
                continue;
            }
            if dataset.column(to).is_some() && dataset.column(from).is_some() {
                return Err(DatasetError::DuplicateColumn(to.clone()).into());
            }
            dataset.rename_column(from, to);
        }
        Ok(dataset)
    }

    fn name(&self) -> &str {
        "rename"
    }
}

/// Remove columns if present.
#[derive(Debug, Clone, Default)]
pub struct DropColumns {
    pub columns: Vec<String>,
}

impl DatasetTransform for DropColumns {
    fn apply(&self, mut dataset: Dataset, _ctx: &TransformContext<'_>) -> Result<Dataset, TransformError> {
        for column in &self.columns {
            dataset.remove_column(column);
        }
        Ok(dataset)
    }

    fn name(&self) -> &str {
        "drop"
    }
}

/// Trim text cells; blank text becomes `Null`. Empty `columns` means all.
#[derive(Debug, Clone, Default)]
pub struct TrimText {
    pub columns: Vec<String>,
}

impl DatasetTransform for TrimText {
    fn apply(&self, mut dataset: Dataset, _ctx: &TransformContext<'_>) -> Result<Dataset, TransformError> {
        let targets: Vec<String> = if self.columns.is_empty() {
            dataset.column_names().iter().map(|s| s.to_string()).collect()
        } else {
            self.columns.clone()
        };

        for name in &targets {
            let found = dataset.map_values(name, |value| {
                if let Value::Text(s) = value {
                    let trimmed = s.trim();
                    if trimmed.is_empty() {
                        *value = Value::Null;
                    } else if trimmed.len() != s.len() {
                        *s = trimmed.to_string();
                    }
                }
            });
            if !found {
                return Err(TransformError::MissingColumn { column: name.clone() });
            }
        }
        Ok(dataset)
    }

    fn name(&self) -> &str {
        "trim"
    }
}

/// Add a column holding one value in every row, replacing any existing one.
#[derive(Debug, Clone)]
pub struct ConstantColumn {
    pub column: String,
    pub value: Value,
}

impl DatasetTransform for ConstantColumn {
    fn apply(&self, mut dataset: Dataset, _ctx: &TransformContext<'_>) -> Result<Dataset, TransformError> {
        if dataset.column_count() == 0 {
            return Ok(dataset);
        }
        let values = vec![self.value.clone(); dataset.row_count()];
        dataset.replace_values(self.column.as_str(), values)?;
        Ok(dataset)
    }

    fn name(&self) -> &str {
        "constant"
    }
}

/// Manifest form of the built-in transforms.
///
/// ```yaml
/// transforms:
///   - rename: { EmailAddress: email }
///   - drop: [internal_notes]
///   - trim: []
///   - constant: { column: source, value: import }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransformConfig {
    Rename(BTreeMap<String, String>),
    Drop(Vec<String>),
    Trim(Vec<String>),
    Constant { column: String, value: Option<String> },
}

impl TransformConfig {
    pub fn build(&self) -> Box<dyn DatasetTransform> {
        match self {
            TransformConfig::Rename(renames) => Box::new(RenameColumns {
                renames: renames.clone(),
            }),
            TransformConfig::Drop(columns) => Box::new(DropColumns {
                columns: columns.clone(),
            }),
            TransformConfig::Trim(columns) => Box::new(TrimText {
                columns: columns.clone(),
            }),
            TransformConfig::Constant { column, value } => Box::new(ConstantColumn {
                column: column.clone(),
                value: value.clone().into(),
            }),
        }
    }
}
