//! Validate a dataset against live column metadata and reorder it to match.

use crate::dataset::Dataset;
use crate::db::ColumnMeta;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AlignError {
    #[error("destination table has no columns (does it exist?)")]
    NoColumns,

    #[error("missing required columns: {}", .0.join(", "))]
    MissingRequired(Vec<String>),

    #[error("columns not present in destination: {}", .0.join(", "))]
    ExtraColumns(Vec<String>),

    #[error("invalid dataset: {0}")]
    Dataset(String),
}

/// Shape `dataset` for insertion into a table with `columns`.
///
/// Column names are trimmed first. Required destination columns must be
/// present; dataset columns unknown to the destination are dropped (with a
/// warning) when `drop_extra` is set, otherwise rejected. The result holds
/// the shared columns in destination order.
pub fn align_to_table(
    mut dataset: Dataset,
    columns: &[ColumnMeta],
    drop_extra: bool,
    table: &str,
) -> Result<Dataset, AlignError> {
    if columns.is_empty() {
        return Err(AlignError::NoColumns);
    }

    dataset
        .trim_column_names()
        .map_err(|err| AlignError::Dataset(err.to_string()))?;

    let missing: Vec<String> = columns
        .iter()
        .filter(|c| c.is_required() && dataset.column(&c.name).is_none())
        .map(|c| c.name.clone())
        .collect();
    if !missing.is_empty() {
        return Err(AlignError::MissingRequired(missing));
    }

    let extra: Vec<String> = dataset
        .column_names()
        .into_iter()
        .filter(|name| !columns.iter().any(|c| c.name == *name))
        .map(str::to_string)
        .collect();
    if !extra.is_empty() {
        if !drop_extra {
            return Err(AlignError::ExtraColumns(extra));
        }
        warn!(table, columns = %extra.join(", "), "dropping columns not present in destination");
    }

    let keep: Vec<String> = columns
        .iter()
        .filter(|c| dataset.column(&c.name).is_some())
        .map(|c| c.name.clone())
        .collect();
    Ok(dataset.project(&keep))
}
