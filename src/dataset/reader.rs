//! CSV extraction: one file per dataset.

use super::{Dataset, DatasetError, DatasetMap, Value};
use std::fs;
use std::path::Path;
use tracing::debug;

/// Read every `*.csv` file in `dir` into a dataset keyed by file stem.
///
/// `core.audit_log.csv` becomes the key `core.audit_log`, which the loader's
/// fallback pass treats as an explicit `schema.table` target.
pub fn read_csv_dir(dir: &Path) -> Result<DatasetMap, DatasetError> {
    if !dir.is_dir() {
        return Err(DatasetError::NotADirectory(dir.to_path_buf()));
    }

    let entries = fs::read_dir(dir).map_err(|source| DatasetError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut paths = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| DatasetError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        let is_csv = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("csv"))
            .unwrap_or(false);
        if is_csv && path.is_file() {
            paths.push(path);
        }
    }
    paths.sort();

    let mut datasets = DatasetMap::new();
    for path in paths {
        let Some(key) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let key = key.trim().to_string();
        if key.is_empty() || key.starts_with('_') {
            debug!(file = %path.display(), "skipping utility file");
            continue;
        }
        let dataset = read_csv_file(&path)?;
        debug!(
            key = %key,
            rows = dataset.row_count(),
            columns = dataset.column_count(),
            "read dataset"
        );
        datasets.insert(key, dataset);
    }

    Ok(datasets)
}

/// Read one CSV file with a header row. Empty cells become `Null`, everything
/// else is kept as text and left for the database to coerce.
pub fn read_csv_file(path: &Path) -> Result<Dataset, DatasetError> {
    let csv_err = |source| DatasetError::Csv {
        path: path.to_path_buf(),
        source,
    };

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(false)
        .from_path(path)
        .map_err(csv_err)?;

    let headers: Vec<String> = reader
        .headers()
        .map_err(csv_err)?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').to_string())
        .collect();

    let mut columns: Vec<Vec<Value>> = vec![Vec::new(); headers.len()];
    for record in reader.records() {
        let record = record.map_err(csv_err)?;
        for (values, cell) in columns.iter_mut().zip(record.iter()) {
            values.push(if cell.is_empty() {
                Value::Null
            } else {
                Value::Text(cell.to_string())
            });
        }
    }

    let mut dataset = Dataset::new();
    for (name, values) in headers.into_iter().zip(columns) {
        dataset.push_column(name, values)?;
    }
    Ok(dataset)
}
