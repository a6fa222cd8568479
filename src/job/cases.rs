//! Case data: one CSV row per case.

use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum CaseDataError {
    #[error("invalid case data reference: {0:?}")]
    InvalidReference(String),

    #[error("failed to read case data {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

/// Resolve a case data reference under `cases_dir`. Only the final path
/// segment of the reference is honoured.
pub fn resolve_case_source(cases_dir: &Path, reference: &str) -> Result<PathBuf, CaseDataError> {
    let name = reference
        .trim()
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default();
    if name.is_empty() || name == "." || name == ".." {
        return Err(CaseDataError::InvalidReference(reference.to_string()));
    }
    Ok(cases_dir.join(name))
}

/// Load every row of a CSV file with a header line.
pub fn load_rows(path: &Path) -> Result<Vec<Map<String, Value>>, CaseDataError> {
    let reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|source| CaseDataError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    let rows = parse_rows(reader).map_err(|source| CaseDataError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    debug!(path = %path.display(), rows = rows.len(), "case data loaded");
    Ok(rows)
}

/// Parse rows from any CSV reader.
pub fn parse_rows<R: std::io::Read>(
    mut reader: csv::Reader<R>,
) -> Result<Vec<Map<String, Value>>, csv::Error> {
    let headers = reader.headers()?.clone();
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let row = headers
            .iter()
            .zip(record.iter())
            .map(|(k, v)| (k.to_string(), cell_value(v)))
            .collect();
        rows.push(row);
    }
    Ok(rows)
}

/// Empty cells become null, integers and decimals become numbers,
/// `true`/`false` become booleans. Everything else stays text.
fn cell_value(cell: &str) -> Value {
    if cell.is_empty() {
        return Value::Null;
    }
    if let Ok(i) = cell.parse::<i64>() {
        return Value::from(i);
    }
    if let Ok(f) = cell.parse::<f64>() {
        if f.is_finite() {
            return Value::from(f);
        }
    }
    match cell {
        "true" | "True" | "TRUE" => Value::Bool(true),
        "false" | "False" | "FALSE" => Value::Bool(false),
        _ => Value::String(cell.to_string()),
    }
}
