pub mod csv;
pub mod memory;
pub mod sqlite;

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TableError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Row encoding error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Results table {0} does not exist yet")]
    Missing(PathBuf),
    #[error("Row has {got} fields, table has {expected} columns")]
    Width { expected: usize, got: usize },
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

pub type Result<T> = std::result::Result<T, TableError>;

/// Durable, append-only result store.
///
/// Implementations serialize appends internally: each `append_row` is
/// all-or-nothing and completes before the next one starts, so sessions
/// sharing one table never interleave rows.
pub trait AppendOnlyTable: Send + Sync {
    /// Create the table with `columns` as its header if it doesn't exist.
    /// Returns `true` if it was created. Never truncates existing rows.
    fn init_header(&self, columns: &[&str]) -> Result<bool>;

    /// Append one row.
    fn append_row(&self, fields: &[String]) -> Result<()>;

    /// Number of data rows (header excluded). A missing table has zero.
    fn row_count(&self) -> Result<usize>;

    /// The whole table as CSV text, header first.
    fn export_csv(&self) -> Result<String>;

    /// Replace the contents with the header only.
    fn truncate(&self, columns: &[&str]) -> Result<()>;
}

/// Storage backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Csv,
    Sqlite,
}

/// Open the results table at `path` with the chosen backend.
pub fn open(backend: Backend, path: &Path) -> Result<Box<dyn AppendOnlyTable>> {
    match backend {
        Backend::Csv => Ok(Box::new(csv::CsvTable::new(path))),
        Backend::Sqlite => Ok(Box::new(sqlite::SqliteTable::open(path)?)),
    }
}

/// Quote a field per RFC 4180 when it contains a delimiter, quote, or newline.
pub fn escape_field(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// One CSV line (with trailing newline) from `fields`.
pub fn csv_line<S: AsRef<str>>(fields: &[S]) -> String {
    let mut line = fields
        .iter()
        .map(|f| escape_field(f.as_ref()))
        .collect::<Vec<_>>()
        .join(",");
    line.push('\n');
    line
}

/// Split CSV text into records, honouring quoted fields.
pub fn parse_csv(text: &str) -> Vec<Vec<String>> {
    let mut records = Vec::new();
    let mut record = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    field.push('"');
                    chars.next();
                }
                '"' => in_quotes = false,
                _ => field.push(c),
            }
            continue;
        }
        match c {
            '"' => in_quotes = true,
            ',' => record.push(std::mem::take(&mut field)),
            '\r' => {}
            '\n' => {
                record.push(std::mem::take(&mut field));
                records.push(std::mem::take(&mut record));
            }
            _ => field.push(c),
        }
    }
    if !field.is_empty() || !record.is_empty() {
        record.push(field);
        records.push(record);
    }
    records
}
