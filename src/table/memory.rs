use std::sync::Mutex;

use super::{AppendOnlyTable, Result, TableError, csv_line};

#[derive(Default)]
struct Inner {
    header: Option<Vec<String>>,
    rows: Vec<Vec<String>>,
}

/// Results table held in process memory. Used for dry runs.
#[derive(Default)]
pub struct MemoryTable {
    inner: Mutex<Inner>,
}

impl MemoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut Inner) -> Result<T>) -> Result<T> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| TableError::Unavailable("table lock poisoned".into()))?;
        f(&mut inner)
    }
}

impl AppendOnlyTable for MemoryTable {
    fn init_header(&self, columns: &[&str]) -> Result<bool> {
        self.with(|inner| {
            if inner.header.is_some() {
                return Ok(false);
            }
            inner.header = Some(columns.iter().map(|c| c.to_string()).collect());
            Ok(true)
        })
    }

    fn append_row(&self, fields: &[String]) -> Result<()> {
        self.with(|inner| {
            let Some(header) = &inner.header else {
                return Err(TableError::Unavailable("in-memory table has no header".into()));
            };
            if header.len() != fields.len() {
                return Err(TableError::Width {
                    expected: header.len(),
                    got: fields.len(),
                });
            }
            inner.rows.push(fields.to_vec());
            Ok(())
        })
    }

    fn row_count(&self) -> Result<usize> {
        self.with(|inner| Ok(inner.rows.len()))
    }

    fn export_csv(&self) -> Result<String> {
        self.with(|inner| {
            let mut out = inner.header.as_deref().map(csv_line).unwrap_or_default();
            for row in &inner.rows {
                out.push_str(&csv_line(row));
            }
            Ok(out)
        })
    }

    fn truncate(&self, columns: &[&str]) -> Result<()> {
        self.with(|inner| {
            inner.header = Some(columns.iter().map(|c| c.to_string()).collect());
            inner.rows.clear();
            Ok(())
        })
    }
}
