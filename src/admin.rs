use std::sync::Arc;

use crate::table::{AppendOnlyTable, Result};

/// Result of pressing "clear all data".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearStatus {
    /// First press: nothing deleted, the next press will clear.
    Armed,
    /// Second press: table truncated to its header.
    Cleared,
}

/// One admin login. The clear confirmation does not outlive it.
pub struct AdminSession {
    table: Arc<dyn AppendOnlyTable>,
    columns: &'static [&'static str],
    clear_armed: bool,
}

impl AdminSession {
    pub fn new(table: Arc<dyn AppendOnlyTable>, columns: &'static [&'static str]) -> Self {
        Self {
            table,
            columns,
            clear_armed: false,
        }
    }

    /// Number of recorded result rows.
    pub fn row_count(&self) -> Result<usize> {
        self.table.row_count()
    }

    /// The results table as CSV, creating an empty (header-only) table first
    /// if nothing has been recorded yet.
    pub fn export(&self) -> Result<String> {
        self.table.init_header(self.columns)?;
        self.table.export_csv()
    }

    pub fn is_clear_armed(&self) -> bool {
        self.clear_armed
    }

    /// Two-step clear: the first call arms, the second truncates.
    pub fn request_clear(&mut self) -> Result<ClearStatus> {
        if !self.clear_armed {
            self.clear_armed = true;
            log::warn!("Clear requested; press again to delete all results");
            return Ok(ClearStatus::Armed);
        }
        self.table.truncate(self.columns)?;
        self.clear_armed = false;
        log::info!("All results cleared");
        Ok(ClearStatus::Cleared)
    }

    /// Back out of an armed clear.
    pub fn cancel_clear(&mut self) {
        self.clear_armed = false;
    }
}
