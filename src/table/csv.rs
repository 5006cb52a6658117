use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::{AppendOnlyTable, Result, TableError, csv_line, parse_csv};

/// Results table stored as a CSV file.
///
/// Rows are written with a single `write_all` on an append-mode handle and
/// synced before the lock is released. A failed write is cut back off the
/// file, and a partial row left by a crash is dropped before the next append.
pub struct CsvTable {
    path: PathBuf,
    lock: Mutex<()>,
}

impl CsvTable {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.lock
            .lock()
            .map_err(|_| TableError::Unavailable("table lock poisoned".into()))
    }

    fn read_records(&self) -> Result<Vec<Vec<String>>> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => Ok(parse_csv(&text)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Drop a trailing row that has no newline. Returns the resulting length.
    fn trim_partial_row(&self, file: &mut File) -> Result<u64> {
        let len = file.metadata()?.len();
        if len == 0 {
            return Ok(0);
        }
        let mut last = [0u8; 1];
        file.seek(SeekFrom::End(-1))?;
        file.read_exact(&mut last)?;
        if last[0] == b'\n' {
            return Ok(len);
        }

        let mut contents = Vec::new();
        file.seek(SeekFrom::Start(0))?;
        file.read_to_end(&mut contents)?;
        let keep = contents
            .iter()
            .rposition(|&b| b == b'\n')
            .map_or(0, |i| i as u64 + 1);
        file.set_len(keep)?;
        log::warn!(
            "Discarded {} bytes of an unfinished row at the end of {}",
            len - keep,
            self.path.display()
        );
        Ok(keep)
    }

    fn write_header(&self, columns: &[&str]) -> Result<()> {
        let mut file = File::create(&self.path)?;
        file.write_all(csv_line(columns).as_bytes())?;
        file.sync_all()?;
        Ok(())
    }
}

/// Number of columns in the header row.
fn header_width(file: &mut File) -> Result<usize> {
    file.seek(SeekFrom::Start(0))?;
    let mut line = String::new();
    BufReader::new(&mut *file).read_line(&mut line)?;
    Ok(parse_csv(&line).first().map_or(0, Vec::len))
}

impl AppendOnlyTable for CsvTable {
    fn init_header(&self, columns: &[&str]) -> Result<bool> {
        let _guard = self.guard()?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        // create_new fails if another writer got there first
        match OpenOptions::new().write(true).create_new(true).open(&self.path) {
            Ok(mut file) => {
                file.write_all(csv_line(columns).as_bytes())?;
                file.sync_all()?;
                log::info!("Created results table {}", self.path.display());
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let existing = self.read_records()?;
                match existing.first() {
                    Some(header) if header.iter().map(String::as_str).eq(columns.iter().copied()) => {}
                    Some(header) => log::warn!(
                        "Header of {} differs from the expected schema: {:?}",
                        self.path.display(),
                        header
                    ),
                    None => log::warn!("{} exists but has no header row", self.path.display()),
                }
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn append_row(&self, fields: &[String]) -> Result<()> {
        let _guard = self.guard()?;

        let mut file = match OpenOptions::new().read(true).append(true).open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(TableError::Missing(self.path.clone()));
            }
            Err(e) => return Err(e.into()),
        };

        let len = self.trim_partial_row(&mut file)?;
        let width = header_width(&mut file)?;
        if width == 0 {
            return Err(TableError::Unavailable(format!(
                "{} has no header row",
                self.path.display()
            )));
        }
        if width != fields.len() {
            return Err(TableError::Width {
                expected: width,
                got: fields.len(),
            });
        }

        let written = file
            .write_all(csv_line(fields).as_bytes())
            .and_then(|()| file.sync_data());
        if let Err(e) = written {
            // Leave the file as it was so a retry starts on a clean line
            if let Err(trim) = file.set_len(len) {
                log::warn!("Failed to roll back {}: {}", self.path.display(), trim);
            }
            return Err(e.into());
        }
        Ok(())
    }

    fn row_count(&self) -> Result<usize> {
        let _guard = self.guard()?;
        Ok(self.read_records()?.len().saturating_sub(1))
    }

    fn export_csv(&self) -> Result<String> {
        let _guard = self.guard()?;
        match std::fs::read_to_string(&self.path) {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(TableError::Missing(self.path.clone())),
            Err(e) => Err(e.into()),
        }
    }

    fn truncate(&self, columns: &[&str]) -> Result<()> {
        let _guard = self.guard()?;
        // Overwrite in place rather than delete: some hosts refuse removal.
        self.write_header(columns)?;
        log::info!("Truncated results table {}", self.path.display());
        Ok(())
    }
}
