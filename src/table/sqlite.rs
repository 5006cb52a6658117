use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, params};

use super::{AppendOnlyTable, Result, TableError, csv_line};

/// Results table stored in SQLite.
///
/// The header lives in `table_columns`, each data row is a JSON array of
/// fields in `result_rows`. Row order is insertion order (`id`).
pub struct SqliteTable {
    conn: Mutex<Connection>,
}

impl SqliteTable {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        // WAL so an admin export can read while a session appends
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| TableError::Unavailable("database lock poisoned".into()))?;
        f(&mut conn)
    }
}

fn migrate(conn: &Connection) -> Result<()> {
    let version: i32 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .unwrap_or(0);

    if version < 1 {
        migrate_v1(conn)?;
    }

    conn.pragma_update(None, "user_version", 1)?;
    Ok(())
}

/// V1: header columns + JSON-encoded rows
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS table_columns (
            position    INTEGER PRIMARY KEY,
            name        TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS result_rows (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            fields      TEXT NOT NULL,
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );
        ",
    )?;
    Ok(())
}

fn load_header(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM table_columns ORDER BY position")?;
    let header = stmt
        .query_map([], |row| row.get(0))?
        .collect::<std::result::Result<Vec<String>, _>>()?;
    Ok(header)
}

fn write_header(conn: &Connection, columns: &[&str]) -> Result<()> {
    let mut stmt = conn.prepare("INSERT INTO table_columns (position, name) VALUES (?1, ?2)")?;
    for (i, name) in columns.iter().enumerate() {
        stmt.execute(params![i as i64, *name])?;
    }
    Ok(())
}

impl AppendOnlyTable for SqliteTable {
    fn init_header(&self, columns: &[&str]) -> Result<bool> {
        self.with(|conn| {
            let tx = conn.transaction()?;
            let existing = load_header(&tx)?;
            if !existing.is_empty() {
                if !existing.iter().map(String::as_str).eq(columns.iter().copied()) {
                    log::warn!("Stored header differs from the expected schema: {existing:?}");
                }
                return Ok(false);
            }
            write_header(&tx, columns)?;
            tx.commit()?;
            log::info!("Created results table ({} columns)", columns.len());
            Ok(true)
        })
    }

    fn append_row(&self, fields: &[String]) -> Result<()> {
        self.with(|conn| {
            let tx = conn.transaction()?;
            let width: i64 = tx.query_row("SELECT COUNT(*) FROM table_columns", [], |row| row.get(0))?;
            if width == 0 {
                return Err(TableError::Unavailable("results table has no header".into()));
            }
            if width as usize != fields.len() {
                return Err(TableError::Width {
                    expected: width as usize,
                    got: fields.len(),
                });
            }
            let encoded = serde_json::to_string(fields)?;
            tx.execute("INSERT INTO result_rows (fields) VALUES (?1)", params![encoded])?;
            tx.commit()?;
            Ok(())
        })
    }

    fn row_count(&self) -> Result<usize> {
        self.with(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM result_rows", [], |row| row.get(0))?;
            Ok(n as usize)
        })
    }

    fn export_csv(&self) -> Result<String> {
        self.with(|conn| {
            let header = load_header(conn)?;
            let mut out = csv_line(&header);

            let mut stmt = conn.prepare("SELECT fields FROM result_rows ORDER BY id")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            for encoded in rows {
                let fields: Vec<String> = serde_json::from_str(&encoded?)?;
                out.push_str(&csv_line(&fields));
            }
            Ok(out)
        })
    }

    fn truncate(&self, columns: &[&str]) -> Result<()> {
        self.with(|conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM result_rows", [])?;
            tx.execute("DELETE FROM table_columns", [])?;
            write_header(&tx, columns)?;
            tx.commit()?;
            log::info!("Truncated results table");
            Ok(())
        })
    }
}
