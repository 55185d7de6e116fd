use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use blockflow_core::error::{BlockflowError, Result};
use blockflow_core::storage::{DataFormat, StorageApi, StorageKind};
use blockflow_core::types::{Record, Records};

/// Rows inserted per transaction by [`StorageApi::bulk_write_rows`].
pub const BULK_INSERT_BATCH_SIZE: usize = 500;

/// SQLite database storing each object as a table of JSON rows.
pub struct SqliteStorage {
    url: String,
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    /// `sqlite://:memory:`, `sqlite:///abs/path.db` or `sqlite://rel.db`.
    pub fn from_url(url: &str) -> Result<Self> {
        let target = url
            .strip_prefix("sqlite://")
            .ok_or_else(|| BlockflowError::UnsupportedStorage(url.to_string()))?;
        let conn = if target.is_empty() || target == ":memory:" {
            Connection::open_in_memory()
        } else {
            let path = Path::new(target);
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .map_err(|e| BlockflowError::storage(url, e))?;
            }
            Connection::open(path)
        }
        .map_err(|e| BlockflowError::storage(url, e))?;
        debug!(url = %url, "SQLite storage opened");
        Ok(Self {
            url: url.to_string(),
            conn: Mutex::new(conn),
        })
    }

    fn err(&self, e: impl std::fmt::Display) -> BlockflowError {
        BlockflowError::storage(&self.url, e)
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| self.err(e))
    }

    fn create_table(&self, conn: &Connection, table: &str) -> Result<()> {
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                 _row INTEGER PRIMARY KEY AUTOINCREMENT,
                 record TEXT NOT NULL
             );",
            table
        ))
        .map_err(|e| self.err(e))
    }

    fn insert_batched(&self, conn: &mut Connection, table: &str, rows: &[Record]) -> Result<()> {
        let sql = format!("INSERT INTO {} (record) VALUES (?1)", table);
        for chunk in rows.chunks(BULK_INSERT_BATCH_SIZE) {
            let tx = conn.transaction().map_err(|e| self.err(e))?;
            {
                let mut stmt = tx.prepare_cached(&sql).map_err(|e| self.err(e))?;
                for row in chunk {
                    let json = serde_json::to_string(row)?;
                    stmt.execute(params![json]).map_err(|e| self.err(e))?;
                }
            }
            tx.commit().map_err(|e| self.err(e))?;
        }
        Ok(())
    }
}

/// Quote `name` as a table identifier. Only word characters are allowed.
fn table_ident(name: &str) -> Result<String> {
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(BlockflowError::storage(
            "sqlite",
            format!("invalid table name: {}", name),
        ));
    }
    Ok(format!("\"{}\"", name))
}

impl StorageApi for SqliteStorage {
    fn url(&self) -> &str {
        &self.url
    }

    fn kind(&self) -> StorageKind {
        StorageKind::Database
    }

    fn natural_format(&self) -> DataFormat {
        DataFormat::Table
    }

    fn exists(&self, name: &str) -> Result<bool> {
        let conn = self.conn()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| self.err(e))?;
        Ok(found.is_some())
    }

    fn put(&self, name: &str, records: Records) -> Result<()> {
        let table = table_ident(name)?;
        let mut conn = self.conn()?;
        conn.execute_batch(&format!("DROP TABLE IF EXISTS {};", table))
            .map_err(|e| self.err(e))?;
        self.create_table(&conn, &table)?;
        self.insert_batched(&mut conn, &table, &records)
    }

    fn get(&self, name: &str) -> Result<Records> {
        let table = table_ident(name)?;
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!("SELECT record FROM {} ORDER BY _row", table))
            .map_err(|e| self.err(e))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| self.err(e))?;
        let mut records = Records::new();
        for json in rows {
            let json = json.map_err(|e| self.err(e))?;
            records.push(serde_json::from_str(&json)?);
        }
        Ok(records)
    }

    fn remove(&self, name: &str) -> Result<()> {
        let table = table_ident(name)?;
        let conn = self.conn()?;
        conn.execute_batch(&format!("DROP TABLE IF EXISTS {};", table))
            .map_err(|e| self.err(e))
    }

    fn bulk_write_rows(&self, name: &str, rows: &[Record]) -> Result<()> {
        let table = table_ident(name)?;
        let mut conn = self.conn()?;
        self.create_table(&conn, &table)?;
        self.insert_batched(&mut conn, &table, rows)
    }

    fn record_count(&self, name: &str) -> Result<u64> {
        let table = table_ident(name)?;
        let conn = self.conn()?;
        let count: i64 = conn
            .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))
            .map_err(|e| self.err(e))?;
        Ok(count as u64)
    }
}
