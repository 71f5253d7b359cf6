//! SQLite-backed sample store
//!
//! The "database" is a file path. Provisioning may create the file; inserts
//! and reads require it to exist already, so a missing or mistyped path shows
//! up as a connection failure instead of a fresh empty database.

use super::{insertion_time, Row, SampleStore, StorageError, StorageResult, TableName};
use crate::sample::{Sample, StoredSample};
use rusqlite::{params, Connection, OpenFlags, Transaction};
use std::path::{Path, PathBuf};

/// Sample store writing to a local SQLite file
#[derive(Debug, Clone)]
pub struct SqliteStore {
    path: PathBuf,
    table: TableName,
    charset: Option<String>,
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>, table: TableName) -> Self {
        Self {
            path: path.into(),
            table,
            charset: None,
        }
    }

    /// Text encoding applied when provisioning a new database file
    pub fn with_charset(mut self, charset: Option<String>) -> Self {
        self.charset = charset;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(&self, create: bool) -> StorageResult<Connection> {
        let mut flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        if create {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
            if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
        }

        Connection::open_with_flags(&self.path, flags).map_err(|e| {
            StorageError::Connection(format!("{}: {}", self.path.display(), e))
        })
    }

    /// Run `op` inside one transaction on a fresh connection.
    ///
    /// Commits when `op` succeeds. On any error the transaction is dropped
    /// uncommitted (rolled back), and the connection closes when it goes out
    /// of scope either way.
    fn with_transaction<T>(
        &self,
        create: bool,
        op: impl FnOnce(&Transaction<'_>) -> StorageResult<T>,
    ) -> StorageResult<T> {
        let mut conn = self.connect(create)?;

        if create {
            if let Some(charset) = &self.charset {
                // only takes effect before the first table exists
                conn.pragma_update(None, "encoding", charset)?;
            }
        }

        let tx = conn
            .transaction()
            .map_err(|e| StorageError::Transaction(e.to_string()))?;

        let value = op(&tx)?;

        tx.commit()
            .map_err(|e| StorageError::Transaction(e.to_string()))?;

        Ok(value)
    }

    fn create_table_sql(&self) -> String {
        format!(
            "CREATE TABLE {} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                datum DATETIME NOT NULL,
                ip VARCHAR(15) NOT NULL,
                downspeed NUMERIC(7,2) NOT NULL,
                upspeed NUMERIC(7,2) NOT NULL,
                isp VARCHAR(50) NOT NULL,
                error VARCHAR(100)
            )",
            self.table
        )
    }

    fn insert_sql(&self) -> String {
        format!(
            "INSERT INTO {} (datum, ip, isp, downspeed, upspeed, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            self.table
        )
    }

    fn recent_sql(&self) -> String {
        format!(
            "SELECT id, datum, ip, isp, downspeed, upspeed, error FROM {}
             ORDER BY id DESC
             LIMIT ?1",
            self.table
        )
    }
}

impl SampleStore for SqliteStore {
    fn provision_schema(&self) -> StorageResult<()> {
        tracing::info!(path = %self.path.display(), table = %self.table, "Creating sample table");

        self.with_transaction(true, |tx| {
            tx.execute(&self.create_table_sql(), [])?;
            Ok(())
        })
    }

    fn insert(&self, sample: &Sample) -> StorageResult<()> {
        let row = Row::from_sample(sample);

        self.with_transaction(false, |tx| {
            let inserted = tx.execute(
                &self.insert_sql(),
                params![
                    insertion_time(),
                    row.ip,
                    row.isp,
                    row.download,
                    row.upload,
                    row.error
                ],
            )?;
            tracing::debug!(rows = inserted, "Sample row inserted");
            Ok(())
        })
    }

    fn recent(&self, limit: usize) -> StorageResult<Vec<StoredSample>> {
        let conn = self.connect(false)?;
        let mut stmt = conn.prepare(&self.recent_sql())?;

        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(StoredSample {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                sample: Sample {
                    client_ip: row.get(2)?,
                    isp: row.get(3)?,
                    download_mbps: row.get(4)?,
                    upload_mbps: row.get(5)?,
                    error_text: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
                },
            })
        })?;

        let samples = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(samples)
    }
}
