//! MySQL-backed sample store
//!
//! Works with MySQL and MariaDB. A configured charset becomes the
//! connection character set (`SET NAMES`).

use super::{
    insertion_time, is_sql_identifier, Row, SampleStore, StorageError, StorageResult, TableName,
};
use crate::config::DatabaseConfig;
use crate::sample::{Sample, StoredSample};
use chrono::NaiveDateTime;
use mysql::prelude::Queryable;
use mysql::{Conn, Opts, OptsBuilder, Transaction, TxOpts};

const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Sample store writing to a MySQL database
pub struct MysqlStore {
    opts: Opts,
    table: TableName,
}

impl MysqlStore {
    pub fn new(db: &DatabaseConfig, table: TableName) -> StorageResult<Self> {
        let password = (!db.password.is_empty()).then_some(db.password.as_str());

        let builder = OptsBuilder::new()
            .ip_or_hostname(Some(db.host.as_str()))
            .tcp_port(db.server_port())
            .user(Some(db.user.as_str()))
            .pass(password)
            .db_name(Some(db.database.as_str()))
            .init(init_commands(db.charset.as_deref())?);

        Ok(Self {
            opts: builder.into(),
            table,
        })
    }

    fn connect(&self) -> StorageResult<Conn> {
        Conn::new(self.opts.clone()).map_err(|e| StorageError::Connection(e.to_string()))
    }

    /// Run `op` inside one transaction on a fresh connection.
    ///
    /// An uncommitted transaction rolls back on drop; the connection closes
    /// when it goes out of scope.
    fn with_transaction<T>(
        &self,
        op: impl FnOnce(&mut Transaction<'_>) -> StorageResult<T>,
    ) -> StorageResult<T> {
        let mut conn = self.connect()?;

        let mut tx = conn
            .start_transaction(TxOpts::default())
            .map_err(|e| StorageError::Transaction(e.to_string()))?;

        let value = op(&mut tx)?;

        tx.commit()
            .map_err(|e| StorageError::Transaction(e.to_string()))?;

        Ok(value)
    }

    fn create_table_sql(&self) -> String {
        format!(
            "CREATE TABLE {} (
                id INT NOT NULL AUTO_INCREMENT PRIMARY KEY,
                datum DATETIME NOT NULL,
                ip VARCHAR(15) NOT NULL,
                downspeed DECIMAL(7,2) NOT NULL,
                upspeed DECIMAL(7,2) NOT NULL,
                isp VARCHAR(50) NOT NULL,
                error VARCHAR(100)
            )",
            self.table
        )
    }

    fn insert_sql(&self) -> String {
        format!(
            "INSERT INTO {} (datum, ip, isp, downspeed, upspeed, error)
             VALUES (?, ?, ?, ?, ?, ?)",
            self.table
        )
    }

    fn recent_sql(&self) -> String {
        format!(
            "SELECT id, DATE_FORMAT(datum, '%Y-%m-%d %H:%i:%s'), ip, isp, downspeed, upspeed,
                    COALESCE(error, '')
             FROM {}
             ORDER BY id DESC
             LIMIT ?",
            self.table
        )
    }
}

/// Session setup statements for a connection character set
fn init_commands(charset: Option<&str>) -> StorageResult<Vec<String>> {
    match charset {
        None => Ok(Vec::new()),
        Some(charset) if is_sql_identifier(charset) => Ok(vec![format!("SET NAMES {}", charset)]),
        Some(charset) => Err(StorageError::InvalidCharset(charset.to_string())),
    }
}

impl SampleStore for MysqlStore {
    fn provision_schema(&self) -> StorageResult<()> {
        self.with_transaction(|tx| {
            let database = tx
                .query_first::<Option<String>, _>("SELECT DATABASE()")?
                .flatten()
                .ok_or_else(|| StorageError::Connection("no database selected".to_string()))?;
            tracing::info!(database = %database, table = %self.table, "Creating sample table");

            tx.query_drop(self.create_table_sql())?;
            Ok(())
        })
    }

    fn insert(&self, sample: &Sample) -> StorageResult<()> {
        let row = Row::from_sample(sample);
        let datum = insertion_time().format(DATETIME_FORMAT).to_string();

        self.with_transaction(|tx| {
            tx.exec_drop(
                self.insert_sql(),
                (datum, row.ip, row.isp, row.download, row.upload, row.error),
            )?;
            tracing::debug!("Sample row inserted");
            Ok(())
        })
    }

    fn recent(&self, limit: usize) -> StorageResult<Vec<StoredSample>> {
        let mut conn = self.connect()?;
        let rows: Vec<(i64, String, String, String, f64, f64, String)> =
            conn.exec(self.recent_sql(), (limit as u64,))?;

        rows.into_iter()
            .map(|(id, datum, ip, isp, down, up, error)| {
                let timestamp = NaiveDateTime::parse_from_str(&datum, DATETIME_FORMAT)
                    .map_err(|e| StorageError::Statement(format!("datum {:?}: {}", datum, e)))?;

                Ok(StoredSample {
                    id,
                    timestamp,
                    sample: Sample {
                        client_ip: ip,
                        isp,
                        download_mbps: down,
                        upload_mbps: up,
                        error_text: error,
                    },
                })
            })
            .collect()
    }
}
