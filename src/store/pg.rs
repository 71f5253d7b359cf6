//! PostgreSQL-backed sample store

use super::{insertion_time, Row, SampleStore, StorageError, StorageResult, TableName};
use crate::config::DatabaseConfig;
use crate::sample::{Sample, StoredSample};
use postgres::{Client, NoTls, Transaction};

/// Sample store writing to a PostgreSQL database
pub struct PostgresStore {
    config: postgres::Config,
    table: TableName,
}

impl PostgresStore {
    pub fn new(db: &DatabaseConfig, table: TableName) -> Self {
        let mut config = postgres::Config::new();
        config
            .host(&db.host)
            .port(db.server_port())
            .user(&db.user)
            .dbname(&db.database)
            .application_name(env!("CARGO_PKG_NAME"));

        if !db.password.is_empty() {
            config.password(&db.password);
        }

        if let Some(charset) = &db.charset {
            tracing::warn!(
                charset = %charset,
                "Ignoring charset for postgres backend, client encoding is always UTF8"
            );
        }

        Self { config, table }
    }

    fn connect(&self) -> StorageResult<Client> {
        self.config
            .connect(NoTls)
            .map_err(|e| StorageError::Connection(e.to_string()))
    }

    /// Run `op` inside one transaction on a fresh connection.
    ///
    /// An uncommitted transaction rolls back on drop; the client closes when
    /// it goes out of scope.
    fn with_transaction<T>(
        &self,
        op: impl FnOnce(&mut Transaction<'_>) -> StorageResult<T>,
    ) -> StorageResult<T> {
        let mut client = self.connect()?;

        let mut tx = client
            .transaction()
            .map_err(|e| StorageError::Transaction(e.to_string()))?;

        let value = op(&mut tx)?;

        tx.commit()
            .map_err(|e| StorageError::Transaction(e.to_string()))?;

        Ok(value)
    }

    fn create_table_sql(&self) -> String {
        format!(
            "CREATE TABLE {} (
                id SERIAL PRIMARY KEY,
                datum TIMESTAMP NOT NULL,
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
        // speeds are bound as float8 and narrowed by the column's numeric type
        format!(
            "INSERT INTO {} (datum, ip, isp, downspeed, upspeed, error)
             VALUES ($1, $2, $3, $4::FLOAT8, $5::FLOAT8, $6)",
            self.table
        )
    }

    fn recent_sql(&self) -> String {
        format!(
            "SELECT id::INT8, datum, ip, isp, downspeed::FLOAT8, upspeed::FLOAT8,
                    COALESCE(error, '')
             FROM {}
             ORDER BY id DESC
             LIMIT $1",
            self.table
        )
    }
}

impl SampleStore for PostgresStore {
    fn provision_schema(&self) -> StorageResult<()> {
        self.with_transaction(|tx| {
            let database: String = tx.query_one("SELECT current_database()", &[])?.get(0);
            tracing::info!(database = %database, table = %self.table, "Creating sample table");

            tx.batch_execute(&self.create_table_sql())?;
            Ok(())
        })
    }

    fn insert(&self, sample: &Sample) -> StorageResult<()> {
        let row = Row::from_sample(sample);

        self.with_transaction(|tx| {
            let inserted = tx.execute(
                &self.insert_sql(),
                &[
                    &insertion_time(),
                    &row.ip,
                    &row.isp,
                    &row.download,
                    &row.upload,
                    &row.error,
                ],
            )?;
            tracing::debug!(rows = inserted, "Sample row inserted");
            Ok(())
        })
    }

    fn recent(&self, limit: usize) -> StorageResult<Vec<StoredSample>> {
        let mut client = self.connect()?;
        let rows = client.query(&self.recent_sql(), &[&(limit as i64)])?;

        Ok(rows
            .iter()
            .map(|row| StoredSample {
                id: row.get(0),
                timestamp: row.get(1),
                sample: Sample {
                    client_ip: row.get(2),
                    isp: row.get(3),
                    download_mbps: row.get(4),
                    upload_mbps: row.get(5),
                    error_text: row.get(6),
                },
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Backend;

    fn db_config() -> DatabaseConfig {
        DatabaseConfig {
            backend: Backend::Postgres,
            user: "recorder".to_string(),
            password: "secret".to_string(),
            host: "127.0.0.1".to_string(),
            port: Some(1),
            database: "netstats".to_string(),
            table: "lm_speedtest".to_string(),
            charset: None,
        }
    }

    #[test]
    fn test_connection_config() {
        let store = PostgresStore::new(&db_config(), TableName::new("lm_speedtest").unwrap());

        assert_eq!(store.config.get_user(), Some("recorder"));
        assert_eq!(store.config.get_dbname(), Some("netstats"));
        assert_eq!(store.config.get_ports(), &[1]);
        assert_eq!(store.config.get_password(), Some(&b"secret"[..]));
    }

    #[test]
    fn test_statements_use_table_name() {
        let store = PostgresStore::new(&db_config(), TableName::new("lm_speedtest").unwrap());

        assert!(store.create_table_sql().starts_with("CREATE TABLE lm_speedtest ("));
        assert!(!store.create_table_sql().contains("IF NOT EXISTS"));
        assert!(store.insert_sql().starts_with("INSERT INTO lm_speedtest "));
        assert!(store.insert_sql().contains("$6"));
        assert!(store.recent_sql().contains("FROM lm_speedtest"));
    }

    #[test]
    fn test_unreachable_server_is_connection_error() {
        let store = PostgresStore::new(&db_config(), TableName::new("lm_speedtest").unwrap());

        let err = store.insert(&Sample::failed("x")).unwrap_err();
        assert!(matches!(err, StorageError::Connection(_)));

        let err = store.provision_schema().unwrap_err();
        assert!(matches!(err, StorageError::Connection(_)));
    }
}
