//! Sample Store
//!
//! Owns the lifecycle of a database connection and exposes the two statements
//! the recorder needs:
//!
//! - **provision_schema**: one-time `CREATE TABLE` for the sample table
//! - **insert**: one parameterized row insertion per run
//!
//! # Connection scope
//!
//! ```text
//! operation → connect → BEGIN → statement(s) → COMMIT → close
//!                                   │ error
//!                                   └────────→ ROLLBACK (drop) → close
//! ```
//!
//! Every operation opens its own connection and drops it before returning,
//! so nothing is held between calls.
//!
//! # Backends
//!
//! - [`SqliteStore`]: a local database file
//! - [`PostgresStore`]: a PostgreSQL server reached with user/password/host
//! - [`MysqlStore`]: a MySQL or MariaDB server, same credentials

mod error;
mod mysqldb;
mod pg;
mod sqlite;

pub use error::{StorageError, StorageResult};
pub use mysqldb::MysqlStore;
pub use pg::PostgresStore;
pub use sqlite::SqliteStore;

use crate::config::{Backend, DatabaseConfig};
use crate::sample::{Sample, StoredSample};
use regex::Regex;
use std::sync::OnceLock;

/// Maximum stored length of the ISP column
pub const ISP_WIDTH: usize = 50;

/// Maximum stored length of the error column
pub const ERROR_WIDTH: usize = 100;

/// Persistent destination for measurement samples
pub trait SampleStore {
    /// Create the sample table. Fails if it already exists.
    fn provision_schema(&self) -> StorageResult<()>;

    /// Insert one sample, stamped with the current time, and commit.
    fn insert(&self, sample: &Sample) -> StorageResult<()>;

    /// Most recent rows, newest first
    fn recent(&self, limit: usize) -> StorageResult<Vec<StoredSample>>;
}

/// A validated table identifier, safe to splice into statement templates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableName(String);

impl TableName {
    pub fn new(name: &str) -> StorageResult<Self> {
        if is_sql_identifier(name) {
            Ok(Self(name.to_string()))
        } else {
            Err(StorageError::InvalidTable(name.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TableName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Check that a name is a plain, unquoted SQL identifier
///
/// Used for table names and the MySQL character set.
pub fn is_sql_identifier(name: &str) -> bool {
    static IDENT: OnceLock<Regex> = OnceLock::new();
    IDENT
        .get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,63}$").expect("static pattern"))
        .is_match(name)
}

/// Build the store selected by the database configuration
pub fn open_store(config: &DatabaseConfig) -> StorageResult<Box<dyn SampleStore>> {
    let table = TableName::new(&config.table)?;

    let store: Box<dyn SampleStore> = match config.backend {
        Backend::Sqlite => Box::new(
            SqliteStore::new(&config.database, table).with_charset(config.charset.clone()),
        ),
        Backend::Postgres => Box::new(PostgresStore::new(config, table)),
        Backend::Mysql => Box::new(MysqlStore::new(config, table)?),
    };

    Ok(store)
}

/// Sample fields ready to bind
///
/// Free text is clipped to its column width; the address is bound unchanged.
struct Row<'a> {
    ip: &'a str,
    isp: &'a str,
    download: f64,
    upload: f64,
    error: &'a str,
}

impl<'a> Row<'a> {
    fn from_sample(sample: &'a Sample) -> Self {
        Self {
            ip: &sample.client_ip,
            isp: clip(&sample.isp, ISP_WIDTH),
            download: round_cents(sample.download_mbps),
            upload: round_cents(sample.upload_mbps),
            error: clip(&sample.error_text, ERROR_WIDTH),
        }
    }
}

/// Cut a string to at most `max_chars` characters
fn clip(value: &str, max_chars: usize) -> &str {
    match value.char_indices().nth(max_chars) {
        Some((idx, _)) => &value[..idx],
        None => value,
    }
}

/// Round to the two decimals the speed columns hold
fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Insertion time, second precision, local wall clock
fn insertion_time() -> chrono::NaiveDateTime {
    use chrono::SubsecRound;
    chrono::Local::now().naive_local().trunc_subsecs(0)
}
