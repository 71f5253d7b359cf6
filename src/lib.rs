//! # speedlog
//!
//! One-shot internet throughput recorder. Each run measures download and
//! upload speed once against the speedtest.net server network and stores the
//! outcome, success or failure, as exactly one row in a relational database.
//! Meant to be started periodically by cron or a systemd timer.
//!
//! ## Modules
//!
//! - [`probe`]: Throughput measurement against speedtest.net
//! - [`store`]: SQLite, PostgreSQL and MySQL sample stores
//! - [`runner`]: Measure-then-record sequencing and exit statuses
//! - [`config`]: TOML / legacy credentials configuration
//! - [`logging`]: Console and size-rotated file logging
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use speedlog::{open_store, run_cycle, Config, SpeedtestProbe};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load(std::path::Path::new("speedlog.toml"))?;
//!     let store = open_store(&config.database)?;
//!     let probe = SpeedtestProbe::new(config.probe.clone());
//!
//!     let outcome = run_cycle(&probe, store.as_ref());
//!     println!("exit status {}", outcome.exit_code());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod logging;
pub mod probe;
pub mod runner;
pub mod sample;
pub mod store;

pub use config::{Backend, Config, ConfigError, DatabaseConfig, LoggingConfig, ProbeConfig};

pub use logging::{init_logging, LoggingGuards, SizeRotatingWriter};

pub use probe::{Probe, ProbeError, SpeedtestProbe, MAX_SERVERS};

pub use runner::{run_cycle, run_setup, RunError, RunOutcome};

pub use sample::{Sample, StoredSample, SENTINEL_IP, SENTINEL_ISP};

pub use store::{
    open_store, MysqlStore, PostgresStore, SampleStore, SqliteStore, StorageError, StorageResult,
    TableName,
};
