//! Throughput Probe
//!
//! Drives one measurement against a speedtest.net-compatible service:
//!
//! ```text
//! client config ─→ server directory ─→ closest N ─→ best by latency
//!                                                        ↓
//!                                   Sample ←─ upload ←─ download
//! ```
//!
//! - **directory**: XML documents and closest-server selection
//! - **speedtest**: HTTP client performing the actual tests
//!
//! Every error here is a measurement failure: the caller records it and
//! moves on, it never aborts the process.

mod directory;
mod speedtest;

pub use directory::{
    closest_servers, distance_km, parse_client_config, parse_server_list, ClientConfig,
    ClientInfo, ServerEntry,
};
pub use speedtest::{SpeedtestProbe, MAX_SERVERS};

use crate::sample::Sample;
use thiserror::Error;

/// Source of throughput measurements
pub trait Probe {
    /// Run one measurement. No retries.
    fn measure(&self) -> Result<Sample, ProbeError>;
}

/// Errors that can occur while measuring
///
/// The display text is the bare failure description, which is what ends up
/// in the error column of a failure record.
#[derive(Error, Debug)]
pub enum ProbeError {
    /// The client configuration document could not be fetched
    #[error("{0}")]
    ConfigRetrieval(String),

    /// No server directory could be fetched
    #[error("{0}")]
    ServersRetrieval(String),

    /// No eligible or reachable server
    #[error("{0}")]
    NoServers(String),

    /// A document was malformed or held unusable values
    #[error("{0}")]
    InvalidData(String),

    /// A download or upload transfer failed
    #[error("{0}")]
    Transfer(String),
}

impl ProbeError {
    /// Failure class for log output
    pub fn kind(&self) -> &'static str {
        match self {
            ProbeError::ConfigRetrieval(_) | ProbeError::ServersRetrieval(_) => "config_retrieval",
            ProbeError::NoServers(_) | ProbeError::InvalidData(_) => "value",
            ProbeError::Transfer(_) => "transfer",
        }
    }
}
