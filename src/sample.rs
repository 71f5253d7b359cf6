//! Measurement records
//!
//! - `Sample`: one measurement outcome, real or sentinel, before it is stored
//! - `StoredSample`: a persisted row read back from the store

use chrono::NaiveDateTime;
use serde::Serialize;

/// Client address recorded when no real measurement exists
pub const SENTINEL_IP: &str = "0.0.0.0";

/// ISP recorded when no real measurement exists
pub const SENTINEL_ISP: &str = "-";

/// Divisor from bits per second to megabits per second
pub const BITS_PER_MEGABIT: f64 = 1_000_000.0;

/// A single throughput measurement outcome
///
/// Either a genuine measurement (`error_text` empty) or a failure record
/// carrying sentinel values and a description of what went wrong. The
/// persisted timestamp is assigned by the store at insertion time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    /// Public address as reported by the measurement service
    pub client_ip: String,
    /// Provider name as reported by the measurement service
    pub isp: String,
    /// Download throughput in Mbit/s
    pub download_mbps: f64,
    /// Upload throughput in Mbit/s
    pub upload_mbps: f64,
    /// Empty on success, failure description otherwise
    pub error_text: String,
}

impl Sample {
    /// Create a genuine measurement from raw bit rates
    pub fn measured(
        client_ip: impl Into<String>,
        isp: impl Into<String>,
        download_bps: f64,
        upload_bps: f64,
    ) -> Self {
        Self {
            client_ip: client_ip.into(),
            isp: isp.into(),
            download_mbps: to_mbps(download_bps),
            upload_mbps: to_mbps(upload_bps),
            error_text: String::new(),
        }
    }

    /// Create a sentinel record describing a failed measurement
    pub fn failed(error_text: impl Into<String>) -> Self {
        Self {
            client_ip: SENTINEL_IP.to_string(),
            isp: SENTINEL_ISP.to_string(),
            download_mbps: 0.0,
            upload_mbps: 0.0,
            error_text: error_text.into(),
        }
    }

    /// True when this record carries a failure instead of a measurement
    pub fn is_failure(&self) -> bool {
        !self.error_text.is_empty()
    }
}

impl std::fmt::Display for Sample {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_failure() {
            write!(f, "failed: {}", self.error_text)
        } else {
            write!(
                f,
                "ip={} isp={} down={:.2} Mbit/s up={:.2} Mbit/s",
                self.client_ip, self.isp, self.download_mbps, self.upload_mbps
            )
        }
    }
}

/// Convert a raw bit rate to Mbit/s
pub fn to_mbps(bits_per_second: f64) -> f64 {
    bits_per_second / BITS_PER_MEGABIT
}

/// A sample as persisted, with its identity key and insertion time
///
/// Serializes as one flat record: `id`, `timestamp`, then the sample fields.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredSample {
    pub id: i64,
    pub timestamp: NaiveDateTime,
    #[serde(flatten)]
    pub sample: Sample,
}
