//! Run Orchestration
//!
//! Sequences one probe and one insert, and maps what happened to an exit
//! status:
//!
//! ```text
//! measure ──ok──→ insert(sample)   ──ok──→ Recorded           (0)
//!    │                             └─err─→ StorageFailed      (2)
//!    └─err─→ insert(sentinel)      ──ok──→ MeasurementFailed  (1)
//!                                  └─err─→ StorageFailed      (2)
//! ```
//!
//! Provisioning is a separate entry point that never measures.

use crate::config::ConfigError;
use crate::probe::{Probe, ProbeError};
use crate::sample::Sample;
use crate::store::{SampleStore, StorageError};
use std::process::ExitCode;
use thiserror::Error;

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// A real measurement was stored
    Recorded,
    /// The sample table was created
    Provisioned,
    /// Stored rows were listed
    Reported,
    /// Measuring failed and the failure record was stored
    MeasurementFailed,
    /// The store could not be written; nothing was recorded
    StorageFailed,
    /// The process could not start (configuration, logging)
    ConfigFailed,
}

impl RunOutcome {
    pub fn exit_code(self) -> u8 {
        match self {
            RunOutcome::Recorded | RunOutcome::Provisioned | RunOutcome::Reported => 0,
            RunOutcome::MeasurementFailed => 1,
            RunOutcome::StorageFailed => 2,
            RunOutcome::ConfigFailed => 3,
        }
    }

    pub fn is_success(self) -> bool {
        self.exit_code() == 0
    }
}

impl From<RunOutcome> for ExitCode {
    fn from(outcome: RunOutcome) -> Self {
        ExitCode::from(outcome.exit_code())
    }
}

/// Any failure of a run, tagged by the layer it came from
#[derive(Error, Debug)]
pub enum RunError {
    #[error("Measurement failed: {0}")]
    Measurement(#[from] ProbeError),

    #[error("Storage failed: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration failed: {0}")]
    Config(#[from] ConfigError),
}

impl RunError {
    pub fn outcome(&self) -> RunOutcome {
        match self {
            RunError::Measurement(_) => RunOutcome::MeasurementFailed,
            RunError::Storage(_) => RunOutcome::StorageFailed,
            RunError::Config(_) => RunOutcome::ConfigFailed,
        }
    }
}

/// Measure once and record the result, real or sentinel
pub fn run_cycle<P, S>(probe: &P, store: &S) -> RunOutcome
where
    P: Probe + ?Sized,
    S: SampleStore + ?Sized,
{
    match cycle(probe, store) {
        Ok(()) => RunOutcome::Recorded,
        Err(err) => err.outcome(),
    }
}

fn cycle<P, S>(probe: &P, store: &S) -> Result<(), RunError>
where
    P: Probe + ?Sized,
    S: SampleStore + ?Sized,
{
    let (sample, failure) = match probe.measure() {
        Ok(sample) => {
            tracing::info!(%sample, "Measurement succeeded");
            (sample, None)
        }
        Err(err) => {
            tracing::error!(kind = err.kind(), error = %err, "Speedtest failed, recording failure");
            (Sample::failed(err.to_string()), Some(err))
        }
    };

    // the only insert of a run
    store.insert(&sample).map_err(|err| {
        tracing::error!(error = %err, failure = sample.is_failure(), "Could not record sample");
        err
    })?;
    tracing::info!(failure = sample.is_failure(), "Sample recorded");

    match failure {
        Some(err) => Err(RunError::Measurement(err)),
        None => Ok(()),
    }
}

/// Create the sample table
pub fn run_setup<S>(store: &S) -> RunOutcome
where
    S: SampleStore + ?Sized,
{
    tracing::info!("Provisioning schema");

    match store.provision_schema() {
        Ok(()) => {
            tracing::info!("Schema provisioned");
            RunOutcome::Provisioned
        }
        Err(err) => {
            tracing::error!(error = %err, "Schema provisioning failed");
            RunOutcome::StorageFailed
        }
    }
}
