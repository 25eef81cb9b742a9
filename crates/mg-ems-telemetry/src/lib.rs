//! ---
//! ems_section: "02-telemetry-normalization"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Telemetry ingestion and normalization pipeline."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Telemetry ingestion and normalization for the MG-EMS engine.
//!
//! Raw [`Reading`] records are appended concurrently into the
//! [`TelemetryBuffer`]; each control cycle freezes a snapshot and runs it
//! through the [`Normalizer`] to obtain grid-aligned
//! [`NormalizedSample`] series with explicit validity flags.

use chrono::{DateTime, Utc};
use thiserror::Error;

pub mod buffer;
pub mod normalizer;
pub mod types;

pub use buffer::TelemetryBuffer;
pub use normalizer::{NormalizedBatch, Normalizer};
pub use types::{NormalizedSample, QuantityKind, Reading, SampleValidity, SourceFlag, Unit};

/// Raised when a source has no usable samples in the lookback window.
///
/// Non-fatal: the control loop treats the source as missing for the cycle.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("no valid {kind} samples for source '{source_id}' in lookback window ending {as_of}")]
pub struct DataQualityError {
    pub source_id: String,
    pub kind: QuantityKind,
    pub as_of: DateTime<Utc>,
}
