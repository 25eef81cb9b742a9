//! ---
//! ems_section: "02-telemetry-normalization"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Telemetry ingestion and normalization pipeline."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::trace;

use crate::types::Reading;
use mg_ems_common::time::to_delta;

/// Append-only ingest buffer shared between the inbound feed and the
/// control cycle.
///
/// Ingestion only appends; a cycle reads a frozen snapshot taken at
/// `Collecting` entry, so mid-cycle arrivals never mutate data the cycle
/// is working on. Entries older than the retention window are pruned when
/// a snapshot is taken.
#[derive(Debug)]
pub struct TelemetryBuffer {
    retention: Duration,
    inner: RwLock<Vec<Reading>>,
}

impl TelemetryBuffer {
    pub fn new(retention: Duration) -> Self {
        Self {
            retention,
            inner: RwLock::new(Vec::new()),
        }
    }

    /// Append a single reading.
    pub fn ingest(&self, reading: Reading) {
        self.inner.write().push(reading);
    }

    /// Append a batch of readings.
    pub fn extend<I: IntoIterator<Item = Reading>>(&self, readings: I) {
        self.inner.write().extend(readings);
    }

    /// Freeze the buffer contents up to `as_of`, pruning expired entries.
    pub fn snapshot(&self, as_of: DateTime<Utc>) -> Vec<Reading> {
        let cutoff = as_of - to_delta(self.retention);
        let mut guard = self.inner.write();
        guard.retain(|reading| reading.timestamp >= cutoff);
        let frozen: Vec<Reading> = guard
            .iter()
            .filter(|reading| reading.timestamp <= as_of)
            .cloned()
            .collect();
        trace!(total = guard.len(), frozen = frozen.len(), "telemetry snapshot taken");
        frozen
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}
