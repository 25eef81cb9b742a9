//! ---
//! ems_section: "05-forecasting"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Short-horizon demand and generation forecasting."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};

use mg_ems_telemetry::QuantityKind;

/// Point estimate and uncertainty band for one horizon bucket.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ForecastBucket {
    pub start: DateTime<Utc>,
    pub point_kw: f64,
    pub lower_kw: f64,
    pub upper_kw: f64,
}

impl ForecastBucket {
    pub fn band_width(&self) -> f64 {
        self.upper_kw - self.lower_kw
    }
}

/// Traceability tag recording the inputs a window was derived from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DerivationTag {
    pub state_timestamp: DateTime<Utc>,
    pub window_start: Option<DateTime<Utc>>,
    pub window_end: Option<DateTime<Utc>>,
    pub sample_count: usize,
    pub strategy: String,
}

/// Immutable probabilistic forecast over the dispatch horizon.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ForecastWindow {
    pub kind: QuantityKind,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub bucket: Duration,
    pub buckets: Vec<ForecastBucket>,
    /// True when produced by the persistence fallback.
    pub naive: bool,
    pub derived_from: DerivationTag,
}

impl ForecastWindow {
    pub fn point_at(&self, index: usize) -> f64 {
        self.buckets.get(index).map(|b| b.point_kw).unwrap_or(0.0)
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}
