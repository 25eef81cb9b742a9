//! ---
//! ems_section: "05-forecasting"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Short-horizon demand and generation forecasting."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use mg_ems_telemetry::{NormalizedBatch, QuantityKind};

/// One aggregated point on the sampling grid.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SeriesPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub confidence: f64,
}

/// Time-ordered aggregate of one quantity across all contributing sources.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SampleSeries {
    pub kind: QuantityKind,
    pub points: Vec<SeriesPoint>,
}

impl SampleSeries {
    /// Sum per-tick values of a quantity across sources; the aggregate
    /// confidence of a tick is its weakest contributor.
    pub fn aggregate(batch: &NormalizedBatch, kind: QuantityKind) -> Self {
        let mut by_tick: BTreeMap<DateTime<Utc>, (f64, f64)> = BTreeMap::new();
        for sample in batch.of_kind(kind) {
            let entry = by_tick.entry(sample.timestamp).or_insert((0.0, 1.0));
            entry.0 += sample.value;
            entry.1 = entry.1.min(sample.confidence);
        }
        let points = by_tick
            .into_iter()
            .map(|(timestamp, (value, confidence))| SeriesPoint {
                timestamp,
                value,
                confidence,
            })
            .collect();
        Self { kind, points }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn last(&self) -> Option<&SeriesPoint> {
        self.points.last()
    }

    pub fn first_timestamp(&self) -> Option<DateTime<Utc>> {
        self.points.first().map(|p| p.timestamp)
    }

    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.points.last().map(|p| p.timestamp)
    }
}
