//! ---
//! ems_section: "02-telemetry-normalization"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Telemetry ingestion and normalization pipeline."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::types::{NormalizedSample, QuantityKind, Reading, SampleValidity};
use crate::DataQualityError;
use mg_ems_common::config::TelemetryConfig;
use mg_ems_common::time::{align_to_tick, to_delta};

const MIN_STALE_CONFIDENCE: f64 = 0.05;

/// Result of one normalization pass over a frozen telemetry snapshot.
#[derive(Debug, Clone, Default)]
pub struct NormalizedBatch {
    /// Grid-aligned samples, ordered by (source, kind) then timestamp.
    pub samples: Vec<NormalizedSample>,
    /// Sources with zero valid readings in the lookback window.
    pub missing: Vec<DataQualityError>,
}

impl NormalizedBatch {
    /// Latest sample for a given source and quantity, if any.
    pub fn latest(&self, source_id: &str, kind: QuantityKind) -> Option<&NormalizedSample> {
        self.samples
            .iter()
            .filter(|sample| sample.source_id == source_id && sample.kind == kind)
            .max_by_key(|sample| sample.timestamp)
    }

    /// All samples of a given quantity across sources.
    pub fn of_kind(&self, kind: QuantityKind) -> impl Iterator<Item = &NormalizedSample> {
        self.samples.iter().filter(move |sample| sample.kind == kind)
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Resamples raw readings onto the fixed telemetry grid.
#[derive(Debug, Clone)]
pub struct Normalizer {
    tick: Duration,
    lookback: Duration,
    max_gap: Duration,
    stale_decay: Duration,
}

impl Normalizer {
    pub fn from_config(config: &TelemetryConfig) -> Self {
        Self {
            tick: config.tick,
            lookback: config.lookback,
            max_gap: config.max_gap,
            stale_decay: config.stale_decay,
        }
    }

    /// Validate and time-align a frozen snapshot of readings up to `as_of`.
    ///
    /// Per-source timestamp regressions are dropped to keep each series
    /// monotonically non-decreasing. Gaps up to `max_gap` are filled by
    /// linear interpolation; longer gaps hold the last value with
    /// exponentially decaying confidence. A source without any reading in
    /// the lookback window is reported in [`NormalizedBatch::missing`]
    /// rather than failing the pass.
    pub fn normalize(&self, readings: &[Reading], as_of: DateTime<Utc>) -> NormalizedBatch {
        let mut grouped: BTreeMap<(String, QuantityKind), Vec<&Reading>> = BTreeMap::new();
        for reading in readings.iter().filter(|r| r.timestamp <= as_of) {
            grouped
                .entry((reading.source_id.clone(), reading.kind))
                .or_default()
                .push(reading);
        }

        let window_start = as_of - to_delta(self.lookback);
        let mut batch = NormalizedBatch::default();

        for ((source_id, kind), mut series) in grouped {
            let total = series.len();
            retain_monotonic(&mut series);
            if series.len() < total {
                debug!(
                    source = %source_id,
                    kind = %kind,
                    dropped = total - series.len(),
                    "dropped out-of-order readings"
                );
            }

            let in_window = series
                .iter()
                .filter(|r| r.timestamp >= window_start)
                .count();
            if in_window == 0 {
                warn!(source = %source_id, kind = %kind, "no valid readings in lookback window");
                batch.missing.push(DataQualityError {
                    source_id,
                    kind,
                    as_of,
                });
                continue;
            }

            self.resample(&source_id, kind, &series, window_start, as_of, &mut batch.samples);
        }

        batch
    }

    fn resample(
        &self,
        source_id: &str,
        kind: QuantityKind,
        series: &[&Reading],
        window_start: DateTime<Utc>,
        as_of: DateTime<Utc>,
        out: &mut Vec<NormalizedSample>,
    ) {
        let tick_delta = to_delta(self.tick);
        let mut tick = align_to_tick(window_start, self.tick);
        if tick < window_start {
            tick += tick_delta;
        }
        let last_tick = align_to_tick(as_of, self.tick);

        let mut prev_idx: Option<usize> = None;
        let mut cursor = 0usize;

        while tick <= last_tick {
            while cursor < series.len() && series[cursor].timestamp <= tick {
                prev_idx = Some(cursor);
                cursor += 1;
            }

            let Some(pi) = prev_idx else {
                // No reading yet at this point of the grid.
                tick += tick_delta;
                continue;
            };
            let prev = series[pi];
            let next = series.get(cursor).copied();
            let age = (tick - prev.timestamp)
                .to_std()
                .unwrap_or(Duration::ZERO);

            let (value, validity, confidence) = if age <= self.tick {
                (prev.value, SampleValidity::Measured, 1.0)
            } else if let Some(next) = next {
                let gap = (next.timestamp - prev.timestamp)
                    .to_std()
                    .unwrap_or(Duration::MAX);
                if gap <= self.max_gap {
                    let span = gap.as_secs_f64().max(f64::EPSILON);
                    let frac = age.as_secs_f64() / span;
                    let value = prev.value + (next.value - prev.value) * frac;
                    let confidence = 1.0 - 0.5 * (gap.as_secs_f64() / self.max_gap.as_secs_f64());
                    (value, SampleValidity::Interpolated, confidence)
                } else {
                    (prev.value, SampleValidity::Stale, self.stale_confidence(age))
                }
            } else if age <= self.max_gap {
                // Trailing fill before the next reading arrives.
                let confidence = 1.0 - 0.5 * (age.as_secs_f64() / self.max_gap.as_secs_f64());
                (prev.value, SampleValidity::Interpolated, confidence)
            } else {
                (prev.value, SampleValidity::Stale, self.stale_confidence(age))
            };

            out.push(NormalizedSample {
                source_id: source_id.to_owned(),
                timestamp: tick,
                kind,
                value,
                validity,
                confidence,
                flag: prev.flag,
            });

            tick += tick_delta;
        }
    }

    fn stale_confidence(&self, age: Duration) -> f64 {
        let decay = self.stale_decay.as_secs_f64().max(1.0);
        (-age.as_secs_f64() / decay).exp().max(MIN_STALE_CONFIDENCE)
    }
}

fn retain_monotonic(series: &mut Vec<&Reading>) {
    let mut last: Option<DateTime<Utc>> = None;
    series.retain(|reading| {
        let keep = last.map(|ts| reading.timestamp >= ts).unwrap_or(true);
        if keep {
            last = Some(reading.timestamp);
        }
        keep
    });
}
