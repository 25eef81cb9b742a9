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

use statrs::distribution::{ContinuousCDF, Normal};
use tracing::debug;

use crate::series::SampleSeries;
use crate::window::{DerivationTag, ForecastBucket, ForecastWindow};
use crate::{Forecaster, Result};
use mg_ems_common::config::ForecastConfig;
use mg_ems_common::time::to_delta;
use mg_ems_estimator::SystemState;

/// Relative dispersion assumed when persisting the last known value.
const RELATIVE_SIGMA: f64 = 0.10;
const SIGMA_FLOOR_KW: f64 = 0.05;

/// Persistence fallback: hold the last known value flat across the horizon.
///
/// Recovers [`crate::ForecastError::InsufficientHistory`] and cold starts;
/// it never fails, so the control loop always has a window to dispatch
/// against.
#[derive(Debug, Clone)]
pub struct NaivePersistenceForecaster {
    band_widening: f64,
    z_score: f64,
}

impl NaivePersistenceForecaster {
    pub fn new(cfg: &ForecastConfig) -> Self {
        let normal = Normal::new(0.0, 1.0).expect("unit normal is well-formed");
        Self {
            band_widening: cfg.band_widening,
            z_score: normal.inverse_cdf(0.5 + cfg.confidence_level / 2.0),
        }
    }

    /// Total version of [`Forecaster::forecast`]: persistence cannot fail.
    pub fn window(
        &self,
        series: &SampleSeries,
        state: &SystemState,
        horizon: Duration,
        bucket: Duration,
    ) -> ForecastWindow {
        let last = series.last().map(|p| p.value.max(0.0)).unwrap_or(0.0);
        let sigma = (RELATIVE_SIGMA * last).max(SIGMA_FLOOR_KW);
        let bucket_delta = to_delta(bucket);
        let count = (horizon.as_secs() / bucket.as_secs()).max(1) as usize;

        let buckets = (0..count)
            .map(|index| {
                let band = self.z_score * sigma * (1.0 + self.band_widening * index as f64);
                ForecastBucket {
                    start: state.timestamp + bucket_delta * index as i32,
                    point_kw: last,
                    lower_kw: (last - band).max(0.0),
                    upper_kw: last + band,
                }
            })
            .collect();

        debug!(kind = %series.kind, last_kw = last, "naive persistence forecast");

        ForecastWindow {
            kind: series.kind,
            bucket,
            buckets,
            naive: true,
            derived_from: DerivationTag {
                state_timestamp: state.timestamp,
                window_start: series.first_timestamp(),
                window_end: series.last_timestamp(),
                sample_count: series.len(),
                strategy: self.name().to_owned(),
            },
        }
    }
}

impl Forecaster for NaivePersistenceForecaster {
    fn forecast(
        &self,
        series: &SampleSeries,
        state: &SystemState,
        horizon: Duration,
        bucket: Duration,
    ) -> Result<ForecastWindow> {
        Ok(self.window(series, state, horizon, bucket))
    }

    fn name(&self) -> &'static str {
        "naive-persistence"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::series::SeriesPoint;
    use chrono::{TimeZone, Utc};
    use indexmap::IndexMap;
    use mg_ems_telemetry::QuantityKind;

    fn empty_state() -> SystemState {
        SystemState {
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
            soc: IndexMap::new(),
            soc_confidence: IndexMap::new(),
            available_kw: IndexMap::new(),
            last_integrated_cycle: None,
            last_applied: None,
            missing_sources: Vec::new(),
        }
    }

    #[test]
    fn holds_last_value_flat_with_widening_band() {
        let state = empty_state();
        let series = SampleSeries {
            kind: QuantityKind::Load,
            points: vec![SeriesPoint {
                timestamp: state.timestamp,
                value: 5.0,
                confidence: 1.0,
            }],
        };
        let forecaster = NaivePersistenceForecaster::new(&ForecastConfig::default());
        let window = forecaster
            .forecast(
                &series,
                &state,
                Duration::from_secs(3600),
                Duration::from_secs(900),
            )
            .unwrap();
        assert!(window.naive);
        assert_eq!(window.len(), 4);
        assert!(window.buckets.iter().all(|b| b.point_kw == 5.0));
        for pair in window.buckets.windows(2) {
            assert!(pair[1].band_width() > pair[0].band_width());
        }
    }

    #[test]
    fn empty_series_forecasts_zero_without_failing() {
        let state = empty_state();
        let series = SampleSeries {
            kind: QuantityKind::Generation,
            points: Vec::new(),
        };
        let forecaster = NaivePersistenceForecaster::new(&ForecastConfig::default());
        let window = forecaster
            .forecast(
                &series,
                &state,
                Duration::from_secs(3600),
                Duration::from_secs(900),
            )
            .unwrap();
        assert!(window.buckets.iter().all(|b| b.point_kw == 0.0));
    }
}
