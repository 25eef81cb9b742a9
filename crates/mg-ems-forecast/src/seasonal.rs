//! ---
//! ems_section: "05-forecasting"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Short-horizon demand and generation forecasting."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::f64::consts::PI;
use std::time::Duration;

use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use statrs::distribution::{ContinuousCDF, Normal};
use tracing::trace;

use crate::series::SampleSeries;
use crate::window::{DerivationTag, ForecastBucket, ForecastWindow};
use crate::{ForecastError, Forecaster, Result};
use mg_ems_common::config::ForecastConfig;
use mg_ems_common::time::to_delta;
use mg_ems_estimator::SystemState;
use mg_ems_telemetry::QuantityKind;

/// Absolute floor for the residual dispersion so the band never collapses
/// to zero width on perfectly repetitive history.
const SIGMA_FLOOR_KW: f64 = 0.05;

/// Hour-of-day seasonal means blended with short-term trend extrapolation.
///
/// History is keyed by (hour, weekend) the way the original demand model
/// engineered its calendar features. Generation windows are additionally
/// clamped to the renewable capacity under a clear-sky envelope, which
/// zeroes solar forecasts at night.
#[derive(Debug, Clone)]
pub struct SeasonalTrendForecaster {
    cfg: ForecastConfig,
    z_score: f64,
    /// Renewable source ids whose available capacity caps generation
    /// forecasts. Empty for load forecasting.
    renewable_sources: Vec<String>,
}

impl SeasonalTrendForecaster {
    pub fn load(cfg: &ForecastConfig) -> Self {
        Self::new(cfg, Vec::new())
    }

    pub fn generation(cfg: &ForecastConfig, renewable_sources: Vec<String>) -> Self {
        Self::new(cfg, renewable_sources)
    }

    fn new(cfg: &ForecastConfig, renewable_sources: Vec<String>) -> Self {
        let normal = Normal::new(0.0, 1.0).expect("unit normal is well-formed");
        let z_score = normal.inverse_cdf(0.5 + cfg.confidence_level / 2.0);
        Self {
            cfg: cfg.clone(),
            z_score,
            renewable_sources,
        }
    }

    fn seasonal_table(&self, series: &SampleSeries) -> SeasonalTable {
        let mut table = SeasonalTable::default();
        for point in &series.points {
            let slot = slot_of(point.timestamp);
            table.sum[slot] += point.confidence * point.value;
            table.weight[slot] += point.confidence;
            table.total_sum += point.confidence * point.value;
            table.total_weight += point.confidence;
        }
        table
    }

    fn residual_sigma(&self, series: &SampleSeries, table: &SeasonalTable) -> f64 {
        let mut weighted_sq = 0.0;
        let mut weight = 0.0;
        for point in &series.points {
            let expected = table.mean_for(slot_of(point.timestamp));
            let residual = point.value - expected;
            weighted_sq += point.confidence * residual * residual;
            weight += point.confidence;
        }
        if weight <= 0.0 {
            return SIGMA_FLOOR_KW;
        }
        (weighted_sq / weight).sqrt().max(SIGMA_FLOOR_KW)
    }

    /// Least-squares slope in kW per minute over the trailing trend window.
    fn trend_slope(&self, series: &SampleSeries) -> f64 {
        let Some(end) = series.last_timestamp() else {
            return 0.0;
        };
        let window_start = end - to_delta(self.cfg.trend_window);
        let recent: Vec<_> = series
            .points
            .iter()
            .filter(|p| p.timestamp >= window_start)
            .collect();
        if recent.len() < 2 {
            return 0.0;
        }
        let n = recent.len() as f64;
        let minutes = |p: &crate::series::SeriesPoint| {
            (p.timestamp - window_start).num_seconds() as f64 / 60.0
        };
        let mean_x = recent.iter().map(|p| minutes(p)).sum::<f64>() / n;
        let mean_y = recent.iter().map(|p| p.value).sum::<f64>() / n;
        let mut cov = 0.0;
        let mut var = 0.0;
        for point in &recent {
            let dx = minutes(point) - mean_x;
            cov += dx * (point.value - mean_y);
            var += dx * dx;
        }
        if var <= 0.0 {
            0.0
        } else {
            cov / var
        }
    }

    fn renewable_cap(&self, state: &SystemState, at: DateTime<Utc>) -> Option<f64> {
        if self.renewable_sources.is_empty() {
            return None;
        }
        let available: f64 = self
            .renewable_sources
            .iter()
            .filter_map(|id| state.available_of(id))
            .sum();
        Some(available * clear_sky_fraction(at))
    }
}

impl Forecaster for SeasonalTrendForecaster {
    fn forecast(
        &self,
        series: &SampleSeries,
        state: &SystemState,
        horizon: Duration,
        bucket: Duration,
    ) -> Result<ForecastWindow> {
        let available = series.len();
        if available < self.cfg.min_samples {
            return Err(ForecastError::InsufficientHistory {
                available,
                required: self.cfg.min_samples,
            });
        }

        let table = self.seasonal_table(series);
        let sigma = self.residual_sigma(series, &table);
        let slope = self.trend_slope(series);
        let last = series.last().expect("non-empty after history check");
        let weight_sum = self.cfg.seasonal_weight + self.cfg.trend_weight;

        let bucket_delta = to_delta(bucket);
        let count = (horizon.as_secs() / bucket.as_secs()).max(1) as usize;
        let mut buckets = Vec::with_capacity(count);

        for index in 0..count {
            let start = state.timestamp + bucket_delta * index as i32;
            let midpoint = start + bucket_delta / 2;
            let seasonal = table.mean_for(slot_of(midpoint));
            let minutes_ahead = (midpoint - last.timestamp).num_seconds() as f64 / 60.0;
            let trend = last.value + slope * minutes_ahead;
            let mut point = (self.cfg.seasonal_weight * seasonal
                + self.cfg.trend_weight * trend)
                / weight_sum;
            point = point.max(0.0);

            if let Some(cap) = self.renewable_cap(state, midpoint) {
                point = point.min(cap);
            }

            let band = self.z_score * sigma * (1.0 + self.cfg.band_widening * index as f64);
            buckets.push(ForecastBucket {
                start,
                point_kw: point,
                lower_kw: (point - band).max(0.0),
                upper_kw: point + band,
            });
        }

        trace!(
            kind = %series.kind,
            samples = available,
            sigma,
            slope_kw_per_min = slope,
            "seasonal forecast produced"
        );

        Ok(ForecastWindow {
            kind: series.kind,
            bucket,
            buckets,
            naive: false,
            derived_from: DerivationTag {
                state_timestamp: state.timestamp,
                window_start: series.first_timestamp(),
                window_end: series.last_timestamp(),
                sample_count: available,
                strategy: self.name().to_owned(),
            },
        })
    }

    fn name(&self) -> &'static str {
        "seasonal-trend"
    }
}

/// 48 calendar slots: hour of day split by weekday/weekend.
#[derive(Debug)]
struct SeasonalTable {
    sum: [f64; 48],
    weight: [f64; 48],
    total_sum: f64,
    total_weight: f64,
}

impl Default for SeasonalTable {
    fn default() -> Self {
        Self {
            sum: [0.0; 48],
            weight: [0.0; 48],
            total_sum: 0.0,
            total_weight: 0.0,
        }
    }
}

impl SeasonalTable {
    fn mean_for(&self, slot: usize) -> f64 {
        if self.weight[slot] > 0.0 {
            self.sum[slot] / self.weight[slot]
        } else if self.total_weight > 0.0 {
            self.total_sum / self.total_weight
        } else {
            0.0
        }
    }
}

fn slot_of(timestamp: DateTime<Utc>) -> usize {
    let weekend = matches!(timestamp.weekday(), Weekday::Sat | Weekday::Sun);
    timestamp.hour() as usize + if weekend { 24 } else { 0 }
}

/// Fraction of nameplate a solar array can produce under clear sky at the
/// given time of day.
pub fn clear_sky_fraction(at: DateTime<Utc>) -> f64 {
    let hour = at.hour() as f64 + at.minute() as f64 / 60.0;
    if !(6.0..=18.0).contains(&hour) {
        return 0.0;
    }
    (PI * (hour - 6.0) / 12.0).sin().max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::series::SeriesPoint;
    use chrono::TimeZone;
    use indexmap::IndexMap;

    fn state_at(ts: DateTime<Utc>, solar_kw: f64) -> SystemState {
        let mut available_kw = IndexMap::new();
        available_kw.insert("solar".to_owned(), solar_kw);
        SystemState {
            timestamp: ts,
            soc: IndexMap::new(),
            soc_confidence: IndexMap::new(),
            available_kw,
            last_integrated_cycle: None,
            last_applied: None,
            missing_sources: Vec::new(),
        }
    }

    fn diurnal_series(kind: QuantityKind, end: DateTime<Utc>, hours: i64) -> SampleSeries {
        let points = (0..hours * 4)
            .map(|i| {
                let timestamp = end - chrono::TimeDelta::minutes(15 * (hours * 4 - 1 - i));
                let hour = timestamp.hour() as f64 + timestamp.minute() as f64 / 60.0;
                SeriesPoint {
                    timestamp,
                    value: 5.0 + 2.0 * (2.0 * PI * hour / 24.0).sin(),
                    confidence: 1.0,
                }
            })
            .collect();
        SampleSeries { kind, points }
    }

    fn horizon() -> Duration {
        Duration::from_secs(4 * 3600)
    }

    fn bucket() -> Duration {
        Duration::from_secs(900)
    }

    #[test]
    fn identical_inputs_yield_identical_windows() {
        let end = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let series = diurnal_series(QuantityKind::Load, end, 48);
        let state = state_at(end, 0.0);
        let forecaster = SeasonalTrendForecaster::load(&ForecastConfig::default());
        let first = forecaster
            .forecast(&series, &state, horizon(), bucket())
            .unwrap();
        let second = forecaster
            .forecast(&series, &state, horizon(), bucket())
            .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn sparse_history_is_rejected() {
        let end = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let series = diurnal_series(QuantityKind::Load, end, 2);
        let state = state_at(end, 0.0);
        let forecaster = SeasonalTrendForecaster::load(&ForecastConfig::default());
        let err = forecaster
            .forecast(&series, &state, horizon(), bucket())
            .unwrap_err();
        assert!(matches!(err, ForecastError::InsufficientHistory { available: 8, .. }));
    }

    #[test]
    fn uncertainty_band_widens_with_horizon() {
        let end = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let series = diurnal_series(QuantityKind::Load, end, 48);
        let state = state_at(end, 0.0);
        let forecaster = SeasonalTrendForecaster::load(&ForecastConfig::default());
        let window = forecaster
            .forecast(&series, &state, horizon(), bucket())
            .unwrap();
        for pair in window.buckets.windows(2) {
            assert!(pair[1].band_width() >= pair[0].band_width());
        }
    }

    #[test]
    fn generation_forecast_is_zero_at_night() {
        let end = Utc.with_ymd_and_hms(2024, 3, 1, 22, 0, 0).unwrap();
        let series = diurnal_series(QuantityKind::Generation, end, 48);
        let state = state_at(end, 8.0);
        let forecaster = SeasonalTrendForecaster::generation(
            &ForecastConfig::default(),
            vec!["solar".to_owned()],
        );
        let window = forecaster
            .forecast(&series, &state, horizon(), bucket())
            .unwrap();
        // 22:00 through 02:00 is entirely outside the clear-sky envelope.
        assert!(window.buckets.iter().all(|b| b.point_kw == 0.0));
    }

    #[test]
    fn points_are_never_negative() {
        let end = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let points = (0..96)
            .map(|i| SeriesPoint {
                timestamp: end - chrono::TimeDelta::minutes(15 * (95 - i)),
                value: 0.1,
                confidence: 1.0,
            })
            .collect();
        let series = SampleSeries {
            kind: QuantityKind::Load,
            points,
        };
        let state = state_at(end, 0.0);
        let forecaster = SeasonalTrendForecaster::load(&ForecastConfig::default());
        let window = forecaster
            .forecast(&series, &state, horizon(), bucket())
            .unwrap();
        assert!(window.buckets.iter().all(|b| b.point_kw >= 0.0 && b.lower_kw >= 0.0));
    }
}
