//! ---
//! ems_section: "15-testing-qa-runbook"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Property and scenario suites for forecasting."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Forecast reproducibility across the full normalize-aggregate-forecast
//! pipeline: identical (history, state) inputs yield byte-identical
//! windows.

use std::time::Duration;

use chrono::{TimeZone, Utc};
use indexmap::IndexMap;

use mg_ems_common::config::{ForecastConfig, TelemetryConfig};
use mg_ems_estimator::SystemState;
use mg_ems_forecast::{
    Forecaster, NaivePersistenceForecaster, SampleSeries, SeasonalTrendForecaster,
};
use mg_ems_telemetry::{Normalizer, QuantityKind, Reading};

fn state_at(ts: chrono::DateTime<Utc>) -> SystemState {
    let mut available_kw = IndexMap::new();
    available_kw.insert("solar".to_owned(), 8.0);
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

fn history() -> Vec<Reading> {
    let end = Utc.with_ymd_and_hms(2024, 3, 4, 9, 0, 0).unwrap();
    (0..48 * 60)
        .map(|i| {
            let ts = end - chrono::TimeDelta::minutes(48 * 60 - 1 - i);
            let hour = (i as f64 / 60.0) % 24.0;
            Reading::load(
                "feeder",
                ts,
                5.0 + 2.0 * (std::f64::consts::PI * hour / 12.0).sin(),
            )
        })
        .collect()
}

#[test]
fn pipeline_output_is_byte_identical_across_runs() {
    let as_of = Utc.with_ymd_and_hms(2024, 3, 4, 9, 0, 0).unwrap();
    let readings = history();
    let telemetry_cfg = TelemetryConfig::default();
    let forecast_cfg = ForecastConfig::default();

    let run = || {
        let normalizer = Normalizer::from_config(&telemetry_cfg);
        let batch = normalizer.normalize(&readings, as_of);
        let series = SampleSeries::aggregate(&batch, QuantityKind::Load);
        let forecaster = SeasonalTrendForecaster::load(&forecast_cfg);
        let window = forecaster
            .forecast(
                &series,
                &state_at(as_of),
                Duration::from_secs(4 * 3600),
                Duration::from_secs(900),
            )
            .unwrap();
        serde_json::to_vec(&window).unwrap()
    };

    assert_eq!(run(), run());
}

#[test]
fn naive_fallback_is_byte_identical_across_runs() {
    let as_of = Utc.with_ymd_and_hms(2024, 3, 4, 9, 0, 0).unwrap();
    let series = SampleSeries {
        kind: QuantityKind::Load,
        points: vec![mg_ems_forecast::SeriesPoint {
            timestamp: as_of,
            value: 4.2,
            confidence: 0.7,
        }],
    };
    let forecaster = NaivePersistenceForecaster::new(&ForecastConfig::default());
    let run = || {
        let window = forecaster
            .forecast(
                &series,
                &state_at(as_of),
                Duration::from_secs(3600),
                Duration::from_secs(900),
            )
            .unwrap();
        serde_json::to_vec(&window).unwrap()
    };
    assert_eq!(run(), run());
}

#[test]
fn generation_window_respects_capacity_under_identical_inputs() {
    let as_of = Utc.with_ymd_and_hms(2024, 3, 4, 12, 0, 0).unwrap();
    let readings: Vec<Reading> = (0..48 * 60)
        .map(|i| {
            let ts = as_of - chrono::TimeDelta::minutes(48 * 60 - 1 - i);
            let hour = (ts.timestamp() / 60 % (24 * 60)) as f64 / 60.0;
            let output = if (6.0..=18.0).contains(&hour) {
                8.0 * (std::f64::consts::PI * (hour - 6.0) / 12.0).sin()
            } else {
                0.0
            };
            Reading::generation("solar", ts, output)
        })
        .collect();
    let normalizer = Normalizer::from_config(&TelemetryConfig::default());
    let batch = normalizer.normalize(&readings, as_of);
    let series = SampleSeries::aggregate(&batch, QuantityKind::Generation);
    let forecaster =
        SeasonalTrendForecaster::generation(&ForecastConfig::default(), vec!["solar".to_owned()]);
    let window = forecaster
        .forecast(
            &series,
            &state_at(as_of),
            Duration::from_secs(4 * 3600),
            Duration::from_secs(900),
        )
        .unwrap();
    assert!(window.buckets.iter().all(|b| b.point_kw <= 8.0 + 1e-9));
}
