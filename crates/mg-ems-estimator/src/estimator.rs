//! ---
//! ems_section: "04-state-estimation"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "System state estimation and snapshot management."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::time::Duration;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use tracing::{debug, trace};

use crate::state::{AppliedStep, SystemState};
use mg_ems_common::config::{AppConfig, SourceConfig};
use mg_ems_common::time::{duration_hours, to_delta};
use mg_ems_telemetry::{NormalizedBatch, QuantityKind, SourceFlag};

/// Confidence multiplier applied when a battery has no SOC telemetry at all
/// this cycle.
const HELD_CONFIDENCE_FACTOR: f64 = 0.5;

/// Produces one immutable [`SystemState`] snapshot per control cycle.
#[derive(Debug, Clone)]
pub struct StateEstimator {
    correction_gain: f64,
    derate_window: Duration,
    sources: IndexMap<String, SourceConfig>,
}

impl StateEstimator {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            correction_gain: config.estimator.correction_gain,
            derate_window: config.estimator.derate_window,
            sources: config.sources.clone(),
        }
    }

    /// Fuse normalized telemetry with the previously applied dispatch step.
    ///
    /// Battery SOC is propagated from the commanded allocation and elapsed
    /// time, then corrected toward the latest direct SOC reading with a
    /// bounded single-pole gain. Each applied step is integrated at most
    /// once (keyed by cycle id), so re-applying an identical plan step does
    /// not double-count energy.
    pub fn estimate(
        &self,
        batch: &NormalizedBatch,
        previous_step: Option<&AppliedStep>,
        previous: &SystemState,
        as_of: DateTime<Utc>,
    ) -> SystemState {
        let mut soc = previous.soc.clone();
        let mut soc_confidence = previous.soc_confidence.clone();
        let mut last_integrated_cycle = previous.last_integrated_cycle;

        if let Some(step) = previous_step {
            if last_integrated_cycle == Some(step.cycle_id) {
                trace!(cycle_id = step.cycle_id, "plan step already integrated; skipping");
            } else {
                let elapsed = (as_of - previous.timestamp).to_std().unwrap_or(Duration::ZERO);
                self.propagate(&mut soc, step, elapsed);
                last_integrated_cycle = Some(step.cycle_id);
            }
        }

        self.correct(&mut soc, &mut soc_confidence, batch);

        let available_kw = self.derated_capacity(batch, as_of);
        let missing_sources: Vec<String> = batch
            .missing
            .iter()
            .map(|err| err.source_id.clone())
            .collect();
        if !missing_sources.is_empty() {
            debug!(missing = ?missing_sources, "estimating with missing sources");
        }

        SystemState {
            timestamp: as_of,
            soc,
            soc_confidence,
            available_kw,
            last_integrated_cycle,
            last_applied: previous.last_applied.clone(),
            missing_sources,
        }
    }

    /// Charge/discharge integration of the commanded allocation.
    fn propagate(&self, soc: &mut IndexMap<String, f64>, step: &AppliedStep, elapsed: Duration) {
        let hours = duration_hours(elapsed);
        if hours <= 0.0 {
            return;
        }
        for (source_id, source) in &self.sources {
            let Some(battery) = &source.battery else {
                continue;
            };
            let Some(allocation) = step.allocation_kw.get(source_id).copied() else {
                continue;
            };
            let current = soc.get(source_id).copied().unwrap_or(battery.initial_soc);
            let delta = if allocation >= 0.0 {
                // Discharge: energy leaves the pack at face value.
                -(allocation * hours) / battery.capacity_kwh
            } else {
                // Charge: round-trip losses are booked on the way in.
                (-allocation * hours * battery.round_trip_efficiency) / battery.capacity_kwh
            };
            let updated = (current + delta).clamp(0.0, 1.0);
            soc.insert(source_id.clone(), updated);
        }
    }

    /// Single-pole correction toward the latest direct SOC reading, scaled
    /// by the reading's confidence so stale telemetry pulls only weakly.
    fn correct(
        &self,
        soc: &mut IndexMap<String, f64>,
        soc_confidence: &mut IndexMap<String, f64>,
        batch: &NormalizedBatch,
    ) {
        for (source_id, source) in &self.sources {
            if source.battery.is_none() {
                continue;
            }
            match batch.latest(source_id, QuantityKind::Soc) {
                Some(sample) => {
                    let predicted = soc.get(source_id).copied().unwrap_or(sample.value);
                    let gain = self.correction_gain * sample.confidence;
                    let corrected =
                        (predicted + gain * (sample.value - predicted)).clamp(0.0, 1.0);
                    soc.insert(source_id.clone(), corrected);
                    soc_confidence.insert(source_id.clone(), sample.confidence);
                }
                None => {
                    let held = soc_confidence
                        .get(source_id)
                        .copied()
                        .unwrap_or(1.0)
                        * HELD_CONFIDENCE_FACTOR;
                    soc_confidence.insert(source_id.clone(), held);
                }
            }
        }
    }

    /// Nameplate capacity reduced by fault/derate flags seen recently.
    fn derated_capacity(
        &self,
        batch: &NormalizedBatch,
        as_of: DateTime<Utc>,
    ) -> IndexMap<String, f64> {
        let window_start = as_of - to_delta(self.derate_window);
        let mut available = IndexMap::new();
        for (source_id, source) in &self.sources {
            let mut factor: f64 = 1.0;
            for sample in batch
                .samples
                .iter()
                .filter(|s| s.source_id == *source_id && s.timestamp >= window_start)
            {
                match sample.flag {
                    Some(SourceFlag::Fault) => factor = 0.0,
                    Some(SourceFlag::Derate(fraction)) => {
                        factor = factor.min(fraction.clamp(0.0, 1.0));
                    }
                    None => {}
                }
            }
            let capacity = (source.capacity_kw * factor).max(0.0);
            if factor < 1.0 {
                debug!(source = %source_id, capacity_kw = capacity, "source capacity derated");
            }
            available.insert(source_id.clone(), capacity);
        }
        available
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use mg_ems_common::config::{BatteryConfig, SourceKind};
    use mg_ems_telemetry::{NormalizedSample, SampleValidity};

    fn config() -> AppConfig {
        let mut config = AppConfig::default();
        config.sources.insert(
            "grid".into(),
            SourceConfig {
                kind: SourceKind::Grid,
                capacity_kw: 50.0,
                ramp_kw_per_bucket: 50.0,
                cost_per_kwh: 0.30,
                battery: None,
            },
        );
        config.sources.insert(
            "battery".into(),
            SourceConfig {
                kind: SourceKind::Battery,
                capacity_kw: 5.0,
                ramp_kw_per_bucket: 2.5,
                cost_per_kwh: 0.05,
                battery: Some(BatteryConfig {
                    capacity_kwh: 10.0,
                    min_soc: 0.1,
                    max_soc: 0.95,
                    round_trip_efficiency: 0.9,
                    initial_soc: 0.5,
                    max_charge_kw: 4.0,
                }),
            },
        );
        config
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn step(cycle_id: u64, battery_kw: f64) -> AppliedStep {
        let mut allocation_kw = IndexMap::new();
        allocation_kw.insert("battery".to_owned(), battery_kw);
        AppliedStep {
            cycle_id,
            applied_at: t0(),
            allocation_kw,
        }
    }

    fn soc_sample(value: f64, confidence: f64, ts: DateTime<Utc>) -> NormalizedSample {
        NormalizedSample {
            source_id: "battery".into(),
            timestamp: ts,
            kind: QuantityKind::Soc,
            value,
            validity: SampleValidity::Measured,
            confidence,
            flag: None,
        }
    }

    #[test]
    fn discharge_integrates_commanded_power() {
        let config = config();
        let estimator = StateEstimator::from_config(&config);
        let previous = SystemState::initial(&config, t0());
        let next = estimator.estimate(
            &NormalizedBatch::default(),
            Some(&step(1, 5.0)),
            &previous,
            t0() + chrono::TimeDelta::minutes(15),
        );
        // 5 kW over 15 min = 1.25 kWh out of a 10 kWh pack.
        assert!((next.soc_of("battery").unwrap() - 0.375).abs() < 1e-9);
    }

    #[test]
    fn charge_books_round_trip_losses() {
        let config = config();
        let estimator = StateEstimator::from_config(&config);
        let previous = SystemState::initial(&config, t0());
        let next = estimator.estimate(
            &NormalizedBatch::default(),
            Some(&step(1, -4.0)),
            &previous,
            t0() + chrono::TimeDelta::minutes(30),
        );
        // 4 kW charge for 30 min at 0.9 efficiency stores 1.8 kWh.
        assert!((next.soc_of("battery").unwrap() - 0.68).abs() < 1e-9);
    }

    #[test]
    fn identical_step_is_not_double_counted() {
        let config = config();
        let estimator = StateEstimator::from_config(&config);
        let initial = SystemState::initial(&config, t0());
        let applied = step(7, 5.0);
        let first = estimator.estimate(
            &NormalizedBatch::default(),
            Some(&applied),
            &initial,
            t0() + chrono::TimeDelta::minutes(15),
        );
        let second = estimator.estimate(
            &NormalizedBatch::default(),
            Some(&applied),
            &first,
            t0() + chrono::TimeDelta::minutes(30),
        );
        assert_eq!(first.soc_of("battery"), second.soc_of("battery"));
    }

    #[test]
    fn correction_pulls_toward_reading_with_bounded_gain() {
        let config = config();
        let estimator = StateEstimator::from_config(&config);
        let previous = SystemState::initial(&config, t0());
        let mut batch = NormalizedBatch::default();
        batch.samples.push(soc_sample(0.7, 1.0, t0()));
        let next = estimator.estimate(&batch, None, &previous, t0());
        // gain 0.25: 0.5 + 0.25 * (0.7 - 0.5)
        assert!((next.soc_of("battery").unwrap() - 0.55).abs() < 1e-9);
        assert_eq!(next.soc_confidence.get("battery"), Some(&1.0));
    }

    #[test]
    fn low_confidence_reading_pulls_weakly() {
        let config = config();
        let estimator = StateEstimator::from_config(&config);
        let previous = SystemState::initial(&config, t0());
        let mut batch = NormalizedBatch::default();
        batch.samples.push(soc_sample(0.9, 0.1, t0()));
        let next = estimator.estimate(&batch, None, &previous, t0());
        assert!((next.soc_of("battery").unwrap() - 0.51).abs() < 1e-9);
    }

    #[test]
    fn soc_is_clamped_to_unit_interval() {
        let config = config();
        let estimator = StateEstimator::from_config(&config);
        let previous = SystemState::initial(&config, t0());
        let next = estimator.estimate(
            &NormalizedBatch::default(),
            Some(&step(1, 80.0)),
            &previous,
            t0() + chrono::TimeDelta::hours(4),
        );
        assert_eq!(next.soc_of("battery"), Some(0.0));
    }

    #[test]
    fn fault_flag_zeroes_available_capacity() {
        let config = config();
        let estimator = StateEstimator::from_config(&config);
        let previous = SystemState::initial(&config, t0());
        let mut batch = NormalizedBatch::default();
        batch.samples.push(NormalizedSample {
            source_id: "grid".into(),
            timestamp: t0(),
            kind: QuantityKind::Load,
            value: 5.0,
            validity: SampleValidity::Measured,
            confidence: 1.0,
            flag: Some(SourceFlag::Fault),
        });
        let next = estimator.estimate(&batch, None, &previous, t0());
        assert_eq!(next.available_of("grid"), Some(0.0));
        assert_eq!(next.available_of("battery"), Some(5.0));
    }

    #[test]
    fn missing_telemetry_decays_held_confidence() {
        let config = config();
        let estimator = StateEstimator::from_config(&config);
        let previous = SystemState::initial(&config, t0());
        let next = estimator.estimate(&NormalizedBatch::default(), None, &previous, t0());
        assert_eq!(next.soc_confidence.get("battery"), Some(&0.5));
        let after = estimator.estimate(&NormalizedBatch::default(), None, &next, t0());
        assert_eq!(after.soc_confidence.get("battery"), Some(&0.25));
    }
}
