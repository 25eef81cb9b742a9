//! ---
//! ems_section: "08-energy-models-optimization"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Dispatch optimization and fallback planning."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use mg_ems_common::config::{AppConfig, SourceKind};
use mg_ems_common::time::duration_hours;
use mg_ems_estimator::SystemState;

/// Storage limits and the SOC the horizon starts from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatterySpec {
    pub capacity_kwh: f64,
    pub min_soc: f64,
    pub max_soc: f64,
    pub round_trip_efficiency: f64,
    pub max_charge_kw: f64,
    /// Estimated SOC at the start of the horizon.
    pub soc: f64,
}

/// Per-source feasibility data for one solve.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceSpec {
    pub kind: SourceKind,
    /// Capacity after fault/derate reductions, kW.
    pub available_kw: f64,
    /// Maximum allocation change between consecutive buckets, kW.
    pub ramp_kw: f64,
    pub cost_per_kwh: f64,
    /// Allocation being applied when the solve starts; anchors the first
    /// bucket's ramp window.
    pub previous_allocation_kw: f64,
    pub battery: Option<BatterySpec>,
}

/// Read-only constraint snapshot handed to the optimizer each cycle.
///
/// Built once per cycle from the configuration snapshot and the current
/// [`SystemState`]; never re-read mid-cycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatchConstraints {
    pub bucket: Duration,
    pub renewable_credit_per_kwh: f64,
    pub sources: IndexMap<String, SourceSpec>,
}

impl DispatchConstraints {
    pub fn build(config: &AppConfig, state: &SystemState) -> Self {
        let mut sources = IndexMap::new();
        for (source_id, source) in &config.sources {
            let available_kw = state
                .available_of(source_id)
                .unwrap_or(source.capacity_kw)
                .max(0.0);
            let previous_allocation_kw = state
                .last_applied
                .as_ref()
                .and_then(|step| step.allocation_kw.get(source_id).copied())
                .unwrap_or(0.0);
            let battery = source.battery.as_ref().map(|battery| BatterySpec {
                capacity_kwh: battery.capacity_kwh,
                min_soc: battery.min_soc,
                max_soc: battery.max_soc,
                round_trip_efficiency: battery.round_trip_efficiency,
                max_charge_kw: battery.max_charge_kw,
                soc: state
                    .soc_of(source_id)
                    .unwrap_or(battery.initial_soc)
                    .clamp(0.0, 1.0),
            });
            sources.insert(
                source_id.clone(),
                SourceSpec {
                    kind: source.kind,
                    available_kw,
                    ramp_kw: source.ramp_kw_per_bucket,
                    cost_per_kwh: source.cost_per_kwh,
                    previous_allocation_kw,
                    battery,
                },
            );
        }
        Self {
            bucket: config.engine.bucket,
            renewable_credit_per_kwh: config.cost.renewable_credit_per_kwh,
            sources,
        }
    }

    pub fn bucket_hours(&self) -> f64 {
        duration_hours(self.bucket)
    }

    /// Marginal cost of dispatching a source, with the renewable credit
    /// netted off.
    pub fn effective_cost(&self, spec: &SourceSpec) -> f64 {
        match spec.kind {
            SourceKind::Renewable => spec.cost_per_kwh - self.renewable_credit_per_kwh,
            _ => spec.cost_per_kwh,
        }
    }
}

/// Largest sustained rate (in kW) a battery may run at this bucket such
/// that the mandatory ramp-down tail still fits in the remaining energy.
///
/// `energy_units` is the usable energy expressed as kW sustained for one
/// bucket. Without this cap a flat-out battery can reach its SOC bound
/// faster than the ramp limit allows it to back off, leaving no feasible
/// allocation for the following bucket.
fn sustainable_rate(energy_units: f64, ramp_kw: f64) -> f64 {
    if energy_units <= 0.0 {
        return 0.0;
    }
    if ramp_kw <= 0.0 {
        return energy_units;
    }
    // Largest q with ramp * q * (q + 1) / 2 <= energy.
    let q = (((1.0 + 8.0 * energy_units / ramp_kw).sqrt() - 1.0) / 2.0)
        .floor()
        .max(0.0);
    (energy_units + ramp_kw * q * (q + 1.0) / 2.0) / (q + 1.0)
}

/// Feasible allocation interval for one source in one bucket, given the
/// previous allocation, the current SOC trajectory value, and an optional
/// cap from the generation forecast.
///
/// Capacity and SOC energy limits always bound the interval; the ramp
/// window narrows it further. An externally commanded previous allocation
/// that was never sustainable can still empty the interval, in which case
/// the SOC bound wins: energy that is not there cannot be moved.
pub fn feasible_window(
    spec: &SourceSpec,
    previous_kw: f64,
    soc: f64,
    bucket_hours: f64,
    forecast_cap_kw: Option<f64>,
) -> (f64, f64) {
    let ramp_lo = previous_kw - spec.ramp_kw;
    let ramp_hi = previous_kw + spec.ramp_kw;

    match (&spec.battery, spec.kind) {
        (Some(battery), _) => {
            let discharge_units = (soc - battery.min_soc).max(0.0) * battery.capacity_kwh
                / bucket_hours;
            let discharge_limit = sustainable_rate(discharge_units, spec.ramp_kw)
                .min(spec.available_kw);
            let charge_units = (battery.max_soc - soc).max(0.0) * battery.capacity_kwh
                / (bucket_hours * battery.round_trip_efficiency);
            let charge_limit = sustainable_rate(charge_units, spec.ramp_kw)
                .min(battery.max_charge_kw);
            let hi = ramp_hi.min(discharge_limit);
            let lo = ramp_lo.max(-charge_limit).min(hi);
            (lo, hi.max(lo))
        }
        (None, SourceKind::Renewable) => {
            let cap = forecast_cap_kw
                .map(|f| f.min(spec.available_kw))
                .unwrap_or(spec.available_kw)
                .max(0.0);
            let lo = ramp_lo.clamp(0.0, spec.available_kw);
            // The ramp-down floor dominates the generation estimate.
            let hi = ramp_hi.min(cap).max(lo);
            (lo, hi)
        }
        (None, _) => {
            let lo = ramp_lo.clamp(0.0, spec.available_kw);
            let hi = ramp_hi.clamp(0.0, spec.available_kw).max(lo);
            (lo, hi)
        }
    }
}

/// Advance a battery SOC by one bucket of the given allocation.
pub fn advance_soc(battery: &BatterySpec, soc: f64, allocation_kw: f64, bucket_hours: f64) -> f64 {
    let delta = if allocation_kw >= 0.0 {
        -(allocation_kw * bucket_hours) / battery.capacity_kwh
    } else {
        (-allocation_kw * bucket_hours * battery.round_trip_efficiency) / battery.capacity_kwh
    };
    (soc + delta).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn battery_spec(soc: f64) -> SourceSpec {
        SourceSpec {
            kind: SourceKind::Battery,
            available_kw: 5.0,
            ramp_kw: 2.5,
            cost_per_kwh: 0.05,
            previous_allocation_kw: 0.0,
            battery: Some(BatterySpec {
                capacity_kwh: 10.0,
                min_soc: 0.1,
                max_soc: 0.95,
                round_trip_efficiency: 0.9,
                max_charge_kw: 4.0,
                soc,
            }),
        }
    }

    #[test]
    fn battery_window_respects_ramp_and_soc() {
        let spec = battery_spec(0.5);
        let (lo, hi) = feasible_window(&spec, 0.0, 0.5, 0.25, None);
        assert_eq!(hi, 2.5);
        assert_eq!(lo, -2.5);
    }

    #[test]
    fn empty_battery_cannot_discharge() {
        let spec = battery_spec(0.1);
        let (lo, hi) = feasible_window(&spec, 5.0, 0.1, 0.25, None);
        assert_eq!(hi, 0.0);
        assert!(lo <= hi);
    }

    #[test]
    fn full_battery_cannot_charge() {
        let spec = battery_spec(0.95);
        let (lo, _hi) = feasible_window(&spec, 0.0, 0.95, 0.25, None);
        assert_eq!(lo, 0.0);
    }

    #[test]
    fn sustainable_rate_tail_fits_exactly() {
        // 2 kW·buckets of energy with a 1 kW ramp: 1.5 now + 0.5 next.
        let rate = sustainable_rate(2.0, 1.0);
        assert!((rate - 1.5).abs() < 1e-9);
        assert_eq!(sustainable_rate(0.0, 1.0), 0.0);
        // Plenty of energy: the rate is far above any real nameplate.
        assert!(sustainable_rate(1000.0, 2.5) > 50.0);
    }

    #[test]
    fn discharge_near_floor_leaves_a_ramp_path() {
        let spec = battery_spec(0.15);
        // 0.05 SOC of a 10 kWh pack over 15 min = 2 kW·buckets.
        let (_, hi) = feasible_window(&spec, 0.0, 0.15, 0.25, None);
        let remaining = 2.0 - hi;
        let (_, hi_next) = feasible_window(&spec, hi, 0.15 - hi * 0.25 / 10.0, 0.25, None);
        assert!(hi - hi_next <= spec.ramp_kw + 1e-9);
        assert!(hi_next <= remaining + 1e-9);
    }

    #[test]
    fn renewable_window_caps_at_forecast() {
        let spec = SourceSpec {
            kind: SourceKind::Renewable,
            available_kw: 8.0,
            ramp_kw: 8.0,
            cost_per_kwh: 0.0,
            previous_allocation_kw: 0.0,
            battery: None,
        };
        let (lo, hi) = feasible_window(&spec, 0.0, 0.0, 0.25, Some(3.0));
        assert_eq!(lo, 0.0);
        assert_eq!(hi, 3.0);
    }
}
