//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Primary control loop and lifecycle management."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};

use mg_ems_common::config::SourceKind;
use mg_ems_dispatch::{DispatchConstraints, DispatchPlan, FallbackKind};
use mg_ems_forecast::ForecastWindow;

/// Control loop stage identifiers, in execution order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CyclePhase {
    Idle,
    Collecting,
    Estimating,
    Forecasting,
    Optimizing,
    Applying,
}

impl CyclePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            CyclePhase::Idle => "idle",
            CyclePhase::Collecting => "collecting",
            CyclePhase::Estimating => "estimating",
            CyclePhase::Forecasting => "forecasting",
            CyclePhase::Optimizing => "optimizing",
            CyclePhase::Applying => "applying",
        }
    }
}

impl fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wall-clock spent inside one stage of a cycle.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageTiming {
    pub stage: CyclePhase,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub duration: Duration,
}

/// One recovered (or fatal) failure encountered during a cycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CycleFailure {
    pub stage: CyclePhase,
    pub error: String,
}

/// Balancing quality indicators recomputed for every plan.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct BalancingSummary {
    /// Uncovered demand as a fraction of forecast demand.
    pub load_imbalance_ratio: f64,
    /// Curtailed renewable energy as a fraction of forecast generation.
    pub generation_imbalance_ratio: f64,
    /// Battery throughput as a fraction of its maximum over the horizon.
    pub battery_utilization_ratio: f64,
}

impl BalancingSummary {
    pub fn from_plan(
        plan: &DispatchPlan,
        load: &ForecastWindow,
        generation: &ForecastWindow,
        constraints: &DispatchConstraints,
    ) -> Self {
        let demand_total: f64 = load.buckets.iter().map(|b| b.point_kw).sum();
        let shortfall_total: f64 = plan.steps.iter().map(|s| s.shortfall_kw).sum();
        let load_imbalance_ratio = if demand_total > 0.0 {
            (shortfall_total / demand_total).clamp(0.0, 1.0)
        } else {
            0.0
        };

        let renewable_ids: Vec<&String> = constraints
            .sources
            .iter()
            .filter(|(_, spec)| spec.kind == SourceKind::Renewable)
            .map(|(id, _)| id)
            .collect();
        let generation_total: f64 = generation.buckets.iter().map(|b| b.point_kw).sum();
        let dispatched_renewable: f64 = plan
            .steps
            .iter()
            .map(|step| {
                renewable_ids
                    .iter()
                    .map(|id| step.allocation_of(id))
                    .sum::<f64>()
            })
            .sum();
        let generation_imbalance_ratio = if generation_total > 0.0 {
            ((generation_total - dispatched_renewable) / generation_total).clamp(0.0, 1.0)
        } else {
            0.0
        };

        let battery_capacity: f64 = constraints
            .sources
            .values()
            .filter(|spec| spec.kind == SourceKind::Battery)
            .map(|spec| spec.available_kw)
            .sum();
        let battery_ids: Vec<&String> = constraints
            .sources
            .iter()
            .filter(|(_, spec)| spec.kind == SourceKind::Battery)
            .map(|(id, _)| id)
            .collect();
        let battery_throughput: f64 = plan
            .steps
            .iter()
            .map(|step| {
                battery_ids
                    .iter()
                    .map(|id| step.allocation_of(id).abs())
                    .sum::<f64>()
            })
            .sum();
        let battery_utilization_ratio = if battery_capacity > 0.0 && !plan.steps.is_empty() {
            (battery_throughput / (battery_capacity * plan.steps.len() as f64)).clamp(0.0, 1.0)
        } else {
            0.0
        };

        Self {
            load_imbalance_ratio,
            generation_imbalance_ratio,
            battery_utilization_ratio,
        }
    }
}

/// Structured per-cycle record emitted for the reporting layer.
///
/// Delivery is at-least-once; consumers deduplicate on `cycle_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CycleReport {
    pub cycle_id: u64,
    pub started_at: DateTime<Utc>,
    pub stage_timings: Vec<StageTiming>,
    pub failures: Vec<CycleFailure>,
    pub fallback: Option<FallbackKind>,
    /// True only when no plan, not even a fallback, could be constructed.
    pub fatal: bool,
    pub shortfall_buckets: usize,
    pub max_shortfall_kw: f64,
    pub expected_cost: f64,
    pub naive_forecast: bool,
    pub degraded_telemetry: bool,
    pub balancing: Option<BalancingSummary>,
}

impl CycleReport {
    pub fn failed(&self) -> bool {
        self.fatal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use indexmap::IndexMap;
    use mg_ems_dispatch::{PlanStep, SourceSpec};
    use mg_ems_forecast::{DerivationTag, ForecastBucket};
    use mg_ems_telemetry::QuantityKind;

    fn window(kind: QuantityKind, kw: f64) -> ForecastWindow {
        let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        ForecastWindow {
            kind,
            bucket: Duration::from_secs(900),
            buckets: vec![ForecastBucket {
                start: t0,
                point_kw: kw,
                lower_kw: kw,
                upper_kw: kw,
            }],
            naive: false,
            derived_from: DerivationTag {
                state_timestamp: t0,
                window_start: None,
                window_end: None,
                sample_count: 0,
                strategy: "test".into(),
            },
        }
    }

    #[test]
    fn balancing_ratios_reflect_plan_composition() {
        let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let mut sources = IndexMap::new();
        sources.insert(
            "battery".to_owned(),
            SourceSpec {
                kind: SourceKind::Battery,
                available_kw: 4.0,
                ramp_kw: 4.0,
                cost_per_kwh: 0.05,
                previous_allocation_kw: 0.0,
                battery: None,
            },
        );
        sources.insert(
            "solar".to_owned(),
            SourceSpec {
                kind: SourceKind::Renewable,
                available_kw: 8.0,
                ramp_kw: 8.0,
                cost_per_kwh: 0.0,
                previous_allocation_kw: 0.0,
                battery: None,
            },
        );
        let constraints = DispatchConstraints {
            bucket: Duration::from_secs(900),
            renewable_credit_per_kwh: 0.02,
            sources,
        };

        let mut allocation_kw = IndexMap::new();
        allocation_kw.insert("battery".to_owned(), 2.0);
        allocation_kw.insert("solar".to_owned(), 3.0);
        let plan = DispatchPlan {
            cycle_id: 1,
            produced_at: t0,
            bucket: Duration::from_secs(900),
            steps: vec![PlanStep {
                start: t0,
                allocation_kw,
                expected_cost: 0.0,
                shortfall_kw: 1.0,
                surplus_kw: 0.0,
            }],
            fallback: None,
        };

        let summary = BalancingSummary::from_plan(
            &plan,
            &window(QuantityKind::Load, 6.0),
            &window(QuantityKind::Generation, 6.0),
            &constraints,
        );
        assert!((summary.load_imbalance_ratio - 1.0 / 6.0).abs() < 1e-9);
        assert!((summary.generation_imbalance_ratio - 0.5).abs() < 1e-9);
        assert!((summary.battery_utilization_ratio - 0.5).abs() < 1e-9);
    }
}
