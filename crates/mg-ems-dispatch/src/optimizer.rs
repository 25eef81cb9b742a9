//! ---
//! ems_section: "08-energy-models-optimization"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Dispatch optimization and fallback planning."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::time::Instant;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use tracing::{debug, warn};

use crate::constraints::{advance_soc, feasible_window, DispatchConstraints, SourceSpec};
use crate::plan::{DispatchPlan, PlanStep};
use crate::{DispatchError, Result};
use mg_ems_common::config::SourceKind;
use mg_ems_estimator::SystemState;
use mg_ems_forecast::ForecastWindow;

/// Tolerance below which shortfall and surplus are treated as zero.
const BALANCE_EPSILON_KW: f64 = 1e-9;

/// Greedy merit-order solver over the discretized horizon.
///
/// Sources are dispatched cheapest-first per bucket; equal-cost ties prefer
/// renewable utilization first and battery cycling last. The demand
/// coverage constraint is the only one ever relaxed: when the feasible set
/// cannot cover demand the step carries an explicit shortfall while
/// capacity, ramp, and SOC bounds stay intact.
#[derive(Debug, Clone, Default)]
pub struct MeritOrderOptimizer;

impl MeritOrderOptimizer {
    pub fn new() -> Self {
        Self
    }

    /// Compute a plan for the horizon covered by the forecast pair.
    ///
    /// `deadline` bounds the solve; crossing it aborts with
    /// [`DispatchError::SolverTimeout`] so the control loop can fall back
    /// within its cycle budget.
    pub fn optimize(
        &self,
        state: &SystemState,
        load: &ForecastWindow,
        generation: &ForecastWindow,
        constraints: &DispatchConstraints,
        cycle_id: u64,
        deadline: Option<Instant>,
    ) -> Result<DispatchPlan> {
        if constraints.sources.is_empty() {
            return Err(DispatchError::Infeasible(
                "no dispatchable sources configured".to_owned(),
            ));
        }
        for (source_id, spec) in &constraints.sources {
            if let Some(battery) = &spec.battery {
                if battery.min_soc >= battery.max_soc {
                    return Err(DispatchError::Infeasible(format!(
                        "battery '{}' has contradictory SOC bounds",
                        source_id
                    )));
                }
            }
        }

        let bucket_hours = constraints.bucket_hours();
        let merit_order = merit_order(constraints);
        let renewable_capacity: f64 = constraints
            .sources
            .values()
            .filter(|spec| spec.kind == SourceKind::Renewable)
            .map(|spec| spec.available_kw)
            .sum();

        let mut soc: IndexMap<String, f64> = constraints
            .sources
            .iter()
            .filter_map(|(id, spec)| spec.battery.as_ref().map(|b| (id.clone(), b.soc)))
            .collect();
        let mut previous: IndexMap<String, f64> = constraints
            .sources
            .iter()
            .map(|(id, spec)| (id.clone(), spec.previous_allocation_kw))
            .collect();

        let mut steps = Vec::with_capacity(load.len());

        for (index, bucket) in load.buckets.iter().enumerate() {
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    warn!(bucket = index, "dispatch solve hit its deadline");
                    return Err(DispatchError::SolverTimeout { bucket: index });
                }
            }

            let demand = bucket.point_kw.max(0.0);
            let generation_cap = generation.point_at(index).max(0.0);

            let step = self.solve_bucket(
                bucket.start,
                demand,
                generation_cap,
                renewable_capacity,
                constraints,
                &merit_order,
                &mut soc,
                &mut previous,
                bucket_hours,
            );
            steps.push(step);
        }

        let plan = DispatchPlan {
            cycle_id,
            produced_at: state.timestamp,
            bucket: constraints.bucket,
            steps,
            fallback: None,
        };
        debug!(
            cycle_id,
            buckets = plan.steps.len(),
            shortfall_buckets = plan.shortfall_buckets(),
            expected_cost = plan.total_cost(),
            "dispatch plan solved"
        );
        Ok(plan)
    }

    #[allow(clippy::too_many_arguments)]
    fn solve_bucket(
        &self,
        start: DateTime<Utc>,
        demand: f64,
        generation_cap: f64,
        renewable_capacity: f64,
        constraints: &DispatchConstraints,
        merit_order: &[String],
        soc: &mut IndexMap<String, f64>,
        previous: &mut IndexMap<String, f64>,
        bucket_hours: f64,
    ) -> PlanStep {
        // Feasible interval per source; allocations start at the feasible
        // value closest to zero, so ramp-down floors force output while
        // batteries stay idle until dispatched or charged.
        let mut windows: IndexMap<String, (f64, f64)> = IndexMap::new();
        let mut allocation: IndexMap<String, f64> = IndexMap::new();
        for (source_id, spec) in &constraints.sources {
            let forecast_cap = (spec.kind == SourceKind::Renewable).then(|| {
                if renewable_capacity > 0.0 {
                    generation_cap * spec.available_kw / renewable_capacity
                } else {
                    0.0
                }
            });
            let window = feasible_window(
                spec,
                previous.get(source_id).copied().unwrap_or(0.0),
                soc.get(source_id).copied().unwrap_or(0.0),
                bucket_hours,
                forecast_cap,
            );
            allocation.insert(source_id.clone(), 0.0f64.clamp(window.0, window.1));
            windows.insert(source_id.clone(), window);
        }

        let mut supplied: f64 = allocation.values().sum();

        // Merit-order pass: cheapest source first until demand is covered.
        for source_id in merit_order {
            if supplied + BALANCE_EPSILON_KW >= demand {
                break;
            }
            let (_, hi) = windows[source_id];
            let current = allocation[source_id];
            let addition = (demand - supplied).min(hi - current);
            if addition > 0.0 {
                allocation[source_id] = current + addition;
                supplied += addition;
            }
        }

        // Surplus renewable headroom charges the battery when the stored
        // energy displaces a costlier source later.
        self.charge_from_surplus(constraints, &windows, &mut allocation);
        supplied = allocation.values().sum();

        let shortfall = (demand - supplied).max(0.0);
        let shortfall = if shortfall > BALANCE_EPSILON_KW {
            shortfall
        } else {
            0.0
        };
        let surplus = (supplied - demand).max(0.0);
        let surplus = if surplus > BALANCE_EPSILON_KW { surplus } else { 0.0 };
        if shortfall > 0.0 {
            warn!(%start, shortfall_kw = shortfall, "demand coverage relaxed for bucket");
        }

        let expected_cost = self.step_cost(constraints, &allocation, bucket_hours);

        for (source_id, spec) in &constraints.sources {
            let commanded = allocation[source_id];
            if let Some(battery) = &spec.battery {
                let current = soc[source_id];
                soc.insert(
                    source_id.clone(),
                    advance_soc(battery, current, commanded, bucket_hours),
                );
            }
            previous.insert(source_id.clone(), commanded);
        }

        PlanStep {
            start,
            allocation_kw: allocation,
            expected_cost,
            shortfall_kw: shortfall,
            surplus_kw: surplus,
        }
    }

    /// Route surplus renewable headroom into battery charging when the
    /// displaced future import is worth more than the cycling cost.
    fn charge_from_surplus(
        &self,
        constraints: &DispatchConstraints,
        windows: &IndexMap<String, (f64, f64)>,
        allocation: &mut IndexMap<String, f64>,
    ) {
        let grid_cost = constraints
            .sources
            .values()
            .filter(|spec| spec.kind == SourceKind::Grid)
            .map(|spec| spec.cost_per_kwh)
            .fold(f64::NEG_INFINITY, f64::max);
        if !grid_cost.is_finite() {
            return;
        }

        let mut headroom: f64 = constraints
            .sources
            .iter()
            .filter(|(_, spec)| spec.kind == SourceKind::Renewable)
            .map(|(id, _)| windows[id].1 - allocation[id])
            .sum();
        if headroom <= BALANCE_EPSILON_KW {
            return;
        }

        for (source_id, spec) in &constraints.sources {
            if spec.battery.is_none() {
                continue;
            }
            let worth_storing =
                constraints.renewable_credit_per_kwh + spec.cost_per_kwh <= grid_cost;
            if !worth_storing {
                continue;
            }
            let (lo, _) = windows[source_id];
            let charge_room = allocation[source_id] - lo;
            let charge = charge_room.min(headroom);
            if charge <= BALANCE_EPSILON_KW {
                continue;
            }
            allocation[source_id] -= charge;
            headroom -= charge;
            // The matching renewable increase keeps the bucket balanced.
            let mut remaining = charge;
            for (renewable_id, renewable) in &constraints.sources {
                if renewable.kind != SourceKind::Renewable || remaining <= 0.0 {
                    continue;
                }
                let room = windows[renewable_id].1 - allocation[renewable_id];
                let add = room.min(remaining);
                if add > 0.0 {
                    allocation[renewable_id] += add;
                    remaining -= add;
                }
            }
            if headroom <= BALANCE_EPSILON_KW {
                break;
            }
        }
    }

    fn step_cost(
        &self,
        constraints: &DispatchConstraints,
        allocation: &IndexMap<String, f64>,
        bucket_hours: f64,
    ) -> f64 {
        let mut cost = 0.0;
        for (source_id, spec) in &constraints.sources {
            let commanded = allocation[source_id];
            match spec.kind {
                SourceKind::Battery => {
                    // Degradation is paid on throughput in either direction.
                    cost += commanded.abs() * spec.cost_per_kwh * bucket_hours;
                }
                SourceKind::Renewable => {
                    cost += commanded
                        * (spec.cost_per_kwh - constraints.renewable_credit_per_kwh)
                        * bucket_hours;
                }
                SourceKind::Grid => {
                    cost += commanded * spec.cost_per_kwh * bucket_hours;
                }
            }
        }
        cost
    }
}

/// Dispatch order: ascending effective cost, renewables first and batteries
/// last among equals, source id as the final deterministic tie-break.
fn merit_order(constraints: &DispatchConstraints) -> Vec<String> {
    let rank = |spec: &SourceSpec| match spec.kind {
        SourceKind::Renewable => 0u8,
        SourceKind::Grid => 1,
        SourceKind::Battery => 2,
    };
    let mut order: Vec<(String, f64, u8)> = constraints
        .sources
        .iter()
        .map(|(id, spec)| (id.clone(), constraints.effective_cost(spec), rank(spec)))
        .collect();
    order.sort_by(|a, b| {
        a.1.total_cmp(&b.1)
            .then(a.2.cmp(&b.2))
            .then(a.0.cmp(&b.0))
    });
    order.into_iter().map(|(id, _, _)| id).collect()
}
