//! ---
//! ems_section: "08-energy-models-optimization"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Dispatch optimization and fallback planning."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use tracing::info;

use crate::constraints::{advance_soc, feasible_window, DispatchConstraints};
use crate::plan::{DispatchPlan, FallbackKind, PlanStep};
use mg_ems_common::config::SourceKind;

/// Static priority-order planner: renewables first, then battery, then
/// grid.
///
/// Used when a cycle stage fails and no previous plan can be shifted. It
/// needs no forecast; demand is the last known load (or the configured
/// assumption), held flat across the horizon. Physical bounds are honoured
/// exactly as in the optimizer.
#[derive(Debug, Clone)]
pub struct PriorityHeuristic {
    assumed_demand_kw: Option<f64>,
}

impl PriorityHeuristic {
    pub fn new(assumed_demand_kw: Option<f64>) -> Self {
        Self { assumed_demand_kw }
    }

    /// Build a flat fallback plan. `demand_hint` is the most recent load
    /// observation, when one exists; with no hint and no configured
    /// assumption the heuristic commands a safe all-zero plan.
    pub fn plan(
        &self,
        constraints: &DispatchConstraints,
        demand_hint: Option<f64>,
        bucket_count: usize,
        cycle_id: u64,
        produced_at: DateTime<Utc>,
    ) -> DispatchPlan {
        let demand = demand_hint
            .or(self.assumed_demand_kw)
            .unwrap_or(0.0)
            .max(0.0);
        let bucket_hours = constraints.bucket_hours();
        let order = priority_order(constraints);

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

        let mut steps = Vec::with_capacity(bucket_count.max(1));
        for index in 0..bucket_count.max(1) {
            let start = produced_at + mg_ems_common::time::to_delta(constraints.bucket) * index as i32;
            let mut allocation: IndexMap<String, f64> = IndexMap::new();
            let mut windows: IndexMap<String, (f64, f64)> = IndexMap::new();
            for (source_id, spec) in &constraints.sources {
                let window = feasible_window(
                    spec,
                    previous.get(source_id).copied().unwrap_or(0.0),
                    soc.get(source_id).copied().unwrap_or(0.0),
                    bucket_hours,
                    None,
                );
                allocation.insert(source_id.clone(), 0.0f64.clamp(window.0, window.1));
                windows.insert(source_id.clone(), window);
            }

            let mut supplied: f64 = allocation.values().sum();
            for source_id in &order {
                if supplied >= demand {
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

            let shortfall = (demand - supplied).max(0.0);
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

            steps.push(PlanStep {
                start,
                allocation_kw: allocation,
                expected_cost: 0.0,
                shortfall_kw: shortfall,
                surplus_kw: 0.0,
            });
        }

        info!(cycle_id, demand_kw = demand, "priority heuristic fallback plan built");
        DispatchPlan {
            cycle_id,
            produced_at,
            bucket: constraints.bucket,
            steps,
            fallback: Some(FallbackKind::PriorityHeuristic),
        }
    }
}

fn priority_order(constraints: &DispatchConstraints) -> Vec<String> {
    let rank = |kind: SourceKind| match kind {
        SourceKind::Renewable => 0u8,
        SourceKind::Battery => 1,
        SourceKind::Grid => 2,
    };
    let mut order: Vec<(String, u8)> = constraints
        .sources
        .iter()
        .map(|(id, spec)| (id.clone(), rank(spec.kind)))
        .collect();
    order.sort_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)));
    order.into_iter().map(|(id, _)| id).collect()
}
