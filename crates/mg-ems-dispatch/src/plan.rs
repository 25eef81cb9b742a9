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

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};

use mg_ems_common::time::to_delta;

/// How a fallback plan was constructed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum FallbackKind {
    /// Previous cycle's plan advanced by one bucket.
    ShiftedPrevious,
    /// Static renewables-battery-grid priority order.
    PriorityHeuristic,
}

/// Allocation command for one horizon bucket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanStep {
    pub start: DateTime<Utc>,
    /// Commanded power per source in kW; negative battery values denote
    /// charging.
    pub allocation_kw: IndexMap<String, f64>,
    pub expected_cost: f64,
    /// Demand the plan knowingly fails to cover in this bucket.
    pub shortfall_kw: f64,
    /// Forced over-supply from ramp-down floors, absorbed or curtailed.
    pub surplus_kw: f64,
}

impl PlanStep {
    pub fn allocation_of(&self, source_id: &str) -> f64 {
        self.allocation_kw.get(source_id).copied().unwrap_or(0.0)
    }

    pub fn total_allocation_kw(&self) -> f64 {
        self.allocation_kw.values().sum()
    }
}

/// Time-indexed dispatch decision produced by one control cycle.
///
/// Valid only for the cycle that produced it; stale plans are never
/// reapplied, only shifted into a successor via [`DispatchPlan::shifted`].
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatchPlan {
    pub cycle_id: u64,
    pub produced_at: DateTime<Utc>,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub bucket: Duration,
    pub steps: Vec<PlanStep>,
    pub fallback: Option<FallbackKind>,
}

impl DispatchPlan {
    pub fn first_step(&self) -> Option<&PlanStep> {
        self.steps.first()
    }

    pub fn has_shortfall(&self) -> bool {
        self.steps.iter().any(|step| step.shortfall_kw > 0.0)
    }

    pub fn shortfall_buckets(&self) -> usize {
        self.steps.iter().filter(|step| step.shortfall_kw > 0.0).count()
    }

    pub fn max_shortfall_kw(&self) -> f64 {
        self.steps
            .iter()
            .map(|step| step.shortfall_kw)
            .fold(0.0, f64::max)
    }

    pub fn total_cost(&self) -> f64 {
        self.steps.iter().map(|step| step.expected_cost).sum()
    }

    /// Derive the fallback plan for a new cycle by advancing this plan one
    /// bucket: the consumed head step is dropped and the tail step repeated
    /// at the end of the horizon. Returns `None` for an empty plan.
    pub fn shifted(&self, cycle_id: u64, produced_at: DateTime<Utc>) -> Option<DispatchPlan> {
        let last = self.steps.last()?;
        let mut steps: Vec<PlanStep> = self.steps.iter().skip(1).cloned().collect();
        let mut tail = last.clone();
        tail.start = last.start + to_delta(self.bucket);
        steps.push(tail);
        Some(DispatchPlan {
            cycle_id,
            produced_at,
            bucket: self.bucket,
            steps,
            fallback: Some(FallbackKind::ShiftedPrevious),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn step(start: DateTime<Utc>, grid_kw: f64) -> PlanStep {
        let mut allocation_kw = IndexMap::new();
        allocation_kw.insert("grid".to_owned(), grid_kw);
        PlanStep {
            start,
            allocation_kw,
            expected_cost: 0.1,
            shortfall_kw: 0.0,
            surplus_kw: 0.0,
        }
    }

    #[test]
    fn shifting_drops_head_and_extends_tail() {
        let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let bucket = Duration::from_secs(900);
        let plan = DispatchPlan {
            cycle_id: 4,
            produced_at: t0,
            bucket,
            steps: vec![
                step(t0, 1.0),
                step(t0 + chrono::TimeDelta::minutes(15), 2.0),
            ],
            fallback: None,
        };
        let shifted = plan.shifted(5, t0 + chrono::TimeDelta::minutes(15)).unwrap();
        assert_eq!(shifted.cycle_id, 5);
        assert_eq!(shifted.fallback, Some(FallbackKind::ShiftedPrevious));
        assert_eq!(shifted.steps.len(), 2);
        assert_eq!(shifted.steps[0].allocation_of("grid"), 2.0);
        assert_eq!(shifted.steps[1].allocation_of("grid"), 2.0);
        assert_eq!(
            shifted.steps[1].start,
            t0 + chrono::TimeDelta::minutes(30)
        );
    }

    #[test]
    fn shortfall_accessors_report_flagged_buckets() {
        let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let mut flagged = step(t0, 1.0);
        flagged.shortfall_kw = 2.5;
        let plan = DispatchPlan {
            cycle_id: 1,
            produced_at: t0,
            bucket: Duration::from_secs(900),
            steps: vec![step(t0, 1.0), flagged],
            fallback: None,
        };
        assert!(plan.has_shortfall());
        assert_eq!(plan.shortfall_buckets(), 1);
        assert_eq!(plan.max_shortfall_kw(), 2.5);
    }
}
