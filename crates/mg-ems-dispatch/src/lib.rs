//! ---
//! ems_section: "08-energy-models-optimization"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Dispatch optimization and fallback planning."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Dispatch planning for the MG-EMS engine.
//!
//! The [`MeritOrderOptimizer`] turns the current state and forecast pair
//! into a time-indexed [`DispatchPlan`] minimizing expected cost under
//! capacity, ramp-rate, and SOC constraints. Demand coverage is the only
//! constraint it will relax: under forced infeasibility the plan carries an
//! explicit shortfall and still respects every hard physical bound. The
//! [`PriorityHeuristic`] provides the static renewables-battery-grid
//! fallback used when no previous plan can be shifted.

use thiserror::Error;

pub mod constraints;
pub mod heuristic;
pub mod optimizer;
pub mod plan;

pub use constraints::{BatterySpec, DispatchConstraints, SourceSpec};
pub use heuristic::PriorityHeuristic;
pub use optimizer::MeritOrderOptimizer;
pub use plan::{DispatchPlan, FallbackKind, PlanStep};

pub type Result<T> = std::result::Result<T, DispatchError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DispatchError {
    /// The constraint set itself is unusable; recoverable via fallback.
    #[error("dispatch constraint set is unusable: {0}")]
    Infeasible(String),
    /// The solve ran out of its wall-clock budget; recoverable via fallback.
    #[error("dispatch solve exceeded its budget at bucket {bucket}")]
    SolverTimeout { bucket: usize },
}
