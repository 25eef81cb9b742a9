//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Primary control loop and lifecycle management."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Core control loop for the MG-EMS engine.
//!
//! One cycle per cadence tick walks
//! `Collecting -> Estimating -> Forecasting -> Optimizing -> Applying`.
//! Any stage failure routes straight to `Applying` with a fallback plan;
//! the loop never halts on a single-cycle failure and always leaves the
//! system with a valid last-applied plan, including across shutdown.

use thiserror::Error;

pub mod engine;
pub mod outbound;
pub mod report;

pub use engine::{DispatchEngine, EngineHandle};
pub use outbound::{
    JsonlReportWriter, MemorySink, OutboundError, PlanSink, ReportSink, TracingPlanSink,
};
pub use report::{BalancingSummary, CycleFailure, CyclePhase, CycleReport, StageTiming};

pub use mg_ems_dispatch::{DispatchPlan, FallbackKind};

/// Raised internally when a cycle's cumulative stage time exceeds its
/// budget; recovered by aborting the cycle and applying the fallback plan.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("cycle {cycle_id} exceeded its {budget_ms} ms budget during {stage}")]
pub struct DeadlineExceededError {
    pub cycle_id: u64,
    pub stage: CyclePhase,
    pub budget_ms: u64,
}
