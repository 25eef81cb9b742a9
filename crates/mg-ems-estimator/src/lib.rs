//! ---
//! ems_section: "04-state-estimation"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "System state estimation and snapshot management."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! State estimation for the MG-EMS engine.
//!
//! Fuses normalized telemetry with the last applied dispatch command into an
//! immutable [`SystemState`] snapshot per control cycle. Estimation never
//! fails for numeric reasons: SOC is clamped to [0, 1] and capacities to
//! non-negative values; data-quality problems surface as reduced-confidence
//! flags on the snapshot.

pub mod estimator;
pub mod state;

pub use estimator::StateEstimator;
pub use state::{AppliedStep, SystemState};
