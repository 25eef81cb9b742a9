//! ---
//! ems_section: "11-simulation-test-harness"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Simulation runtime helpers and telemetry feed engines."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Telemetry feed simulation for the MG-EMS engine.
//!
//! Drives the engine in simulation mode and backs the scenario tests:
//! diurnal load, a solar curve, and battery SOC telemetry that follows the
//! applied dispatch commands. Injection hooks cover the failure scenarios
//! the control loop has to survive (feed stalls, source faults, demand
//! spikes).

pub mod feed;

pub use feed::{FeedEngine, LOAD_SOURCE_ID};
