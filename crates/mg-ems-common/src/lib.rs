//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the engine runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Core shared primitives for the MG-EMS engine workspace.
//! This crate exposes configuration loading, logging setup, and timing
//! utilities consumed across the workspace.

pub mod config;
pub mod logging;
pub mod metrics;
pub mod time;

pub use config::{
    AppConfig, BatteryConfig, CostConfig, EngineConfig, EstimatorConfig, FallbackConfig,
    ForecastConfig, LoggingConfig, MetricsConfig, Mode, SimulationConfig, SourceConfig, SourceKind,
    TelemetryConfig,
};
pub use logging::{init_tracing, LogFormat};
pub use metrics::{JitterHistogram, LoopTimingReporter};
