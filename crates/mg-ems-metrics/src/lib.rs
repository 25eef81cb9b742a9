//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Metrics collection and export utilities."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Prometheus metric registration for the MG-EMS engine.
//!
//! The registry is injectable so the surrounding service layer decides how
//! to expose it; this crate only defines and records the engine's metric
//! families.

use std::sync::Arc;

use anyhow::{Context, Result};
use prometheus::{
    Gauge, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry,
};

/// Shared registry type used across services.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Metrics recorded by the forecast-and-dispatch control loop.
#[derive(Clone)]
pub struct EngineMetrics {
    registry: SharedRegistry,
    cycles_total: IntCounter,
    cycle_failures_total: IntCounterVec,
    fallback_plans_total: IntCounterVec,
    stage_seconds: HistogramVec,
    shortfall_kw: Gauge,
    plan_cost: Gauge,
}

impl EngineMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let cycles_total = IntCounter::with_opts(Opts::new(
            "mg_ems_cycles_total",
            "Total number of completed control cycles",
        ))?;
        registry.register(Box::new(cycles_total.clone()))?;

        let cycle_failures_total = IntCounterVec::new(
            Opts::new(
                "mg_ems_cycle_failures_total",
                "Count of recovered stage failures by stage",
            ),
            &["stage"],
        )?;
        registry.register(Box::new(cycle_failures_total.clone()))?;

        let fallback_plans_total = IntCounterVec::new(
            Opts::new(
                "mg_ems_fallback_plans_total",
                "Count of cycles that applied a fallback plan, by kind",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(fallback_plans_total.clone()))?;

        let buckets = prometheus::exponential_buckets(0.0005, 2.0, 14)
            .context("failed to construct histogram buckets")?;
        let stage_seconds = HistogramVec::new(
            HistogramOpts::new(
                "mg_ems_stage_seconds",
                "Wall-clock time spent per control cycle stage",
            )
            .buckets(buckets),
            &["stage"],
        )?;
        registry.register(Box::new(stage_seconds.clone()))?;

        let shortfall_kw = Gauge::with_opts(Opts::new(
            "mg_ems_plan_shortfall_kw",
            "Maximum uncovered demand in the most recent plan",
        ))?;
        registry.register(Box::new(shortfall_kw.clone()))?;

        let plan_cost = Gauge::with_opts(Opts::new(
            "mg_ems_plan_expected_cost",
            "Expected total cost of the most recent plan",
        ))?;
        registry.register(Box::new(plan_cost.clone()))?;

        Ok(Self {
            registry,
            cycles_total,
            cycle_failures_total,
            fallback_plans_total,
            stage_seconds,
            shortfall_kw,
            plan_cost,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn inc_cycle(&self) {
        self.cycles_total.inc();
    }

    pub fn record_stage_failure(&self, stage: &str) {
        self.cycle_failures_total.with_label_values(&[stage]).inc();
    }

    pub fn record_fallback(&self, kind: &str) {
        self.fallback_plans_total.with_label_values(&[kind]).inc();
    }

    pub fn observe_stage(&self, stage: &str, seconds: f64) {
        self.stage_seconds
            .with_label_values(&[stage])
            .observe(seconds);
    }

    pub fn set_shortfall(&self, kw: f64) {
        self.shortfall_kw.set(kw);
    }

    pub fn set_plan_cost(&self, cost: f64) {
        self.plan_cost.set(cost);
    }
}

pub use prometheus;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_families_register_once() {
        let registry = new_registry();
        let metrics = EngineMetrics::new(registry.clone()).unwrap();
        metrics.inc_cycle();
        metrics.record_stage_failure("forecasting");
        metrics.observe_stage("optimizing", 0.004);
        metrics.set_shortfall(1.5);
        let families = registry.gather();
        assert!(families
            .iter()
            .any(|family| family.get_name() == "mg_ems_cycles_total"));
    }
}
