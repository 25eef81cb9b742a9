//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Primary control loop and lifecycle management."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::outbound::{PlanSink, ReportSink};
use crate::report::{BalancingSummary, CycleFailure, CyclePhase, CycleReport, StageTiming};
use crate::DeadlineExceededError;
use mg_ems_common::config::{AppConfig, SourceKind};
use mg_ems_common::metrics::LoopTimingReporter;
use mg_ems_dispatch::{DispatchConstraints, DispatchPlan, MeritOrderOptimizer, PriorityHeuristic};
use mg_ems_estimator::{AppliedStep, StateEstimator, SystemState};
use mg_ems_forecast::{
    ForecastWindow, Forecaster, NaivePersistenceForecaster, SampleSeries, SeasonalTrendForecaster,
};
use mg_ems_metrics::EngineMetrics;
use mg_ems_telemetry::{Normalizer, QuantityKind, TelemetryBuffer};

/// Forecast-and-dispatch control loop.
///
/// Owns the per-cycle pipeline and its fallback ladder. Telemetry is read
/// through a frozen buffer snapshot per cycle; exactly one plan and one
/// report leave through the injected sinks each cadence tick.
pub struct DispatchEngine {
    config: Arc<AppConfig>,
    buffer: Arc<TelemetryBuffer>,
    load_forecaster: Arc<dyn Forecaster>,
    generation_forecaster: Arc<dyn Forecaster>,
    plan_sink: Arc<dyn PlanSink>,
    report_sink: Arc<dyn ReportSink>,
    metrics: Option<EngineMetrics>,
}

impl DispatchEngine {
    pub fn new(
        config: AppConfig,
        buffer: Arc<TelemetryBuffer>,
        plan_sink: Arc<dyn PlanSink>,
        report_sink: Arc<dyn ReportSink>,
        metrics: Option<EngineMetrics>,
    ) -> Self {
        let renewable_sources: Vec<String> = config
            .sources
            .iter()
            .filter(|(_, source)| source.kind == SourceKind::Renewable)
            .map(|(id, _)| id.clone())
            .collect();
        let load_forecaster: Arc<dyn Forecaster> =
            Arc::new(SeasonalTrendForecaster::load(&config.forecast));
        let generation_forecaster: Arc<dyn Forecaster> = Arc::new(
            SeasonalTrendForecaster::generation(&config.forecast, renewable_sources),
        );
        Self {
            config: Arc::new(config),
            buffer,
            load_forecaster,
            generation_forecaster,
            plan_sink,
            report_sink,
            metrics,
        }
    }

    /// Swap the forecast strategies; the contract stays fixed, the model is
    /// pluggable.
    pub fn with_forecasters(
        mut self,
        load: Arc<dyn Forecaster>,
        generation: Arc<dyn Forecaster>,
    ) -> Self {
        self.load_forecaster = load;
        self.generation_forecaster = generation;
        self
    }

    /// Validate configuration and start the control loop.
    pub async fn start(self) -> Result<EngineHandle> {
        self.config
            .validate()
            .context("engine configuration failed validation")?;

        let (shutdown_tx, shutdown_rx) = broadcast::channel(16);
        let heuristic = self
            .config
            .fallback
            .enable_heuristic
            .then(|| PriorityHeuristic::new(self.config.fallback.assumed_demand_kw));
        let context = CycleContext {
            config: self.config.clone(),
            buffer: self.buffer,
            normalizer: Normalizer::from_config(&self.config.telemetry),
            estimator: StateEstimator::from_config(&self.config),
            optimizer: MeritOrderOptimizer::new(),
            heuristic,
            load_forecaster: self.load_forecaster,
            generation_forecaster: self.generation_forecaster,
            naive: NaivePersistenceForecaster::new(&self.config.forecast),
            plan_sink: self.plan_sink,
            report_sink: self.report_sink,
            metrics: self.metrics,
        };

        info!(
            mode = ?self.config.effective_mode(),
            cadence_s = self.config.engine.cadence.as_secs(),
            horizon_s = self.config.engine.horizon.as_secs(),
            bucket_s = self.config.engine.bucket.as_secs(),
            sources = self.config.sources.len(),
            "dispatch engine started"
        );

        let task = tokio::spawn(run_engine(context, shutdown_rx));
        Ok(EngineHandle {
            shutdown: shutdown_tx,
            task,
        })
    }
}

/// Handle for lifecycle control of a running engine.
#[derive(Debug)]
pub struct EngineHandle {
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<Result<()>>,
}

impl EngineHandle {
    /// Signal shutdown and wait for the loop to exit. A cycle in flight
    /// completes its `Applying` stage first.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown.send(());
        self.join().await
    }

    /// Sender that can request shutdown from another task.
    pub fn shutdown_trigger(&self) -> broadcast::Sender<()> {
        self.shutdown.clone()
    }

    /// Wait for the loop to exit on its own (e.g. `max_cycles`).
    pub async fn join(self) -> Result<()> {
        match self.task.await {
            Ok(result) => result,
            Err(join_err) => Err(anyhow::Error::new(join_err)),
        }
    }
}

struct CycleContext {
    config: Arc<AppConfig>,
    buffer: Arc<TelemetryBuffer>,
    normalizer: Normalizer,
    estimator: StateEstimator,
    optimizer: MeritOrderOptimizer,
    heuristic: Option<PriorityHeuristic>,
    load_forecaster: Arc<dyn Forecaster>,
    generation_forecaster: Arc<dyn Forecaster>,
    naive: NaivePersistenceForecaster,
    plan_sink: Arc<dyn PlanSink>,
    report_sink: Arc<dyn ReportSink>,
    metrics: Option<EngineMetrics>,
}

struct CycleOutcome {
    state: SystemState,
    plan: Option<DispatchPlan>,
}

async fn run_engine(context: CycleContext, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
    let mut limiter = CadenceLimiter::new(context.config.engine.cadence);
    let reporter = LoopTimingReporter::new(context.config.engine.cadence);
    let mut cycle_id: u64 = 0;
    let mut previous_state = SystemState::initial(&context.config, Utc::now());
    let mut previous_plan: Option<DispatchPlan> = None;

    'control_loop: loop {
        tokio::select! {
            _ = shutdown.recv() => {
                debug!("engine shutdown signal received");
                break 'control_loop;
            }
            _ = limiter.tick() => {
                cycle_id += 1;
                reporter.record_tick();

                // The cycle runs to completion inside this branch, so a
                // shutdown arriving mid-cycle still sees `Applying` finish
                // before the loop exits.
                let outcome = run_cycle(
                    &context,
                    cycle_id,
                    &previous_state,
                    previous_plan.as_ref(),
                ).await;

                previous_state = outcome.state;
                if let Some(plan) = outcome.plan {
                    previous_plan = Some(plan);
                }

                if let Some(limit) = context.config.engine.max_cycles {
                    if cycle_id >= limit {
                        info!(cycle_id, limit, "engine reached max_cycles; stopping");
                        break 'control_loop;
                    }
                }
            }
        }
    }

    if let Some(summary) = reporter.histogram().summary() {
        debug!(
            samples = summary.samples,
            mean_ns = summary.mean_ns,
            std_dev_ns = summary.std_dev_ns,
            "engine cadence jitter summary"
        );
    }
    info!(cycles = cycle_id, "dispatch engine stopped");
    Ok(())
}

async fn run_cycle(
    context: &CycleContext,
    cycle_id: u64,
    previous_state: &SystemState,
    previous_plan: Option<&DispatchPlan>,
) -> CycleOutcome {
    let started_at = Utc::now();
    let budget = context.config.engine.cycle_deadline();
    let deadline = Instant::now() + budget;
    let mut timings: Vec<StageTiming> = Vec::new();
    let mut failures: Vec<CycleFailure> = Vec::new();

    // Collecting: freeze the ingest buffer and normalize onto the grid.
    debug!(cycle_id, phase = %CyclePhase::Collecting, "phase entered");
    let stage_start = Instant::now();
    let snapshot = context.buffer.snapshot(started_at);
    let batch = context.normalizer.normalize(&snapshot, started_at);
    timings.push(StageTiming {
        stage: CyclePhase::Collecting,
        duration: stage_start.elapsed(),
    });
    for missing in &batch.missing {
        failures.push(CycleFailure {
            stage: CyclePhase::Collecting,
            error: missing.to_string(),
        });
    }

    // Estimating: always runs, never fails for numeric reasons.
    debug!(cycle_id, phase = %CyclePhase::Estimating, "phase entered");
    let stage_start = Instant::now();
    let state = context.estimator.estimate(
        &batch,
        previous_state.last_applied.as_ref(),
        previous_state,
        started_at,
    );
    timings.push(StageTiming {
        stage: CyclePhase::Estimating,
        duration: stage_start.elapsed(),
    });

    let load_series = SampleSeries::aggregate(&batch, QuantityKind::Load);
    let generation_series = SampleSeries::aggregate(&batch, QuantityKind::Generation);
    let demand_hint = load_series.last().map(|point| point.value);
    let degraded_telemetry =
        state.is_degraded() || batch.samples.iter().any(|sample| sample.is_stale());

    // Forecasting: heavy, offloaded and bounded by the remaining budget.
    debug!(cycle_id, phase = %CyclePhase::Forecasting, "phase entered");
    let stage_start = Instant::now();
    let mut windows: Option<(ForecastWindow, ForecastWindow)> = None;
    let mut naive_forecast = false;
    match remaining_budget(deadline) {
        None => failures.push(deadline_failure(cycle_id, CyclePhase::Forecasting, budget)),
        Some(remaining) => {
            let load_forecaster = context.load_forecaster.clone();
            let generation_forecaster = context.generation_forecaster.clone();
            let naive = context.naive.clone();
            let horizon = context.config.engine.horizon;
            let bucket = context.config.engine.bucket;
            let state_for_forecast = state.clone();
            let load_for_forecast = load_series.clone();
            let generation_for_forecast = generation_series.clone();

            let task = tokio::task::spawn_blocking(move || {
                let mut recovered = Vec::new();
                let load = match load_forecaster.forecast(
                    &load_for_forecast,
                    &state_for_forecast,
                    horizon,
                    bucket,
                ) {
                    Ok(window) => window,
                    Err(err) => {
                        recovered.push(err.to_string());
                        naive.window(&load_for_forecast, &state_for_forecast, horizon, bucket)
                    }
                };
                let generation = match generation_forecaster.forecast(
                    &generation_for_forecast,
                    &state_for_forecast,
                    horizon,
                    bucket,
                ) {
                    Ok(window) => window,
                    Err(err) => {
                        recovered.push(err.to_string());
                        naive.window(
                            &generation_for_forecast,
                            &state_for_forecast,
                            horizon,
                            bucket,
                        )
                    }
                };
                (load, generation, recovered)
            });

            match tokio::time::timeout(remaining, task).await {
                Ok(Ok((load, generation, recovered))) => {
                    naive_forecast = load.naive || generation.naive;
                    for error in recovered {
                        failures.push(CycleFailure {
                            stage: CyclePhase::Forecasting,
                            error,
                        });
                    }
                    windows = Some((load, generation));
                }
                Ok(Err(join_err)) => failures.push(CycleFailure {
                    stage: CyclePhase::Forecasting,
                    error: format!("forecast worker failed: {}", join_err),
                }),
                // The abandoned worker finishes in the background; its
                // output is discarded.
                Err(_) => {
                    failures.push(deadline_failure(cycle_id, CyclePhase::Forecasting, budget))
                }
            }
        }
    }
    timings.push(StageTiming {
        stage: CyclePhase::Forecasting,
        duration: stage_start.elapsed(),
    });

    // Optimizing: heavy, offloaded, carries its own solver deadline.
    debug!(cycle_id, phase = %CyclePhase::Optimizing, "phase entered");
    let stage_start = Instant::now();
    let constraints = DispatchConstraints::build(&context.config, &state);
    let mut solved: Option<DispatchPlan> = None;
    if let Some((load, generation)) = &windows {
        match remaining_budget(deadline) {
            None => failures.push(deadline_failure(cycle_id, CyclePhase::Optimizing, budget)),
            Some(remaining) => {
                let optimizer = context.optimizer.clone();
                let state_for_solve = state.clone();
                let load = load.clone();
                let generation = generation.clone();
                let constraints_for_solve = constraints.clone();
                let task = tokio::task::spawn_blocking(move || {
                    optimizer.optimize(
                        &state_for_solve,
                        &load,
                        &generation,
                        &constraints_for_solve,
                        cycle_id,
                        Some(deadline),
                    )
                });
                match tokio::time::timeout(remaining, task).await {
                    Ok(Ok(Ok(plan))) => solved = Some(plan),
                    Ok(Ok(Err(err))) => failures.push(CycleFailure {
                        stage: CyclePhase::Optimizing,
                        error: err.to_string(),
                    }),
                    Ok(Err(join_err)) => failures.push(CycleFailure {
                        stage: CyclePhase::Optimizing,
                        error: format!("solver worker failed: {}", join_err),
                    }),
                    Err(_) => {
                        failures.push(deadline_failure(cycle_id, CyclePhase::Optimizing, budget))
                    }
                }
            }
        }
    }
    timings.push(StageTiming {
        stage: CyclePhase::Optimizing,
        duration: stage_start.elapsed(),
    });

    // Applying: the solved plan, or the fallback ladder.
    debug!(cycle_id, phase = %CyclePhase::Applying, "phase entered");
    let stage_start = Instant::now();
    let plan = solved.or_else(|| {
        previous_plan.and_then(|plan| {
            debug!(cycle_id, "falling back to previous plan shifted by one bucket");
            plan.shifted(cycle_id, started_at)
        })
    });
    let plan = plan.or_else(|| {
        context.heuristic.as_ref().map(|heuristic| {
            heuristic.plan(
                &constraints,
                demand_hint,
                context.config.engine.bucket_count(),
                cycle_id,
                started_at,
            )
        })
    });

    let fatal = plan.is_none();
    if fatal {
        failures.push(CycleFailure {
            stage: CyclePhase::Applying,
            error: "no fallback plan could be constructed".to_owned(),
        });
        error!(cycle_id, "cycle failed: no plan and no fallback available");
    }

    let state = match &plan {
        Some(plan) => state.with_applied(AppliedStep {
            cycle_id,
            applied_at: started_at,
            allocation_kw: plan
                .first_step()
                .map(|step| step.allocation_kw.clone())
                .unwrap_or_default(),
        }),
        None => state,
    };

    if let Some(plan) = &plan {
        if let Err(err) = context.plan_sink.publish(plan) {
            warn!(cycle_id, error = %err, "failed to publish dispatch plan");
            failures.push(CycleFailure {
                stage: CyclePhase::Applying,
                error: format!("plan delivery failed: {}", err),
            });
        }
    }
    timings.push(StageTiming {
        stage: CyclePhase::Applying,
        duration: stage_start.elapsed(),
    });

    let balancing = match (&plan, &windows) {
        (Some(plan), Some((load, generation))) => Some(BalancingSummary::from_plan(
            plan,
            load,
            generation,
            &constraints,
        )),
        _ => None,
    };

    let report = CycleReport {
        cycle_id,
        started_at,
        stage_timings: timings,
        failures,
        fallback: plan.as_ref().and_then(|plan| plan.fallback),
        fatal,
        shortfall_buckets: plan.as_ref().map(|p| p.shortfall_buckets()).unwrap_or(0),
        max_shortfall_kw: plan.as_ref().map(|p| p.max_shortfall_kw()).unwrap_or(0.0),
        expected_cost: plan.as_ref().map(|p| p.total_cost()).unwrap_or(0.0),
        naive_forecast,
        degraded_telemetry,
        balancing,
    };

    record_metrics(context, &report);
    if let Err(err) = context.report_sink.store(&report) {
        warn!(cycle_id, error = %err, "failed to store cycle report");
    }

    info!(
        cycle_id,
        fallback = ?report.fallback,
        fatal = report.fatal,
        failures = report.failures.len(),
        shortfall_buckets = report.shortfall_buckets,
        naive_forecast = report.naive_forecast,
        degraded_telemetry = report.degraded_telemetry,
        "cycle complete"
    );

    CycleOutcome { state, plan }
}

fn record_metrics(context: &CycleContext, report: &CycleReport) {
    let Some(metrics) = &context.metrics else {
        return;
    };
    metrics.inc_cycle();
    for timing in &report.stage_timings {
        metrics.observe_stage(timing.stage.as_str(), timing.duration.as_secs_f64());
    }
    for failure in &report.failures {
        metrics.record_stage_failure(failure.stage.as_str());
    }
    if let Some(kind) = report.fallback {
        let label = match kind {
            mg_ems_dispatch::FallbackKind::ShiftedPrevious => "shifted-previous",
            mg_ems_dispatch::FallbackKind::PriorityHeuristic => "priority-heuristic",
        };
        metrics.record_fallback(label);
    }
    metrics.set_shortfall(report.max_shortfall_kw);
    metrics.set_plan_cost(report.expected_cost);
}

fn remaining_budget(deadline: Instant) -> Option<Duration> {
    let remaining = deadline.checked_duration_since(Instant::now())?;
    if remaining.is_zero() {
        None
    } else {
        Some(remaining)
    }
}

fn deadline_failure(cycle_id: u64, stage: CyclePhase, budget: Duration) -> CycleFailure {
    let error = DeadlineExceededError {
        cycle_id,
        stage,
        budget_ms: budget.as_millis() as u64,
    };
    warn!(cycle_id, stage = %stage, "cycle aborted mid-stage by deadline");
    CycleFailure {
        stage,
        error: error.to_string(),
    }
}

/// Cadence driver; delayed ticks do not burst to catch up.
struct CadenceLimiter {
    interval: tokio::time::Interval,
}

impl CadenceLimiter {
    fn new(period: Duration) -> Self {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval }
    }

    async fn tick(&mut self) -> tokio::time::Instant {
        self.interval.tick().await
    }
}
