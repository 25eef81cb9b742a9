//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Binary entrypoint for the MG-EMS daemon."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use parking_lot::Mutex;
use tokio::signal;
use tracing::{info, warn};

use mg_ems_common::config::{AppConfig, Mode};
use mg_ems_common::logging::init_tracing;
use mg_ems_core::{DispatchEngine, DispatchPlan, JsonlReportWriter, PlanSink, TracingPlanSink};
use mg_ems_metrics::{new_registry, EngineMetrics};
use mg_ems_sim::FeedEngine;
use mg_ems_telemetry::TelemetryBuffer;

/// Hours of synthetic history seeded before the first simulated cycle.
const SIM_WARMUP_HOURS: i64 = 6;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "MG-EMS daemon",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, value_enum, help = "Override application mode")]
    mode: Option<CliMode>,

    #[arg(long, help = "Stop after this many control cycles")]
    cycles: Option<u64>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliMode {
    Production,
    Simulation,
    Hybrid,
}

impl From<CliMode> for Mode {
    fn from(value: CliMode) -> Self {
        match value {
            CliMode::Production => Mode::Production,
            CliMode::Simulation => Mode::Simulation,
            CliMode::Hybrid => Mode::Hybrid,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run the forecast-and-dispatch engine")]
    Run,
    #[command(about = "Validate the configuration and exit")]
    CheckConfig,
}

/// Plan sink that mirrors the applied head step into the simulated feed,
/// so SOC telemetry tracks the commanded dispatch.
struct SimPlanSink {
    feed: Arc<Mutex<FeedEngine>>,
    inner: TracingPlanSink,
}

impl PlanSink for SimPlanSink {
    fn publish(&self, plan: &DispatchPlan) -> mg_ems_core::outbound::Result<()> {
        if let Some(step) = plan.first_step() {
            self.feed.lock().observe_allocation(&step.allocation_kw);
        }
        self.inner.publish(plan)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/example.toml"));
    candidates.push(PathBuf::from("configs/example.sim.toml"));

    let loaded = AppConfig::load_with_source(&candidates)?;
    let mut config = loaded.config;
    let config_path = loaded.source;

    if let Some(mode) = cli.mode {
        config.mode = mode.into();
    }
    if let Some(cycles) = cli.cycles {
        config.engine.max_cycles = Some(cycles);
    }

    if matches!(cli.command, Some(Commands::CheckConfig)) {
        config.validate()?;
        println!("configuration ok: {}", config_path.display());
        return Ok(());
    }

    init_tracing("mg-emsd", &config.logging)?;
    info!(config_path = %config_path.display(), mode = ?config.effective_mode(), "daemon starting");

    let metrics = if config.metrics.enabled {
        let registry = new_registry();
        Some(EngineMetrics::new(registry).context("failed to register engine metrics")?)
    } else {
        None
    };

    let buffer = Arc::new(TelemetryBuffer::new(config.telemetry.retention));
    let report_path = config.metrics.report_directory.join("cycle-reports.jsonl");
    let report_sink = Arc::new(
        JsonlReportWriter::open(&report_path)
            .with_context(|| format!("unable to open report log {}", report_path.display()))?,
    );

    let mode = config.effective_mode();
    let simulated = mode.is_simulation()
        || mode.is_hybrid()
        || config.simulation.enable_randomized_inputs;

    let mut feed_task = None;
    let plan_sink: Arc<dyn PlanSink> = if simulated {
        let feed = Arc::new(Mutex::new(FeedEngine::new(
            &config,
            config.simulation.random_seed,
        )));
        seed_history(&feed, &buffer, &config);
        feed_task = Some(spawn_feed(feed.clone(), buffer.clone(), &config));
        Arc::new(SimPlanSink {
            feed,
            inner: TracingPlanSink,
        })
    } else {
        warn!("production mode without an embedded feed; telemetry must be ingested externally");
        Arc::new(TracingPlanSink)
    };

    let engine = DispatchEngine::new(config, buffer, plan_sink, report_sink, metrics);
    let handle = engine.start().await?;

    let trigger = handle.shutdown_trigger();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("interrupt received; shutting down");
            let _ = trigger.send(());
        }
    });

    handle.join().await?;

    if let Some(task) = feed_task {
        task.abort();
    }
    info!("daemon exit");
    Ok(())
}

/// Pre-populate the buffer with synthetic history so the seasonal model has
/// something to learn from on the first cycle.
fn seed_history(feed: &Arc<Mutex<FeedEngine>>, buffer: &Arc<TelemetryBuffer>, config: &AppConfig) {
    let tick_minutes = (config.telemetry.tick.as_secs() / 60).max(1) as i64;
    let steps = SIM_WARMUP_HOURS * 60 / tick_minutes;
    let now = Utc::now();
    let mut feed = feed.lock();
    for offset in (1..=steps).rev() {
        let ts = now - chrono::TimeDelta::minutes(offset * tick_minutes);
        buffer.extend(feed.readings_at(ts));
    }
    info!(samples = steps, "seeded simulated telemetry history");
}

fn spawn_feed(
    feed: Arc<Mutex<FeedEngine>>,
    buffer: Arc<TelemetryBuffer>,
    config: &AppConfig,
) -> tokio::task::JoinHandle<()> {
    let interval = config
        .simulation
        .feed_interval
        .unwrap_or(config.telemetry.tick)
        .max(Duration::from_millis(100));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let readings = feed.lock().readings_at(Utc::now());
            buffer.extend(readings);
        }
    })
}
