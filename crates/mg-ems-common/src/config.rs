//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the engine runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_mode() -> Mode {
    Mode::Production
}

fn default_cadence() -> Duration {
    Duration::from_secs(60)
}

fn default_deadline_fraction() -> f64 {
    0.8
}

fn default_horizon() -> Duration {
    Duration::from_secs(4 * 3600)
}

fn default_bucket() -> Duration {
    Duration::from_secs(900)
}

fn default_tick() -> Duration {
    Duration::from_secs(60)
}

fn default_lookback() -> Duration {
    Duration::from_secs(24 * 3600)
}

fn default_max_gap() -> Duration {
    Duration::from_secs(300)
}

fn default_stale_decay() -> Duration {
    Duration::from_secs(600)
}

fn default_retention() -> Duration {
    Duration::from_secs(48 * 3600)
}

fn default_correction_gain() -> f64 {
    0.25
}

fn default_derate_window() -> Duration {
    Duration::from_secs(300)
}

fn default_min_samples() -> usize {
    32
}

fn default_seasonal_weight() -> f64 {
    0.6
}

fn default_trend_weight() -> f64 {
    0.4
}

fn default_confidence_level() -> f64 {
    0.9
}

fn default_band_widening() -> f64 {
    0.15
}

fn default_trend_window() -> Duration {
    Duration::from_secs(3600)
}

fn default_renewable_credit() -> f64 {
    0.02
}

fn default_enable_heuristic() -> bool {
    true
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_report_directory() -> PathBuf {
    PathBuf::from("target/reports")
}

fn default_simulation_seed() -> u64 {
    0xA11CEu64
}

/// Primary configuration object for the MG-EMS engine runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_mode")]
    pub mode: Mode,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub estimator: EstimatorConfig,
    #[serde(default)]
    pub forecast: ForecastConfig,
    #[serde(default)]
    pub cost: CostConfig,
    #[serde(default)]
    pub sources: IndexMap<String, SourceConfig>,
    #[serde(default)]
    pub fallback: FallbackConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "MG_EMS_CONFIG";

    /// Load configuration from disk, respecting the `MG_EMS_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(path.clone())?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(path.clone())?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: PathBuf) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Derive the effective engine mode, considering simulation overrides.
    pub fn effective_mode(&self) -> Mode {
        if let Some(force) = self.simulation.force_mode {
            return force;
        }
        self.mode
    }

    /// Retrieve a source configuration by identifier.
    pub fn source(&self, source_id: &str) -> Option<&SourceConfig> {
        self.sources.get(source_id)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        if self.sources.is_empty() {
            return Err(anyhow!("configuration must declare at least one source"));
        }
        for (source_id, source) in &self.sources {
            source.validate(source_id)?;
        }
        self.engine.validate()?;
        self.forecast.validate()?;
        self.estimator.validate()?;
        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            engine: EngineConfig::default(),
            telemetry: TelemetryConfig::default(),
            estimator: EstimatorConfig::default(),
            forecast: ForecastConfig::default(),
            cost: CostConfig::default(),
            sources: IndexMap::new(),
            fallback: FallbackConfig::default(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
            simulation: SimulationConfig::default(),
        }
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Operating mode for the engine.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Production,
    Simulation,
    Hybrid,
}

impl Mode {
    pub fn is_simulation(&self) -> bool {
        matches!(self, Mode::Simulation)
    }

    pub fn is_hybrid(&self) -> bool {
        matches!(self, Mode::Hybrid)
    }
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "production" => Ok(Mode::Production),
            "simulation" => Ok(Mode::Simulation),
            "hybrid" => Ok(Mode::Hybrid),
            other => Err(format!("unknown mode: {}", other)),
        }
    }
}

/// Control cycle cadence and horizon discretisation.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_cadence")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub cadence: Duration,
    /// Fraction of the cadence available to a cycle before it is aborted.
    #[serde(default = "default_deadline_fraction")]
    pub deadline_fraction: f64,
    #[serde(default = "default_horizon")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub horizon: Duration,
    #[serde(default = "default_bucket")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub bucket: Duration,
    /// Stop after this many cycles (tests and bounded demo runs).
    #[serde(default)]
    pub max_cycles: Option<u64>,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.cadence.is_zero() || self.bucket.is_zero() {
            return Err(anyhow!("engine cadence and bucket must be non-zero"));
        }
        if self.bucket > self.horizon {
            return Err(anyhow!("engine bucket must not exceed the horizon"));
        }
        if !(0.0..=1.0).contains(&self.deadline_fraction) || self.deadline_fraction == 0.0 {
            return Err(anyhow!("deadline_fraction must be in (0, 1]"));
        }
        Ok(())
    }

    /// Number of buckets covering the configured horizon.
    pub fn bucket_count(&self) -> usize {
        (self.horizon.as_secs() / self.bucket.as_secs()).max(1) as usize
    }

    /// Wall-clock budget granted to a single cycle.
    pub fn cycle_deadline(&self) -> Duration {
        self.cadence.mul_f64(self.deadline_fraction)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cadence: default_cadence(),
            deadline_fraction: default_deadline_fraction(),
            horizon: default_horizon(),
            bucket: default_bucket(),
            max_cycles: None,
        }
    }
}

/// Sampling grid and data-quality windows for the telemetry normalizer.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_tick")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub tick: Duration,
    #[serde(default = "default_lookback")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub lookback: Duration,
    /// Gaps up to this length are linearly interpolated; beyond it samples
    /// are held stale with decaying confidence.
    #[serde(default = "default_max_gap")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub max_gap: Duration,
    /// e-folding time for the confidence of held stale samples.
    #[serde(default = "default_stale_decay")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub stale_decay: Duration,
    #[serde(default = "default_retention")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub retention: Duration,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            tick: default_tick(),
            lookback: default_lookback(),
            max_gap: default_max_gap(),
            stale_decay: default_stale_decay(),
            retention: default_retention(),
        }
    }
}

/// State estimator tuning.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EstimatorConfig {
    /// Single-pole correction gain pulling the propagated SOC toward the
    /// latest direct reading. 0 ignores readings, 1 trusts them outright.
    #[serde(default = "default_correction_gain")]
    pub correction_gain: f64,
    /// Window over which fault/derate flags reduce available capacity.
    #[serde(default = "default_derate_window")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub derate_window: Duration,
}

impl EstimatorConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.correction_gain) {
            return Err(anyhow!("estimator correction_gain must be in [0, 1]"));
        }
        Ok(())
    }
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            correction_gain: default_correction_gain(),
            derate_window: default_derate_window(),
        }
    }
}

/// Forecast strategy tuning.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForecastConfig {
    /// Below this many valid history samples the seasonal model yields to
    /// the naive persistence fallback.
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
    #[serde(default = "default_seasonal_weight")]
    pub seasonal_weight: f64,
    #[serde(default = "default_trend_weight")]
    pub trend_weight: f64,
    /// Two-sided confidence level of the uncertainty band.
    #[serde(default = "default_confidence_level")]
    pub confidence_level: f64,
    /// Per-bucket fractional widening of the band with horizon distance.
    #[serde(default = "default_band_widening")]
    pub band_widening: f64,
    #[serde(default = "default_trend_window")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub trend_window: Duration,
}

impl ForecastConfig {
    pub fn validate(&self) -> Result<()> {
        if self.seasonal_weight + self.trend_weight <= 0.0 {
            return Err(anyhow!("forecast weights must sum to a positive value"));
        }
        if !(0.0..1.0).contains(&self.confidence_level) || self.confidence_level == 0.0 {
            return Err(anyhow!("forecast confidence_level must be in (0, 1)"));
        }
        if self.band_widening < 0.0 {
            return Err(anyhow!("forecast band_widening must be non-negative"));
        }
        Ok(())
    }
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            min_samples: default_min_samples(),
            seasonal_weight: default_seasonal_weight(),
            trend_weight: default_trend_weight(),
            confidence_level: default_confidence_level(),
            band_widening: default_band_widening(),
            trend_window: default_trend_window(),
        }
    }
}

/// Global cost coefficients; per-source costs live on [`SourceConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostConfig {
    /// Credit per kWh of dispatched renewable energy.
    #[serde(default = "default_renewable_credit")]
    pub renewable_credit_per_kwh: f64,
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            renewable_credit_per_kwh: default_renewable_credit(),
        }
    }
}

/// Category of a dispatchable source.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Grid,
    Battery,
    Renewable,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Grid => "grid",
            SourceKind::Battery => "battery",
            SourceKind::Renewable => "renewable",
        }
    }
}

/// One dispatchable source (grid intertie, battery bank, renewable array).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub kind: SourceKind,
    /// Nameplate capacity in kW.
    pub capacity_kw: f64,
    /// Maximum allocation change between consecutive plan buckets, in kW.
    pub ramp_kw_per_bucket: f64,
    /// Marginal cost per kWh dispatched. For batteries this is the
    /// degradation cost and applies to charge and discharge alike.
    #[serde(default)]
    pub cost_per_kwh: f64,
    #[serde(default)]
    pub battery: Option<BatteryConfig>,
}

impl SourceConfig {
    pub fn validate(&self, source_id: &str) -> Result<()> {
        if self.capacity_kw <= 0.0 {
            return Err(anyhow!(
                "source '{}' must declare a positive capacity_kw",
                source_id
            ));
        }
        if self.ramp_kw_per_bucket <= 0.0 {
            return Err(anyhow!(
                "source '{}' must declare a positive ramp_kw_per_bucket",
                source_id
            ));
        }
        match (self.kind, &self.battery) {
            (SourceKind::Battery, None) => Err(anyhow!(
                "battery source '{}' requires a [sources.{}.battery] table",
                source_id,
                source_id
            )),
            (SourceKind::Battery, Some(battery)) => battery.validate(source_id),
            (_, Some(_)) => Err(anyhow!(
                "source '{}' is not a battery but declares battery parameters",
                source_id
            )),
            _ => Ok(()),
        }
    }
}

/// Storage parameters for a battery source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatteryConfig {
    pub capacity_kwh: f64,
    pub min_soc: f64,
    pub max_soc: f64,
    /// Round-trip efficiency, applied on charge.
    pub round_trip_efficiency: f64,
    pub initial_soc: f64,
    /// Maximum charging power in kW (drawn as negative allocation).
    pub max_charge_kw: f64,
}

impl BatteryConfig {
    pub fn validate(&self, source_id: &str) -> Result<()> {
        if self.capacity_kwh <= 0.0 {
            return Err(anyhow!(
                "battery '{}' must declare a positive capacity_kwh",
                source_id
            ));
        }
        if !(0.0..=1.0).contains(&self.min_soc)
            || !(0.0..=1.0).contains(&self.max_soc)
            || self.min_soc >= self.max_soc
        {
            return Err(anyhow!(
                "battery '{}' SOC bounds must satisfy 0 <= min_soc < max_soc <= 1",
                source_id
            ));
        }
        if !(0.0..=1.0).contains(&self.round_trip_efficiency) || self.round_trip_efficiency == 0.0 {
            return Err(anyhow!(
                "battery '{}' round_trip_efficiency must be in (0, 1]",
                source_id
            ));
        }
        if !(0.0..=1.0).contains(&self.initial_soc) {
            return Err(anyhow!("battery '{}' initial_soc must be in [0, 1]", source_id));
        }
        if self.max_charge_kw < 0.0 {
            return Err(anyhow!(
                "battery '{}' max_charge_kw must be non-negative",
                source_id
            ));
        }
        Ok(())
    }
}

/// Fallback planning behaviour when a cycle stage fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackConfig {
    /// Permit the static priority-order heuristic when no previous plan
    /// exists. Disabling this makes such cycles fail outright.
    #[serde(default = "default_enable_heuristic")]
    pub enable_heuristic: bool,
    /// Demand assumption for the heuristic when no telemetry is usable.
    #[serde(default)]
    pub assumed_demand_kw: Option<f64>,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            enable_heuristic: default_enable_heuristic(),
            assumed_demand_kw: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    /// Directory for the JSONL cycle report log.
    #[serde(default = "default_report_directory")]
    pub report_directory: PathBuf,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            report_directory: default_report_directory(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    #[serde(default)]
    pub enable_randomized_inputs: bool,
    #[serde(default = "default_simulation_seed")]
    pub random_seed: u64,
    #[serde(default)]
    pub force_mode: Option<Mode>,
    /// Interval between generated telemetry readings; defaults to the
    /// telemetry tick when unset.
    #[serde(default)]
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    pub feed_interval: Option<Duration>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            enable_randomized_inputs: false,
            random_seed: default_simulation_seed(),
            force_mode: None,
            feed_interval: None,
        }
    }
}
