//! ---
//! ems_section: "11-simulation-test-harness"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Simulation runtime helpers and telemetry feed engines."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::HashSet;
use std::f64::consts::PI;
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use indexmap::IndexMap;
use rand::prelude::*;
use rand_distr::Normal;
use tracing::debug;

use mg_ems_common::config::{AppConfig, SourceKind};
use mg_ems_common::time::{duration_hours, to_delta};
use mg_ems_telemetry::{Reading, SourceFlag};

/// Source id the simulated feeder load reports under.
pub const LOAD_SOURCE_ID: &str = "feeder";

const BASE_LOAD_KW: f64 = 5.0;
const LOAD_SWING_KW: f64 = 2.0;

/// Generates a deterministic telemetry stream for the configured microgrid.
#[derive(Debug)]
pub struct FeedEngine {
    rng: StdRng,
    noise: Normal<f64>,
    renewables: Vec<(String, f64)>,
    batteries: IndexMap<String, SimBattery>,
    stalled_until: Option<DateTime<Utc>>,
    faulted: HashSet<String>,
    demand_multiplier: f64,
    last_observation: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct SimBattery {
    capacity_kwh: f64,
    round_trip_efficiency: f64,
    soc: f64,
    commanded_kw: f64,
}

impl FeedEngine {
    pub fn new(config: &AppConfig, seed: u64) -> Self {
        let mut renewables = Vec::new();
        let mut batteries = IndexMap::new();
        for (source_id, source) in &config.sources {
            match source.kind {
                SourceKind::Renewable => {
                    renewables.push((source_id.clone(), source.capacity_kw));
                }
                SourceKind::Battery => {
                    if let Some(battery) = &source.battery {
                        batteries.insert(
                            source_id.clone(),
                            SimBattery {
                                capacity_kwh: battery.capacity_kwh,
                                round_trip_efficiency: battery.round_trip_efficiency,
                                soc: battery.initial_soc,
                                commanded_kw: 0.0,
                            },
                        );
                    }
                }
                SourceKind::Grid => {}
            }
        }
        Self {
            rng: StdRng::seed_from_u64(seed),
            noise: Normal::new(0.0, 0.15).expect("sigma must be positive"),
            renewables,
            batteries,
            stalled_until: None,
            faulted: HashSet::new(),
            demand_multiplier: 1.0,
            last_observation: None,
        }
    }

    /// Produce the readings arriving at `now`. Empty while the feed is
    /// stalled.
    pub fn readings_at(&mut self, now: DateTime<Utc>) -> Vec<Reading> {
        if let Some(until) = self.stalled_until {
            if now < until {
                return Vec::new();
            }
            self.stalled_until = None;
            debug!(%now, "telemetry feed resumed");
        }
        self.advance_batteries(now);

        let mut readings = Vec::new();
        let load = (self.diurnal_load(now) * self.demand_multiplier + self.noise_sample()).max(0.0);
        readings.push(Reading::load(LOAD_SOURCE_ID, now, load));

        for (source_id, capacity_kw) in &self.renewables {
            let irradiance = irradiance_fraction(now);
            let output = if irradiance > 0.0 {
                (capacity_kw * irradiance + self.noise.sample(&mut self.rng) * 0.1)
                    .clamp(0.0, *capacity_kw)
            } else {
                0.0
            };
            let mut reading = Reading::generation(source_id, now, output);
            if self.faulted.contains(source_id) {
                reading = reading.with_flag(SourceFlag::Fault);
            }
            readings.push(reading);
        }

        for (source_id, battery) in &self.batteries {
            let mut reading = Reading::soc(source_id, now, battery.soc);
            if self.faulted.contains(source_id) {
                reading = reading.with_flag(SourceFlag::Fault);
            }
            readings.push(reading);
        }

        readings
    }

    /// Record the allocation the engine applied, so the simulated battery
    /// SOC follows the commanded dispatch.
    pub fn observe_allocation(&mut self, allocation_kw: &IndexMap<String, f64>) {
        for (source_id, battery) in self.batteries.iter_mut() {
            battery.commanded_kw = allocation_kw.get(source_id).copied().unwrap_or(0.0);
        }
    }

    /// Suspend the feed until `now + duration`, simulating a gateway stall.
    pub fn stall_for(&mut self, now: DateTime<Utc>, duration: Duration) {
        self.stalled_until = Some(now + to_delta(duration));
        debug!(%now, seconds = duration.as_secs(), "telemetry feed stalled");
    }

    pub fn inject_fault(&mut self, source_id: &str) {
        self.faulted.insert(source_id.to_owned());
    }

    pub fn clear_fault(&mut self, source_id: &str) {
        self.faulted.remove(source_id);
    }

    /// Scale the simulated demand, e.g. to provoke infeasible coverage.
    pub fn set_demand_multiplier(&mut self, multiplier: f64) {
        self.demand_multiplier = multiplier.max(0.0);
    }

    fn diurnal_load(&self, now: DateTime<Utc>) -> f64 {
        let hour = now.hour() as f64 + now.minute() as f64 / 60.0;
        // Morning ramp, evening peak around 19:00.
        BASE_LOAD_KW + LOAD_SWING_KW * (2.0 * PI * (hour - 13.0) / 24.0).sin()
    }

    fn advance_batteries(&mut self, now: DateTime<Utc>) {
        let elapsed = self
            .last_observation
            .map(|last| (now - last).to_std().unwrap_or(Duration::ZERO))
            .unwrap_or(Duration::ZERO);
        self.last_observation = Some(now);
        let hours = duration_hours(elapsed);
        if hours <= 0.0 {
            return;
        }
        for battery in self.batteries.values_mut() {
            let delta = if battery.commanded_kw >= 0.0 {
                -(battery.commanded_kw * hours) / battery.capacity_kwh
            } else {
                (-battery.commanded_kw * hours * battery.round_trip_efficiency)
                    / battery.capacity_kwh
            };
            battery.soc = (battery.soc + delta).clamp(0.0, 1.0);
        }
    }

    fn noise_sample(&mut self) -> f64 {
        self.noise.sample(&mut self.rng)
    }
}

/// Clear-sky production fraction by time of day.
fn irradiance_fraction(now: DateTime<Utc>) -> f64 {
    let hour = now.hour() as f64 + now.minute() as f64 / 60.0;
    if !(6.0..=18.0).contains(&hour) {
        return 0.0;
    }
    (PI * (hour - 6.0) / 12.0).sin().max(0.0)
}
