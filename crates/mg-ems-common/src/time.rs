//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the engine runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::time::Duration;

use chrono::{DateTime, DurationRound, TimeDelta, Utc};

/// Floor-align a timestamp onto the sampling grid.
pub fn align_to_tick(timestamp: DateTime<Utc>, tick: Duration) -> DateTime<Utc> {
    let delta = TimeDelta::from_std(tick).unwrap_or(TimeDelta::seconds(60));
    timestamp.duration_trunc(delta).unwrap_or(timestamp)
}

/// Convert a std duration into a chrono delta, saturating at one minute on
/// out-of-range input.
pub fn to_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::seconds(60))
}

/// Fractional hours covered by a duration, for kW·h energy arithmetic.
pub fn duration_hours(duration: Duration) -> f64 {
    duration.as_secs_f64() / 3600.0
}
