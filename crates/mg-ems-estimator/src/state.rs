//! ---
//! ems_section: "04-state-estimation"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "System state estimation and snapshot management."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use mg_ems_common::config::AppConfig;

/// The dispatch command step most recently handed to actuation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppliedStep {
    pub cycle_id: u64,
    pub applied_at: DateTime<Utc>,
    /// Commanded allocation per source in kW; negative battery values
    /// denote charging.
    pub allocation_kw: IndexMap<String, f64>,
}

/// Immutable best estimate of the microgrid state at one control cycle.
///
/// Exactly one current instance exists per cycle; every cycle produces a new
/// snapshot superseding the previous one. Downstream stages hold read-only
/// references.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemState {
    pub timestamp: DateTime<Utc>,
    /// State of charge per battery source, 0..1.
    pub soc: IndexMap<String, f64>,
    /// Confidence in each SOC estimate, 0..1.
    pub soc_confidence: IndexMap<String, f64>,
    /// Dispatchable capacity per source after fault/derate reductions, kW.
    pub available_kw: IndexMap<String, f64>,
    /// Step whose energy has already been integrated into `soc`.
    pub last_integrated_cycle: Option<u64>,
    /// Step currently being applied by actuation.
    pub last_applied: Option<AppliedStep>,
    /// Sources without usable telemetry this cycle.
    pub missing_sources: Vec<String>,
}

impl SystemState {
    /// Bootstrap state before the first cycle, from configured nameplates
    /// and initial SOC values.
    pub fn initial(config: &AppConfig, now: DateTime<Utc>) -> Self {
        let mut soc = IndexMap::new();
        let mut soc_confidence = IndexMap::new();
        let mut available_kw = IndexMap::new();
        for (source_id, source) in &config.sources {
            available_kw.insert(source_id.clone(), source.capacity_kw);
            if let Some(battery) = &source.battery {
                soc.insert(source_id.clone(), battery.initial_soc);
                soc_confidence.insert(source_id.clone(), 1.0);
            }
        }
        Self {
            timestamp: now,
            soc,
            soc_confidence,
            available_kw,
            last_integrated_cycle: None,
            last_applied: None,
            missing_sources: Vec::new(),
        }
    }

    pub fn soc_of(&self, source_id: &str) -> Option<f64> {
        self.soc.get(source_id).copied()
    }

    pub fn available_of(&self, source_id: &str) -> Option<f64> {
        self.available_kw.get(source_id).copied()
    }

    /// Whether any telemetry-quality degradation affects this snapshot.
    pub fn is_degraded(&self) -> bool {
        !self.missing_sources.is_empty()
            || self.soc_confidence.values().any(|confidence| *confidence < 0.5)
    }

    /// Produce the successor snapshot recording the step handed to
    /// actuation this cycle.
    pub fn with_applied(&self, step: AppliedStep) -> Self {
        let mut next = self.clone();
        next.last_applied = Some(step);
        next
    }
}
