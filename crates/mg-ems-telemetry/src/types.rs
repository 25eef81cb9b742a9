//! ---
//! ems_section: "02-telemetry-normalization"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Telemetry ingestion and normalization pipeline."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Physical quantity carried by a reading.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum QuantityKind {
    Load,
    Generation,
    Soc,
}

impl QuantityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuantityKind::Load => "load",
            QuantityKind::Generation => "generation",
            QuantityKind::Soc => "soc",
        }
    }
}

impl fmt::Display for QuantityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Engineering unit of a reading value.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Unit {
    #[default]
    Kilowatts,
    /// Dimensionless 0..1 fraction (state of charge).
    Fraction,
}

/// Health annotation attached to a reading by the field gateway.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase", tag = "flag", content = "value")]
pub enum SourceFlag {
    /// Source is faulted and must not be dispatched.
    Fault,
    /// Source capacity is reduced to the given fraction of nameplate.
    Derate(f64),
}

/// One raw telemetry record as delivered by the inbound feed.
///
/// Immutable once ingested; timestamps must be monotonically non-decreasing
/// per source, which the normalizer enforces by dropping regressions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Reading {
    pub source_id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: QuantityKind,
    pub value: f64,
    #[serde(default)]
    pub unit: Unit,
    #[serde(default)]
    pub flag: Option<SourceFlag>,
}

impl Reading {
    pub fn load(source_id: &str, timestamp: DateTime<Utc>, kw: f64) -> Self {
        Self {
            source_id: source_id.to_owned(),
            timestamp,
            kind: QuantityKind::Load,
            value: kw,
            unit: Unit::Kilowatts,
            flag: None,
        }
    }

    pub fn generation(source_id: &str, timestamp: DateTime<Utc>, kw: f64) -> Self {
        Self {
            source_id: source_id.to_owned(),
            timestamp,
            kind: QuantityKind::Generation,
            value: kw,
            unit: Unit::Kilowatts,
            flag: None,
        }
    }

    pub fn soc(source_id: &str, timestamp: DateTime<Utc>, fraction: f64) -> Self {
        Self {
            source_id: source_id.to_owned(),
            timestamp,
            kind: QuantityKind::Soc,
            value: fraction,
            unit: Unit::Fraction,
            flag: None,
        }
    }

    pub fn with_flag(mut self, flag: SourceFlag) -> Self {
        self.flag = Some(flag);
        self
    }
}

/// Provenance of a grid-aligned sample value.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SampleValidity {
    /// A reading landed within one grid tick of this point.
    Measured,
    /// Filled across a gap no longer than the configured maximum.
    Interpolated,
    /// Last known value held beyond the maximum gap.
    Stale,
}

/// A reading resampled onto the fixed grid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NormalizedSample {
    pub source_id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: QuantityKind,
    pub value: f64,
    pub validity: SampleValidity,
    /// 0..1 weight downstream consumers apply to this value.
    pub confidence: f64,
    #[serde(default)]
    pub flag: Option<SourceFlag>,
}

impl NormalizedSample {
    pub fn is_stale(&self) -> bool {
        self.validity == SampleValidity::Stale
    }
}
