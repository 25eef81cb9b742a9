//! ---
//! ems_section: "05-forecasting"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Short-horizon demand and generation forecasting."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Probabilistic short-horizon forecasting for the MG-EMS engine.
//!
//! The forecast model sits behind the [`Forecaster`] trait so concrete
//! strategies (statistical, learned, hybrid) stay swappable. The shipped
//! [`SeasonalTrendForecaster`] blends hour-of-day seasonality with
//! short-term trend extrapolation; the [`NaivePersistenceForecaster`]
//! covers cold starts and recovers [`ForecastError::InsufficientHistory`].
//! Both are deterministic: identical inputs always produce identical
//! windows.

use std::time::Duration;

use thiserror::Error;

pub mod naive;
pub mod seasonal;
pub mod series;
pub mod window;

pub use naive::NaivePersistenceForecaster;
pub use seasonal::SeasonalTrendForecaster;
pub use series::{SampleSeries, SeriesPoint};
pub use window::{DerivationTag, ForecastBucket, ForecastWindow};

use mg_ems_estimator::SystemState;

pub type Result<T> = std::result::Result<T, ForecastError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ForecastError {
    /// Recoverable: callers revert to the naive persistence forecast.
    #[error("insufficient history: {available} of {required} required samples")]
    InsufficientHistory { available: usize, required: usize },
}

/// Pluggable forecast strategy contract.
pub trait Forecaster: Send + Sync {
    /// Produce a forecast window covering `horizon` in `bucket`-wide steps,
    /// starting at the state snapshot timestamp.
    fn forecast(
        &self,
        series: &SampleSeries,
        state: &SystemState,
        horizon: Duration,
        bucket: Duration,
    ) -> Result<ForecastWindow>;

    /// Strategy label recorded in the window derivation tag.
    fn name(&self) -> &'static str;
}
