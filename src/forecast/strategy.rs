//! Forecast strategy trait.
//!
//! A strategy turns the current canonical row of one camera into a forecast
//! vector covering every configured horizon. Strategies are built once by
//! [`crate::forecast::create_strategy`] and shared across the forecast cycle.

use crate::forecast::ForecastError;
use crate::record::{CanonicalRow, ForecastVector};

pub trait ForecastStrategy: Send + Sync + std::fmt::Debug {
    /// Produce one prediction per configured horizon, `NaN` where the
    /// strategy has no prediction.
    fn generate_forecast(&self, row: &CanonicalRow) -> Result<ForecastVector, ForecastError>;

    /// Whether the strategy's artifacts are loaded and usable.
    fn is_available(&self) -> bool;

    fn strategy_name(&self) -> &str;
}
