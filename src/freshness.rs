//! Read-time freshness for current rows and forecasts.
//!
//! Freshness is separate from storage expiry: a record inside its TTL can
//! still be reported stale, and reads never delete anything.

use crate::clock::Clock;
use crate::record::{CanonicalRow, ForecastVector};
use crate::repository::{CiRepository, RepositoryError};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;

/// A record together with how old it was when read.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Fresh<T> {
    pub value: T,
    pub is_fresh: bool,
    pub age_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct FreshnessGate {
    repository: Arc<dyn CiRepository>,
    clock: Arc<dyn Clock>,
    current_max_age: Duration,
    forecast_max_age: Duration,
}

impl FreshnessGate {
    pub fn new(
        repository: Arc<dyn CiRepository>,
        clock: Arc<dyn Clock>,
        current_max_age: Duration,
        forecast_max_age: Duration,
    ) -> Self {
        Self {
            repository,
            clock,
            current_max_age,
            forecast_max_age,
        }
    }

    /// Current row for `camera_id`, judged against `max_age_seconds` or the
    /// configured current-state budget.
    pub fn current_with_freshness(
        &self,
        camera_id: &str,
        max_age_seconds: Option<u64>,
    ) -> Result<Option<Fresh<CanonicalRow>>, RepositoryError> {
        let max_age = max_age_seconds.unwrap_or(self.current_max_age.as_secs());
        let row = self.repository.get_now(camera_id)?;
        Ok(row.map(|row| {
            let captured_at = row.captured_at;
            self.judge(row, captured_at, max_age)
        }))
    }

    /// Forecast for `camera_id`, judged on `computed_at`.
    pub fn forecast_with_freshness(
        &self,
        camera_id: &str,
        max_age_seconds: Option<u64>,
    ) -> Result<Option<Fresh<ForecastVector>>, RepositoryError> {
        let max_age = max_age_seconds.unwrap_or(self.forecast_max_age.as_secs());
        let forecast = self.repository.get_forecast(camera_id)?;
        Ok(forecast.map(|forecast| {
            let computed_at = forecast.computed_at;
            self.judge(forecast, computed_at, max_age)
        }))
    }

    /// Whether a row already in hand is within the current-state budget.
    pub fn is_current_fresh(&self, row: &CanonicalRow) -> bool {
        age_seconds(self.clock.now(), row.captured_at) <= self.current_max_age.as_secs()
    }

    fn judge<T>(&self, value: T, stamped_at: OffsetDateTime, max_age: u64) -> Fresh<T> {
        let age = age_seconds(self.clock.now(), stamped_at);
        Fresh {
            value,
            is_fresh: age <= max_age,
            age_seconds: age,
        }
    }
}

/// Whole seconds elapsed since `stamped_at`. Timestamps in the future count as age 0.
pub fn age_seconds(now: OffsetDateTime, stamped_at: OffsetDateTime) -> u64 {
    let elapsed = (now - stamped_at).whole_seconds();
    u64::try_from(elapsed).unwrap_or(0)
}
