//! Persistence forecast.
//!
//! Formula: `ci(h) = mean + (ci - mean) * exp(-h / decay_minutes)`
//!
//! Without a rolling mean the current CI is repeated at every horizon.

use crate::clock::Clock;
use crate::forecast::{ForecastError, ForecastStrategy};
use crate::record::{CanonicalRow, ForecastVector, HorizonSchedule};
use std::sync::Arc;

pub const BASELINE_MODEL_VERSION: &str = "baseline-v1";

#[derive(Debug, Clone)]
pub struct BaselineStrategy {
    schedule: HorizonSchedule,
    decay_minutes: f64,
    clock: Arc<dyn Clock>,
}

impl BaselineStrategy {
    pub fn new(schedule: HorizonSchedule, decay_minutes: f64, clock: Arc<dyn Clock>) -> Self {
        Self {
            schedule,
            decay_minutes,
            clock,
        }
    }

    fn predict(&self, ci: f64, mean: Option<f64>, horizon_minutes: u32) -> f64 {
        let value = match mean {
            Some(mean) => {
                let weight = (-f64::from(horizon_minutes) / self.decay_minutes).exp();
                mean + (ci - mean) * weight
            }
            None => ci,
        };
        value.max(0.0)
    }
}

impl ForecastStrategy for BaselineStrategy {
    fn generate_forecast(&self, row: &CanonicalRow) -> Result<ForecastVector, ForecastError> {
        row.validate().map_err(ForecastError::InvalidInput)?;
        let mean = row
            .history
            .ci_roll_mean
            .filter(|mean| mean.is_finite() && *mean >= 0.0);

        Ok(ForecastVector::from_fn(
            row.camera_id.clone(),
            self.clock.now(),
            &self.schedule,
            BASELINE_MODEL_VERSION,
            |horizon| Some(self.predict(row.ci, mean, horizon)),
        ))
    }

    fn is_available(&self) -> bool {
        true
    }

    fn strategy_name(&self) -> &str {
        "simple"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::record::{DetectionFeatures, HistoryFeatures};
    use time::macros::datetime;

    fn strategy() -> BaselineStrategy {
        let clock = Arc::new(ManualClock::new(datetime!(2026-01-11 08:05:00 UTC)));
        BaselineStrategy::new(HorizonSchedule::default(), 60.0, clock)
    }

    fn row(ci: f64) -> CanonicalRow {
        CanonicalRow::new(
            "1701",
            datetime!(2026-01-11 08:04:30 UTC),
            DetectionFeatures {
                image_width: 1920,
                image_height: 1080,
                vehicle_count: 9,
                weighted_vehicle_count: 11.0,
                occupied_area_ratio: 0.2,
                motion_score: 0.5,
            },
            ci,
            "det-v3",
        )
    }

    #[test]
    fn zero_history_repeats_current_ci() -> Result<(), ForecastError> {
        let forecast = strategy().generate_forecast(&row(0.5))?;

        assert_eq!(forecast.points.len(), 60);
        assert!(forecast.points.iter().all(|point| point.ci == 0.5));
        assert!(forecast.missing_horizons().is_empty());
        assert_eq!(forecast.model_version, BASELINE_MODEL_VERSION);
        assert_eq!(forecast.computed_at, datetime!(2026-01-11 08:05:00 UTC));
        Ok(())
    }

    #[test]
    fn decays_toward_rolling_mean() -> Result<(), ForecastError> {
        let row = row(0.8).with_history(HistoryFeatures {
            ci_roll_mean: Some(0.3),
            ..HistoryFeatures::default()
        });

        let forecast = strategy().generate_forecast(&row)?;

        let values: Vec<f64> = forecast.points.iter().map(|point| point.ci).collect();
        assert!(values.windows(2).all(|pair| pair[1] <= pair[0]));
        assert!(values.iter().all(|value| (0.3..=0.8).contains(value)));
        let expected = 0.3 + 0.5 * (-1.0_f64).exp();
        assert!((forecast.value_at(60).unwrap_or(f64::NAN) - expected).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn stays_within_unit_interval_for_mid_ci() -> Result<(), ForecastError> {
        let row = row(0.5).with_history(HistoryFeatures {
            ci_roll_mean: Some(0.9),
            ..HistoryFeatures::default()
        });

        let forecast = strategy().generate_forecast(&row)?;

        assert!(forecast.points.iter().all(|point| (0.0..=1.0).contains(&point.ci)));
        Ok(())
    }

    #[test]
    fn non_finite_mean_is_ignored() -> Result<(), ForecastError> {
        let row = row(0.4).with_history(HistoryFeatures {
            ci_roll_mean: Some(f64::NAN),
            ..HistoryFeatures::default()
        });

        let forecast = strategy().generate_forecast(&row)?;

        assert!(forecast.points.iter().all(|point| point.ci == 0.4));
        Ok(())
    }

    #[test]
    fn negative_ci_is_invalid_input() {
        let result = strategy().generate_forecast(&row(-0.1));

        assert!(matches!(result, Err(ForecastError::InvalidInput(_))));
    }
}
