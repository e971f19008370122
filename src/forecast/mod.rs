use crate::clock::Clock;
use crate::config::ForecastSettings;
use crate::record::{CanonicalRow, ForecastVector};
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

pub mod baseline;
pub mod boosted;
pub mod strategy;

pub use baseline::BaselineStrategy;
pub use boosted::{BoostedTreeStrategy, ModelBundle, ModelLoadError};
pub use strategy::ForecastStrategy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    Simple,
    Model,
    Auto,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StrategyKind::Simple => "simple",
            StrategyKind::Model => "model",
            StrategyKind::Auto => "auto",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum ForecastError {
    #[error("forecast strategy unavailable: {0}")]
    StrategyUnavailable(String),
    #[error("{strategy} strategy is missing features: {}", features.join(", "))]
    MissingFeatures {
        strategy: String,
        features: Vec<String>,
    },
    #[error("invalid forecast input: {0}")]
    InvalidInput(String),
}

// Strategy Factory
pub fn create_strategy(
    settings: &ForecastSettings,
    clock: Arc<dyn Clock>,
) -> Result<Arc<dyn ForecastStrategy>, ForecastError> {
    settings
        .schedule
        .validate()
        .map_err(ForecastError::InvalidInput)?;
    if !settings.decay_minutes.is_finite() || settings.decay_minutes <= 0.0 {
        return Err(ForecastError::InvalidInput(format!(
            "decay_minutes must be > 0, got {}",
            settings.decay_minutes
        )));
    }

    let baseline: Arc<dyn ForecastStrategy> = Arc::new(BaselineStrategy::new(
        settings.schedule,
        settings.decay_minutes,
        clock.clone(),
    ));

    let strategy: Arc<dyn ForecastStrategy> = match settings.strategy {
        StrategyKind::Simple => baseline,
        StrategyKind::Model => Arc::new(load_model(settings, clock)?),
        StrategyKind::Auto => match load_model(settings, clock) {
            Ok(model) => Arc::new(FallbackStrategy::new(Arc::new(model), baseline)),
            Err(err) => {
                warn!(error = %err, "Model strategy unavailable, using baseline");
                baseline
            }
        },
    };
    info!(
        configured = %settings.strategy,
        strategy = strategy.strategy_name(),
        "Forecast strategy selected"
    );
    Ok(strategy)
}

fn load_model(
    settings: &ForecastSettings,
    clock: Arc<dyn Clock>,
) -> Result<BoostedTreeStrategy, ForecastError> {
    let path = settings.model_path.as_ref().ok_or_else(|| {
        ForecastError::StrategyUnavailable("forecast.model_path is not set".to_string())
    })?;
    BoostedTreeStrategy::load(path, settings.schedule, clock).map_err(|err| {
        ForecastError::StrategyUnavailable(format!("{}: {err}", path.display()))
    })
}

/// Uses `primary` and retries with `fallback` when it fails to forecast.
///
/// Invalid rows are not retried since no strategy can forecast them.
#[derive(Debug)]
pub struct FallbackStrategy {
    primary: Arc<dyn ForecastStrategy>,
    fallback: Arc<dyn ForecastStrategy>,
}

impl FallbackStrategy {
    pub fn new(primary: Arc<dyn ForecastStrategy>, fallback: Arc<dyn ForecastStrategy>) -> Self {
        Self { primary, fallback }
    }
}

impl ForecastStrategy for FallbackStrategy {
    fn generate_forecast(&self, row: &CanonicalRow) -> Result<ForecastVector, ForecastError> {
        match self.primary.generate_forecast(row) {
            Ok(forecast) => Ok(forecast),
            Err(err @ ForecastError::InvalidInput(_)) => Err(err),
            Err(err) => {
                warn!(
                    camera_id = %row.camera_id,
                    error = %err,
                    fallback = self.fallback.strategy_name(),
                    "Primary forecast failed, falling back"
                );
                self.fallback.generate_forecast(row)
            }
        }
    }

    fn is_available(&self) -> bool {
        self.primary.is_available() || self.fallback.is_available()
    }

    fn strategy_name(&self) -> &str {
        "auto"
    }
}
