use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::AppError;
use crate::forecast::{ForecastStrategy, create_strategy};
use crate::freshness::FreshnessGate;
use crate::record::HorizonSchedule;
use crate::repository::{CiRepository, open_repository};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::watch;

/// Outcome of one forecast cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    /// Current rows returned by the bulk scan.
    pub scanned: usize,
    pub forecasted: usize,
    /// Rows older than the current-state budget, left without a new forecast.
    pub stale_skipped: usize,
    pub failed: usize,
    /// The bulk scan stopped early or skipped undecodable rows.
    pub degraded: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineSettings {
    pub schedule: HorizonSchedule,
    pub current_ttl_secs: u64,
    pub forecast_ttl_secs: u64,
    pub search_radius_km: f64,
}

/// Everything the forecast cycle and route lookups need, built once at startup.
#[derive(Debug)]
pub struct CiContext {
    repository: Arc<dyn CiRepository>,
    strategy: Arc<dyn ForecastStrategy>,
    gate: FreshnessGate,
    clock: Arc<dyn Clock>,
    settings: PipelineSettings,
    cycle_tx: watch::Sender<Option<CycleReport>>,
}

impl CiContext {
    pub fn new(
        repository: Arc<dyn CiRepository>,
        strategy: Arc<dyn ForecastStrategy>,
        clock: Arc<dyn Clock>,
        current_max_age: Duration,
        forecast_max_age: Duration,
        settings: PipelineSettings,
    ) -> Self {
        let gate = FreshnessGate::new(
            Arc::clone(&repository),
            Arc::clone(&clock),
            current_max_age,
            forecast_max_age,
        );
        let (cycle_tx, _cycle_rx) = watch::channel(None);
        Self {
            repository,
            strategy,
            gate,
            clock,
            settings,
            cycle_tx,
        }
    }

    /// Open the configured backend and strategy against the system clock.
    pub fn from_config(config: &Config) -> Result<Self, AppError> {
        Self::from_config_with_clock(config, Arc::new(SystemClock))
    }

    pub fn from_config_with_clock(
        config: &Config,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, AppError> {
        let repository = open_repository(&config.repository_settings(), Arc::clone(&clock))?;
        let strategy = create_strategy(&config.forecast_settings(), Arc::clone(&clock))?;
        let settings = PipelineSettings {
            schedule: config.horizon_schedule(),
            current_ttl_secs: config.current_ttl_secs(),
            forecast_ttl_secs: config.forecast_ttl_secs(),
            search_radius_km: config.search_radius_km(),
        };
        Ok(Self::new(
            repository,
            strategy,
            clock,
            config.current_max_age(),
            config.forecast_max_age(),
            settings,
        ))
    }

    pub fn repository(&self) -> &dyn CiRepository {
        self.repository.as_ref()
    }

    pub fn strategy(&self) -> &dyn ForecastStrategy {
        self.strategy.as_ref()
    }

    pub fn gate(&self) -> &FreshnessGate {
        &self.gate
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn last_cycle(&self) -> Option<CycleReport> {
        self.cycle_tx.borrow().clone()
    }

    pub fn subscribe_cycles(&self) -> watch::Receiver<Option<CycleReport>> {
        self.cycle_tx.subscribe()
    }

    /// Publish even when nobody is subscribed; the value stays readable via `last_cycle`.
    pub fn publish_cycle(&self, report: CycleReport) {
        self.cycle_tx.send_replace(Some(report));
    }
}
