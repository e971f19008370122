use crate::forecast::StrategyKind;
use crate::geo::DEFAULT_SEARCH_RADIUS_KM;
use crate::record::HorizonSchedule;
use crate::repository::{RepositoryBackend, RepositorySettings};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "config/config.toml";
pub const CONFIG_PATH_ENV: &str = "ROUTE_CONGESTION_CONFIG";
pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const DEFAULT_CURRENT_TTL_SECS: u64 = 600;
pub const DEFAULT_FORECAST_TTL_SECS: u64 = 600;
pub const DEFAULT_CURRENT_MAX_AGE_SECS: u64 = 300;
pub const DEFAULT_FORECAST_MAX_AGE_SECS: u64 = 600;
pub const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_DECAY_MINUTES: f64 = 60.0;
pub const DEFAULT_DATA_DIR: &str = "data/ci";
pub const DEFAULT_DATABASE_PATH: &str = "data/ci.duckdb";
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1/";
pub const DEFAULT_REDIS_TIMEOUT_MS: u64 = 500;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub app: AppSection,
    pub logging: LoggingSection,
    #[serde(default)]
    pub repository: Option<RepositorySection>,
    #[serde(default)]
    pub ttl: Option<TtlSection>,
    #[serde(default)]
    pub freshness: Option<FreshnessSection>,
    #[serde(default)]
    pub forecast: Option<ForecastSection>,
    #[serde(default)]
    pub matcher: Option<MatcherSection>,
    #[serde(default)]
    pub cameras: Option<CamerasSection>,
    #[serde(default)]
    pub pipeline: Option<PipelineSection>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppSection {
    pub name: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingSection {
    pub level: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RepositorySection {
    pub backend: RepositoryBackend,
    pub data_dir: Option<PathBuf>,
    pub database_path: Option<PathBuf>,
    pub redis_url: Option<String>,
    pub redis_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TtlSection {
    /// Storage expiry for current rows (default: 600)
    pub current_secs: Option<u64>,
    /// Storage expiry for forecast vectors (default: 600)
    pub forecast_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FreshnessSection {
    /// Read-time age budget for current rows (default: 300)
    pub current_max_age_secs: Option<u64>,
    /// Read-time age budget for forecasts (default: 600)
    pub forecast_max_age_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ForecastSection {
    pub strategy: StrategyKind,
    pub model_path: Option<PathBuf>,
    pub decay_minutes: Option<f64>,
    #[serde(default)]
    pub horizons: Option<HorizonSchedule>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MatcherSection {
    pub search_radius_km: Option<f64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CamerasSection {
    pub path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineSection {
    /// Interval between forecast cycles in seconds (default: 60)
    pub refresh_interval_secs: Option<u64>,
}

/// Resolved forecasting options handed to the strategy factory.
#[derive(Debug, Clone, PartialEq)]
pub struct ForecastSettings {
    pub strategy: StrategyKind,
    pub model_path: Option<PathBuf>,
    pub decay_minutes: f64,
    pub schedule: HorizonSchedule,
}

impl Default for ForecastSettings {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::Auto,
            model_path: None,
            decay_minutes: DEFAULT_DECAY_MINUTES,
            schedule: HorizonSchedule::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Load from `$ROUTE_CONGESTION_CONFIG`, falling back to `config/config.toml`.
pub fn load_default() -> Result<Config, ConfigError> {
    match std::env::var_os(CONFIG_PATH_ENV) {
        Some(path) if !path.is_empty() => load_from_path(PathBuf::from(path)),
        _ => load_from_path(DEFAULT_CONFIG_PATH),
    }
}

pub fn load_from_path(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    let config: Config = toml::from_str(&contents)?;
    config.validate()?;
    Ok(config)
}

impl Config {
    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(schedule) = self.forecast.as_ref().and_then(|f| f.horizons) {
            schedule.validate().map_err(ConfigError::Invalid)?;
        }
        let radius = self.search_radius_km();
        if !radius.is_finite() || radius <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "matcher.search_radius_km must be > 0, got {radius}"
            )));
        }
        if self.current_ttl_secs() == 0 || self.forecast_ttl_secs() == 0 {
            return Err(ConfigError::Invalid("ttl values must be > 0".to_string()));
        }
        if self.refresh_interval().is_zero() {
            return Err(ConfigError::Invalid(
                "pipeline.refresh_interval_secs must be > 0".to_string(),
            ));
        }
        let decay = self.forecast_settings().decay_minutes;
        if !decay.is_finite() || decay <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "forecast.decay_minutes must be > 0, got {decay}"
            )));
        }
        Ok(())
    }

    pub fn log_level(&self) -> &str {
        let level = self.logging.level.trim();
        if level.is_empty() {
            DEFAULT_LOG_LEVEL
        } else {
            level
        }
    }

    /// Returns the repository settings (default: file backend under `data/ci`)
    pub fn repository_settings(&self) -> RepositorySettings {
        let section = self.repository.as_ref();
        RepositorySettings {
            backend: section.map_or(RepositoryBackend::File, |s| s.backend),
            data_dir: section
                .and_then(|s| s.data_dir.clone())
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR)),
            database_path: section
                .and_then(|s| s.database_path.clone())
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATABASE_PATH)),
            redis_url: section
                .and_then(|s| s.redis_url.clone())
                .unwrap_or_else(|| DEFAULT_REDIS_URL.to_string()),
            redis_timeout: Duration::from_millis(
                section
                    .and_then(|s| s.redis_timeout_ms)
                    .unwrap_or(DEFAULT_REDIS_TIMEOUT_MS),
            ),
        }
    }

    pub fn current_ttl_secs(&self) -> u64 {
        self.ttl
            .as_ref()
            .and_then(|s| s.current_secs)
            .unwrap_or(DEFAULT_CURRENT_TTL_SECS)
    }

    pub fn forecast_ttl_secs(&self) -> u64 {
        self.ttl
            .as_ref()
            .and_then(|s| s.forecast_secs)
            .unwrap_or(DEFAULT_FORECAST_TTL_SECS)
    }

    pub fn current_max_age(&self) -> Duration {
        let secs = self
            .freshness
            .as_ref()
            .and_then(|s| s.current_max_age_secs)
            .unwrap_or(DEFAULT_CURRENT_MAX_AGE_SECS);
        Duration::from_secs(secs)
    }

    pub fn forecast_max_age(&self) -> Duration {
        let secs = self
            .freshness
            .as_ref()
            .and_then(|s| s.forecast_max_age_secs)
            .unwrap_or(DEFAULT_FORECAST_MAX_AGE_SECS);
        Duration::from_secs(secs)
    }

    pub fn forecast_settings(&self) -> ForecastSettings {
        let defaults = ForecastSettings::default();
        match &self.forecast {
            Some(section) => ForecastSettings {
                strategy: section.strategy,
                model_path: section
                    .model_path
                    .clone()
                    .filter(|path| !path.as_os_str().is_empty()),
                decay_minutes: section.decay_minutes.unwrap_or(defaults.decay_minutes),
                schedule: section.horizons.unwrap_or(defaults.schedule),
            },
            None => defaults,
        }
    }

    pub fn horizon_schedule(&self) -> HorizonSchedule {
        self.forecast_settings().schedule
    }

    /// Returns the default route search radius (default: 0.5 km)
    pub fn search_radius_km(&self) -> f64 {
        self.matcher
            .as_ref()
            .and_then(|s| s.search_radius_km)
            .unwrap_or(DEFAULT_SEARCH_RADIUS_KM)
    }

    pub fn cameras_path(&self) -> Option<&Path> {
        let path = self.cameras.as_ref()?.path.as_deref()?;
        if path.as_os_str().is_empty() {
            None
        } else {
            Some(path)
        }
    }

    /// Returns the forecast refresh interval (default: 60 seconds)
    pub fn refresh_interval(&self) -> Duration {
        let secs = self
            .pipeline
            .as_ref()
            .and_then(|s| s.refresh_interval_secs)
            .unwrap_or(DEFAULT_REFRESH_INTERVAL_SECS);
        Duration::from_secs(secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn write_temp(name: &str, contents: &str) -> Result<PathBuf, Box<dyn std::error::Error>> {
        let unique = SystemTime::now().duration_since(UNIX_EPOCH)?.as_nanos();
        let path = std::env::temp_dir().join(format!("ci-config-{name}-{unique}.toml"));
        fs::write(&path, contents)?;
        Ok(path)
    }

    const MINIMAL: &str = r#"
[app]
name = "route-congestion"

[logging]
level = "info"
"#;

    #[test]
    fn default_config_selects_auto_strategy() -> Result<(), Box<dyn std::error::Error>> {
        let config = load_from_path(DEFAULT_CONFIG_PATH)?;
        assert_eq!(config.forecast_settings().strategy, StrategyKind::Auto);
        assert!(config.cameras_path().is_some());
        Ok(())
    }

    #[test]
    fn minimal_config_uses_defaults() -> Result<(), Box<dyn std::error::Error>> {
        let path = write_temp("minimal", MINIMAL)?;

        let config = load_from_path(&path)?;
        let _ = fs::remove_file(&path);

        assert_eq!(config.repository_settings().backend, RepositoryBackend::File);
        assert_eq!(config.current_ttl_secs(), 600);
        assert_eq!(config.forecast_ttl_secs(), 600);
        assert_eq!(config.current_max_age(), Duration::from_secs(300));
        assert_eq!(config.forecast_max_age(), Duration::from_secs(600));
        assert_eq!(config.search_radius_km(), 0.5);
        assert_eq!(config.horizon_schedule(), HorizonSchedule::default());
        assert_eq!(config.refresh_interval(), Duration::from_secs(60));
        assert!(config.cameras_path().is_none());
        Ok(())
    }

    #[test]
    fn sections_override_defaults() -> Result<(), Box<dyn std::error::Error>> {
        let contents = format!(
            "{MINIMAL}{}",
            r#"
[repository]
backend = "relational"
database_path = "/tmp/ci.duckdb"

[freshness]
current_max_age_secs = 120

[forecast]
strategy = "simple"
model_path = ""

[forecast.horizons]
start = 5
end = 60
step = 5
"#
        );
        let path = write_temp("override", &contents)?;

        let config = load_from_path(&path)?;
        let _ = fs::remove_file(&path);

        let repository = config.repository_settings();
        assert_eq!(repository.backend, RepositoryBackend::Relational);
        assert_eq!(repository.database_path, PathBuf::from("/tmp/ci.duckdb"));
        assert_eq!(config.current_max_age(), Duration::from_secs(120));
        let forecast = config.forecast_settings();
        assert_eq!(forecast.strategy, StrategyKind::Simple);
        assert_eq!(forecast.model_path, None);
        assert_eq!(forecast.schedule.horizons().len(), 12);
        Ok(())
    }

    #[test]
    fn unknown_backend_returns_parse_error() -> Result<(), Box<dyn std::error::Error>> {
        let contents = format!("{MINIMAL}\n[repository]\nbackend = \"mongo\"\n");
        let path = write_temp("bad-backend", &contents)?;

        let result = load_from_path(&path);
        let _ = fs::remove_file(&path);

        assert!(matches!(result, Err(ConfigError::Parse(_))));
        Ok(())
    }

    #[test]
    fn zero_radius_is_invalid() -> Result<(), Box<dyn std::error::Error>> {
        let contents = format!("{MINIMAL}\n[matcher]\nsearch_radius_km = 0.0\n");
        let path = write_temp("zero-radius", &contents)?;

        let result = load_from_path(&path);
        let _ = fs::remove_file(&path);

        assert!(matches!(result, Err(ConfigError::Invalid(_))));
        Ok(())
    }

    #[test]
    fn zero_refresh_interval_is_invalid() -> Result<(), Box<dyn std::error::Error>> {
        let contents = format!("{MINIMAL}\n[pipeline]\nrefresh_interval_secs = 0\n");
        let path = write_temp("zero-interval", &contents)?;

        let result = load_from_path(&path);
        let _ = fs::remove_file(&path);

        assert!(matches!(result, Err(ConfigError::Invalid(_))));
        Ok(())
    }

    #[test]
    fn missing_config_file_returns_read_error() {
        let temp_dir = std::env::temp_dir();
        let unique = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before unix epoch")
            .as_nanos();
        let path = temp_dir.join(format!("ci-config-missing-{unique}.toml"));

        let result = load_from_path(&path);

        assert!(matches!(result, Err(ConfigError::Read(_))));
    }

    #[test]
    fn invalid_toml_returns_parse_error() -> Result<(), Box<dyn std::error::Error>> {
        let path = write_temp("invalid", "not = [valid")?;

        let result = load_from_path(&path);
        let _ = fs::remove_file(&path);

        assert!(matches!(result, Err(ConfigError::Parse(_))));
        Ok(())
    }
}
