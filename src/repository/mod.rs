//! Storage-agnostic access to cameras, current rows and forecasts.
//!
//! Every backend implements [`CiRepository`]. Absence is `Ok(None)`; an
//! unreachable store is [`RepositoryError::BackendUnavailable`], never an
//! empty result. Backends without native expiry store `expires_at` next to
//! each record and treat expired records as absent.

use crate::camera::Camera;
use crate::clock::Clock;
use crate::record::{CanonicalRow, ForecastVector};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

pub mod cache;
pub mod file;
pub mod memory;
pub mod relational;

pub use cache::RedisRepository;
pub use file::FileRepository;
pub use memory::MemoryRepository;
pub use relational::DuckDbRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("{backend} backend unavailable: {message}")]
    BackendUnavailable {
        backend: &'static str,
        message: String,
    },
    #[error("failed to decode {key}: {message}")]
    Decode { key: String, message: String },
}

impl RepositoryError {
    pub(crate) fn unavailable(backend: &'static str, err: impl fmt::Display) -> Self {
        Self::BackendUnavailable {
            backend,
            message: err.to_string(),
        }
    }

    pub(crate) fn decode(key: impl Into<String>, err: impl fmt::Display) -> Self {
        Self::Decode {
            key: key.into(),
            message: err.to_string(),
        }
    }
}

/// Result of a bulk scan. `degraded` means the scan stopped early or skipped
/// undecodable records; `records` only holds complete, valid rows.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkRead<T> {
    pub records: Vec<T>,
    pub degraded: bool,
}

impl<T> BulkRead<T> {
    pub fn complete(records: Vec<T>) -> Self {
        Self {
            records,
            degraded: false,
        }
    }

    pub fn degraded(records: Vec<T>) -> Self {
        Self {
            records,
            degraded: true,
        }
    }
}

pub trait CiRepository: Send + Sync + fmt::Debug {
    fn backend_name(&self) -> &'static str;

    fn get_camera(&self, camera_id: &str) -> Result<Option<Camera>, RepositoryError>;

    fn get_all_cameras(&self) -> Result<Vec<Camera>, RepositoryError>;

    /// Insert or replace cameras by id. Returns the number written.
    fn upsert_cameras(&self, cameras: &[Camera]) -> Result<usize, RepositoryError>;

    fn get_now(&self, camera_id: &str) -> Result<Option<CanonicalRow>, RepositoryError>;

    /// Overwrite the current row for `row.camera_id` and reset its expiry.
    fn save_now(&self, row: &CanonicalRow, ttl_seconds: u64) -> Result<(), RepositoryError>;

    fn get_forecast(&self, camera_id: &str) -> Result<Option<ForecastVector>, RepositoryError>;

    /// Overwrite the forecast for `forecast.camera_id` and reset its expiry.
    fn save_forecast(
        &self,
        forecast: &ForecastVector,
        ttl_seconds: u64,
    ) -> Result<(), RepositoryError>;

    fn get_all_now(&self) -> BulkRead<CanonicalRow>;

    /// Cheap connectivity probe. Never panics.
    fn health_check(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepositoryBackend {
    Cache,
    File,
    Relational,
    Memory,
}

impl fmt::Display for RepositoryBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RepositoryBackend::Cache => "cache",
            RepositoryBackend::File => "file",
            RepositoryBackend::Relational => "relational",
            RepositoryBackend::Memory => "memory",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RepositorySettings {
    pub backend: RepositoryBackend,
    pub data_dir: PathBuf,
    pub database_path: PathBuf,
    pub redis_url: String,
    pub redis_timeout: Duration,
}

/// Construct the configured backend once, at startup.
pub fn open_repository(
    settings: &RepositorySettings,
    clock: Arc<dyn Clock>,
) -> Result<Arc<dyn CiRepository>, RepositoryError> {
    let repository: Arc<dyn CiRepository> = match settings.backend {
        RepositoryBackend::Cache => Arc::new(RedisRepository::open(
            &settings.redis_url,
            settings.redis_timeout,
        )?),
        RepositoryBackend::File => Arc::new(FileRepository::open(&settings.data_dir, clock)?),
        RepositoryBackend::Relational => {
            Arc::new(DuckDbRepository::open(&settings.database_path, clock)?)
        }
        RepositoryBackend::Memory => Arc::new(MemoryRepository::new(clock)),
    };
    info!(backend = %settings.backend, "Repository opened");
    Ok(repository)
}

pub(crate) fn check_camera_id(camera_id: &str) -> Result<(), RepositoryError> {
    if camera_id.trim().is_empty() {
        return Err(RepositoryError::InvalidInput(
            "camera_id must not be empty".to_string(),
        ));
    }
    Ok(())
}

pub(crate) fn check_ttl(ttl_seconds: u64) -> Result<(), RepositoryError> {
    if ttl_seconds == 0 {
        return Err(RepositoryError::InvalidInput(
            "ttl_seconds must be > 0".to_string(),
        ));
    }
    if i64::try_from(ttl_seconds).is_err() {
        return Err(RepositoryError::InvalidInput(format!(
            "ttl_seconds {ttl_seconds} is too large"
        )));
    }
    Ok(())
}

pub(crate) fn check_row(row: &CanonicalRow, ttl_seconds: u64) -> Result<(), RepositoryError> {
    row.validate().map_err(RepositoryError::InvalidInput)?;
    check_ttl(ttl_seconds)
}

pub(crate) fn check_forecast(
    forecast: &ForecastVector,
    ttl_seconds: u64,
) -> Result<(), RepositoryError> {
    forecast
        .validate_points()
        .map_err(RepositoryError::InvalidInput)?;
    check_ttl(ttl_seconds)
}

pub(crate) fn check_cameras(cameras: &[Camera]) -> Result<(), RepositoryError> {
    for camera in cameras {
        camera.validate().map_err(RepositoryError::InvalidInput)?;
    }
    Ok(())
}

/// Unix second at which a record written now expires.
pub(crate) fn expires_at(clock: &dyn Clock, ttl_seconds: u64) -> i64 {
    let ttl = i64::try_from(ttl_seconds).unwrap_or(i64::MAX);
    clock.unix_seconds().saturating_add(ttl)
}

pub(crate) fn is_expired(clock: &dyn Clock, expires_at: i64) -> bool {
    clock.unix_seconds() >= expires_at
}

/// On-disk / in-memory wrapper for backends without native expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Expiring<T> {
    pub expires_at: i64,
    pub record: T,
}
