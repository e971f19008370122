use crate::camera::CameraImportError;
use crate::config::ConfigError;
use crate::forecast::ForecastError;
use crate::geo::RouteError;
use crate::repository::RepositoryError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
    #[error("forecast error: {0}")]
    Forecast(#[from] ForecastError),
    #[error("route error: {0}")]
    Route(#[from] RouteError),
    #[error("camera import error: {0}")]
    CameraImport(#[from] CameraImportError),
}
