use crate::camera::load_cameras_from_path;
use crate::error::AppError;
use crate::freshness::Fresh;
use crate::geo::{GeoPoint, RouteCamera, RouteError, find_cameras_along_route, validate_route};
use crate::record::{CanonicalRow, ForecastVector};
use crate::repository::RepositoryError;
use crate::state::{CiContext, CycleReport};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// A matched camera with whatever state and forecast it currently has.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteCondition {
    pub route_camera: RouteCamera,
    pub current: Option<Fresh<CanonicalRow>>,
    pub forecast: Option<Fresh<ForecastVector>>,
}

/// Load the camera list from `path` and register it with the repository.
pub fn import_cameras(context: &CiContext, path: impl AsRef<Path>) -> Result<usize, AppError> {
    let path = path.as_ref();
    let cameras = load_cameras_from_path(path)?;
    let written = context.repository().upsert_cameras(&cameras)?;
    info!(path = %path.display(), cameras = written, "Cameras imported");
    Ok(written)
}

/// Store a freshly produced current row with the configured TTL.
pub fn publish_current(context: &CiContext, row: &CanonicalRow) -> Result<(), AppError> {
    context
        .repository()
        .save_now(row, context.settings().current_ttl_secs)?;
    Ok(())
}

/// Regenerate forecasts for every fresh current row.
pub fn run_forecast_cycle(context: &CiContext) -> Result<CycleReport, AppError> {
    let started_at = context.clock().now();
    let repository = context.repository();
    if !repository.health_check() {
        return Err(RepositoryError::unavailable(
            repository.backend_name(),
            "health check failed",
        )
        .into());
    }

    let scan = repository.get_all_now();
    let settings = context.settings();
    let mut report = CycleReport {
        started_at,
        scanned: scan.records.len(),
        forecasted: 0,
        stale_skipped: 0,
        failed: 0,
        degraded: scan.degraded,
    };

    for row in &scan.records {
        if !context.gate().is_current_fresh(row) {
            debug!(camera_id = %row.camera_id, "Skipping stale current row");
            report.stale_skipped += 1;
            continue;
        }

        let forecast = match context.strategy().generate_forecast(row) {
            Ok(forecast) => forecast,
            Err(err) => {
                warn!(camera_id = %row.camera_id, error = %err, "Forecast generation failed");
                report.failed += 1;
                continue;
            }
        };
        if let Err(reason) = forecast.validate(&settings.schedule) {
            warn!(camera_id = %row.camera_id, reason = %reason, "Forecast rejected");
            report.failed += 1;
            continue;
        }

        match repository.save_forecast(&forecast, settings.forecast_ttl_secs) {
            Ok(()) => report.forecasted += 1,
            Err(err @ RepositoryError::BackendUnavailable { .. }) => return Err(err.into()),
            Err(err) => {
                warn!(camera_id = %row.camera_id, error = %err, "Forecast not saved");
                report.failed += 1;
            }
        }
    }

    if report.degraded {
        warn!(scanned = report.scanned, "Current-state scan was incomplete");
    }
    info!(
        backend = repository.backend_name(),
        strategy = context.strategy().strategy_name(),
        scanned = report.scanned,
        forecasted = report.forecasted,
        stale = report.stale_skipped,
        failed = report.failed,
        "Forecast cycle complete"
    );
    context.publish_cycle(report.clone());
    Ok(report)
}

/// Cameras along `route` in travel order, each with its current state and
/// forecast judged for freshness. `radius_km` defaults to the configured radius.
pub fn route_conditions(
    context: &CiContext,
    route: &[GeoPoint],
    radius_km: Option<f64>,
) -> Result<Vec<RouteCondition>, AppError> {
    let radius_km = radius_km.unwrap_or(context.settings().search_radius_km);
    validate_route(route)?;
    if !radius_km.is_finite() || radius_km <= 0.0 {
        return Err(RouteError::InvalidRadius(radius_km).into());
    }

    let cameras = context.repository().get_all_cameras()?;
    let matched = find_cameras_along_route(route, &cameras, radius_km)?;

    let mut conditions = Vec::with_capacity(matched.len());
    for route_camera in matched {
        let camera_id = route_camera.camera.camera_id.as_str();
        let current = context.gate().current_with_freshness(camera_id, None)?;
        let forecast = context.gate().forecast_with_freshness(camera_id, None)?;
        conditions.push(RouteCondition {
            route_camera,
            current,
            forecast,
        });
    }
    Ok(conditions)
}

pub fn spawn_forecast_thread(
    context: Arc<CiContext>,
    interval: Duration,
    stop: Arc<AtomicBool>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        info!(
            interval_secs = interval.as_secs(),
            "Starting forecast refresh thread"
        );
        while !stop.load(Ordering::Relaxed) {
            let cycle_start = Instant::now();

            if let Err(e) = run_forecast_cycle(&context) {
                warn!(error = %e, "Error running forecast cycle");
            }

            sleep_with_stop(interval, &stop, cycle_start);
        }
        info!("Forecast refresh thread stopped");
    })
}

fn sleep_with_stop(duration: Duration, stop: &AtomicBool, start: Instant) {
    let elapsed = start.elapsed();
    if elapsed >= duration {
        return;
    }
    let remaining = duration - elapsed;
    let step = Duration::from_millis(100).min(remaining);
    let mut slept = Duration::ZERO;
    while slept < remaining {
        if stop.load(Ordering::Relaxed) {
            break;
        }
        std::thread::sleep(step);
        slept += step;
    }
}
