use route_congestion::config;
use route_congestion::pipeline::{import_cameras, spawn_forecast_thread};
use route_congestion::state::CiContext;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

fn init_tracing(level: &str) {
    let level = level.parse().unwrap_or(tracing::Level::INFO);
    let subscriber = tracing_subscriber::fmt()
        .with_target(false)
        .with_max_level(level)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = config::load_default()?;
    init_tracing(config.log_level());
    tracing::info!(app = %config.app.name, "route-congestion starting");

    let context = Arc::new(CiContext::from_config(&config)?);

    match config.cameras_path() {
        Some(path) => {
            if let Err(e) = import_cameras(&context, path) {
                tracing::warn!(error = %e, "Camera import failed, keeping stored cameras");
            }
        }
        None => tracing::info!("No camera file configured, using stored cameras"),
    }

    let stop_flag = Arc::new(AtomicBool::new(false));
    let refresh_handle = spawn_forecast_thread(
        Arc::clone(&context),
        config.refresh_interval(),
        Arc::clone(&stop_flag),
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");

    // Signal refresh thread to stop
    stop_flag.store(true, Ordering::Relaxed);
    tokio::task::spawn_blocking(move || refresh_handle.join())
        .await?
        .map_err(|_| "forecast thread panicked")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::config;

    #[test]
    fn default_config_is_valid_toml() -> Result<(), Box<dyn std::error::Error>> {
        let _config = config::load_from_path(config::DEFAULT_CONFIG_PATH)?;
        Ok(())
    }
}
