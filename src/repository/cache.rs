//! Redis backend.
//!
//! Current rows and forecasts are JSON strings written with `SET .. EX`, so
//! expiry is native. Cameras live in a single hash keyed by camera id.

use crate::camera::Camera;
use crate::record::{CanonicalRow, ForecastVector};
use crate::repository::{
    BulkRead, CiRepository, RepositoryError, check_camera_id, check_cameras, check_forecast,
    check_row,
};
use redis::{Client, Connection, RedisResult};
use serde::de::DeserializeOwned;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

const BACKEND: &str = "cache";
const NOW_PREFIX: &str = "ci:now:";
const FORECAST_PREFIX: &str = "ci:forecast:";
const CAMERAS_KEY: &str = "ci:cameras";
const SCAN_BATCH: usize = 200;

pub struct RedisRepository {
    client: Client,
    connection: Mutex<Option<Connection>>,
    timeout: Duration,
}

impl std::fmt::Debug for RedisRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisRepository")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl RedisRepository {
    /// Parse the URL. The connection is opened on first use and reopened after errors.
    pub fn open(url: &str, timeout: Duration) -> Result<Self, RepositoryError> {
        let client = Client::open(url).map_err(|err| RepositoryError::unavailable(BACKEND, err))?;
        Ok(Self {
            client,
            connection: Mutex::new(None),
            timeout,
        })
    }

    fn with_connection<T>(
        &self,
        op: impl FnOnce(&mut Connection) -> RedisResult<T>,
    ) -> Result<T, RepositoryError> {
        let mut slot = self
            .connection
            .lock()
            .map_err(|_| RepositoryError::unavailable(BACKEND, "connection lock poisoned"))?;
        if slot.is_none() {
            let connection = self
                .client
                .get_connection_with_timeout(self.timeout)
                .and_then(|connection| {
                    connection.set_read_timeout(Some(self.timeout))?;
                    connection.set_write_timeout(Some(self.timeout))?;
                    Ok(connection)
                })
                .map_err(|err| RepositoryError::unavailable(BACKEND, err))?;
            debug!("Redis connection established");
            *slot = Some(connection);
        }
        let Some(connection) = slot.as_mut() else {
            return Err(RepositoryError::unavailable(BACKEND, "no connection"));
        };
        match op(connection) {
            Ok(value) => Ok(value),
            Err(err) => {
                *slot = None;
                Err(RepositoryError::unavailable(BACKEND, err))
            }
        }
    }

    fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, RepositoryError> {
        let raw: Option<String> =
            self.with_connection(|con| redis::cmd("GET").arg(key).query(con))?;
        raw.map(|text| decode(key, &text)).transpose()
    }

    fn set_json(
        &self,
        key: &str,
        payload: String,
        ttl_seconds: u64,
    ) -> Result<(), RepositoryError> {
        self.with_connection(|con| {
            redis::cmd("SET")
                .arg(key)
                .arg(payload)
                .arg("EX")
                .arg(ttl_seconds)
                .query::<()>(con)
        })
    }

    fn scan_now_keys(&self) -> Result<Vec<String>, RepositoryError> {
        let pattern = format!("{NOW_PREFIX}*");
        self.with_connection(|con| {
            let mut keys = Vec::new();
            let mut cursor: u64 = 0;
            loop {
                let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&pattern)
                    .arg("COUNT")
                    .arg(SCAN_BATCH)
                    .query(con)?;
                keys.extend(batch);
                if next == 0 {
                    break;
                }
                cursor = next;
            }
            keys.sort();
            keys.dedup();
            Ok(keys)
        })
    }
}

impl CiRepository for RedisRepository {
    fn backend_name(&self) -> &'static str {
        BACKEND
    }

    fn get_camera(&self, camera_id: &str) -> Result<Option<Camera>, RepositoryError> {
        check_camera_id(camera_id)?;
        let raw: Option<String> = self.with_connection(|con| {
            redis::cmd("HGET").arg(CAMERAS_KEY).arg(camera_id).query(con)
        })?;
        raw.map(|text| decode(CAMERAS_KEY, &text)).transpose()
    }

    fn get_all_cameras(&self) -> Result<Vec<Camera>, RepositoryError> {
        let raw: Vec<String> =
            self.with_connection(|con| redis::cmd("HVALS").arg(CAMERAS_KEY).query(con))?;
        let mut cameras = raw
            .iter()
            .map(|text| decode::<Camera>(CAMERAS_KEY, text))
            .collect::<Result<Vec<_>, _>>()?;
        cameras.sort_by(|a, b| a.camera_id.cmp(&b.camera_id));
        Ok(cameras)
    }

    fn upsert_cameras(&self, cameras: &[Camera]) -> Result<usize, RepositoryError> {
        check_cameras(cameras)?;
        if cameras.is_empty() {
            return Ok(0);
        }
        let mut command = redis::cmd("HSET");
        command.arg(CAMERAS_KEY);
        for camera in cameras {
            let payload = serde_json::to_string(camera)
                .map_err(|err| RepositoryError::InvalidInput(err.to_string()))?;
            command.arg(&camera.camera_id).arg(payload);
        }
        self.with_connection(|con| command.query::<()>(con))?;
        Ok(cameras.len())
    }

    fn get_now(&self, camera_id: &str) -> Result<Option<CanonicalRow>, RepositoryError> {
        check_camera_id(camera_id)?;
        self.get_json(&now_key(camera_id))
    }

    fn save_now(&self, row: &CanonicalRow, ttl_seconds: u64) -> Result<(), RepositoryError> {
        check_row(row, ttl_seconds)?;
        let payload = serde_json::to_string(row)
            .map_err(|err| RepositoryError::InvalidInput(err.to_string()))?;
        self.set_json(&now_key(&row.camera_id), payload, ttl_seconds)
    }

    fn get_forecast(&self, camera_id: &str) -> Result<Option<ForecastVector>, RepositoryError> {
        check_camera_id(camera_id)?;
        self.get_json(&forecast_key(camera_id))
    }

    fn save_forecast(
        &self,
        forecast: &ForecastVector,
        ttl_seconds: u64,
    ) -> Result<(), RepositoryError> {
        check_forecast(forecast, ttl_seconds)?;
        let payload = serde_json::to_string(forecast)
            .map_err(|err| RepositoryError::InvalidInput(err.to_string()))?;
        self.set_json(&forecast_key(&forecast.camera_id), payload, ttl_seconds)
    }

    fn get_all_now(&self) -> BulkRead<CanonicalRow> {
        let keys = match self.scan_now_keys() {
            Ok(keys) => keys,
            Err(err) => {
                warn!(error = %err, "Current-state scan failed");
                return BulkRead::degraded(Vec::new());
            }
        };

        let mut records = Vec::with_capacity(keys.len());
        let mut degraded = false;
        for chunk in keys.chunks(SCAN_BATCH) {
            let values: Vec<Option<String>> =
                match self.with_connection(|con| redis::cmd("MGET").arg(chunk).query(con)) {
                    Ok(values) => values,
                    Err(err) => {
                        warn!(error = %err, read = records.len(), "Current-state scan interrupted");
                        return BulkRead::degraded(records);
                    }
                };
            // Keys that expired between SCAN and MGET come back as nil.
            for (key, value) in chunk.iter().zip(values) {
                let Some(text) = value else { continue };
                match decode::<CanonicalRow>(key, &text) {
                    Ok(row) => records.push(row),
                    Err(err) => {
                        warn!(error = %err, "Skipping undecodable current-state record");
                        degraded = true;
                    }
                }
            }
        }
        BulkRead { records, degraded }
    }

    fn health_check(&self) -> bool {
        self.with_connection(|con| redis::cmd("PING").query::<String>(con))
            .is_ok_and(|reply| reply == "PONG")
    }
}

fn now_key(camera_id: &str) -> String {
    format!("{NOW_PREFIX}{camera_id}")
}

fn forecast_key(camera_id: &str) -> String {
    format!("{FORECAST_PREFIX}{camera_id}")
}

fn decode<T: DeserializeOwned>(key: &str, text: &str) -> Result<T, RepositoryError> {
    serde_json::from_str(text).map_err(|err| RepositoryError::decode(key, err))
}
