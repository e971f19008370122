//! `DuckDB` backend.
//!
//! Records are stored as JSON payloads keyed by camera id, with `expires_at`
//! in unix seconds. Reads filter on `expires_at > now`; [`DuckDbRepository::purge_expired`]
//! removes what the filter already hides.

use crate::camera::Camera;
use crate::clock::Clock;
use crate::record::{CanonicalRow, ForecastVector};
use crate::repository::{
    BulkRead, CiRepository, RepositoryError, check_camera_id, check_cameras, check_forecast,
    check_row, expires_at,
};
use duckdb::{Connection, params};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

const BACKEND: &str = "relational";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS cameras (
    camera_id TEXT PRIMARY KEY,
    latitude DOUBLE NOT NULL,
    longitude DOUBLE NOT NULL,
    image_url TEXT
);
CREATE TABLE IF NOT EXISTS ci_now (
    camera_id TEXT PRIMARY KEY,
    captured_at BIGINT NOT NULL,
    expires_at BIGINT NOT NULL,
    payload TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS ci_forecast (
    camera_id TEXT PRIMARY KEY,
    computed_at BIGINT NOT NULL,
    expires_at BIGINT NOT NULL,
    payload TEXT NOT NULL
);
";

pub struct DuckDbRepository {
    conn: Mutex<Connection>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for DuckDbRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuckDbRepository")
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl DuckDbRepository {
    /// Open (or create) the database file and its tables.
    pub fn open(path: impl AsRef<Path>, clock: Arc<dyn Clock>) -> Result<Self, RepositoryError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|err| RepositoryError::unavailable(BACKEND, err))?;
        }
        let conn =
            Connection::open(path).map_err(|err| RepositoryError::unavailable(BACKEND, err))?;
        Self::with_connection(conn, clock)
    }

    pub fn open_in_memory(clock: Arc<dyn Clock>) -> Result<Self, RepositoryError> {
        let conn =
            Connection::open_in_memory().map_err(|err| RepositoryError::unavailable(BACKEND, err))?;
        Self::with_connection(conn, clock)
    }

    fn with_connection(conn: Connection, clock: Arc<dyn Clock>) -> Result<Self, RepositoryError> {
        conn.execute_batch(SCHEMA)
            .map_err(|err| RepositoryError::unavailable(BACKEND, err))?;
        Ok(Self {
            conn: Mutex::new(conn),
            clock,
        })
    }

    /// Delete expired current and forecast rows. Returns how many were removed.
    pub fn purge_expired(&self) -> Result<usize, RepositoryError> {
        let now = self.clock.unix_seconds();
        let conn = self.conn()?;
        let mut removed = 0;
        for table in ["ci_now", "ci_forecast"] {
            removed += conn
                .execute(&format!("DELETE FROM {table} WHERE expires_at <= ?"), params![now])
                .map_err(|err| RepositoryError::unavailable(BACKEND, err))?;
        }
        debug!(removed, "Purged expired rows");
        Ok(removed)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, RepositoryError> {
        self.conn
            .lock()
            .map_err(|_| RepositoryError::unavailable(BACKEND, "connection lock poisoned"))
    }

    fn read_payload<T: DeserializeOwned>(
        &self,
        table: &str,
        camera_id: &str,
    ) -> Result<Option<T>, RepositoryError> {
        check_camera_id(camera_id)?;
        let now = self.clock.unix_seconds();
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT payload FROM {table} WHERE camera_id = ? AND expires_at > ?"
            ))
            .map_err(|err| RepositoryError::unavailable(BACKEND, err))?;
        let mut rows = stmt
            .query(params![camera_id, now])
            .map_err(|err| RepositoryError::unavailable(BACKEND, err))?;
        let Some(row) = rows
            .next()
            .map_err(|err| RepositoryError::unavailable(BACKEND, err))?
        else {
            return Ok(None);
        };
        let payload: String = row
            .get(0)
            .map_err(|err| RepositoryError::unavailable(BACKEND, err))?;
        decode_payload(table, camera_id, &payload).map(Some)
    }

    fn write_payload(
        &self,
        table: &str,
        time_column: &str,
        camera_id: &str,
        timestamp: i64,
        payload: &str,
        ttl_seconds: u64,
    ) -> Result<(), RepositoryError> {
        let expires = expires_at(self.clock.as_ref(), ttl_seconds);
        let conn = self.conn()?;
        conn.execute(
            &format!(
                "INSERT INTO {table} (camera_id, {time_column}, expires_at, payload)
                 VALUES (?, ?, ?, ?)
                 ON CONFLICT (camera_id) DO UPDATE SET
                    {time_column} = excluded.{time_column},
                    expires_at = excluded.expires_at,
                    payload = excluded.payload"
            ),
            params![camera_id, timestamp, expires, payload],
        )
        .map_err(|err| RepositoryError::unavailable(BACKEND, err))?;
        Ok(())
    }
}

impl CiRepository for DuckDbRepository {
    fn backend_name(&self) -> &'static str {
        BACKEND
    }

    fn get_camera(&self, camera_id: &str) -> Result<Option<Camera>, RepositoryError> {
        check_camera_id(camera_id)?;
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT camera_id, latitude, longitude, image_url FROM cameras WHERE camera_id = ?",
            )
            .map_err(|err| RepositoryError::unavailable(BACKEND, err))?;
        let mut rows = stmt
            .query(params![camera_id])
            .map_err(|err| RepositoryError::unavailable(BACKEND, err))?;
        match rows
            .next()
            .map_err(|err| RepositoryError::unavailable(BACKEND, err))?
        {
            Some(row) => camera_from_row(row).map(Some),
            None => Ok(None),
        }
    }

    fn get_all_cameras(&self) -> Result<Vec<Camera>, RepositoryError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT camera_id, latitude, longitude, image_url FROM cameras ORDER BY camera_id",
            )
            .map_err(|err| RepositoryError::unavailable(BACKEND, err))?;
        let mut rows = stmt
            .query([])
            .map_err(|err| RepositoryError::unavailable(BACKEND, err))?;
        let mut cameras = Vec::new();
        while let Some(row) = rows
            .next()
            .map_err(|err| RepositoryError::unavailable(BACKEND, err))?
        {
            cameras.push(camera_from_row(row)?);
        }
        Ok(cameras)
    }

    fn upsert_cameras(&self, cameras: &[Camera]) -> Result<usize, RepositoryError> {
        check_cameras(cameras)?;
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(|err| RepositoryError::unavailable(BACKEND, err))?;
        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO cameras (camera_id, latitude, longitude, image_url)
                     VALUES (?, ?, ?, ?)
                     ON CONFLICT (camera_id) DO UPDATE SET
                        latitude = excluded.latitude,
                        longitude = excluded.longitude,
                        image_url = excluded.image_url",
                )
                .map_err(|err| RepositoryError::unavailable(BACKEND, err))?;
            for camera in cameras {
                stmt.execute(params![
                    camera.camera_id,
                    camera.latitude,
                    camera.longitude,
                    camera.image_url.as_deref(),
                ])
                .map_err(|err| RepositoryError::unavailable(BACKEND, err))?;
            }
        }
        tx.commit()
            .map_err(|err| RepositoryError::unavailable(BACKEND, err))?;
        Ok(cameras.len())
    }

    fn get_now(&self, camera_id: &str) -> Result<Option<CanonicalRow>, RepositoryError> {
        self.read_payload("ci_now", camera_id)
    }

    fn save_now(&self, row: &CanonicalRow, ttl_seconds: u64) -> Result<(), RepositoryError> {
        check_row(row, ttl_seconds)?;
        let payload = serde_json::to_string(row)
            .map_err(|err| RepositoryError::InvalidInput(err.to_string()))?;
        self.write_payload(
            "ci_now",
            "captured_at",
            &row.camera_id,
            row.captured_at.unix_timestamp(),
            &payload,
            ttl_seconds,
        )
    }

    fn get_forecast(&self, camera_id: &str) -> Result<Option<ForecastVector>, RepositoryError> {
        self.read_payload("ci_forecast", camera_id)
    }

    fn save_forecast(
        &self,
        forecast: &ForecastVector,
        ttl_seconds: u64,
    ) -> Result<(), RepositoryError> {
        check_forecast(forecast, ttl_seconds)?;
        let payload = serde_json::to_string(forecast)
            .map_err(|err| RepositoryError::InvalidInput(err.to_string()))?;
        self.write_payload(
            "ci_forecast",
            "computed_at",
            &forecast.camera_id,
            forecast.computed_at.unix_timestamp(),
            &payload,
            ttl_seconds,
        )
    }

    fn get_all_now(&self) -> BulkRead<CanonicalRow> {
        let now = self.clock.unix_seconds();
        let conn = match self.conn() {
            Ok(conn) => conn,
            Err(err) => {
                warn!(error = %err, "Current-state scan failed");
                return BulkRead::degraded(Vec::new());
            }
        };
        let mut stmt = match conn.prepare(
            "SELECT camera_id, payload FROM ci_now WHERE expires_at > ? ORDER BY camera_id",
        ) {
            Ok(stmt) => stmt,
            Err(err) => {
                warn!(error = %err, "Current-state scan failed");
                return BulkRead::degraded(Vec::new());
            }
        };
        let mut rows = match stmt.query(params![now]) {
            Ok(rows) => rows,
            Err(err) => {
                warn!(error = %err, "Current-state scan failed");
                return BulkRead::degraded(Vec::new());
            }
        };

        let mut records = Vec::new();
        let mut degraded = false;
        loop {
            let row = match rows.next() {
                Ok(Some(row)) => row,
                Ok(None) => break,
                Err(err) => {
                    warn!(error = %err, read = records.len(), "Current-state scan interrupted");
                    return BulkRead::degraded(records);
                }
            };
            let decoded = row
                .get::<_, String>(0)
                .and_then(|id| row.get::<_, String>(1).map(|payload| (id, payload)));
            match decoded {
                Ok((camera_id, payload)) => {
                    match decode_payload::<CanonicalRow>("ci_now", &camera_id, &payload) {
                        Ok(record) => records.push(record),
                        Err(err) => {
                            warn!(error = %err, "Skipping undecodable current-state row");
                            degraded = true;
                        }
                    }
                }
                Err(err) => {
                    warn!(error = %err, "Skipping unreadable current-state row");
                    degraded = true;
                }
            }
        }
        BulkRead { records, degraded }
    }

    fn health_check(&self) -> bool {
        match self.conn() {
            Ok(conn) => conn.execute_batch("SELECT 1").is_ok(),
            Err(_) => false,
        }
    }
}

fn decode_payload<T: DeserializeOwned>(
    table: &str,
    camera_id: &str,
    payload: &str,
) -> Result<T, RepositoryError> {
    serde_json::from_str(payload)
        .map_err(|err| RepositoryError::decode(format!("{table}/{camera_id}"), err))
}

fn camera_from_row(row: &duckdb::Row<'_>) -> Result<Camera, RepositoryError> {
    let read = || -> duckdb::Result<Camera> {
        Ok(Camera {
            camera_id: row.get(0)?,
            latitude: row.get(1)?,
            longitude: row.get(2)?,
            image_url: row.get(3)?,
        })
    };
    read().map_err(|err| RepositoryError::decode("cameras", err))
}
