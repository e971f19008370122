use crate::camera::Camera;
use crate::clock::Clock;
use crate::record::{CanonicalRow, ForecastVector};
use crate::repository::{
    BulkRead, CiRepository, Expiring, RepositoryError, check_camera_id, check_cameras,
    check_forecast, check_row, expires_at, is_expired,
};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::warn;

const BACKEND: &str = "memory";

/// Fault switches for exercising outage paths.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryFaults {
    /// Every operation fails as unreachable and `health_check` reports false.
    pub offline: bool,
    /// `get_all_now` stops after this many rows and reports degraded.
    pub fail_scan_after: Option<usize>,
}

#[derive(Debug, Default)]
struct Tables {
    cameras: BTreeMap<String, Camera>,
    now: BTreeMap<String, Expiring<CanonicalRow>>,
    forecasts: BTreeMap<String, Expiring<ForecastVector>>,
}

/// In-process backend with the same expiry rules as the file and relational stores.
#[derive(Debug)]
pub struct MemoryRepository {
    clock: Arc<dyn Clock>,
    tables: Mutex<Tables>,
    faults: Mutex<MemoryFaults>,
}

impl MemoryRepository {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            tables: Mutex::new(Tables::default()),
            faults: Mutex::new(MemoryFaults::default()),
        }
    }

    pub fn set_faults(&self, faults: MemoryFaults) {
        let mut guard = self
            .faults
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = faults;
    }

    fn faults(&self) -> MemoryFaults {
        *self
            .faults
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>, RepositoryError> {
        if self.faults().offline {
            return Err(RepositoryError::unavailable(BACKEND, "store offline"));
        }
        self.tables
            .lock()
            .map_err(|_| RepositoryError::unavailable(BACKEND, "store lock poisoned"))
    }
}

impl CiRepository for MemoryRepository {
    fn backend_name(&self) -> &'static str {
        BACKEND
    }

    fn get_camera(&self, camera_id: &str) -> Result<Option<Camera>, RepositoryError> {
        check_camera_id(camera_id)?;
        Ok(self.tables()?.cameras.get(camera_id).cloned())
    }

    fn get_all_cameras(&self) -> Result<Vec<Camera>, RepositoryError> {
        Ok(self.tables()?.cameras.values().cloned().collect())
    }

    fn upsert_cameras(&self, cameras: &[Camera]) -> Result<usize, RepositoryError> {
        check_cameras(cameras)?;
        let mut tables = self.tables()?;
        for camera in cameras {
            tables
                .cameras
                .insert(camera.camera_id.clone(), camera.clone());
        }
        Ok(cameras.len())
    }

    fn get_now(&self, camera_id: &str) -> Result<Option<CanonicalRow>, RepositoryError> {
        check_camera_id(camera_id)?;
        let tables = self.tables()?;
        Ok(tables
            .now
            .get(camera_id)
            .filter(|stored| !is_expired(self.clock.as_ref(), stored.expires_at))
            .map(|stored| stored.record.clone()))
    }

    fn save_now(&self, row: &CanonicalRow, ttl_seconds: u64) -> Result<(), RepositoryError> {
        check_row(row, ttl_seconds)?;
        let stored = Expiring {
            expires_at: expires_at(self.clock.as_ref(), ttl_seconds),
            record: row.clone(),
        };
        self.tables()?.now.insert(row.camera_id.clone(), stored);
        Ok(())
    }

    fn get_forecast(&self, camera_id: &str) -> Result<Option<ForecastVector>, RepositoryError> {
        check_camera_id(camera_id)?;
        let tables = self.tables()?;
        Ok(tables
            .forecasts
            .get(camera_id)
            .filter(|stored| !is_expired(self.clock.as_ref(), stored.expires_at))
            .map(|stored| stored.record.clone()))
    }

    fn save_forecast(
        &self,
        forecast: &ForecastVector,
        ttl_seconds: u64,
    ) -> Result<(), RepositoryError> {
        check_forecast(forecast, ttl_seconds)?;
        let stored = Expiring {
            expires_at: expires_at(self.clock.as_ref(), ttl_seconds),
            record: forecast.clone(),
        };
        self.tables()?
            .forecasts
            .insert(forecast.camera_id.clone(), stored);
        Ok(())
    }

    fn get_all_now(&self) -> BulkRead<CanonicalRow> {
        let fail_after = self.faults().fail_scan_after;
        let tables = match self.tables() {
            Ok(tables) => tables,
            Err(err) => {
                warn!(error = %err, "Current-state scan failed");
                return BulkRead::degraded(Vec::new());
            }
        };

        let mut records = Vec::new();
        for stored in tables.now.values() {
            if is_expired(self.clock.as_ref(), stored.expires_at) {
                continue;
            }
            if fail_after.is_some_and(|limit| records.len() >= limit) {
                warn!(read = records.len(), "Current-state scan interrupted");
                return BulkRead::degraded(records);
            }
            records.push(stored.record.clone());
        }
        BulkRead::complete(records)
    }

    fn health_check(&self) -> bool {
        !self.faults().offline && self.tables.lock().is_ok()
    }
}
