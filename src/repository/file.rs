//! Flat-file backend: one JSON envelope per record.
//!
//! Layout under the data directory:
//! - `cameras.json` holds the camera list
//! - `now/<camera_id>.json` and `forecast/<camera_id>.json` hold an
//!   [`Expiring`] envelope around the record
//!
//! Writes go to a hidden temp file in the same directory and are renamed into
//! place, so readers see either the old or the new record.

use crate::camera::Camera;
use crate::clock::Clock;
use crate::record::{CanonicalRow, ForecastVector};
use crate::repository::{
    BulkRead, CiRepository, Expiring, RepositoryError, check_cameras, check_forecast, check_row,
    expires_at, is_expired,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

const BACKEND: &str = "file";
const CAMERAS_FILE: &str = "cameras.json";
const NOW_DIR: &str = "now";
const FORECAST_DIR: &str = "forecast";

#[derive(Debug)]
pub struct FileRepository {
    root: PathBuf,
    clock: Arc<dyn Clock>,
    cameras_lock: Mutex<()>,
    temp_counter: AtomicU64,
}

impl FileRepository {
    pub fn open(root: impl AsRef<Path>, clock: Arc<dyn Clock>) -> Result<Self, RepositoryError> {
        let root = root.as_ref().to_path_buf();
        for dir in [root.join(NOW_DIR), root.join(FORECAST_DIR)] {
            std::fs::create_dir_all(&dir).map_err(|err| {
                RepositoryError::unavailable(BACKEND, format!("{}: {err}", dir.display()))
            })?;
        }
        Ok(Self {
            root,
            clock,
            cameras_lock: Mutex::new(()),
            temp_counter: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Delete expired current and forecast files. Returns how many were removed.
    pub fn purge_expired(&self) -> Result<usize, RepositoryError> {
        let mut removed = 0;
        for dir in [NOW_DIR, FORECAST_DIR] {
            for path in self.record_paths(dir)? {
                let expired = match read_text(&path)? {
                    Some(text) => serde_json::from_str::<Expiring<serde_json::Value>>(&text)
                        .map(|stored| is_expired(self.clock.as_ref(), stored.expires_at))
                        .unwrap_or(false),
                    None => false,
                };
                if expired {
                    match std::fs::remove_file(&path) {
                        Ok(()) => removed += 1,
                        Err(err) if err.kind() == ErrorKind::NotFound => {}
                        Err(err) => return Err(RepositoryError::unavailable(BACKEND, err)),
                    }
                }
            }
        }
        debug!(removed, "Purged expired records");
        Ok(removed)
    }

    fn record_path(&self, dir: &str, camera_id: &str) -> Result<PathBuf, RepositoryError> {
        check_file_key(camera_id)?;
        Ok(self.root.join(dir).join(format!("{camera_id}.json")))
    }

    fn record_paths(&self, dir: &str) -> Result<Vec<PathBuf>, RepositoryError> {
        let entries = std::fs::read_dir(self.root.join(dir))
            .map_err(|err| RepositoryError::unavailable(BACKEND, err))?;
        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| RepositoryError::unavailable(BACKEND, err))?;
            let path = entry.path();
            if is_record_file(&path) {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }

    fn read_record<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>, RepositoryError> {
        let Some(text) = read_text(path)? else {
            return Ok(None);
        };
        let stored: Expiring<T> = serde_json::from_str(&text)
            .map_err(|err| RepositoryError::decode(path.display().to_string(), err))?;
        if is_expired(self.clock.as_ref(), stored.expires_at) {
            return Ok(None);
        }
        Ok(Some(stored.record))
    }

    fn write_record<T: Serialize>(
        &self,
        path: &Path,
        record: &T,
        ttl_seconds: u64,
    ) -> Result<(), RepositoryError> {
        let stored = Expiring {
            expires_at: expires_at(self.clock.as_ref(), ttl_seconds),
            record,
        };
        let bytes = serde_json::to_vec(&stored)
            .map_err(|err| RepositoryError::InvalidInput(err.to_string()))?;
        self.write_atomic(path, &bytes)
    }

    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), RepositoryError> {
        let dir = path.parent().unwrap_or(&self.root);
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let sequence = self.temp_counter.fetch_add(1, Ordering::Relaxed);
        let temp = dir.join(format!(".{name}.{}.{sequence}.tmp", std::process::id()));

        std::fs::write(&temp, bytes).map_err(|err| RepositoryError::unavailable(BACKEND, err))?;
        if let Err(err) = std::fs::rename(&temp, path) {
            let _ = std::fs::remove_file(&temp);
            return Err(RepositoryError::unavailable(BACKEND, err));
        }
        Ok(())
    }

    fn load_cameras(&self) -> Result<Vec<Camera>, RepositoryError> {
        let path = self.root.join(CAMERAS_FILE);
        match read_text(&path)? {
            Some(text) => serde_json::from_str(&text)
                .map_err(|err| RepositoryError::decode(path.display().to_string(), err)),
            None => Ok(Vec::new()),
        }
    }
}

impl CiRepository for FileRepository {
    fn backend_name(&self) -> &'static str {
        BACKEND
    }

    fn get_camera(&self, camera_id: &str) -> Result<Option<Camera>, RepositoryError> {
        check_file_key(camera_id)?;
        Ok(self
            .load_cameras()?
            .into_iter()
            .find(|camera| camera.camera_id == camera_id))
    }

    fn get_all_cameras(&self) -> Result<Vec<Camera>, RepositoryError> {
        self.load_cameras()
    }

    fn upsert_cameras(&self, cameras: &[Camera]) -> Result<usize, RepositoryError> {
        check_cameras(cameras)?;
        let _guard = self
            .cameras_lock
            .lock()
            .map_err(|_| RepositoryError::unavailable(BACKEND, "camera lock poisoned"))?;

        let mut merged: BTreeMap<String, Camera> = self
            .load_cameras()?
            .into_iter()
            .map(|camera| (camera.camera_id.clone(), camera))
            .collect();
        for camera in cameras {
            merged.insert(camera.camera_id.clone(), camera.clone());
        }
        let all: Vec<&Camera> = merged.values().collect();
        let bytes = serde_json::to_vec_pretty(&all)
            .map_err(|err| RepositoryError::InvalidInput(err.to_string()))?;
        self.write_atomic(&self.root.join(CAMERAS_FILE), &bytes)?;
        Ok(cameras.len())
    }

    fn get_now(&self, camera_id: &str) -> Result<Option<CanonicalRow>, RepositoryError> {
        let path = self.record_path(NOW_DIR, camera_id)?;
        self.read_record(&path)
    }

    fn save_now(&self, row: &CanonicalRow, ttl_seconds: u64) -> Result<(), RepositoryError> {
        check_row(row, ttl_seconds)?;
        let path = self.record_path(NOW_DIR, &row.camera_id)?;
        self.write_record(&path, row, ttl_seconds)
    }

    fn get_forecast(&self, camera_id: &str) -> Result<Option<ForecastVector>, RepositoryError> {
        let path = self.record_path(FORECAST_DIR, camera_id)?;
        self.read_record(&path)
    }

    fn save_forecast(
        &self,
        forecast: &ForecastVector,
        ttl_seconds: u64,
    ) -> Result<(), RepositoryError> {
        check_forecast(forecast, ttl_seconds)?;
        let path = self.record_path(FORECAST_DIR, &forecast.camera_id)?;
        self.write_record(&path, forecast, ttl_seconds)
    }

    fn get_all_now(&self) -> BulkRead<CanonicalRow> {
        let paths = match self.record_paths(NOW_DIR) {
            Ok(paths) => paths,
            Err(err) => {
                warn!(error = %err, "Current-state scan failed");
                return BulkRead::degraded(Vec::new());
            }
        };

        let mut records = Vec::with_capacity(paths.len());
        let mut degraded = false;
        for path in paths {
            match self.read_record::<CanonicalRow>(&path) {
                Ok(Some(row)) => records.push(row),
                Ok(None) => {}
                Err(err @ RepositoryError::Decode { .. }) => {
                    warn!(error = %err, "Skipping undecodable current-state record");
                    degraded = true;
                }
                Err(err) => {
                    warn!(error = %err, read = records.len(), "Current-state scan interrupted");
                    return BulkRead::degraded(records);
                }
            }
        }
        BulkRead { records, degraded }
    }

    fn health_check(&self) -> bool {
        [NOW_DIR, FORECAST_DIR]
            .iter()
            .all(|dir| self.root.join(dir).is_dir())
    }
}

fn read_text(path: &Path) -> Result<Option<String>, RepositoryError> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(RepositoryError::unavailable(
            BACKEND,
            format!("{}: {err}", path.display()),
        )),
    }
}

fn is_record_file(path: &Path) -> bool {
    let hidden = path
        .file_name()
        .and_then(|name| name.to_str())
        .is_none_or(|name| name.starts_with('.'));
    !hidden && path.extension().is_some_and(|ext| ext == "json")
}

/// Camera ids become file names, so only a conservative character set is allowed.
fn check_file_key(camera_id: &str) -> Result<(), RepositoryError> {
    let valid = !camera_id.is_empty()
        && !camera_id.starts_with('.')
        && camera_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(RepositoryError::InvalidInput(format!(
            "camera_id {camera_id:?} is not a valid file key"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::repository::tests_support::{
        day_of_rows, non_finite_row, sample_forecast, sample_row,
    };
    use std::time::{Duration, SystemTime, UNIX_EPOCH};
    use time::macros::datetime;

    fn temp_root(name: &str) -> Result<PathBuf, Box<dyn std::error::Error>> {
        let unique = SystemTime::now().duration_since(UNIX_EPOCH)?.as_nanos();
        Ok(std::env::temp_dir().join(format!("ci-file-repo-{name}-{unique}")))
    }

    fn open(name: &str) -> Result<(Arc<ManualClock>, FileRepository), Box<dyn std::error::Error>> {
        let clock = Arc::new(ManualClock::new(datetime!(2026-01-11 12:00:00 UTC)));
        let repository = FileRepository::open(temp_root(name)?, clock.clone())?;
        Ok((clock, repository))
    }

    #[test]
    fn save_now_round_trips_row() -> Result<(), Box<dyn std::error::Error>> {
        let (clock, repository) = open("roundtrip")?;
        let row = sample_row("1701", clock.now(), 0.42);

        repository.save_now(&row, 600)?;
        let loaded = repository.get_now("1701")?;
        let _ = std::fs::remove_dir_all(repository.root());

        assert_eq!(loaded, Some(row));
        Ok(())
    }

    #[test]
    fn computed_features_round_trip_exactly() -> Result<(), Box<dyn std::error::Error>> {
        let (clock, repository) = open("exact")?;
        let rows = day_of_rows(clock.now());

        for row in &rows {
            repository.save_now(row, 600)?;
        }
        let loaded = rows
            .iter()
            .map(|row| repository.get_now(&row.camera_id))
            .collect::<Result<Vec<_>, _>>();
        let _ = std::fs::remove_dir_all(repository.root());

        for (row, loaded) in rows.iter().zip(loaded?) {
            assert_eq!(loaded.as_ref(), Some(row));
        }
        Ok(())
    }

    #[test]
    fn non_finite_row_is_rejected_before_write() -> Result<(), Box<dyn std::error::Error>> {
        let (clock, repository) = open("non-finite")?;

        let saved = repository.save_now(&non_finite_row("1701", clock.now()), 600);
        let written = repository.root().join(NOW_DIR).join("1701.json").exists();
        let _ = std::fs::remove_dir_all(repository.root());

        assert!(matches!(saved, Err(RepositoryError::InvalidInput(_))));
        assert!(!written);
        Ok(())
    }

    #[test]
    fn forecast_gaps_survive_round_trip() -> Result<(), Box<dyn std::error::Error>> {
        let (clock, repository) = open("forecast")?;
        let forecast = sample_forecast("1701", clock.now());

        repository.save_forecast(&forecast, 600)?;
        let loaded = repository.get_forecast("1701")?;
        let _ = std::fs::remove_dir_all(repository.root());

        let loaded = loaded.ok_or("forecast missing")?;
        assert_eq!(loaded.points.len(), 60);
        assert_eq!(loaded.missing_horizons(), vec![120]);
        assert_eq!(loaded.value_at(2), Some(0.01));
        Ok(())
    }

    #[test]
    fn expired_records_read_as_absent_and_purge() -> Result<(), Box<dyn std::error::Error>> {
        let (clock, repository) = open("expiry")?;
        repository.save_now(&sample_row("1701", clock.now(), 0.3), 600)?;
        repository.save_now(&sample_row("1702", clock.now(), 0.3), 1200)?;

        clock.advance(Duration::from_secs(601));
        let expired = repository.get_now("1701")?;
        let kept = repository.get_now("1702")?;
        let scan = repository.get_all_now();
        let removed = repository.purge_expired()?;
        let _ = std::fs::remove_dir_all(repository.root());

        assert!(expired.is_none());
        assert!(kept.is_some());
        assert_eq!(scan.records.len(), 1);
        assert!(!scan.degraded);
        assert_eq!(removed, 1);
        Ok(())
    }

    #[test]
    fn corrupt_file_is_skipped_in_scan() -> Result<(), Box<dyn std::error::Error>> {
        let (clock, repository) = open("corrupt")?;
        repository.save_now(&sample_row("1701", clock.now(), 0.3), 600)?;
        std::fs::write(repository.root().join(NOW_DIR).join("1702.json"), "{not json")?;

        let scan = repository.get_all_now();
        let direct = repository.get_now("1702");
        let _ = std::fs::remove_dir_all(repository.root());

        assert!(scan.degraded);
        assert_eq!(scan.records.len(), 1);
        assert!(matches!(direct, Err(RepositoryError::Decode { .. })));
        Ok(())
    }

    #[test]
    fn missing_record_is_none() -> Result<(), Box<dyn std::error::Error>> {
        let (_clock, repository) = open("missing")?;

        let row = repository.get_now("never-reported")?;
        let forecast = repository.get_forecast("never-reported")?;
        let _ = std::fs::remove_dir_all(repository.root());

        assert!(row.is_none());
        assert!(forecast.is_none());
        Ok(())
    }

    #[test]
    fn path_like_camera_ids_are_rejected() -> Result<(), Box<dyn std::error::Error>> {
        let (_clock, repository) = open("keys")?;

        let traversal = repository.get_now("../etc/passwd");
        let hidden = repository.get_now(".hidden");
        let _ = std::fs::remove_dir_all(repository.root());

        assert!(matches!(traversal, Err(RepositoryError::InvalidInput(_))));
        assert!(matches!(hidden, Err(RepositoryError::InvalidInput(_))));
        Ok(())
    }

    #[test]
    fn cameras_merge_on_upsert() -> Result<(), Box<dyn std::error::Error>> {
        let (_clock, repository) = open("cameras")?;
        repository.upsert_cameras(&[Camera::new("1701", 1.3, 103.8)])?;
        repository.upsert_cameras(&[Camera::new("1702", 1.2, 103.7)])?;

        let all = repository.get_all_cameras()?;
        let one = repository.get_camera("1702")?;
        let _ = std::fs::remove_dir_all(repository.root());

        assert_eq!(all.len(), 2);
        assert_eq!(one.map(|camera| camera.longitude), Some(103.7));
        Ok(())
    }

    #[test]
    fn health_check_fails_when_directory_removed() -> Result<(), Box<dyn std::error::Error>> {
        let (_clock, repository) = open("health")?;
        assert!(repository.health_check());

        std::fs::remove_dir_all(repository.root())?;

        assert!(!repository.health_check());
        Ok(())
    }
}
