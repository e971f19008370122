//! Traffic camera reference data.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;
use tracing::warn;

pub type CameraId = String;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Camera {
    pub camera_id: CameraId,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

impl Camera {
    pub fn new(camera_id: impl Into<CameraId>, latitude: f64, longitude: f64) -> Self {
        Self {
            camera_id: camera_id.into(),
            latitude,
            longitude,
            image_url: None,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.camera_id.trim().is_empty() {
            return Err("camera_id must not be empty".to_string());
        }
        if !valid_coordinate(self.latitude, self.longitude) {
            return Err(format!(
                "camera {} has invalid coordinates ({}, {})",
                self.camera_id, self.latitude, self.longitude
            ));
        }
        Ok(())
    }
}

pub(crate) fn valid_coordinate(latitude: f64, longitude: f64) -> bool {
    latitude.is_finite()
        && longitude.is_finite()
        && (-90.0..=90.0).contains(&latitude)
        && (-180.0..=180.0).contains(&longitude)
}

/// Keep the first camera for every identifier, preserving input order.
pub fn dedupe_cameras(cameras: &[Camera]) -> Vec<&Camera> {
    let mut seen = HashSet::with_capacity(cameras.len());
    let mut unique = Vec::with_capacity(cameras.len());
    for camera in cameras {
        if seen.insert(camera.camera_id.as_str()) {
            unique.push(camera);
        } else {
            warn!(camera_id = %camera.camera_id, "Duplicate camera id ignored");
        }
    }
    unique
}

#[derive(Debug, Error)]
pub enum CameraImportError {
    #[error("failed to read camera file: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to parse camera file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid camera: {0}")]
    Invalid(String),
}

/// Load the static camera list (a JSON array) and drop duplicate ids.
pub fn load_cameras_from_path(path: impl AsRef<Path>) -> Result<Vec<Camera>, CameraImportError> {
    let contents = std::fs::read_to_string(path)?;
    let cameras: Vec<Camera> = serde_json::from_str(&contents)?;
    for camera in &cameras {
        camera.validate().map_err(CameraImportError::Invalid)?;
    }
    Ok(dedupe_cameras(&cameras).into_iter().cloned().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::{SystemTime, UNIX_EPOCH};

    #[test]
    fn dedupe_keeps_first_occurrence() {
        let cameras = vec![
            Camera::new("1701", 1.3, 103.8),
            Camera::new("1702", 1.31, 103.81),
            Camera::new("1701", 9.0, 9.0),
        ];

        let unique = dedupe_cameras(&cameras);

        assert_eq!(unique.len(), 2);
        assert_eq!(unique[0].latitude, 1.3);
        assert_eq!(unique[1].camera_id, "1702");
    }

    #[test]
    fn validate_rejects_out_of_range_coordinates() {
        assert!(Camera::new("a", 91.0, 0.0).validate().is_err());
        assert!(Camera::new("a", 0.0, f64::NAN).validate().is_err());
        assert!(Camera::new(" ", 0.0, 0.0).validate().is_err());
        assert!(Camera::new("a", -90.0, 180.0).validate().is_ok());
    }

    #[test]
    fn load_cameras_reads_optional_image_url() -> Result<(), Box<dyn std::error::Error>> {
        let unique = SystemTime::now().duration_since(UNIX_EPOCH)?.as_nanos();
        let path = std::env::temp_dir().join(format!("ci-cameras-{unique}.json"));
        fs::write(
            &path,
            r#"[
                {"camera_id": "1701", "latitude": 1.3, "longitude": 103.8, "image_url": "http://img/1701.jpg"},
                {"camera_id": "1702", "latitude": 1.31, "longitude": 103.81},
                {"camera_id": "1701", "latitude": 1.0, "longitude": 103.0}
            ]"#,
        )?;

        let cameras = load_cameras_from_path(&path)?;
        let _ = fs::remove_file(&path);

        assert_eq!(cameras.len(), 2);
        assert_eq!(cameras[0].image_url.as_deref(), Some("http://img/1701.jpg"));
        assert_eq!(cameras[1].image_url, None);
        Ok(())
    }

    #[test]
    fn load_cameras_rejects_invalid_entry() -> Result<(), Box<dyn std::error::Error>> {
        let unique = SystemTime::now().duration_since(UNIX_EPOCH)?.as_nanos();
        let path = std::env::temp_dir().join(format!("ci-cameras-invalid-{unique}.json"));
        fs::write(&path, r#"[{"camera_id": "", "latitude": 1.3, "longitude": 103.8}]"#)?;

        let result = load_cameras_from_path(&path);
        let _ = fs::remove_file(&path);

        assert!(matches!(result, Err(CameraImportError::Invalid(_))));
        Ok(())
    }
}
