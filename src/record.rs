//! Current-state and forecast records stored per camera.

use crate::camera::CameraId;
use serde::{Deserialize, Serialize};
use std::f64::consts::TAU;
use time::OffsetDateTime;

pub const DEFAULT_HORIZON_START_MINUTES: u32 = 2;
pub const DEFAULT_HORIZON_END_MINUTES: u32 = 120;
pub const DEFAULT_HORIZON_STEP_MINUTES: u32 = 2;

const MINUTES_PER_DAY: f64 = 1440.0;

/// Names accepted by [`CanonicalRow::feature`].
pub const FEATURE_NAMES: [&str; 20] = [
    "ci",
    "image_width",
    "image_height",
    "vehicle_count",
    "weighted_vehicle_count",
    "occupied_area_ratio",
    "motion_score",
    "minute_of_day",
    "hour",
    "day_of_week",
    "is_weekend",
    "tod_sin",
    "tod_cos",
    "ci_lag_1",
    "ci_lag_2",
    "ci_lag_3",
    "ci_lag_6",
    "ci_lag_12",
    "ci_roll_mean",
    "ci_roll_std",
];

/// Fixed forecast horizons in minutes: `start..=end` every `step`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HorizonSchedule {
    pub start: u32,
    pub end: u32,
    pub step: u32,
}

impl Default for HorizonSchedule {
    fn default() -> Self {
        Self {
            start: DEFAULT_HORIZON_START_MINUTES,
            end: DEFAULT_HORIZON_END_MINUTES,
            step: DEFAULT_HORIZON_STEP_MINUTES,
        }
    }
}

impl HorizonSchedule {
    pub fn validate(&self) -> Result<(), String> {
        if self.start == 0 {
            return Err("horizon start must be > 0".to_string());
        }
        if self.step == 0 {
            return Err("horizon step must be > 0".to_string());
        }
        if self.end < self.start {
            return Err(format!(
                "horizon end ({}) must be >= start ({})",
                self.end, self.start
            ));
        }
        Ok(())
    }

    pub fn horizons(&self) -> Vec<u32> {
        if self.step == 0 || self.end < self.start {
            return Vec::new();
        }
        (self.start..=self.end).step_by(self.step as usize).collect()
    }

    pub fn len(&self) -> usize {
        if self.step == 0 || self.end < self.start {
            return 0;
        }
        ((self.end - self.start) / self.step + 1) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Raw detector output for one frame.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DetectionFeatures {
    pub image_width: u32,
    pub image_height: u32,
    pub vehicle_count: u32,
    pub weighted_vehicle_count: f64,
    pub occupied_area_ratio: f64,
    pub motion_score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TemporalFeatures {
    pub minute_of_day: u32,
    pub hour: u8,
    /// 0 = Monday.
    pub day_of_week: u8,
    pub is_weekend: bool,
    pub tod_sin: f64,
    pub tod_cos: f64,
}

impl TemporalFeatures {
    /// Cyclic time-of-day encoding in the timestamp's own offset.
    pub fn from_timestamp(timestamp: OffsetDateTime) -> Self {
        let hour = timestamp.hour();
        let minute_of_day = u32::from(hour) * 60 + u32::from(timestamp.minute());
        let day_of_week = timestamp.weekday().number_days_from_monday();
        let angle = TAU * f64::from(minute_of_day) / MINUTES_PER_DAY;
        Self {
            minute_of_day,
            hour,
            day_of_week,
            is_weekend: day_of_week >= 5,
            tod_sin: angle.sin(),
            tod_cos: angle.cos(),
        }
    }
}

/// CI history features. Older records and non-model producers leave these unset.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct HistoryFeatures {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ci_lag_1: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ci_lag_2: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ci_lag_3: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ci_lag_6: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ci_lag_12: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ci_roll_mean: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ci_roll_std: Option<f64>,
}

/// The single current CI snapshot for a camera.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRow {
    pub camera_id: CameraId,
    #[serde(with = "time::serde::rfc3339")]
    pub captured_at: OffsetDateTime,
    #[serde(flatten)]
    pub detection: DetectionFeatures,
    pub ci: f64,
    #[serde(flatten)]
    pub temporal: TemporalFeatures,
    #[serde(flatten)]
    pub history: HistoryFeatures,
    pub model_version: String,
}

impl CanonicalRow {
    pub fn new(
        camera_id: impl Into<CameraId>,
        captured_at: OffsetDateTime,
        detection: DetectionFeatures,
        ci: f64,
        model_version: impl Into<String>,
    ) -> Self {
        Self {
            camera_id: camera_id.into(),
            captured_at,
            detection,
            ci,
            temporal: TemporalFeatures::from_timestamp(captured_at),
            history: HistoryFeatures::default(),
            model_version: model_version.into(),
        }
    }

    pub fn with_history(mut self, history: HistoryFeatures) -> Self {
        self.history = history;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.camera_id.trim().is_empty() {
            return Err("camera_id must not be empty".to_string());
        }
        if !self.ci.is_finite() || self.ci < 0.0 {
            return Err(format!(
                "camera {} has invalid ci {}",
                self.camera_id, self.ci
            ));
        }
        let required = [
            ("weighted_vehicle_count", self.detection.weighted_vehicle_count),
            ("occupied_area_ratio", self.detection.occupied_area_ratio),
            ("motion_score", self.detection.motion_score),
            ("tod_sin", self.temporal.tod_sin),
            ("tod_cos", self.temporal.tod_cos),
        ];
        if let Some((name, value)) = required.iter().find(|(_, value)| !value.is_finite()) {
            return Err(format!(
                "camera {} has non-finite {name} {value}",
                self.camera_id
            ));
        }
        let history = [
            ("ci_lag_1", self.history.ci_lag_1),
            ("ci_lag_2", self.history.ci_lag_2),
            ("ci_lag_3", self.history.ci_lag_3),
            ("ci_lag_6", self.history.ci_lag_6),
            ("ci_lag_12", self.history.ci_lag_12),
            ("ci_roll_mean", self.history.ci_roll_mean),
            ("ci_roll_std", self.history.ci_roll_std),
        ];
        if let Some((name, value)) = history
            .iter()
            .find_map(|(name, value)| value.filter(|v| !v.is_finite()).map(|v| (name, v)))
        {
            return Err(format!(
                "camera {} has non-finite {name} {value}",
                self.camera_id
            ));
        }
        Ok(())
    }

    /// Look up a model input by its feature name.
    pub fn feature(&self, name: &str) -> Option<f64> {
        let value = match name {
            "ci" => self.ci,
            "image_width" => f64::from(self.detection.image_width),
            "image_height" => f64::from(self.detection.image_height),
            "vehicle_count" => f64::from(self.detection.vehicle_count),
            "weighted_vehicle_count" => self.detection.weighted_vehicle_count,
            "occupied_area_ratio" => self.detection.occupied_area_ratio,
            "motion_score" => self.detection.motion_score,
            "minute_of_day" => f64::from(self.temporal.minute_of_day),
            "hour" => f64::from(self.temporal.hour),
            "day_of_week" => f64::from(self.temporal.day_of_week),
            "is_weekend" => {
                if self.temporal.is_weekend {
                    1.0
                } else {
                    0.0
                }
            }
            "tod_sin" => self.temporal.tod_sin,
            "tod_cos" => self.temporal.tod_cos,
            "ci_lag_1" => self.history.ci_lag_1?,
            "ci_lag_2" => self.history.ci_lag_2?,
            "ci_lag_3" => self.history.ci_lag_3?,
            "ci_lag_6" => self.history.ci_lag_6?,
            "ci_lag_12" => self.history.ci_lag_12?,
            "ci_roll_mean" => self.history.ci_roll_mean?,
            "ci_roll_std" => self.history.ci_roll_std?,
            _ => return None,
        };
        value.is_finite().then_some(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForecastPoint {
    pub horizon_minutes: u32,
    /// `NaN` when no prediction exists for this horizon.
    #[serde(with = "nan_as_null")]
    pub ci: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastVector {
    pub camera_id: CameraId,
    #[serde(with = "time::serde::rfc3339")]
    pub computed_at: OffsetDateTime,
    pub points: Vec<ForecastPoint>,
    pub model_version: String,
}

impl ForecastVector {
    /// Build a vector covering every horizon of `schedule`, in order.
    pub fn from_fn(
        camera_id: impl Into<CameraId>,
        computed_at: OffsetDateTime,
        schedule: &HorizonSchedule,
        model_version: impl Into<String>,
        mut predict: impl FnMut(u32) -> Option<f64>,
    ) -> Self {
        let points = schedule
            .horizons()
            .into_iter()
            .map(|horizon_minutes| ForecastPoint {
                horizon_minutes,
                ci: predict(horizon_minutes).unwrap_or(f64::NAN),
            })
            .collect();
        Self {
            camera_id: camera_id.into(),
            computed_at,
            points,
            model_version: model_version.into(),
        }
    }

    pub fn value_at(&self, horizon_minutes: u32) -> Option<f64> {
        self.points
            .iter()
            .find(|point| point.horizon_minutes == horizon_minutes)
            .map(|point| point.ci)
    }

    pub fn missing_horizons(&self) -> Vec<u32> {
        self.points
            .iter()
            .filter(|point| point.ci.is_nan())
            .map(|point| point.horizon_minutes)
            .collect()
    }

    /// Shape checks that hold for any schedule: non-empty id, strictly
    /// increasing horizons, predictions that are `NaN` or finite and >= 0.
    pub fn validate_points(&self) -> Result<(), String> {
        if self.camera_id.trim().is_empty() {
            return Err("camera_id must not be empty".to_string());
        }
        if self.points.is_empty() {
            return Err(format!("forecast for {} has no points", self.camera_id));
        }
        if self
            .points
            .windows(2)
            .any(|pair| pair[1].horizon_minutes <= pair[0].horizon_minutes)
        {
            return Err(format!(
                "forecast for {} has non-increasing horizons",
                self.camera_id
            ));
        }
        if let Some(point) = self
            .points
            .iter()
            .find(|point| !point.ci.is_nan() && (point.ci.is_infinite() || point.ci < 0.0))
        {
            return Err(format!(
                "forecast for {} has invalid ci {} at {} min",
                self.camera_id, point.ci, point.horizon_minutes
            ));
        }
        Ok(())
    }

    pub fn validate(&self, schedule: &HorizonSchedule) -> Result<(), String> {
        self.validate_points()?;
        let expected = schedule.horizons();
        if self.points.len() != expected.len() {
            return Err(format!(
                "forecast for {} has {} points, expected {}",
                self.camera_id,
                self.points.len(),
                expected.len()
            ));
        }
        if let Some((point, horizon)) = self
            .points
            .iter()
            .zip(expected)
            .find(|(point, horizon)| point.horizon_minutes != *horizon)
        {
            return Err(format!(
                "forecast for {} has horizon {} where {} was expected",
                self.camera_id, point.horizon_minutes, horizon
            ));
        }
        Ok(())
    }
}

/// JSON has no NaN literal; missing predictions travel as `null`.
mod nan_as_null {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &f64, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if value.is_nan() {
            serializer.serialize_none()
        } else {
            serializer.serialize_some(value)
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<f64, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use time::macros::datetime;

    fn row() -> CanonicalRow {
        CanonicalRow::new(
            "1701",
            datetime!(2026-01-10 08:30:00 UTC),
            DetectionFeatures {
                image_width: 1920,
                image_height: 1080,
                vehicle_count: 14,
                weighted_vehicle_count: 17.5,
                occupied_area_ratio: 0.32,
                motion_score: 0.4,
            },
            0.5,
            "det-v3",
        )
    }

    #[test]
    fn every_feature_name_resolves_with_full_history() {
        let row = row().with_history(HistoryFeatures {
            ci_lag_1: Some(0.4),
            ci_lag_2: Some(0.4),
            ci_lag_3: Some(0.3),
            ci_lag_6: Some(0.3),
            ci_lag_12: Some(0.2),
            ci_roll_mean: Some(0.35),
            ci_roll_std: Some(0.05),
        });

        for name in FEATURE_NAMES {
            assert!(row.feature(name).is_some(), "{name} missing");
        }
        assert_eq!(row.feature("ci_lag_1"), Some(0.4));
        assert_eq!(row.feature("unknown"), None);
    }

    #[test]
    fn missing_history_feature_is_none() {
        assert_eq!(row().feature("ci_roll_mean"), None);
        assert_eq!(row().feature("ci"), Some(0.5));
    }

    #[test]
    fn default_schedule_has_sixty_horizons() {
        let schedule = HorizonSchedule::default();
        let horizons = schedule.horizons();

        assert_eq!(horizons.len(), 60);
        assert_eq!(schedule.len(), 60);
        assert_eq!(horizons.first(), Some(&2));
        assert_eq!(horizons.last(), Some(&120));
        assert!(horizons.windows(2).all(|pair| pair[1] - pair[0] == 2));
    }

    #[test]
    fn schedule_validation_rejects_zero_step() {
        let schedule = HorizonSchedule {
            start: 2,
            end: 10,
            step: 0,
        };

        assert!(schedule.validate().is_err());
        assert!(schedule.is_empty());
    }

    #[test]
    fn temporal_features_encode_saturday_morning() {
        let temporal = TemporalFeatures::from_timestamp(datetime!(2026-01-10 06:00:00 UTC));

        assert_eq!(temporal.minute_of_day, 360);
        assert_eq!(temporal.hour, 6);
        assert_eq!(temporal.day_of_week, 5);
        assert!(temporal.is_weekend);
        assert!((temporal.tod_sin - 1.0).abs() < 1e-12);
        assert!(temporal.tod_cos.abs() < 1e-12);
    }

    #[test]
    fn row_serializes_flat_and_omits_unset_history() -> Result<(), Box<dyn std::error::Error>> {
        let value = serde_json::to_value(row())?;

        assert_eq!(value["camera_id"], json!("1701"));
        assert_eq!(value["captured_at"], json!("2026-01-10T08:30:00Z"));
        assert_eq!(value["vehicle_count"], json!(14));
        assert_eq!(value["minute_of_day"], json!(510));
        assert!(value.get("ci_lag_1").is_none());
        assert!(value.get("ci_roll_mean").is_none());
        Ok(())
    }

    #[test]
    fn row_without_history_fields_deserializes() -> Result<(), Box<dyn std::error::Error>> {
        let legacy = json!({
            "camera_id": "1701",
            "captured_at": "2026-01-10T08:30:00Z",
            "image_width": 1920,
            "image_height": 1080,
            "vehicle_count": 14,
            "weighted_vehicle_count": 17.5,
            "occupied_area_ratio": 0.32,
            "motion_score": 0.4,
            "ci": 0.5,
            "minute_of_day": 510,
            "hour": 8,
            "day_of_week": 5,
            "is_weekend": true,
            "tod_sin": 0.0,
            "tod_cos": -1.0,
            "model_version": "det-v3"
        });

        let parsed: CanonicalRow = serde_json::from_value(legacy)?;

        assert_eq!(parsed.history, HistoryFeatures::default());
        assert_eq!(parsed.feature("ci_lag_1"), None);
        assert_eq!(parsed.feature("ci"), Some(0.5));
        Ok(())
    }

    #[test]
    fn row_validation_rejects_negative_ci() {
        let mut invalid = row();
        invalid.ci = -0.1;

        assert!(invalid.validate().is_err());
        assert!(row().validate().is_ok());
    }

    #[test]
    fn row_validation_rejects_non_finite_features() {
        let mut motion = row();
        motion.detection.motion_score = f64::NAN;
        let mut area = row();
        area.detection.occupied_area_ratio = f64::INFINITY;
        let mut tod = row();
        tod.temporal.tod_cos = f64::NAN;
        let lag = row().with_history(HistoryFeatures {
            ci_lag_3: Some(f64::NAN),
            ..HistoryFeatures::default()
        });

        assert!(motion.validate().is_err());
        assert!(area.validate().is_err());
        assert!(tod.validate().is_err());
        assert!(lag.validate().is_err());
    }

    #[test]
    fn forecast_fills_missing_predictions_with_nan() -> Result<(), Box<dyn std::error::Error>> {
        let schedule = HorizonSchedule::default();
        let forecast = ForecastVector::from_fn(
            "1701",
            datetime!(2026-01-10 08:30:00 UTC),
            &schedule,
            "baseline",
            |horizon| (horizon <= 60).then_some(0.4),
        );

        assert_eq!(forecast.points.len(), 60);
        assert_eq!(forecast.value_at(60), Some(0.4));
        assert_eq!(forecast.missing_horizons().len(), 30);
        assert!(forecast.validate(&schedule).is_ok());

        let value = serde_json::to_value(&forecast)?;
        assert_eq!(value["points"][59], json!({"horizon_minutes": 120, "ci": null}));

        let decoded: ForecastVector = serde_json::from_value(value)?;
        assert_eq!(decoded.points.len(), 60);
        assert!(decoded.value_at(120).is_some_and(f64::is_nan));
        Ok(())
    }

    #[test]
    fn forecast_validation_rejects_short_vector() {
        let schedule = HorizonSchedule::default();
        let mut forecast = ForecastVector::from_fn(
            "1701",
            datetime!(2026-01-10 08:30:00 UTC),
            &schedule,
            "baseline",
            |_| Some(0.4),
        );
        forecast.points.pop();

        assert!(forecast.validate(&schedule).is_err());
    }
}
