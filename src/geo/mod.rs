//! Great-circle helpers and route geometry.

use crate::camera::valid_coordinate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod matcher;

pub use matcher::{RouteCamera, find_cameras_along_route};

/// Mean Earth radius (IUGG).
pub const EARTH_RADIUS_KM: f64 = 6371.0088;
pub const DEFAULT_SEARCH_RADIUS_KM: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

impl From<(f64, f64)> for GeoPoint {
    fn from((latitude, longitude): (f64, f64)) -> Self {
        Self::new(latitude, longitude)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum RouteError {
    #[error("invalid route: {0}")]
    InvalidRoute(String),
    #[error("invalid search radius: {0} km (must be > 0)")]
    InvalidRadius(f64),
}

pub fn haversine_km(a: GeoPoint, b: GeoPoint) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let dlat = (b.latitude - a.latitude).to_radians();
    let dlon = (b.longitude - a.longitude).to_radians();
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().atan2((1.0 - h).sqrt())
}

/// Sum of great-circle distances between consecutive points, in km.
pub fn calculate_route_length(route: &[GeoPoint]) -> f64 {
    route
        .windows(2)
        .map(|pair| haversine_km(pair[0], pair[1]))
        .sum()
}

pub(crate) fn validate_route(route: &[GeoPoint]) -> Result<(), RouteError> {
    if route.len() < 2 {
        return Err(RouteError::InvalidRoute(format!(
            "requires at least 2 points, got {}",
            route.len()
        )));
    }
    if let Some((index, point)) = route
        .iter()
        .enumerate()
        .find(|(_, point)| !valid_coordinate(point.latitude, point.longitude))
    {
        return Err(RouteError::InvalidRoute(format!(
            "point {index} has invalid coordinates ({}, {})",
            point.latitude, point.longitude
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn haversine_one_degree_of_longitude_at_equator() {
        let distance = haversine_km(GeoPoint::new(0.0, 0.0), GeoPoint::new(0.0, 1.0));

        assert!((distance - 111.195).abs() < 0.01, "got {distance}");
    }

    #[test]
    fn haversine_is_zero_for_same_point() {
        let point = GeoPoint::new(1.2950, 103.8580);

        assert_eq!(haversine_km(point, point), 0.0);
    }

    #[test]
    fn route_length_sums_segments() {
        let a = GeoPoint::new(1.3048, 103.8318);
        let b = GeoPoint::new(1.2950, 103.8580);
        let c = GeoPoint::new(1.2806, 103.8611);

        let length = calculate_route_length(&[a, b, c]);

        assert!((length - (haversine_km(a, b) + haversine_km(b, c))).abs() < 1e-12);
        assert!(length > 4.0 && length < 5.5, "got {length}");
    }

    #[test]
    fn route_length_of_repeated_point_is_zero() {
        let point = GeoPoint::new(1.3, 103.8);

        assert_eq!(calculate_route_length(&[point, point, point, point]), 0.0);
        assert_eq!(calculate_route_length(&[point]), 0.0);
    }

    #[test]
    fn validate_route_rejects_single_point() {
        let result = validate_route(&[GeoPoint::new(1.3, 103.8)]);

        assert!(matches!(result, Err(RouteError::InvalidRoute(_))));
    }

    #[test]
    fn validate_route_rejects_non_finite_point() {
        let result = validate_route(&[GeoPoint::new(1.3, 103.8), GeoPoint::new(f64::NAN, 0.0)]);

        assert!(matches!(result, Err(RouteError::InvalidRoute(_))));
    }
}
