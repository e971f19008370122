//! Route-to-camera matching.
//!
//! The route is treated as a chain of straight segments. Each camera is
//! projected onto every segment and keeps its closest hit; the distance is a
//! haversine distance and the position is the arc-length fraction of that hit.

use crate::camera::{Camera, dedupe_cameras};
use crate::geo::{GeoPoint, RouteError, calculate_route_length, haversine_km, validate_route};
use serde::Serialize;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteCamera {
    pub camera: Camera,
    /// Shortest distance from the camera to the route, in meters.
    pub distance_m: f64,
    /// 0.0 at the route start, 1.0 at the end.
    pub position: f64,
    /// Arc-length offset of the closest route point, in km.
    pub offset_km: f64,
}

#[derive(Debug, Clone, Copy)]
struct SegmentHit {
    distance_km: f64,
    fraction: f64,
}

/// Cameras within `radius_km` of the route, in travel order.
pub fn find_cameras_along_route(
    route: &[GeoPoint],
    cameras: &[Camera],
    radius_km: f64,
) -> Result<Vec<RouteCamera>, RouteError> {
    validate_route(route)?;
    if !radius_km.is_finite() || radius_km <= 0.0 {
        return Err(RouteError::InvalidRadius(radius_km));
    }

    let segment_lengths: Vec<f64> = route
        .windows(2)
        .map(|pair| haversine_km(pair[0], pair[1]))
        .collect();
    let total_km = calculate_route_length(route);

    let mut matched = Vec::new();
    for camera in dedupe_cameras(cameras) {
        if let Err(reason) = camera.validate() {
            warn!(camera_id = %camera.camera_id, reason = %reason, "Skipping invalid camera");
            continue;
        }
        let point = GeoPoint::new(camera.latitude, camera.longitude);
        let mut best: Option<(f64, f64)> = None;
        let mut start_km = 0.0;

        for (pair, segment_km) in route.windows(2).zip(&segment_lengths) {
            let hit = closest_on_segment(point, pair[0], pair[1]);
            let offset_km = start_km + hit.fraction * segment_km;
            if best.is_none_or(|(distance_km, _)| hit.distance_km < distance_km) {
                best = Some((hit.distance_km, offset_km));
            }
            start_km += segment_km;
        }

        let Some((distance_km, offset_km)) = best else {
            continue;
        };
        if distance_km > radius_km {
            continue;
        }

        let position = if total_km > 0.0 {
            (offset_km / total_km).clamp(0.0, 1.0)
        } else {
            0.0
        };
        matched.push(RouteCamera {
            camera: camera.clone(),
            distance_m: distance_km * 1000.0,
            position,
            offset_km,
        });
    }

    matched.sort_by(|a, b| {
        a.position
            .total_cmp(&b.position)
            .then_with(|| a.distance_m.total_cmp(&b.distance_m))
            .then_with(|| a.camera.camera_id.cmp(&b.camera.camera_id))
    });

    debug!(
        route_points = route.len(),
        route_km = total_km,
        radius_km,
        candidates = cameras.len(),
        matched = matched.len(),
        "Matched cameras along route"
    );

    Ok(matched)
}

/// Closest point of segment `a`-`b` to `p`: the two endpoints, plus the
/// perpendicular foot when it lands strictly inside the segment.
fn closest_on_segment(p: GeoPoint, a: GeoPoint, b: GeoPoint) -> SegmentHit {
    let mut best = SegmentHit {
        distance_km: haversine_km(p, a),
        fraction: 0.0,
    };
    let at_end = haversine_km(p, b);
    if at_end < best.distance_km {
        best = SegmentHit {
            distance_km: at_end,
            fraction: 1.0,
        };
    }

    // Local equirectangular frame anchored at `a`.
    let scale = ((a.latitude + b.latitude) / 2.0).to_radians().cos();
    let dx = wrap_longitude(b.longitude - a.longitude) * scale;
    let dy = b.latitude - a.latitude;
    let px = wrap_longitude(p.longitude - a.longitude) * scale;
    let py = p.latitude - a.latitude;
    let length_sq = dx * dx + dy * dy;
    if length_sq == 0.0 {
        return best;
    }

    let t = (px * dx + py * dy) / length_sq;
    if t > 0.0 && t < 1.0 {
        let foot = GeoPoint::new(
            a.latitude + t * (b.latitude - a.latitude),
            wrap_longitude(a.longitude + t * wrap_longitude(b.longitude - a.longitude)),
        );
        let at_foot = haversine_km(p, foot);
        if at_foot < best.distance_km {
            best = SegmentHit {
                distance_km: at_foot,
                fraction: t,
            };
        }
    }
    best
}

fn wrap_longitude(delta: f64) -> f64 {
    if delta > 180.0 {
        delta - 360.0
    } else if delta < -180.0 {
        delta + 360.0
    } else {
        delta
    }
}
