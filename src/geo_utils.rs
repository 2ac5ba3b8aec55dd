//! Geographic utilities: great-circle distance, durations, bounds, simplification.

use std::time::Duration;

use geo::{algorithm::simplify::Simplify, Coord, LineString};

use crate::{Bounds, GpsPoint};

/// Mean earth radius in meters (IUGG).
pub const EARTH_RADIUS_METERS: f64 = 6_371_008.8;

const SECONDS_PER_HOUR: f64 = 3600.0;

/// Great-circle distance between two GPS points in meters (haversine).
///
/// The haversine term is clamped to `[0, 1]` so nearly antipodal points can't
/// push `asin` out of its domain and return NaN.
/// `geo::Haversine` has no such clamp, which is why it is not used here.
///
/// # Example
/// ```
/// use run_tracker::GpsPoint;
/// use run_tracker::geo_utils::haversine_distance;
///
/// let london = GpsPoint::new(51.5074, -0.1278);
/// let paris = GpsPoint::new(48.8566, 2.3522);
/// let km = haversine_distance(&london, &paris) / 1000.0;
/// assert!((km - 343.5).abs() < 2.0);
/// ```
pub fn haversine_distance(p1: &GpsPoint, p2: &GpsPoint) -> f64 {
    let lat1 = p1.latitude.to_radians();
    let lat2 = p2.latitude.to_radians();
    let d_lat = (p2.latitude - p1.latitude).to_radians();
    let d_lng = (p2.longitude - p1.longitude).to_radians();

    let a = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lng / 2.0).sin().powi(2);
    let c = 2.0 * a.clamp(0.0, 1.0).sqrt().asin();

    EARTH_RADIUS_METERS * c
}

/// Convert a duration to fractional hours.
pub fn duration_hours(duration: Duration) -> f64 {
    duration.as_secs_f64() / SECONDS_PER_HOUR
}

/// Bounding box over any number of points, `None` when there are none.
pub fn compute_bounds<'a>(points: impl IntoIterator<Item = &'a GpsPoint>) -> Option<Bounds> {
    let mut iter = points.into_iter();
    let first = iter.next()?;
    let mut bounds = Bounds {
        min_lat: first.latitude,
        max_lat: first.latitude,
        min_lng: first.longitude,
        max_lng: first.longitude,
    };

    for p in iter {
        bounds.min_lat = bounds.min_lat.min(p.latitude);
        bounds.max_lat = bounds.max_lat.max(p.latitude);
        bounds.min_lng = bounds.min_lng.min(p.longitude);
        bounds.max_lng = bounds.max_lng.max(p.longitude);
    }

    Some(bounds)
}

/// Douglas-Peucker simplification of a polyline.
///
/// `tolerance` is in degrees (0.0001 is roughly 11 meters). Polylines with
/// fewer than three points are returned as-is.
pub fn simplify_polyline(points: &[GpsPoint], tolerance: f64) -> Vec<GpsPoint> {
    if points.len() < 3 {
        return points.to_vec();
    }

    let coords: Vec<Coord> = points
        .iter()
        .map(|p| Coord {
            x: p.longitude,
            y: p.latitude,
        })
        .collect();

    LineString::new(coords)
        .simplify(&tolerance)
        .0
        .iter()
        .map(|c| GpsPoint::new(c.y, c.x))
        .collect()
}
