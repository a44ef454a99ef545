// src/matching/geospatial/utils.rs
//
// Utility functions for geospatial calculations

use crate::error::{ErrorContext, GroupingError, Result};
use crate::models::Coordinate;

/// Mean Earth radius in meters
pub const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// Calculate the Haversine distance between two points in meters
pub fn calculate_haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    // Convert degrees to radians
    let lat1_rad = lat1.to_radians();
    let lon1_rad = lon1.to_radians();
    let lat2_rad = lat2.to_radians();
    let lon2_rad = lon2.to_radians();

    let dlat = lat2_rad - lat1_rad;
    let dlon = lon2_rad - lon1_rad;

    let a =
        (dlat / 2.0).sin().powi(2) + lat1_rad.cos() * lat2_rad.cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_METERS * c
}

/// Calculate the centroid (average position) of multiple points.
///
/// This is the arithmetic mean of latitudes and longitudes, not a geodesic
/// centroid. It is accurate enough for clusters under ~200km that do not
/// straddle the antimeridian.
pub fn calculate_centroid(points: &[Coordinate]) -> Result<Coordinate> {
    if points.is_empty() {
        return Err(GroupingError::validation("cannot compute centroid of an empty point list")
            .with_context(ErrorContext::new("geospatial", "centroid")));
    }

    let (lat_sum, lon_sum) = points
        .iter()
        .fold((0.0, 0.0), |(lat, lon), p| (lat + p.latitude, lon + p.longitude));

    // Round to 10 decimal places to ensure consistent values
    let n = points.len() as f64;
    let lat_avg = (lat_sum / n * 10_000_000_000.0).round() / 10_000_000_000.0;
    let lon_avg = (lon_sum / n * 10_000_000_000.0).round() / 10_000_000_000.0;

    Ok(Coordinate::new(lat_avg, lon_avg))
}

/// Calculate distance from a point to the centroid
pub fn distance_to_centroid(point: &Coordinate, centroid: &Coordinate) -> f64 {
    calculate_haversine_distance(
        point.latitude,
        point.longitude,
        centroid.latitude,
        centroid.longitude,
    )
}

/// Largest distance from the centroid to any of the points (0 for an empty list)
pub fn max_distance_from_centroid(points: &[Coordinate], centroid: &Coordinate) -> f64 {
    points
        .iter()
        .map(|p| distance_to_centroid(p, centroid))
        .fold(0.0, f64::max)
}

/// Coordinate `meters` north of `origin` along its meridian. Handy for fixtures.
pub fn offset_north(origin: &Coordinate, meters: f64) -> Coordinate {
    let dlat = (meters / EARTH_RADIUS_METERS).to_degrees();
    Coordinate::new(origin.latitude + dlat, origin.longitude)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_haversine_known_distance() {
        // London -> Paris, reference value from the spherical haversine formula
        let d = calculate_haversine_distance(51.5074, -0.1278, 48.8566, 2.3522);
        assert!((d - 343_556.0).abs() < 500.0, "got {}", d);
    }

    #[test]
    fn test_haversine_zero_for_same_point() {
        assert_eq!(calculate_haversine_distance(40.0, -73.0, 40.0, -73.0), 0.0);
    }

    #[test]
    fn test_offset_north_round_trips_distance() {
        let origin = Coordinate::new(40.7829, -73.9654);
        let moved = offset_north(&origin, 100.0);
        let d = distance_to_centroid(&moved, &origin);
        assert!((d - 100.0).abs() < 0.01, "got {}", d);
    }

    #[test]
    fn test_centroid_is_arithmetic_mean() {
        let points = [Coordinate::new(10.0, 20.0), Coordinate::new(12.0, 24.0)];
        let c = calculate_centroid(&points).unwrap();
        assert_eq!(c, Coordinate::new(11.0, 22.0));
    }

    #[test]
    fn test_centroid_rejects_empty_input() {
        let err = calculate_centroid(&[]).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_max_distance_from_centroid() {
        let origin = Coordinate::new(0.0, 0.0);
        let points = [origin, offset_north(&origin, 50.0)];
        let c = calculate_centroid(&points).unwrap();
        let r = max_distance_from_centroid(&points, &c);
        assert!((r - 25.0).abs() < 0.01, "got {}", r);
    }
}
