// src/matching/geospatial/mod.rs
//
// Proximity model: distance, radius containment and centroid over coordinates.
// Everything here is pure; the accuracy tier table comes from configuration.

pub mod utils;

use serde::{Deserialize, Serialize};

use crate::config::AccuracyTiers;
use crate::error::Result;
use crate::models::Coordinate;

pub use utils::{calculate_haversine_distance, max_distance_from_centroid, offset_north};

/// Precision tier of a proximity result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccuracyTier {
    High,
    Medium,
    Low,
}

impl AccuracyTier {
    /// Confidence proxy used by the analyzer
    pub fn confidence(&self) -> f64 {
        match self {
            Self::High => 1.0,
            Self::Medium => 0.8,
            Self::Low => 0.6,
        }
    }

    /// Map a distance (plus any positional uncertainty) onto the configured tiers.
    pub fn for_distance(meters: f64, tiers: &AccuracyTiers) -> Self {
        if meters < tiers.high_max_meters {
            Self::High
        } else if meters < tiers.medium_max_meters {
            Self::Medium
        } else {
            Self::Low
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProximityResult {
    pub distance_meters: f64,
    pub is_within_radius: bool,
    pub accuracy: AccuracyTier,
}

/// Great-circle distance in meters.
pub fn distance(a: &Coordinate, b: &Coordinate) -> f64 {
    calculate_haversine_distance(a.latitude, a.longitude, b.latitude, b.longitude)
}

/// Radius containment check. The boundary is inclusive: points exactly
/// `radius_meters` apart are within the radius.
pub fn within_radius(
    a: &Coordinate,
    b: &Coordinate,
    radius_meters: f64,
    tiers: &AccuracyTiers,
) -> ProximityResult {
    within_radius_with_uncertainty(a, b, radius_meters, 0.0, tiers)
}

/// Same as [`within_radius`], but widens the distance used for the accuracy
/// tier by `uncertainty_meters` (e.g. a reported GPS accuracy). Containment
/// still uses the raw distance.
pub fn within_radius_with_uncertainty(
    a: &Coordinate,
    b: &Coordinate,
    radius_meters: f64,
    uncertainty_meters: f64,
    tiers: &AccuracyTiers,
) -> ProximityResult {
    let d = distance(a, b);
    ProximityResult {
        distance_meters: d,
        is_within_radius: d <= radius_meters,
        accuracy: AccuracyTier::for_distance(d + uncertainty_meters.max(0.0), tiers),
    }
}

/// Arithmetic-mean centroid (see [`utils::calculate_centroid`]). Fails on empty input.
pub fn centroid(points: &[Coordinate]) -> Result<Coordinate> {
    utils::calculate_centroid(points)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin() -> Coordinate {
        Coordinate::new(40.7829, -73.9654)
    }

    #[test]
    fn test_distance_is_symmetric() {
        let a = origin();
        let b = Coordinate::new(40.7580, -73.9855);
        assert_eq!(distance(&a, &b), distance(&b, &a));
        assert_eq!(distance(&a, &a), 0.0);
    }

    #[test]
    fn test_within_radius_boundary_is_inclusive() {
        let a = origin();
        let b = offset_north(&a, 100.0);
        let d = distance(&a, &b);
        let result = within_radius(&a, &b, d, &AccuracyTiers::default());
        assert!(result.is_within_radius);
        let just_short = within_radius(&a, &b, d - 1e-6, &AccuracyTiers::default());
        assert!(!just_short.is_within_radius);
    }

    #[test]
    fn test_accuracy_tiers_follow_configuration() {
        let tiers = AccuracyTiers::default();
        assert_eq!(AccuracyTier::for_distance(5.0, &tiers), AccuracyTier::High);
        assert_eq!(AccuracyTier::for_distance(50.0, &tiers), AccuracyTier::Medium);
        assert_eq!(AccuracyTier::for_distance(150.0, &tiers), AccuracyTier::Low);

        let strict = AccuracyTiers {
            high_max_meters: 1.0,
            medium_max_meters: 20.0,
        };
        assert_eq!(AccuracyTier::for_distance(5.0, &strict), AccuracyTier::Medium);
    }

    #[test]
    fn test_uncertainty_downgrades_tier_but_not_containment() {
        let a = origin();
        let b = offset_north(&a, 5.0);
        let tiers = AccuracyTiers::default();
        let precise = within_radius(&a, &b, 100.0, &tiers);
        let fuzzy = within_radius_with_uncertainty(&a, &b, 100.0, 200.0, &tiers);
        assert_eq!(precise.accuracy, AccuracyTier::High);
        assert_eq!(fuzzy.accuracy, AccuracyTier::Low);
        assert!(fuzzy.is_within_radius);
    }

    #[test]
    fn test_centroid_empty_fails() {
        assert!(centroid(&[]).is_err());
    }
}
