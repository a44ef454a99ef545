// src/models.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

//------------------------------------------------------------------------------
// IDENTIFIER TYPES
//------------------------------------------------------------------------------
// Using newtype pattern for type safety to prevent mixing different ID types

/// Strongly typed identifier for hazard reports
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReportId(pub String);

impl From<&str> for ReportId {
    fn from(s: &str) -> Self {
        ReportId(s.to_string())
    }
}

impl fmt::Display for ReportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Strongly typed identifier for report groups
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(pub String);

impl GroupId {
    pub fn generate() -> Self {
        GroupId(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reference to the user who submitted a report
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

//------------------------------------------------------------------------------
// REPORT
//------------------------------------------------------------------------------

/// A latitude/longitude pair in decimal degrees (WGS84).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

/// Report urgency. Ordering matters: Low < Medium < High < Urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Urgent,
}

impl Priority {
    /// Position on the ordered priority scale
    pub fn rank(&self) -> u8 {
        match self {
            Self::Low => 0,
            Self::Medium => 1,
            Self::High => 2,
            Self::Urgent => 3,
        }
    }
}

/// Triage status as assigned by the reporting system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Open,
    InProgress,
    Resolved,
    Closed,
    Rejected,
}

impl ReportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::InProgress => "in_progress",
            Self::Resolved => "resolved",
            Self::Closed => "closed",
            Self::Rejected => "rejected",
        }
    }
}

/// The recognised metadata keys a report may carry.
///
/// The reporting system stores metadata as an open dictionary; only these keys
/// influence grouping, everything else is dropped at deserialization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportMetadata {
    /// Reported GPS accuracy radius of the submitting device, in meters
    pub location_accuracy_meters: Option<f64>,
    /// Human-readable address resolved for the report location
    pub address: Option<String>,
    /// Category assigned by the image classifier, if any
    pub ai_category: Option<String>,
    /// Confidence of the image classifier (0-1)
    pub ai_confidence: Option<f64>,
}

/// Immutable snapshot of a hazard report, owned by the reporting system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub id: ReportId,
    pub title: String,
    pub description: String,
    pub category: String,
    pub location: Option<Coordinate>,
    pub status: ReportStatus,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub user_id: UserId,
    #[serde(default)]
    pub metadata: ReportMetadata,
}

impl Report {
    /// Text used for similarity scoring: title and description joined by a space.
    pub fn combined_text(&self) -> String {
        format!("{} {}", self.title, self.description)
    }

    /// True when a field that influences grouping differs between the two snapshots.
    pub fn has_meaningful_change(&self, previous: &Report) -> bool {
        self.title != previous.title
            || self.description != previous.description
            || self.category != previous.category
            || self.location != previous.location
            || self.status != previous.status
    }
}

//------------------------------------------------------------------------------
// GROUPS
//------------------------------------------------------------------------------

/// Qualitative reason recorded on a group explaining why its members were merged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupingReason {
    TextualSimilarity,
    SpatialProximity,
    CategoryMatch,
}

impl GroupingReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TextualSimilarity => "textual similarity",
            Self::SpatialProximity => "spatial proximity",
            Self::CategoryMatch => "category match",
        }
    }
}

impl fmt::Display for GroupingReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Merged location of a group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupLocation {
    /// Arithmetic-mean centroid of member coordinates
    pub centroid: Coordinate,
    /// Largest member distance from the centroid, in meters
    pub radius_meters: f64,
    pub address: Option<String>,
}

/// Per-member data kept on the group so it can be recomputed as it grows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupMember {
    pub report_id: ReportId,
    pub location: Option<Coordinate>,
    pub priority: Priority,
    /// Confidence of the pair analysis that admitted this member (1.0 for the primary)
    pub confidence: f64,
    /// Text similarity against the report that admitted this member (None for the primary)
    pub text_similarity: Option<f64>,
    pub joined_at: DateTime<Utc>,
}

/// Range of pairwise text similarity observed when the group was assembled
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimilarityRange {
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupMetadata {
    pub primary_report_id: ReportId,
    pub reasons: Vec<GroupingReason>,
    pub similarity_range: Option<SimilarityRange>,
    pub algorithm_version: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A durable set of reports describing the same real-world hazard.
///
/// Groups only grow through this crate; removing members is an administrative
/// operation handled elsewhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportGroup {
    pub id: GroupId,
    pub title: String,
    pub description: String,
    pub category: String,
    /// Maximum priority among members
    pub priority: Priority,
    pub location: Option<GroupLocation>,
    pub report_ids: Vec<ReportId>,
    pub report_count: usize,
    pub average_confidence: f64,
    pub members: Vec<GroupMember>,
    pub metadata: GroupMetadata,
}

impl ReportGroup {
    pub fn contains(&self, report_id: &ReportId) -> bool {
        self.report_ids.iter().any(|id| id == report_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_report() -> Report {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        Report {
            id: ReportId::from("r-1"),
            title: "Pothole".to_string(),
            description: "Deep pothole".to_string(),
            category: "Roads".to_string(),
            location: Some(Coordinate::new(40.0, -73.0)),
            status: ReportStatus::Open,
            priority: Priority::Medium,
            created_at: ts,
            updated_at: ts,
            user_id: UserId("u-1".to_string()),
            metadata: ReportMetadata::default(),
        }
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Low < Priority::Medium);
        assert!(Priority::High < Priority::Urgent);
        assert_eq!(
            [Priority::Medium, Priority::Urgent, Priority::Low]
                .into_iter()
                .max(),
            Some(Priority::Urgent)
        );
    }

    #[test]
    fn test_meaningful_change_detection() {
        let before = sample_report();
        let mut after = before.clone();
        after.priority = Priority::High;
        after.updated_at = after.updated_at + chrono::Duration::hours(1);
        assert!(!after.has_meaningful_change(&before));

        after.status = ReportStatus::InProgress;
        assert!(after.has_meaningful_change(&before));
    }

    #[test]
    fn test_unknown_metadata_keys_are_ignored() {
        let json = r#"{"address": "5th Ave", "free_text": "ignored", "ai_confidence": 0.9}"#;
        let metadata: ReportMetadata = serde_json::from_str(json).unwrap();
        assert_eq!(metadata.address.as_deref(), Some("5th Ave"));
        assert_eq!(metadata.ai_confidence, Some(0.9));
        assert_eq!(metadata.location_accuracy_meters, None);
    }

    #[test]
    fn test_coordinate_validity() {
        assert!(Coordinate::new(89.9, 179.9).is_valid());
        assert!(!Coordinate::new(91.0, 0.0).is_valid());
        assert!(!Coordinate::new(f64::NAN, 0.0).is_valid());
    }
}
