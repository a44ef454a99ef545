// src/config.rs
//
// All tunables of the grouping core. Defaults live in the constants below;
// hosts override them through a JSON file and/or GROUPING_* environment variables.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::GroupingError;
use crate::models::ReportStatus;

// Pair scoring defaults
pub const DEFAULT_TEXT_SIMILARITY_THRESHOLD: f64 = 0.7;
pub const DEFAULT_PROXIMITY_RADIUS_METERS: f64 = 100.0;
pub const DEFAULT_CATEGORY_MATCH_WEIGHT: f64 = 0.3;
pub const DEFAULT_TEXT_SIMILARITY_WEIGHT: f64 = 0.4;
pub const DEFAULT_PROXIMITY_WEIGHT: f64 = 0.3;
pub const DEFAULT_MIN_CONFIDENCE_THRESHOLD: f64 = 0.6;
pub const DEFAULT_MAX_GROUP_SIZE: usize = 10;
pub const DEFAULT_TEMPORAL_WINDOW_DAYS: i64 = 30;
/// Largest accepted temporal window, about a century
pub const MAX_TEMPORAL_WINDOW_DAYS: i64 = 36_500;

// Recommendation cut-offs
pub const AUTO_GROUP_SCORE_THRESHOLD: f64 = 0.85;
pub const AUTO_GROUP_CONFIDENCE_THRESHOLD: f64 = 0.8;
pub const REVIEW_CONFIDENCE_THRESHOLD: f64 = 0.6;

// Proximity accuracy tiers (meters)
pub const HIGH_ACCURACY_MAX_METERS: f64 = 10.0;
pub const MEDIUM_ACCURACY_MAX_METERS: f64 = 100.0;

// Batching and retry
pub const DEFAULT_BATCH_PROCESSING_DELAY_MS: u64 = 5000;
pub const DEFAULT_MAX_BATCH_SIZE: usize = 10;
pub const DEFAULT_ANALYSIS_WORKERS: usize = 4;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1000;

/// Distance cut-offs used to map a pair distance to an accuracy tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccuracyTiers {
    /// Below this distance the proximity result is `high` accuracy
    pub high_max_meters: f64,
    /// Below this distance (and not high) the result is `medium`, otherwise `low`
    pub medium_max_meters: f64,
}

impl Default for AccuracyTiers {
    fn default() -> Self {
        Self {
            high_max_meters: HIGH_ACCURACY_MAX_METERS,
            medium_max_meters: MEDIUM_ACCURACY_MAX_METERS,
        }
    }
}

/// Configuration of the pairwise analyzer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupingConfig {
    pub text_similarity_threshold: f64,
    pub proximity_radius_meters: f64,
    pub category_match_weight: f64,
    pub text_similarity_weight: f64,
    pub proximity_weight: f64,
    pub min_confidence_threshold: f64,
    pub max_group_size: usize,
    pub temporal_window_days: i64,
    pub enable_auto_grouping: bool,
    pub require_human_review: bool,
    pub auto_group_score_threshold: f64,
    pub auto_group_confidence_threshold: f64,
    pub review_confidence_threshold: f64,
    pub accuracy_tiers: AccuracyTiers,
    /// Unordered pairs of distinct statuses treated as compatible
    pub compatible_statuses: Vec<(ReportStatus, ReportStatus)>,
    /// Maximum number of steps on the priority scale for two priorities to be aligned
    pub max_priority_distance: u8,
}

impl Default for GroupingConfig {
    fn default() -> Self {
        Self {
            text_similarity_threshold: DEFAULT_TEXT_SIMILARITY_THRESHOLD,
            proximity_radius_meters: DEFAULT_PROXIMITY_RADIUS_METERS,
            category_match_weight: DEFAULT_CATEGORY_MATCH_WEIGHT,
            text_similarity_weight: DEFAULT_TEXT_SIMILARITY_WEIGHT,
            proximity_weight: DEFAULT_PROXIMITY_WEIGHT,
            min_confidence_threshold: DEFAULT_MIN_CONFIDENCE_THRESHOLD,
            max_group_size: DEFAULT_MAX_GROUP_SIZE,
            temporal_window_days: DEFAULT_TEMPORAL_WINDOW_DAYS,
            enable_auto_grouping: true,
            require_human_review: false,
            auto_group_score_threshold: AUTO_GROUP_SCORE_THRESHOLD,
            auto_group_confidence_threshold: AUTO_GROUP_CONFIDENCE_THRESHOLD,
            review_confidence_threshold: REVIEW_CONFIDENCE_THRESHOLD,
            accuracy_tiers: AccuracyTiers::default(),
            compatible_statuses: vec![
                (ReportStatus::Open, ReportStatus::InProgress),
                (ReportStatus::Resolved, ReportStatus::Closed),
            ],
            max_priority_distance: 1,
        }
    }
}

/// What to do with a batch when candidate fetching fails after all retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchFailurePolicy {
    /// Put the batch's reports back into the pending set
    Requeue,
    /// Analyze the batch against an empty candidate set (batch members only)
    FallbackEmpty,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub batch_processing_delay_ms: u64,
    pub max_batch_size: usize,
    pub analysis_workers: usize,
    pub fetch_failure_policy: FetchFailurePolicy,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_processing_delay_ms: DEFAULT_BATCH_PROCESSING_DELAY_MS,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            analysis_workers: DEFAULT_ANALYSIS_WORKERS,
            fetch_failure_policy: FetchFailurePolicy::Requeue,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Base delay; attempt n waits `retry_delay_ms * 2^n`
    pub retry_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub grouping: GroupingConfig,
    pub batch: BatchConfig,
    pub retry: RetryConfig,
}

impl AppConfig {
    /// Reads a (possibly partial) JSON config file on top of the defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: AppConfig = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        info!("Loaded grouping configuration from {}", path.display());
        Ok(config)
    }

    /// Applies GROUPING_* environment variable overrides.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        let g = &mut self.grouping;
        override_from_env("GROUPING_TEXT_SIMILARITY_THRESHOLD", &mut g.text_similarity_threshold)?;
        override_from_env("GROUPING_PROXIMITY_RADIUS_METERS", &mut g.proximity_radius_meters)?;
        override_from_env("GROUPING_CATEGORY_MATCH_WEIGHT", &mut g.category_match_weight)?;
        override_from_env("GROUPING_TEXT_SIMILARITY_WEIGHT", &mut g.text_similarity_weight)?;
        override_from_env("GROUPING_PROXIMITY_WEIGHT", &mut g.proximity_weight)?;
        override_from_env("GROUPING_MIN_CONFIDENCE_THRESHOLD", &mut g.min_confidence_threshold)?;
        override_from_env("GROUPING_MAX_GROUP_SIZE", &mut g.max_group_size)?;
        override_from_env("GROUPING_TEMPORAL_WINDOW_DAYS", &mut g.temporal_window_days)?;
        override_from_env("GROUPING_ENABLE_AUTO_GROUPING", &mut g.enable_auto_grouping)?;
        override_from_env("GROUPING_REQUIRE_HUMAN_REVIEW", &mut g.require_human_review)?;

        let b = &mut self.batch;
        override_from_env("GROUPING_BATCH_DELAY_MS", &mut b.batch_processing_delay_ms)?;
        override_from_env("GROUPING_MAX_BATCH_SIZE", &mut b.max_batch_size)?;
        override_from_env("GROUPING_ANALYSIS_WORKERS", &mut b.analysis_workers)?;

        let r = &mut self.retry;
        override_from_env("GROUPING_MAX_RETRIES", &mut r.max_retries)?;
        override_from_env("GROUPING_RETRY_DELAY_MS", &mut r.retry_delay_ms)?;
        Ok(())
    }

    /// Defaults, then the optional file, then the environment.
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let mut config = match config_file {
            Some(path) => Self::from_json_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> std::result::Result<(), GroupingError> {
        self.grouping.validate()?;
        if self.batch.max_batch_size == 0 {
            return Err(GroupingError::validation("max_batch_size must be at least 1"));
        }
        if self.batch.analysis_workers == 0 {
            return Err(GroupingError::validation("analysis_workers must be at least 1"));
        }
        Ok(())
    }
}

impl GroupingConfig {
    pub fn validate(&self) -> std::result::Result<(), GroupingError> {
        let unit_values = [
            ("text_similarity_threshold", self.text_similarity_threshold),
            ("min_confidence_threshold", self.min_confidence_threshold),
            ("auto_group_score_threshold", self.auto_group_score_threshold),
            ("auto_group_confidence_threshold", self.auto_group_confidence_threshold),
            ("review_confidence_threshold", self.review_confidence_threshold),
        ];
        for (name, value) in unit_values {
            if !(0.0..=1.0).contains(&value) {
                return Err(GroupingError::validation(format!(
                    "{} must be within [0, 1], got {}",
                    name, value
                )));
            }
        }

        let weights = [
            self.category_match_weight,
            self.text_similarity_weight,
            self.proximity_weight,
        ];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(GroupingError::validation("signal weights must be non-negative"));
        }
        if weights.iter().sum::<f64>() <= 0.0 {
            return Err(GroupingError::validation("at least one signal weight must be positive"));
        }

        if !(self.proximity_radius_meters > 0.0) {
            return Err(GroupingError::validation("proximity_radius_meters must be positive"));
        }
        if !(0..=MAX_TEMPORAL_WINDOW_DAYS).contains(&self.temporal_window_days) {
            return Err(GroupingError::validation(format!(
                "temporal_window_days must be within [0, {}], got {}",
                MAX_TEMPORAL_WINDOW_DAYS, self.temporal_window_days
            )));
        }
        if self.max_group_size < 2 {
            return Err(GroupingError::validation("max_group_size must be at least 2"));
        }
        if !(self.accuracy_tiers.high_max_meters < self.accuracy_tiers.medium_max_meters) {
            return Err(GroupingError::validation(
                "accuracy tiers must be ascending (high < medium)",
            ));
        }
        Ok(())
    }

    /// True when the statuses are equal or listed as a compatible pair (in either order).
    pub fn statuses_compatible(&self, a: ReportStatus, b: ReportStatus) -> bool {
        a == b
            || self
                .compatible_statuses
                .iter()
                .any(|&(x, y)| (x == a && y == b) || (x == b && y == a))
    }
}

fn override_from_env<T>(key: &str, target: &mut T) -> Result<()>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    if let Ok(raw) = std::env::var(key) {
        let parsed = raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Invalid value '{}' for {}: {}", raw, key, e))?;
        *target = parsed;
        debug!("Config override from env: {} = {}", key, raw.trim());
    }
    Ok(())
}

/// Loads KEY=VALUE lines from a .env file. Variables already set win.
pub fn load_env_from_file(file_path: &str) -> Result<()> {
    let contents = match std::fs::read_to_string(file_path) {
        Ok(c) => c,
        Err(e) => {
            warn!(
                "Could not open env file '{}': {}. Proceeding with system environment variables.",
                file_path, e
            );
            return Ok(());
        }
    };

    for line in contents.lines() {
        let line = line.trim();
        if line.starts_with('#') || line.is_empty() {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim();
            let value = value.trim().trim_matches('"');
            if std::env::var(key).is_err() {
                // SAFETY: only called at startup, before any task that reads the environment runs.
                unsafe { std::env::set_var(key, value) };
                debug!("Set env var from file: {} = {}", key, value);
            }
        }
    }
    info!("Successfully processed env file: {}", file_path);
    Ok(())
}
