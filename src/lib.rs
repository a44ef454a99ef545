// src/lib.rs
pub mod config;
pub mod error;
pub mod grouping;
pub mod matching;
pub mod models;
pub mod services;

pub use config::AppConfig;
pub use error::{ErrorCategory, ErrorContext, GroupingError};
pub use grouping::GroupingAnalyzer;
pub use models::{Coordinate, Priority, Report, ReportGroup, ReportId, ReportStatus};
