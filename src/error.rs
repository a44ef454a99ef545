// src/error.rs
//
// Typed error used across the grouping core. Every failure carries a category,
// a recoverability flag and the context it was raised in, so the retry layer can
// decide what to do without string matching.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::models::ReportId;

/// Broad classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Bad or missing input to a pure function. Never retried.
    Validation,
    /// Candidate fetch or other remote call failed.
    Network,
    /// Scoring computation failed (e.g. malformed report data).
    Processing,
    /// Persistence collaborator failed.
    Database,
    /// Anything unexpected.
    System,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Network => "network",
            Self::Processing => "processing",
            Self::Database => "database",
            Self::System => "system",
        }
    }

    /// Whether errors of this category are retried by default.
    pub fn is_recoverable_by_default(&self) -> bool {
        !matches!(self, Self::Validation)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an error happened. Passed explicitly to the retry/fallback wrappers.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ErrorContext {
    pub operation: String,
    pub component: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_id: Option<ReportId>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, Value>,
}

impl ErrorContext {
    pub fn new(component: &str, operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            component: component.to_string(),
            report_id: None,
            details: BTreeMap::new(),
        }
    }

    pub fn for_report(mut self, report_id: &ReportId) -> Self {
        self.report_id = Some(report_id.clone());
        self
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    /// Compact JSON rendering used in structured log lines.
    pub fn to_log_string(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{:?}", self))
    }
}

type BoxedCause = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, thiserror::Error)]
#[error("{category} error in {}: {message}", .context.operation)]
pub struct GroupingError {
    pub category: ErrorCategory,
    pub message: String,
    pub recoverable: bool,
    pub context: ErrorContext,
    #[source]
    source: Option<BoxedCause>,
    /// Set by the fallback wrapper when the fallback also failed.
    fallback_error: Option<Box<GroupingError>>,
}

impl GroupingError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
            recoverable: category.is_recoverable_by_default(),
            context: ErrorContext::default(),
            source: None,
            fallback_error: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Validation, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Network, message)
    }

    pub fn processing(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Processing, message)
    }

    pub fn database(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Database, message)
    }

    pub fn system(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::System, message)
    }

    pub fn with_context(mut self, context: ErrorContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    pub fn recoverable(mut self, recoverable: bool) -> Self {
        self.recoverable = recoverable;
        self
    }

    pub fn with_fallback_error(mut self, fallback: GroupingError) -> Self {
        self.fallback_error = Some(Box::new(fallback));
        self
    }

    pub fn fallback_error(&self) -> Option<&GroupingError> {
        self.fallback_error.as_deref()
    }

    pub fn is_validation(&self) -> bool {
        self.category == ErrorCategory::Validation
    }
}

impl From<anyhow::Error> for GroupingError {
    fn from(err: anyhow::Error) -> Self {
        let message = format!("{:#}", err);
        let boxed: BoxedCause = err.into();
        Self::system(message).with_source(BoxedError(boxed))
    }
}

impl From<tokio::task::JoinError> for GroupingError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::system(format!("worker task failed: {}", err)).with_source(err)
    }
}

// Newtype so a boxed cause can itself be stored as a source.
#[derive(Debug)]
struct BoxedError(BoxedCause);

impl fmt::Display for BoxedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::error::Error for BoxedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

pub type Result<T> = std::result::Result<T, GroupingError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_validation_is_not_recoverable() {
        let err = GroupingError::validation("empty point list");
        assert!(!err.recoverable);
        assert!(err.is_validation());
        assert!(GroupingError::network("timeout").recoverable);
    }

    #[test]
    fn test_display_includes_category_and_operation() {
        let err = GroupingError::processing("bad coordinates")
            .with_context(ErrorContext::new("analyzer", "analyze"));
        assert_eq!(
            err.to_string(),
            "processing error in analyze: bad coordinates"
        );
    }

    #[test]
    fn test_source_chain_is_preserved() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "socket closed");
        let err = GroupingError::network("fetch failed").with_source(io);
        let source = err.source().expect("source should be set");
        assert_eq!(source.to_string(), "socket closed");
    }

    #[test]
    fn test_fallback_error_is_attached() {
        let err = GroupingError::network("primary")
            .with_fallback_error(GroupingError::database("fallback"));
        assert_eq!(err.fallback_error().unwrap().message, "fallback");
        assert_eq!(err.message, "primary");
    }

    #[test]
    fn test_context_renders_as_json() {
        let ctx = ErrorContext::new("hooks", "flush")
            .for_report(&ReportId::from("r-1"))
            .with_detail("attempt", 2);
        let rendered = ctx.to_log_string();
        assert!(rendered.contains("\"report_id\":\"r-1\""));
        assert!(rendered.contains("\"attempt\":2"));
    }
}
