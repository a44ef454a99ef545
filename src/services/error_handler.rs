// src/services/error_handler.rs
//
// Structured error logging, retry with exponential backoff and primary/fallback
// execution. One handler is built by the host and shared (Arc) with whatever
// needs it; there is no global instance.

use chrono::{DateTime, Utc};
use log::{Level, debug, info, log, warn};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::config::RetryConfig;
use crate::error::{ErrorCategory, ErrorContext, GroupingError, Result};

/// Number of structured entries kept for `recent_logs`
pub const RECENT_LOG_CAPACITY: usize = 100;

const LOG_TARGET_ROOT: &str = "hazard_grouping";

/// Host-supplied sink for errors nobody else handled.
pub type ErrorReporter = Arc<dyn Fn(&GroupingError) + Send + Sync>;

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<ErrorCategory>,
    pub message: String,
    pub context: ErrorContext,
}

pub struct ErrorHandler {
    retry: RetryConfig,
    reporter: Option<ErrorReporter>,
    recent: Mutex<VecDeque<LogEntry>>,
    stats: Mutex<HashMap<ErrorCategory, u64>>,
}

impl ErrorHandler {
    pub fn new(retry: RetryConfig) -> Self {
        Self {
            retry,
            reporter: None,
            recent: Mutex::new(VecDeque::with_capacity(RECENT_LOG_CAPACITY)),
            stats: Mutex::new(HashMap::new()),
        }
    }

    /// Register the callback that receives uncaught errors.
    pub fn with_reporter(mut self, reporter: ErrorReporter) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    /// Emit a structured log line and keep it in the recent-log buffer.
    ///
    /// The log target is `hazard_grouping::<category>` so categories can be
    /// filtered independently with RUST_LOG.
    pub fn log(
        &self,
        level: Level,
        category: Option<ErrorCategory>,
        message: &str,
        context: &ErrorContext,
    ) {
        let target = match category {
            Some(c) => format!("{}::{}", LOG_TARGET_ROOT, c),
            None => LOG_TARGET_ROOT.to_string(),
        };
        log!(target: target.as_str(), level, "{} {}", message, context.to_log_string());

        let mut recent = lock(&self.recent);
        if recent.len() == RECENT_LOG_CAPACITY {
            recent.pop_front();
        }
        recent.push_back(LogEntry {
            timestamp: Utc::now(),
            level: level.to_string(),
            category,
            message: message.to_string(),
            context: context.clone(),
        });
    }

    /// Log a typed error and count it against its category.
    pub fn log_error(&self, error: &GroupingError) {
        let level = match error.category {
            ErrorCategory::Validation => Level::Warn,
            _ if error.recoverable => Level::Warn,
            _ => Level::Error,
        };
        self.log(level, Some(error.category), &error.to_string(), &error.context);
        *lock(&self.stats).entry(error.category).or_insert(0) += 1;
    }

    /// Run `operation` until it succeeds, retrying recoverable failures up to
    /// `max_retries` times. The wait after failed attempt `n` (0-based) is
    /// `retry_delay_ms * 2^n`. Non-recoverable errors are returned at once.
    pub async fn with_retry<T, F, Fut>(&self, context: &ErrorContext, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_retries = self.retry.max_retries;
        let mut attempt: u32 = 0;
        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        info!(
                            "{}::{} succeeded after {} retries",
                            context.component, context.operation, attempt
                        );
                    }
                    return Ok(value);
                }
                Err(e) => {
                    let e = with_default_context(e, context);
                    if !e.recoverable {
                        self.log_error(&e);
                        return Err(e);
                    }
                    if attempt >= max_retries {
                        warn!(
                            "{}::{} failed after {} attempts",
                            context.component,
                            context.operation,
                            attempt + 1
                        );
                        self.log_error(&e);
                        return Err(e);
                    }

                    let delay = self.backoff_delay(attempt);
                    warn!(
                        "Retry {}/{} for {}::{} in {:.2?}: {}",
                        attempt + 1,
                        max_retries,
                        context.component,
                        context.operation,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Delay before retry number `attempt + 1`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u64.checked_pow(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(self.retry.retry_delay_ms.saturating_mul(factor))
    }

    /// Run `primary` with retries; if it still fails, run `fallback` once.
    ///
    /// When both fail, both are logged and the primary error is returned with
    /// the fallback error attached.
    pub async fn with_fallback<T, P, PFut, B, BFut>(
        &self,
        context: &ErrorContext,
        primary: P,
        fallback: B,
    ) -> Result<T>
    where
        P: FnMut() -> PFut,
        PFut: Future<Output = Result<T>>,
        B: FnOnce() -> BFut,
        BFut: Future<Output = Result<T>>,
    {
        let primary_error = match self.with_retry(context, primary).await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        debug!(
            "Primary {}::{} exhausted, running fallback",
            context.component, context.operation
        );
        match fallback().await {
            Ok(value) => {
                info!(
                    "Fallback for {}::{} succeeded after primary failure: {}",
                    context.component, context.operation, primary_error
                );
                Ok(value)
            }
            Err(fallback_error) => {
                let fallback_error = with_default_context(fallback_error, context);
                self.log(
                    Level::Error,
                    Some(primary_error.category),
                    &format!(
                        "Primary and fallback both failed: primary: {}; fallback: {}",
                        primary_error, fallback_error
                    ),
                    context,
                );
                self.log_error(&fallback_error);
                Err(primary_error.with_fallback_error(fallback_error))
            }
        }
    }

    /// Fail with a validation error when `condition` is false.
    pub fn validate(&self, condition: bool, message: &str, context: &ErrorContext) -> Result<()> {
        if condition {
            return Ok(());
        }
        let error = GroupingError::validation(message).with_context(context.clone());
        self.log_error(&error);
        Err(error)
    }

    /// Log an error that escaped every other handler and forward it to the
    /// registered reporter.
    pub fn report_uncaught(&self, error: &GroupingError) {
        self.log(
            Level::Error,
            Some(error.category),
            &format!("Uncaught error: {}", error),
            &error.context,
        );
        *lock(&self.stats).entry(error.category).or_insert(0) += 1;
        match &self.reporter {
            Some(reporter) => reporter(error),
            None => debug!("No error reporter registered; uncaught error only logged"),
        }
    }

    /// Most recent structured entries, oldest first.
    pub fn recent_logs(&self) -> Vec<LogEntry> {
        lock(&self.recent).iter().cloned().collect()
    }

    /// Errors logged so far, per category.
    pub fn error_stats(&self) -> HashMap<ErrorCategory, u64> {
        lock(&self.stats).clone()
    }
}

impl Default for ErrorHandler {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

fn with_default_context(error: GroupingError, context: &ErrorContext) -> GroupingError {
    if error.context.operation.is_empty() {
        error.with_context(context.clone())
    } else {
        error
    }
}

// A panic while holding one of these locks leaves plain data behind; keep going
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
