//! # Error Types
//!
//! Crate-wide error enum. Operational errors (one tenant, one cycle) are
//! logged and retried by the caller; only construction and startup errors
//! are meant to halt a subsystem.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum SchedulerError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Messaging error: {0}")]
    Messaging(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Timeout: {operation} did not finish within {timeout:?}")]
    Timeout { operation: String, timeout: Duration },

    /// Backpressure signal: the caller should reject or slow the producer.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Buffer state error: {0}")]
    BufferState(String),

    #[error("Flush panicked: {0}")]
    FlushPanicked(String),

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{}", AggregateDisplay(.0))]
    Aggregate(Vec<SchedulerError>),
}

impl SchedulerError {
    pub fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout,
        }
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::ResourceExhausted(message.into())
    }

    /// True when the error (or any error it aggregates) is the backpressure
    /// condition returned by an over-full buffer.
    pub fn is_resource_exhausted(&self) -> bool {
        match self {
            Self::ResourceExhausted(_) => true,
            Self::Aggregate(errors) => errors.iter().any(Self::is_resource_exhausted),
            _ => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Prefix the message with context while keeping the variant.
    pub fn context(self, context: &str) -> Self {
        match self {
            Self::Database(msg) => Self::Database(format!("{context}: {msg}")),
            Self::Messaging(msg) => Self::Messaging(format!("{context}: {msg}")),
            Self::Configuration(msg) => Self::Configuration(format!("{context}: {msg}")),
            Self::Validation(msg) => Self::Validation(format!("{context}: {msg}")),
            Self::Worker(msg) => Self::Worker(format!("{context}: {msg}")),
            Self::Internal(msg) => Self::Internal(format!("{context}: {msg}")),
            other => other,
        }
    }
}

struct AggregateDisplay<'a>(&'a [SchedulerError]);

impl fmt::Display for AggregateDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} errors occurred:", self.0.len())?;
        for err in self.0 {
            write!(f, "\n\t* {err}")?;
        }
        Ok(())
    }
}

impl From<sqlx::Error> for SchedulerError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut => {
                SchedulerError::Database("connection pool timed out".to_string())
            }
            other => SchedulerError::Database(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        SchedulerError::Validation(format!("JSON serialization error: {err}"))
    }
}

impl From<config::ConfigError> for SchedulerError {
    fn from(err: config::ConfigError) -> Self {
        SchedulerError::Configuration(err.to_string())
    }
}

pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;

/// Collects independent failures from one fan-out so that a single failed
/// send never aborts its siblings.
#[derive(Debug, Default)]
pub struct ErrorAggregator {
    errors: Vec<SchedulerError>,
}

impl ErrorAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, err: SchedulerError) {
        self.errors.push(err);
    }

    pub fn record<T>(&mut self, result: SchedulerResult<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(err) => {
                self.errors.push(err);
                None
            }
        }
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn into_result(mut self) -> SchedulerResult<()> {
        match self.errors.len() {
            0 => Ok(()),
            1 => Err(self.errors.remove(0)),
            _ => Err(SchedulerError::Aggregate(self.errors)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregator_empty_is_ok() {
        assert!(ErrorAggregator::new().into_result().is_ok());
    }

    #[test]
    fn test_aggregator_single_error_is_unwrapped() {
        let mut agg = ErrorAggregator::new();
        agg.push(SchedulerError::Messaging("send failed".into()));
        let err = agg.into_result().unwrap_err();
        assert!(matches!(err, SchedulerError::Messaging(_)));
    }

    #[test]
    fn test_aggregator_multiple_errors() {
        let mut agg = ErrorAggregator::new();
        assert_eq!(agg.record::<()>(Err(SchedulerError::Messaging("a".into()))), None);
        assert_eq!(agg.record(Ok(7)), Some(7));
        agg.push(SchedulerError::Messaging("b".into()));

        let err = agg.into_result().unwrap_err();
        let display = err.to_string();
        assert!(display.starts_with("2 errors occurred:"));
        assert!(display.contains("Messaging error: a"));
        assert!(display.contains("Messaging error: b"));
    }

    #[test]
    fn test_resource_exhausted_detection() {
        assert!(SchedulerError::resource_exhausted("full").is_resource_exhausted());
        assert!(SchedulerError::Aggregate(vec![
            SchedulerError::Internal("x".into()),
            SchedulerError::resource_exhausted("full"),
        ])
        .is_resource_exhausted());
        assert!(!SchedulerError::Internal("x".into()).is_resource_exhausted());
    }

    #[test]
    fn test_context_keeps_variant() {
        let err = SchedulerError::Database("boom".into()).context("could not queue step runs");
        assert_eq!(
            err.to_string(),
            "Database error: could not queue step runs: boom"
        );
    }
}
