use serde::{Deserialize, Serialize};
use std::fmt::Display;
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    BadRequest,
    NotFound,
    Conflict,
    Precondition,
    Internal,
    ServiceUnavailable,
}

/// Error reported back to API callers, either synchronously or as the result
/// of a failed operation.
///
/// `message` is the short, user facing description. `details` carries long
/// form diagnostics (e.g. the captured stderr of a failed `cvd` execution)
/// and `cause` the underlying error chain.
#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("{message}")]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        ApiError {
            kind,
            message: message.into(),
            details: None,
            cause: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Precondition, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ServiceUnavailable, message)
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    // Alternate formatting prints the whole chain for `eyre::Report`.
    pub fn with_cause(mut self, cause: impl Display) -> Self {
        self.cause = Some(format!("{cause:#}"));
        self
    }
}

/// Aggregation of independent failures, e.g. from concurrent artifact
/// fetches. Every cause is kept, in the order it was collected.
#[derive(Clone, Debug, Default, Error, PartialEq, Eq)]
#[error("{} error(s) occurred: {}", .0.len(), .0.join("; "))]
pub struct MultiError(pub Vec<String>);

impl MultiError {
    pub fn push(&mut self, err: impl Display) {
        self.0.push(format!("{err:#}"));
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_result(self) -> Result<(), MultiError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_cause_keeps_eyre_chain() {
        let report = eyre::eyre!("connection refused").wrap_err("download failed");
        let err = ApiError::internal("failed to launch cvd").with_cause(report);

        assert_eq!(err.kind, ErrorKind::Internal);
        assert_eq!(err.to_string(), "failed to launch cvd");
        assert_eq!(
            err.cause.as_deref(),
            Some("download failed: connection refused")
        );
    }

    #[test]
    fn test_multi_error_keeps_every_cause() {
        let mut errors = MultiError::default();
        assert!(errors.clone().into_result().is_ok());

        errors.push("kernel fetch failed");
        errors.push(eyre::eyre!("bootloader fetch failed"));

        let err = errors.into_result().unwrap_err();
        let msg = err.to_string();
        assert!(msg.starts_with("2 error(s) occurred"));
        assert!(msg.contains("kernel fetch failed"));
        assert!(msg.contains("bootloader fetch failed"));
    }
}
