//! Error types for CodeLingo client operations

use thiserror::Error;

/// Sub-classification of a 4xx response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientErrorKind {
    /// 400 / 422: the server rejected the payload.
    Validation,
    /// 401 on a request that does not carry (or refresh) a session.
    AuthDenied,
    /// 403
    Forbidden,
    /// 404
    NotFound,
    /// 409
    Conflict,
    /// 429
    RateLimited,
    Other,
}

impl ClientErrorKind {
    pub fn from_status(status: u16) -> Self {
        match status {
            400 | 422 => Self::Validation,
            401 => Self::AuthDenied,
            403 => Self::Forbidden,
            404 => Self::NotFound,
            409 => Self::Conflict,
            429 => Self::RateLimited,
            _ => Self::Other,
        }
    }
}

/// Failures of a single logical API request.
///
/// Every variant is `Clone` so that one outcome can be handed to every
/// caller waiting on a deduplicated flight.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("Network unreachable: {reason}")]
    NetworkUnreachable { reason: String },

    #[error("Request rejected with status {status} ({kind:?}): {message}")]
    ClientRequest {
        status: u16,
        kind: ClientErrorKind,
        message: String,
    },

    #[error("Server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("Session expired")]
    SessionExpired,

    #[error("No refresh credential available")]
    RefreshUnavailable,

    #[error("Invalid response: {reason}")]
    InvalidResponse { reason: String },

    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },
}

impl RequestError {
    /// Build the error for a non-success HTTP status.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        if (400..500).contains(&status) {
            Self::ClientRequest {
                status,
                kind: ClientErrorKind::from_status(status),
                message,
            }
        } else {
            Self::Server { status, message }
        }
    }

    /// HTTP status carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::ClientRequest { status, .. } | Self::Server { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether a caller-level retry may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NetworkUnreachable { .. } | Self::Server { .. })
    }

    /// Whether the failure means the user has to sign in again.
    pub fn requires_login(&self) -> bool {
        matches!(self, Self::SessionExpired | Self::RefreshUnavailable)
    }
}

/// Durable client storage errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Storage IO failed for {key}: {reason}")]
    Io { key: String, reason: String },

    #[error("Corrupt record {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// Local input validation errors (inline form errors).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    RequiredFieldMissing { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Passwords do not match")]
    PasswordMismatch,
}

/// Master error type for all CodeLingo client errors.
#[derive(Debug, Clone, Error)]
pub enum CodelingoError {
    #[error("Request error: {0}")]
    Request(#[from] RequestError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Several validation errors reported at once.
    #[error("Validation failed: {}", join_errors(.0))]
    InvalidInput(Vec<ValidationError>),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl CodelingoError {
    pub fn as_request(&self) -> Option<&RequestError> {
        match self {
            Self::Request(err) => Some(err),
            _ => None,
        }
    }
}

/// Result type alias for CodeLingo operations.
pub type CodelingoResult<T> = Result<T, CodelingoError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_status_classifies_client_errors() {
        let err = RequestError::from_status(422, "bad email");
        assert_eq!(
            err,
            RequestError::ClientRequest {
                status: 422,
                kind: ClientErrorKind::Validation,
                message: "bad email".to_string(),
            }
        );
        assert!(!err.is_retryable());

        let err = RequestError::from_status(401, "Invalid credentials");
        assert!(matches!(
            err,
            RequestError::ClientRequest {
                kind: ClientErrorKind::AuthDenied,
                ..
            }
        ));
    }

    #[test]
    fn test_from_status_classifies_server_errors() {
        let err = RequestError::from_status(503, "down");
        assert_eq!(err.status(), Some(503));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_network_error_is_retryable() {
        let err = RequestError::NetworkUnreachable {
            reason: "connection refused".to_string(),
        };
        assert!(err.is_retryable());
        assert_eq!(err.status(), None);
    }

    #[test]
    fn test_auth_failures_require_login() {
        assert!(RequestError::SessionExpired.requires_login());
        assert!(RequestError::RefreshUnavailable.requires_login());
        assert!(!RequestError::SessionExpired.is_retryable());
        assert!(!RequestError::from_status(404, "missing").requires_login());
    }

    #[test]
    fn test_request_error_display() {
        let err = RequestError::from_status(409, "already enrolled");
        let msg = format!("{}", err);
        assert!(msg.contains("409"));
        assert!(msg.contains("Conflict"));
        assert!(msg.contains("already enrolled"));
    }

    #[test]
    fn test_invalid_input_display_joins_errors() {
        let err = CodelingoError::InvalidInput(vec![
            ValidationError::RequiredFieldMissing {
                field: "email".to_string(),
            },
            ValidationError::PasswordMismatch,
        ]);
        let msg = format!("{}", err);
        assert!(msg.contains("email"));
        assert!(msg.contains("Passwords do not match"));
    }

    #[test]
    fn test_codelingo_error_from_variants() {
        let request = CodelingoError::from(RequestError::SessionExpired);
        assert!(matches!(request, CodelingoError::Request(_)));
        assert_eq!(request.as_request(), Some(&RequestError::SessionExpired));

        let storage = CodelingoError::from(StorageError::LockPoisoned);
        assert!(matches!(storage, CodelingoError::Storage(_)));
        assert!(storage.as_request().is_none());

        let validation = CodelingoError::from(ValidationError::PasswordMismatch);
        assert!(matches!(validation, CodelingoError::Validation(_)));
    }
}
