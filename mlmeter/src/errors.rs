use crate::ledger::LedgerError;
use crate::limits::RateLimitExceeded;
use crate::training::TrainingError;
use axum::{
    Json,
    http::{HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error as ThisError;

/// Tokens already taken for a request that subsequently failed.
pub const TOKENS_CHARGED_HEADER: HeaderName = HeaderName::from_static("x-tokens-charged");

pub const RATE_LIMIT_LIMIT_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const RATE_LIMIT_REMAINING_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const RATE_LIMIT_RESET_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-reset");

#[derive(ThisError, Debug)]
pub enum Error {
    /// Authentication required but not provided, or credentials rejected
    #[error("Not authenticated")]
    Unauthenticated { message: Option<String> },

    /// Invalid request data
    #[error("{message}")]
    BadRequest { message: String },

    /// Token ledger rejection
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// Sliding-window rate limit rejection
    #[error(transparent)]
    RateLimited(#[from] RateLimitExceeded),

    /// Model training or prediction failure
    #[error(transparent)]
    Training(#[from] TrainingError),

    /// A failure raised after the caller had already been charged
    #[error("{source}")]
    Charged { charged: u64, source: Box<Error> },

    /// Generic internal service error
    #[error("Failed to {operation}")]
    Internal { operation: String },
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Unauthenticated { .. } => StatusCode::UNAUTHORIZED,
            Error::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Error::Ledger(ledger_err) => match ledger_err {
                LedgerError::InsufficientFunds { .. } => StatusCode::PAYMENT_REQUIRED,
                LedgerError::NotFound { .. } => StatusCode::NOT_FOUND,
                LedgerError::AlreadyExists { .. } => StatusCode::CONFLICT,
                LedgerError::InvalidAmount | LedgerError::Overflow { .. } => StatusCode::BAD_REQUEST,
            },
            Error::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            Error::Training(training_err) => match training_err {
                // A missing feature is bad client input, not an unknown resource
                TrainingError::Validation { .. } | TrainingError::MissingFeature { .. } => StatusCode::BAD_REQUEST,
                TrainingError::ModelNotFound { .. } => StatusCode::NOT_FOUND,
                TrainingError::Io(_) | TrainingError::Serialization(_) | TrainingError::Internal { .. } => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            Error::Charged { source, .. } => source.status_code(),
            Error::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns a user-safe error message, without leaking internal implementation details
    pub fn user_message(&self) -> String {
        match self {
            Error::Unauthenticated { message } => message.clone().unwrap_or_else(|| "Authentication required".to_string()),
            Error::BadRequest { message } => message.clone(),
            Error::Ledger(ledger_err) => ledger_err.to_string(),
            Error::RateLimited(rate_err) => rate_err.to_string(),
            Error::Training(training_err) => match training_err {
                TrainingError::Io(_) | TrainingError::Serialization(_) | TrainingError::Internal { .. } => {
                    "Internal server error".to_string()
                }
                client_err => client_err.to_string(),
            },
            Error::Charged { source, .. } => source.user_message(),
            Error::Internal { .. } => "Internal server error".to_string(),
        }
    }

    fn is_internal(&self) -> bool {
        self.status_code().is_server_error()
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        // Log full error details for debugging - different log levels based on severity
        match &self {
            // The wrapped error is logged when it renders
            Error::Charged { charged, .. } => {
                tracing::debug!(charged, "Request failed after admission");
            }
            err if err.is_internal() => {
                tracing::error!("Internal service error: {:#}", err);
            }
            Error::Unauthenticated { .. } => {
                tracing::info!("Authentication error: {}", self);
            }
            Error::Ledger(LedgerError::InsufficientFunds { .. }) | Error::RateLimited(_) => {
                tracing::info!("Admission rejected: {}", self);
            }
            Error::Ledger(LedgerError::AlreadyExists { .. }) => {
                tracing::warn!("Conflict error: {}", self);
            }
            _ => {
                tracing::debug!("Client error: {}", self);
            }
        }

        match self {
            Error::Charged { charged, source } => {
                let mut response = source.into_response();
                response.headers_mut().insert(TOKENS_CHARGED_HEADER, HeaderValue::from(charged));
                response
            }
            Error::Ledger(LedgerError::InsufficientFunds { required, available }) => {
                let message = LedgerError::InsufficientFunds { required, available }.to_string();
                let body = json!({
                    "message": message,
                    "required": required,
                    "available": available,
                });
                (StatusCode::PAYMENT_REQUIRED, Json(body)).into_response()
            }
            Error::RateLimited(rate_err) => {
                let body = json!({
                    "message": rate_err.to_string(),
                    "limit": rate_err.limit,
                    "window_seconds": rate_err.window_seconds,
                    "retry_after": rate_err.retry_after,
                });
                let headers = [
                    (header::RETRY_AFTER, HeaderValue::from(rate_err.retry_after)),
                    (RATE_LIMIT_LIMIT_HEADER, HeaderValue::from(rate_err.limit)),
                    (RATE_LIMIT_REMAINING_HEADER, HeaderValue::from(0u32)),
                    (RATE_LIMIT_RESET_HEADER, HeaderValue::from(rate_err.reset_at.timestamp())),
                ];
                (StatusCode::TOO_MANY_REQUESTS, headers, Json(body)).into_response()
            }
            err @ Error::Unauthenticated { .. } => (
                err.status_code(),
                [(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"))],
                err.user_message(),
            )
                .into_response(),
            other => {
                // Everything else is a plain text message
                let status = other.status_code();
                (status, other.user_message()).into_response()
            }
        }
    }
}

/// Type alias for service operation results
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use chrono::{TimeZone, Utc};

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_insufficient_funds_is_402_with_hints() {
        let response = Error::from(LedgerError::InsufficientFunds {
            required: 5,
            available: 3,
        })
        .into_response();

        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
        let body = body_json(response).await;
        assert_eq!(body["required"], 5);
        assert_eq!(body["available"], 3);
        assert_eq!(body["message"], "Insufficient tokens. Required: 5, Available: 3");
    }

    #[tokio::test]
    async fn test_rate_limited_is_429_with_headers() {
        let reset_at = Utc.timestamp_opt(1_700_000_060, 0).unwrap();
        let response = Error::from(RateLimitExceeded {
            limit: 3,
            window_seconds: 60,
            retry_after: 57,
            reset_at,
        })
        .into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let headers = response.headers();
        assert_eq!(headers[header::RETRY_AFTER], "57");
        assert_eq!(headers[RATE_LIMIT_LIMIT_HEADER], "3");
        assert_eq!(headers[RATE_LIMIT_REMAINING_HEADER], "0");
        assert_eq!(headers[RATE_LIMIT_RESET_HEADER], "1700000060");

        let body = body_json(response).await;
        assert_eq!(body["retry_after"], 57);
        assert_eq!(body["limit"], 3);
    }

    #[test]
    fn test_status_mapping() {
        let cases = [
            (
                Error::from(LedgerError::NotFound {
                    identity: "a".to_string(),
                }),
                StatusCode::NOT_FOUND,
            ),
            (
                Error::from(LedgerError::AlreadyExists {
                    identity: "a".to_string(),
                }),
                StatusCode::CONFLICT,
            ),
            (
                Error::from(TrainingError::Validation {
                    message: "bad".to_string(),
                }),
                StatusCode::BAD_REQUEST,
            ),
            (
                Error::from(TrainingError::MissingFeature {
                    features: vec!["x".to_string()],
                }),
                StatusCode::BAD_REQUEST,
            ),
            (
                Error::from(TrainingError::ModelNotFound { name: "m".to_string() }),
                StatusCode::NOT_FOUND,
            ),
            (Error::Unauthenticated { message: None }, StatusCode::UNAUTHORIZED),
            (
                Error::Internal {
                    operation: "x".to_string(),
                },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (err, status) in cases {
            assert_eq!(err.status_code(), status, "{err}");
        }
    }

    #[test]
    fn test_internal_details_are_hidden() {
        let err = Error::from(TrainingError::Internal {
            message: "solver blew up at /tmp/secret".to_string(),
        });
        assert_eq!(err.user_message(), "Internal server error");
    }

    #[tokio::test]
    async fn test_charged_failure_keeps_status_and_adds_header() {
        let err = Error::Charged {
            charged: 1,
            source: Box::new(Error::from(TrainingError::Validation {
                message: "Column 'z' not found".to_string(),
            })),
        };
        assert_eq!(err.to_string(), "Column 'z' not found");

        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response.headers()[TOKENS_CHARGED_HEADER], "1");
    }

    #[test]
    fn test_unauthenticated_carries_challenge() {
        let response = Error::Unauthenticated { message: None }.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers()[header::WWW_AUTHENTICATE], "Bearer");
    }
}
