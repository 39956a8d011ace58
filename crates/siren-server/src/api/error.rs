//! API error types, the success envelope and validating extractors.
//!
//! Every response carries `success`. Failures add the taxonomy `kind`
//! (`not_found`, `expired`, `conflict`, `validation_error`,
//! `upstream_unavailable`, `internal`) and a specific `error` code.

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{FromRequest, FromRequestParts, Query, Request};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use siren_core::{ErrorKind, SirenError};
use utoipa::ToSchema;

/// Result type alias for API handlers.
pub type ApiResult<T> = Result<T, ApiError>;

/// Unified API error type.
///
/// Each variant maps to one HTTP status and one taxonomy kind.
#[derive(Debug, Clone)]
pub enum ApiError {
    /// 400 Bad Request - malformed or invalid input.
    BadRequest {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
        /// Optional structured details (e.g. the offending field).
        details: Option<serde_json::Value>,
    },

    /// 404 Not Found - unknown device, code, contact or alert.
    NotFound {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
    },

    /// 409 Conflict - the current state forbids the operation.
    Conflict {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
    },

    /// 410 Gone - the code's window has closed.
    Gone {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
    },

    /// 500 Internal Server Error - storage or configuration failure.
    InternalError {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
    },

    /// 503 Service Unavailable - an upstream dependency is unavailable.
    ServiceUnavailable {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
    },
}

impl ApiError {
    /// A 400 for `field`.
    pub fn invalid_field(field: &str, message: impl Into<String>) -> Self {
        Self::BadRequest {
            error_code: "validation_error".to_string(),
            message: format!("Invalid {field}: {}", message.into()),
            details: Some(serde_json::json!({ "field": field })),
        }
    }

    const fn kind(&self) -> ErrorKind {
        match self {
            Self::BadRequest { .. } => ErrorKind::ValidationError,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::Gone { .. } => ErrorKind::Expired,
            Self::InternalError { .. } => ErrorKind::Internal,
            Self::ServiceUnavailable { .. } => ErrorKind::UpstreamUnavailable,
        }
    }

    const fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Conflict { .. } => StatusCode::CONFLICT,
            Self::Gone { .. } => StatusCode::GONE,
            Self::InternalError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

/// Standard JSON error response body.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "success": false,
    "kind": "expired",
    "error": "code_expired",
    "message": "Authentication code has expired. Ask the owner to generate a new code.",
    "details": null
}))]
pub struct ErrorResponse {
    /// Always `false`.
    #[schema(example = false)]
    pub success: bool,

    /// Taxonomy category.
    #[schema(example = "expired")]
    pub kind: ErrorKind,

    /// Machine-readable error code.
    #[schema(example = "code_expired")]
    pub error: String,

    /// Human-readable error message.
    pub message: String,

    /// Optional structured details.
    #[schema(nullable)]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let kind = self.kind();
        let (error, message, details) = match self {
            Self::BadRequest {
                error_code,
                message,
                details,
            } => (error_code, message, details),
            Self::InternalError { error_code, message } => {
                tracing::error!(error_code = %error_code, message = %message, "Internal server error");
                (error_code, message, None)
            }
            Self::NotFound { error_code, message }
            | Self::Conflict { error_code, message }
            | Self::Gone { error_code, message }
            | Self::ServiceUnavailable { error_code, message } => (error_code, message, None),
        };

        let body = ErrorResponse {
            success: false,
            kind,
            error,
            message,
            details,
        };
        (status, Json(body)).into_response()
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BadRequest { message, .. } => write!(f, "Bad Request: {message}"),
            Self::NotFound { message, .. } => write!(f, "Not Found: {message}"),
            Self::Conflict { message, .. } => write!(f, "Conflict: {message}"),
            Self::Gone { message, .. } => write!(f, "Gone: {message}"),
            Self::InternalError { message, .. } => write!(f, "Internal Error: {message}"),
            Self::ServiceUnavailable { message, .. } => write!(f, "Service Unavailable: {message}"),
        }
    }
}

impl std::error::Error for ApiError {}

/// Convert from siren_core errors.
impl From<SirenError> for ApiError {
    fn from(err: SirenError) -> Self {
        let error_code = err.error_code().to_ascii_lowercase();
        let message = err.to_string();
        match err.kind() {
            ErrorKind::ValidationError => {
                let details = match &err {
                    SirenError::Validation { field, .. } => Some(serde_json::json!({ "field": field })),
                    _ => None,
                };
                Self::BadRequest {
                    error_code,
                    message,
                    details,
                }
            }
            ErrorKind::NotFound => Self::NotFound { error_code, message },
            ErrorKind::Conflict => Self::Conflict { error_code, message },
            ErrorKind::Expired => Self::Gone { error_code, message },
            ErrorKind::UpstreamUnavailable => Self::ServiceUnavailable { error_code, message },
            ErrorKind::Internal => Self::InternalError { error_code, message },
        }
    }
}

// ============================================================================
// Success envelope
// ============================================================================

/// Successful response: `{"success": true, "data": ...}`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ApiResponse<T> {
    /// Always `true`.
    #[schema(example = true)]
    pub success: bool,

    /// Payload.
    pub data: T,
}

impl<T> ApiResponse<T> {
    /// Wrap `data` in a success envelope.
    pub const fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data,
        })
    }
}

// ============================================================================
// Extractors
// ============================================================================

/// JSON body extractor whose rejections use [`ErrorResponse`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidJson<T>(pub T);

impl<S, T> FromRequest<S> for ValidJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(json_rejection(&rejection)),
        }
    }
}

fn json_rejection(rejection: &JsonRejection) -> ApiError {
    ApiError::BadRequest {
        error_code: "validation_error".to_string(),
        message: rejection.body_text(),
        details: None,
    }
}

/// Query-string extractor whose rejections use [`ErrorResponse`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidQuery<T>(pub T);

impl<S, T> FromRequestParts<S> for ValidQuery<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        match Query::<T>::from_request_parts(parts, state).await {
            Ok(Query(value)) => Ok(Self(value)),
            Err(rejection) => Err(query_rejection(&rejection)),
        }
    }
}

fn query_rejection(rejection: &QueryRejection) -> ApiError {
    ApiError::BadRequest {
        error_code: "validation_error".to_string(),
        message: rejection.body_text(),
        details: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_siren_errors_map_to_taxonomy() {
        let cases = [
            (SirenError::CodeNotFound("1".into()), StatusCode::NOT_FOUND),
            (SirenError::CodeExpired("1".into()), StatusCode::GONE),
            (SirenError::CodeAlreadyConsumed("1".into()), StatusCode::CONFLICT),
            (
                SirenError::DeviceAlreadyClaimed {
                    device_id: "d".into(),
                },
                StatusCode::CONFLICT,
            ),
            (SirenError::validation("name", "empty"), StatusCode::BAD_REQUEST),
            (
                SirenError::UpstreamUnavailable("down".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                SirenError::PersistenceError("disk".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
    }

    #[test]
    fn test_validation_error_carries_field() {
        let err = ApiError::from(SirenError::validation("apns_token", "too long"));
        match err {
            ApiError::BadRequest {
                error_code,
                details,
                ..
            } => {
                assert_eq!(error_code, "validation_error");
                assert_eq!(details, Some(serde_json::json!({ "field": "apns_token" })));
            }
            other => panic!("expected BadRequest, got {other:?}"),
        }
    }

    #[test]
    fn test_error_response_serialization() {
        let response = ErrorResponse {
            success: false,
            kind: ErrorKind::Expired,
            error: "code_expired".to_string(),
            message: "expired".to_string(),
            details: None,
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"success\":false"));
        assert!(json.contains("\"kind\":\"expired\""));
    }
}
