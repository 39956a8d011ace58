//! Authentication code endpoints.
//!
//! The owner generates a six-digit code and reads it to a prospective
//! contact. The contact's app previews it with `GET /api/auth-code` and
//! redeems it through `POST /api/contacts`.

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use siren_core::types::non_blank;
use siren_core::CODE_TTL_MINUTES;
use utoipa::{IntoParams, ToSchema};

use crate::api::error::{ApiResponse, ApiResult, ErrorResponse, ValidJson, ValidQuery};
use crate::state::SharedState;

/// Creates the auth code router.
pub fn router() -> Router<SharedState> {
    Router::new().route(
        "/auth-code",
        post(issue_code).get(lookup_code).delete(cancel_code),
    )
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// Request body for generating a code.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[schema(example = json!({
    "device_id": "6E400001-B5A3-F393-E0A9-E50E24DCCA9E",
    "device_name": "SIREN Ring",
    "user_id": "user123",
    "expires_in": 600
}))]
pub struct IssueCodeRequest {
    /// Owner's registered device.
    pub device_id: String,
    /// Accepted for compatibility; the registered display name is shown to contacts.
    #[serde(default)]
    pub device_name: Option<String>,
    /// Owner account; checked against the device when present.
    #[serde(default)]
    pub user_id: Option<String>,
    /// Accepted for compatibility; codes always live ten minutes.
    #[serde(default)]
    pub expires_in: Option<u64>,
}

/// A freshly issued code.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "code": "483920",
    "expires_at": "2026-01-15T12:40:00Z",
    "expires_in": 600
}))]
pub struct IssueCodeResponse {
    /// Six-digit code.
    pub code: String,
    /// When the code stops being redeemable.
    pub expires_at: DateTime<Utc>,
    /// Lifetime in seconds.
    pub expires_in: i64,
}

/// Query for previewing a code.
#[derive(Debug, Clone, Deserialize, IntoParams)]
pub struct LookupCodeQuery {
    /// Code read out by the owner.
    #[param(example = "483920")]
    pub code: String,
}

/// Owner identity behind a code.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "name": "SIREN Ring",
    "device_id": "6E400001-B5A3-F393-E0A9-E50E24DCCA9E",
    "has_app": true
}))]
pub struct LookupCodeResponse {
    /// Owner device's display name.
    pub name: String,
    /// Owner's device.
    pub device_id: String,
    /// Owners always run the app.
    pub has_app: bool,
}

/// Query for cancelling a device's code.
#[derive(Debug, Clone, Deserialize, IntoParams)]
pub struct CancelCodeQuery {
    /// Owner's device.
    pub device_id: String,
}

/// Result of a cancellation.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CancelCodeResponse {
    /// Active codes cancelled; zero when none was active.
    pub cancelled: usize,
}

// ============================================================================
// Handlers
// ============================================================================

/// Generate a code for the owner's device.
#[utoipa::path(
    post,
    path = "/api/auth-code",
    tag = "codes",
    operation_id = "issueAuthCode",
    summary = "Generate an authentication code",
    description = "Issues a six-digit code valid for ten minutes. Any code still active \
        for the same device is cancelled. The device must be registered.",
    request_body = IssueCodeRequest,
    responses(
        (status = 200, description = "Code issued", body = ApiResponse<IssueCodeResponse>),
        (status = 400, description = "Device not registered", body = ErrorResponse),
        (status = 409, description = "Caller does not own the device", body = ErrorResponse)
    )
)]
pub async fn issue_code(
    State(state): State<SharedState>,
    ValidJson(request): ValidJson<IssueCodeRequest>,
) -> ApiResult<Json<ApiResponse<IssueCodeResponse>>> {
    tracing::debug!(
        device_id = %request.device_id,
        device_name = ?request.device_name,
        expires_in = ?request.expires_in,
        "Code requested; fixed lifetime applies"
    );
    let user_id = non_blank(request.user_id);
    let auth = state
        .siren()
        .issue_code(&request.device_id, user_id.as_deref())
        .await?;

    Ok(ApiResponse::ok(IssueCodeResponse {
        code: auth.code,
        expires_at: auth.expires_at,
        expires_in: CODE_TTL_MINUTES * 60,
    }))
}

/// Preview a code without consuming it.
#[utoipa::path(
    get,
    path = "/api/auth-code",
    tag = "codes",
    operation_id = "lookupAuthCode",
    summary = "Look up an authentication code",
    description = "Returns the owner behind a code so the contact can confirm before \
        linking. Does not consume the code.",
    params(LookupCodeQuery),
    responses(
        (status = 200, description = "Code is redeemable", body = ApiResponse<LookupCodeResponse>),
        (status = 404, description = "Unknown code", body = ErrorResponse),
        (status = 409, description = "Code already used", body = ErrorResponse),
        (status = 410, description = "Code expired or cancelled", body = ErrorResponse)
    )
)]
pub async fn lookup_code(
    State(state): State<SharedState>,
    ValidQuery(query): ValidQuery<LookupCodeQuery>,
) -> ApiResult<Json<ApiResponse<LookupCodeResponse>>> {
    let owner = state.siren().codes().lookup(query.code.trim()).await?;
    Ok(ApiResponse::ok(LookupCodeResponse {
        name: owner.owner_display_name,
        device_id: owner.owner_device_id,
        has_app: true,
    }))
}

/// Cancel the device's active code.
#[utoipa::path(
    delete,
    path = "/api/auth-code",
    tag = "codes",
    operation_id = "cancelAuthCode",
    summary = "Cancel the active authentication code",
    description = "Invalidates any active code for the device immediately. Idempotent.",
    params(CancelCodeQuery),
    responses(
        (status = 200, description = "Codes cancelled", body = ApiResponse<CancelCodeResponse>)
    )
)]
pub async fn cancel_code(
    State(state): State<SharedState>,
    ValidQuery(query): ValidQuery<CancelCodeQuery>,
) -> ApiResult<Json<ApiResponse<CancelCodeResponse>>> {
    let cancelled = state.siren().codes().cancel(&query.device_id).await?;
    Ok(ApiResponse::ok(CancelCodeResponse { cancelled }))
}
