//! Device registration endpoints.
//!
//! The phone registers its paired SIREN Ring under the owner's account and
//! keeps the owner's push token current. Token rotations propagate to every
//! relationship row that lists this device as a contact.

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use siren_core::types::non_blank;
use siren_core::{redact_token, Device};
use utoipa::ToSchema;

use crate::api::error::{ApiResponse, ApiResult, ErrorResponse, ValidJson};
use crate::state::SharedState;

/// Creates the devices router.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/register-device", post(register_device))
        .route("/update-token", post(update_token))
        .route("/deregister-device", post(deregister_device))
        .route("/devices/{device_id}", get(get_device))
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// Request body for registering a device.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[schema(example = json!({
    "device_id": "6E400001-B5A3-F393-E0A9-E50E24DCCA9E",
    "user_id": "user123",
    "device_name": "SIREN Ring",
    "apns_token": "a1b2c3d4e5f6"
}))]
pub struct RegisterDeviceRequest {
    /// Firmware-assigned device identifier.
    pub device_id: String,
    /// Owner account.
    pub user_id: String,
    /// Display name for the device.
    pub device_name: String,
    /// Owner phone's push token, if already known.
    #[serde(default)]
    pub apns_token: Option<String>,
}

/// Result of a registration.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RegisterDeviceResponse {
    /// Registered device.
    pub device_id: String,
    /// Always `true` on success.
    pub registered: bool,
    /// Relationship rows rewritten if the supplied token rotated an old one.
    pub relationships_updated: usize,
}

/// Request body for updating the push token.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[schema(example = json!({
    "device_id": "6E400001-B5A3-F393-E0A9-E50E24DCCA9E",
    "apns_token": "f6e5d4c3b2a1",
    "user_id": "user123"
}))]
pub struct UpdateTokenRequest {
    /// Device whose token changed.
    pub device_id: String,
    /// New push token.
    pub apns_token: String,
    /// Owner account; checked against the device when present.
    #[serde(default)]
    pub user_id: Option<String>,
}

/// Result of a token update.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({ "relationships_updated": 3, "rotated": true }))]
pub struct UpdateTokenResponse {
    /// Relationship rows rewritten with the new token.
    pub relationships_updated: usize,
    /// Whether an older token was replaced.
    pub rotated: bool,
}

/// Request body for deregistering a device.
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct DeregisterDeviceRequest {
    /// Device to deregister.
    pub device_id: String,
    /// Owner account; checked against the device when present.
    #[serde(default)]
    pub user_id: Option<String>,
}

/// Result of a deregistration.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DeregisterDeviceResponse {
    /// Deregistered device.
    pub device_id: String,
    /// Always `false` on success.
    pub registered: bool,
    /// Active authentication codes cancelled alongside.
    pub codes_cancelled: usize,
}

/// Registration view of a device. The push token is redacted.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DeviceView {
    /// Device identifier.
    pub device_id: String,
    /// Owner account.
    pub owner_user_id: String,
    /// Display name.
    pub display_name: String,
    /// Whether the device is currently registered.
    pub registered: bool,
    /// Redacted push token of the owner's phone.
    #[schema(nullable, example = "a1b2c3d4…")]
    pub push_token: Option<String>,
    /// Set when the push gateway rejected the token.
    #[schema(nullable)]
    pub token_flagged_at: Option<DateTime<Utc>>,
    /// First registration.
    pub registered_at: DateTime<Utc>,
    /// Last change.
    pub updated_at: DateTime<Utc>,
}

impl From<Device> for DeviceView {
    fn from(device: Device) -> Self {
        Self {
            device_id: device.device_id,
            owner_user_id: device.owner_user_id,
            display_name: device.display_name,
            registered: device.registered,
            push_token: device.push_token.as_deref().map(redact_token),
            token_flagged_at: device.token_flagged_at,
            registered_at: device.registered_at,
            updated_at: device.updated_at,
        }
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Register a wearable to its owner.
#[utoipa::path(
    post,
    path = "/api/register-device",
    tag = "devices",
    operation_id = "registerDevice",
    summary = "Register a device",
    description = "Binds a device id to an owner account. Re-registration by the same \
        owner is idempotent and updates the display name. A device registered to \
        another owner is rejected with `conflict`.",
    request_body = RegisterDeviceRequest,
    responses(
        (status = 200, description = "Device registered", body = ApiResponse<RegisterDeviceResponse>),
        (status = 400, description = "Invalid input", body = ErrorResponse),
        (status = 409, description = "Device claimed by another owner", body = ErrorResponse)
    )
)]
pub async fn register_device(
    State(state): State<SharedState>,
    ValidJson(request): ValidJson<RegisterDeviceRequest>,
) -> ApiResult<Json<ApiResponse<RegisterDeviceResponse>>> {
    let devices = state.siren().devices();
    let device = devices
        .register(&request.device_id, &request.user_id, &request.device_name)
        .await?;

    let relationships_updated = match non_blank(request.apns_token) {
        Some(token) => {
            devices
                .update_push_token(&device.device_id, &token, Some(&request.user_id))
                .await?
                .relationships_updated
        }
        None => 0,
    };

    Ok(ApiResponse::ok(RegisterDeviceResponse {
        device_id: device.device_id,
        registered: true,
        relationships_updated,
    }))
}

/// Replace the owner's push token.
#[utoipa::path(
    post,
    path = "/api/update-token",
    tag = "devices",
    operation_id = "updateToken",
    summary = "Update a device's push token",
    description = "Stores the new token. If it replaces a different one, every \
        relationship that lists this device as a contact is rewritten and the \
        count is returned as `relationships_updated`.",
    request_body = UpdateTokenRequest,
    responses(
        (status = 200, description = "Token stored", body = ApiResponse<UpdateTokenResponse>),
        (status = 400, description = "Invalid token", body = ErrorResponse),
        (status = 404, description = "Unknown device", body = ErrorResponse),
        (status = 409, description = "Caller does not own the device", body = ErrorResponse)
    )
)]
pub async fn update_token(
    State(state): State<SharedState>,
    ValidJson(request): ValidJson<UpdateTokenRequest>,
) -> ApiResult<Json<ApiResponse<UpdateTokenResponse>>> {
    let user_id = non_blank(request.user_id);
    let update = state
        .siren()
        .devices()
        .update_push_token(&request.device_id, &request.apns_token, user_id.as_deref())
        .await?;

    Ok(ApiResponse::ok(UpdateTokenResponse {
        relationships_updated: update.relationships_updated,
        rotated: update.rotated,
    }))
}

/// Deregister a wearable.
#[utoipa::path(
    post,
    path = "/api/deregister-device",
    tag = "devices",
    operation_id = "deregisterDevice",
    summary = "Deregister a device",
    description = "Marks the device unregistered and cancels its active authentication \
        code. Owner and push token are kept so the owner can reconnect without pairing \
        again.",
    request_body = DeregisterDeviceRequest,
    responses(
        (status = 200, description = "Device deregistered", body = ApiResponse<DeregisterDeviceResponse>),
        (status = 404, description = "Unknown device", body = ErrorResponse),
        (status = 409, description = "Caller does not own the device", body = ErrorResponse)
    )
)]
pub async fn deregister_device(
    State(state): State<SharedState>,
    ValidJson(request): ValidJson<DeregisterDeviceRequest>,
) -> ApiResult<Json<ApiResponse<DeregisterDeviceResponse>>> {
    let user_id = non_blank(request.user_id);
    let result = state
        .siren()
        .deregister_device(&request.device_id, user_id.as_deref())
        .await?;

    Ok(ApiResponse::ok(DeregisterDeviceResponse {
        device_id: result.device.device_id,
        registered: result.device.registered,
        codes_cancelled: result.codes_cancelled,
    }))
}

/// Look up a device's registration.
#[utoipa::path(
    get,
    path = "/api/devices/{device_id}",
    tag = "devices",
    operation_id = "getDevice",
    summary = "Get a device",
    params(("device_id" = String, Path, description = "Device identifier")),
    responses(
        (status = 200, description = "Device found", body = ApiResponse<DeviceView>),
        (status = 404, description = "Unknown device", body = ErrorResponse)
    )
)]
pub async fn get_device(
    State(state): State<SharedState>,
    Path(device_id): Path<String>,
) -> ApiResult<Json<ApiResponse<DeviceView>>> {
    let device = state.siren().devices().get(&device_id).await?;
    Ok(ApiResponse::ok(DeviceView::from(device)))
}
