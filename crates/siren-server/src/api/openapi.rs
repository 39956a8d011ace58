//! OpenAPI specification for the siren API.
//!
//! Served at `/api/openapi.json` and written to the workspace root by the
//! `gen-openapi` binary for mobile client generation.

use axum::Json;
use utoipa::OpenApi;

use super::codes::{CancelCodeResponse, IssueCodeRequest, IssueCodeResponse, LookupCodeResponse};
use super::contacts::{
    AddContactRequest, AddContactResponse, ContactView, ContactsResponse, RemoveContactResponse,
};
use super::devices::{
    DeregisterDeviceRequest, DeregisterDeviceResponse, DeviceView, RegisterDeviceRequest,
    RegisterDeviceResponse, UpdateTokenRequest, UpdateTokenResponse,
};
use super::emergency::{
    AlertView, AlertsResponse, EmergencyRequest, EmergencyResponse, FlaggedTokenView,
    FlaggedTokensResponse, RecipientView,
};
use super::error::ErrorResponse;
use super::health::HealthResponse;

/// Serve the OpenAPI specification as JSON.
pub async fn get_openapi_spec() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

/// The OpenAPI specification as pretty JSON.
///
/// # Errors
///
/// Returns an error if the document cannot be serialised.
pub fn get_openapi_json() -> Result<String, serde_json::Error> {
    ApiDoc::openapi().to_pretty_json()
}

/// Main OpenAPI document structure for siren.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "siren API",
        version = "0.1.0",
        description = r#"
# siren API

Backend for the SIREN Ring personal safety wearable.

## Flow

1. **Register** the ring to its owner (`registerDevice`) and keep the owner's push token current (`updateToken`).
2. **Pair contacts**: the owner generates a six-digit code (`issueAuthCode`, valid ten minutes); the contact previews it (`lookupAuthCode`) and redeems it exactly once (`addContact`).
3. **Alert**: when the ring is triggered (`triggerEmergency`) every contact receives a critical push notification. Delivery is retried for transient failures and each outcome is queryable (`getAlert`).

## Responses

Successful responses are `{"success": true, "data": ...}`. Errors are
`{"success": false, "kind": ..., "error": ..., "message": ...}` where `kind` is
one of `not_found`, `expired`, `conflict`, `validation_error`,
`upstream_unavailable`, `internal`.
"#,
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    ),
    servers(
        (url = "/", description = "siren server")
    ),
    tags(
        (name = "system", description = "Health checks"),
        (name = "devices", description = "Wearable registration and owner push tokens"),
        (name = "codes", description = "Short-lived authentication codes for pairing contacts"),
        (name = "contacts", description = "Emergency contact relationships"),
        (name = "emergency", description = "Emergency triggers, alert telemetry and flagged tokens")
    ),
    paths(
        super::health::health_check,
        super::devices::register_device,
        super::devices::update_token,
        super::devices::deregister_device,
        super::devices::get_device,
        super::codes::issue_code,
        super::codes::lookup_code,
        super::codes::cancel_code,
        super::contacts::add_contact,
        super::contacts::list_contacts,
        super::contacts::remove_contact,
        super::emergency::trigger_emergency,
        super::emergency::get_alert,
        super::emergency::list_alerts,
        super::emergency::list_flagged_tokens,
    ),
    components(
        schemas(
            ErrorResponse,
            HealthResponse,
            RegisterDeviceRequest,
            RegisterDeviceResponse,
            UpdateTokenRequest,
            UpdateTokenResponse,
            DeregisterDeviceRequest,
            DeregisterDeviceResponse,
            DeviceView,
            IssueCodeRequest,
            IssueCodeResponse,
            LookupCodeResponse,
            CancelCodeResponse,
            AddContactRequest,
            AddContactResponse,
            ContactView,
            ContactsResponse,
            RemoveContactResponse,
            EmergencyRequest,
            EmergencyResponse,
            AlertView,
            RecipientView,
            AlertsResponse,
            FlaggedTokenView,
            FlaggedTokensResponse,
        )
    )
)]
pub struct ApiDoc;
