//! Emergency trigger and alert telemetry endpoints.
//!
//! `POST /api/emergency` records the alert and returns at once; delivery
//! runs in the background. Outcomes stay queryable under `/api/alerts`.

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use siren_core::types::non_blank;
use siren_core::{
    redact_token, AlertEvent, AlertStatus, DeliveryOutcome, EmergencyKind, FlaggedToken,
    RecipientDelivery, TriggerRequest,
};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::api::error::{ApiError, ApiResponse, ApiResult, ErrorResponse, ValidJson, ValidQuery};
use crate::state::SharedState;

/// Creates the emergency router.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/emergency", post(trigger_emergency))
        .route("/alerts", get(list_alerts))
        .route("/alerts/{id}", get(get_alert))
        .route("/flagged-tokens", get(list_flagged_tokens))
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// Request body for an emergency trigger.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[schema(example = json!({
    "emergency_type": "activate",
    "timestamp": "2026-01-15T12:30:00Z",
    "user_id": "user123",
    "device_tokens": [],
    "message": null,
    "priority": "critical"
}))]
pub struct EmergencyRequest {
    /// `activate` (default) or a stand-down word such as `deactivate`.
    #[serde(default)]
    pub emergency_type: Option<String>,
    /// When the wearable signalled (RFC 3339).
    #[serde(default)]
    pub timestamp: Option<String>,
    /// Owner in distress.
    #[serde(default)]
    pub user_id: Option<String>,
    /// Wearable that signalled; resolves the owner when `user_id` is absent.
    #[serde(default)]
    pub device_id: Option<String>,
    /// Extra tokens to alert besides the owner's contacts.
    #[serde(default)]
    pub device_tokens: Vec<String>,
    /// Overrides the default alert text.
    #[serde(default)]
    pub message: Option<String>,
    /// Accepted for compatibility; activations are always critical.
    #[serde(default)]
    pub priority: Option<String>,
}

/// Acknowledgement of a trigger.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "alert_id": "01945a3c-7d1e-7000-8000-000000000000",
    "status": "created",
    "recipients": 2
}))]
pub struct EmergencyResponse {
    /// Recorded alert event.
    pub alert_id: Uuid,
    /// Status at the time of the response.
    pub status: AlertStatus,
    /// Number of recipients resolved.
    pub recipients: usize,
}

/// One recipient of an alert. The push token is redacted.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RecipientView {
    /// Relationship the recipient came from.
    #[schema(nullable)]
    pub relationship_id: Option<Uuid>,
    /// Contact display name.
    #[schema(nullable)]
    pub contact_name: Option<String>,
    /// Contact device.
    #[schema(nullable)]
    pub contact_device_id: Option<String>,
    /// Redacted push token.
    #[schema(nullable)]
    pub push_token: Option<String>,
    /// Delivery state.
    pub outcome: DeliveryOutcome,
    /// Gateway calls made.
    pub attempts: u32,
    /// Reason of the last failure.
    #[schema(nullable)]
    pub last_error: Option<String>,
    /// When delivery succeeded.
    #[schema(nullable)]
    pub delivered_at: Option<DateTime<Utc>>,
}

impl From<RecipientDelivery> for RecipientView {
    fn from(r: RecipientDelivery) -> Self {
        Self {
            relationship_id: r.relationship_id,
            contact_name: r.contact_name,
            contact_device_id: r.contact_device_id,
            push_token: r.push_token.as_deref().map(redact_token),
            outcome: r.outcome,
            attempts: r.attempts,
            last_error: r.last_error,
            delivered_at: r.delivered_at,
        }
    }
}

/// Alert event telemetry.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AlertView {
    /// Event id.
    pub id: Uuid,
    /// Owner in distress.
    #[schema(nullable)]
    pub owner_user_id: Option<String>,
    /// Signalling wearable.
    #[schema(nullable)]
    pub owner_device_id: Option<String>,
    /// Activation or stand-down.
    pub kind: EmergencyKind,
    /// Lifecycle state.
    pub status: AlertStatus,
    /// Whether notifications were critical.
    pub critical: bool,
    /// Notification text.
    pub message: String,
    /// When the trigger was recorded.
    pub triggered_at: DateTime<Utc>,
    /// Timestamp supplied by the caller.
    #[schema(nullable)]
    pub reported_at: Option<DateTime<Utc>>,
    /// When the event became terminal.
    #[schema(nullable)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Recipients delivered.
    pub delivered: usize,
    /// Per-recipient outcomes.
    pub recipients: Vec<RecipientView>,
}

impl From<AlertEvent> for AlertView {
    fn from(event: AlertEvent) -> Self {
        Self {
            delivered: event.delivered_count(),
            id: event.id,
            owner_user_id: event.owner_user_id,
            owner_device_id: event.owner_device_id,
            kind: event.kind,
            status: event.status,
            critical: event.critical,
            message: event.message,
            triggered_at: event.triggered_at,
            reported_at: event.reported_at,
            completed_at: event.completed_at,
            recipients: event.recipients.into_iter().map(RecipientView::from).collect(),
        }
    }
}

/// Query identifying the owner.
#[derive(Debug, Clone, Deserialize, IntoParams)]
pub struct AlertsQuery {
    /// Owner account.
    pub user_id: String,
}

/// An owner's alert history, newest first.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AlertsResponse {
    /// Alert events.
    pub alerts: Vec<AlertView>,
}

/// A token the push gateway rejected. The token is redacted.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct FlaggedTokenView {
    /// Redacted token.
    pub token: String,
    /// Gateway's reason.
    pub reason: String,
    /// First rejection.
    pub first_flagged_at: DateTime<Utc>,
    /// Latest rejection.
    pub last_flagged_at: DateTime<Utc>,
    /// Rejections recorded.
    pub failures: u32,
    /// Alert of the latest rejection.
    pub last_alert_id: Uuid,
    /// Devices holding the token.
    pub device_ids: Vec<String>,
    /// Relationship rows holding the token.
    pub relationship_ids: Vec<Uuid>,
}

impl From<FlaggedToken> for FlaggedTokenView {
    fn from(flag: FlaggedToken) -> Self {
        Self {
            token: redact_token(&flag.token),
            reason: flag.reason,
            first_flagged_at: flag.first_flagged_at,
            last_flagged_at: flag.last_flagged_at,
            failures: flag.failures,
            last_alert_id: flag.last_alert_id,
            device_ids: flag.device_ids,
            relationship_ids: flag.relationship_ids,
        }
    }
}

/// Tokens awaiting operator follow-up.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct FlaggedTokensResponse {
    /// Flagged tokens, most recent first.
    pub tokens: Vec<FlaggedTokenView>,
}

// ============================================================================
// Handlers
// ============================================================================

/// Trigger an emergency alert.
#[utoipa::path(
    post,
    path = "/api/emergency",
    tag = "emergency",
    operation_id = "triggerEmergency",
    summary = "Trigger an emergency alert",
    description = "Records an alert event for the owner (from `user_id`, or resolved from \
        `device_id`) and fans it out to every emergency contact plus any extra \
        `device_tokens`. Returns immediately; individual delivery outcomes never fail \
        this call and are available from `GET /api/alerts/{id}`.",
    request_body = EmergencyRequest,
    responses(
        (status = 200, description = "Alert recorded", body = ApiResponse<EmergencyResponse>),
        (status = 400, description = "No owner, device or token given", body = ErrorResponse),
        (status = 404, description = "Unknown device", body = ErrorResponse)
    )
)]
pub async fn trigger_emergency(
    State(state): State<SharedState>,
    ValidJson(request): ValidJson<EmergencyRequest>,
) -> ApiResult<Json<ApiResponse<EmergencyResponse>>> {
    let reported_at = match non_blank(request.timestamp) {
        Some(ts) => Some(
            DateTime::parse_from_rfc3339(&ts)
                .map_err(|_| ApiError::invalid_field("timestamp", "must be an RFC 3339 timestamp"))?
                .with_timezone(&Utc),
        ),
        None => None,
    };
    let kind = request
        .emergency_type
        .as_deref()
        .map_or(EmergencyKind::Activated, EmergencyKind::from_type);

    tracing::debug!(priority = ?request.priority, kind = ?kind, "Emergency trigger received");

    let dispatcher = state.siren().alerts();
    let event = dispatcher
        .begin(TriggerRequest {
            owner_user_id: non_blank(request.user_id),
            owner_device_id: non_blank(request.device_id),
            kind,
            message: request.message,
            extra_tokens: request
                .device_tokens
                .into_iter()
                .filter(|t| !t.trim().is_empty())
                .collect(),
            reported_at,
        })
        .await?;

    if !event.status.is_terminal() {
        dispatcher.spawn_dispatch(event.id);
    }

    Ok(ApiResponse::ok(EmergencyResponse {
        alert_id: event.id,
        status: event.status,
        recipients: event.recipients.len(),
    }))
}

/// Fetch an alert event.
#[utoipa::path(
    get,
    path = "/api/alerts/{id}",
    tag = "emergency",
    operation_id = "getAlert",
    summary = "Get alert delivery status",
    params(("id" = Uuid, Path, description = "Alert id")),
    responses(
        (status = 200, description = "Alert found", body = ApiResponse<AlertView>),
        (status = 400, description = "Malformed id", body = ErrorResponse),
        (status = 404, description = "Unknown alert", body = ErrorResponse)
    )
)]
pub async fn get_alert(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ApiResponse<AlertView>>> {
    let id = Uuid::parse_str(&id).map_err(|_| ApiError::invalid_field("id", "must be a UUID"))?;
    let event = state.siren().alerts().get(id).await?;
    Ok(ApiResponse::ok(AlertView::from(event)))
}

/// List an owner's alerts.
#[utoipa::path(
    get,
    path = "/api/alerts",
    tag = "emergency",
    operation_id = "listAlerts",
    summary = "List an owner's alerts",
    params(AlertsQuery),
    responses(
        (status = 200, description = "Alerts, newest first", body = ApiResponse<AlertsResponse>)
    )
)]
pub async fn list_alerts(
    State(state): State<SharedState>,
    ValidQuery(query): ValidQuery<AlertsQuery>,
) -> ApiResult<Json<ApiResponse<AlertsResponse>>> {
    let alerts = state
        .siren()
        .alerts()
        .list_for_owner(&query.user_id)
        .await?
        .into_iter()
        .map(AlertView::from)
        .collect();
    Ok(ApiResponse::ok(AlertsResponse { alerts }))
}

/// List tokens flagged by permanent delivery failures.
#[utoipa::path(
    get,
    path = "/api/flagged-tokens",
    tag = "emergency",
    operation_id = "listFlaggedTokens",
    summary = "List flagged push tokens",
    description = "Tokens the push gateway rejected as invalid. They are never cleared \
        automatically; a token update on the owning device clears the flag on its rows.",
    responses(
        (status = 200, description = "Flagged tokens", body = ApiResponse<FlaggedTokensResponse>)
    )
)]
pub async fn list_flagged_tokens(
    State(state): State<SharedState>,
) -> ApiResult<Json<ApiResponse<FlaggedTokensResponse>>> {
    let tokens = state
        .siren()
        .alerts()
        .flagged_tokens()
        .await?
        .into_iter()
        .map(FlaggedTokenView::from)
        .collect();
    Ok(ApiResponse::ok(FlaggedTokensResponse { tokens }))
}
