//! Emergency contact endpoints.

use axum::extract::{Path, State};
use axum::routing::{delete, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use siren_core::{ContactSignup, EmergencyRelationship};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::api::error::{ApiError, ApiResponse, ApiResult, ErrorResponse, ValidJson, ValidQuery};
use crate::state::SharedState;

/// Creates the contacts router.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/contacts", post(add_contact).get(list_contacts))
        .route("/contacts/{id}", delete(remove_contact))
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// Request body sent by a contact redeeming an owner's code.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[schema(example = json!({
    "name": "Mom",
    "phone_number": "+15551234567",
    "auth_code": "483920",
    "apns_token": "f6e5d4c3b2a1",
    "has_app": true
}))]
pub struct AddContactRequest {
    /// Contact's display name.
    pub name: String,
    /// Contact's phone number.
    #[serde(default)]
    pub phone_number: Option<String>,
    /// Code read out by the owner.
    pub auth_code: String,
    /// Contact phone's push token.
    #[serde(default)]
    pub apns_token: Option<String>,
    /// Whether the contact runs the app.
    #[serde(default)]
    pub has_app: bool,
    /// Contact's own wearable, so later token rotations reach this row.
    #[serde(default)]
    pub device_id: Option<String>,
}

/// One emergency contact.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ContactView {
    /// Relationship id.
    pub id: Uuid,
    /// Owner alerted through this contact.
    pub owner_user_id: String,
    /// Contact's display name.
    pub name: String,
    /// Contact's device.
    #[schema(nullable)]
    pub device_id: Option<String>,
    /// Contact's phone number.
    #[schema(nullable)]
    pub phone_number: Option<String>,
    /// Whether the contact runs the app.
    pub has_app: bool,
    /// Whether a push token is on file.
    pub has_push_token: bool,
    /// Set when the push gateway rejected the token.
    #[schema(nullable)]
    pub token_flagged_at: Option<DateTime<Utc>>,
    /// When the contact was added.
    pub created_at: DateTime<Utc>,
}

impl From<EmergencyRelationship> for ContactView {
    fn from(rel: EmergencyRelationship) -> Self {
        Self {
            id: rel.id,
            owner_user_id: rel.owner_user_id,
            name: rel.contact_name,
            device_id: rel.contact_device_id,
            phone_number: rel.contact_phone_number,
            has_app: rel.contact_has_device,
            has_push_token: rel.contact_push_token.is_some(),
            token_flagged_at: rel.token_flagged_at,
            created_at: rel.created_at,
        }
    }
}

/// Result of a successful redemption.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AddContactResponse {
    /// The recorded relationship.
    pub contact: ContactView,
    /// Owner device's display name.
    pub owner_name: String,
    /// Owner's device.
    pub owner_device_id: String,
}

/// Query identifying the owner.
#[derive(Debug, Clone, Deserialize, IntoParams)]
pub struct OwnerQuery {
    /// Owner account.
    #[param(example = "user123")]
    pub user_id: String,
}

/// An owner's contacts in the order they were added.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ContactsResponse {
    /// Contacts.
    pub contacts: Vec<ContactView>,
}

/// Result of removing a contact.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RemoveContactResponse {
    /// Removed relationship id.
    pub removed: Uuid,
}

// ============================================================================
// Handlers
// ============================================================================

/// Redeem a code and become the owner's emergency contact.
#[utoipa::path(
    post,
    path = "/api/contacts",
    tag = "contacts",
    operation_id = "addContact",
    summary = "Redeem a code and add an emergency contact",
    description = "Atomically consumes the code and records the caller as an emergency \
        contact of the code's owner. A code can be redeemed exactly once.",
    request_body = AddContactRequest,
    responses(
        (status = 200, description = "Contact added", body = ApiResponse<AddContactResponse>),
        (status = 400, description = "Invalid input", body = ErrorResponse),
        (status = 404, description = "Unknown code", body = ErrorResponse),
        (status = 409, description = "Code already used or duplicate contact", body = ErrorResponse),
        (status = 410, description = "Code expired or cancelled", body = ErrorResponse)
    )
)]
pub async fn add_contact(
    State(state): State<SharedState>,
    ValidJson(request): ValidJson<AddContactRequest>,
) -> ApiResult<Json<ApiResponse<AddContactResponse>>> {
    let (relationship, owner) = state
        .siren()
        .add_contact_by_code(ContactSignup {
            auth_code: request.auth_code.trim().to_string(),
            name: request.name,
            phone_number: request.phone_number,
            push_token: request.apns_token,
            device_id: request.device_id,
            has_app: request.has_app,
        })
        .await?;

    Ok(ApiResponse::ok(AddContactResponse {
        contact: ContactView::from(relationship),
        owner_name: owner.owner_display_name,
        owner_device_id: owner.owner_device_id,
    }))
}

/// List an owner's emergency contacts.
#[utoipa::path(
    get,
    path = "/api/contacts",
    tag = "contacts",
    operation_id = "listContacts",
    summary = "List emergency contacts",
    params(OwnerQuery),
    responses(
        (status = 200, description = "Contacts in insertion order", body = ApiResponse<ContactsResponse>)
    )
)]
pub async fn list_contacts(
    State(state): State<SharedState>,
    ValidQuery(query): ValidQuery<OwnerQuery>,
) -> ApiResult<Json<ApiResponse<ContactsResponse>>> {
    let contacts = state
        .siren()
        .graph()
        .contacts_of(&query.user_id)
        .await?
        .into_iter()
        .map(ContactView::from)
        .collect();
    Ok(ApiResponse::ok(ContactsResponse { contacts }))
}

/// Remove one of an owner's emergency contacts.
#[utoipa::path(
    delete,
    path = "/api/contacts/{id}",
    tag = "contacts",
    operation_id = "removeContact",
    summary = "Remove an emergency contact",
    params(
        ("id" = Uuid, Path, description = "Relationship id"),
        OwnerQuery
    ),
    responses(
        (status = 200, description = "Contact removed", body = ApiResponse<RemoveContactResponse>),
        (status = 400, description = "Malformed id", body = ErrorResponse),
        (status = 404, description = "Unknown contact", body = ErrorResponse)
    )
)]
pub async fn remove_contact(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    ValidQuery(query): ValidQuery<OwnerQuery>,
) -> ApiResult<Json<ApiResponse<RemoveContactResponse>>> {
    let id = Uuid::parse_str(&id).map_err(|_| ApiError::invalid_field("id", "must be a UUID"))?;
    let removed = state
        .siren()
        .graph()
        .remove_relationship(&query.user_id, id)
        .await?;
    Ok(ApiResponse::ok(RemoveContactResponse { removed: removed.id }))
}
