//! Emergency contact relationships.
//!
//! An [`EmergencyRelationship`] is an edge from an owner to a contact who must
//! be alerted when the owner triggers an emergency. Edges are independent of
//! how they were established (normally by redeeming an auth code).
//!
//! The graph keeps contact push tokens live: when a contact's device rotates
//! its token, [`RelationshipGraph::propagate_token_change`] rewrites every row
//! that references that device.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::config::RelationshipsConfig;
use crate::error::{Result, SirenError};
use crate::storage::{Record, SharedRepository};
use crate::types::{redact_token, validate_identifier, validate_name, validate_push_token};

/// One owner → contact edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct EmergencyRelationship {
    /// Relationship id.
    pub id: Uuid,

    /// Owner whose emergencies reach this contact.
    #[schema(example = "user123")]
    pub owner_user_id: String,

    /// Contact's display name.
    #[schema(example = "Mom")]
    pub contact_name: String,

    /// Contact's own device id, absent for phone-only contacts.
    #[schema(nullable)]
    pub contact_device_id: Option<String>,

    /// Current push token of the contact.
    #[schema(nullable)]
    pub contact_push_token: Option<String>,

    /// Contact's phone number (degraded fallback channel, not used in-core).
    #[schema(nullable)]
    pub contact_phone_number: Option<String>,

    /// Whether the contact runs the app with their own wearable.
    pub contact_has_device: bool,

    /// When the edge was recorded.
    pub created_at: DateTime<Utc>,

    /// When the push token was last rewritten by propagation.
    #[schema(nullable)]
    pub token_updated_at: Option<DateTime<Utc>>,

    /// Set when the push gateway rejected the token permanently.
    #[schema(nullable)]
    pub token_flagged_at: Option<DateTime<Utc>>,
}

impl Record for EmergencyRelationship {
    const COLLECTION: &'static str = "relationships";

    fn key(&self) -> String {
        self.id.to_string()
    }
}

/// Input for [`RelationshipGraph::add_relationship`].
#[derive(Debug, Clone, Default)]
pub struct NewRelationship {
    /// Owner whose emergencies reach this contact.
    pub owner_user_id: String,
    /// Contact's display name.
    pub contact_name: String,
    /// Contact's own device id.
    pub contact_device_id: Option<String>,
    /// Contact's push token.
    pub contact_push_token: Option<String>,
    /// Contact's phone number.
    pub contact_phone_number: Option<String>,
    /// Whether the contact has their own wearable.
    pub contact_has_device: bool,
}

/// Owner → contact edges with live push tokens.
pub struct RelationshipGraph {
    repo: SharedRepository<EmergencyRelationship>,
    config: RelationshipsConfig,
    write_lock: Mutex<()>,
}

impl RelationshipGraph {
    /// Create a graph over `repo`.
    pub fn new(repo: SharedRepository<EmergencyRelationship>, config: RelationshipsConfig) -> Self {
        Self {
            repo,
            config,
            write_lock: Mutex::new(()),
        }
    }

    /// Append an edge.
    ///
    /// Duplicates (same owner and same contact device, or same push token) are
    /// accepted unless `relationships.allow_duplicates` is off.
    ///
    /// # Errors
    ///
    /// Returns a validation error for malformed input, or
    /// [`SirenError::DuplicateRelationship`] when duplicates are disabled.
    pub async fn add_relationship(&self, new: NewRelationship) -> Result<EmergencyRelationship> {
        validate_identifier("user_id", &new.owner_user_id)?;
        let contact_name = validate_name("name", &new.contact_name)?;
        if let Some(device_id) = &new.contact_device_id {
            validate_identifier("device_id", device_id)?;
        }
        if let Some(token) = &new.contact_push_token {
            validate_push_token(token)?;
        }

        let _guard = self.write_lock.lock().await;
        self.ensure_not_duplicate(&new).await?;

        let relationship = EmergencyRelationship {
            id: Uuid::now_v7(),
            owner_user_id: new.owner_user_id,
            contact_name,
            contact_device_id: new.contact_device_id,
            contact_push_token: new.contact_push_token,
            contact_phone_number: new.contact_phone_number,
            contact_has_device: new.contact_has_device,
            created_at: Utc::now(),
            token_updated_at: None,
            token_flagged_at: None,
        };
        self.repo.put(relationship.clone()).await?;

        tracing::info!(
            relationship_id = %relationship.id,
            owner = %relationship.owner_user_id,
            contact_device_id = ?relationship.contact_device_id,
            "Emergency contact added"
        );
        Ok(relationship)
    }

    /// Fail if `new` would duplicate an existing edge while duplicates are
    /// disabled. Always succeeds when they are allowed.
    ///
    /// # Errors
    ///
    /// Returns [`SirenError::DuplicateRelationship`] or a storage error.
    pub async fn ensure_not_duplicate(&self, new: &NewRelationship) -> Result<()> {
        if self.config.allow_duplicates {
            return Ok(());
        }
        let existing = self.contacts_of(&new.owner_user_id).await?;
        let duplicate = existing.iter().find(|rel| {
            let same_device =
                rel.contact_device_id.is_some() && rel.contact_device_id == new.contact_device_id;
            let same_token =
                rel.contact_push_token.is_some() && rel.contact_push_token == new.contact_push_token;
            same_device || same_token
        });
        match duplicate {
            Some(dup) => Err(SirenError::DuplicateRelationship {
                owner_user_id: new.owner_user_id.clone(),
                contact: dup
                    .contact_device_id
                    .clone()
                    .unwrap_or_else(|| dup.contact_name.clone()),
            }),
            None => Ok(()),
        }
    }

    /// Remove one of `owner_user_id`'s edges.
    ///
    /// # Errors
    ///
    /// Returns [`SirenError::RelationshipNotFound`] if the id is unknown or
    /// belongs to another owner.
    pub async fn remove_relationship(&self, owner_user_id: &str, id: Uuid) -> Result<EmergencyRelationship> {
        let _guard = self.write_lock.lock().await;
        let key = id.to_string();
        match self.repo.get(&key).await? {
            Some(rel) if rel.owner_user_id == owner_user_id => {
                self.repo.remove(&key).await?;
                tracing::info!(relationship_id = %id, owner = %owner_user_id, "Emergency contact removed");
                Ok(rel)
            }
            _ => Err(SirenError::RelationshipNotFound(key)),
        }
    }

    /// Rewrite the push token on every row that references `device_id` as a
    /// contact. Rows recorded without a device id but carrying
    /// `previous_token` are rewritten too. Returns the number of rows changed.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub async fn propagate_token_change(
        &self,
        device_id: &str,
        previous_token: Option<&str>,
        new_token: &str,
    ) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now();
        let mut updated = 0;

        for mut rel in self.repo.list().await? {
            let by_device = rel.contact_device_id.as_deref() == Some(device_id);
            let by_token = rel.contact_device_id.is_none()
                && previous_token.is_some()
                && rel.contact_push_token.as_deref() == previous_token;
            if !(by_device || by_token) || rel.contact_push_token.as_deref() == Some(new_token) {
                continue;
            }
            rel.contact_push_token = Some(new_token.to_string());
            rel.token_updated_at = Some(now);
            rel.token_flagged_at = None;
            self.repo.put(rel).await?;
            updated += 1;
        }

        tracing::info!(
            device_id = %device_id,
            token = %redact_token(new_token),
            relationships_updated = updated,
            "Propagated push token change"
        );
        Ok(updated)
    }

    /// Mark every row carrying `token` as flagged. Returns the ids flagged.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub async fn flag_token(&self, token: &str, at: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let _guard = self.write_lock.lock().await;
        let mut flagged = Vec::new();
        for mut rel in self.repo.list().await? {
            if rel.contact_push_token.as_deref() == Some(token) && rel.token_flagged_at.is_none() {
                rel.token_flagged_at = Some(at);
                flagged.push(rel.id);
                self.repo.put(rel).await?;
            }
        }
        Ok(flagged)
    }

    /// `owner_user_id`'s contacts in the order they were added.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub async fn contacts_of(&self, owner_user_id: &str) -> Result<Vec<EmergencyRelationship>> {
        let mut contacts: Vec<EmergencyRelationship> = self
            .repo
            .list()
            .await?
            .into_iter()
            .filter(|rel| rel.owner_user_id == owner_user_id)
            .collect();
        contacts.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(contacts)
    }
}
