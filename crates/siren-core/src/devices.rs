//! Wearable device registry.
//!
//! Binds a firmware-assigned device id to exactly one owner account and
//! records the push token of the owner's paired phone. Deregistration keeps
//! the owner and token so a returning owner does not have to pair again.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use utoipa::ToSchema;

use crate::error::{Result, SirenError};
use crate::relationships::RelationshipGraph;
use crate::storage::{Record, SharedRepository};
use crate::types::{redact_token, validate_identifier, validate_name, validate_push_token};

/// One physical wearable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Device {
    /// Firmware-assigned identifier, immutable.
    #[schema(example = "6E400001-B5A3-F393-E0A9-E50E24DCCA9E")]
    pub device_id: String,

    /// Account that registered the device.
    #[schema(example = "user123")]
    pub owner_user_id: String,

    /// Push token of the owner's paired phone.
    #[schema(nullable)]
    pub push_token: Option<String>,

    /// User-chosen label.
    #[schema(example = "SIREN Ring")]
    pub display_name: String,

    /// Whether the device is currently registered.
    pub registered: bool,

    /// First registration time.
    pub registered_at: DateTime<Utc>,

    /// Last registration, deregistration or token change.
    pub updated_at: DateTime<Utc>,

    /// Set when the push gateway rejected `push_token` permanently.
    #[schema(nullable)]
    pub token_flagged_at: Option<DateTime<Utc>>,
}

impl Record for Device {
    const COLLECTION: &'static str = "devices";

    fn key(&self) -> String {
        self.device_id.clone()
    }
}

/// Result of [`DeviceRegistry::update_push_token`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenUpdate {
    /// Token stored before this call.
    pub previous: Option<String>,
    /// Whether a previously stored token was replaced by a different one.
    pub rotated: bool,
    /// Relationship rows rewritten by propagation.
    pub relationships_updated: usize,
}

/// Device id → owner binding.
pub struct DeviceRegistry {
    repo: SharedRepository<Device>,
    graph: Arc<RelationshipGraph>,
    write_lock: Mutex<()>,
}

impl DeviceRegistry {
    /// Create a registry over `repo`, propagating token changes into `graph`.
    pub fn new(repo: SharedRepository<Device>, graph: Arc<RelationshipGraph>) -> Self {
        Self {
            repo,
            graph,
            write_lock: Mutex::new(()),
        }
    }

    /// Register `device_id` to `owner_user_id`.
    ///
    /// Re-registration by the same owner is idempotent and updates the
    /// display name. A device that was deregistered may be claimed by a new
    /// owner, in which case the previous owner's push token is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`SirenError::DeviceAlreadyClaimed`] if the device is currently
    /// registered to a different owner.
    pub async fn register(&self, device_id: &str, owner_user_id: &str, display_name: &str) -> Result<Device> {
        validate_identifier("device_id", device_id)?;
        validate_identifier("user_id", owner_user_id)?;
        let display_name = validate_name("device_name", display_name)?;

        let _guard = self.write_lock.lock().await;
        let now = Utc::now();

        let device = match self.repo.get(device_id).await? {
            None => Device {
                device_id: device_id.to_string(),
                owner_user_id: owner_user_id.to_string(),
                push_token: None,
                display_name,
                registered: true,
                registered_at: now,
                updated_at: now,
                token_flagged_at: None,
            },
            Some(existing) if existing.owner_user_id == owner_user_id => Device {
                display_name,
                registered: true,
                updated_at: now,
                ..existing
            },
            Some(existing) if existing.registered => {
                tracing::warn!(device_id = %device_id, "Registration refused, device claimed by another owner");
                return Err(SirenError::DeviceAlreadyClaimed {
                    device_id: device_id.to_string(),
                });
            }
            Some(existing) => {
                tracing::info!(device_id = %device_id, owner = %owner_user_id, "Deregistered device claimed by new owner");
                Device {
                    owner_user_id: owner_user_id.to_string(),
                    push_token: None,
                    display_name,
                    registered: true,
                    updated_at: now,
                    token_flagged_at: None,
                    ..existing
                }
            }
        };

        self.repo.put(device.clone()).await?;
        tracing::info!(device_id = %device_id, owner = %owner_user_id, "Device registered");
        Ok(device)
    }

    /// Mark `device_id` as no longer registered, keeping owner and token.
    ///
    /// When `owner_user_id` is given it must match the device's owner.
    ///
    /// # Errors
    ///
    /// Returns [`SirenError::DeviceNotFound`] or [`SirenError::OwnerMismatch`].
    pub async fn deregister(&self, device_id: &str, owner_user_id: Option<&str>) -> Result<Device> {
        let _guard = self.write_lock.lock().await;
        let mut device = self.owned_device(device_id, owner_user_id).await?;
        if device.registered {
            device.registered = false;
            device.updated_at = Utc::now();
            self.repo.put(device.clone()).await?;
            tracing::info!(device_id = %device_id, "Device deregistered");
        }
        Ok(device)
    }

    /// Replace the stored push token.
    ///
    /// If an existing token is replaced by a different one, the change is
    /// propagated to every relationship row referencing this device.
    /// First-time token arrival does not propagate.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a malformed token, or
    /// [`SirenError::DeviceNotFound`] / [`SirenError::OwnerMismatch`].
    pub async fn update_push_token(
        &self,
        device_id: &str,
        token: &str,
        owner_user_id: Option<&str>,
    ) -> Result<TokenUpdate> {
        validate_push_token(token)?;

        // Held through propagation so concurrent rotations reach the
        // relationship rows in the same order they reach the device.
        let _guard = self.write_lock.lock().await;
        let mut device = self.owned_device(device_id, owner_user_id).await?;
        let previous = device.push_token.clone();
        if previous.as_deref() == Some(token) {
            return Ok(TokenUpdate {
                previous,
                rotated: false,
                relationships_updated: 0,
            });
        }
        device.push_token = Some(token.to_string());
        device.token_flagged_at = None;
        device.updated_at = Utc::now();
        self.repo.put(device).await?;

        let rotated = previous.is_some();
        let relationships_updated = if rotated {
            self.graph
                .propagate_token_change(device_id, previous.as_deref(), token)
                .await?
        } else {
            0
        };

        tracing::info!(
            device_id = %device_id,
            token = %redact_token(token),
            rotated,
            relationships_updated,
            "Push token updated"
        );
        Ok(TokenUpdate {
            previous,
            rotated,
            relationships_updated,
        })
    }

    /// Flag every device whose current token is `token`. Returns the ids flagged.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub async fn flag_token(&self, token: &str, at: DateTime<Utc>) -> Result<Vec<String>> {
        let _guard = self.write_lock.lock().await;
        let mut flagged = Vec::new();
        for mut device in self.repo.list().await? {
            if device.push_token.as_deref() == Some(token) && device.token_flagged_at.is_none() {
                device.token_flagged_at = Some(at);
                flagged.push(device.device_id.clone());
                self.repo.put(device).await?;
            }
        }
        Ok(flagged)
    }

    /// Whether `device_id` is currently registered.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub async fn is_registered(&self, device_id: &str) -> Result<bool> {
        Ok(self
            .repo
            .get(device_id)
            .await?
            .is_some_and(|device| device.registered))
    }

    /// Fetch a device.
    ///
    /// # Errors
    ///
    /// Returns [`SirenError::DeviceNotFound`] if it was never registered.
    pub async fn get(&self, device_id: &str) -> Result<Device> {
        self.repo
            .get(device_id)
            .await?
            .ok_or_else(|| SirenError::DeviceNotFound(device_id.to_string()))
    }

    async fn owned_device(&self, device_id: &str, owner_user_id: Option<&str>) -> Result<Device> {
        let device = self.get(device_id).await?;
        match owner_user_id {
            Some(user_id) if user_id != device.owner_user_id => Err(SirenError::OwnerMismatch {
                device_id: device_id.to_string(),
                user_id: user_id.to_string(),
            }),
            _ => Ok(device),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelationshipsConfig;
    use crate::relationships::NewRelationship;
    use crate::storage::MemoryRepository;

    fn setup() -> (DeviceRegistry, Arc<RelationshipGraph>) {
        let graph = Arc::new(RelationshipGraph::new(
            MemoryRepository::shared(),
            RelationshipsConfig::default(),
        ));
        let registry = DeviceRegistry::new(MemoryRepository::shared(), Arc::clone(&graph));
        (registry, graph)
    }

    #[tokio::test]
    async fn test_register_is_idempotent_for_same_owner() {
        let (registry, _) = setup();
        registry.register("deviceA", "owner1", "Ring").await.unwrap();
        let again = registry
            .register("deviceA", "owner1", "Renamed Ring")
            .await
            .unwrap();
        assert!(again.registered);
        assert_eq!(again.display_name, "Renamed Ring");
        assert!(registry.is_registered("deviceA").await.unwrap());
    }

    #[tokio::test]
    async fn test_register_conflicts_for_other_owner() {
        let (registry, _) = setup();
        registry.register("deviceA", "owner1", "Ring").await.unwrap();
        let err = registry
            .register("deviceA", "owner2", "Ring")
            .await
            .unwrap_err();
        assert!(matches!(err, SirenError::DeviceAlreadyClaimed { .. }));
        assert_eq!(err.kind(), crate::error::ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_deregister_keeps_identity() {
        let (registry, _) = setup();
        registry.register("deviceA", "owner1", "Ring").await.unwrap();
        registry
            .update_push_token("deviceA", "tok1", Some("owner1"))
            .await
            .unwrap();

        let device = registry.deregister("deviceA", None).await.unwrap();
        assert!(!device.registered);
        assert_eq!(device.owner_user_id, "owner1");
        assert_eq!(device.push_token.as_deref(), Some("tok1"));
        assert!(!registry.is_registered("deviceA").await.unwrap());

        // Returning owner does not need to re-pair.
        let back = registry.register("deviceA", "owner1", "Ring").await.unwrap();
        assert_eq!(back.push_token.as_deref(), Some("tok1"));
    }

    #[tokio::test]
    async fn test_new_owner_after_deregistration() {
        let (registry, _) = setup();
        registry.register("deviceA", "owner1", "Ring").await.unwrap();
        registry
            .update_push_token("deviceA", "tok1", None)
            .await
            .unwrap();
        registry.deregister("deviceA", Some("owner1")).await.unwrap();

        let claimed = registry.register("deviceA", "owner2", "Ring").await.unwrap();
        assert_eq!(claimed.owner_user_id, "owner2");
        assert_eq!(claimed.push_token, None);
    }

    #[tokio::test]
    async fn test_deregister_checks_owner() {
        let (registry, _) = setup();
        registry.register("deviceA", "owner1", "Ring").await.unwrap();
        let err = registry
            .deregister("deviceA", Some("owner2"))
            .await
            .unwrap_err();
        assert!(matches!(err, SirenError::OwnerMismatch { .. }));
    }

    #[tokio::test]
    async fn test_token_rotation_propagates_to_three_rows() {
        let (registry, graph) = setup();
        registry.register("D9", "contactUser", "Ring").await.unwrap();
        registry.update_push_token("D9", "old", None).await.unwrap();

        for owner in ["owner1", "owner2", "owner3"] {
            graph
                .add_relationship(NewRelationship {
                    owner_user_id: owner.to_string(),
                    contact_name: "Sam".to_string(),
                    contact_device_id: Some("D9".to_string()),
                    contact_push_token: Some("old".to_string()),
                    ..NewRelationship::default()
                })
                .await
                .unwrap();
        }

        let update = registry.update_push_token("D9", "new", None).await.unwrap();
        assert!(update.rotated);
        assert_eq!(update.previous.as_deref(), Some("old"));
        assert_eq!(update.relationships_updated, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_rotations_leave_rows_on_current_token() {
        let (registry, graph) = setup();
        let registry = Arc::new(registry);
        registry.register("D9", "contactUser", "Ring").await.unwrap();
        registry.update_push_token("D9", "tok-0", None).await.unwrap();
        for owner in ["owner1", "owner2"] {
            graph
                .add_relationship(NewRelationship {
                    owner_user_id: owner.to_string(),
                    contact_name: "Sam".to_string(),
                    contact_device_id: Some("D9".to_string()),
                    contact_push_token: Some("tok-0".to_string()),
                    ..NewRelationship::default()
                })
                .await
                .unwrap();
        }

        let handles: Vec<_> = (1..=20)
            .map(|i| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    registry
                        .update_push_token("D9", &format!("tok-{i}"), None)
                        .await
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let current = registry.get("D9").await.unwrap().push_token;
        assert!(current.is_some());
        for owner in ["owner1", "owner2"] {
            let rows = graph.contacts_of(owner).await.unwrap();
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0].contact_push_token, current);
        }
    }

    #[tokio::test]
    async fn test_first_token_and_unchanged_token_do_not_propagate() {
        let (registry, _) = setup();
        registry.register("deviceA", "owner1", "Ring").await.unwrap();

        let first = registry
            .update_push_token("deviceA", "tok1", None)
            .await
            .unwrap();
        assert!(!first.rotated);
        assert_eq!(first.relationships_updated, 0);

        let same = registry
            .update_push_token("deviceA", "tok1", None)
            .await
            .unwrap();
        assert!(!same.rotated);
        assert_eq!(same.previous.as_deref(), Some("tok1"));
    }

    #[tokio::test]
    async fn test_update_token_unknown_device() {
        let (registry, _) = setup();
        let err = registry
            .update_push_token("ghost", "tok", None)
            .await
            .unwrap_err();
        assert!(matches!(err, SirenError::DeviceNotFound(_)));
    }

    #[tokio::test]
    async fn test_flag_token_marks_device() {
        let (registry, _) = setup();
        registry.register("deviceA", "owner1", "Ring").await.unwrap();
        registry
            .update_push_token("deviceA", "dead", None)
            .await
            .unwrap();

        let flagged = registry.flag_token("dead", Utc::now()).await.unwrap();
        assert_eq!(flagged, vec!["deviceA".to_string()]);
        assert!(registry.get("deviceA").await.unwrap().token_flagged_at.is_some());
    }
}
