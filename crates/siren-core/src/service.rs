//! Service wiring.
//!
//! [`Siren`] constructs every component once at process start and hands out
//! shared handles to them. Operations that span components (redeeming a code
//! into a relationship, deregistering a device together with its code) live
//! here so the components stay independent of each other.

use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;

use crate::alerts::AlertDispatcher;
use crate::codes::{AuthCode, CodeRedemption, CodeStore};
use crate::config::Config;
use crate::devices::{Device, DeviceRegistry};
use crate::error::{Result, SirenError};
use crate::push::{gateway_from_config, PushGateway};
use crate::relationships::{EmergencyRelationship, NewRelationship, RelationshipGraph};
use crate::storage::open_repository;
use crate::types::{non_blank, validate_identifier, validate_name, validate_push_token};

/// A contact's side of a code redemption.
#[derive(Debug, Clone, Default)]
pub struct ContactSignup {
    /// Code read out by the owner.
    pub auth_code: String,
    /// Contact's display name.
    pub name: String,
    /// Contact's phone number.
    pub phone_number: Option<String>,
    /// Contact's push token.
    pub push_token: Option<String>,
    /// Contact's own wearable, if any.
    pub device_id: Option<String>,
    /// Whether the contact runs the app.
    pub has_app: bool,
}

/// Result of [`Siren::deregister_device`].
#[derive(Debug, Clone)]
pub struct Deregistration {
    /// Device after deregistration.
    pub device: Device,
    /// Active codes cancelled alongside.
    pub codes_cancelled: usize,
}

/// The assembled service.
pub struct Siren {
    config: Config,
    devices: Arc<DeviceRegistry>,
    codes: Arc<CodeStore>,
    graph: Arc<RelationshipGraph>,
    alerts: AlertDispatcher,
}

impl Siren {
    /// Build the service with the push gateway selected by `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if storage cannot be opened or the gateway cannot be
    /// constructed.
    pub async fn open(config: Config) -> Result<Self> {
        let gateway = gateway_from_config(&config.push)?;
        Self::with_gateway(config, gateway).await
    }

    /// Build the service around an explicit push gateway.
    ///
    /// # Errors
    ///
    /// Returns an error if storage cannot be opened.
    pub async fn with_gateway(config: Config, gateway: Arc<dyn PushGateway>) -> Result<Self> {
        let graph = Arc::new(RelationshipGraph::new(
            open_repository(&config).await?,
            config.relationships.clone(),
        ));
        let devices = Arc::new(DeviceRegistry::new(
            open_repository(&config).await?,
            Arc::clone(&graph),
        ));
        let codes = Arc::new(CodeStore::new(
            open_repository(&config).await?,
            Arc::clone(&devices),
            &config.codes,
        ));
        let alerts = AlertDispatcher::new(
            open_repository(&config).await?,
            open_repository(&config).await?,
            Arc::clone(&graph),
            Arc::clone(&devices),
            gateway,
            &config.alerts,
        )?;

        tracing::info!(
            backend = ?config.storage.backend,
            push_mode = ?config.push.mode,
            "Siren service assembled"
        );

        Ok(Self {
            config,
            devices,
            codes,
            graph,
            alerts,
        })
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Device registry.
    #[must_use]
    pub fn devices(&self) -> &DeviceRegistry {
        &self.devices
    }

    /// Code store.
    #[must_use]
    pub fn codes(&self) -> &CodeStore {
        &self.codes
    }

    /// Relationship graph.
    #[must_use]
    pub fn graph(&self) -> &RelationshipGraph {
        &self.graph
    }

    /// Alert dispatcher.
    #[must_use]
    pub const fn alerts(&self) -> &AlertDispatcher {
        &self.alerts
    }

    /// Deregister a device and cancel its active code.
    ///
    /// # Errors
    ///
    /// Returns [`SirenError::DeviceNotFound`] or [`SirenError::OwnerMismatch`].
    pub async fn deregister_device(&self, device_id: &str, owner_user_id: Option<&str>) -> Result<Deregistration> {
        let device = self.devices.deregister(device_id, owner_user_id).await?;
        let codes_cancelled = self.codes.cancel(device_id).await?;
        Ok(Deregistration {
            device,
            codes_cancelled,
        })
    }

    /// Issue a code for `device_id`, checking the caller owns it when
    /// `owner_user_id` is given.
    ///
    /// # Errors
    ///
    /// Returns [`SirenError::OwnerMismatch`] or any [`CodeStore::issue`] error.
    pub async fn issue_code(&self, device_id: &str, owner_user_id: Option<&str>) -> Result<AuthCode> {
        if let Some(user_id) = owner_user_id {
            match self.devices.get(device_id).await {
                Ok(device) if device.owner_user_id != user_id => {
                    return Err(SirenError::OwnerMismatch {
                        device_id: device_id.to_string(),
                        user_id: user_id.to_string(),
                    });
                }
                Err(SirenError::DeviceNotFound(_)) => {
                    return Err(SirenError::DeviceNotRegistered(device_id.to_string()));
                }
                Err(e) => return Err(e),
                Ok(_) => {}
            }
        }
        self.codes.issue(device_id).await
    }

    /// Redeem `signup.auth_code` and link the caller as a contact of the
    /// code's owner.
    ///
    /// Input and duplicates are checked before the code is touched, so a
    /// rejected request never burns a code. If recording the relationship
    /// still fails after redemption, the code is released again.
    ///
    /// # Errors
    ///
    /// Returns a validation error, any [`CodeStore::redeem`] error,
    /// [`SirenError::DuplicateRelationship`] when duplicates are disabled, or
    /// a storage error.
    pub async fn add_contact_by_code(
        &self,
        signup: ContactSignup,
    ) -> Result<(EmergencyRelationship, CodeRedemption)> {
        let name = validate_name("name", &signup.name)?;
        let push_token = non_blank(signup.push_token);
        if let Some(token) = &push_token {
            validate_push_token(token)?;
        }
        let device_id = non_blank(signup.device_id);
        if let Some(device_id) = &device_id {
            validate_identifier("device_id", device_id)?;
        }

        let owner = self.codes.lookup(&signup.auth_code).await?;
        let mut new = NewRelationship {
            owner_user_id: owner.owner_user_id,
            contact_name: name,
            contact_has_device: signup.has_app || device_id.is_some(),
            contact_device_id: device_id,
            contact_push_token: push_token,
            contact_phone_number: non_blank(signup.phone_number),
        };
        self.graph.ensure_not_duplicate(&new).await?;

        let redemption = self.codes.redeem(&signup.auth_code).await?;
        new.owner_user_id.clone_from(&redemption.owner_user_id);
        match self.graph.add_relationship(new).await {
            Ok(relationship) => Ok((relationship, redemption)),
            Err(e) => {
                tracing::warn!(
                    device_id = %redemption.owner_device_id,
                    error = %e,
                    "Contact could not be recorded, releasing code"
                );
                if let Err(release) = self.codes.release(&signup.auth_code).await {
                    tracing::error!(error = %release, "Failed to release authentication code");
                }
                Err(e)
            }
        }
    }

    /// Start the background expiry sweep. The first pass runs immediately.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let codes = Arc::clone(&self.codes);
        let period = self.config.codes.sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match codes.sweep(Utc::now()).await {
                    Ok(report) if report.expired > 0 || report.purged > 0 => {
                        tracing::info!(expired = report.expired, purged = report.purged, "Expired codes swept");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!(error = %e, "Code sweep failed"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{AlertStatus, TriggerRequest};
    use crate::config::StorageBackend;
    use crate::push::MockPushGateway;
    use crate::storage::{MemoryRepository, Repository};

    async fn memory_siren() -> Siren {
        let mut config = Config::default();
        config.storage.backend = StorageBackend::Memory;
        Siren::with_gateway(config, Arc::new(MockPushGateway::new()))
            .await
            .unwrap()
    }

    fn signup(code: &str, name: &str, token: Option<&str>) -> ContactSignup {
        ContactSignup {
            auth_code: code.to_string(),
            name: name.to_string(),
            push_token: token.map(str::to_string),
            has_app: true,
            ..ContactSignup::default()
        }
    }

    #[tokio::test]
    async fn test_pair_and_alert_flow() {
        let siren = memory_siren().await;
        siren.devices().register("ring1", "owner1", "Ring").await.unwrap();

        let code = siren.issue_code("ring1", Some("owner1")).await.unwrap();
        let (rel, redemption) = siren
            .add_contact_by_code(signup(&code.code, "Mom", Some("tok-mom")))
            .await
            .unwrap();
        assert_eq!(redemption.owner_user_id, "owner1");
        assert_eq!(rel.owner_user_id, "owner1");
        assert!(rel.contact_has_device);

        let event = siren
            .alerts()
            .trigger(TriggerRequest::activation("owner1"))
            .await
            .unwrap();
        assert_eq!(event.status, AlertStatus::AllDelivered);
    }

    #[tokio::test]
    async fn test_bad_signup_does_not_burn_code() {
        let siren = memory_siren().await;
        siren.devices().register("ring1", "owner1", "Ring").await.unwrap();
        let code = siren.issue_code("ring1", None).await.unwrap();

        let err = siren
            .add_contact_by_code(signup(&code.code, " ", None))
            .await
            .unwrap_err();
        assert!(matches!(err, SirenError::Validation { field: "name", .. }));

        siren
            .add_contact_by_code(signup(&code.code, "Mom", None))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_malformed_device_id_does_not_burn_code() {
        let siren = memory_siren().await;
        siren.devices().register("ring1", "owner1", "Ring").await.unwrap();
        let code = siren.issue_code("ring1", None).await.unwrap();

        let err = siren
            .add_contact_by_code(ContactSignup {
                device_id: Some("has space".to_string()),
                ..signup(&code.code, "Mom", Some("tok-mom"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SirenError::Validation { field: "device_id", .. }));

        siren
            .add_contact_by_code(signup(&code.code, "Mom", Some("tok-mom")))
            .await
            .unwrap();
        assert_eq!(siren.graph().contacts_of("owner1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_contact_does_not_burn_code() {
        let mut config = Config::default();
        config.storage.backend = StorageBackend::Memory;
        config.relationships.allow_duplicates = false;
        let siren = Siren::with_gateway(config, Arc::new(MockPushGateway::new()))
            .await
            .unwrap();
        siren.devices().register("ring1", "owner1", "Ring").await.unwrap();

        let first = siren.issue_code("ring1", None).await.unwrap();
        siren
            .add_contact_by_code(signup(&first.code, "Mom", Some("tok-mom")))
            .await
            .unwrap();

        let second = siren.issue_code("ring1", None).await.unwrap();
        let err = siren
            .add_contact_by_code(signup(&second.code, "Mom again", Some("tok-mom")))
            .await
            .unwrap_err();
        assert!(matches!(err, SirenError::DuplicateRelationship { .. }));

        siren
            .add_contact_by_code(signup(&second.code, "Dad", Some("tok-dad")))
            .await
            .unwrap();
        assert_eq!(siren.graph().contacts_of("owner1").await.unwrap().len(), 2);
    }

    /// Relationship storage that refuses every write.
    struct ReadOnlyRepository;

    #[async_trait::async_trait]
    impl Repository<EmergencyRelationship> for ReadOnlyRepository {
        async fn get(&self, _key: &str) -> Result<Option<EmergencyRelationship>> {
            Ok(None)
        }

        async fn put(&self, _value: EmergencyRelationship) -> Result<()> {
            Err(SirenError::PersistenceError("read-only".to_string()))
        }

        async fn remove(&self, _key: &str) -> Result<Option<EmergencyRelationship>> {
            Ok(None)
        }

        async fn list(&self) -> Result<Vec<EmergencyRelationship>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_failed_insert_releases_code() {
        let mut config = Config::default();
        config.storage.backend = StorageBackend::Memory;
        let graph = Arc::new(RelationshipGraph::new(
            Arc::new(ReadOnlyRepository),
            config.relationships.clone(),
        ));
        let devices = Arc::new(DeviceRegistry::new(MemoryRepository::shared(), Arc::clone(&graph)));
        let codes = Arc::new(CodeStore::new(
            MemoryRepository::shared(),
            Arc::clone(&devices),
            &config.codes,
        ));
        let alerts = AlertDispatcher::new(
            MemoryRepository::shared(),
            MemoryRepository::shared(),
            Arc::clone(&graph),
            Arc::clone(&devices),
            Arc::new(MockPushGateway::new()),
            &config.alerts,
        )
        .unwrap();
        let siren = Siren {
            config,
            devices,
            codes,
            graph,
            alerts,
        };
        siren.devices().register("ring1", "owner1", "Ring").await.unwrap();
        let code = siren.issue_code("ring1", None).await.unwrap();

        let err = siren
            .add_contact_by_code(signup(&code.code, "Mom", Some("tok-mom")))
            .await
            .unwrap_err();
        assert!(matches!(err, SirenError::PersistenceError(_)));

        let owner = siren.codes().lookup(&code.code).await.unwrap();
        assert_eq!(owner.owner_user_id, "owner1");
    }

    #[tokio::test]
    async fn test_issue_code_checks_owner() {
        let siren = memory_siren().await;
        siren.devices().register("ring1", "owner1", "Ring").await.unwrap();

        let err = siren.issue_code("ring1", Some("intruder")).await.unwrap_err();
        assert!(matches!(err, SirenError::OwnerMismatch { .. }));

        let err = siren.issue_code("ghost", Some("owner1")).await.unwrap_err();
        assert!(matches!(err, SirenError::DeviceNotRegistered(_)));
    }

    #[tokio::test]
    async fn test_deregister_cancels_active_code() {
        let siren = memory_siren().await;
        siren.devices().register("ring1", "owner1", "Ring").await.unwrap();
        let code = siren.issue_code("ring1", None).await.unwrap();

        let result = siren.deregister_device("ring1", Some("owner1")).await.unwrap();
        assert!(!result.device.registered);
        assert_eq!(result.codes_cancelled, 1);

        let err = siren
            .add_contact_by_code(signup(&code.code, "Mom", None))
            .await
            .unwrap_err();
        assert!(matches!(err, SirenError::CodeCancelled(_)));
    }
}
