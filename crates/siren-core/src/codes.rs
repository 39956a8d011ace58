//! Short-lived authentication codes.
//!
//! An owner asks for a six-digit code, reads it to a prospective contact, and
//! the contact redeems it to be linked as an emergency contact. Codes:
//!
//! - live for exactly [`CODE_TTL_MINUTES`] minutes,
//! - are unique among every code still retained, active or not,
//! - redeem at most once (the check and the mark happen under one lock),
//! - are one per owner device: issuing again cancels the previous code.
//!
//! Expiry is enforced both when a code is read and by [`CodeStore::sweep`],
//! which marks lapsed codes expired and purges dead ones after the retention
//! window. Expiry depends only on `expires_at`, so a restart loses nothing.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rand::rngs::OsRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use utoipa::ToSchema;

use crate::config::CodesConfig;
use crate::devices::DeviceRegistry;
use crate::error::{Result, SirenError};
use crate::storage::{Record, SharedRepository};
use crate::types::{is_valid_code_format, validate_identifier};

/// Lifetime of every authentication code.
pub const CODE_TTL_MINUTES: i64 = 10;

/// Candidates drawn before giving up on finding an unused code.
pub const MAX_GENERATION_ATTEMPTS: u32 = 32;

/// Lifecycle state of a code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum CodeStatus {
    /// Redeemable until `expires_at`.
    Active,
    /// Redeemed once.
    Consumed,
    /// Cancelled by the owner or replaced by a newer code.
    Cancelled,
    /// Lapsed without being redeemed.
    Expired,
}

/// A single-use, time-boxed capability vouching for an owner device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct AuthCode {
    /// Six-digit value.
    #[schema(example = "483920")]
    pub code: String,

    /// Device the code vouches for.
    pub owner_device_id: String,

    /// Owner of that device at issue time.
    pub owner_user_id: String,

    /// Owner device's display name at issue time.
    pub owner_display_name: String,

    /// Issue time.
    pub issued_at: DateTime<Utc>,

    /// `issued_at` + ten minutes.
    pub expires_at: DateTime<Utc>,

    /// Lifecycle state.
    pub status: CodeStatus,

    /// When the code left the active state.
    #[schema(nullable)]
    pub closed_at: Option<DateTime<Utc>>,
}

impl AuthCode {
    /// Whether the code can still be redeemed at `now`.
    #[must_use]
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.status == CodeStatus::Active && now <= self.expires_at
    }

    /// Whether the code has been consumed.
    #[must_use]
    pub fn consumed(&self) -> bool {
        self.status == CodeStatus::Consumed
    }

    fn check_redeemable(&self, now: DateTime<Utc>) -> Result<()> {
        match self.status {
            CodeStatus::Consumed => Err(SirenError::CodeAlreadyConsumed(self.code.clone())),
            CodeStatus::Cancelled => Err(SirenError::CodeCancelled(self.code.clone())),
            CodeStatus::Expired => Err(SirenError::CodeExpired(self.code.clone())),
            CodeStatus::Active if now > self.expires_at => {
                Err(SirenError::CodeExpired(self.code.clone()))
            }
            CodeStatus::Active => Ok(()),
        }
    }

    fn close(&mut self, status: CodeStatus, at: DateTime<Utc>) {
        self.status = status;
        self.closed_at = Some(at);
    }
}

impl Record for AuthCode {
    const COLLECTION: &'static str = "auth_codes";

    fn key(&self) -> String {
        self.code.clone()
    }
}

/// Owner identity returned by a successful lookup or redemption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeRedemption {
    /// Owner to link the contact to.
    pub owner_user_id: String,
    /// Owner's device.
    pub owner_device_id: String,
    /// Owner device's display name.
    pub owner_display_name: String,
}

impl From<&AuthCode> for CodeRedemption {
    fn from(code: &AuthCode) -> Self {
        Self {
            owner_user_id: code.owner_user_id.clone(),
            owner_device_id: code.owner_device_id.clone(),
            owner_display_name: code.owner_display_name.clone(),
        }
    }
}

/// Counts from one [`CodeStore::sweep`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Active codes marked expired.
    pub expired: usize,
    /// Dead codes removed after the retention window.
    pub purged: usize,
}

/// Source of candidate code values.
pub trait CodeGenerator: Send + Sync {
    /// Draw the next candidate.
    fn next_code(&self) -> String;
}

/// Uniform draw from `000000..=999999` using the OS RNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomCodeGenerator;

impl CodeGenerator for RandomCodeGenerator {
    fn next_code(&self) -> String {
        format!("{:06}", OsRng.gen_range(0..1_000_000_u32))
    }
}

/// Authentication code store.
pub struct CodeStore {
    repo: SharedRepository<AuthCode>,
    devices: Arc<DeviceRegistry>,
    generator: Box<dyn CodeGenerator>,
    retention: Duration,
    write_lock: Mutex<()>,
}

impl CodeStore {
    /// Create a store with the random generator.
    pub fn new(repo: SharedRepository<AuthCode>, devices: Arc<DeviceRegistry>, config: &CodesConfig) -> Self {
        Self::with_generator(repo, devices, config, Box::new(RandomCodeGenerator))
    }

    /// Create a store drawing candidates from `generator`.
    pub fn with_generator(
        repo: SharedRepository<AuthCode>,
        devices: Arc<DeviceRegistry>,
        config: &CodesConfig,
        generator: Box<dyn CodeGenerator>,
    ) -> Self {
        Self {
            repo,
            devices,
            generator,
            retention: Duration::try_seconds(i64::try_from(config.retention_secs).unwrap_or(i64::MAX))
                .unwrap_or(Duration::MAX),
            write_lock: Mutex::new(()),
        }
    }

    /// Issue a code for `owner_device_id` now.
    ///
    /// # Errors
    ///
    /// See [`CodeStore::issue_at`].
    pub async fn issue(&self, owner_device_id: &str) -> Result<AuthCode> {
        self.issue_at(owner_device_id, Utc::now()).await
    }

    /// Issue a code for `owner_device_id` at `now`.
    ///
    /// Any code still active for the same device is cancelled first.
    ///
    /// # Errors
    ///
    /// Returns [`SirenError::DeviceNotRegistered`] if the device has no
    /// confirmed registration, or [`SirenError::CodeSpaceExhausted`] if no
    /// unused value could be drawn.
    pub async fn issue_at(&self, owner_device_id: &str, now: DateTime<Utc>) -> Result<AuthCode> {
        validate_identifier("device_id", owner_device_id)?;
        let device = match self.devices.get(owner_device_id).await {
            Ok(device) if device.registered => device,
            Ok(_) | Err(SirenError::DeviceNotFound(_)) => {
                return Err(SirenError::DeviceNotRegistered(owner_device_id.to_string()))
            }
            Err(e) => return Err(e),
        };

        let _guard = self.write_lock.lock().await;
        let existing = self.repo.list().await?;

        let mut value = None;
        for _ in 0..MAX_GENERATION_ATTEMPTS {
            let candidate = self.generator.next_code();
            // Retained records keep their value until purged, whatever their state.
            let taken = existing.iter().any(|c| c.code == candidate);
            if taken {
                tracing::debug!("Code collision, drawing again");
                continue;
            }
            value = Some(candidate);
            break;
        }
        let code = value.ok_or(SirenError::CodeSpaceExhausted {
            attempts: MAX_GENERATION_ATTEMPTS,
        })?;

        for mut previous in existing
            .into_iter()
            .filter(|c| c.owner_device_id == owner_device_id && c.status == CodeStatus::Active)
        {
            previous.close(CodeStatus::Cancelled, now);
            self.repo.put(previous).await?;
        }

        let auth = AuthCode {
            code,
            owner_device_id: device.device_id,
            owner_user_id: device.owner_user_id,
            owner_display_name: device.display_name,
            issued_at: now,
            expires_at: now + Duration::minutes(CODE_TTL_MINUTES),
            status: CodeStatus::Active,
            closed_at: None,
        };
        self.repo.put(auth.clone()).await?;

        tracing::info!(
            device_id = %auth.owner_device_id,
            expires_at = %auth.expires_at,
            "Authentication code issued"
        );
        Ok(auth)
    }

    /// Check a code now without consuming it.
    ///
    /// # Errors
    ///
    /// Same as [`CodeStore::redeem_at`].
    pub async fn lookup(&self, code: &str) -> Result<CodeRedemption> {
        self.lookup_at(code, Utc::now()).await
    }

    /// Check a code without consuming it.
    ///
    /// # Errors
    ///
    /// Same as [`CodeStore::redeem_at`].
    pub async fn lookup_at(&self, code: &str, now: DateTime<Utc>) -> Result<CodeRedemption> {
        let auth = self.find(code).await?;
        auth.check_redeemable(now)?;
        Ok(CodeRedemption::from(&auth))
    }

    /// Redeem a code now.
    ///
    /// # Errors
    ///
    /// See [`CodeStore::redeem_at`].
    pub async fn redeem(&self, code: &str) -> Result<CodeRedemption> {
        self.redeem_at(code, Utc::now()).await
    }

    /// Redeem a code at `now`, marking it consumed.
    ///
    /// # Errors
    ///
    /// Returns [`SirenError::CodeNotFound`], [`SirenError::CodeExpired`],
    /// [`SirenError::CodeCancelled`] or [`SirenError::CodeAlreadyConsumed`].
    pub async fn redeem_at(&self, code: &str, now: DateTime<Utc>) -> Result<CodeRedemption> {
        let _guard = self.write_lock.lock().await;
        let mut auth = self.find(code).await?;
        auth.check_redeemable(now)?;
        auth.close(CodeStatus::Consumed, now);
        self.repo.put(auth.clone()).await?;

        tracing::info!(device_id = %auth.owner_device_id, "Authentication code redeemed");
        Ok(CodeRedemption::from(&auth))
    }

    /// Undo a redemption whose relationship could not be recorded.
    ///
    /// The code becomes active again with its original expiry, unless the
    /// device was issued a newer code meanwhile, in which case it is
    /// cancelled. Codes that are not consumed are left alone.
    ///
    /// # Errors
    ///
    /// Returns [`SirenError::CodeNotFound`] or a storage error.
    pub async fn release(&self, code: &str) -> Result<()> {
        self.release_at(code, Utc::now()).await
    }

    /// [`CodeStore::release`] at `now`.
    ///
    /// # Errors
    ///
    /// Returns [`SirenError::CodeNotFound`] or a storage error.
    pub async fn release_at(&self, code: &str, now: DateTime<Utc>) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut auth = self.find(code).await?;
        if auth.status != CodeStatus::Consumed {
            return Ok(());
        }

        let superseded = self.repo.list().await?.iter().any(|c| {
            c.code != auth.code
                && c.owner_device_id == auth.owner_device_id
                && c.status == CodeStatus::Active
        });
        if superseded {
            auth.close(CodeStatus::Cancelled, now);
        } else {
            auth.status = CodeStatus::Active;
            auth.closed_at = None;
        }
        tracing::warn!(
            device_id = %auth.owner_device_id,
            status = ?auth.status,
            "Authentication code released after failed redemption"
        );
        self.repo.put(auth).await
    }

    /// Cancel any active code for `owner_device_id`. Returns how many were
    /// cancelled; zero is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub async fn cancel(&self, owner_device_id: &str) -> Result<usize> {
        self.cancel_at(owner_device_id, Utc::now()).await
    }

    /// [`CodeStore::cancel`] at `now`.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub async fn cancel_at(&self, owner_device_id: &str, now: DateTime<Utc>) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let mut cancelled = 0;
        for mut auth in self.repo.list().await? {
            if auth.owner_device_id == owner_device_id && auth.status == CodeStatus::Active {
                auth.close(CodeStatus::Cancelled, now);
                self.repo.put(auth).await?;
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            tracing::info!(device_id = %owner_device_id, cancelled, "Authentication code cancelled");
        }
        Ok(cancelled)
    }

    /// The code currently active for `owner_device_id` at `now`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub async fn active_code_at(&self, owner_device_id: &str, now: DateTime<Utc>) -> Result<Option<AuthCode>> {
        Ok(self
            .repo
            .list()
            .await?
            .into_iter()
            .find(|c| c.owner_device_id == owner_device_id && c.is_active_at(now)))
    }

    /// Mark lapsed codes expired and purge codes dead for longer than the
    /// retention window.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let _guard = self.write_lock.lock().await;
        let mut report = SweepReport::default();

        for mut auth in self.repo.list().await? {
            if auth.status == CodeStatus::Active {
                if now > auth.expires_at {
                    let expired_at = auth.expires_at;
                    auth.close(CodeStatus::Expired, expired_at);
                    self.repo.put(auth).await?;
                    report.expired += 1;
                }
                continue;
            }
            let dead_since = auth.closed_at.unwrap_or(auth.expires_at);
            if now - dead_since > self.retention {
                self.repo.remove(&auth.code).await?;
                report.purged += 1;
            }
        }

        if report.expired > 0 || report.purged > 0 {
            tracing::debug!(expired = report.expired, purged = report.purged, "Code sweep");
        }
        Ok(report)
    }

    async fn find(&self, code: &str) -> Result<AuthCode> {
        if !is_valid_code_format(code) {
            return Err(SirenError::validation("code", "must be exactly six digits"));
        }
        self.repo
            .get(code)
            .await?
            .ok_or_else(|| SirenError::CodeNotFound(code.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelationshipsConfig;
    use crate::relationships::RelationshipGraph;
    use crate::storage::MemoryRepository;
    use std::sync::Mutex as StdMutex;

    /// Hands out a fixed sequence, then repeats the last value.
    struct SequenceGenerator(StdMutex<Vec<&'static str>>);

    impl SequenceGenerator {
        fn boxed(codes: &[&'static str]) -> Box<dyn CodeGenerator> {
            let mut codes = codes.to_vec();
            codes.reverse();
            Box::new(Self(StdMutex::new(codes)))
        }
    }

    impl CodeGenerator for SequenceGenerator {
        fn next_code(&self) -> String {
            let mut codes = self.0.lock().unwrap();
            if codes.len() > 1 {
                codes.pop().unwrap().to_string()
            } else {
                codes[0].to_string()
            }
        }
    }

    async fn store_with(codes: &[&'static str]) -> CodeStore {
        let graph = Arc::new(RelationshipGraph::new(
            MemoryRepository::shared(),
            RelationshipsConfig::default(),
        ));
        let devices = Arc::new(DeviceRegistry::new(MemoryRepository::shared(), graph));
        devices.register("D1", "owner1", "SIREN Ring").await.unwrap();
        devices.register("D2", "owner2", "Other Ring").await.unwrap();
        CodeStore::with_generator(
            MemoryRepository::shared(),
            devices,
            &CodesConfig::default(),
            SequenceGenerator::boxed(codes),
        )
    }

    fn t0() -> DateTime<Utc> {
        "2026-03-01T12:00:00Z".parse().unwrap()
    }

    #[tokio::test]
    async fn test_issue_sets_ten_minute_expiry() {
        let store = store_with(&["483920"]).await;
        let code = store.issue_at("D1", t0()).await.unwrap();
        assert_eq!(code.code, "483920");
        assert_eq!(code.expires_at - code.issued_at, Duration::minutes(10));
        assert_eq!(code.owner_user_id, "owner1");
        assert_eq!(code.owner_display_name, "SIREN Ring");
    }

    #[tokio::test]
    async fn test_issue_requires_registered_device() {
        let store = store_with(&["111111"]).await;
        let err = store.issue_at("ghost", t0()).await.unwrap_err();
        assert!(matches!(err, SirenError::DeviceNotRegistered(_)));

        store.devices.deregister("D1", None).await.unwrap();
        let err = store.issue_at("D1", t0()).await.unwrap_err();
        assert!(matches!(err, SirenError::DeviceNotRegistered(_)));
    }

    #[tokio::test]
    async fn test_end_to_end_expiry_window() {
        let store = store_with(&["483920", "222222"]).await;
        store.issue_at("D1", t0()).await.unwrap();

        let just_before = t0() + Duration::minutes(9) + Duration::seconds(59);
        let owner = store.redeem_at("483920", just_before).await.unwrap();
        assert_eq!(owner.owner_device_id, "D1");

        let err = store
            .redeem_at("483920", just_before + Duration::seconds(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SirenError::CodeAlreadyConsumed(_)));

        let fresh = store.issue_at("D1", t0()).await.unwrap();
        assert_eq!(fresh.code, "222222");
        let err = store
            .redeem_at("222222", t0() + Duration::minutes(10) + Duration::seconds(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SirenError::CodeExpired(_)));
    }

    #[tokio::test]
    async fn test_expired_is_distinct_from_not_found_after_sweep() {
        let store = store_with(&["483920"]).await;
        store.issue_at("D1", t0()).await.unwrap();

        let later = t0() + Duration::minutes(11);
        let report = store.sweep(later).await.unwrap();
        assert_eq!(report.expired, 1);

        let err = store.redeem_at("483920", later).await.unwrap_err();
        assert!(matches!(err, SirenError::CodeExpired(_)));

        let err = store.redeem_at("999999", later).await.unwrap_err();
        assert!(matches!(err, SirenError::CodeNotFound(_)));
    }

    #[tokio::test]
    async fn test_sweep_purges_after_retention() {
        let store = store_with(&["483920"]).await;
        store.issue_at("D1", t0()).await.unwrap();
        store.sweep(t0() + Duration::minutes(11)).await.unwrap();

        let much_later = t0() + Duration::minutes(10) + Duration::hours(25);
        let report = store.sweep(much_later).await.unwrap();
        assert_eq!(report.purged, 1);
        let err = store.redeem_at("483920", much_later).await.unwrap_err();
        assert!(matches!(err, SirenError::CodeNotFound(_)));
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let store = store_with(&["483920"]).await;
        store.issue_at("D1", t0()).await.unwrap();

        assert_eq!(store.cancel_at("D1", t0()).await.unwrap(), 1);
        assert_eq!(store.cancel_at("D1", t0()).await.unwrap(), 0);
        assert_eq!(store.cancel_at("never-issued", t0()).await.unwrap(), 0);

        let err = store.redeem_at("483920", t0()).await.unwrap_err();
        assert!(matches!(err, SirenError::CodeCancelled(_)));
        assert!(store.active_code_at("D1", t0()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reissue_replaces_previous_code() {
        let store = store_with(&["111111", "222222"]).await;
        store.issue_at("D1", t0()).await.unwrap();
        store.issue_at("D1", t0()).await.unwrap();

        let err = store.redeem_at("111111", t0()).await.unwrap_err();
        assert!(matches!(err, SirenError::CodeCancelled(_)));
        let active = store.active_code_at("D1", t0()).await.unwrap().unwrap();
        assert_eq!(active.code, "222222");
    }

    #[tokio::test]
    async fn test_collision_with_active_code_draws_again() {
        let store = store_with(&["111111", "111111", "333333"]).await;
        store.issue_at("D1", t0()).await.unwrap();

        let second = store.issue_at("D2", t0()).await.unwrap();
        assert_eq!(second.code, "333333");
        // The first owner's code is untouched.
        assert_eq!(
            store.lookup_at("111111", t0()).await.unwrap().owner_device_id,
            "D1"
        );
    }

    #[tokio::test]
    async fn test_retained_code_value_is_not_reissued() {
        let store = store_with(&["111111", "111111", "333333"]).await;
        store.issue_at("D1", t0()).await.unwrap();
        store.redeem_at("111111", t0()).await.unwrap();

        let second = store.issue_at("D2", t0()).await.unwrap();
        assert_eq!(second.code, "333333");
        let err = store.redeem_at("111111", t0()).await.unwrap_err();
        assert!(matches!(err, SirenError::CodeAlreadyConsumed(_)));
    }

    #[tokio::test]
    async fn test_release_reactivates_consumed_code() {
        let store = store_with(&["483920"]).await;
        store.issue_at("D1", t0()).await.unwrap();
        store.redeem_at("483920", t0()).await.unwrap();

        store.release_at("483920", t0()).await.unwrap();
        let active = store.active_code_at("D1", t0()).await.unwrap().unwrap();
        assert_eq!(active.code, "483920");
        assert_eq!(active.expires_at, t0() + Duration::minutes(10));
        store.redeem_at("483920", t0()).await.unwrap();
    }

    #[tokio::test]
    async fn test_release_after_reissue_cancels() {
        let store = store_with(&["111111", "222222"]).await;
        store.issue_at("D1", t0()).await.unwrap();
        store.redeem_at("111111", t0()).await.unwrap();
        store.issue_at("D1", t0()).await.unwrap();

        store.release_at("111111", t0()).await.unwrap();
        let err = store.redeem_at("111111", t0()).await.unwrap_err();
        assert!(matches!(err, SirenError::CodeCancelled(_)));
        let active = store.active_code_at("D1", t0()).await.unwrap().unwrap();
        assert_eq!(active.code, "222222");
    }

    #[tokio::test]
    async fn test_exhausted_code_space() {
        let store = store_with(&["111111"]).await;
        store.issue_at("D1", t0()).await.unwrap();
        let err = store.issue_at("D2", t0()).await.unwrap_err();
        assert!(matches!(err, SirenError::CodeSpaceExhausted { .. }));
    }

    #[tokio::test]
    async fn test_lookup_does_not_consume() {
        let store = store_with(&["483920"]).await;
        store.issue_at("D1", t0()).await.unwrap();
        store.lookup_at("483920", t0()).await.unwrap();
        store.lookup_at("483920", t0()).await.unwrap();
        store.redeem_at("483920", t0()).await.unwrap();
        let err = store.lookup_at("483920", t0()).await.unwrap_err();
        assert!(matches!(err, SirenError::CodeAlreadyConsumed(_)));
    }

    #[tokio::test]
    async fn test_malformed_code_is_validation_error() {
        let store = store_with(&["483920"]).await;
        let err = store.redeem_at("12ab", t0()).await.unwrap_err();
        assert!(matches!(err, SirenError::Validation { field: "code", .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_redeem_succeeds_exactly_once() {
        let store = Arc::new(store_with(&["483920"]).await);
        let now = Utc::now();
        store.issue_at("D1", now).await.unwrap();

        let handles: Vec<_> = (0..100)
            .map(|_| {
                let store = Arc::clone(&store);
                tokio::spawn(async move { store.redeem_at("483920", now).await })
            })
            .collect();

        let mut successes = 0;
        let mut consumed = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => successes += 1,
                Err(SirenError::CodeAlreadyConsumed(_)) => consumed += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(successes, 1);
        assert_eq!(consumed, 99);
    }

    #[test]
    fn test_random_generator_format() {
        let generator = RandomCodeGenerator;
        for _ in 0..100 {
            assert!(is_valid_code_format(&generator.next_code()));
        }
    }
}
