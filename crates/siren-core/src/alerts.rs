//! Emergency alert fan-out.
//!
//! Each trigger becomes an [`AlertEvent`] that moves through
//! `Created → Dispatching → {AllDelivered, PartialFailure, TotalFailure}`,
//! or straight to `NoRecipients` when the owner has nobody to alert.
//! Recipients are delivered to concurrently; a slow recipient never delays a
//! reachable one. Every recipient state change is persisted so a crash
//! mid-dispatch can be resumed with [`AlertDispatcher::resume_pending`].
//!
//! Events are never deleted, and a terminal event is never modified again.

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::config::AlertsConfig;
use crate::devices::DeviceRegistry;
use crate::error::{Result, SirenError};
use crate::push::{AlertPayload, PushGateway, PushNotification, PushOutcome};
use crate::relationships::RelationshipGraph;
use crate::storage::{Record, SharedRepository};
use crate::types::{redact_token, validate_identifier, validate_push_token};

// =============================================================================
// MODEL
// =============================================================================

/// What the wearable signalled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum EmergencyKind {
    /// Emergency switched on; delivered as a critical alert.
    Activated,
    /// Emergency switched off; delivered as a normal notice.
    StoodDown,
}

impl EmergencyKind {
    /// Interpret a free-form `emergency_type` string.
    ///
    /// Stand-down words (`deactivate`, `stand_down`, `cancel`, `cancelled`,
    /// `stopped`, `0`) map to [`Self::StoodDown`]; everything else is an
    /// activation.
    #[must_use]
    pub fn from_type(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "deactivate" | "deactivated" | "stand_down" | "cancel" | "cancelled" | "stopped" | "0" => {
                Self::StoodDown
            }
            _ => Self::Activated,
        }
    }

    /// Whether notifications for this kind bypass do-not-disturb.
    #[must_use]
    pub const fn is_critical(self) -> bool {
        matches!(self, Self::Activated)
    }
}

/// Delivery state of one recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOutcome {
    /// Not attempted yet.
    Pending,
    /// Accepted by the push gateway.
    Delivered,
    /// Last attempt failed transiently; another attempt will follow.
    FailedRetryable,
    /// Gave up: invalid token, no token, or retry budget exhausted.
    FailedPermanent,
}

impl DeliveryOutcome {
    /// Whether no further attempts will be made.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::FailedPermanent)
    }
}

/// One recipient of an alert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct RecipientDelivery {
    /// Relationship this recipient came from; absent for explicit tokens.
    #[schema(nullable)]
    pub relationship_id: Option<Uuid>,
    /// Contact display name.
    #[schema(nullable)]
    pub contact_name: Option<String>,
    /// Contact's device id.
    #[schema(nullable)]
    pub contact_device_id: Option<String>,
    /// Token the alert is sent to.
    #[schema(nullable)]
    pub push_token: Option<String>,
    /// Current delivery state.
    pub outcome: DeliveryOutcome,
    /// Gateway calls made so far.
    pub attempts: u32,
    /// Reason of the last failure.
    #[schema(nullable)]
    pub last_error: Option<String>,
    /// When the gateway accepted the notification.
    #[schema(nullable)]
    pub delivered_at: Option<DateTime<Utc>>,
}

impl RecipientDelivery {
    fn pending(token: Option<String>) -> Self {
        let missing = token.is_none();
        Self {
            relationship_id: None,
            contact_name: None,
            contact_device_id: None,
            push_token: token,
            outcome: if missing {
                DeliveryOutcome::FailedPermanent
            } else {
                DeliveryOutcome::Pending
            },
            attempts: 0,
            last_error: missing.then(|| "contact has no push token".to_string()),
            delivered_at: None,
        }
    }
}

/// Lifecycle of an alert event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    /// Recorded, dispatch not started.
    Created,
    /// Deliveries in flight.
    Dispatching,
    /// Every recipient delivered.
    AllDelivered,
    /// Some recipients delivered, some failed.
    PartialFailure,
    /// No recipient delivered.
    TotalFailure,
    /// The owner had nobody to alert.
    NoRecipients,
}

impl AlertStatus {
    /// Whether the event is final.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Created | Self::Dispatching)
    }
}

/// One emergency trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct AlertEvent {
    /// Event id; time-ordered.
    pub id: Uuid,
    /// Owner in distress, when known.
    #[schema(nullable)]
    pub owner_user_id: Option<String>,
    /// Wearable that signalled, when known.
    #[schema(nullable)]
    pub owner_device_id: Option<String>,
    /// Activation or stand-down.
    pub kind: EmergencyKind,
    /// When the service recorded the trigger.
    pub triggered_at: DateTime<Utc>,
    /// Timestamp reported by the caller, if any.
    #[schema(nullable)]
    pub reported_at: Option<DateTime<Utc>>,
    /// Notification body.
    pub message: String,
    /// Whether the notification is critical.
    pub critical: bool,
    /// Current lifecycle state.
    pub status: AlertStatus,
    /// Recipients in contact order, explicit tokens last.
    pub recipients: Vec<RecipientDelivery>,
    /// When the event reached a terminal state.
    #[schema(nullable)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Record for AlertEvent {
    const COLLECTION: &'static str = "alerts";

    fn key(&self) -> String {
        self.id.to_string()
    }
}

impl AlertEvent {
    /// Number of recipients delivered.
    #[must_use]
    pub fn delivered_count(&self) -> usize {
        self.recipients
            .iter()
            .filter(|r| r.outcome == DeliveryOutcome::Delivered)
            .count()
    }

    fn settle(&mut self, now: DateTime<Utc>) {
        if !self.recipients.iter().all(|r| r.outcome.is_terminal()) {
            return;
        }
        let delivered = self.delivered_count();
        self.status = if self.recipients.is_empty() {
            AlertStatus::NoRecipients
        } else if delivered == self.recipients.len() {
            AlertStatus::AllDelivered
        } else if delivered == 0 {
            AlertStatus::TotalFailure
        } else {
            AlertStatus::PartialFailure
        };
        self.completed_at = Some(now);
    }
}

/// A push token the gateway rejected permanently, kept for operator follow-up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlaggedToken {
    /// The rejected token.
    pub token: String,
    /// Gateway's reason on the most recent rejection.
    pub reason: String,
    /// First rejection.
    pub first_flagged_at: DateTime<Utc>,
    /// Most recent rejection.
    pub last_flagged_at: DateTime<Utc>,
    /// Number of rejections recorded.
    pub failures: u32,
    /// Alert that produced the most recent rejection.
    pub last_alert_id: Uuid,
    /// Devices whose stored token this is.
    pub device_ids: Vec<String>,
    /// Relationship rows carrying this token.
    pub relationship_ids: Vec<Uuid>,
}

impl Record for FlaggedToken {
    const COLLECTION: &'static str = "flagged_tokens";

    fn key(&self) -> String {
        self.token.clone()
    }
}

/// Bounded exponential retry for transient gateway failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts per recipient.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub initial_backoff: Duration,
    /// Growth factor between delays.
    pub multiplier: f64,
    /// Bound on a single gateway call.
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    /// Delay to wait after `attempt` (1-based) failed.
    #[must_use]
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        self.initial_backoff.mul_f64(self.multiplier.powi(exponent))
    }
}

impl From<&AlertsConfig> for RetryPolicy {
    fn from(config: &AlertsConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            multiplier: config.backoff_multiplier,
            attempt_timeout: Duration::from_millis(config.delivery_timeout_ms),
        }
    }
}

/// Input for [`AlertDispatcher::begin`].
#[derive(Debug, Clone)]
pub struct TriggerRequest {
    /// Owner in distress.
    pub owner_user_id: Option<String>,
    /// Wearable that signalled; resolves the owner when `owner_user_id` is absent.
    pub owner_device_id: Option<String>,
    /// Activation or stand-down.
    pub kind: EmergencyKind,
    /// Overrides the default message when non-empty.
    pub message: Option<String>,
    /// Extra tokens to alert besides the owner's contacts.
    pub extra_tokens: Vec<String>,
    /// Timestamp reported by the caller.
    pub reported_at: Option<DateTime<Utc>>,
}

impl TriggerRequest {
    /// An activation for `owner_user_id` with no extras.
    #[must_use]
    pub fn activation(owner_user_id: &str) -> Self {
        Self {
            owner_user_id: Some(owner_user_id.to_string()),
            owner_device_id: None,
            kind: EmergencyKind::Activated,
            message: None,
            extra_tokens: Vec::new(),
            reported_at: None,
        }
    }
}

/// Default notification text for `kind` at `at`, rendered in `tz`.
#[must_use]
pub fn default_message(kind: EmergencyKind, at: DateTime<Utc>, tz: Tz) -> String {
    let local = at.with_timezone(&tz).format("%Y-%m-%d %H:%M %Z");
    match kind {
        EmergencyKind::Activated => format!(
            "EMERGENCY ALERT\nSIREN Ring activated at {local}\nPlease check on me immediately."
        ),
        EmergencyKind::StoodDown => format!("Emergency stopped - {local}\nI am safe now."),
    }
}

// =============================================================================
// DISPATCHER
// =============================================================================

struct Inner {
    alerts: SharedRepository<AlertEvent>,
    flagged: SharedRepository<FlaggedToken>,
    graph: Arc<RelationshipGraph>,
    devices: Arc<DeviceRegistry>,
    gateway: Arc<dyn PushGateway>,
    policy: RetryPolicy,
    timezone: Tz,
    title: String,
    flag_lock: Mutex<()>,
    in_flight: StdMutex<HashSet<Uuid>>,
    started_at: DateTime<Utc>,
}

/// Exclusive right to dispatch one alert within this process.
struct DispatchClaim<'a> {
    in_flight: &'a StdMutex<HashSet<Uuid>>,
    id: Uuid,
}

impl Drop for DispatchClaim<'_> {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

/// Fans out alerts to an owner's contacts. Cheap to clone.
#[derive(Clone)]
pub struct AlertDispatcher {
    inner: Arc<Inner>,
}

impl AlertDispatcher {
    /// Create a dispatcher.
    ///
    /// # Errors
    ///
    /// Returns [`SirenError::ConfigValidationError`] for an unknown timezone.
    pub fn new(
        alerts: SharedRepository<AlertEvent>,
        flagged: SharedRepository<FlaggedToken>,
        graph: Arc<RelationshipGraph>,
        devices: Arc<DeviceRegistry>,
        gateway: Arc<dyn PushGateway>,
        config: &AlertsConfig,
    ) -> Result<Self> {
        let timezone = config.timezone.parse::<Tz>().map_err(|_| {
            SirenError::ConfigValidationError(format!("unknown timezone {}", config.timezone))
        })?;
        Ok(Self {
            inner: Arc::new(Inner {
                alerts,
                flagged,
                graph,
                devices,
                gateway,
                policy: RetryPolicy::from(config),
                timezone,
                title: config.title.clone(),
                flag_lock: Mutex::new(()),
                in_flight: StdMutex::new(HashSet::new()),
                started_at: Utc::now(),
            }),
        })
    }

    /// Record an alert event and resolve its recipients without sending.
    ///
    /// An owner with no contacts and no extra tokens yields a recorded event
    /// in [`AlertStatus::NoRecipients`].
    ///
    /// # Errors
    ///
    /// Returns a validation error when neither an owner, a device nor any
    /// token is given, [`SirenError::DeviceNotFound`] for an unknown device,
    /// or [`SirenError::OwnerMismatch`] when device and owner disagree.
    pub async fn begin(&self, request: TriggerRequest) -> Result<AlertEvent> {
        let owner_user_id = self.resolve_owner(&request).await?;
        for token in &request.extra_tokens {
            validate_push_token(token)?;
        }
        if owner_user_id.is_none() && request.extra_tokens.is_empty() {
            return Err(SirenError::validation(
                "user_id",
                "one of user_id, device_id or device_tokens is required",
            ));
        }

        let mut recipients = Vec::new();
        if let Some(owner) = &owner_user_id {
            for rel in self.inner.graph.contacts_of(owner).await? {
                recipients.push(RecipientDelivery {
                    relationship_id: Some(rel.id),
                    contact_name: Some(rel.contact_name),
                    contact_device_id: rel.contact_device_id,
                    ..RecipientDelivery::pending(rel.contact_push_token)
                });
            }
        }
        let mut covered: HashSet<String> = recipients
            .iter()
            .filter_map(|r| r.push_token.clone())
            .collect();
        for token in request.extra_tokens {
            if covered.insert(token.clone()) {
                recipients.push(RecipientDelivery::pending(Some(token)));
            }
        }

        let now = Utc::now();
        let message = request
            .message
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| default_message(request.kind, request.reported_at.unwrap_or(now), self.inner.timezone));

        let mut event = AlertEvent {
            id: Uuid::now_v7(),
            owner_user_id,
            owner_device_id: request.owner_device_id,
            kind: request.kind,
            triggered_at: now,
            reported_at: request.reported_at,
            message,
            critical: request.kind.is_critical(),
            status: AlertStatus::Created,
            recipients,
            completed_at: None,
        };
        event.settle(now);
        self.inner.alerts.put(event.clone()).await?;

        tracing::warn!(
            alert_id = %event.id,
            owner = ?event.owner_user_id,
            kind = ?event.kind,
            recipients = event.recipients.len(),
            status = ?event.status,
            "Emergency alert recorded"
        );
        Ok(event)
    }

    /// Deliver every non-terminal recipient of alert `id` and settle the event.
    ///
    /// A terminal event is returned unchanged. While another dispatch of the
    /// same event is running, the stored event is returned without sending.
    ///
    /// # Errors
    ///
    /// Returns [`SirenError::AlertNotFound`] or a storage error.
    pub async fn dispatch(&self, id: Uuid) -> Result<AlertEvent> {
        let Some(_claim) = self.claim(id) else {
            tracing::debug!(alert_id = %id, "Alert dispatch already running");
            return self.get(id).await;
        };
        let mut event = self.get(id).await?;
        if event.status.is_terminal() {
            return Ok(event);
        }

        event.status = AlertStatus::Dispatching;
        self.inner.alerts.put(event.clone()).await?;

        let notification = self.notification_for(&event);
        let targets: Vec<(usize, String)> = event
            .recipients
            .iter()
            .enumerate()
            .filter(|(_, r)| !r.outcome.is_terminal())
            .filter_map(|(i, r)| r.push_token.clone().map(|t| (i, t)))
            .collect();

        let shared = Arc::new(Mutex::new(event));
        join_all(
            targets
                .into_iter()
                .map(|(index, token)| self.deliver(Arc::clone(&shared), index, token, &notification)),
        )
        .await;

        let mut event = shared.lock().await.clone();
        event.settle(Utc::now());
        self.inner.alerts.put(event.clone()).await?;

        tracing::info!(
            alert_id = %event.id,
            status = ?event.status,
            delivered = event.delivered_count(),
            recipients = event.recipients.len(),
            "Emergency alert dispatched"
        );
        Ok(event)
    }

    /// [`begin`](Self::begin) then [`dispatch`](Self::dispatch).
    ///
    /// # Errors
    ///
    /// See [`begin`](Self::begin).
    pub async fn trigger(&self, request: TriggerRequest) -> Result<AlertEvent> {
        let event = self.begin(request).await?;
        self.dispatch(event.id).await
    }

    /// Run [`dispatch`](Self::dispatch) for `id` on a background task.
    pub fn spawn_dispatch(&self, id: Uuid) -> tokio::task::JoinHandle<()> {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            if let Err(e) = dispatcher.dispatch(id).await {
                tracing::error!(alert_id = %id, error = %e, "Alert dispatch failed");
            }
        })
    }

    /// Dispatch every event left non-terminal by a previous run. Events
    /// triggered since this dispatcher was created are left to their own
    /// dispatch.
    ///
    /// # Errors
    ///
    /// Returns an error if the alert collection cannot be read.
    pub async fn resume_pending(&self) -> Result<Vec<AlertEvent>> {
        let started_at = self.inner.started_at;
        let pending: Vec<Uuid> = self
            .inner
            .alerts
            .list()
            .await?
            .into_iter()
            .filter(|e| !e.status.is_terminal() && e.triggered_at < started_at)
            .map(|e| e.id)
            .collect();
        if !pending.is_empty() {
            tracing::warn!(count = pending.len(), "Resuming interrupted alert dispatches");
        }

        let mut resumed = Vec::with_capacity(pending.len());
        for result in join_all(pending.into_iter().map(|id| self.dispatch(id))).await {
            match result {
                Ok(event) => resumed.push(event),
                Err(e) => tracing::error!(error = %e, "Failed to resume alert"),
            }
        }
        Ok(resumed)
    }

    /// Fetch an alert event.
    ///
    /// # Errors
    ///
    /// Returns [`SirenError::AlertNotFound`] if unknown.
    pub async fn get(&self, id: Uuid) -> Result<AlertEvent> {
        self.inner
            .alerts
            .get(&id.to_string())
            .await?
            .ok_or_else(|| SirenError::AlertNotFound(id.to_string()))
    }

    /// `owner_user_id`'s alert events, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub async fn list_for_owner(&self, owner_user_id: &str) -> Result<Vec<AlertEvent>> {
        let mut events: Vec<AlertEvent> = self
            .inner
            .alerts
            .list()
            .await?
            .into_iter()
            .filter(|e| e.owner_user_id.as_deref() == Some(owner_user_id))
            .collect();
        events.sort_by(|a, b| b.triggered_at.cmp(&a.triggered_at).then(b.id.cmp(&a.id)));
        Ok(events)
    }

    /// Tokens flagged for operator follow-up, most recently flagged first.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub async fn flagged_tokens(&self) -> Result<Vec<FlaggedToken>> {
        let mut tokens = self.inner.flagged.list().await?;
        tokens.sort_by(|a, b| b.last_flagged_at.cmp(&a.last_flagged_at));
        Ok(tokens)
    }

    async fn resolve_owner(&self, request: &TriggerRequest) -> Result<Option<String>> {
        let user_id = request.owner_user_id.as_deref().filter(|u| !u.is_empty());
        if let Some(user_id) = user_id {
            validate_identifier("user_id", user_id)?;
        }
        let Some(device_id) = request.owner_device_id.as_deref() else {
            return Ok(user_id.map(str::to_string));
        };

        let device = self.inner.devices.get(device_id).await?;
        match user_id {
            Some(user_id) if user_id != device.owner_user_id => Err(SirenError::OwnerMismatch {
                device_id: device_id.to_string(),
                user_id: user_id.to_string(),
            }),
            _ => Ok(Some(device.owner_user_id)),
        }
    }

    fn claim(&self, id: Uuid) -> Option<DispatchClaim<'_>> {
        let in_flight = &self.inner.in_flight;
        let fresh = in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id);
        fresh.then_some(DispatchClaim { in_flight, id })
    }

    fn notification_for(&self, event: &AlertEvent) -> PushNotification {
        let title = match event.kind {
            EmergencyKind::Activated => self.inner.title.clone(),
            EmergencyKind::StoodDown => format!("{} - stopped", self.inner.title),
        };
        PushNotification {
            title,
            body: event.message.clone(),
            critical: event.critical,
            data: AlertPayload {
                alert_id: event.id,
                owner_user_id: event.owner_user_id.clone(),
                timestamp: event.reported_at.unwrap_or(event.triggered_at),
                message: event.message.clone(),
            },
        }
    }

    /// Run the attempt loop for one recipient, persisting after every attempt.
    async fn deliver(
        &self,
        shared: Arc<Mutex<AlertEvent>>,
        index: usize,
        token: String,
        notification: &PushNotification,
    ) {
        let policy = &self.inner.policy;
        let (alert_id, mut attempts) = {
            let event = shared.lock().await;
            (event.id, event.recipients[index].attempts)
        };

        loop {
            if attempts >= policy.max_attempts {
                // Retry budget already spent before a restart.
                self.record(&shared, index, attempts, AttemptResult::Exhausted).await;
                return;
            }
            attempts += 1;

            let outcome = match tokio::time::timeout(
                policy.attempt_timeout,
                self.inner.gateway.send(&token, notification),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(_) => PushOutcome::RetryableError(format!(
                    "push gateway timed out after {}ms",
                    policy.attempt_timeout.as_millis()
                )),
            };

            tracing::debug!(
                alert_id = %alert_id,
                token = %redact_token(&token),
                attempt = attempts,
                outcome = ?outcome,
                "Delivery attempt"
            );

            match outcome {
                PushOutcome::Delivered => {
                    self.record(&shared, index, attempts, AttemptResult::Delivered).await;
                    return;
                }
                PushOutcome::PermanentError(reason) => {
                    tracing::warn!(
                        alert_id = %alert_id,
                        token = %redact_token(&token),
                        reason = %reason,
                        "Push token rejected, flagging"
                    );
                    self.record(&shared, index, attempts, AttemptResult::Rejected(reason.clone()))
                        .await;
                    if let Err(e) = self.flag_token(&token, &reason, alert_id).await {
                        tracing::error!(alert_id = %alert_id, error = %e, "Failed to flag stale token");
                    }
                    return;
                }
                PushOutcome::RetryableError(reason) if attempts >= policy.max_attempts => {
                    tracing::warn!(
                        alert_id = %alert_id,
                        token = %redact_token(&token),
                        attempts,
                        reason = %reason,
                        "Push gateway unavailable, retry budget exhausted"
                    );
                    self.record(&shared, index, attempts, AttemptResult::Unavailable(reason))
                        .await;
                    return;
                }
                PushOutcome::RetryableError(reason) => {
                    self.record(&shared, index, attempts, AttemptResult::Retrying(reason))
                        .await;
                    tokio::time::sleep(policy.backoff_after(attempts)).await;
                }
            }
        }
    }

    async fn record(&self, shared: &Mutex<AlertEvent>, index: usize, attempts: u32, step: AttemptResult) {
        let mut event = shared.lock().await;
        let recipient = &mut event.recipients[index];
        recipient.attempts = attempts;
        match step {
            AttemptResult::Delivered => {
                recipient.outcome = DeliveryOutcome::Delivered;
                recipient.delivered_at = Some(Utc::now());
                recipient.last_error = None;
            }
            AttemptResult::Retrying(reason) => {
                recipient.outcome = DeliveryOutcome::FailedRetryable;
                recipient.last_error = Some(reason);
            }
            AttemptResult::Rejected(reason) => {
                recipient.outcome = DeliveryOutcome::FailedPermanent;
                recipient.last_error = Some(format!("invalid push token: {reason}"));
            }
            AttemptResult::Unavailable(reason) => {
                recipient.outcome = DeliveryOutcome::FailedPermanent;
                recipient.last_error = Some(format!(
                    "{}: {reason}",
                    SirenError::UpstreamUnavailable(format!("gave up after {attempts} attempts"))
                ));
            }
            AttemptResult::Exhausted => {
                recipient.outcome = DeliveryOutcome::FailedPermanent;
                if recipient.last_error.is_none() {
                    recipient.last_error = Some(format!("gave up after {attempts} attempts"));
                }
            }
        }
        if let Err(e) = self.inner.alerts.put(event.clone()).await {
            tracing::error!(alert_id = %event.id, error = %e, "Failed to persist delivery state");
        }
    }

    async fn flag_token(&self, token: &str, reason: &str, alert_id: Uuid) -> Result<()> {
        let now = Utc::now();
        let device_ids = self.inner.devices.flag_token(token, now).await?;
        let relationship_ids = self.inner.graph.flag_token(token, now).await?;

        let _guard = self.inner.flag_lock.lock().await;
        let record = match self.inner.flagged.get(token).await? {
            Some(mut existing) => {
                existing.reason = reason.to_string();
                existing.last_flagged_at = now;
                existing.failures += 1;
                existing.last_alert_id = alert_id;
                for id in device_ids {
                    if !existing.device_ids.contains(&id) {
                        existing.device_ids.push(id);
                    }
                }
                for id in relationship_ids {
                    if !existing.relationship_ids.contains(&id) {
                        existing.relationship_ids.push(id);
                    }
                }
                existing
            }
            None => FlaggedToken {
                token: token.to_string(),
                reason: reason.to_string(),
                first_flagged_at: now,
                last_flagged_at: now,
                failures: 1,
                last_alert_id: alert_id,
                device_ids,
                relationship_ids,
            },
        };
        self.inner.flagged.put(record).await
    }
}

/// How one attempt left a recipient.
enum AttemptResult {
    Delivered,
    Retrying(String),
    Rejected(String),
    Unavailable(String),
    Exhausted,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelationshipsConfig;
    use crate::push::{MockPushGateway, MockStep};
    use crate::relationships::NewRelationship;
    use crate::storage::MemoryRepository;

    struct Fixture {
        dispatcher: AlertDispatcher,
        graph: Arc<RelationshipGraph>,
        devices: Arc<DeviceRegistry>,
        gateway: Arc<MockPushGateway>,
        alerts: SharedRepository<AlertEvent>,
    }

    fn fast_config() -> AlertsConfig {
        AlertsConfig {
            max_attempts: 3,
            initial_backoff_ms: 5,
            backoff_multiplier: 2.0,
            delivery_timeout_ms: 50,
            ..AlertsConfig::default()
        }
    }

    fn fixture(gateway: MockPushGateway) -> Fixture {
        fixture_with(gateway, &fast_config())
    }

    fn fixture_with(gateway: MockPushGateway, config: &AlertsConfig) -> Fixture {
        let graph = Arc::new(RelationshipGraph::new(
            MemoryRepository::shared(),
            RelationshipsConfig::default(),
        ));
        let devices = Arc::new(DeviceRegistry::new(MemoryRepository::shared(), Arc::clone(&graph)));
        let gateway = Arc::new(gateway);
        let alerts = MemoryRepository::shared();
        let dispatcher = AlertDispatcher::new(
            Arc::clone(&alerts),
            MemoryRepository::shared(),
            Arc::clone(&graph),
            Arc::clone(&devices),
            Arc::clone(&gateway) as Arc<dyn PushGateway>,
            config,
        )
        .unwrap();
        Fixture {
            dispatcher,
            graph,
            devices,
            gateway,
            alerts,
        }
    }

    async fn add_contact(graph: &RelationshipGraph, owner: &str, name: &str, token: Option<&str>) {
        graph
            .add_relationship(NewRelationship {
                owner_user_id: owner.to_string(),
                contact_name: name.to_string(),
                contact_push_token: token.map(str::to_string),
                ..NewRelationship::default()
            })
            .await
            .unwrap();
    }

    #[test]
    fn test_emergency_kind_parsing() {
        assert_eq!(EmergencyKind::from_type("activate"), EmergencyKind::Activated);
        assert_eq!(EmergencyKind::from_type("1"), EmergencyKind::Activated);
        assert_eq!(EmergencyKind::from_type("Stand-Down"), EmergencyKind::StoodDown);
        assert_eq!(EmergencyKind::from_type("cancelled"), EmergencyKind::StoodDown);
        assert_eq!(EmergencyKind::from_type("0"), EmergencyKind::StoodDown);
    }

    #[test]
    fn test_backoff_grows_exponentially() {
        let policy = RetryPolicy::from(&AlertsConfig::default());
        assert_eq!(policy.backoff_after(1), Duration::from_millis(500));
        assert_eq!(policy.backoff_after(2), Duration::from_millis(1000));
        assert_eq!(policy.backoff_after(3), Duration::from_millis(2000));
    }

    #[test]
    fn test_default_message_uses_timezone() {
        let at = DateTime::parse_from_rfc3339("2026-01-15T12:30:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let text = default_message(EmergencyKind::Activated, at, chrono_tz::Europe::Berlin);
        assert!(text.starts_with("EMERGENCY ALERT\nSIREN Ring activated at 2026-01-15 13:30"));
        assert!(text.ends_with("Please check on me immediately."));
    }

    #[tokio::test]
    async fn test_zero_contacts_records_terminal_event() {
        let fx = fixture(MockPushGateway::new());
        let event = fx
            .dispatcher
            .trigger(TriggerRequest::activation("lonely"))
            .await
            .unwrap();
        assert_eq!(event.status, AlertStatus::NoRecipients);
        assert!(event.completed_at.is_some());
        assert_eq!(fx.dispatcher.get(event.id).await.unwrap(), event);
        assert!(fx.gateway.sent().is_empty());
    }

    #[tokio::test]
    async fn test_all_contacts_delivered() {
        let fx = fixture(MockPushGateway::new());
        add_contact(&fx.graph, "owner1", "Mom", Some("tok-mom")).await;
        add_contact(&fx.graph, "owner1", "Dad", Some("tok-dad")).await;

        let event = fx
            .dispatcher
            .trigger(TriggerRequest::activation("owner1"))
            .await
            .unwrap();
        assert_eq!(event.status, AlertStatus::AllDelivered);
        assert!(event.recipients.iter().all(|r| r.attempts == 1));

        let (_, sent) = &fx.gateway.sent()[0];
        assert!(sent.critical);
        assert_eq!(sent.data.owner_user_id.as_deref(), Some("owner1"));
        assert!(sent.body.starts_with("EMERGENCY ALERT"));
    }

    #[tokio::test]
    async fn test_invalid_token_fails_permanently_without_retry() {
        let fx = fixture(MockPushGateway::new().script(
            "tok-dead",
            [MockStep::Respond(PushOutcome::PermanentError("BadDeviceToken".into()))],
        ));
        add_contact(&fx.graph, "owner1", "Sam", Some("tok-dead")).await;

        let event = fx
            .dispatcher
            .trigger(TriggerRequest::activation("owner1"))
            .await
            .unwrap();
        let recipient = &event.recipients[0];
        assert_eq!(recipient.outcome, DeliveryOutcome::FailedPermanent);
        assert_eq!(recipient.attempts, 1);
        assert_eq!(fx.gateway.attempts_for("tok-dead"), 1);
        assert_eq!(event.status, AlertStatus::TotalFailure);

        let flagged = fx.dispatcher.flagged_tokens().await.unwrap();
        assert_eq!(flagged.len(), 1);
        assert_eq!(flagged[0].token, "tok-dead");
        assert_eq!(flagged[0].relationship_ids.len(), 1);
        assert!(fx.graph.contacts_of("owner1").await.unwrap()[0]
            .token_flagged_at
            .is_some());
    }

    #[tokio::test]
    async fn test_timeout_is_retried_then_delivered() {
        let fx = fixture(MockPushGateway::new().script(
            "tok-slow",
            [MockStep::Delay(Duration::from_secs(5), PushOutcome::Delivered)],
        ));
        add_contact(&fx.graph, "owner1", "Sam", Some("tok-slow")).await;

        let event = fx
            .dispatcher
            .trigger(TriggerRequest::activation("owner1"))
            .await
            .unwrap();
        let recipient = &event.recipients[0];
        assert_eq!(recipient.outcome, DeliveryOutcome::Delivered);
        assert_eq!(recipient.attempts, 2);
        assert_eq!(event.status, AlertStatus::AllDelivered);
    }

    #[tokio::test]
    async fn test_persistent_timeouts_exhaust_retries() {
        let slow = MockStep::Delay(Duration::from_secs(5), PushOutcome::Delivered);
        let fx = fixture(MockPushGateway::new().script("tok-slow", vec![slow; 3]));
        add_contact(&fx.graph, "owner1", "Sam", Some("tok-slow")).await;

        let event = fx
            .dispatcher
            .trigger(TriggerRequest::activation("owner1"))
            .await
            .unwrap();
        let recipient = &event.recipients[0];
        assert_eq!(recipient.outcome, DeliveryOutcome::FailedPermanent);
        assert_eq!(recipient.attempts, 3);
        assert!(recipient
            .last_error
            .as_deref()
            .unwrap()
            .contains("timed out"));
        // Unreachable is not the token's fault.
        assert!(fx.dispatcher.flagged_tokens().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_partial_failure_and_tokenless_contact() {
        let fx = fixture(MockPushGateway::new().script(
            "tok-bad",
            [MockStep::Respond(PushOutcome::PermanentError("Unregistered".into()))],
        ));
        add_contact(&fx.graph, "owner1", "Good", Some("tok-good")).await;
        add_contact(&fx.graph, "owner1", "Bad", Some("tok-bad")).await;
        add_contact(&fx.graph, "owner1", "Phone only", None).await;

        let event = fx
            .dispatcher
            .trigger(TriggerRequest::activation("owner1"))
            .await
            .unwrap();
        assert_eq!(event.status, AlertStatus::PartialFailure);
        assert_eq!(event.delivered_count(), 1);
        let phone_only = &event.recipients[2];
        assert_eq!(phone_only.outcome, DeliveryOutcome::FailedPermanent);
        assert_eq!(phone_only.attempts, 0);
    }

    #[tokio::test]
    async fn test_extra_tokens_are_deduplicated() {
        let fx = fixture(MockPushGateway::new());
        add_contact(&fx.graph, "owner1", "Mom", Some("tok-mom")).await;

        let event = fx
            .dispatcher
            .trigger(TriggerRequest {
                extra_tokens: vec!["tok-mom".into(), "tok-extra".into(), "tok-extra".into()],
                ..TriggerRequest::activation("owner1")
            })
            .await
            .unwrap();
        assert_eq!(event.recipients.len(), 2);
        assert_eq!(event.recipients[1].push_token.as_deref(), Some("tok-extra"));
    }

    #[tokio::test]
    async fn test_device_resolves_owner_and_stand_down_is_not_critical() {
        let fx = fixture(MockPushGateway::new());
        fx.devices.register("ring1", "owner1", "Ring").await.unwrap();
        add_contact(&fx.graph, "owner1", "Mom", Some("tok-mom")).await;

        let event = fx
            .dispatcher
            .trigger(TriggerRequest {
                owner_user_id: None,
                owner_device_id: Some("ring1".into()),
                kind: EmergencyKind::StoodDown,
                message: None,
                extra_tokens: Vec::new(),
                reported_at: None,
            })
            .await
            .unwrap();
        assert_eq!(event.owner_user_id.as_deref(), Some("owner1"));
        assert!(!event.critical);
        assert!(event.message.starts_with("Emergency stopped"));
        assert!(!fx.gateway.sent()[0].1.critical);
    }

    #[tokio::test]
    async fn test_trigger_without_target_is_rejected() {
        let fx = fixture(MockPushGateway::new());
        let err = fx
            .dispatcher
            .begin(TriggerRequest {
                owner_user_id: None,
                ..TriggerRequest::activation("x")
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ValidationError);
    }

    #[tokio::test]
    async fn test_terminal_event_is_not_redispatched() {
        let fx = fixture(MockPushGateway::new());
        add_contact(&fx.graph, "owner1", "Mom", Some("tok-mom")).await;
        let event = fx
            .dispatcher
            .trigger(TriggerRequest::activation("owner1"))
            .await
            .unwrap();

        let again = fx.dispatcher.dispatch(event.id).await.unwrap();
        assert_eq!(again, event);
        assert_eq!(fx.gateway.attempts_for("tok-mom"), 1);
    }

    #[tokio::test]
    async fn test_resume_pending_finishes_interrupted_event() {
        let fx = fixture(MockPushGateway::new());
        add_contact(&fx.graph, "owner1", "Mom", Some("tok-mom")).await;
        let mut event = fx
            .dispatcher
            .begin(TriggerRequest::activation("owner1"))
            .await
            .unwrap();

        // Simulate a crash in a previous run after one failed attempt.
        event.triggered_at -= chrono::Duration::minutes(1);
        event.status = AlertStatus::Dispatching;
        event.recipients[0].outcome = DeliveryOutcome::FailedRetryable;
        event.recipients[0].attempts = 1;
        fx.alerts.put(event.clone()).await.unwrap();

        let resumed = fx.dispatcher.resume_pending().await.unwrap();
        assert_eq!(resumed.len(), 1);
        assert_eq!(resumed[0].status, AlertStatus::AllDelivered);
        assert_eq!(resumed[0].recipients[0].attempts, 2);
    }

    #[tokio::test]
    async fn test_resume_pending_skips_events_from_this_run() {
        let fx = fixture(MockPushGateway::new());
        add_contact(&fx.graph, "owner1", "Mom", Some("tok-mom")).await;
        let event = fx
            .dispatcher
            .begin(TriggerRequest::activation("owner1"))
            .await
            .unwrap();

        let resumed = fx.dispatcher.resume_pending().await.unwrap();
        assert!(resumed.is_empty());
        assert_eq!(fx.gateway.attempts_for("tok-mom"), 0);
        assert_eq!(fx.dispatcher.get(event.id).await.unwrap().status, AlertStatus::Created);
    }

    #[tokio::test]
    async fn test_concurrent_dispatch_sends_once() {
        let gateway = MockPushGateway::new().script(
            "tok-mom",
            [MockStep::Delay(Duration::from_millis(20), PushOutcome::Delivered)],
        );
        let fx = fixture(gateway);
        add_contact(&fx.graph, "owner1", "Mom", Some("tok-mom")).await;
        let event = fx
            .dispatcher
            .begin(TriggerRequest::activation("owner1"))
            .await
            .unwrap();

        let (first, second) = tokio::join!(
            fx.dispatcher.dispatch(event.id),
            fx.dispatcher.dispatch(event.id)
        );
        first.unwrap();
        second.unwrap();

        assert_eq!(fx.gateway.attempts_for("tok-mom"), 1);
        let stored = fx.dispatcher.get(event.id).await.unwrap();
        assert_eq!(stored.status, AlertStatus::AllDelivered);
        assert_eq!(stored.recipients[0].attempts, 1);

        // The claim is released once dispatch finishes.
        let again = fx.dispatcher.dispatch(event.id).await.unwrap();
        assert_eq!(again, stored);
    }

    #[tokio::test]
    async fn test_slow_recipients_do_not_delay_reachable_ones() {
        let slow = || [MockStep::Delay(Duration::from_secs(5), PushOutcome::Delivered)];
        let gateway = MockPushGateway::new()
            .script("tok-slow-1", slow())
            .script("tok-slow-2", slow());
        let config = AlertsConfig {
            max_attempts: 1,
            delivery_timeout_ms: 150,
            ..fast_config()
        };
        let fx = fixture_with(gateway, &config);
        add_contact(&fx.graph, "owner1", "Slow one", Some("tok-slow-1")).await;
        add_contact(&fx.graph, "owner1", "Fast", Some("tok-fast")).await;
        add_contact(&fx.graph, "owner1", "Slow two", Some("tok-slow-2")).await;

        let started = std::time::Instant::now();
        let event = fx
            .dispatcher
            .trigger(TriggerRequest::activation("owner1"))
            .await
            .unwrap();
        let elapsed = started.elapsed();

        assert_eq!(event.status, AlertStatus::PartialFailure);
        // Two timeouts in sequence would take at least 300ms.
        assert!(elapsed >= Duration::from_millis(150));
        assert!(elapsed < Duration::from_millis(300), "took {elapsed:?}");

        let fast = event
            .recipients
            .iter()
            .find(|r| r.push_token.as_deref() == Some("tok-fast"))
            .unwrap();
        assert_eq!(fast.outcome, DeliveryOutcome::Delivered);
        let delivered_after = fast.delivered_at.unwrap() - event.triggered_at;
        assert!(delivered_after < chrono::Duration::milliseconds(150));
    }

    #[tokio::test]
    async fn test_list_for_owner_newest_first() {
        let fx = fixture(MockPushGateway::new());
        let first = fx
            .dispatcher
            .trigger(TriggerRequest::activation("owner1"))
            .await
            .unwrap();
        let second = fx
            .dispatcher
            .trigger(TriggerRequest::activation("owner1"))
            .await
            .unwrap();
        fx.dispatcher
            .trigger(TriggerRequest::activation("owner2"))
            .await
            .unwrap();

        let ids: Vec<Uuid> = fx
            .dispatcher
            .list_for_owner("owner1")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec![second.id, first.id]);
    }
}
