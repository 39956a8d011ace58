//! Push gateway seam.
//!
//! The OS-level push transport (APNs, FCM) is an external collaborator. The
//! core only needs `send(token, notification) -> outcome`, where the outcome
//! tells the dispatcher whether retrying can help.
//!
//! Implementations:
//!
//! - [`HttpPushGateway`] POSTs to a push relay over HTTP.
//! - [`LogPushGateway`] writes notifications to the log (development only).
//! - `MockPushGateway` (feature `mock-push`) replays scripted outcomes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{PushConfig, PushMode};
use crate::error::{Result, SirenError};
use crate::types::redact_token;

/// A notification addressed to one push token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushNotification {
    /// Notification title.
    pub title: String,
    /// Notification body.
    pub body: String,
    /// Critical alerts bypass do-not-disturb on the receiving phone.
    pub critical: bool,
    /// Structured payload delivered alongside the text.
    pub data: AlertPayload,
}

/// Machine-readable payload of an alert notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertPayload {
    /// Alert event this notification belongs to.
    pub alert_id: Uuid,
    /// Owner in distress.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_user_id: Option<String>,
    /// When the emergency was triggered.
    pub timestamp: DateTime<Utc>,
    /// Alert text, repeated for clients that render from data.
    pub message: String,
}

/// Result of a single send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    /// Accepted by the push service.
    Delivered,
    /// Timeout, 5xx or throttling; worth retrying.
    RetryableError(String),
    /// Invalid or expired token; retrying cannot help.
    PermanentError(String),
}

impl PushOutcome {
    /// Whether the notification was delivered.
    #[must_use]
    pub const fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered)
    }
}

/// External push delivery transport.
#[async_trait]
pub trait PushGateway: Send + Sync {
    /// Deliver `notification` to `token`.
    async fn send(&self, token: &str, notification: &PushNotification) -> PushOutcome;
}

/// Construct the gateway selected by `config`.
///
/// # Errors
///
/// Returns an error if the HTTP gateway is selected without an endpoint or
/// its client cannot be built.
pub fn gateway_from_config(config: &PushConfig) -> Result<Arc<dyn PushGateway>> {
    match config.mode {
        PushMode::Log => {
            tracing::warn!("Push gateway in log mode: notifications are NOT delivered");
            Ok(Arc::new(LogPushGateway))
        }
        PushMode::Http => {
            let endpoint = config.endpoint.clone().ok_or_else(|| {
                SirenError::ConfigValidationError("push.endpoint is required in http mode".into())
            })?;
            let gateway = HttpPushGateway::new(
                endpoint,
                config.auth_token.clone(),
                Duration::from_millis(config.request_timeout_ms),
            )?;
            Ok(Arc::new(gateway))
        }
    }
}

// =============================================================================
// HTTP RELAY
// =============================================================================

#[derive(Serialize)]
struct RelayRequest<'a> {
    token: &'a str,
    title: &'a str,
    body: &'a str,
    critical: bool,
    data: &'a AlertPayload,
}

/// Push relay reached over HTTP.
///
/// Status mapping: 2xx delivered; 408, 429 and 5xx retryable; any other 4xx
/// (bad or unregistered token) permanent. Transport errors are retryable.
#[derive(Debug, Clone)]
pub struct HttpPushGateway {
    client: reqwest::Client,
    endpoint: String,
    auth_token: Option<String>,
}

impl HttpPushGateway {
    /// Create a gateway posting to `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns [`SirenError::UpstreamUnavailable`] if the HTTP client cannot
    /// be constructed.
    pub fn new(endpoint: String, auth_token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SirenError::UpstreamUnavailable(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint,
            auth_token,
        })
    }
}

#[async_trait]
impl PushGateway for HttpPushGateway {
    async fn send(&self, token: &str, notification: &PushNotification) -> PushOutcome {
        let body = RelayRequest {
            token,
            title: &notification.title,
            body: &notification.body,
            critical: notification.critical,
            data: &notification.data,
        };

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(auth) = &self.auth_token {
            request = request.bearer_auth(auth);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(token = %redact_token(token), error = %e, "Push relay unreachable");
                return PushOutcome::RetryableError(format!("relay request failed: {e}"));
            }
        };

        let status = response.status();
        if status.is_success() {
            return PushOutcome::Delivered;
        }

        let detail = response.text().await.unwrap_or_default();
        let message = if detail.is_empty() {
            format!("relay returned {status}")
        } else {
            format!("relay returned {status}: {detail}")
        };
        if is_transient_status(status) {
            PushOutcome::RetryableError(message)
        } else {
            PushOutcome::PermanentError(message)
        }
    }
}

/// Returns true for HTTP status codes worth retrying.
fn is_transient_status(status: reqwest::StatusCode) -> bool {
    status.is_server_error() || matches!(status.as_u16(), 408 | 429)
}

// =============================================================================
// LOG GATEWAY
// =============================================================================

/// Gateway that logs notifications and reports them delivered.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogPushGateway;

#[async_trait]
impl PushGateway for LogPushGateway {
    async fn send(&self, token: &str, notification: &PushNotification) -> PushOutcome {
        tracing::info!(
            token = %redact_token(token),
            critical = notification.critical,
            alert_id = %notification.data.alert_id,
            title = %notification.title,
            "Push notification (log gateway)"
        );
        PushOutcome::Delivered
    }
}

// =============================================================================
// MOCK GATEWAY
// =============================================================================

#[cfg(any(test, feature = "mock-push"))]
pub use mock::{MockPushGateway, MockStep};

#[cfg(any(test, feature = "mock-push"))]
mod mock {
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::{PushGateway, PushNotification, PushOutcome};

    /// One scripted gateway reaction.
    #[derive(Debug, Clone)]
    pub enum MockStep {
        /// Return this outcome immediately.
        Respond(PushOutcome),
        /// Sleep, then return this outcome (drives per-attempt timeouts).
        Delay(Duration, PushOutcome),
    }

    /// Gateway replaying scripted outcomes per token.
    ///
    /// Each token has a queue of steps; once a queue is drained (or for an
    /// unscripted token) every send is delivered. All sends are recorded.
    #[derive(Debug, Default)]
    pub struct MockPushGateway {
        scripts: Mutex<HashMap<String, VecDeque<MockStep>>>,
        sent: Mutex<Vec<(String, PushNotification)>>,
    }

    impl MockPushGateway {
        /// Create a gateway that delivers everything.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Queue `steps` for `token`.
        #[must_use]
        pub fn script(self, token: &str, steps: impl IntoIterator<Item = MockStep>) -> Self {
            self.scripts
                .lock()
                .expect("mock gateway lock")
                .entry(token.to_string())
                .or_default()
                .extend(steps);
            self
        }

        /// Every send so far, in call order.
        #[must_use]
        pub fn sent(&self) -> Vec<(String, PushNotification)> {
            self.sent.lock().expect("mock gateway lock").clone()
        }

        /// Number of sends to `token`.
        #[must_use]
        pub fn attempts_for(&self, token: &str) -> usize {
            self.sent
                .lock()
                .expect("mock gateway lock")
                .iter()
                .filter(|(t, _)| t == token)
                .count()
        }
    }

    #[async_trait]
    impl PushGateway for MockPushGateway {
        async fn send(&self, token: &str, notification: &PushNotification) -> PushOutcome {
            self.sent
                .lock()
                .expect("mock gateway lock")
                .push((token.to_string(), notification.clone()));
            let step = self
                .scripts
                .lock()
                .expect("mock gateway lock")
                .get_mut(token)
                .and_then(VecDeque::pop_front);
            match step {
                None => PushOutcome::Delivered,
                Some(MockStep::Respond(outcome)) => outcome,
                Some(MockStep::Delay(delay, outcome)) => {
                    tokio::time::sleep(delay).await;
                    outcome
                }
            }
        }
    }
}
