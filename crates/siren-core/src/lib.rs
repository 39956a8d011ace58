//! # siren-core
//!
//! Core logic for the siren emergency backend: pairing a SIREN Ring wearable
//! to its owner, linking emergency contacts through short-lived codes, and
//! fanning out alerts to those contacts when the ring is triggered.
//!
//! ## Architecture
//!
//! - [`codes`] - Six-digit authentication codes with a fixed ten minute lifetime
//! - [`devices`] - Device id to owner binding and owner push tokens
//! - [`relationships`] - Owner to contact edges with live contact push tokens
//! - [`alerts`] - Alert events, bounded-retry delivery and stale token flagging
//! - [`push`] - Push gateway seam (HTTP relay, log, mock)
//! - [`service`] - Construction of all components and cross-component operations
//! - [`storage`] - Repository trait with memory and JSON-file backends
//! - [`config`] - Configuration loading, layering and validation
//! - [`error`] - Unified error type and taxonomy
//! - [`types`] - Shared validation helpers

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![warn(missing_docs)]

pub mod alerts;
pub mod codes;
pub mod config;
pub mod devices;
pub mod error;
pub mod push;
pub mod relationships;
pub mod service;
pub mod storage;
pub mod types;

// Re-export primary types for convenience
pub use alerts::{
    default_message, AlertDispatcher, AlertEvent, AlertStatus, DeliveryOutcome, EmergencyKind,
    FlaggedToken, RecipientDelivery, RetryPolicy, TriggerRequest,
};
pub use codes::{
    AuthCode, CodeGenerator, CodeRedemption, CodeStatus, CodeStore, SweepReport, CODE_TTL_MINUTES,
};
pub use config::{
    default_config_path, default_data_dir, is_valid_timezone, AlertsConfig, CodesConfig, Config,
    ConfigError, ConfigResult, LoggingConfig, PushConfig, PushMode, RelationshipsConfig,
    ServerConfig, StorageBackend, StorageConfig,
};
pub use devices::{Device, DeviceRegistry, TokenUpdate};
pub use error::{ErrorKind, Result, SirenError};
#[cfg(any(test, feature = "mock-push"))]
pub use push::{MockPushGateway, MockStep};
pub use push::{
    gateway_from_config, AlertPayload, HttpPushGateway, LogPushGateway, PushGateway,
    PushNotification, PushOutcome,
};
pub use relationships::{EmergencyRelationship, NewRelationship, RelationshipGraph};
pub use service::{ContactSignup, Deregistration, Siren};
pub use storage::{FileRepository, MemoryRepository, Record, Repository, SharedRepository};
pub use types::redact_token;
