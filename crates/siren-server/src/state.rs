//! Application state shared across handlers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use siren_core::Siren;

/// Handle passed to every handler.
pub type SharedState = Arc<AppState>;

/// Shared application state.
pub struct AppState {
    siren: Siren,
    started_at: DateTime<Utc>,
}

impl AppState {
    /// Wrap an assembled service.
    #[must_use]
    pub fn new(siren: Siren) -> SharedState {
        Arc::new(Self {
            siren,
            started_at: Utc::now(),
        })
    }

    /// The service components.
    #[must_use]
    pub const fn siren(&self) -> &Siren {
        &self.siren
    }

    /// When this process started serving.
    #[must_use]
    pub const fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }
}
