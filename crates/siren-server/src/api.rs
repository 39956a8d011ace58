//! HTTP API routes and handlers.
//!
//! - `devices` - Device registration and push tokens
//! - `codes` - Authentication code issue, lookup and cancellation
//! - `contacts` - Code redemption and contact management
//! - `emergency` - Emergency triggers and alert telemetry
//! - `health` - Service health checks
//! - `error` - API error types, envelope and extractors
//! - `openapi` - OpenAPI specification generation

use axum::routing::get;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::SharedState;

pub mod codes;
pub mod contacts;
pub mod devices;
pub mod emergency;
pub mod error;
pub mod health;
pub mod openapi;

pub use error::{ApiError, ApiResponse, ApiResult, ErrorResponse};
pub use openapi::get_openapi_json;

/// Creates the combined API router with all endpoints.
///
/// # Route Structure
///
/// ```text
/// /health                       - Health check
/// /api
/// ├── /register-device          - Register a device (POST)
/// ├── /update-token             - Update the owner push token (POST)
/// ├── /deregister-device        - Deregister a device (POST)
/// ├── /devices/{device_id}      - Device registration view (GET)
/// ├── /auth-code                - Issue (POST), look up (GET), cancel (DELETE)
/// ├── /contacts                 - Redeem a code (POST), list (GET)
/// ├── /contacts/{id}            - Remove a contact (DELETE)
/// ├── /emergency                - Trigger an alert (POST)
/// ├── /alerts                   - Alert history (GET)
/// ├── /alerts/{id}              - Alert delivery status (GET)
/// ├── /flagged-tokens           - Tokens rejected by the push gateway (GET)
/// └── /openapi.json             - OpenAPI specification
/// ```
pub fn create_router(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health::health_check))
        .nest(
            "/api",
            Router::new()
                .merge(devices::router())
                .merge(codes::router())
                .merge(contacts::router())
                .merge(emergency::router())
                .route("/openapi.json", get(openapi::get_openapi_spec)),
        )
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
