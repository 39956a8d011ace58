//! # siren-server
//!
//! HTTP server library for the siren emergency backend.
//!
//! This library provides the API handlers, logging setup and state management.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

pub mod api;
pub mod logging;
pub mod state;
