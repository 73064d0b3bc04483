// API crate clippy configuration
#![allow(clippy::result_large_err)] // ApiError wraps billing messages
// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Teamzones API Library
//!
//! HTTP surface of the billing engine: gateway webhook ingestion and the
//! per-company billing endpoints. Authentication happens in front of this
//! service; routes take the company subdomain from the path.

pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
