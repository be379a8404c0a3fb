//! HTTP API for the classification proxy.
//!
//! - **[`handlers`]**: Axum route handlers
//! - **[`models`]**: Wire types for the classify contract
//!
//! The only business endpoint is `POST /api/classify`. Everything else on the router
//! (health, metrics, OpenAPI docs) is operational.

pub mod handlers;
pub mod models;
