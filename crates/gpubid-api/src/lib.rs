//! gpubid-api: HTTP surface for the gpubid scheduler
//!
//! Thin axum handlers over the engine: session-cookie auth for users,
//! bearer-token auth for the GPU monitor, JSON errors in a fixed shape, and
//! CSV export for admins.

pub mod auth;
pub mod csv;
pub mod rest;

pub use auth::SessionStore;
pub use rest::{create_router, AppState};
