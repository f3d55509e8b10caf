//! gpubid-core: Core types for the gpubid scheduler
//!
//! This crate provides the fundamental types used throughout the gpubid system:
//! - The persisted document model (users, days, slots, bids, usage samples)
//! - Schedule and daemon configuration
//! - Clock and day/slot calendar arithmetic
//! - Credit accounting
//! - Error handling
//! - Password hashing

pub mod clock;
pub mod config;
pub mod credits;
pub mod error;
pub mod model;
pub mod password;

pub use clock::*;
pub use config::*;
pub use error::*;
pub use model::*;
