//! gpubid-engine: Bidding, day-lifecycle, and concurrency engine
//!
//! The [`Engine`] owns the single in-memory state document and serializes
//! every mutation through a two-tier lock discipline: per-slot mutexes taken
//! in sorted key order, then the global document lock. Each durable mutation
//! is one atomic store write; a failed write rolls the in-memory document
//! back before the error surfaces.

pub mod admin;
pub mod bidding;
pub mod engine;
pub mod lifecycle;
pub mod locks;
pub mod notify;
pub mod usage;
pub mod view;

pub use bidding::{BidOutcome, BulkBidOutcome, BulkReleaseOutcome, ReleaseOutcome};
pub use engine::Engine;
pub use locks::SlotLockRegistry;
pub use usage::{LiveStatusView, UsageIngest, UsageReport};
pub use view::{DayView, OverviewView, UserSummary};
