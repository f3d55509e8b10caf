//! Persisted document model
//!
//! The entire durable state of the scheduler is one JSON document: users,
//! days with their hour/GPU slot grid, raw usage samples, outbid
//! notification queues, and a capped log of recent bids. Maps are ordered so
//! a save/load/save cycle is byte-stable, and unknown JSON fields survive the
//! round trip for forward compatibility.

use indexmap::IndexMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::clock::HOURS_PER_DAY;
use crate::config::ScheduleConfig;

/// Document schema version.
///
/// v3: rollover at day finalization is `min(budget, balance) * rollover +
/// budget`, applied at most once per user per finalized day key
/// (`rollover_applied_for_day` guard); release refunds the fixed `refund`
/// constant for both single and bulk releases.
pub const DOC_VERSION: u32 = 3;

/// Most recent bid records retained in the document
pub const BID_LOG_RETENTION: usize = 500;

/// Identifies one schedulable unit: an hour of one GPU on one day.
///
/// The derived ordering (day, hour, gpu) is the canonical lock-acquisition
/// order for bulk operations.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotKey {
    /// Day key, `YYYY-MM-DD`
    pub day: String,
    /// Logical hour index, 0-23
    pub hour: u8,
    /// GPU index
    pub gpu: u32,
}

impl SlotKey {
    /// Create a new slot key
    pub fn new(day: impl Into<String>, hour: u8, gpu: u32) -> Self {
        Self {
            day: day.into(),
            hour,
            gpu,
        }
    }

    /// Stable string form used in notification queues:
    /// `<day>|<day>T<HH>:00|<gpu>`
    pub fn notification_key(&self) -> String {
        format!("{}|{}T{:02}:00|{}", self.day, self.day, self.hour, self.gpu)
    }
}

impl std::fmt::Display for SlotKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}T{:02}:00/gpu{}", self.day, self.hour, self.gpu)
    }
}

/// User role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Admin => write!(f, "admin"),
        }
    }
}

fn default_true() -> bool {
    true
}

/// A user account with its credit balance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    /// Unique login name
    pub username: String,
    /// PBKDF2-SHA256 hash, hex
    pub password_hash: String,
    /// Hash salt, hex
    pub salt: String,
    /// Role
    pub role: Role,
    /// Credits granted at each day refill
    pub weekly_budget: u32,
    /// Current credit balance
    pub balance: Decimal,
    /// Day key of the last finalization this user was rolled over for
    #[serde(default)]
    pub rollover_applied_for_day: Option<String>,
    /// Disabled users cannot log in and are skipped by refills
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Last successful login, ISO-8601
    #[serde(default)]
    pub last_login: Option<String>,
    /// Unknown fields preserved across load/save
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl User {
    /// Create a new account with a full starting balance
    pub fn new(
        username: impl Into<String>,
        password_hash: String,
        salt: String,
        role: Role,
        weekly_budget: u32,
    ) -> Self {
        Self {
            username: username.into(),
            password_hash,
            salt,
            role,
            weekly_budget,
            balance: Decimal::from(weekly_budget),
            rollover_applied_for_day: None,
            enabled: true,
            last_login: None,
            extra: serde_json::Map::new(),
        }
    }

    /// Whether this user may perform admin operations
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// Day status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DayStatus {
    /// Created but not yet biddable
    Future,
    /// Accepting bids
    Open,
    /// The day currently running; winners have been charged
    Executing,
    /// Immutable history
    Final,
}

impl std::fmt::Display for DayStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DayStatus::Future => write!(f, "future"),
            DayStatus::Open => write!(f, "open"),
            DayStatus::Executing => write!(f, "executing"),
            DayStatus::Final => write!(f, "final"),
        }
    }
}

/// One recorded bid on a slot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BidRecord {
    /// Bidder
    pub user: String,
    /// Price this bid set
    pub price: u32,
    /// Authoritative server timestamp, ISO-8601
    pub ts: String,
    /// Set when the bid was rewound by an undo
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub undone: bool,
}

/// One GPU-hour cell of the day grid
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotEntry {
    /// GPU index
    pub gpu: u32,
    /// Current price; 0 when unclaimed
    pub price: u32,
    /// Current highest bidder
    pub winner: Option<String>,
    /// Ordered bid history for this slot
    #[serde(default)]
    pub bids: Vec<BidRecord>,
    /// Most frequent observed user, frozen at day finalization
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_user: Option<String>,
}

impl SlotEntry {
    fn new(gpu: u32) -> Self {
        Self {
            gpu,
            price: 0,
            winner: None,
            bids: Vec::new(),
            actual_user: None,
        }
    }

    /// Reset to unclaimed (release, undo-to-empty, overdraw zeroing)
    pub fn clear(&mut self) {
        self.winner = None;
        self.price = 0;
        self.bids.clear();
    }
}

/// One logical day: 24 hours of `num_gpus` slots each
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Day {
    /// Lifecycle status
    pub status: DayStatus,
    /// Set once when the day becomes final, ISO-8601
    #[serde(default)]
    pub finalized_at: Option<String>,
    /// Hour index -> per-GPU entries
    pub slots: BTreeMap<u8, Vec<SlotEntry>>,
    /// Unknown fields preserved across load/save
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Day {
    /// Create an empty day grid
    pub fn new(status: DayStatus, num_gpus: u32) -> Self {
        let mut slots = BTreeMap::new();
        for hour in 0..HOURS_PER_DAY {
            slots.insert(hour, (0..num_gpus).map(SlotEntry::new).collect());
        }
        Self {
            status,
            finalized_at: None,
            slots,
            extra: serde_json::Map::new(),
        }
    }

    /// Whether any slot in this day has a winner
    pub fn has_winners(&self) -> bool {
        self.slots
            .values()
            .any(|entries| entries.iter().any(|e| e.winner.is_some()))
    }

    /// Look up one slot entry
    pub fn entry(&self, hour: u8, gpu: u32) -> Option<&SlotEntry> {
        self.slots.get(&hour).and_then(|v| v.get(gpu as usize))
    }

    /// Look up one slot entry mutably
    pub fn entry_mut(&mut self, hour: u8, gpu: u32) -> Option<&mut SlotEntry> {
        self.slots.get_mut(&hour).and_then(|v| v.get_mut(gpu as usize))
    }
}

/// One entry of the global recent-bid log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BidLogRecord {
    pub user: String,
    pub day: String,
    pub hour: u8,
    pub gpu: u32,
    pub price: u32,
    pub ts: String,
}

/// Sample counters for one GPU-hour: username -> observation count.
///
/// Insertion order is significant; it breaks argmax ties at finalization.
pub type SampleCounts = IndexMap<String, u64>;

/// hour -> gpu -> counters
pub type DaySamples = BTreeMap<u8, BTreeMap<u32, SampleCounts>>;

/// The complete persisted state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    /// Schema version, see [`DOC_VERSION`]
    pub version: u32,
    /// Schedule parameters
    pub config: ScheduleConfig,
    /// Accounts by username
    pub users: BTreeMap<String, User>,
    /// Days by day key
    pub days: BTreeMap<String, Day>,
    /// Raw monitor samples by day key
    #[serde(default)]
    pub usage_samples: BTreeMap<String, DaySamples>,
    /// username -> day key -> ordered outbid slot keys
    #[serde(default)]
    pub notifications: BTreeMap<String, BTreeMap<String, Vec<String>>>,
    /// Most recent bids, capped at [`BID_LOG_RETENTION`]
    #[serde(default)]
    pub bid_log: Vec<BidLogRecord>,
    /// Unknown fields preserved across load/save
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Document {
    /// Create an empty document with the given configuration
    pub fn new(config: ScheduleConfig) -> Self {
        Self {
            version: DOC_VERSION,
            config,
            users: BTreeMap::new(),
            days: BTreeMap::new(),
            usage_samples: BTreeMap::new(),
            notifications: BTreeMap::new(),
            bid_log: Vec::new(),
            extra: serde_json::Map::new(),
        }
    }

    /// Day key of the single executing day, if any
    pub fn executing_day(&self) -> Option<(&String, &Day)> {
        self.days
            .iter()
            .find(|(_, day)| day.status == DayStatus::Executing)
    }

    /// Day keys with the given status, in ascending order
    pub fn days_with_status(&self, status: DayStatus) -> Vec<String> {
        self.days
            .iter()
            .filter(|(_, day)| day.status == status)
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Look up the slot entry for a key
    pub fn slot(&self, key: &SlotKey) -> Option<&SlotEntry> {
        self.days.get(&key.day).and_then(|d| d.entry(key.hour, key.gpu))
    }

    /// Append to the recent-bid log, trimming to the retention cap
    pub fn push_bid_log(&mut self, record: BidLogRecord) {
        self.bid_log.push(record);
        if self.bid_log.len() > BID_LOG_RETENTION {
            let excess = self.bid_log.len() - BID_LOG_RETENTION;
            self.bid_log.drain(..excess);
        }
    }

    /// Sample counters for one slot, if any were recorded
    pub fn samples(&self, key: &SlotKey) -> Option<&SampleCounts> {
        self.usage_samples
            .get(&key.day)
            .and_then(|d| d.get(&key.hour))
            .and_then(|h| h.get(&key.gpu))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_key_ordering() {
        let mut keys = vec![
            SlotKey::new("2025-08-03", 0, 0),
            SlotKey::new("2025-08-02", 14, 3),
            SlotKey::new("2025-08-02", 14, 1),
            SlotKey::new("2025-08-02", 9, 7),
        ];
        keys.sort();
        assert_eq!(keys[0], SlotKey::new("2025-08-02", 9, 7));
        assert_eq!(keys[1], SlotKey::new("2025-08-02", 14, 1));
        assert_eq!(keys[2], SlotKey::new("2025-08-02", 14, 3));
        assert_eq!(keys[3], SlotKey::new("2025-08-03", 0, 0));
    }

    #[test]
    fn test_notification_key_format() {
        let key = SlotKey::new("2025-08-02", 14, 3);
        assert_eq!(key.notification_key(), "2025-08-02|2025-08-02T14:00|3");
    }

    #[test]
    fn test_day_grid_shape() {
        let day = Day::new(DayStatus::Open, 8);
        assert_eq!(day.slots.len(), 24);
        assert_eq!(day.slots[&0].len(), 8);
        assert!(day.entry(23, 7).is_some());
        assert!(day.entry(24, 0).is_none());
        assert!(day.entry(0, 8).is_none());
        assert!(!day.has_winners());
    }

    #[test]
    fn test_slot_entry_clear() {
        let mut entry = SlotEntry::new(0);
        entry.price = 3;
        entry.winner = Some("alice".to_string());
        entry.bids.push(BidRecord {
            user: "alice".to_string(),
            price: 3,
            ts: "2025-08-02T10:00:00-04:00".to_string(),
            undone: false,
        });
        entry.clear();
        assert_eq!(entry.price, 0);
        assert!(entry.winner.is_none());
        assert!(entry.bids.is_empty());
    }

    #[test]
    fn test_bid_log_retention() {
        let mut doc = Document::new(ScheduleConfig::default());
        for i in 0..(BID_LOG_RETENTION + 20) {
            doc.push_bid_log(BidLogRecord {
                user: "alice".to_string(),
                day: "2025-08-02".to_string(),
                hour: 0,
                gpu: 0,
                price: i as u32,
                ts: String::new(),
            });
        }
        assert_eq!(doc.bid_log.len(), BID_LOG_RETENTION);
        assert_eq!(doc.bid_log[0].price, 20);
    }

    #[test]
    fn test_unknown_fields_round_trip() {
        let raw = r#"{
            "version": 3,
            "config": {},
            "users": {},
            "days": {},
            "future_field": {"nested": [1, 2, 3]}
        }"#;
        let doc: Document = serde_json::from_str(raw).unwrap();
        assert!(doc.extra.contains_key("future_field"));
        let out = serde_json::to_value(&doc).unwrap();
        assert_eq!(out["future_field"]["nested"][2], 3);
    }
}
