//! Query façade: read-only views assembled from one consistent snapshot
//!
//! Builders take the document read lock once, collect what they need, and
//! release it before anything is serialized.

use chrono::Duration;
use rust_decimal::Decimal;
use serde::Serialize;

use gpubid_core::{
    clock, credits, DayStatus, Document, Role, SchedError, SchedResult, SlotKey, User,
};

use crate::engine::Engine;
use crate::notify;
use crate::usage;

/// Account summary shown with every authenticated view
#[derive(Debug, Clone, Serialize)]
pub struct UserSummary {
    pub username: String,
    pub role: Role,
    pub balance: Decimal,
    pub weekly_budget: u32,
    pub committed: u64,
    pub available: Decimal,
}

/// One day in the overview strip
#[derive(Debug, Clone, Serialize)]
pub struct DaySummary {
    pub day: String,
    pub status: DayStatus,
    pub open_at: String,
    pub close_at: String,
    pub has_notifications: bool,
}

/// Overview: the executing day plus the open window
#[derive(Debug, Clone, Serialize)]
pub struct OverviewView {
    pub now: String,
    pub time_zone: String,
    pub transition_hour: u8,
    pub days: Vec<DaySummary>,
    pub user: UserSummary,
}

/// One GPU cell of the day grid
#[derive(Debug, Clone, Serialize)]
pub struct GridCell {
    pub gpu: u32,
    pub price: u32,
    pub winner: Option<String>,
    pub actual_user: Option<String>,
    pub status: String,
    #[serde(rename = "isMine")]
    pub is_mine: bool,
    #[serde(rename = "hasBid")]
    pub has_bid: bool,
    #[serde(rename = "canRelease")]
    pub can_release: bool,
    pub live_users: Vec<String>,
    pub most_frequent_user: Option<String>,
    pub most_frequent_non_owner: Option<String>,
    pub is_current_hour: bool,
}

/// One hour row of the day grid
#[derive(Debug, Clone, Serialize)]
pub struct HourRow {
    pub hour: u8,
    pub time_range: String,
    pub entries: Vec<GridCell>,
}

/// Full grid for one day
#[derive(Debug, Clone, Serialize)]
pub struct DayView {
    pub day: String,
    pub status: DayStatus,
    pub open_at: String,
    pub close_at: String,
    pub rows: Vec<HourRow>,
    pub live_timestamp: Option<String>,
    pub outbid_notifications: Vec<String>,
}

/// The caller's winning slots on one day
#[derive(Debug, Clone, Serialize)]
pub struct MyDaySlots {
    pub day: String,
    pub status: DayStatus,
    pub slots: Vec<MySlot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MySlot {
    pub hour: u8,
    pub gpu: u32,
    pub price: u32,
}

/// One of the caller's recent bids, with its current standing
#[derive(Debug, Clone, Serialize)]
pub struct MyBid {
    pub day: String,
    pub hour: u8,
    pub gpu: u32,
    pub price: u32,
    pub ts: String,
    pub status: String,
}

/// A finalized day in the history listing
#[derive(Debug, Clone, Serialize)]
pub struct HistoryDay {
    pub day: String,
    pub finalized_at: Option<String>,
}

pub(crate) fn user_summary(doc: &Document, user: &User) -> UserSummary {
    let committed = credits::committed(doc, &user.username);
    UserSummary {
        username: user.username.clone(),
        role: user.role,
        balance: user.balance,
        weekly_budget: user.weekly_budget,
        committed,
        available: user.balance - Decimal::from(committed),
    }
}

impl Engine {
    /// Account summary for one user
    pub async fn user_summary_for(&self, username: &str) -> SchedResult<UserSummary> {
        let doc = self.doc.read().await;
        let user = doc.users.get(username).ok_or(SchedError::Unauthorized)?;
        Ok(user_summary(&doc, user))
    }

    /// Executing day + open window, with per-day notification flags
    pub async fn overview(&self, username: &str) -> SchedResult<OverviewView> {
        let now = self.clock.now();
        let doc = self.doc.read().await;
        let user = doc.users.get(username).ok_or(SchedError::Unauthorized)?;
        let tz = now.timezone();
        let transition_hour = doc.config.transition_hour;

        let mut keys = doc.days_with_status(DayStatus::Executing);
        keys.extend(doc.days_with_status(DayStatus::Open));

        let mut days = Vec::with_capacity(keys.len());
        for key in keys {
            let start = clock::day_start(tz, &key, transition_hour)?;
            days.push(DaySummary {
                status: doc.days[&key].status,
                open_at: start.to_rfc3339(),
                close_at: clock::day_close(&start).to_rfc3339(),
                has_notifications: notify::has_notifications(&doc, username, &key),
                day: key,
            });
        }

        Ok(OverviewView {
            now: now.to_rfc3339(),
            time_zone: doc.config.timezone.clone(),
            transition_hour,
            days,
            user: user_summary(&doc, user),
        })
    }

    /// Hour x GPU grid for one day
    pub async fn day_view(&self, username: &str, day_key: &str) -> SchedResult<DayView> {
        let now = self.clock.now();
        let live = self.live.read().await.clone();
        let doc = self.doc.read().await;
        let day = doc
            .days
            .get(day_key)
            .ok_or_else(|| SchedError::NotFound(format!("Day {}", day_key)))?;

        let tz = now.timezone();
        let transition_hour = doc.config.transition_hour;
        let start = clock::day_start(tz, day_key, transition_hour)?;
        let current = clock::current_slot(&now, transition_hour)?;
        let next_hour = clock::hour_floor(&now) + Duration::hours(1);

        let mut rows = Vec::with_capacity(day.slots.len());
        for (&hour, entries) in &day.slots {
            let hour_start = start + Duration::hours(hour as i64);
            let is_current_hour = current.0 == day_key && current.1 == hour;

            let cells = entries
                .iter()
                .map(|entry| {
                    let counts = doc.samples(&SlotKey::new(day_key, hour, entry.gpu));
                    let is_mine = entry.winner.as_deref() == Some(username);
                    GridCell {
                        gpu: entry.gpu,
                        price: entry.price,
                        winner: entry.winner.clone(),
                        actual_user: entry.actual_user.clone(),
                        status: if day.status == DayStatus::Open {
                            "open".to_string()
                        } else {
                            "locked".to_string()
                        },
                        is_mine,
                        has_bid: entry.bids.iter().any(|b| b.user == username),
                        can_release: day.status == DayStatus::Executing
                            && is_mine
                            && hour_start >= next_hour,
                        live_users: if is_current_hour {
                            live.usage.get(&entry.gpu).cloned().unwrap_or_default()
                        } else {
                            Vec::new()
                        },
                        most_frequent_user: counts.and_then(usage::most_frequent),
                        most_frequent_non_owner: counts.and_then(|c| {
                            usage::most_frequent_excluding(c, entry.winner.as_deref())
                        }),
                        is_current_hour,
                    }
                })
                .collect();

            rows.push(HourRow {
                hour,
                time_range: clock::format_hour_range(hour, transition_hour),
                entries: cells,
            });
        }

        Ok(DayView {
            day: day_key.to_string(),
            status: day.status,
            open_at: start.to_rfc3339(),
            close_at: clock::day_close(&start).to_rfc3339(),
            rows,
            live_timestamp: live.timestamp,
            outbid_notifications: notify::queue_for(&doc, username, day_key),
        })
    }

    /// Grid for a finalized day only
    pub async fn history_day(&self, username: &str, day_key: &str) -> SchedResult<DayView> {
        {
            let doc = self.doc.read().await;
            match doc.days.get(day_key) {
                Some(day) if day.status == DayStatus::Final => {}
                _ => return Err(SchedError::NotFound(format!("Historical day {}", day_key))),
            }
        }
        self.day_view(username, day_key).await
    }

    /// Finalized days, most recent first
    pub async fn history_days(&self) -> Vec<HistoryDay> {
        let doc = self.doc.read().await;
        doc.days
            .iter()
            .rev()
            .filter(|(_, day)| day.status == DayStatus::Final)
            .map(|(key, day)| HistoryDay {
                day: key.clone(),
                finalized_at: day.finalized_at.clone(),
            })
            .collect()
    }

    /// The caller's winning slots across the executing day and open window
    pub async fn my_summary(&self, username: &str) -> SchedResult<Vec<MyDaySlots>> {
        let doc = self.doc.read().await;
        let mut keys = doc.days_with_status(DayStatus::Executing);
        keys.extend(doc.days_with_status(DayStatus::Open));

        Ok(keys
            .into_iter()
            .map(|key| {
                let day = &doc.days[&key];
                let mut slots: Vec<MySlot> = day
                    .slots
                    .iter()
                    .flat_map(|(&hour, entries)| {
                        entries
                            .iter()
                            .filter(|e| e.winner.as_deref() == Some(username))
                            .map(move |e| MySlot {
                                hour,
                                gpu: e.gpu,
                                price: e.price,
                            })
                    })
                    .collect();
                slots.sort_by_key(|s| (s.hour, s.gpu));
                MyDaySlots {
                    day: key,
                    status: day.status,
                    slots,
                }
            })
            .collect())
    }

    /// The caller's recent bids, newest first, with current standing
    pub async fn my_bids(&self, username: &str, limit: usize) -> Vec<MyBid> {
        let doc = self.doc.read().await;
        doc.bid_log
            .iter()
            .rev()
            .filter(|record| record.user == username)
            .take(limit)
            .map(|record| {
                let entry =
                    doc.slot(&SlotKey::new(record.day.as_str(), record.hour, record.gpu));
                let status = match entry.and_then(|e| e.winner.as_deref()) {
                    Some(winner) if winner == username => "leading",
                    Some(_) => "lost",
                    None => "open",
                };
                MyBid {
                    day: record.day.clone(),
                    hour: record.hour,
                    gpu: record.gpu,
                    price: record.price,
                    ts: record.ts.clone(),
                    status: status.to_string(),
                }
            })
            .collect()
    }
}
