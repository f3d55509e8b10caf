//! Administrative operations
//!
//! Role checks happen at the HTTP layer; these methods trust their caller.

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::info;

use gpubid_core::{
    clock, credits, password, DayStatus, Role, SchedError, SchedResult, User,
};

use crate::engine::Engine;
use crate::lifecycle;

/// Per-user administrative listing
#[derive(Debug, Clone, Serialize)]
pub struct AdminUserView {
    pub username: String,
    pub role: Role,
    pub weekly_budget: u32,
    pub balance: Decimal,
    pub rollover_applied_for_day: Option<String>,
    pub enabled: bool,
    pub committed: u64,
    pub last_login: Option<String>,
}

/// Field mask for user updates
#[derive(Debug, Clone, Default)]
pub struct UserUpdate {
    pub weekly_budget: Option<u32>,
    pub balance_delta: Option<i64>,
    pub enabled: Option<bool>,
}

/// Day listing with boundaries
#[derive(Debug, Clone, Serialize)]
pub struct AdminDayView {
    pub day: String,
    pub status: DayStatus,
    pub finalized_at: Option<String>,
    pub open_at: String,
    pub close_at: String,
}

/// Result of a manual day advance
#[derive(Debug, Clone, Serialize)]
pub struct AdvanceOutcome {
    pub finalized: Option<String>,
    pub executing: String,
}

/// One line of the schedule export
#[derive(Debug, Clone)]
pub struct ScheduleExportRow {
    pub slot_id: String,
    pub gpu: u32,
    pub start_utc: String,
    pub end_utc: String,
    pub winner: Option<String>,
    pub price: u32,
}

/// One line of the usage-audit export
#[derive(Debug, Clone)]
pub struct UsageExportRow {
    pub slot_id: String,
    pub gpu: u32,
    pub start_utc: String,
    pub end_utc: String,
    pub assigned_user: Option<String>,
    pub actual_user: Option<String>,
    pub match_status: &'static str,
    /// (username, count), most samples first
    pub samples: Vec<(String, u64)>,
}

/// Assigned vs observed classification for the usage export
fn match_status(assigned: Option<&str>, actual: Option<&str>) -> &'static str {
    match (assigned, actual) {
        (None, None) => "empty",
        (None, Some(_)) => "squatter",
        (Some(_), None) => "no_show",
        (Some(a), Some(b)) if a == b => "match",
        _ => "mismatch",
    }
}

impl Engine {
    /// All accounts with commitment totals
    pub async fn list_users(&self) -> Vec<AdminUserView> {
        let doc = self.doc.read().await;
        doc.users
            .values()
            .map(|user| AdminUserView {
                username: user.username.clone(),
                role: user.role,
                weekly_budget: user.weekly_budget,
                balance: user.balance,
                rollover_applied_for_day: user.rollover_applied_for_day.clone(),
                enabled: user.enabled,
                committed: credits::committed(&doc, &user.username),
                last_login: user.last_login.clone(),
            })
            .collect()
    }

    /// Create an account
    pub async fn create_user(
        &self,
        username: &str,
        password_input: &str,
        role: Role,
        weekly_budget: u32,
    ) -> SchedResult<AdminUserView> {
        let username = username.trim();
        if username.is_empty() {
            return Err(SchedError::Validation("Username is required".to_string()));
        }
        if password_input.is_empty() {
            return Err(SchedError::Validation("Password is required".to_string()));
        }

        let mut doc = self.doc.write().await;
        if doc.users.contains_key(username) {
            return Err(SchedError::Validation("Username already exists".to_string()));
        }

        let before = doc.clone();
        let (salt, hash) = password::hash_password(password_input);
        doc.users.insert(
            username.to_string(),
            User::new(username, hash, salt, role, weekly_budget),
        );
        self.persist_or_rollback(&mut doc, before).await?;

        info!(user = username, %role, "User created");
        let user = &doc.users[username];
        Ok(AdminUserView {
            username: user.username.clone(),
            role: user.role,
            weekly_budget: user.weekly_budget,
            balance: user.balance,
            rollover_applied_for_day: None,
            enabled: true,
            committed: 0,
            last_login: None,
        })
    }

    /// Apply a field mask to one account
    pub async fn update_user(&self, username: &str, update: UserUpdate) -> SchedResult<()> {
        let mut doc = self.doc.write().await;
        if !doc.users.contains_key(username) {
            return Err(SchedError::NotFound(format!("User {}", username)));
        }

        let before = doc.clone();
        let user = doc
            .users
            .get_mut(username)
            .ok_or_else(|| SchedError::NotFound(format!("User {}", username)))?;
        apply_update(user, &update);
        self.persist_or_rollback(&mut doc, before).await
    }

    /// Apply a field mask to every account
    pub async fn bulk_update_users(&self, update: UserUpdate) -> SchedResult<usize> {
        let mut doc = self.doc.write().await;
        let before = doc.clone();
        for user in doc.users.values_mut() {
            apply_update(user, &update);
        }
        let count = doc.users.len();
        self.persist_or_rollback(&mut doc, before).await?;
        Ok(count)
    }

    /// Reset an account's password
    pub async fn set_user_password(&self, username: &str, password_input: &str) -> SchedResult<()> {
        if password_input.is_empty() {
            return Err(SchedError::Validation("Password is required".to_string()));
        }
        let mut doc = self.doc.write().await;
        if !doc.users.contains_key(username) {
            return Err(SchedError::NotFound(format!("User {}", username)));
        }

        let before = doc.clone();
        let (salt, hash) = password::hash_password(password_input);
        if let Some(user) = doc.users.get_mut(username) {
            user.salt = salt;
            user.password_hash = hash;
        }
        self.persist_or_rollback(&mut doc, before).await
    }

    /// All days with boundaries, ascending
    pub async fn list_days(&self) -> SchedResult<Vec<AdminDayView>> {
        let now = self.clock.now();
        let doc = self.doc.read().await;
        let tz = now.timezone();
        let mut days = Vec::with_capacity(doc.days.len());
        for (key, day) in &doc.days {
            let start = clock::day_start(tz, key, doc.config.transition_hour)?;
            days.push(AdminDayView {
                day: key.clone(),
                status: day.status,
                finalized_at: day.finalized_at.clone(),
                open_at: start.to_rfc3339(),
                close_at: clock::day_close(&start).to_rfc3339(),
            });
        }
        Ok(days)
    }

    /// Force one lifecycle step now: finalize the executing day (if any) and
    /// promote the first open day.
    pub async fn advance_day(&self) -> SchedResult<AdvanceOutcome> {
        let now = self.clock.now();
        let mut doc = self.doc.write().await;

        let open = doc.days_with_status(DayStatus::Open);
        let Some(next) = open.first().cloned() else {
            return Err(SchedError::Validation("No open days to promote".to_string()));
        };

        let before = doc.clone();
        let finalized = doc.executing_day().map(|(key, _)| key.clone());
        if let Some(key) = &finalized {
            lifecycle::finalize_day(&mut doc, key, &now)?;
        }
        lifecycle::promote_to_executing(&mut doc, &next)?;
        lifecycle::ensure_horizon(&mut doc)?;
        self.persist_or_rollback(&mut doc, before).await?;

        if let Some(day) = &finalized {
            self.locks.purge_day(day);
        }
        info!(finalized = ?finalized, executing = %next, "Manual day advance");
        Ok(AdvanceOutcome {
            finalized,
            executing: next,
        })
    }

    /// Current day transition hour
    pub async fn transition_hour(&self) -> u8 {
        self.doc.read().await.config.transition_hour
    }

    /// Move the day boundary; takes effect for all subsequent calendar math
    pub async fn set_transition_hour(&self, hour: u8) -> SchedResult<()> {
        if hour > 23 {
            return Err(SchedError::Validation(
                "Transition hour must be between 0 and 23".to_string(),
            ));
        }
        let mut doc = self.doc.write().await;
        let before = doc.clone();
        doc.config.transition_hour = hour;
        self.persist_or_rollback(&mut doc, before).await
    }

    /// Drop old days, keeping the executing day, the open window, and the
    /// `keep_count` most recent of the rest. Returns the dropped keys.
    pub async fn cleanup_days(&self, keep_count: usize) -> SchedResult<Vec<String>> {
        let mut doc = self.doc.write().await;
        let before = doc.clone();

        let mut protected: Vec<String> = doc.days_with_status(DayStatus::Executing);
        protected.extend(doc.days_with_status(DayStatus::Open));

        let mut others: Vec<String> = doc
            .days
            .keys()
            .filter(|key| !protected.contains(key))
            .cloned()
            .collect();
        others.sort_by(|a, b| b.cmp(a));
        let deleted: Vec<String> = others.into_iter().skip(keep_count).collect();

        for key in &deleted {
            doc.days.remove(key);
            doc.usage_samples.remove(key);
            for queues in doc.notifications.values_mut() {
                queues.remove(key);
            }
        }
        doc.notifications.retain(|_, queues| !queues.is_empty());

        self.persist_or_rollback(&mut doc, before).await?;
        for key in &deleted {
            self.locks.purge_day(key);
        }
        info!(deleted = deleted.len(), "Cleaned up old days");
        Ok(deleted)
    }

    /// Wipe the calendar and reinitialize from the clock
    pub async fn reset_days(&self) -> SchedResult<()> {
        {
            let mut doc = self.doc.write().await;
            let before = doc.clone();
            doc.days.clear();
            doc.usage_samples.clear();
            doc.notifications.clear();
            self.persist_or_rollback(&mut doc, before).await?;
        }
        self.locks.clear();
        self.tick().await
    }

    /// Zero every bid in one day, keeping observed usage
    pub async fn clear_day_bids(&self, day_key: &str) -> SchedResult<usize> {
        let mut doc = self.doc.write().await;
        if !doc.days.contains_key(day_key) {
            return Err(SchedError::NotFound(format!("Day {}", day_key)));
        }

        let before = doc.clone();
        let mut cleared = 0;
        if let Some(day) = doc.days.get_mut(day_key) {
            for entries in day.slots.values_mut() {
                for entry in entries.iter_mut() {
                    if entry.winner.is_some() || entry.price > 0 {
                        entry.clear();
                        cleared += 1;
                    }
                }
            }
        }
        self.persist_or_rollback(&mut doc, before).await?;
        Ok(cleared)
    }

    /// Schedule rows for a day, exportable once bidding has closed
    pub async fn export_schedule(&self, day_key: &str) -> SchedResult<Vec<ScheduleExportRow>> {
        let doc = self.doc.read().await;
        let day = doc
            .days
            .get(day_key)
            .filter(|d| matches!(d.status, DayStatus::Executing | DayStatus::Final))
            .ok_or_else(|| {
                SchedError::Validation(format!("Day {} is not ready for export", day_key))
            })?;

        let tz = self.clock.tz();
        let transition_hour = doc.config.transition_hour;
        let mut rows = Vec::new();
        for (&hour, entries) in &day.slots {
            let start = clock::slot_start(tz, day_key, hour, transition_hour)?
                .with_timezone(&Utc);
            let end = start + chrono::Duration::hours(1);
            for entry in entries {
                rows.push(ScheduleExportRow {
                    slot_id: format!("{}T{:02}:00_gpu{}", day_key, hour, entry.gpu),
                    gpu: entry.gpu,
                    start_utc: start.to_rfc3339(),
                    end_utc: end.to_rfc3339(),
                    winner: entry.winner.clone(),
                    price: entry.price,
                });
            }
        }
        Ok(rows)
    }

    /// Usage-audit rows comparing assigned winners with observed users
    pub async fn export_usage(&self, day_key: &str) -> SchedResult<Vec<UsageExportRow>> {
        let doc = self.doc.read().await;
        let day = doc
            .days
            .get(day_key)
            .filter(|d| matches!(d.status, DayStatus::Executing | DayStatus::Final))
            .ok_or_else(|| {
                SchedError::Validation(format!("Day {} is not ready for export", day_key))
            })?;

        let tz = self.clock.tz();
        let transition_hour = doc.config.transition_hour;
        let day_samples = doc.usage_samples.get(day_key);
        let mut rows = Vec::new();
        for (&hour, entries) in &day.slots {
            let start = clock::slot_start(tz, day_key, hour, transition_hour)?
                .with_timezone(&Utc);
            let end = start + chrono::Duration::hours(1);
            for entry in entries {
                let mut samples: Vec<(String, u64)> = day_samples
                    .and_then(|d| d.get(&hour))
                    .and_then(|h| h.get(&entry.gpu))
                    .map(|counts| counts.iter().map(|(u, &c)| (u.clone(), c)).collect())
                    .unwrap_or_default();
                samples.sort_by(|a, b| b.1.cmp(&a.1));

                rows.push(UsageExportRow {
                    slot_id: format!("{}T{:02}:00_gpu{}", day_key, hour, entry.gpu),
                    gpu: entry.gpu,
                    start_utc: start.to_rfc3339(),
                    end_utc: end.to_rfc3339(),
                    assigned_user: entry.winner.clone(),
                    actual_user: entry.actual_user.clone(),
                    match_status: match_status(
                        entry.winner.as_deref(),
                        entry.actual_user.as_deref(),
                    ),
                    samples,
                });
            }
        }
        Ok(rows)
    }

    /// The full document, for backup downloads
    pub async fn export_snapshot(&self) -> SchedResult<serde_json::Value> {
        let doc = self.doc.read().await;
        Ok(serde_json::to_value(&*doc)?)
    }
}

fn apply_update(user: &mut User, update: &UserUpdate) {
    if let Some(budget) = update.weekly_budget {
        user.weekly_budget = budget;
    }
    if let Some(delta) = update.balance_delta {
        user.balance = Decimal::ZERO.max(user.balance + Decimal::from(delta));
    }
    if let Some(enabled) = update.enabled {
        user.enabled = enabled;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testutil::{at, test_engine};
    use gpubid_core::SlotKey;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_create_and_list_users() {
        let (engine, _dir) = test_engine().await;
        engine
            .create_user("carol", "secret", Role::User, 50)
            .await
            .unwrap();

        let err = engine
            .create_user("carol", "other", Role::User, 50)
            .await
            .unwrap_err();
        assert!(matches!(err, SchedError::Validation(_)));

        let users = engine.list_users().await;
        let carol = users.iter().find(|u| u.username == "carol").unwrap();
        assert_eq!(carol.balance, dec!(50));
        assert_eq!(carol.weekly_budget, 50);
    }

    #[tokio::test]
    async fn test_update_user_clamps_balance_at_zero() {
        let (engine, _dir) = test_engine().await;
        engine
            .update_user(
                "alice",
                UserUpdate {
                    balance_delta: Some(-15),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let users = engine.list_users().await;
        let alice = users.iter().find(|u| u.username == "alice").unwrap();
        assert_eq!(alice.balance, dec!(0));
    }

    #[tokio::test]
    async fn test_bulk_update_users() {
        let (engine, _dir) = test_engine().await;
        let count = engine
            .bulk_update_users(UserUpdate {
                weekly_budget: Some(20),
                balance_delta: Some(5),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(count, 2);

        for user in engine.list_users().await {
            assert_eq!(user.weekly_budget, 20);
            assert_eq!(user.balance, dec!(15));
        }
    }

    #[tokio::test]
    async fn test_manual_advance_day() {
        let (engine, _dir) = test_engine().await;
        let outcome = engine.advance_day().await.unwrap();
        assert_eq!(outcome.finalized.as_deref(), Some("2025-08-02"));
        assert_eq!(outcome.executing, "2025-08-03");

        let doc = engine.doc.read().await;
        assert_eq!(doc.days["2025-08-02"].status, DayStatus::Final);
        assert_eq!(doc.days["2025-08-03"].status, DayStatus::Executing);
        assert_eq!(doc.days_with_status(DayStatus::Open).len(), 6);
    }

    #[tokio::test]
    async fn test_cleanup_days_protects_active_window() {
        let (engine, _dir) = test_engine().await;
        // Finalize three days
        engine.clock().set(at(2025, 8, 5, 1, 0));
        engine.tick().await.unwrap();

        let deleted = engine.cleanup_days(1).await.unwrap();
        assert_eq!(
            deleted,
            vec!["2025-08-03".to_string(), "2025-08-02".to_string()]
        );

        let doc = engine.doc.read().await;
        assert!(doc.days.contains_key("2025-08-04"));
        assert!(doc.days.contains_key("2025-08-05"));
        assert!(!doc.days.contains_key("2025-08-02"));
    }

    #[tokio::test]
    async fn test_reset_days_reinitializes() {
        let (engine, _dir) = test_engine().await;
        engine
            .place_bid("alice", SlotKey::new("2025-08-03", 14, 3))
            .await
            .unwrap();

        engine.reset_days().await.unwrap();

        let doc = engine.doc.read().await;
        assert_eq!(doc.days_with_status(DayStatus::Executing).len(), 1);
        assert_eq!(doc.days_with_status(DayStatus::Open).len(), 6);
        assert!(doc.slot(&SlotKey::new("2025-08-03", 14, 3)).unwrap().winner.is_none());
    }

    #[tokio::test]
    async fn test_clear_day_bids() {
        let (engine, _dir) = test_engine().await;
        engine
            .place_bid("alice", SlotKey::new("2025-08-03", 14, 3))
            .await
            .unwrap();
        engine
            .place_bid("alice", SlotKey::new("2025-08-03", 15, 0))
            .await
            .unwrap();

        let cleared = engine.clear_day_bids("2025-08-03").await.unwrap();
        assert_eq!(cleared, 2);

        let doc = engine.doc.read().await;
        assert!(doc.slot(&SlotKey::new("2025-08-03", 14, 3)).unwrap().winner.is_none());
    }

    #[tokio::test]
    async fn test_export_schedule_gates_on_status() {
        let (engine, _dir) = test_engine().await;
        // Open days are not exportable
        assert!(engine.export_schedule("2025-08-03").await.is_err());

        let rows = engine.export_schedule("2025-08-02").await.unwrap();
        assert_eq!(rows.len(), 24 * 8);
        assert_eq!(rows[0].slot_id, "2025-08-02T00:00_gpu0");
        // Midnight ET on Aug 2 is 04:00 UTC
        assert_eq!(rows[0].start_utc, "2025-08-02T04:00:00+00:00");
    }

    #[tokio::test]
    async fn test_export_usage_match_statuses() {
        let (engine, _dir) = test_engine().await;
        {
            let mut doc = engine.doc.write().await;
            let day = doc.days.get_mut("2025-08-02").unwrap();
            day.entry_mut(9, 0).unwrap().winner = Some("alice".to_string());
            day.entry_mut(9, 0).unwrap().actual_user = Some("alice".to_string());
            day.entry_mut(9, 1).unwrap().winner = Some("alice".to_string());
            day.entry_mut(9, 2).unwrap().actual_user = Some("bob".to_string());
            day.entry_mut(9, 3).unwrap().winner = Some("alice".to_string());
            day.entry_mut(9, 3).unwrap().actual_user = Some("bob".to_string());
        }

        let rows = engine.export_usage("2025-08-02").await.unwrap();
        let row = |gpu: u32| rows.iter().find(|r| r.gpu == gpu && r.slot_id.contains("T09")).unwrap();
        assert_eq!(row(0).match_status, "match");
        assert_eq!(row(1).match_status, "no_show");
        assert_eq!(row(2).match_status, "squatter");
        assert_eq!(row(3).match_status, "mismatch");
        assert_eq!(row(4).match_status, "empty");
    }
}
