//! Bid placement, undo, and slot release
//!
//! All four operations share the same locking shape: slot locks first (in
//! sorted key order for batches), then the document write lock, then one
//! durable write. Bulk operations validate every slot before mutating any,
//! so outside observers see either the whole batch or none of it.

use chrono::{DateTime, Duration};
use chrono_tz::Tz;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info};

use gpubid_core::{
    clock, credits, BidLogRecord, BidRecord, DayStatus, Document, SchedError, SchedResult, SlotKey,
};

use crate::engine::Engine;
use crate::notify;

/// Result of a single bid
#[derive(Debug, Clone, Serialize)]
pub struct BidOutcome {
    /// New slot price (always previous + 1)
    pub price: u32,
    /// Winner displaced by this bid, if any
    pub previous_winner: Option<String>,
    /// Price before this bid
    pub previous_price: u32,
}

/// One slot's result within a bulk bid
#[derive(Debug, Clone, Serialize)]
pub struct BulkBidResult {
    pub day: String,
    pub hour: u8,
    pub gpu: u32,
    pub price: u32,
}

/// Result of an atomic bulk bid
#[derive(Debug, Clone, Serialize)]
pub struct BulkBidOutcome {
    pub results: Vec<BulkBidResult>,
    /// Incremental credits committed by the batch
    pub total_cost: u64,
}

/// Result of a single release
#[derive(Debug, Clone, Serialize)]
pub struct ReleaseOutcome {
    pub refund: Decimal,
    pub new_balance: Decimal,
}

/// Result of a bulk release
#[derive(Debug, Clone, Serialize)]
pub struct BulkReleaseOutcome {
    pub released: usize,
    pub total_refund: Decimal,
    pub new_balance: Decimal,
}

/// A validated bid, ready to apply
struct PlannedBid {
    key: SlotKey,
    required: u32,
    previous_price: u32,
    previous_winner: Option<String>,
    /// Incremental commitment: 1 when raising our own slot, else the full
    /// required price
    delta: u64,
}

fn validate_bid(doc: &Document, username: &str, key: &SlotKey) -> SchedResult<PlannedBid> {
    let day = doc
        .days
        .get(&key.day)
        .ok_or_else(|| SchedError::NotFound(format!("Day {}", key.day)))?;
    if day.status != DayStatus::Open {
        return Err(SchedError::Validation(format!(
            "Bidding is closed for day {}",
            key.day
        )));
    }
    let entry = day
        .entry(key.hour, key.gpu)
        .ok_or_else(|| SchedError::NotFound(format!("Slot {}", key)))?;

    let required = entry.price + 1;
    let previous_winner = entry.winner.clone();
    let delta = if previous_winner.as_deref() == Some(username) {
        1
    } else {
        required as u64
    };
    Ok(PlannedBid {
        key: key.clone(),
        required,
        previous_price: entry.price,
        previous_winner,
        delta,
    })
}

fn check_funds(doc: &Document, username: &str, needed: u64) -> SchedResult<()> {
    let user = doc.users.get(username).ok_or(SchedError::Unauthorized)?;
    let available = credits::available(doc, user);
    if available < Decimal::from(needed) {
        return Err(SchedError::InsufficientCredits {
            needed: Decimal::from(needed),
            available,
        });
    }
    Ok(())
}

/// Apply a validated bid: set price and winner, append the bid record,
/// notify the displaced winner, and log the bid.
fn execute_bid(doc: &mut Document, username: &str, plan: &PlannedBid, ts: &str) -> SchedResult<()> {
    let entry = doc
        .days
        .get_mut(&plan.key.day)
        .and_then(|d| d.entry_mut(plan.key.hour, plan.key.gpu))
        .ok_or_else(|| SchedError::Internal(format!("Slot {} vanished mid-bid", plan.key)))?;
    entry.price = plan.required;
    entry.winner = Some(username.to_string());
    entry.bids.push(BidRecord {
        user: username.to_string(),
        price: plan.required,
        ts: ts.to_string(),
        undone: false,
    });

    if let Some(previous) = &plan.previous_winner {
        if previous != username {
            notify::enqueue_outbid(doc, previous, &plan.key);
        }
    }

    doc.push_bid_log(BidLogRecord {
        user: username.to_string(),
        day: plan.key.day.clone(),
        hour: plan.key.hour,
        gpu: plan.key.gpu,
        price: plan.required,
        ts: ts.to_string(),
    });
    Ok(())
}

fn validate_release(
    doc: &Document,
    username: &str,
    key: &SlotKey,
    now: &DateTime<Tz>,
) -> SchedResult<()> {
    let day = doc
        .days
        .get(&key.day)
        .ok_or_else(|| SchedError::NotFound(format!("Day {}", key.day)))?;
    if day.status != DayStatus::Executing {
        return Err(SchedError::Validation(
            "Slots can only be released from the executing day".to_string(),
        ));
    }
    let entry = day
        .entry(key.hour, key.gpu)
        .ok_or_else(|| SchedError::NotFound(format!("Slot {}", key)))?;
    if entry.winner.as_deref() != Some(username) {
        return Err(SchedError::Forbidden("You do not hold this slot".to_string()));
    }

    let start = clock::slot_start(
        now.timezone(),
        &key.day,
        key.hour,
        doc.config.transition_hour,
    )?;
    let next_hour = clock::hour_floor(now) + Duration::hours(1);
    if start < next_hour {
        return Err(SchedError::Validation(
            "Cannot release a slot that has started or starts within the hour".to_string(),
        ));
    }
    Ok(())
}

impl Engine {
    /// Place a single unit-increment bid
    pub async fn place_bid(&self, username: &str, key: SlotKey) -> SchedResult<BidOutcome> {
        let _slot = self.locks.acquire(&key).await;
        let mut doc = self.doc.write().await;

        let plan = validate_bid(&doc, username, &key)?;
        check_funds(&doc, username, plan.delta)?;

        let before = doc.clone();
        let ts = self.clock.now().to_rfc3339();
        execute_bid(&mut doc, username, &plan, &ts)?;
        self.persist_or_rollback(&mut doc, before).await?;

        debug!(user = username, slot = %key, price = plan.required, "Bid placed");
        Ok(BidOutcome {
            price: plan.required,
            previous_winner: plan.previous_winner,
            previous_price: plan.previous_price,
        })
    }

    /// Place a batch of bids atomically: every slot validates before any
    /// mutates, and a single shortfall rejects the whole batch.
    pub async fn place_bulk(
        &self,
        username: &str,
        mut keys: Vec<SlotKey>,
    ) -> SchedResult<BulkBidOutcome> {
        if keys.is_empty() {
            return Err(SchedError::Validation("No bids provided".to_string()));
        }
        keys.sort();
        keys.dedup();

        let _guards = self.locks.acquire_sorted(&keys).await;
        let mut doc = self.doc.write().await;

        let mut plans = Vec::with_capacity(keys.len());
        for key in &keys {
            plans.push(validate_bid(&doc, username, key)?);
        }
        let total_cost: u64 = plans.iter().map(|p| p.delta).sum();
        check_funds(&doc, username, total_cost)?;

        let before = doc.clone();
        let ts = self.clock.now().to_rfc3339();
        for plan in &plans {
            execute_bid(&mut doc, username, plan, &ts)?;
        }
        self.persist_or_rollback(&mut doc, before).await?;

        info!(
            user = username,
            slots = plans.len(),
            cost = total_cost,
            "Bulk bid placed"
        );
        Ok(BulkBidOutcome {
            results: plans
                .iter()
                .map(|p| BulkBidResult {
                    day: p.key.day.clone(),
                    hour: p.key.hour,
                    gpu: p.key.gpu,
                    price: p.required,
                })
                .collect(),
            total_cost,
        })
    }

    /// Rewind the caller's latest bid on a slot.
    ///
    /// Permitted only when the displaced state belonged to the caller or to
    /// nobody; the presented previous state must match the slot exactly, so
    /// a bid that has since been outbid can no longer be undone.
    pub async fn undo_bid(
        &self,
        username: &str,
        key: SlotKey,
        previous_winner: Option<String>,
        previous_price: u32,
    ) -> SchedResult<()> {
        let _slot = self.locks.acquire(&key).await;
        let mut doc = self.doc.write().await;

        {
            let day = doc
                .days
                .get(&key.day)
                .ok_or_else(|| SchedError::NotFound(format!("Day {}", key.day)))?;
            if day.status != DayStatus::Open {
                return Err(SchedError::Validation(format!(
                    "Day {} is not open for bidding",
                    key.day
                )));
            }
            let entry = day
                .entry(key.hour, key.gpu)
                .ok_or_else(|| SchedError::NotFound(format!("Slot {}", key)))?;
            if entry.winner.as_deref() != Some(username) {
                return Err(SchedError::Forbidden("You do not hold this slot".to_string()));
            }
            if let Some(previous) = &previous_winner {
                if previous != username {
                    return Err(SchedError::Forbidden(
                        "Cannot undo a bid that displaced another user".to_string(),
                    ));
                }
            }
            if previous_price.checked_add(1) != Some(entry.price) {
                return Err(SchedError::Conflict(
                    "Slot price has moved since this bid".to_string(),
                ));
            }
            let mut live = entry.bids.iter().rev().filter(|b| !b.undone);
            match live.next() {
                Some(last) if last.user == username && last.price == entry.price => {}
                _ => {
                    return Err(SchedError::Conflict(
                        "Bid history does not match the undo request".to_string(),
                    ))
                }
            }
            // The rewind target must be exactly the presented previous state
            match (&previous_winner, live.next()) {
                (None, None) if previous_price == 0 => {}
                (Some(previous), Some(rewound))
                    if rewound.user == *previous && rewound.price == previous_price => {}
                _ => {
                    return Err(SchedError::Conflict(
                        "Previous slot state does not match the bid history".to_string(),
                    ))
                }
            }
        }

        let before = doc.clone();
        let entry = doc
            .days
            .get_mut(&key.day)
            .and_then(|d| d.entry_mut(key.hour, key.gpu))
            .ok_or_else(|| SchedError::Internal(format!("Slot {} vanished mid-undo", key)))?;
        match previous_winner {
            // Back to unclaimed: the slot holds no allocation and no history
            None => entry.clear(),
            // Rewind to the caller's own earlier bid; keep the undone record
            Some(previous) => {
                entry.winner = Some(previous);
                entry.price = previous_price;
                if let Some(last) = entry.bids.iter_mut().rev().find(|b| !b.undone) {
                    last.undone = true;
                }
            }
        }
        self.persist_or_rollback(&mut doc, before).await?;

        debug!(user = username, slot = %key, "Bid undone");
        Ok(())
    }

    /// Voluntarily surrender a future slot of the executing day for the
    /// fixed refund
    pub async fn release_slot(&self, username: &str, key: SlotKey) -> SchedResult<ReleaseOutcome> {
        let _slot = self.locks.acquire(&key).await;
        let now = self.clock.now();
        let mut doc = self.doc.write().await;

        validate_release(&doc, username, &key, &now)?;

        let before = doc.clone();
        let refund = doc.config.refund;
        if let Some(entry) = doc
            .days
            .get_mut(&key.day)
            .and_then(|d| d.entry_mut(key.hour, key.gpu))
        {
            entry.clear();
        }
        let new_balance = {
            let user = doc
                .users
                .get_mut(username)
                .ok_or(SchedError::Unauthorized)?;
            credits::refund_release(user, refund);
            user.balance
        };
        self.persist_or_rollback(&mut doc, before).await?;

        info!(user = username, slot = %key, %refund, "Slot released");
        Ok(ReleaseOutcome { refund, new_balance })
    }

    /// Release a batch of slots; like bulk bidding, the batch either fully
    /// applies or fully rejects.
    pub async fn release_bulk(
        &self,
        username: &str,
        mut keys: Vec<SlotKey>,
    ) -> SchedResult<BulkReleaseOutcome> {
        if keys.is_empty() {
            return Err(SchedError::Validation("No slots provided".to_string()));
        }
        keys.sort();
        keys.dedup();

        let _guards = self.locks.acquire_sorted(&keys).await;
        let now = self.clock.now();
        let mut doc = self.doc.write().await;

        for key in &keys {
            validate_release(&doc, username, key, &now)?;
        }

        let before = doc.clone();
        let refund = doc.config.refund;
        for key in &keys {
            if let Some(entry) = doc
                .days
                .get_mut(&key.day)
                .and_then(|d| d.entry_mut(key.hour, key.gpu))
            {
                entry.clear();
            }
        }
        let total_refund = refund * Decimal::from(keys.len() as u64);
        let new_balance = {
            let user = doc
                .users
                .get_mut(username)
                .ok_or(SchedError::Unauthorized)?;
            credits::refund_release(user, total_refund);
            user.balance
        };
        self.persist_or_rollback(&mut doc, before).await?;

        info!(
            user = username,
            slots = keys.len(),
            %total_refund,
            "Bulk release"
        );
        Ok(BulkReleaseOutcome {
            released: keys.len(),
            total_refund,
            new_balance,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testutil::{balance_of, test_engine};
    use rust_decimal_macros::dec;

    const OPEN_DAY: &str = "2025-08-03";
    const EXEC_DAY: &str = "2025-08-02";

    fn key(hour: u8, gpu: u32) -> SlotKey {
        SlotKey::new(OPEN_DAY, hour, gpu)
    }

    #[tokio::test]
    async fn test_bid_war_over_one_slot() {
        let (engine, _dir) = test_engine().await;
        let slot = key(14, 3);

        let first = engine.place_bid("alice", slot.clone()).await.unwrap();
        assert_eq!(first.price, 1);
        assert_eq!(first.previous_winner, None);

        let second = engine.place_bid("bob", slot.clone()).await.unwrap();
        assert_eq!(second.price, 2);
        assert_eq!(second.previous_winner.as_deref(), Some("alice"));

        let third = engine.place_bid("alice", slot.clone()).await.unwrap();
        assert_eq!(third.price, 3);

        let doc = engine.doc.read().await;
        let entry = doc.slot(&slot).unwrap();
        assert_eq!(entry.winner.as_deref(), Some("alice"));
        assert_eq!(entry.price, 3);
        assert_eq!(entry.bids.len(), 3);

        // Alice was outbid by bob's bid; the queue records that slot
        assert_eq!(
            notify::queue_for(&doc, "alice", OPEN_DAY),
            vec!["2025-08-03|2025-08-03T14:00|3".to_string()]
        );

        // Committed follows the winner, so availability reflects the war
        assert_eq!(credits::available(&doc, &doc.users["alice"]), dec!(7));
        assert_eq!(credits::available(&doc, &doc.users["bob"]), dec!(10));
    }

    #[tokio::test]
    async fn test_rebidding_own_slot_costs_the_increment() {
        let (engine, _dir) = test_engine().await;
        // Drive one slot up alone: 1, then 2 as own re-bid
        engine.place_bid("alice", key(8, 0)).await.unwrap();
        engine.place_bid("alice", key(8, 0)).await.unwrap();

        let doc = engine.doc.read().await;
        assert_eq!(doc.slot(&key(8, 0)).unwrap().price, 2);
        assert_eq!(credits::committed(&doc, "alice"), 2);
    }

    #[tokio::test]
    async fn test_bid_rejected_when_unaffordable() {
        let (engine, _dir) = test_engine().await;
        {
            let mut doc = engine.doc.write().await;
            doc.users.get_mut("alice").unwrap().balance = dec!(0.5);
        }
        let err = engine.place_bid("alice", key(14, 0)).await.unwrap_err();
        assert!(matches!(err, SchedError::InsufficientCredits { .. }));
    }

    #[tokio::test]
    async fn test_bid_rejected_on_executing_day() {
        let (engine, _dir) = test_engine().await;
        let err = engine
            .place_bid("alice", SlotKey::new(EXEC_DAY, 14, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedError::Validation(_)));
    }

    #[tokio::test]
    async fn test_bid_rejected_on_unknown_slot() {
        let (engine, _dir) = test_engine().await;
        assert!(matches!(
            engine.place_bid("alice", SlotKey::new("2099-01-01", 0, 0)).await,
            Err(SchedError::NotFound(_))
        ));
        assert!(matches!(
            engine.place_bid("alice", SlotKey::new(OPEN_DAY, 0, 99)).await,
            Err(SchedError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_bulk_bid_all_or_nothing() {
        let (engine, _dir) = test_engine().await;
        {
            let mut doc = engine.doc.write().await;
            doc.users.get_mut("alice").unwrap().balance = dec!(5);
        }

        // Eight empty slots cost 8 > 5: the whole batch must reject
        let keys: Vec<SlotKey> = (0..8).map(|gpu| key(10, gpu)).collect();
        let err = engine.place_bulk("alice", keys.clone()).await.unwrap_err();
        assert!(matches!(err, SchedError::InsufficientCredits { .. }));

        let doc = engine.doc.read().await;
        for k in &keys {
            let entry = doc.slot(k).unwrap();
            assert_eq!(entry.price, 0);
            assert!(entry.winner.is_none());
            assert!(entry.bids.is_empty());
        }
    }

    #[tokio::test]
    async fn test_bulk_bid_applies_whole_batch() {
        let (engine, _dir) = test_engine().await;
        let keys: Vec<SlotKey> = (0..8).map(|gpu| key(10, gpu)).collect();

        let outcome = engine.place_bulk("alice", keys.clone()).await.unwrap();
        assert_eq!(outcome.total_cost, 8);
        assert_eq!(outcome.results.len(), 8);

        let doc = engine.doc.read().await;
        for k in &keys {
            assert_eq!(doc.slot(k).unwrap().winner.as_deref(), Some("alice"));
        }
        assert_eq!(credits::committed(&doc, "alice"), 8);
    }

    #[tokio::test]
    async fn test_bulk_bid_rejects_when_any_slot_invalid() {
        let (engine, _dir) = test_engine().await;
        let keys = vec![key(10, 0), SlotKey::new(EXEC_DAY, 10, 1)];
        assert!(engine.place_bulk("alice", keys).await.is_err());

        let doc = engine.doc.read().await;
        assert!(doc.slot(&key(10, 0)).unwrap().winner.is_none());
    }

    #[tokio::test]
    async fn test_bulk_bid_deduplicates() {
        let (engine, _dir) = test_engine().await;
        let keys = vec![key(10, 0), key(10, 0), key(10, 0)];
        let outcome = engine.place_bulk("alice", keys).await.unwrap();
        assert_eq!(outcome.results.len(), 1);
        assert_eq!(outcome.results[0].price, 1);
    }

    #[tokio::test]
    async fn test_undo_restores_unclaimed_slot() {
        let (engine, _dir) = test_engine().await;
        let slot = key(14, 3);
        engine.place_bid("alice", slot.clone()).await.unwrap();
        engine.undo_bid("alice", slot.clone(), None, 0).await.unwrap();

        let doc = engine.doc.read().await;
        let entry = doc.slot(&slot).unwrap();
        assert!(entry.winner.is_none());
        assert_eq!(entry.price, 0);
        assert!(entry.bids.is_empty());
        assert_eq!(credits::committed(&doc, "alice"), 0);
    }

    #[tokio::test]
    async fn test_undo_rewinds_own_earlier_bid() {
        let (engine, _dir) = test_engine().await;
        let slot = key(14, 3);
        engine.place_bid("alice", slot.clone()).await.unwrap();
        engine.place_bid("alice", slot.clone()).await.unwrap();
        engine
            .undo_bid("alice", slot.clone(), Some("alice".to_string()), 1)
            .await
            .unwrap();

        let doc = engine.doc.read().await;
        let entry = doc.slot(&slot).unwrap();
        assert_eq!(entry.winner.as_deref(), Some("alice"));
        assert_eq!(entry.price, 1);
        assert_eq!(entry.bids.len(), 2);
        assert!(entry.bids[1].undone);
        assert_eq!(credits::committed(&doc, "alice"), 1);
    }

    #[tokio::test]
    async fn test_undo_rejects_dispossessing_third_party() {
        let (engine, _dir) = test_engine().await;
        let slot = key(14, 3);
        engine.place_bid("bob", slot.clone()).await.unwrap();
        engine.place_bid("alice", slot.clone()).await.unwrap();

        let err = engine
            .undo_bid("alice", slot.clone(), Some("bob".to_string()), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, SchedError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_undo_rejects_fabricated_previous_state() {
        let (engine, _dir) = test_engine().await;
        let slot = key(14, 3);
        engine.place_bid("alice", slot.clone()).await.unwrap();

        // The slot was unclaimed before this bid; claiming otherwise would
        // leave a winner at price 0
        let err = engine
            .undo_bid("alice", slot.clone(), Some("alice".to_string()), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, SchedError::Conflict(_)));

        let doc = engine.doc.read().await;
        assert_eq!(doc.slot(&slot).unwrap().winner.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_undo_chains_back_to_unclaimed() {
        let (engine, _dir) = test_engine().await;
        let slot = key(14, 3);
        engine.place_bid("alice", slot.clone()).await.unwrap();
        engine.place_bid("alice", slot.clone()).await.unwrap();
        engine
            .undo_bid("alice", slot.clone(), Some("alice".to_string()), 1)
            .await
            .unwrap();
        engine.undo_bid("alice", slot.clone(), None, 0).await.unwrap();

        let doc = engine.doc.read().await;
        let entry = doc.slot(&slot).unwrap();
        assert!(entry.winner.is_none());
        assert_eq!(entry.price, 0);
        assert!(entry.bids.is_empty());
    }

    #[tokio::test]
    async fn test_undo_rejects_stale_request() {
        let (engine, _dir) = test_engine().await;
        let slot = key(14, 3);
        engine.place_bid("alice", slot.clone()).await.unwrap();
        engine.place_bid("bob", slot.clone()).await.unwrap();
        engine.place_bid("alice", slot.clone()).await.unwrap();

        // Alice presents her first bid's state; the price has moved past it
        let err = engine.undo_bid("alice", slot.clone(), None, 0).await.unwrap_err();
        assert!(matches!(err, SchedError::Conflict(_)));
    }

    async fn seed_executing_win(engine: &Engine, hour: u8, gpu: u32, user: &str, price: u32) {
        let mut doc = engine.doc.write().await;
        let entry = doc
            .days
            .get_mut(EXEC_DAY)
            .unwrap()
            .entry_mut(hour, gpu)
            .unwrap();
        entry.winner = Some(user.to_string());
        entry.price = price;
        entry.bids.push(BidRecord {
            user: user.to_string(),
            price,
            ts: "2025-08-01T12:00:00-04:00".to_string(),
            undone: false,
        });
    }

    #[tokio::test]
    async fn test_release_future_slot_refunds_constant() {
        let (engine, _dir) = test_engine().await;
        seed_executing_win(&engine, 14, 3, "alice", 3).await;

        // now = 10:30, slot starts 14:00: releasable
        let outcome = engine
            .release_slot("alice", SlotKey::new(EXEC_DAY, 14, 3))
            .await
            .unwrap();
        assert_eq!(outcome.refund, dec!(0.34));
        assert_eq!(outcome.new_balance, dec!(10.34));

        let doc = engine.doc.read().await;
        let entry = doc.slot(&SlotKey::new(EXEC_DAY, 14, 3)).unwrap();
        assert!(entry.winner.is_none());
        assert_eq!(entry.price, 0);
        assert!(entry.bids.is_empty());
    }

    #[tokio::test]
    async fn test_release_rejects_current_and_past_hours() {
        let (engine, _dir) = test_engine().await;
        // now = 10:30: hour 10 is running, hour 9 is over
        seed_executing_win(&engine, 10, 0, "alice", 1).await;
        seed_executing_win(&engine, 9, 0, "alice", 1).await;

        for hour in [9u8, 10u8] {
            let err = engine
                .release_slot("alice", SlotKey::new(EXEC_DAY, hour, 0))
                .await
                .unwrap_err();
            assert!(matches!(err, SchedError::Validation(_)), "hour {}", hour);
        }
        assert_eq!(balance_of(&engine, "alice").await, dec!(10));
    }

    #[tokio::test]
    async fn test_release_rejects_non_owner() {
        let (engine, _dir) = test_engine().await;
        seed_executing_win(&engine, 14, 3, "alice", 3).await;
        let err = engine
            .release_slot("bob", SlotKey::new(EXEC_DAY, 14, 3))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_bulk_release_all_or_nothing() {
        let (engine, _dir) = test_engine().await;
        seed_executing_win(&engine, 14, 0, "alice", 2).await;
        seed_executing_win(&engine, 15, 0, "alice", 1).await;

        // One bad slot (not owned) poisons the batch
        let err = engine
            .release_bulk(
                "alice",
                vec![
                    SlotKey::new(EXEC_DAY, 14, 0),
                    SlotKey::new(EXEC_DAY, 16, 5),
                ],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SchedError::Forbidden(_)));
        {
            let doc = engine.doc.read().await;
            assert_eq!(
                doc.slot(&SlotKey::new(EXEC_DAY, 14, 0)).unwrap().winner.as_deref(),
                Some("alice")
            );
        }

        let outcome = engine
            .release_bulk(
                "alice",
                vec![
                    SlotKey::new(EXEC_DAY, 14, 0),
                    SlotKey::new(EXEC_DAY, 15, 0),
                ],
            )
            .await
            .unwrap();
        assert_eq!(outcome.released, 2);
        assert_eq!(outcome.total_refund, dec!(0.68));
        assert_eq!(outcome.new_balance, dec!(10.68));
    }

    #[tokio::test]
    async fn test_concurrent_bids_serialize_per_slot() {
        let (engine, _dir) = test_engine().await;
        let engine = std::sync::Arc::new(engine);
        let slot = key(12, 2);

        let mut handles = Vec::new();
        for user in ["alice", "bob", "alice", "bob"] {
            let engine = engine.clone();
            let slot = slot.clone();
            handles.push(tokio::spawn(async move {
                engine.place_bid(user, slot).await
            }));
        }
        let mut ok = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                ok += 1;
            }
        }
        assert_eq!(ok, 4);

        // The bid log is a strict total order: prices 1..=4
        let doc = engine.doc.read().await;
        let entry = doc.slot(&slot).unwrap();
        assert_eq!(entry.price, 4);
        let prices: Vec<u32> = entry.bids.iter().map(|b| b.price).collect();
        assert_eq!(prices, vec![1, 2, 3, 4]);
    }
}
