//! Credit accounting
//!
//! Prices are integers; balances are exact decimals. A user's commitment is
//! the sum of their winning prices across open days: those credits are spoken
//! for and will be debited when each day starts executing. Executing-day
//! winnings are not committed; they were already debited at the transition.

use rust_decimal::Decimal;

use crate::error::{SchedError, SchedResult};
use crate::model::{DayStatus, Document, User};

/// Total credits the user has standing on winning bids in open days
pub fn committed(doc: &Document, username: &str) -> u64 {
    doc.days
        .values()
        .filter(|day| day.status == DayStatus::Open)
        .flat_map(|day| day.slots.values())
        .flatten()
        .filter(|entry| entry.winner.as_deref() == Some(username))
        .map(|entry| entry.price as u64)
        .sum()
}

/// Balance minus commitment; what the user can still bid with
pub fn available(doc: &Document, user: &User) -> Decimal {
    user.balance - Decimal::from(committed(doc, &user.username))
}

/// Can the user take on `additional` credits of new commitment?
///
/// `additional` is the delta above anything already committed on the same
/// slot; re-bidding your own slot costs only the increment.
pub fn can_afford(doc: &Document, user: &User, additional: u64) -> bool {
    available(doc, user) >= Decimal::from(additional)
}

/// Debit a winner at the open -> executing transition.
///
/// Overdraw is impossible under bid validation; if it happens anyway the
/// caller zeroes the offending slot and records the inconsistency.
pub fn charge_on_commit(user: &mut User, amount: Decimal) -> SchedResult<()> {
    if amount > user.balance {
        return Err(SchedError::InsufficientCredits {
            needed: amount,
            available: user.balance,
        });
    }
    user.balance -= amount;
    Ok(())
}

/// Credit the fixed refund for a voluntary future-slot release
pub fn refund_release(user: &mut User, refund: Decimal) {
    user.balance += refund;
}

/// Roll unspent balance forward and refill to budget at day finalization:
/// `balance = min(budget, balance) * rho + budget`.
///
/// Applied at most once per user per finalized day key; returns whether the
/// balance changed.
pub fn apply_rollover(user: &mut User, day_key: &str, rho: Decimal) -> bool {
    if user.rollover_applied_for_day.as_deref() == Some(day_key) {
        return false;
    }
    let budget = Decimal::from(user.weekly_budget);
    user.balance = budget.min(user.balance) * rho + budget;
    user.rollover_applied_for_day = Some(day_key.to_string());
    true
}
