//! Day lifecycle: initialization, advancement, finalization
//!
//! `tick()` runs on every write path and on a 60-second timer. Each
//! transition (open -> executing, executing -> final) is one persisted write,
//! so a crash mid-catch-up resumes cleanly; the per-tick transition cap keeps
//! catch-up after long downtime bounded.

use chrono::DateTime;
use chrono_tz::Tz;
use rust_decimal::Decimal;
use tracing::{info, warn};

use gpubid_core::{clock, credits, Day, DayStatus, Document, SchedError, SchedResult};

use crate::engine::Engine;
use crate::notify;
use crate::usage;

/// Upper bound on day transitions per tick
pub const MAX_TRANSITIONS_PER_TICK: usize = 10;

/// One completed lifecycle step
pub(crate) enum Transition {
    Finalized(String),
    Promoted(String),
}

/// Bootstrap the calendar: make sure something is executing once its start
/// has passed, and keep the open window at full depth.
pub(crate) fn ensure_calendar(doc: &mut Document, now: &DateTime<Tz>) -> SchedResult<bool> {
    let tz = now.timezone();
    let transition_hour = doc.config.transition_hour;
    let mut changed = false;

    if doc.executing_day().is_none() {
        let candidate = doc
            .days
            .iter()
            .filter(|(_, day)| matches!(day.status, DayStatus::Open | DayStatus::Future))
            .map(|(key, _)| key.clone())
            .find(|key| {
                matches!(clock::day_start(tz, key, transition_hour), Ok(start) if start <= *now)
            });
        if let Some(key) = candidate {
            promote_to_executing(doc, &key)?;
            changed = true;
        } else {
            let today = clock::day_key_for(now, transition_hour)?;
            if !doc.days.contains_key(&today) {
                info!(day = %today, "Bootstrapping executing day");
                doc.days.insert(
                    today,
                    Day::new(DayStatus::Executing, doc.config.num_gpus),
                );
                changed = true;
            }
        }
    }

    changed |= ensure_horizon(doc)?;
    Ok(changed)
}

/// Keep `planning_horizon_days` open days ahead of the executing day
pub(crate) fn ensure_horizon(doc: &mut Document) -> SchedResult<bool> {
    let Some(current) = doc.executing_day().map(|(key, _)| key.clone()) else {
        return Ok(false);
    };
    let num_gpus = doc.config.num_gpus;
    let mut changed = false;
    for offset in 1..=doc.config.planning_horizon_days as i64 {
        let key = clock::day_key_offset(&current, offset)?;
        match doc.days.get_mut(&key) {
            None => {
                doc.days.insert(key, Day::new(DayStatus::Open, num_gpus));
                changed = true;
            }
            Some(day) if day.status == DayStatus::Future => {
                day.status = DayStatus::Open;
                changed = true;
            }
            Some(_) => {}
        }
    }
    Ok(changed)
}

/// Open -> executing: debit every winner, void slots that cannot be covered,
/// and drop the day's outbid queues.
pub(crate) fn promote_to_executing(doc: &mut Document, key: &str) -> SchedResult<()> {
    let charges: Vec<(u8, u32, String, u32)> = {
        let day = doc
            .days
            .get(key)
            .ok_or_else(|| SchedError::Internal(format!("Day {} missing at promotion", key)))?;
        day.slots
            .iter()
            .flat_map(|(hour, entries)| {
                entries.iter().filter_map(move |entry| {
                    entry
                        .winner
                        .clone()
                        .map(|winner| (*hour, entry.gpu, winner, entry.price))
                })
            })
            .collect()
    };

    for (hour, gpu, winner, price) in charges {
        let charged = doc
            .users
            .get_mut(&winner)
            .map(|user| credits::charge_on_commit(user, Decimal::from(price)).is_ok())
            .unwrap_or(false);
        if !charged {
            // Impossible under bid validation; recorded and voided if it
            // happens anyway
            warn!(
                day = key,
                hour,
                gpu,
                user = %winner,
                price,
                "Commitment cannot be covered; voiding slot"
            );
            if let Some(entry) = doc.days.get_mut(key).and_then(|d| d.entry_mut(hour, gpu)) {
                entry.clear();
            }
        }
    }

    notify::clear_day(doc, key);
    if let Some(day) = doc.days.get_mut(key) {
        day.status = DayStatus::Executing;
    }
    info!(day = key, "Day is now executing");
    Ok(())
}

/// Executing -> final: freeze actual usage, roll balances over, purge
/// samples beyond the retention window.
pub(crate) fn finalize_day(
    doc: &mut Document,
    key: &str,
    now: &DateTime<Tz>,
) -> SchedResult<()> {
    usage::finalize_day_usage(doc, key);

    let rho = doc.config.rollover;
    for user in doc.users.values_mut() {
        if !user.enabled {
            continue;
        }
        credits::apply_rollover(user, key, rho);
    }

    let day = doc
        .days
        .get_mut(key)
        .ok_or_else(|| SchedError::Internal(format!("Day {} missing at finalization", key)))?;
    day.status = DayStatus::Final;
    if day.finalized_at.is_none() {
        day.finalized_at = Some(now.to_rfc3339());
    }

    // Retention: samples for the finalized day and anything newer
    doc.usage_samples
        .retain(|sample_day, _| sample_day.as_str() >= key);

    info!(day = key, "Day finalized");
    Ok(())
}

/// Perform at most one transition; the caller persists between steps.
pub(crate) fn advance_once(
    doc: &mut Document,
    now: &DateTime<Tz>,
) -> SchedResult<Option<Transition>> {
    let tz = now.timezone();
    let transition_hour = doc.config.transition_hour;

    if let Some(key) = doc.executing_day().map(|(k, _)| k.clone()) {
        let start = clock::day_start(tz, &key, transition_hour)?;
        if *now > clock::day_close(&start) {
            finalize_day(doc, &key, now)?;
            return Ok(Some(Transition::Finalized(key)));
        }
        return Ok(None);
    }

    let candidate = doc
        .days
        .iter()
        .filter(|(_, day)| day.status == DayStatus::Open)
        .map(|(key, _)| key.clone())
        .find(|key| {
            matches!(clock::day_start(tz, key, transition_hour), Ok(start) if start <= *now)
        });
    if let Some(key) = candidate {
        promote_to_executing(doc, &key)?;
        ensure_horizon(doc)?;
        return Ok(Some(Transition::Promoted(key)));
    }
    Ok(None)
}

impl Engine {
    /// Advance the day state machine as far as the clock allows.
    ///
    /// Idempotent within a minute; serialized by the document lock; each
    /// step is separately durable.
    pub async fn tick(&self) -> SchedResult<()> {
        let now = self.clock.now();
        let mut doc = self.doc.write().await;

        let before = doc.clone();
        if ensure_calendar(&mut doc, &now)? {
            self.persist_or_rollback(&mut doc, before).await?;
        }

        let mut transitions = 0;
        while transitions < MAX_TRANSITIONS_PER_TICK {
            let before = doc.clone();
            match advance_once(&mut doc, &now)? {
                None => break,
                Some(transition) => {
                    self.persist_or_rollback(&mut doc, before).await?;
                    if let Transition::Finalized(day) = &transition {
                        self.locks.purge_day(day);
                    }
                    transitions += 1;
                }
            }
        }
        Ok(())
    }
}
