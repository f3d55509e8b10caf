//! Usage sampling pipeline
//!
//! An external monitor reports which users are on each GPU. Reports update a
//! transient live snapshot for the current hour and increment per-slot
//! sample counters keyed by server time; the daemon's own timestamp is only
//! checked for clock skew. At day finalization the counters collapse into
//! one `actual_user` per slot.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use gpubid_core::{clock, Document, SampleCounts, SchedResult};

use crate::engine::Engine;

/// Accept reports up to this far out of sync without a warning
pub const MAX_CLOCK_SKEW_SECONDS: i64 = 300;

/// A monitor report: gpu index (as sent, a JSON object key) -> usernames
#[derive(Debug, Clone, Deserialize)]
pub struct UsageReport {
    /// Monitor-side timestamp, used only for skew detection
    #[serde(default)]
    pub timestamp: Option<String>,
    pub usage: BTreeMap<String, Vec<String>>,
}

/// Ingest summary returned to the monitor
#[derive(Debug, Clone, Serialize)]
pub struct UsageIngest {
    pub processed: u64,
    pub day: String,
    pub hour: u8,
    pub server_time: String,
    pub clock_skew_seconds: Option<i64>,
}

/// Public view of the live snapshot
#[derive(Debug, Clone, Serialize)]
pub struct LiveStatusView {
    pub usage: BTreeMap<String, Vec<String>>,
    pub timestamp: Option<String>,
    pub gpu_count: u32,
}

impl Engine {
    /// Process one monitor report.
    ///
    /// Counters are not flushed to disk here; they ride along with the next
    /// durable write.
    pub async fn ingest_usage(&self, report: UsageReport) -> SchedResult<UsageIngest> {
        let now = self.clock.now();

        let skew = report.timestamp.as_deref().and_then(|ts| {
            match DateTime::parse_from_rfc3339(ts) {
                Ok(t) => {
                    Some((now.with_timezone(&Utc) - t.with_timezone(&Utc)).num_seconds().abs())
                }
                Err(e) => {
                    warn!(error = %e, "Ignoring malformed monitor timestamp");
                    None
                }
            }
        });
        if let Some(seconds) = skew {
            if seconds > MAX_CLOCK_SKEW_SECONDS {
                warn!(skew_seconds = seconds, "Monitor clock skew detected");
            }
        }

        let num_gpus = self.doc.read().await.config.num_gpus;

        // Live snapshot is wholesale-replaced by each report
        {
            let mut live = self.live.write().await;
            live.usage.clear();
            for (gpu_raw, users) in &report.usage {
                let Ok(gpu) = gpu_raw.parse::<u32>() else { continue };
                if gpu >= num_gpus {
                    continue;
                }
                live.usage.insert(
                    gpu,
                    users.iter().filter(|u| !u.is_empty()).cloned().collect(),
                );
            }
            live.timestamp = Some(now.to_rfc3339());
        }

        let mut doc = self.doc.write().await;
        let (day_key, hour) = clock::current_slot(&now, doc.config.transition_hour)?;

        let mut processed = 0u64;
        let hour_samples = doc
            .usage_samples
            .entry(day_key.clone())
            .or_default()
            .entry(hour)
            .or_default();
        for (gpu_raw, users) in &report.usage {
            let Ok(gpu) = gpu_raw.parse::<u32>() else { continue };
            if gpu >= num_gpus {
                continue;
            }
            let counts = hour_samples.entry(gpu).or_default();
            for user in users.iter().filter(|u| !u.is_empty()) {
                *counts.entry(user.clone()).or_insert(0) += 1;
                processed += 1;
            }
        }

        debug!(day = %day_key, hour, processed, "Usage samples recorded");
        Ok(UsageIngest {
            processed,
            day: day_key,
            hour,
            server_time: now.to_rfc3339(),
            clock_skew_seconds: skew,
        })
    }

    /// Snapshot of the current hour's observed users
    pub async fn live_status(&self) -> LiveStatusView {
        let gpu_count = self.doc.read().await.config.num_gpus;
        let live = self.live.read().await;
        LiveStatusView {
            usage: live
                .usage
                .iter()
                .map(|(gpu, users)| (gpu.to_string(), users.clone()))
                .collect(),
            timestamp: live.timestamp.clone(),
            gpu_count,
        }
    }
}

/// Freeze `actual_user` for every slot of a day from its sample counters.
///
/// Called once, at the executing -> final transition.
pub(crate) fn finalize_day_usage(doc: &mut Document, day_key: &str) -> usize {
    let samples = doc.usage_samples.get(day_key).cloned().unwrap_or_default();
    let Some(day) = doc.days.get_mut(day_key) else {
        return 0;
    };

    let mut resolved = 0;
    for (hour, entries) in day.slots.iter_mut() {
        for entry in entries.iter_mut() {
            let counts = samples.get(hour).and_then(|gpus| gpus.get(&entry.gpu));
            entry.actual_user = counts.and_then(most_frequent);
            if entry.actual_user.is_some() {
                resolved += 1;
            }
        }
    }
    resolved
}

/// Argmax over sample counts; strict comparison keeps the first-inserted
/// user on ties.
pub(crate) fn most_frequent(counts: &SampleCounts) -> Option<String> {
    most_frequent_excluding(counts, None)
}

/// Argmax over sample counts, optionally skipping one user (the slot owner)
pub(crate) fn most_frequent_excluding(
    counts: &SampleCounts,
    exclude: Option<&str>,
) -> Option<String> {
    let mut best: Option<(&str, u64)> = None;
    for (user, &count) in counts {
        if exclude == Some(user.as_str()) {
            continue;
        }
        if best.map_or(true, |(_, c)| count > c) {
            best = Some((user, count));
        }
    }
    best.map(|(user, _)| user.to_string())
}
