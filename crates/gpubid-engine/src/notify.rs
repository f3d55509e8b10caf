//! Outbid notification queues
//!
//! Per (user, day), an ordered set of slot keys the user was displaced from
//! since their last dismissal. Queues are cleared wholesale when a day
//! starts executing, and only open days surface them.

use gpubid_core::{DayStatus, Document, SchedResult, SlotKey};

use crate::engine::Engine;

impl Engine {
    /// Clear the caller's outbid queue for one day
    pub async fn dismiss_outbid(&self, username: &str, day_key: &str) -> SchedResult<usize> {
        let mut doc = self.doc.write().await;
        let before = doc.clone();
        let removed = dismiss(&mut doc, username, day_key);
        if removed > 0 {
            self.persist_or_rollback(&mut doc, before).await?;
        }
        Ok(removed)
    }
}

/// Record that `username` was outbid on `key`
pub(crate) fn enqueue_outbid(doc: &mut Document, username: &str, key: &SlotKey) {
    let queue = doc
        .notifications
        .entry(username.to_string())
        .or_default()
        .entry(key.day.clone())
        .or_default();
    let notification = key.notification_key();
    if !queue.contains(&notification) {
        queue.push(notification);
    }
}

/// Drop every user's queue for a day (open -> executing transition)
pub(crate) fn clear_day(doc: &mut Document, day_key: &str) {
    for queues in doc.notifications.values_mut() {
        queues.remove(day_key);
    }
    doc.notifications.retain(|_, queues| !queues.is_empty());
}

/// Dismiss one user's queue for a day; returns how many entries were dropped
pub(crate) fn dismiss(doc: &mut Document, username: &str, day_key: &str) -> usize {
    let removed = doc
        .notifications
        .get_mut(username)
        .and_then(|queues| queues.remove(day_key))
        .map(|queue| queue.len())
        .unwrap_or(0);
    if let Some(queues) = doc.notifications.get(username) {
        if queues.is_empty() {
            doc.notifications.remove(username);
        }
    }
    removed
}

/// Whether the user has pending notifications on an open day
pub(crate) fn has_notifications(doc: &Document, username: &str, day_key: &str) -> bool {
    let day_open = doc
        .days
        .get(day_key)
        .map(|d| d.status == DayStatus::Open)
        .unwrap_or(false);
    day_open
        && doc
            .notifications
            .get(username)
            .and_then(|queues| queues.get(day_key))
            .map(|queue| !queue.is_empty())
            .unwrap_or(false)
}

/// The user's queue for a day, in outbid order
pub(crate) fn queue_for(doc: &Document, username: &str, day_key: &str) -> Vec<String> {
    doc.notifications
        .get(username)
        .and_then(|queues| queues.get(day_key))
        .cloned()
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpubid_core::{Day, ScheduleConfig};

    fn doc() -> Document {
        let mut doc = Document::new(ScheduleConfig::default());
        doc.days
            .insert("2025-08-03".to_string(), Day::new(DayStatus::Open, 8));
        doc
    }

    #[test]
    fn test_enqueue_dedupes_and_orders() {
        let mut doc = doc();
        enqueue_outbid(&mut doc, "alice", &SlotKey::new("2025-08-03", 14, 3));
        enqueue_outbid(&mut doc, "alice", &SlotKey::new("2025-08-03", 9, 0));
        enqueue_outbid(&mut doc, "alice", &SlotKey::new("2025-08-03", 14, 3));

        let queue = queue_for(&doc, "alice", "2025-08-03");
        assert_eq!(
            queue,
            vec![
                "2025-08-03|2025-08-03T14:00|3".to_string(),
                "2025-08-03|2025-08-03T09:00|0".to_string(),
            ]
        );
        assert!(has_notifications(&doc, "alice", "2025-08-03"));
    }

    #[test]
    fn test_dismiss_clears_one_day() {
        let mut doc = doc();
        doc.days
            .insert("2025-08-04".to_string(), Day::new(DayStatus::Open, 8));
        enqueue_outbid(&mut doc, "alice", &SlotKey::new("2025-08-03", 14, 3));
        enqueue_outbid(&mut doc, "alice", &SlotKey::new("2025-08-04", 8, 1));

        assert_eq!(dismiss(&mut doc, "alice", "2025-08-03"), 1);
        assert!(!has_notifications(&doc, "alice", "2025-08-03"));
        assert!(has_notifications(&doc, "alice", "2025-08-04"));
        assert_eq!(dismiss(&mut doc, "alice", "2025-08-03"), 0);
    }

    #[test]
    fn test_non_open_day_surfaces_nothing() {
        let mut doc = doc();
        enqueue_outbid(&mut doc, "alice", &SlotKey::new("2025-08-03", 14, 3));
        doc.days.get_mut("2025-08-03").unwrap().status = DayStatus::Executing;
        assert!(!has_notifications(&doc, "alice", "2025-08-03"));
    }
}
