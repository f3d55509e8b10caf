//! CSV formatting for admin exports

use gpubid_engine::admin::{ScheduleExportRow, UsageExportRow};

/// Schedule export: one line per GPU-hour with its winner and final price
pub fn schedule_csv(rows: &[ScheduleExportRow]) -> String {
    let mut lines =
        vec!["slot_id,gpu_index,start_time_utc,end_time_utc,winner_username,final_price".to_string()];
    for row in rows {
        lines.push(format!(
            "{},{},{},{},{},{}",
            row.slot_id,
            row.gpu,
            row.start_utc,
            row.end_utc,
            row.winner.as_deref().unwrap_or(""),
            row.price
        ));
    }
    lines.join("\n")
}

/// Usage-audit export: assigned vs observed users per GPU-hour
pub fn usage_csv(rows: &[UsageExportRow]) -> String {
    let mut lines = vec![
        "slot_id,gpu_index,start_time_utc,end_time_utc,assigned_user,actual_user,\
         match_status,all_users_detected,sample_counts"
            .to_string(),
    ];
    for row in rows {
        let all_users = row
            .samples
            .iter()
            .map(|(user, count)| format!("{}({})", user, count))
            .collect::<Vec<_>>()
            .join(", ");
        let sample_counts = row
            .samples
            .iter()
            .map(|(user, count)| format!("{}:{}", user, count))
            .collect::<Vec<_>>()
            .join(";");
        lines.push(format!(
            "{},{},{},{},{},{},{},{},{}",
            row.slot_id,
            row.gpu,
            row.start_utc,
            row.end_utc,
            row.assigned_user.as_deref().unwrap_or(""),
            row.actual_user.as_deref().unwrap_or(""),
            row.match_status,
            quote_if_present(&all_users),
            quote_if_present(&sample_counts),
        ));
    }
    lines.join("\n")
}

fn quote_if_present(value: &str) -> String {
    if value.is_empty() {
        String::new()
    } else {
        format!("\"{}\"", value)
    }
}
