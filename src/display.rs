//! Plain-text rendering of a derived rally view.

use chrono::{DateTime, Utc};

use crate::rally::{CountdownRow, Phase, RallyView};

/// `mm:ss`, rounded to whole seconds, negative durations shown as `00:00`.
pub fn format_ms(ms: i64) -> String {
    let total_sec = ((ms as f64 / 1000.0).round() as i64).max(0);
    format!("{:02}:{:02}", total_sec / 60, total_sec % 60)
}

/// `HH:MM:SS UTC` for a Unix timestamp in milliseconds.
pub fn format_time_of_day(ts: i64) -> String {
    match DateTime::<Utc>::from_timestamp_millis(ts) {
        Some(dt) => dt.format("%H:%M:%S UTC").to_string(),
        None => "--:--:-- UTC".to_string(),
    }
}

/// Countdown column text for one row.
pub fn countdown_text(row: &CountdownRow, phase: Phase) -> String {
    if phase == Phase::Join {
        let mut text = if row.diff_to_rally_start_ms > 0 {
            format!("in {}", format_ms(row.diff_to_rally_start_ms))
        } else {
            format!("running {}", format_ms(row.diff_to_rally_start_ms.saturating_neg()))
        };
        if row.before_march() {
            text.push_str(" (before March)");
        }
        text
    } else if row.diff_ms > 0 {
        format_ms(row.diff_ms)
    } else {
        format!("since {}", format_ms(row.diff_ms.saturating_neg()))
    }
}

pub fn render_view(view: &RallyView, now: i64) -> Vec<String> {
    let mut lines = vec![format!(
        "Starter {} | Rally-Start {} | March-Start {} | Hit {}",
        view.starter.name,
        format_time_of_day(view.rally_start_at),
        format_time_of_day(view.launch_at),
        format_time_of_day(view.arrival_at)
    )];

    lines.push(match view.phase {
        Phase::Join => format!("[JOIN] March starts in {}", format_ms(view.join_remaining_ms)),
        Phase::March => format!("[MARCH] March started at {}", format_time_of_day(view.launch_at)),
        Phase::Landed => format!(
            "[LANDED] All marches landed at {}",
            format_time_of_day(view.arrival_at)
        ),
    });

    if view.phase == Phase::Landed {
        return lines;
    }
    if view.rows.is_empty() {
        lines.push("No active marches left.".to_string());
        return lines;
    }

    for row in &view.rows {
        lines.push(format!(
            "  {:<16} {}  {:<26} land in {}  {}",
            row.name,
            format_time_of_day(row.rally_start_at),
            countdown_text(row, view.phase),
            format_ms(row.land_in_ms),
            row.status(view.phase).badge()
        ));
    }
    lines.push(format!("now (UTC): {}", format_time_of_day(now)));
    lines
}
