use chrono::{DateTime, TimeZone, Utc};
use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

use crate::models::{EmailMetadata, EmailStatus, StatusCounts, UpdateQueueItem};
use crate::sync::{StatusSource, SyncStatusView};

const ID_WIDTH: usize = 12;
const FROM_WIDTH: usize = 24;
const SUBJECT_WIDTH: usize = 48;
const DATE_WIDTH: usize = 12;
const STATUS_WIDTH: usize = 14;

pub fn format_status(view: &SyncStatusView) -> String {
    let state = &view.state;
    let phase = if state.in_progress {
        "running"
    } else if state.completed {
        "completed"
    } else {
        "idle"
    };

    let mut out = String::new();
    let source = match view.source {
        StatusSource::Memory => "memory",
        StatusSource::Cache => "cache",
        StatusSource::Counters => "counters",
        StatusSource::Idle => "idle",
    };
    out.push_str(&format!("Sync: {phase} (source: {source})\n"));
    if !state.status.is_empty() {
        out.push_str(&format!("Status: {}\n", state.status));
    }
    if state.total > 0 {
        let percent = state.progress.saturating_mul(100) / state.total;
        out.push_str(&format!(
            "Progress: {} / {} ({percent}%)\n",
            state.progress, state.total
        ));
    }
    out.push_str(&format!("Errors: {}\n", state.error_count));
    if state.start_time > 0 {
        out.push_str(&format!("Started: {}\n", format_epoch_ms(state.start_time)));
    }
    if state.end_time > 0 {
        out.push_str(&format!("Finished: {}\n", format_epoch_ms(state.end_time)));
    }
    if let Some(elapsed) = view.elapsed_time {
        out.push_str(&format!("Elapsed: {}s\n", elapsed / 1000));
    }
    if let Some(processing) = view.processing_time {
        out.push_str(&format!("Took: {}s\n", processing / 1000));
    }
    out
}

pub fn format_emails(emails: &[EmailMetadata]) -> String {
    if emails.is_empty() {
        return "No emails found.".to_string();
    }

    let mut out = String::new();
    out.push_str(&format!(
        "{:<id$}  {:<from$}  {:<subject$}  {:<date$}  {:<status$}\n",
        "ID",
        "From",
        "Subject",
        "Received",
        "Status",
        id = ID_WIDTH,
        from = FROM_WIDTH,
        subject = SUBJECT_WIDTH,
        date = DATE_WIDTH,
        status = STATUS_WIDTH
    ));
    out.push_str(&format!(
        "{}  {}  {}  {}  {}\n",
        "-".repeat(ID_WIDTH),
        "-".repeat(FROM_WIDTH),
        "-".repeat(SUBJECT_WIDTH),
        "-".repeat(DATE_WIDTH),
        "-".repeat(STATUS_WIDTH)
    ));

    for email in emails {
        out.push_str(&format!(
            "{}  {}  {}  {}  {:<status$}\n",
            pad(&truncate_for_width(&email.id, ID_WIDTH), ID_WIDTH),
            pad(&truncate_for_width(&email.from, FROM_WIDTH), FROM_WIDTH),
            pad(&truncate_for_width(&email.subject, SUBJECT_WIDTH), SUBJECT_WIDTH),
            pad(&relative_date(&email.received_date), DATE_WIDTH),
            email.status.as_str(),
            status = STATUS_WIDTH
        ));
    }

    let counts = StatusCounts::recompute(emails);
    out.push('\n');
    for status in EmailStatus::ALL {
        out.push_str(&format!("{}: {}  ", status, counts.get(status)));
    }
    out.push_str(&format!("total: {}\n", counts.total()));
    out
}

pub fn format_queue(items: &[UpdateQueueItem]) -> String {
    if items.is_empty() {
        return "No pending status edits.".to_string();
    }

    let mut out = String::from("Pending status edits\n====================\n");
    for item in items {
        let status = item
            .updates
            .status
            .map(EmailStatus::as_str)
            .unwrap_or("-");
        let previous = item
            .previous_status
            .map(EmailStatus::as_str)
            .unwrap_or("?");
        out.push_str(&format!(
            "{}  {previous} -> {status}  queued {}\n",
            pad(&truncate_for_width(&item.email_id, ID_WIDTH), ID_WIDTH),
            format_epoch_ms(item.timestamp)
        ));
    }
    out
}

fn format_epoch_ms(epoch_ms: i64) -> String {
    match Utc.timestamp_millis_opt(epoch_ms).single() {
        Some(at) => relative_date(&at.to_rfc3339()),
        None => epoch_ms.to_string(),
    }
}

fn relative_date(input: &str) -> String {
    let parsed = match DateTime::parse_from_rfc3339(input) {
        Ok(value) => value.with_timezone(&Utc),
        Err(_) => return input.to_string(),
    };

    let delta = Utc::now().signed_duration_since(parsed);
    if delta.num_seconds() < 0 {
        return "in future".to_string();
    }
    if delta.num_minutes() < 1 {
        return "just now".to_string();
    }
    if delta.num_hours() < 1 {
        return format!("{}m ago", delta.num_minutes());
    }
    if delta.num_hours() < 24 {
        return format!("{}h ago", delta.num_hours());
    }
    if delta.num_days() < 7 {
        return format!("{}d ago", delta.num_days());
    }
    parsed.format("%Y-%m-%d").to_string()
}

/// Left-aligns by display width; `format!` padding counts chars.
fn pad(value: &str, width: usize) -> String {
    let used = UnicodeWidthStr::width(value);
    format!("{value}{}", " ".repeat(width.saturating_sub(used)))
}

fn truncate_for_width(value: &str, max_width: usize) -> String {
    if UnicodeWidthStr::width(value) <= max_width {
        return value.to_string();
    }

    if max_width <= 1 {
        return "…".to_string();
    }

    let mut out = String::new();
    let mut width = 0usize;
    for c in value.chars() {
        let cw = UnicodeWidthChar::width(c).unwrap_or(0);
        if width + cw + 1 > max_width {
            break;
        }
        out.push(c);
        width += cw;
    }
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use unicode_width::UnicodeWidthStr;

    use super::{format_emails, format_queue, format_status, truncate_for_width};
    use crate::models::{EmailMetadata, EmailStatus, EmailUpdates, SyncState, UpdateQueueItem};
    use crate::sync::{StatusSource, SyncStatusView};

    fn sample_email(status: EmailStatus) -> EmailMetadata {
        EmailMetadata {
            id: "4711".to_string(),
            from: "Inquilina Piso 3B <tenant@example.com>".to_string(),
            to: "office@example.com".to_string(),
            subject: "Fuga de agua en el baño, necesitamos un fontanero lo antes posible por favor".to_string(),
            received_date: (Utc::now() - Duration::hours(2)).to_rfc3339(),
            preview: "Hola".to_string(),
            full_content: None,
            status,
            last_response_by: None,
        }
    }

    #[test]
    fn email_table_has_headers_and_counts() {
        let rendered = format_emails(&[
            sample_email(EmailStatus::NeedsAttention),
            sample_email(EmailStatus::Responded),
        ]);
        assert!(rendered.contains("Subject"));
        assert!(rendered.contains("2h ago"));
        assert!(rendered.contains("needsAttention: 1"));
        assert!(rendered.contains("total: 2"));
    }

    #[test]
    fn running_status_shows_progress() {
        let mut state = SyncState::started(Utc::now().timestamp_millis());
        state.total = 250;
        state.progress = 100;
        let rendered = format_status(&SyncStatusView::new(
            state,
            StatusSource::Memory,
            Utc::now().timestamp_millis(),
        ));
        assert!(rendered.starts_with("Sync: running (source: memory)"));
        assert!(rendered.contains("Progress: 100 / 250 (40%)"));
    }

    #[test]
    fn queue_table_lists_transitions() {
        let rendered = format_queue(&[UpdateQueueItem {
            email_id: "42".to_string(),
            updates: EmailUpdates::status(EmailStatus::Responded),
            timestamp: Utc::now().timestamp_millis(),
            previous_status: Some(EmailStatus::NeedsAttention),
            previous_last_response_by: None,
        }]);
        assert!(rendered.contains("needsAttention -> responded"));
    }

    #[test]
    fn truncation_respects_display_width() {
        let truncated = truncate_for_width("ñandú ñandú ñandú", 8);
        assert!(UnicodeWidthStr::width(truncated.as_str()) <= 8);
        assert!(truncated.ends_with('…'));
    }
}
