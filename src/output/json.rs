use anyhow::Result;

use crate::models::{EmailMetadata, StatusCounts, UpdateQueueItem};
use crate::sync::SyncStatusView;

pub fn format_status(view: &SyncStatusView) -> Result<String> {
    Ok(serde_json::to_string_pretty(view)?)
}

pub fn format_emails(emails: &[EmailMetadata]) -> Result<String> {
    Ok(serde_json::to_string_pretty(&serde_json::json!({
        "emails": emails,
        "stats": StatusCounts::recompute(emails),
    }))?)
}

pub fn format_queue(items: &[UpdateQueueItem]) -> Result<String> {
    Ok(serde_json::to_string_pretty(items)?)
}
