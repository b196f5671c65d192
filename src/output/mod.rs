pub mod json;
pub mod table;

use anyhow::Result;

use crate::models::{EmailMetadata, UpdateQueueItem};
use crate::sync::SyncStatusView;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
}

impl OutputFormat {
    pub fn from_json_flag(json: bool) -> Self {
        if json {
            Self::Json
        } else {
            Self::Table
        }
    }
}

pub fn format_status(format: OutputFormat, view: &SyncStatusView) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_status(view)),
        OutputFormat::Json => json::format_status(view),
    }
}

pub fn format_emails(format: OutputFormat, emails: &[EmailMetadata]) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_emails(emails)),
        OutputFormat::Json => json::format_emails(emails),
    }
}

pub fn format_queue(format: OutputFormat, items: &[UpdateQueueItem]) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_queue(items)),
        OutputFormat::Json => json::format_queue(items),
    }
}
