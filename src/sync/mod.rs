//! Single-flight mailbox synchronization and its read side.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::CacheError;
use crate::content::ContentError;
use crate::models::{EmailMetadata, SyncState};

pub mod orchestrator;
pub mod status;

pub use self::orchestrator::{SyncOrchestrator, SyncPhase, SyncStart};
pub use self::status::{StatusSource, SyncStatusService, SyncStatusView};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Content(#[from] ContentError),
}

pub const ALREADY_RUNNING: &str = "already running";

/// Outcome of a start request as reported to callers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StartResponse {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub state: SyncState,
}

/// Carries human-set fields from `known` records onto freshly fetched ones.
/// Order and membership follow `fetched`.
pub fn merge_known_statuses(
    fetched: Vec<EmailMetadata>,
    known: &[EmailMetadata],
) -> Vec<EmailMetadata> {
    let known: HashMap<&str, &EmailMetadata> =
        known.iter().map(|email| (email.id.as_str(), email)).collect();
    fetched
        .into_iter()
        .map(|mut email| {
            if let Some(existing) = known.get(email.id.as_str()) {
                email.status = existing.status;
                email.last_response_by = existing.last_response_by;
            }
            email
        })
        .collect()
}
