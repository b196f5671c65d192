//! The headless content store holding the authoritative email records.

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::models::{EmailMetadata, EmailUpdates};

pub mod memory;
pub mod strapi;

pub use self::memory::MemoryContentStore;
pub use self::strapi::StrapiClient;

#[derive(Debug, Error)]
pub enum ContentError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("json serialization: {0}")]
    Json(#[from] serde_json::Error),

    #[error("content store request failed: status={status} body={body}")]
    Status { status: u16, body: String },

    #[error("email record not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Config(String),
}

/// How a sync pass treats records the store already knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertMode {
    /// Create missing records, leave existing ones alone.
    InsertOnly,
    /// Also rewrite the content fields of existing records.
    Refresh,
}

impl UpsertMode {
    pub fn from_force(force: bool) -> Self {
        if force {
            Self::Refresh
        } else {
            Self::InsertOnly
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpsertReport {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
}

impl UpsertReport {
    pub fn record(&mut self, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Inserted => self.inserted += 1,
            UpsertOutcome::Updated => self.updated += 1,
            UpsertOutcome::Unchanged => self.unchanged += 1,
        }
    }
}

#[async_trait]
pub trait ContentStore: Send + Sync {
    fn name(&self) -> &str;

    /// Idempotent upsert keyed by `email.id`. Never touches `status` or
    /// `lastResponseBy` of an existing record.
    async fn upsert_email_record(
        &self,
        email: &EmailMetadata,
        mode: UpsertMode,
    ) -> Result<UpsertOutcome, ContentError>;

    async fn query_email_records(&self) -> Result<Vec<EmailMetadata>, ContentError>;

    async fn update_status(
        &self,
        email_id: &str,
        updates: &EmailUpdates,
    ) -> Result<EmailMetadata, ContentError>;

    /// Stops at the first failing record; the batch counts as failed.
    async fn upsert_batch(
        &self,
        emails: &[EmailMetadata],
        mode: UpsertMode,
    ) -> Result<UpsertReport, ContentError> {
        let mut report = UpsertReport::default();
        for email in emails {
            report.record(self.upsert_email_record(email, mode).await?);
        }
        Ok(report)
    }
}
