use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{ContentError, ContentStore, UpsertMode, UpsertOutcome};
use crate::models::{EmailMetadata, EmailUpdates};

/// Process-local record store, used when no remote content store is configured.
#[derive(Debug, Default)]
pub struct MemoryContentStore {
    records: Mutex<Vec<EmailMetadata>>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<EmailMetadata>) -> Self {
        Self {
            records: Mutex::new(records),
        }
    }
}

fn copy_content_fields(target: &mut EmailMetadata, source: &EmailMetadata) -> bool {
    let before = target.clone();
    target.from.clone_from(&source.from);
    target.to.clone_from(&source.to);
    target.subject.clone_from(&source.subject);
    target.received_date.clone_from(&source.received_date);
    target.preview.clone_from(&source.preview);
    target.full_content.clone_from(&source.full_content);
    *target != before
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn upsert_email_record(
        &self,
        email: &EmailMetadata,
        mode: UpsertMode,
    ) -> Result<UpsertOutcome, ContentError> {
        let mut records = self.records.lock().await;
        match records.iter_mut().find(|record| record.id == email.id) {
            Some(existing) => match mode {
                UpsertMode::InsertOnly => Ok(UpsertOutcome::Unchanged),
                UpsertMode::Refresh => {
                    if copy_content_fields(existing, email) {
                        Ok(UpsertOutcome::Updated)
                    } else {
                        Ok(UpsertOutcome::Unchanged)
                    }
                }
            },
            None => {
                records.push(email.clone());
                Ok(UpsertOutcome::Inserted)
            }
        }
    }

    async fn query_email_records(&self) -> Result<Vec<EmailMetadata>, ContentError> {
        Ok(self.records.lock().await.clone())
    }

    async fn update_status(
        &self,
        email_id: &str,
        updates: &EmailUpdates,
    ) -> Result<EmailMetadata, ContentError> {
        let mut records = self.records.lock().await;
        let record = records
            .iter_mut()
            .find(|record| record.id == email_id)
            .ok_or_else(|| ContentError::NotFound(email_id.to_string()))?;
        record.apply(updates);
        Ok(record.clone())
    }
}
