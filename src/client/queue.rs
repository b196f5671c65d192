//! Optimistic status edits that survive reloads and server refreshes.

use serde::Serialize;
use tracing::{debug, warn};

use super::storage::{QueueStorage, StorageError};
use crate::models::{now_ms, EmailMetadata, EmailStatus, EmailUpdates, StatusCounts, UpdateQueueItem};

pub const QUEUE_STORAGE_KEY: &str = "emailUpdateQueue";

/// Ordered list of pending edits, at most one per email. Loaded once,
/// rewritten in full on every mutation.
pub struct PersistedQueue<S: QueueStorage> {
    storage: S,
    items: Vec<UpdateQueueItem>,
}

impl<S: QueueStorage> PersistedQueue<S> {
    /// An unreadable stored queue is discarded rather than blocking startup.
    pub fn load(storage: S) -> Result<Self, StorageError> {
        let items = match storage.load(QUEUE_STORAGE_KEY)? {
            Some(raw) => match serde_json::from_str::<Vec<UpdateQueueItem>>(&raw) {
                Ok(items) => dedupe(items),
                Err(error) => {
                    warn!("discarding unreadable update queue: {error}");
                    Vec::new()
                }
            },
            None => Vec::new(),
        };
        Ok(Self { storage, items })
    }

    pub fn items(&self) -> &[UpdateQueueItem] {
        &self.items
    }

    pub fn get(&self, email_id: &str) -> Option<&UpdateQueueItem> {
        self.items.iter().find(|item| item.email_id == email_id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Merges into the existing entry for the same email, keeping its
    /// position and the values it first replaced.
    pub fn upsert(&mut self, item: UpdateQueueItem) -> Result<(), StorageError> {
        let mut next = self.items.clone();
        match next.iter_mut().find(|existing| existing.email_id == item.email_id) {
            Some(existing) => {
                existing.updates.merge(&item.updates);
                existing.timestamp = item.timestamp;
                if existing.previous_status.is_none() {
                    existing.previous_status = item.previous_status;
                    existing.previous_last_response_by = item.previous_last_response_by;
                }
            }
            None => next.push(item),
        }
        self.replace(next)
    }

    pub fn remove(&mut self, email_id: &str) -> Result<Option<UpdateQueueItem>, StorageError> {
        let Some(position) = self.items.iter().position(|item| item.email_id == email_id) else {
            return Ok(None);
        };
        let mut next = self.items.clone();
        let removed = next.remove(position);
        self.replace(next)?;
        Ok(Some(removed))
    }

    pub fn clear(&mut self) -> Result<(), StorageError> {
        self.storage.remove(QUEUE_STORAGE_KEY)?;
        self.items.clear();
        Ok(())
    }

    /// Persists first; memory only changes once storage accepted the write.
    fn replace(&mut self, items: Vec<UpdateQueueItem>) -> Result<(), StorageError> {
        let payload = serde_json::to_string(&items)?;
        self.storage.save(QUEUE_STORAGE_KEY, &payload)?;
        self.items = items;
        Ok(())
    }
}

fn dedupe(items: Vec<UpdateQueueItem>) -> Vec<UpdateQueueItem> {
    let mut merged: Vec<UpdateQueueItem> = Vec::with_capacity(items.len());
    for item in items {
        match merged.iter_mut().find(|existing| existing.email_id == item.email_id) {
            Some(existing) => {
                existing.updates.merge(&item.updates);
                existing.timestamp = item.timestamp;
            }
            None => merged.push(item),
        }
    }
    merged
}

/// User-visible failure signal, e.g. rendered as a toast.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Notice {
    pub email_id: String,
    pub message: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Confirmed,
    /// A newer edit for the same email is still pending; its own commit decides.
    Superseded,
    RolledBack { restored: Option<EmailStatus> },
    /// Nothing was pending for this email.
    Ignored,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub applied: usize,
    pub dropped: Vec<String>,
}

/// Local email list plus the pending edits layered over it.
pub struct ReconciliationQueue<S: QueueStorage> {
    queue: PersistedQueue<S>,
    emails: Vec<EmailMetadata>,
    counts: StatusCounts,
    notices: Vec<Notice>,
}

impl<S: QueueStorage> ReconciliationQueue<S> {
    pub fn load(storage: S) -> Result<Self, StorageError> {
        Ok(Self {
            queue: PersistedQueue::load(storage)?,
            emails: Vec::new(),
            counts: StatusCounts::default(),
            notices: Vec::new(),
        })
    }

    pub fn emails(&self) -> &[EmailMetadata] {
        &self.emails
    }

    pub fn email(&self, email_id: &str) -> Option<&EmailMetadata> {
        self.emails.iter().find(|email| email.id == email_id)
    }

    pub fn counts(&self) -> StatusCounts {
        self.counts
    }

    pub fn pending(&self) -> &[UpdateQueueItem] {
        self.queue.items()
    }

    pub fn notices(&self) -> &[Notice] {
        &self.notices
    }

    pub fn take_notices(&mut self) -> Vec<Notice> {
        std::mem::take(&mut self.notices)
    }

    pub fn clear_pending(&mut self) -> Result<(), StorageError> {
        self.queue.clear()
    }

    /// Records the edit durably, then shows it locally without waiting for
    /// the server.
    pub fn enqueue(&mut self, email_id: &str, updates: EmailUpdates) -> Result<(), StorageError> {
        let previous = self
            .email(email_id)
            .map(|email| (email.status, email.last_response_by));
        self.queue.upsert(UpdateQueueItem {
            email_id: email_id.to_string(),
            updates: updates.clone(),
            timestamp: now_ms(),
            previous_status: previous.map(|(status, _)| status),
            previous_last_response_by: previous.and_then(|(_, party)| party),
        })?;

        if let Some(email) = self.emails.iter_mut().find(|email| email.id == email_id) {
            email.apply(&updates);
        } else {
            debug!("queued edit for {email_id}, which is not in the local list yet");
        }
        self.recount();
        Ok(())
    }

    /// Settles the server write for `new_status`. A failure rolls the record
    /// back exactly once; there is no retry.
    pub fn commit_or_rollback<E: std::fmt::Display>(
        &mut self,
        email_id: &str,
        new_status: EmailStatus,
        result: Result<(), E>,
    ) -> Result<CommitOutcome, StorageError> {
        let Some(item) = self.queue.get(email_id) else {
            if let Err(error) = result {
                warn!("status write for {email_id} failed with nothing pending: {error}");
            }
            return Ok(CommitOutcome::Ignored);
        };
        if item.updates.status.is_some_and(|queued| queued != new_status) {
            return Ok(CommitOutcome::Superseded);
        }

        match result {
            Ok(()) => {
                self.queue.remove(email_id)?;
                Ok(CommitOutcome::Confirmed)
            }
            Err(error) => {
                let restored = item.previous_status;
                let restored_party = item.previous_last_response_by;
                self.queue.remove(email_id)?;
                if let (Some(status), Some(email)) = (
                    restored,
                    self.emails.iter_mut().find(|email| email.id == email_id),
                ) {
                    email.status = status;
                    email.last_response_by = restored_party;
                }
                self.recount();
                warn!("status write for {email_id} failed, rolled back: {error}");
                self.notices.push(Notice {
                    email_id: email_id.to_string(),
                    message: format!("Could not update email status: {error}"),
                    timestamp: now_ms(),
                });
                Ok(CommitOutcome::RolledBack { restored })
            }
        }
    }

    /// Installs a fresh server list and layers every pending edit back on
    /// top. Edits for emails the server no longer has are dropped.
    pub fn replay_on_snapshot(
        &mut self,
        snapshot: Vec<EmailMetadata>,
    ) -> Result<ReplayReport, StorageError> {
        let mut report = ReplayReport::default();
        let mut kept = Vec::with_capacity(self.queue.len());

        for item in self.queue.items() {
            let Some(server) = snapshot.iter().find(|email| email.id == item.email_id) else {
                warn!(
                    "dropping queued edit for {}: email no longer exists on the server",
                    item.email_id
                );
                report.dropped.push(item.email_id.clone());
                continue;
            };
            let mut item = item.clone();
            // Until the server confirms, its current value is what a rollback restores.
            item.previous_status = Some(server.status);
            item.previous_last_response_by = server.last_response_by;
            kept.push(item);
        }

        if kept.as_slice() != self.queue.items() {
            self.queue.replace(kept)?;
        }

        let mut emails = snapshot;
        for item in self.queue.items() {
            if let Some(email) = emails.iter_mut().find(|email| email.id == item.email_id) {
                email.apply(&item.updates);
                report.applied += 1;
            }
        }
        self.emails = emails;
        self.recount();
        Ok(report)
    }

    fn recount(&mut self) {
        self.counts = StatusCounts::recompute(&self.emails);
    }
}

#[cfg(test)]
mod tests {
    use super::{CommitOutcome, PersistedQueue, ReconciliationQueue, QUEUE_STORAGE_KEY};
    use crate::client::storage::{MemoryStorage, QueueStorage};
    use crate::models::{EmailMetadata, EmailStatus, EmailUpdates, ResponseParty, StatusCounts};

    fn email(id: &str, status: EmailStatus) -> EmailMetadata {
        EmailMetadata {
            id: id.to_string(),
            from: "tenant@example.com".to_string(),
            to: "office@example.com".to_string(),
            subject: format!("subject {id}"),
            received_date: "2026-03-01T09:00:00Z".to_string(),
            preview: String::new(),
            full_content: None,
            status,
            last_response_by: None,
        }
    }

    fn loaded(storage: MemoryStorage, snapshot: Vec<EmailMetadata>) -> ReconciliationQueue<MemoryStorage> {
        let mut queue = ReconciliationQueue::load(storage).expect("load queue");
        queue.replay_on_snapshot(snapshot).expect("install snapshot");
        queue
    }

    #[test]
    fn two_edits_for_one_email_leave_one_merged_entry() {
        let mut queue = loaded(
            MemoryStorage::new(),
            vec![email("42", EmailStatus::NeedsAttention)],
        );
        queue
            .enqueue("42", EmailUpdates::status(EmailStatus::Informative))
            .expect("first edit");
        queue
            .enqueue("42", EmailUpdates::status(EmailStatus::Responded))
            .expect("second edit");

        assert_eq!(queue.pending().len(), 1);
        let item = &queue.pending()[0];
        assert_eq!(item.updates.status, Some(EmailStatus::Responded));
        assert_eq!(item.previous_status, Some(EmailStatus::NeedsAttention));
        assert_eq!(queue.counts().responded, 1);
        assert_eq!(queue.counts().needs_attention, 0);
    }

    #[test]
    fn queue_is_persisted_and_reloaded() {
        let storage = MemoryStorage::new();
        {
            let mut queue = loaded(storage.clone(), vec![email("1", EmailStatus::NeedsAttention)]);
            queue
                .enqueue("1", EmailUpdates::status(EmailStatus::Responded))
                .expect("enqueue");
        }
        let raw = storage
            .load(QUEUE_STORAGE_KEY)
            .expect("load raw")
            .expect("queue persisted");
        assert!(raw.contains("\"emailId\":\"1\""));

        let reloaded = PersistedQueue::load(storage).expect("reload");
        assert_eq!(reloaded.len(), 1);
        assert_eq!(
            reloaded.get("1").and_then(|item| item.updates.status),
            Some(EmailStatus::Responded)
        );
    }

    #[test]
    fn corrupt_persisted_queue_starts_empty() {
        let storage = MemoryStorage::new();
        storage.save(QUEUE_STORAGE_KEY, "[{broken").expect("save garbage");
        let queue = PersistedQueue::load(storage).expect("load");
        assert!(queue.is_empty());
    }

    #[test]
    fn confirmation_only_drops_matching_edit() {
        let mut queue = loaded(MemoryStorage::new(), vec![email("1", EmailStatus::NeedsAttention)]);
        queue
            .enqueue("1", EmailUpdates::status(EmailStatus::Informative))
            .expect("first edit");
        queue
            .enqueue("1", EmailUpdates::status(EmailStatus::Responded))
            .expect("second edit");

        let stale = queue
            .commit_or_rollback::<String>("1", EmailStatus::Informative, Ok(()))
            .expect("commit stale");
        assert_eq!(stale, CommitOutcome::Superseded);
        assert_eq!(queue.pending().len(), 1);

        let current = queue
            .commit_or_rollback::<String>("1", EmailStatus::Responded, Ok(()))
            .expect("commit current");
        assert_eq!(current, CommitOutcome::Confirmed);
        assert!(queue.pending().is_empty());
        assert_eq!(queue.email("1").map(|e| e.status), Some(EmailStatus::Responded));
    }

    #[test]
    fn failure_restores_previous_status_and_keeps_other_entries() {
        let mut queue = loaded(
            MemoryStorage::new(),
            vec![
                email("1", EmailStatus::NeedsAttention),
                email("2", EmailStatus::Informative),
            ],
        );
        queue
            .enqueue("1", EmailUpdates::status(EmailStatus::Responded))
            .expect("edit 1");
        queue
            .enqueue("2", EmailUpdates::status(EmailStatus::Responded))
            .expect("edit 2");

        let outcome = queue
            .commit_or_rollback("1", EmailStatus::Responded, Err("HTTP 500"))
            .expect("rollback");
        assert_eq!(
            outcome,
            CommitOutcome::RolledBack {
                restored: Some(EmailStatus::NeedsAttention)
            }
        );
        assert_eq!(queue.email("1").map(|e| e.status), Some(EmailStatus::NeedsAttention));
        assert_eq!(queue.pending().len(), 1);
        assert_eq!(queue.pending()[0].email_id, "2");
        assert_eq!(queue.notices().len(), 1);
        assert_eq!(queue.counts(), StatusCounts::recompute(queue.emails()));
    }

    #[test]
    fn failure_restores_the_previous_responder_too() {
        let mut answered = email("1", EmailStatus::Informative);
        answered.last_response_by = Some(ResponseParty::Client);
        let mut queue = loaded(
            MemoryStorage::new(),
            vec![answered, email("2", EmailStatus::NeedsAttention)],
        );
        let edit = EmailUpdates {
            status: Some(EmailStatus::Responded),
            last_response_by: Some(Some(ResponseParty::Admin)),
        };
        queue.enqueue("1", edit.clone()).expect("edit 1");
        queue.enqueue("2", edit).expect("edit 2");
        assert_eq!(
            queue.email("1").and_then(|e| e.last_response_by),
            Some(ResponseParty::Admin)
        );

        queue
            .commit_or_rollback("1", EmailStatus::Responded, Err("HTTP 500"))
            .expect("rollback 1");
        queue
            .commit_or_rollback("2", EmailStatus::Responded, Err("HTTP 500"))
            .expect("rollback 2");

        let first = queue.email("1").expect("email 1");
        assert_eq!(first.status, EmailStatus::Informative);
        assert_eq!(first.last_response_by, Some(ResponseParty::Client));
        let second = queue.email("2").expect("email 2");
        assert_eq!(second.status, EmailStatus::NeedsAttention);
        assert_eq!(second.last_response_by, None);
    }

    #[test]
    fn replay_reapplies_pending_and_drops_vanished_ids() {
        let storage = MemoryStorage::new();
        let mut queue = loaded(
            storage,
            vec![
                email("1", EmailStatus::NeedsAttention),
                email("2", EmailStatus::NeedsAttention),
                email("3", EmailStatus::Informative),
            ],
        );
        queue
            .enqueue("1", EmailUpdates::status(EmailStatus::Responded))
            .expect("edit 1");
        queue
            .enqueue("3", EmailUpdates::status(EmailStatus::Responded))
            .expect("edit 3");

        let report = queue
            .replay_on_snapshot(vec![
                email("1", EmailStatus::NeedsAttention),
                email("2", EmailStatus::Informative),
            ])
            .expect("replay");
        assert_eq!(report.applied, 1);
        assert_eq!(report.dropped, vec!["3".to_string()]);
        assert_eq!(queue.email("1").map(|e| e.status), Some(EmailStatus::Responded));
        assert_eq!(queue.counts().responded, 1);
        assert_eq!(queue.counts().informative, 1);
        assert_eq!(queue.counts().needs_attention, 0);
        assert_eq!(queue.pending().len(), 1);
    }

    #[test]
    fn repeated_replays_do_not_drift_counts() {
        let snapshot = vec![
            email("1", EmailStatus::NeedsAttention),
            email("2", EmailStatus::NeedsAttention),
        ];
        let mut queue = loaded(MemoryStorage::new(), snapshot.clone());
        queue
            .enqueue("1", EmailUpdates::status(EmailStatus::Informative))
            .expect("edit");
        for _ in 0..5 {
            queue.replay_on_snapshot(snapshot.clone()).expect("replay");
        }
        assert_eq!(queue.counts().informative, 1);
        assert_eq!(queue.counts().needs_attention, 1);
        assert_eq!(queue.counts().total(), 2);
    }
}
