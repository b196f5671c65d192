//! Client-side half: durable optimistic edits reconciled against server lists.

use std::sync::Arc;

use tracing::{debug, info};

use crate::models::{EmailMetadata, EmailStatus, EmailUpdates, ResponseParty, StatusCounts};

pub mod api;
mod migrations;
pub mod poller;
pub mod queue;
pub mod storage;

pub use self::api::{ClientError, EmailApiClient, EmailBackend, StatusFeed};
pub use self::poller::{PollEnd, StatusPoller};
pub use self::queue::{CommitOutcome, Notice, PersistedQueue, ReconciliationQueue, ReplayReport};
pub use self::storage::{MemoryStorage, QueueStorage, SqliteStorage, StorageError};

/// One client's view of the inbox: the last server list with pending edits
/// layered on top.
pub struct EmailSession<S: QueueStorage> {
    backend: Arc<dyn EmailBackend>,
    queue: ReconciliationQueue<S>,
}

impl<S: QueueStorage> EmailSession<S> {
    /// Loads the pending edits persisted by an earlier session.
    pub fn open(backend: Arc<dyn EmailBackend>, storage: S) -> Result<Self, ClientError> {
        let queue = ReconciliationQueue::load(storage)?;
        if !queue.pending().is_empty() {
            info!("restored {} pending status edits", queue.pending().len());
        }
        Ok(Self { backend, queue })
    }

    pub fn emails(&self) -> &[EmailMetadata] {
        self.queue.emails()
    }

    pub fn counts(&self) -> StatusCounts {
        self.queue.counts()
    }

    pub fn queue(&self) -> &ReconciliationQueue<S> {
        &self.queue
    }

    pub fn take_notices(&mut self) -> Vec<Notice> {
        self.queue.take_notices()
    }

    /// Pulls the server list and replays pending edits over it. Returns
    /// `None` when the fetch was throttled.
    pub async fn refresh(&mut self) -> Result<Option<ReplayReport>, ClientError> {
        let Some(snapshot) = self.backend.fetch_list().await? else {
            debug!("refresh skipped");
            return Ok(None);
        };
        Ok(Some(self.queue.replay_on_snapshot(snapshot)?))
    }

    /// Shows the edit immediately, then asks the server to keep it. A failed
    /// write rolls the record back once.
    pub async fn set_status(
        &mut self,
        email_id: &str,
        status: EmailStatus,
        last_response_by: Option<ResponseParty>,
    ) -> Result<CommitOutcome, ClientError> {
        let updates = EmailUpdates {
            status: Some(status),
            last_response_by: last_response_by.map(Some),
        };
        self.queue.enqueue(email_id, updates)?;

        let result = self
            .backend
            .write_status(email_id, status, last_response_by)
            .await;
        Ok(self.queue.commit_or_rollback(email_id, status, result)?)
    }
}
