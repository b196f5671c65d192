use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::{merge_known_statuses, StartResponse, SyncError, ALREADY_RUNNING};
use crate::cache::{CacheError, SyncStore};
use crate::config::SyncSettings;
use crate::content::{ContentStore, UpsertMode};
use crate::mailbox::{FetchScope, MailboxFetcher};
use crate::models::{now_ms, EmailMetadata, SyncState};

/// `Idle → Locking → Running → Completing → Idle`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SyncPhase {
    #[default]
    Idle,
    Locking,
    Running,
    Completing,
}

#[derive(Debug, Default)]
struct LocalState {
    state: SyncState,
    phase: SyncPhase,
    /// This instance has run at least one sync since boot.
    owned: bool,
    last_start_time: i64,
}

#[derive(Debug, Clone)]
struct RunContext {
    run_id: String,
    force: bool,
    fetch_all: bool,
}

/// Result of [`SyncOrchestrator::start_sync`]. `task` resolves to the final
/// state of an accepted run.
#[derive(Debug)]
pub struct SyncStart {
    pub accepted: bool,
    pub reason: Option<String>,
    pub state: SyncState,
    pub task: Option<JoinHandle<SyncState>>,
}

impl SyncStart {
    pub fn response(&self) -> StartResponse {
        StartResponse {
            accepted: self.accepted,
            reason: self.reason.clone(),
            state: self.state.clone(),
        }
    }
}

struct Inner {
    store: SyncStore,
    fetcher: MailboxFetcher,
    content: Arc<dyn ContentStore>,
    settings: SyncSettings,
    local: RwLock<LocalState>,
}

/// Owns the in-process [`SyncState`] and mirrors every mutation to the cache.
#[derive(Clone)]
pub struct SyncOrchestrator {
    inner: Arc<Inner>,
}

impl SyncOrchestrator {
    pub fn new(
        store: SyncStore,
        fetcher: MailboxFetcher,
        content: Arc<dyn ContentStore>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                fetcher,
                content,
                settings,
                local: RwLock::new(LocalState::default()),
            }),
        }
    }

    pub fn store(&self) -> &SyncStore {
        &self.inner.store
    }

    pub fn fetcher(&self) -> &MailboxFetcher {
        &self.inner.fetcher
    }

    pub fn content(&self) -> &Arc<dyn ContentStore> {
        &self.inner.content
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.inner.settings
    }

    pub async fn current_state(&self) -> SyncState {
        self.inner.local.read().await.state.clone()
    }

    pub async fn phase(&self) -> SyncPhase {
        self.inner.local.read().await.phase
    }

    /// The in-process state and phase, only if this instance has run a sync
    /// whose state has not been reset yet. Read together so the pair is
    /// consistent.
    pub async fn owned_state(&self) -> Option<(SyncState, SyncPhase)> {
        let local = self.inner.local.read().await;
        (local.owned && !local.state.is_idle()).then(|| (local.state.clone(), local.phase))
    }

    /// Takes the cluster-wide lock and launches the run in the background.
    /// Returns as soon as the lock outcome is known.
    pub async fn start_sync(&self, force: bool, fetch_all: bool) -> Result<SyncStart, CacheError> {
        let entered = self.enter_locking().await;

        let acquired = match self.inner.store.try_acquire().await {
            Ok(acquired) => acquired,
            Err(error) => {
                if entered {
                    self.leave_locking().await;
                }
                return Err(error);
            }
        };

        if !acquired {
            if entered {
                self.leave_locking().await;
            }
            info!("sync request rejected: lock already held");
            return Ok(SyncStart {
                accepted: false,
                reason: Some(ALREADY_RUNNING.to_string()),
                state: self.current_state().await,
                task: None,
            });
        }

        let (run, state) = {
            let mut local = self.inner.local.write().await;
            // Start times stay increasing within an instance; run_id is the identity.
            let start_time = now_ms().max(local.last_start_time + 1);
            local.last_start_time = start_time;
            local.state = SyncState::started(start_time);
            local.phase = SyncPhase::Running;
            local.owned = true;
            self.publish(&local.state).await;
            let run = RunContext {
                run_id: local.state.run_id.clone(),
                force,
                fetch_all,
            };
            (run, local.state.clone())
        };
        self.publish_counters(0, 0).await;

        info!(run_id = %run.run_id, force, fetch_all, "sync started");
        let task = tokio::spawn(self.clone().run_detached(run));

        Ok(SyncStart {
            accepted: true,
            reason: None,
            state,
            task: Some(task),
        })
    }

    /// Drops lock, state and counters from the cache and forgets a finished
    /// local run. A run still in flight keeps its local state.
    pub async fn clear_status(&self) -> Result<(), CacheError> {
        self.inner.store.clear_sync_keys().await?;
        let mut local = self.inner.local.write().await;
        if local.phase == SyncPhase::Idle {
            local.state = SyncState::default();
        }
        warn!("sync status cleared by operator");
        Ok(())
    }

    /// Only an idle instance shows `Locking`; a running one keeps its phase.
    async fn enter_locking(&self) -> bool {
        let mut local = self.inner.local.write().await;
        if local.phase == SyncPhase::Idle {
            local.phase = SyncPhase::Locking;
            true
        } else {
            false
        }
    }

    async fn leave_locking(&self) {
        let mut local = self.inner.local.write().await;
        if local.phase == SyncPhase::Locking {
            local.phase = SyncPhase::Idle;
        }
    }

    async fn publish(&self, state: &SyncState) {
        if let Err(error) = self.inner.store.publish_state(state).await {
            warn!("failed to publish sync state: {error}");
        }
    }

    async fn publish_counters(&self, total: u64, processed: u64) {
        if let Err(error) = self.inner.store.publish_counters(total, processed).await {
            warn!("failed to publish sync counters: {error}");
        }
    }

    /// Applies `update` and writes the result through to the cache while
    /// holding the local lock. Ignored if a newer run has replaced this one.
    async fn update_run_state<F>(&self, run: &RunContext, update: F) -> Option<SyncState>
    where
        F: FnOnce(&mut SyncState),
    {
        let mut local = self.inner.local.write().await;
        if local.state.run_id != run.run_id {
            warn!("dropping state update from superseded run {}", run.run_id);
            return None;
        }
        update(&mut local.state);
        self.publish(&local.state).await;
        Some(local.state.clone())
    }

    /// Runs the body as its own task so that errors and panics both land in
    /// the completion path.
    async fn run_detached(self, run: RunContext) -> SyncState {
        let body = tokio::spawn({
            let this = self.clone();
            let run = run.clone();
            async move { this.run_body(&run).await }
        });

        let failure = match body.await {
            Ok(Ok(())) => None,
            Ok(Err(error)) => Some(error.to_string()),
            Err(join_error) => Some(format!("sync task aborted: {join_error}")),
        };
        if let Some(failure) = &failure {
            error!("sync run failed: {failure}");
        }

        self.complete(&run, failure).await
    }

    async fn run_body(&self, run: &RunContext) -> Result<(), SyncError> {
        self.update_run_state(run, |state| state.status = "Fetching mailbox".to_string())
            .await;

        let scope = FetchScope::new(run.fetch_all, self.inner.settings.recent_limit);
        let outcome = self.inner.fetcher.fetch_mailbox(scope).await;
        if !outcome.is_live() {
            let reason = outcome
                .error
                .unwrap_or_else(|| "mailbox unavailable".to_string());
            self.update_run_state(run, |state| {
                state.error_count += 1;
                state.status = format!("Mailbox unavailable: {reason}");
            })
            .await;
            return Ok(());
        }

        let emails = outcome.emails;
        let total = emails.len() as u64;
        self.update_run_state(run, |state| {
            state.total = total;
            state.status = format!("Fetched {total} messages");
        })
        .await;
        self.publish_counters(total, 0).await;

        let mode = UpsertMode::from_force(run.force);
        let batch_size = self.inner.settings.effective_batch_size();
        let batch_count = emails.len().div_ceil(batch_size);

        for (index, batch) in emails.chunks(batch_size).enumerate() {
            let number = index + 1;
            let size = batch.len() as u64;
            let result = self.inner.content.upsert_batch(batch, mode).await;

            let updated = match result {
                Ok(report) => {
                    debug!(
                        batch = number,
                        inserted = report.inserted,
                        updated = report.updated,
                        unchanged = report.unchanged,
                        "batch upserted"
                    );
                    self.update_run_state(run, |state| {
                        state.progress = (state.progress + size).min(state.total);
                        state.status = format!("Syncing batch {number} of {batch_count}");
                    })
                    .await
                }
                Err(error) => {
                    warn!("batch {number} of {batch_count} failed: {error}");
                    self.update_run_state(run, |state| {
                        state.progress = (state.progress + size).min(state.total);
                        state.error_count += 1;
                        state.status = format!("Batch {number} of {batch_count} failed: {error}");
                    })
                    .await
                }
            };

            let Some(state) = updated else {
                return Ok(());
            };
            self.publish_counters(state.total, state.progress).await;
        }

        self.refresh_email_cache(emails).await?;
        Ok(())
    }

    /// Writes the fetched list to the cache with the statuses people set.
    async fn refresh_email_cache(&self, fetched: Vec<EmailMetadata>) -> Result<(), SyncError> {
        let known = match self.inner.content.query_email_records().await {
            Ok(records) => records,
            Err(error) => {
                warn!("content store unavailable, reusing cached statuses: {error}");
                self.inner
                    .store
                    .read_stale_email_list()
                    .await?
                    .unwrap_or_default()
            }
        };
        let merged = merge_known_statuses(fetched, &known);
        self.inner.store.write_email_list(&merged).await?;
        Ok(())
    }

    async fn complete(&self, run: &RunContext, failure: Option<String>) -> SyncState {
        {
            let mut local = self.inner.local.write().await;
            if local.state.run_id == run.run_id {
                local.phase = SyncPhase::Completing;
            }
        }

        let final_state = self
            .update_run_state(run, |state| {
                if let Some(failure) = &failure {
                    state.error_count += 1;
                    state.status = format!("Sync failed: {failure}");
                } else if state.error_count > 0 {
                    state.status = format!("Sync completed with {} errors", state.error_count);
                } else {
                    state.status = "Sync completed".to_string();
                }
                state.in_progress = false;
                state.completed = true;
                state.end_time = now_ms().max(state.start_time).max(1);
            })
            .await;

        // A superseded run's lock now belongs to its successor.
        if final_state.is_some() {
            if let Err(error) = self.inner.store.release().await {
                error!("failed to release sync lock, it will expire with its TTL: {error}");
            }
        }

        {
            let mut local = self.inner.local.write().await;
            if local.state.run_id == run.run_id {
                local.phase = SyncPhase::Idle;
            }
        }

        let this = self.clone();
        let delay = self.inner.settings.reset_delay();
        let run_id = run.run_id.clone();
        tokio::spawn(async move {
            sleep(delay).await;
            this.reset_if_current(&run_id).await;
        });

        match final_state {
            Some(state) => {
                info!(
                    progress = state.progress,
                    total = state.total,
                    errors = state.error_count,
                    "sync finished"
                );
                state
            }
            None => self.current_state().await,
        }
    }

    /// Clears a completed run, unless a newer run has started meanwhile.
    async fn reset_if_current(&self, run_id: &str) {
        let is_current = |state: &SyncState| state.completed && state.run_id == run_id;

        let mut local = self.inner.local.write().await;
        if is_current(&local.state) {
            local.state = SyncState::default();
            debug!("sync state reset after completion");
        }

        match self.inner.store.read_state().await {
            Ok(Some(cached)) if is_current(&cached) => {
                self.publish(&SyncState::default()).await;
            }
            Ok(_) => {}
            Err(error) => warn!("failed to read sync state for reset: {error}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::{SyncOrchestrator, SyncPhase};
    use crate::cache::{MemoryCache, SyncStore};
    use crate::config::SyncSettings;
    use crate::content::MemoryContentStore;
    use crate::mailbox::{FetchScope, MailMessage, MailboxError, MailboxFetcher, MailboxSource};
    use crate::models::SyncState;

    struct FixedMailbox(usize);

    #[async_trait]
    impl MailboxSource for FixedMailbox {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn fetch(&self, scope: FetchScope) -> Result<Vec<MailMessage>, MailboxError> {
            let count = scope.limit().map_or(self.0, |limit| limit.min(self.0));
            Ok((0..count)
                .map(|uid| MailMessage {
                    uid: uid.to_string(),
                    subject: format!("message {uid}"),
                    ..MailMessage::default()
                })
                .collect())
        }
    }

    fn orchestrator(messages: usize, settings: SyncSettings) -> SyncOrchestrator {
        let cache = Arc::new(MemoryCache::new());
        SyncOrchestrator::new(
            SyncStore::new(cache, &settings),
            MailboxFetcher::new(Arc::new(FixedMailbox(messages))),
            Arc::new(MemoryContentStore::new()),
            settings,
        )
    }

    #[tokio::test]
    async fn recent_scope_limits_the_run() {
        let settings = SyncSettings {
            recent_limit: 5,
            ..SyncSettings::default()
        };
        let orchestrator = orchestrator(20, settings);
        let start = orchestrator.start_sync(false, false).await.expect("start");
        let state = start.task.expect("task").await.expect("join");
        assert_eq!(state.total, 5);
        assert_eq!(state.progress, 5);
        assert!(state.completed);
        assert_eq!(orchestrator.phase().await, SyncPhase::Idle);
    }

    #[tokio::test]
    async fn delayed_reset_clears_completed_state() {
        let settings = SyncSettings {
            reset_delay_secs: 0,
            ..SyncSettings::default()
        };
        let orchestrator = orchestrator(3, settings);
        let start = orchestrator.start_sync(false, true).await.expect("start");
        start.task.expect("task").await.expect("join");

        tokio::time::timeout(Duration::from_secs(5), async {
            while !orchestrator.current_state().await.is_idle() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("state resets");
        let cached = orchestrator.store().read_state().await.expect("read state");
        assert_eq!(cached, Some(SyncState::default()));
    }

    #[tokio::test]
    async fn delayed_reset_spares_a_newer_run() {
        let orchestrator = orchestrator(3, SyncSettings::default());
        let first = orchestrator.start_sync(false, true).await.expect("start");
        let first_state = first.task.expect("task").await.expect("join");

        let second = orchestrator.start_sync(false, true).await.expect("restart");
        assert!(second.accepted);
        second.task.expect("task").await.expect("join");

        assert!(second.state.start_time > first_state.start_time);
        assert_ne!(second.state.run_id, first_state.run_id);

        orchestrator.reset_if_current(&first_state.run_id).await;
        let current = orchestrator.current_state().await;
        assert_eq!(current.run_id, second.state.run_id);
        assert!(current.completed, "newer run must not be reset");
    }

    #[tokio::test]
    async fn owned_state_is_hidden_until_a_run() {
        let orchestrator = orchestrator(1, SyncSettings::default());
        assert!(orchestrator.owned_state().await.is_none());
        let start = orchestrator.start_sync(false, true).await.expect("start");
        start.task.expect("task").await.expect("join");
        assert!(orchestrator.owned_state().await.is_some());
    }
}
