use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use mailsync::api::{router, AppState};
use mailsync::cache::{MemoryCache, SyncStore};
use mailsync::client::{
    ClientError, CommitOutcome, EmailApiClient, EmailBackend, EmailSession, PersistedQueue,
    PollEnd, ReconciliationQueue, SqliteStorage, StatusFeed, StatusPoller,
};
use mailsync::config::SyncSettings;
use mailsync::content::MemoryContentStore;
use mailsync::mailbox::{FetchScope, MailMessage, MailboxError, MailboxFetcher, MailboxSource};
use mailsync::models::{EmailMetadata, EmailStatus, EmailUpdates, ResponseParty, StatusCounts};
use mailsync::sync::{SyncOrchestrator, SyncPhase};

fn temp_db_path() -> PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!("mailsync-client-it-{}.db", Uuid::new_v4()));
    path
}

fn email(id: &str, status: EmailStatus) -> EmailMetadata {
    EmailMetadata {
        id: id.to_string(),
        from: "tenant@example.com".to_string(),
        to: "office@example.com".to_string(),
        subject: format!("subject {id}"),
        received_date: "2026-03-01T09:00:00+00:00".to_string(),
        preview: String::new(),
        full_content: None,
        status,
        last_response_by: None,
    }
}

fn literal_counts(emails: &[EmailMetadata]) -> (usize, usize, usize) {
    let count = |status| emails.iter().filter(|email| email.status == status).count();
    (
        count(EmailStatus::NeedsAttention),
        count(EmailStatus::Informative),
        count(EmailStatus::Responded),
    )
}

#[test]
fn two_edits_before_commit_merge_into_one_durable_entry() {
    let path = temp_db_path();
    {
        let storage = SqliteStorage::open(&path).expect("open storage");
        let mut queue = ReconciliationQueue::load(storage).expect("load queue");
        queue
            .replay_on_snapshot(vec![email("7", EmailStatus::NeedsAttention)])
            .expect("snapshot");
        queue
            .enqueue("7", EmailUpdates::status(EmailStatus::Informative))
            .expect("first edit");
        queue
            .enqueue(
                "7",
                EmailUpdates {
                    status: None,
                    last_response_by: Some(Some(ResponseParty::Client)),
                },
            )
            .expect("second edit");
    }

    let reloaded = PersistedQueue::load(SqliteStorage::open(&path).expect("reopen")).expect("reload");
    assert_eq!(reloaded.len(), 1);
    let item = reloaded.get("7").expect("entry for 7");
    assert_eq!(item.updates.status, Some(EmailStatus::Informative));
    assert_eq!(item.updates.last_response_by, Some(Some(ResponseParty::Client)));
    let _ = std::fs::remove_file(path);
}

#[test]
fn pending_edits_survive_reload_and_replay_over_fresh_snapshot() {
    let path = temp_db_path();
    {
        let mut queue =
            ReconciliationQueue::load(SqliteStorage::open(&path).expect("open")).expect("load");
        queue
            .replay_on_snapshot(vec![
                email("1", EmailStatus::NeedsAttention),
                email("2", EmailStatus::NeedsAttention),
                email("3", EmailStatus::Informative),
            ])
            .expect("snapshot");
        queue
            .enqueue("1", EmailUpdates::status(EmailStatus::Responded))
            .expect("edit 1");
        queue
            .enqueue("3", EmailUpdates::status(EmailStatus::NeedsAttention))
            .expect("edit 3");
    }

    let mut queue =
        ReconciliationQueue::load(SqliteStorage::open(&path).expect("reopen")).expect("reload");
    assert_eq!(queue.pending().len(), 2);

    let report = queue
        .replay_on_snapshot(vec![
            email("1", EmailStatus::NeedsAttention),
            email("2", EmailStatus::Responded),
            email("3", EmailStatus::Informative),
            email("4", EmailStatus::Informative),
        ])
        .expect("replay");
    assert_eq!(report.applied, 2);
    assert!(report.dropped.is_empty());

    assert_eq!(queue.email("1").map(|e| e.status), Some(EmailStatus::Responded));
    assert_eq!(queue.email("3").map(|e| e.status), Some(EmailStatus::NeedsAttention));

    let counts = queue.counts();
    let (needs, informative, responded) = literal_counts(queue.emails());
    assert_eq!(counts.needs_attention, needs);
    assert_eq!(counts.informative, informative);
    assert_eq!(counts.responded, responded);
    assert_eq!(counts, StatusCounts::recompute(queue.emails()));
    let _ = std::fs::remove_file(path);
}

/// Serves a fixed list and answers every status write with HTTP 500.
struct FailingWrites(Vec<EmailMetadata>);

#[async_trait]
impl EmailBackend for FailingWrites {
    async fn fetch_list(&self) -> Result<Option<Vec<EmailMetadata>>, ClientError> {
        Ok(Some(self.0.clone()))
    }

    async fn write_status(
        &self,
        _email_id: &str,
        _status: EmailStatus,
        _last_response_by: Option<ResponseParty>,
    ) -> Result<(), ClientError> {
        Err(ClientError::Status {
            status: 500,
            body: "internal error".to_string(),
        })
    }
}

#[tokio::test]
async fn failed_write_rolls_back_once_and_leaves_other_entries() {
    let path = temp_db_path();
    let backend = Arc::new(FailingWrites(vec![
        email("42", EmailStatus::NeedsAttention),
        email("43", EmailStatus::NeedsAttention),
    ]));

    {
        let mut earlier =
            EmailSession::open(backend.clone(), SqliteStorage::open(&path).expect("open"))
                .expect("session");
        earlier.refresh().await.expect("refresh").expect("snapshot");
        // Left pending, as if the process stopped before the write settled.
        let mut queue =
            ReconciliationQueue::load(SqliteStorage::open(&path).expect("open queue")).expect("load");
        queue
            .replay_on_snapshot(earlier.emails().to_vec())
            .expect("snapshot");
        queue
            .enqueue("43", EmailUpdates::status(EmailStatus::Informative))
            .expect("pending edit");
    }

    let mut session = EmailSession::open(backend, SqliteStorage::open(&path).expect("reopen"))
        .expect("session");
    assert_eq!(session.queue().pending().len(), 1);
    session.refresh().await.expect("refresh").expect("snapshot");
    assert_eq!(session.counts().needs_attention, 1);
    assert_eq!(session.counts().informative, 1);

    let outcome = session
        .set_status("42", EmailStatus::Responded, None)
        .await
        .expect("set status");
    assert_eq!(
        outcome,
        CommitOutcome::RolledBack {
            restored: Some(EmailStatus::NeedsAttention)
        }
    );
    assert_eq!(
        session.queue().email("42").map(|email| email.status),
        Some(EmailStatus::NeedsAttention)
    );
    assert_eq!(session.counts().responded, 0);

    let notices = session.take_notices();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].email_id, "42");
    assert!(notices[0].message.starts_with("Could not update email status"));
    assert!(session.take_notices().is_empty());

    let reloaded = PersistedQueue::load(SqliteStorage::open(&path).expect("reopen")).expect("reload");
    assert_eq!(reloaded.len(), 1);
    assert!(reloaded.get("43").is_some());
    let _ = std::fs::remove_file(path);
}

struct FixedMailbox(Vec<(String, String)>);

#[async_trait]
impl MailboxSource for FixedMailbox {
    fn name(&self) -> &str {
        "fixed"
    }

    async fn fetch(&self, _scope: FetchScope) -> Result<Vec<MailMessage>, MailboxError> {
        Ok(self
            .0
            .iter()
            .map(|(uid, subject)| MailMessage {
                uid: uid.clone(),
                from: "tenant@example.com".to_string(),
                to: "office@example.com".to_string(),
                subject: subject.clone(),
                date: "2026-03-02T09:00:00Z".to_string(),
                body_text: Some("hello".to_string()),
                body_html: None,
            })
            .collect())
    }
}

async fn spawn_server() -> (String, SyncOrchestrator) {
    let settings = SyncSettings::default();
    let records = vec![
        email("41", EmailStatus::NeedsAttention),
        email("42", EmailStatus::NeedsAttention),
    ];
    let orchestrator = SyncOrchestrator::new(
        SyncStore::new(Arc::new(MemoryCache::new()), &settings),
        MailboxFetcher::new(Arc::new(FixedMailbox(vec![
            ("41".to_string(), "Boiler".to_string()),
            ("42".to_string(), "Leaking tap".to_string()),
        ]))),
        Arc::new(MemoryContentStore::with_records(records)),
        settings,
    );
    let app = router(AppState::new(
        orchestrator.clone(),
        None,
        Duration::from_secs(5),
    ));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test server");
    let address = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{address}"), orchestrator)
}

#[tokio::test]
async fn session_round_trip_against_running_server() {
    let (base_url, _orchestrator) = spawn_server().await;
    let path = temp_db_path();
    let client = Arc::new(
        EmailApiClient::new(&base_url)
            .expect("client")
            .with_min_fetch_interval(Duration::ZERO),
    );
    let mut session = EmailSession::open(client.clone(), SqliteStorage::open(&path).expect("open"))
        .expect("session");

    session.refresh().await.expect("refresh").expect("not throttled");
    assert_eq!(session.emails().len(), 2);
    assert_eq!(session.counts().needs_attention, 2);

    let outcome = session
        .set_status("42", EmailStatus::Responded, Some(ResponseParty::Admin))
        .await
        .expect("set status");
    assert_eq!(outcome, CommitOutcome::Confirmed);
    assert!(session.queue().pending().is_empty());

    // The server's cached list already carries the edit.
    session.refresh().await.expect("refresh").expect("not throttled");
    let updated = session
        .emails()
        .iter()
        .find(|email| email.id == "42")
        .expect("email 42");
    assert_eq!(updated.status, EmailStatus::Responded);
    assert_eq!(updated.last_response_by, Some(ResponseParty::Admin));
    assert_eq!(session.counts().responded, 1);
    let _ = std::fs::remove_file(path);
}

#[tokio::test]
async fn poller_follows_a_sync_started_over_http() {
    let (base_url, orchestrator) = spawn_server().await;
    let client = Arc::new(EmailApiClient::new(&base_url).expect("client"));

    let response = client.start_sync(false, true).await.expect("start sync");
    assert!(response.accepted);
    let again = client.start_sync(false, true).await.expect("second start");
    if !again.accepted {
        assert_eq!(again.reason.as_deref(), Some("already running"));
    }

    let feed: Arc<dyn StatusFeed> = client.clone();
    let poller = StatusPoller::spawn(feed, Duration::from_millis(20));
    let end = tokio::time::timeout(Duration::from_secs(10), poller.join())
        .await
        .expect("poller settles");
    match end {
        PollEnd::Settled(view) => {
            assert!(view.state.completed);
            assert_eq!(view.state.progress, 2);
            assert_eq!(view.state.total, 2);
        }
        PollEnd::Stopped => panic!("poller should settle on its own"),
    }

    let local = client.local_sync_state().await.expect("local state");
    assert!(local.completed);

    tokio::time::timeout(Duration::from_secs(5), async {
        while orchestrator.phase().await != SyncPhase::Idle {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("run winds down");
    client.clear_sync_status().await.expect("clear status");
    let view = client.sync_status().await.expect("status after clear");
    assert!(view.state.is_idle());
    assert!(view.is_settled());
}
