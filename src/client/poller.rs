use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use super::api::StatusFeed;
use crate::sync::SyncStatusView;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollEnd {
    /// The run completed or nothing is running.
    Settled(SyncStatusView),
    Stopped,
}

/// Polls the status endpoint until the sync settles or [`StatusPoller::stop`]
/// is called. Dropping the poller also stops it.
pub struct StatusPoller {
    stop: watch::Sender<bool>,
    latest: watch::Receiver<Option<SyncStatusView>>,
    task: JoinHandle<PollEnd>,
}

impl StatusPoller {
    pub fn spawn(feed: Arc<dyn StatusFeed>, interval: Duration) -> Self {
        let (stop, stop_rx) = watch::channel(false);
        let (latest_tx, latest) = watch::channel(None);
        let task = tokio::spawn(poll_loop(feed, interval, stop_rx, latest_tx));
        Self { stop, latest, task }
    }

    /// Most recent successful observation.
    pub fn latest(&self) -> Option<SyncStatusView> {
        self.latest.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<SyncStatusView>> {
        self.latest.clone()
    }

    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }

    pub async fn join(self) -> PollEnd {
        let Self { stop, task, .. } = self;
        let end = task.await.unwrap_or(PollEnd::Stopped);
        drop(stop);
        end
    }
}

async fn poll_loop(
    feed: Arc<dyn StatusFeed>,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
    latest: watch::Sender<Option<SyncStatusView>>,
) -> PollEnd {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    debug!("status poller stopped");
                    return PollEnd::Stopped;
                }
            }
            _ = ticker.tick() => {
                match feed.sync_status().await {
                    Ok(view) => {
                        let settled = view.is_settled();
                        latest.send_replace(Some(view.clone()));
                        if settled {
                            debug!("status poller finished: sync settled");
                            return PollEnd::Settled(view);
                        }
                    }
                    Err(error) => warn!("sync status poll failed: {error}"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::{PollEnd, StatusPoller};
    use crate::client::api::{ClientError, StatusFeed};
    use crate::models::SyncState;
    use crate::sync::{StatusSource, SyncStatusView};

    /// Reports a running sync for `running_polls` calls, then a completed one.
    struct ScriptedFeed {
        calls: AtomicUsize,
        running_polls: usize,
    }

    #[async_trait]
    impl StatusFeed for ScriptedFeed {
        async fn sync_status(&self) -> Result<SyncStatusView, ClientError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let mut state = SyncState::started(1_000);
            state.total = 10;
            if call >= self.running_polls {
                state.in_progress = false;
                state.completed = true;
                state.progress = 10;
                state.end_time = 2_000;
            }
            Ok(SyncStatusView::new(state, StatusSource::Cache, 1_500))
        }
    }

    #[tokio::test]
    async fn poller_stops_once_sync_settles() {
        let feed = Arc::new(ScriptedFeed {
            calls: AtomicUsize::new(0),
            running_polls: 3,
        });
        let poller = StatusPoller::spawn(feed.clone(), Duration::from_millis(5));
        let end = tokio::time::timeout(Duration::from_secs(5), poller.join())
            .await
            .expect("poller finishes");

        match end {
            PollEnd::Settled(view) => assert!(view.state.completed),
            PollEnd::Stopped => panic!("expected settled"),
        }
        assert_eq!(feed.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn explicit_stop_cancels_polling() {
        let feed = Arc::new(ScriptedFeed {
            calls: AtomicUsize::new(0),
            running_polls: usize::MAX,
        });
        let poller = StatusPoller::spawn(feed.clone(), Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(poller.latest().is_some_and(|view| view.state.in_progress));

        poller.stop();
        let end = tokio::time::timeout(Duration::from_secs(5), poller.join())
            .await
            .expect("poller stops");
        assert_eq!(end, PollEnd::Stopped);

        let calls = feed.calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(feed.calls.load(Ordering::SeqCst), calls);
    }
}
