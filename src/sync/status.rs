use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{SyncOrchestrator, SyncPhase};
use crate::cache::{RawCounters, SyncStore};
use crate::models::{now_ms, SyncState};

/// Which tier answered a status request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StatusSource {
    Memory,
    Cache,
    Counters,
    Idle,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatusView {
    #[serde(flatten)]
    pub state: SyncState,
    /// Milliseconds since start, while running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_time: Option<i64>,
    /// Milliseconds from start to end, once completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_time: Option<i64>,
    pub source: StatusSource,
}

impl SyncStatusView {
    pub fn new(state: SyncState, source: StatusSource, now: i64) -> Self {
        let elapsed_time = (state.in_progress && state.start_time > 0)
            .then(|| now.saturating_sub(state.start_time).max(0));
        let processing_time = (state.completed
            && state.start_time > 0
            && state.end_time >= state.start_time)
            .then(|| state.end_time - state.start_time);
        Self {
            state,
            elapsed_time,
            processing_time,
            source,
        }
    }

    /// Pollers stop once this holds.
    pub fn is_settled(&self) -> bool {
        self.state.completed || !self.state.in_progress
    }
}

/// Answers "what is the sync doing" from whichever tier is available.
#[derive(Clone)]
pub struct SyncStatusService {
    orchestrator: SyncOrchestrator,
    store: SyncStore,
}

impl SyncStatusService {
    pub fn new(orchestrator: SyncOrchestrator) -> Self {
        let store = orchestrator.store().clone();
        Self {
            orchestrator,
            store,
        }
    }

    /// Never fails; unreadable tiers are skipped.
    pub async fn get_status(&self) -> SyncStatusView {
        let counters = match self.store.read_counters().await {
            Ok(counters) => counters,
            Err(error) => {
                warn!("sync counters unavailable: {error}");
                RawCounters::default()
            }
        };

        let owned = self.orchestrator.owned_state().await;
        let cached = self.cached_state().await;
        let (mut state, source) = match (owned, cached) {
            (Some((state, phase)), cached) if prefer_local(&state, phase, cached.as_ref()) => {
                (state, StatusSource::Memory)
            }
            (_, Some(cached)) => (cached, StatusSource::Cache),
            (_, None) => reconstruct_from_counters(&counters),
        };

        // The lock flag outlives a stale snapshot; it wins.
        if counters.lock_held {
            state.in_progress = true;
            state.completed = false;
            state.end_time = 0;
        }
        if state.total > 0 {
            state.progress = state.progress.min(state.total);
        }

        SyncStatusView::new(state, source, now_ms())
    }

    async fn cached_state(&self) -> Option<SyncState> {
        match self.store.read_state().await {
            Ok(state) => state,
            Err(error) => {
                warn!("cached sync state unavailable: {error}");
                None
            }
        }
    }
}

/// The local copy answers while this instance is driving a run. Afterwards it
/// only stands in for the cache when the cache has nothing newer: another
/// instance may have started a run since.
fn prefer_local(local: &SyncState, phase: SyncPhase, cached: Option<&SyncState>) -> bool {
    if matches!(phase, SyncPhase::Running | SyncPhase::Completing) {
        return true;
    }
    cached.map_or(true, |cached| cached.run_id == local.run_id)
}

fn reconstruct_from_counters(counters: &RawCounters) -> (SyncState, StatusSource) {
    if counters.total.is_none() && counters.processed.is_none() && !counters.lock_held {
        return (SyncState::default(), StatusSource::Idle);
    }

    let total = counters.total.unwrap_or(0);
    let processed = counters.processed.unwrap_or(0);
    let completed = !counters.lock_held && total > 0 && processed >= total;
    let status = if counters.lock_held {
        format!("Sync in progress ({processed} of {total})")
    } else if completed {
        "Sync completed".to_string()
    } else {
        String::new()
    };

    let state = SyncState {
        in_progress: counters.lock_held,
        progress: processed,
        total,
        status,
        completed,
        ..SyncState::default()
    };
    (state, StatusSource::Counters)
}
