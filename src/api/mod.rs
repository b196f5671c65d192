//! REST surface over the orchestrator, the status service and the email list.

use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::cache::CacheError;
use crate::content::ContentError;
use crate::models::{EmailMetadata, EmailStatus, ResponseParty, StatusCounts};
use crate::sync::{SyncOrchestrator, SyncStatusService};

mod handlers;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: SyncOrchestrator,
    pub status: SyncStatusService,
    pub cron_secret: Option<String>,
    pub cron_budget: Duration,
}

impl AppState {
    pub fn new(orchestrator: SyncOrchestrator, cron_secret: Option<String>, cron_budget: Duration) -> Self {
        let status = SyncStatusService::new(orchestrator.clone());
        Self {
            orchestrator,
            status,
            cron_secret: cron_secret.filter(|secret| !secret.is_empty()),
            cron_budget,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/sync", post(handlers::start_sync).get(handlers::local_sync_state))
        .route("/sync-status", get(handlers::sync_status))
        .route("/sync-emails", get(handlers::cron_sync))
        .route("/fetch", get(handlers::fetch_emails))
        .route("/clear-sync-status", post(handlers::clear_sync_status))
        .route("/update-status", post(handlers::update_status))
        .with_state(state)
}

/// Optional body of `POST /sync`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct StartSyncRequest {
    pub force: bool,
    pub fetch_all: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStatusRequest {
    pub email_id: String,
    pub status: EmailStatus,
    #[serde(default)]
    pub last_response_by: Option<ResponseParty>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStatusResponse {
    pub success: bool,
    pub email: EmailMetadata,
}

/// Where a `/fetch` answer came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ListSource {
    Cache,
    Live,
    Stale,
    Fallback,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FetchResponse {
    pub emails: Vec<EmailMetadata>,
    pub stats: StatusCounts,
    pub source: ListSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FetchResponse {
    pub fn new(emails: Vec<EmailMetadata>, source: ListSource, error: Option<String>) -> Self {
        let stats = StatusCounts::recompute(&emails);
        Self {
            emails,
            stats,
            source,
            error,
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid request body: {0}")]
    BadRequest(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("{0}")]
    NotFound(String),

    #[error("content store unavailable: {0}")]
    Upstream(String),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl From<ContentError> for ApiError {
    fn from(error: ContentError) -> Self {
        match error {
            ContentError::NotFound(id) => Self::NotFound(format!("email not found: {id}")),
            other => Self::Upstream(other.to_string()),
        }
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::Cache(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("request failed: {self}");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
