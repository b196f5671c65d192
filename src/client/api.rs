//! HTTP client for the mailsync REST API.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::json;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{timeout, Instant};
use tracing::debug;

use super::storage::StorageError;
use crate::api::{FetchResponse, StartSyncRequest, UpdateStatusRequest, UpdateStatusResponse};
use crate::http::redact_response_body;
use crate::models::{EmailMetadata, EmailStatus, ResponseParty, SyncState};
use crate::sync::{StartResponse, SyncStatusView};

pub const UPDATE_TIMEOUT: Duration = Duration::from_secs(15);
pub const MIN_FETCH_INTERVAL: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("json serialization: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("request timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("{0}")]
    Config(String),
}

/// The server-side operations a client session depends on.
#[async_trait]
pub trait EmailBackend: Send + Sync {
    /// `None` when the call was skipped by throttling or another fetch in flight.
    async fn fetch_list(&self) -> Result<Option<Vec<EmailMetadata>>, ClientError>;

    async fn write_status(
        &self,
        email_id: &str,
        status: EmailStatus,
        last_response_by: Option<ResponseParty>,
    ) -> Result<(), ClientError>;
}

#[async_trait]
pub trait StatusFeed: Send + Sync {
    async fn sync_status(&self) -> Result<SyncStatusView, ClientError>;
}

pub struct EmailApiClient {
    client: Client,
    base_url: String,
    fetch_in_flight: AtomicBool,
    last_fetch: Mutex<Option<Instant>>,
    min_fetch_interval: Duration,
}

struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl EmailApiClient {
    pub fn new(base_url: &str) -> Result<Self, ClientError> {
        let base_url = base_url.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(ClientError::Config("API base URL is empty".to_string()));
        }
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url,
            fetch_in_flight: AtomicBool::new(false),
            last_fetch: Mutex::new(None),
            min_fetch_interval: MIN_FETCH_INTERVAL,
        })
    }

    pub fn with_min_fetch_interval(mut self, interval: Duration) -> Self {
        self.min_fetch_interval = interval;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// At most one fetch in flight and one per `min_fetch_interval`.
    pub async fn fetch_emails(&self) -> Result<Option<FetchResponse>, ClientError> {
        if self.fetch_in_flight.swap(true, Ordering::AcqRel) {
            debug!("email list fetch skipped: another fetch in flight");
            return Ok(None);
        }
        let _guard = InFlight(&self.fetch_in_flight);

        {
            let mut last = self.last_fetch.lock().await;
            if last.is_some_and(|at| at.elapsed() < self.min_fetch_interval) {
                debug!("email list fetch skipped: throttled");
                return Ok(None);
            }
            *last = Some(Instant::now());
        }

        let response = self.client.get(self.url("/fetch")).send().await?;
        read_json(response).await.map(Some)
    }

    pub async fn update_status(
        &self,
        request: &UpdateStatusRequest,
    ) -> Result<UpdateStatusResponse, ClientError> {
        let send = async {
            let response = self
                .client
                .post(self.url("/update-status"))
                .json(request)
                .send()
                .await?;
            read_json(response).await
        };
        timeout(UPDATE_TIMEOUT, send)
            .await
            .map_err(|_| ClientError::Timeout(UPDATE_TIMEOUT))?
    }

    pub async fn start_sync(&self, force: bool, fetch_all: bool) -> Result<StartResponse, ClientError> {
        let response = self
            .client
            .post(self.url("/sync"))
            .json(&StartSyncRequest { force, fetch_all })
            .send()
            .await?;
        // 409 carries the same body as 202.
        if response.status() == StatusCode::CONFLICT {
            return Ok(response.json().await?);
        }
        read_json(response).await
    }

    pub async fn local_sync_state(&self) -> Result<SyncState, ClientError> {
        let response = self.client.get(self.url("/sync")).send().await?;
        read_json(response).await
    }

    pub async fn clear_sync_status(&self) -> Result<(), ClientError> {
        let response = self
            .client
            .post(self.url("/clear-sync-status"))
            .json(&json!({}))
            .send()
            .await?;
        let _: serde_json::Value = read_json(response).await?;
        Ok(())
    }
}

#[async_trait]
impl EmailBackend for EmailApiClient {
    async fn fetch_list(&self) -> Result<Option<Vec<EmailMetadata>>, ClientError> {
        Ok(self.fetch_emails().await?.map(|response| response.emails))
    }

    async fn write_status(
        &self,
        email_id: &str,
        status: EmailStatus,
        last_response_by: Option<ResponseParty>,
    ) -> Result<(), ClientError> {
        self.update_status(&UpdateStatusRequest {
            email_id: email_id.to_string(),
            status,
            last_response_by,
        })
        .await
        .map(|_| ())
    }
}

#[async_trait]
impl StatusFeed for EmailApiClient {
    async fn sync_status(&self) -> Result<SyncStatusView, ClientError> {
        let response = self.client.get(self.url("/sync-status")).send().await?;
        read_json(response).await
    }
}

async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ClientError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ClientError::Status {
            status: status.as_u16(),
            body: redact_response_body(&body),
        });
    }
    Ok(response.json().await?)
}
