use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time::sleep;
use tracing::{debug, warn};

use super::{ContentError, ContentStore, UpsertMode, UpsertOutcome};
use crate::config::ContentSettings;
use crate::http::redact_response_body;
use crate::models::{EmailMetadata, EmailStatus, EmailUpdates, ResponseParty};

const PAGE_SIZE: usize = 100;
const MAX_RATE_LIMIT_RETRIES: usize = 5;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Email record as stored in the CMS collection. The upstream UID lives in
/// `emailId`; `id`/`documentId` are the CMS's own keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StrapiEmail {
    email_id: String,
    #[serde(default)]
    from: String,
    #[serde(default)]
    to: String,
    #[serde(default)]
    subject: String,
    #[serde(default)]
    received_date: String,
    #[serde(default)]
    preview: String,
    #[serde(default)]
    full_content: Option<String>,
    #[serde(default)]
    status: Option<EmailStatus>,
    #[serde(default)]
    last_response_by: Option<ResponseParty>,
}

impl StrapiEmail {
    fn into_metadata(self) -> EmailMetadata {
        EmailMetadata {
            id: self.email_id,
            from: self.from,
            to: self.to,
            subject: self.subject,
            received_date: self.received_date,
            preview: self.preview,
            full_content: self.full_content,
            status: self.status.unwrap_or_default(),
            last_response_by: self.last_response_by,
        }
    }
}

#[derive(Debug, Clone)]
struct StoredRecord {
    key: String,
    email: StrapiEmail,
}

#[derive(Debug, Deserialize)]
struct CollectionPage {
    #[serde(default)]
    data: Vec<Value>,
    #[serde(default)]
    meta: Option<PageMeta>,
}

#[derive(Debug, Deserialize)]
struct PageMeta {
    pagination: Option<Pagination>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Pagination {
    page: usize,
    page_count: usize,
}

#[derive(Debug, Clone)]
pub struct StrapiClient {
    client: Client,
    base_url: String,
    token: Option<String>,
    collection: String,
}

impl StrapiClient {
    pub fn new(base_url: &str, token: Option<String>, collection: &str) -> Result<Self, ContentError> {
        let base_url = base_url.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(ContentError::Config("STRAPI_URL is empty".to_string()));
        }
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url,
            token: token.filter(|token| !token.trim().is_empty()),
            collection: collection.to_string(),
        })
    }

    pub fn from_settings(settings: &ContentSettings) -> Result<Option<Self>, ContentError> {
        settings
            .strapi_url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
            .map(|url| {
                Self::new(
                    url,
                    settings.strapi_token.clone(),
                    &settings.strapi_collection,
                )
            })
            .transpose()
    }

    fn collection_url(&self) -> Result<Url, ContentError> {
        let endpoint = format!("{}/api/{}", self.base_url, self.collection);
        Url::parse(&endpoint)
            .map_err(|error| ContentError::Config(format!("invalid content store URL {endpoint}: {error}")))
    }

    fn record_url(&self, key: &str) -> Result<Url, ContentError> {
        let endpoint = format!("{}/api/{}/{}", self.base_url, self.collection, key);
        Url::parse(&endpoint)
            .map_err(|error| ContentError::Config(format!("invalid content store URL {endpoint}: {error}")))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send_with_retry<F>(&self, build: F) -> Result<Value, ContentError>
    where
        F: Fn() -> RequestBuilder + Send + Sync,
    {
        let mut backoff_seconds = 1u64;

        for attempt in 0..=MAX_RATE_LIMIT_RETRIES {
            let response = self
                .authorize(build())
                .header("accept", "application/json")
                .send()
                .await?;

            if response.status() == StatusCode::TOO_MANY_REQUESTS && attempt < MAX_RATE_LIMIT_RETRIES {
                let retry_after_seconds = response
                    .headers()
                    .get("retry-after")
                    .and_then(|value| value.to_str().ok())
                    .and_then(|value| value.parse::<u64>().ok())
                    .unwrap_or(backoff_seconds);
                warn!("content store rate limited, retrying in {retry_after_seconds}s");
                sleep(Duration::from_secs(retry_after_seconds)).await;
                backoff_seconds = (backoff_seconds * 2).min(32);
                continue;
            }

            let status = response.status();
            let body = response.text().await?;
            if status == StatusCode::NOT_FOUND {
                return Err(ContentError::NotFound(redact_response_body(&body)));
            }
            if !status.is_success() {
                return Err(ContentError::Status {
                    status: status.as_u16(),
                    body: redact_response_body(&body),
                });
            }
            if body.trim().is_empty() {
                return Ok(Value::Null);
            }
            return Ok(serde_json::from_str(&body)?);
        }

        Err(ContentError::Status {
            status: StatusCode::TOO_MANY_REQUESTS.as_u16(),
            body: "rate limit retries exhausted".to_string(),
        })
    }

    async fn find_record(&self, email_id: &str) -> Result<Option<StoredRecord>, ContentError> {
        let mut url = self.collection_url()?;
        url.query_pairs_mut()
            .append_pair("filters[emailId][$eq]", email_id)
            .append_pair("pagination[pageSize]", "1");

        let payload = self.send_with_retry(|| self.client.get(url.clone())).await?;
        let page: CollectionPage = serde_json::from_value(payload)?;
        page.data.into_iter().next().map(parse_entry).transpose()
    }

    async fn write_record(&self, key: Option<&str>, data: Value) -> Result<(), ContentError> {
        let body = json!({ "data": data });
        match key {
            Some(key) => {
                let url = self.record_url(key)?;
                self.send_with_retry(|| self.client.put(url.clone()).json(&body))
                    .await?;
            }
            None => {
                let url = self.collection_url()?;
                self.send_with_retry(|| self.client.post(url.clone()).json(&body))
                    .await?;
            }
        }
        Ok(())
    }
}

/// Accepts both the nested (`{id, attributes: {..}}`) and the flat
/// (`{id, documentId, ..}`) entry layouts.
fn parse_entry(entry: Value) -> Result<StoredRecord, ContentError> {
    let key = entry
        .get("documentId")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| entry.get("id").map(value_to_key))
        .ok_or_else(|| ContentError::Config("content store entry without id".to_string()))?;
    let fields = entry.get("attributes").cloned().unwrap_or(entry);
    let email: StrapiEmail = serde_json::from_value(fields)?;
    Ok(StoredRecord { key, email })
}

fn value_to_key(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn content_fields(email: &EmailMetadata) -> Value {
    json!({
        "emailId": email.id,
        "from": email.from,
        "to": email.to,
        "subject": email.subject,
        "receivedDate": email.received_date,
        "preview": email.preview,
        "fullContent": email.full_content,
    })
}

fn content_differs(stored: &StrapiEmail, email: &EmailMetadata) -> bool {
    stored.from != email.from
        || stored.to != email.to
        || stored.subject != email.subject
        || stored.received_date != email.received_date
        || stored.preview != email.preview
        || stored.full_content != email.full_content
}

#[async_trait]
impl ContentStore for StrapiClient {
    fn name(&self) -> &str {
        "strapi"
    }

    async fn upsert_email_record(
        &self,
        email: &EmailMetadata,
        mode: UpsertMode,
    ) -> Result<UpsertOutcome, ContentError> {
        match self.find_record(&email.id).await? {
            None => {
                let mut data = content_fields(email);
                data["status"] = json!(email.status);
                data["lastResponseBy"] = json!(email.last_response_by);
                self.write_record(None, data).await?;
                debug!("created content record for email {}", email.id);
                Ok(UpsertOutcome::Inserted)
            }
            Some(_) if mode == UpsertMode::InsertOnly => Ok(UpsertOutcome::Unchanged),
            Some(existing) if content_differs(&existing.email, email) => {
                self.write_record(Some(&existing.key), content_fields(email))
                    .await?;
                Ok(UpsertOutcome::Updated)
            }
            Some(_) => Ok(UpsertOutcome::Unchanged),
        }
    }

    async fn query_email_records(&self) -> Result<Vec<EmailMetadata>, ContentError> {
        let mut emails = Vec::new();
        let mut page_number = 1usize;

        loop {
            let mut url = self.collection_url()?;
            url.query_pairs_mut()
                .append_pair("pagination[page]", &page_number.to_string())
                .append_pair("pagination[pageSize]", &PAGE_SIZE.to_string())
                .append_pair("sort", "receivedDate:desc");

            let payload = self.send_with_retry(|| self.client.get(url.clone())).await?;
            let page: CollectionPage = serde_json::from_value(payload)?;
            let fetched = page.data.len();
            for entry in page.data {
                emails.push(parse_entry(entry)?.email.into_metadata());
            }

            let more = match page.meta.and_then(|meta| meta.pagination) {
                Some(pagination) => pagination.page < pagination.page_count,
                None => fetched == PAGE_SIZE,
            };
            if !more || fetched == 0 {
                break;
            }
            page_number += 1;
        }

        Ok(emails)
    }

    async fn update_status(
        &self,
        email_id: &str,
        updates: &EmailUpdates,
    ) -> Result<EmailMetadata, ContentError> {
        let existing = self
            .find_record(email_id)
            .await?
            .ok_or_else(|| ContentError::NotFound(email_id.to_string()))?;

        let mut data = json!({});
        if let Some(status) = updates.status {
            data["status"] = json!(status);
        }
        if let Some(party) = updates.last_response_by {
            data["lastResponseBy"] = json!(party);
        }
        self.write_record(Some(&existing.key), data).await?;

        let mut email = existing.email.into_metadata();
        email.apply(updates);
        Ok(email)
    }
}
