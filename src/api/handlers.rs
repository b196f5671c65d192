use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tokio::time::timeout;
use tracing::{info, warn};

use super::{
    ApiError, AppState, FetchResponse, ListSource, StartSyncRequest, UpdateStatusRequest,
    UpdateStatusResponse,
};
use crate::mailbox::FetchScope;
use crate::models::{EmailMetadata, EmailUpdates};
use crate::sync::{merge_known_statuses, StartResponse};

pub(super) async fn health() -> &'static str {
    "ok"
}

pub(super) async fn start_sync(
    State(app): State<AppState>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request: StartSyncRequest = if body.iter().all(u8::is_ascii_whitespace) {
        StartSyncRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::BadRequest(e.to_string()))?
    };

    let start = app
        .orchestrator
        .start_sync(request.force, request.fetch_all)
        .await?;
    Ok(start_response(start.response()))
}

fn start_response(response: StartResponse) -> Response {
    let status = if response.accepted {
        StatusCode::ACCEPTED
    } else {
        StatusCode::CONFLICT
    };
    (status, Json(response)).into_response()
}

/// In-process state only; another instance's run is invisible here.
pub(super) async fn local_sync_state(State(app): State<AppState>) -> impl IntoResponse {
    Json(app.orchestrator.current_state().await)
}

pub(super) async fn sync_status(State(app): State<AppState>) -> impl IntoResponse {
    Json(app.status.get_status().await)
}

/// Scheduled trigger. Waits for the run up to the handler budget, after which
/// the run keeps going in the background.
pub(super) async fn cron_sync(
    State(app): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    if !bearer_matches(&headers, app.cron_secret.as_deref()) {
        return Err(ApiError::Unauthorized);
    }

    let start = app.orchestrator.start_sync(false, false).await?;
    let Some(task) = start.task else {
        return Ok(start_response(start.response()));
    };

    match timeout(app.cron_budget, task).await {
        Ok(Ok(state)) => {
            info!("scheduled sync finished within the handler budget");
            Ok((
                StatusCode::OK,
                Json(StartResponse {
                    accepted: true,
                    reason: None,
                    state,
                }),
            )
                .into_response())
        }
        Ok(Err(join_error)) => {
            warn!("scheduled sync task ended abnormally: {join_error}");
            Ok(start_response(StartResponse {
                accepted: true,
                reason: None,
                state: app.orchestrator.current_state().await,
            }))
        }
        Err(_) => {
            info!(
                "scheduled sync still running after {}s, returning",
                app.cron_budget.as_secs()
            );
            Ok(start_response(StartResponse {
                accepted: true,
                reason: None,
                state: app.orchestrator.current_state().await,
            }))
        }
    }
}

fn bearer_matches(headers: &HeaderMap, secret: Option<&str>) -> bool {
    let Some(secret) = secret else {
        return false;
    };
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .is_some_and(|token| token.trim() == secret)
}

/// Fresh cache, then the live mailbox, then the stale copy.
pub(super) async fn fetch_emails(State(app): State<AppState>) -> Result<Json<FetchResponse>, ApiError> {
    let store = app.orchestrator.store();
    match store.read_email_list().await {
        Ok(Some(emails)) => return Ok(Json(FetchResponse::new(emails, ListSource::Cache, None))),
        Ok(None) => {}
        Err(error) => warn!("email list cache unavailable: {error}"),
    }

    let scope = FetchScope::Recent(app.orchestrator.settings().recent_limit);
    let outcome = app.orchestrator.fetcher().fetch_mailbox(scope).await;
    if outcome.is_live() {
        let known = known_records(&app).await;
        let emails = merge_known_statuses(outcome.emails, &known);
        if let Err(error) = store.write_email_list(&emails).await {
            warn!("failed to cache fetched email list: {error}");
        }
        return Ok(Json(FetchResponse::new(emails, ListSource::Live, None)));
    }

    match store.read_stale_email_list().await {
        Ok(Some(emails)) => Ok(Json(FetchResponse::new(emails, ListSource::Stale, outcome.error))),
        Ok(None) => Ok(Json(FetchResponse::new(
            outcome.emails,
            ListSource::Fallback,
            outcome.error,
        ))),
        Err(error) => {
            warn!("stale email list unavailable: {error}");
            Ok(Json(FetchResponse::new(
                outcome.emails,
                ListSource::Fallback,
                outcome.error,
            )))
        }
    }
}

async fn known_records(app: &AppState) -> Vec<EmailMetadata> {
    match app.orchestrator.content().query_email_records().await {
        Ok(records) => records,
        Err(error) => {
            warn!("content store unavailable, statuses from stale cache: {error}");
            app.orchestrator
                .store()
                .read_stale_email_list()
                .await
                .ok()
                .flatten()
                .unwrap_or_default()
        }
    }
}

pub(super) async fn clear_sync_status(State(app): State<AppState>) -> Result<Response, ApiError> {
    app.orchestrator.clear_status().await?;
    Ok(Json(json!({ "success": true })).into_response())
}

pub(super) async fn update_status(
    State(app): State<AppState>,
    body: Bytes,
) -> Result<Json<UpdateStatusResponse>, ApiError> {
    let request: UpdateStatusRequest =
        serde_json::from_slice(&body).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let email_id = request.email_id.trim();
    if email_id.is_empty() {
        return Err(ApiError::BadRequest("emailId must not be empty".to_string()));
    }

    let updates = EmailUpdates {
        status: Some(request.status),
        last_response_by: request.last_response_by.map(Some),
    };
    let email = app
        .orchestrator
        .content()
        .update_status(email_id, &updates)
        .await?;

    if let Err(error) = app.orchestrator.store().patch_email(email_id, &updates).await {
        warn!("status of {email_id} saved but cached lists not patched: {error}");
    }
    info!("status of {email_id} set to {}", request.status);

    Ok(Json(UpdateStatusResponse {
        success: true,
        email,
    }))
}

#[cfg(test)]
mod tests {
    use axum::http::{header, HeaderMap, HeaderValue};

    use super::bearer_matches;

    #[test]
    fn bearer_token_must_match_configured_secret() {
        let mut headers = HeaderMap::new();
        assert!(!bearer_matches(&headers, Some("s3cret")));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer wrong"));
        assert!(!bearer_matches(&headers, Some("s3cret")));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer s3cret"));
        assert!(bearer_matches(&headers, Some("s3cret")));
        assert!(!bearer_matches(&headers, None));
    }
}
