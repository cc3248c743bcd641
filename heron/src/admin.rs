//! HTTP administration API over [`QueueInspector`].
//!
//! Routes:
//!
//! | Method | Path                          | Operation                     |
//! |--------|-------------------------------|-------------------------------|
//! | GET    | `/dlq/jobs?limit=&start=`     | page of dead-letter entries   |
//! | GET    | `/dlq/stats`                  | dead-letter counts            |
//! | GET    | `/dlq/jobs/{id}`              | one dead-letter entry         |
//! | POST   | `/dlq/jobs/{id}/retry`        | manual re-injection           |
//! | DELETE | `/dlq/clear?confirm=true`     | purge the dead-letter queue   |
//! | GET    | `/queue/stats`                | counts for both queues        |
//! | GET    | `/queue/jobs/{id}`            | one main-queue message        |
//! | GET    | `/jobs/{correlation_id}`      | ledger entry                  |
//!
//! Successful responses are `{"status": true, "data": ...}`; failures are
//! `{"status": false, "message": ...}`.

use axum::extract::rejection::QueryRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::connection::QueueKind;
use crate::correlation::CorrelationId;
use crate::error::{AdminError, AdminResult};
use crate::inspector::{QueueInspector, RetryOptions};
use crate::job::JobId;

const DEFAULT_PAGE_LIMIT: usize = 50;

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let status = match &self {
            AdminError::NotFound { .. } => StatusCode::NOT_FOUND,
            AdminError::PreconditionFailed(_) => StatusCode::BAD_REQUEST,
            AdminError::InvalidState(_) => StatusCode::BAD_REQUEST,
            AdminError::Transport(err) => {
                tracing::error!("admin request failed: {err:#}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let payload = json!({ "status": false, "message": self.to_string() });
        (status, Json(payload)).into_response()
    }
}

/// Malformed query strings get the same JSON error shape as every other failure.
fn query_params<T>(query: Result<Query<T>, QueryRejection>) -> AdminResult<T> {
    query
        .map(|Query(params)| params)
        .map_err(|rejection| AdminError::PreconditionFailed(rejection.body_text()))
}

fn success<T: Serialize>(data: T) -> Json<Value> {
    Json(json!({ "status": true, "data": data }))
}

fn success_with_message<T: Serialize>(message: &str, data: T) -> Json<Value> {
    Json(json!({ "status": true, "message": message, "data": data }))
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    limit: Option<usize>,
    start: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RetryQuery {
    #[serde(rename = "removeFromDLQ", default)]
    remove_from_dlq: bool,
}

#[derive(Debug, Deserialize)]
struct ClearQuery {
    #[serde(default)]
    confirm: bool,
}

/// Build the admin router around a shared inspector.
pub fn router(inspector: QueueInspector) -> Router {
    Router::new()
        .route("/dlq/jobs", get(list_dead_letters))
        .route("/dlq/stats", get(dead_letter_stats))
        .route("/dlq/jobs/{id}", get(get_dead_letter))
        .route("/dlq/jobs/{id}/retry", post(retry_dead_letter))
        .route("/dlq/clear", delete(clear_dead_letters))
        .route("/queue/stats", get(queue_stats))
        .route("/queue/jobs/{id}", get(get_queued_job))
        .route("/jobs/{correlation_id}", get(job_status))
        .with_state(inspector)
}

async fn list_dead_letters(
    State(inspector): State<QueueInspector>,
    query: Result<Query<PageQuery>, QueryRejection>,
) -> AdminResult<Json<Value>> {
    let query = query_params(query)?;
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_LIMIT);
    let start = query.start.unwrap_or(0);
    let page = inspector.list_dead_letters(start, limit).await?;
    tracing::debug!(start, limit, count = page.jobs.len(), "listed dead-letter jobs");
    Ok(success(page))
}

async fn dead_letter_stats(State(inspector): State<QueueInspector>) -> AdminResult<Json<Value>> {
    let counts = inspector.get_stats(QueueKind::DeadLetter).await?;
    Ok(success(json!({
        "waiting": counts.waiting,
        "delayed": counts.delayed,
        "active": counts.active,
        "completed": counts.completed,
        "failed": counts.failed,
        "total": counts.total(),
        "timestamp": Utc::now(),
    })))
}

async fn get_dead_letter(
    State(inspector): State<QueueInspector>,
    Path(id): Path<String>,
) -> AdminResult<Json<Value>> {
    let record = inspector
        .get_job(QueueKind::DeadLetter, &JobId::from(id))
        .await?;
    Ok(success(record))
}

async fn retry_dead_letter(
    State(inspector): State<QueueInspector>,
    Path(id): Path<String>,
    query: Result<Query<RetryQuery>, QueryRejection>,
) -> AdminResult<Json<Value>> {
    let query = query_params(query)?;
    let receipt = inspector
        .retry_job(
            &JobId::from(id),
            RetryOptions {
                remove_from_dlq: query.remove_from_dlq,
            },
        )
        .await?;
    Ok(success_with_message("job retried", receipt))
}

async fn clear_dead_letters(
    State(inspector): State<QueueInspector>,
    query: Result<Query<ClearQuery>, QueryRejection>,
) -> AdminResult<Json<Value>> {
    let query = query_params(query)?;
    let removed = inspector.clear_dlq(query.confirm).await?;
    Ok(success_with_message(
        "dead-letter queue cleared",
        json!({ "jobsRemoved": removed }),
    ))
}

async fn queue_stats(State(inspector): State<QueueInspector>) -> AdminResult<Json<Value>> {
    Ok(success(inspector.queue_stats().await?))
}

async fn get_queued_job(
    State(inspector): State<QueueInspector>,
    Path(id): Path<String>,
) -> AdminResult<Json<Value>> {
    let record = inspector.get_job(QueueKind::Main, &JobId::from(id)).await?;
    Ok(success(record))
}

async fn job_status(
    State(inspector): State<QueueInspector>,
    Path(correlation_id): Path<String>,
) -> AdminResult<Json<Value>> {
    let entry = inspector
        .job_status(&CorrelationId::from(correlation_id))
        .await?;
    Ok(success(entry))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn body_of(response: Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_error_status_codes() {
        let cases = [
            (
                AdminError::not_found("dead-letter-queue", &JobId::from("7")),
                StatusCode::NOT_FOUND,
            ),
            (
                AdminError::PreconditionFailed("confirm".into()),
                StatusCode::BAD_REQUEST,
            ),
            (
                AdminError::InvalidState("active".into()),
                StatusCode::BAD_REQUEST,
            ),
            (
                AdminError::Transport(anyhow::anyhow!("down")),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (err, expected) in cases {
            let response = err.into_response();
            assert_eq!(response.status(), expected);
            let body = body_of(response).await;
            assert_eq!(body["status"], false);
            assert!(body["message"].is_string());
        }
    }

    #[test]
    fn test_query_defaults() {
        let retry: RetryQuery = serde_json::from_value(json!({})).unwrap();
        assert!(!retry.remove_from_dlq);
        let clear: ClearQuery = serde_json::from_value(json!({})).unwrap();
        assert!(!clear.confirm);
    }
}
