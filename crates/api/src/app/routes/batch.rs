use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
};

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", post(start_batch))
        .route("/all/check", post(check_all))
        .route("/all/clean", delete(clean_all))
        .route(
            "/:key",
            get(get_batch).put(resume_batch).delete(cancel_batch),
        )
}

/// Configure and (re)start a job; the first chunk is queued immediately.
pub async fn start_batch(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::StartBatchRequest>,
) -> axum::response::Response {
    let key = match dto::parse_key(&body.key) {
        Ok(key) => key,
        Err(resp) => return resp,
    };

    match services
        .start(
            &key,
            &body.config,
            body.restart,
            body.use_last_count_as_expected,
        )
        .await
    {
        Ok(status) => (StatusCode::ACCEPTED, Json(status)).into_response(),
        Err(e) => errors::batch_error_to_response(e),
    }
}

pub async fn get_batch(
    Extension(services): Extension<Arc<AppServices>>,
    Path(key): Path<String>,
) -> axum::response::Response {
    let key = match dto::parse_key(&key) {
        Ok(key) => key,
        Err(resp) => return resp,
    };

    match services.status(&key).await {
        Ok(status) => (StatusCode::OK, Json(status)).into_response(),
        Err(e) => errors::batch_error_to_response(e),
    }
}

/// Run one chunk now. Normally the queue worker does this.
pub async fn resume_batch(
    Extension(services): Extension<Arc<AppServices>>,
    Path(key): Path<String>,
) -> axum::response::Response {
    let key = match dto::parse_key(&key) {
        Ok(key) => key,
        Err(resp) => return resp,
    };

    match services.resume(&key).await {
        Ok(chunkline_infra::ResumeOutcome::Absent) => errors::json_error(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("batch not found: {}", key.suffix()),
        ),
        Ok(outcome) => (StatusCode::OK, Json(dto::outcome_to_json(&outcome))).into_response(),
        Err(e) => errors::batch_error_to_response(e),
    }
}

pub async fn cancel_batch(
    Extension(services): Extension<Arc<AppServices>>,
    Path(key): Path<String>,
) -> axum::response::Response {
    let key = match dto::parse_key(&key) {
        Ok(key) => key,
        Err(resp) => return resp,
    };

    match services.cancel(&key).await {
        Ok(status) => (StatusCode::OK, Json(status)).into_response(),
        Err(e) => errors::batch_error_to_response(e),
    }
}

/// Sweep every record: re-arm running jobs, queue cleanup of stale ones.
pub async fn check_all(
    Extension(services): Extension<Arc<AppServices>>,
) -> axum::response::Response {
    match services.check_all().await {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(e) => errors::batch_error_to_response(e),
    }
}

pub async fn clean_all(
    Extension(services): Extension<Arc<AppServices>>,
) -> axum::response::Response {
    match services.clean_all().await {
        Ok(deleted) => (
            StatusCode::OK,
            Json(serde_json::json!({ "deleted": deleted })),
        )
            .into_response(),
        Err(e) => errors::batch_error_to_response(e),
    }
}
