use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use chunkline_core::BatchError;

pub fn batch_error_to_response(err: BatchError) -> axum::response::Response {
    let message = err.to_string();
    match err {
        BatchError::InvalidKey(_) => json_error(StatusCode::BAD_REQUEST, "invalid_key", message),
        BatchError::Validation(_) => {
            json_error(StatusCode::BAD_REQUEST, "validation_error", message)
        }
        BatchError::UnknownHandler(_) => {
            json_error(StatusCode::BAD_REQUEST, "unknown_handler", message)
        }
        BatchError::NotFound(_) => json_error(StatusCode::NOT_FOUND, "not_found", message),
        BatchError::Expired { .. } => json_error(StatusCode::GONE, "expired", message),
        BatchError::ItemTypeMismatch { .. } => {
            json_error(StatusCode::CONFLICT, "item_type_mismatch", message)
        }
        BatchError::Handler { .. } => {
            json_error(StatusCode::UNPROCESSABLE_ENTITY, "handler_failed", message)
        }
        BatchError::ChunkTimeout { .. } => {
            json_error(StatusCode::GATEWAY_TIMEOUT, "chunk_timeout", message)
        }
        BatchError::Serialization(_) => json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "serialization_error",
            message,
        ),
        BatchError::Store(_) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", message)
        }
        BatchError::Queue(_) => json_error(StatusCode::BAD_GATEWAY, "queue_error", message),
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
