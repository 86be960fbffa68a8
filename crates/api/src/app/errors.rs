use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;
use tracing::{error, warn};

use glyphmart_infra::{AuditError, InteractionError, QueryError, StoreError};

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

/// 503 for transient failures: the client may retry the same request.
pub fn retryable_error(code: &'static str, message: impl Into<String>) -> axum::response::Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
            "retryable": true,
        })),
    )
        .into_response()
}

pub fn store_error_to_response(err: &StoreError) -> axum::response::Response {
    match err {
        StoreError::SubjectNotFound(id) => {
            json_error(StatusCode::NOT_FOUND, "subject_not_found", format!("subject {id} not found"))
        }
        e if e.is_retryable() => {
            warn!(error = %e, "transient store failure");
            retryable_error("store_unavailable", e.to_string())
        }
        e => {
            error!(error = %e, "store failure");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string())
        }
    }
}

pub fn interaction_error_to_response(err: InteractionError) -> axum::response::Response {
    match err {
        InteractionError::SubjectNotFound(id) => {
            json_error(StatusCode::NOT_FOUND, "subject_not_found", format!("subject {id} not found"))
        }
        InteractionError::Store(e) => store_error_to_response(&e),
    }
}

pub fn query_error_to_response(err: QueryError) -> axum::response::Response {
    match err {
        QueryError::SubjectNotFound(id) => {
            json_error(StatusCode::NOT_FOUND, "subject_not_found", format!("subject {id} not found"))
        }
        QueryError::Forbidden { .. } => json_error(StatusCode::FORBIDDEN, "forbidden", err.to_string()),
        QueryError::Invalid(e) => json_error(StatusCode::BAD_REQUEST, "validation_error", e.to_string()),
        QueryError::Store(e) => store_error_to_response(&e),
        QueryError::Batch(e) if e.is_retryable() => {
            warn!(error = %e, "transient batch failure");
            retryable_error("store_unavailable", e.to_string())
        }
        QueryError::Batch(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string()),
    }
}

pub fn audit_error_to_response(err: AuditError) -> axum::response::Response {
    match err {
        AuditError::SubjectNotFound(id) => {
            json_error(StatusCode::NOT_FOUND, "subject_not_found", format!("subject {id} not found"))
        }
        AuditError::Contended { .. } => retryable_error("audit_contended", err.to_string()),
        AuditError::Store(e) => store_error_to_response(&e),
        AuditError::BatchFailed { ref summary, .. } => {
            error!(error = %err, "audit batch failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                axum::Json(json!({
                    "error": "audit_batch_failed",
                    "message": err.to_string(),
                    "summary": summary,
                })),
            )
                .into_response()
        }
    }
}
