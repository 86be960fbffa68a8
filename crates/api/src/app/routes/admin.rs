//! Admin routes: counter sync, cache control, dashboard stats.
//!
//! Mounted behind `admin_middleware`, so handlers can assume an admin caller.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::Extension,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use tracing::info;

use crate::app::dto::{ClearCacheResponse, SyncCountsRequest, SyncCountsResponse, parse_subject_id};
use crate::app::{errors, services::AppServices};

pub fn router() -> Router {
    Router::new()
        .route("/sync-counts", post(sync_counts))
        .route("/cache-stats", get(cache_stats))
        .route("/clear-cache", post(clear_cache))
        .route("/stats", get(stats))
}

/// POST /api/admin/sync-counts
///
/// With `subjectId`: audit that subject. Otherwise audit one page starting
/// after `cursor`. An empty body audits the first page; a malformed one is 400.
pub async fn sync_counts(Extension(services): Extension<Arc<AppServices>>, raw: Bytes) -> axum::response::Response {
    let body = match parse_sync_request(&raw) {
        Ok(body) => body,
        Err(resp) => return resp,
    };

    if let Some(raw) = body.subject_id.as_deref() {
        let subject_id = match parse_subject_id(raw) {
            Ok(id) => id,
            Err(resp) => return resp,
        };
        return match services.auditor.audit_subject(&subject_id).await {
            Ok(report) => Json(SyncCountsResponse {
                checked: 1,
                corrected: u64::from(report.corrected),
                report: Some(report),
                ..SyncCountsResponse::default()
            })
            .into_response(),
            Err(e) => errors::audit_error_to_response(e),
        };
    }

    let cursor = match body.cursor.as_deref().map(parse_subject_id).transpose() {
        Ok(cursor) => cursor,
        Err(resp) => return resp,
    };

    match services.auditor.audit_all(body.batch_size, cursor.as_ref()).await {
        Ok(summary) => Json(SyncCountsResponse {
            checked: summary.checked,
            corrected: summary.corrected,
            errors: summary.errors,
            skipped: summary.skipped,
            next_cursor: summary.next_cursor,
            report: None,
        })
        .into_response(),
        Err(e) => errors::audit_error_to_response(e),
    }
}

fn parse_sync_request(raw: &[u8]) -> Result<SyncCountsRequest, axum::response::Response> {
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Ok(SyncCountsRequest::default());
    }
    serde_json::from_slice(raw)
        .map_err(|e| errors::json_error(StatusCode::BAD_REQUEST, "invalid_body", e.to_string()))
}

/// GET /api/admin/cache-stats
pub async fn cache_stats(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    Json(services.cache.stats()).into_response()
}

/// POST /api/admin/clear-cache
pub async fn clear_cache(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    let cleared = services.cache.clear();
    info!(cleared, "cache cleared by admin");
    Json(ClearCacheResponse { cleared }).into_response()
}

/// GET /api/admin/stats
pub async fn stats(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.queries.admin_stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => errors::query_error_to_response(e),
    }
}
