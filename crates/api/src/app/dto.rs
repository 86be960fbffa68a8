use axum::http::StatusCode;
use serde::{Deserialize, Serialize};

use glyphmart_core::SubjectId;
use glyphmart_infra::AuditReport;

use crate::app::errors;

// -------------------------
// Request DTOs
// -------------------------

/// Body of the record/toggle endpoints.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectRefRequest {
    pub subject_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectRefQuery {
    pub subject_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CountsRequest {
    pub ids: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PopularQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct CreateSubjectRequest {
    pub title: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCountsRequest {
    pub subject_id: Option<String>,
    pub batch_size: Option<usize>,
    pub cursor: Option<String>,
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct RecordedResponse {
    pub recorded: bool,
}

#[derive(Debug, Serialize)]
pub struct LikeStatusResponse {
    pub liked: bool,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCountsResponse {
    pub checked: u64,
    pub corrected: u64,
    pub errors: u64,
    pub skipped: u64,
    pub next_cursor: Option<SubjectId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<AuditReport>,
}

#[derive(Debug, Serialize)]
pub struct ClearCacheResponse {
    pub cleared: usize,
}

// -------------------------
// Helpers
// -------------------------

pub fn parse_subject_id(raw: &str) -> Result<SubjectId, axum::response::Response> {
    SubjectId::parse(raw.trim())
        .map_err(|e| errors::json_error(StatusCode::BAD_REQUEST, "invalid_subject_id", e.to_string()))
}

/// `subjectId` is required on every interaction endpoint.
pub fn require_subject_id(raw: Option<&str>) -> Result<SubjectId, axum::response::Response> {
    match raw {
        Some(raw) if !raw.trim().is_empty() => parse_subject_id(raw),
        _ => Err(errors::json_error(
            StatusCode::BAD_REQUEST,
            "validation_error",
            "subjectId is required",
        )),
    }
}
