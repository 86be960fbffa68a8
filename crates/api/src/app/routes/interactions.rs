//! View/download recording and like toggling.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Query},
    response::IntoResponse,
};

use crate::app::dto::{LikeStatusResponse, RecordedResponse, SubjectRefQuery, SubjectRefRequest, require_subject_id};
use crate::app::{errors, services::AppServices};
use crate::context::{ActorContext, ClientOrigin};

/// POST /api/record-view
pub async fn record_view(
    Extension(services): Extension<Arc<AppServices>>,
    ClientOrigin(origin): ClientOrigin,
    Json(body): Json<SubjectRefRequest>,
) -> axum::response::Response {
    let subject_id = match require_subject_id(body.subject_id.as_deref()) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.interactions.record_view(&subject_id, &origin).await {
        Ok(recorded) => Json(RecordedResponse {
            recorded: recorded.is_new(),
        })
        .into_response(),
        Err(e) => errors::interaction_error_to_response(e),
    }
}

/// POST /api/record-download
pub async fn record_download(
    Extension(services): Extension<Arc<AppServices>>,
    ClientOrigin(origin): ClientOrigin,
    Json(body): Json<SubjectRefRequest>,
) -> axum::response::Response {
    let subject_id = match require_subject_id(body.subject_id.as_deref()) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.interactions.record_download(&subject_id, &origin).await {
        Ok(recorded) => Json(RecordedResponse {
            recorded: recorded.is_new(),
        })
        .into_response(),
        Err(e) => errors::interaction_error_to_response(e),
    }
}

/// POST /api/toggle-like
pub async fn toggle_like(
    Extension(services): Extension<Arc<AppServices>>,
    actor: ActorContext,
    Json(body): Json<SubjectRefRequest>,
) -> axum::response::Response {
    let subject_id = match require_subject_id(body.subject_id.as_deref()) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.interactions.toggle_like(&subject_id, actor.actor()).await {
        Ok(toggle) => Json(toggle).into_response(),
        Err(e) => errors::interaction_error_to_response(e),
    }
}

/// GET /api/like-status?subjectId=
pub async fn like_status(
    Extension(services): Extension<Arc<AppServices>>,
    actor: ActorContext,
    Query(query): Query<SubjectRefQuery>,
) -> axum::response::Response {
    let subject_id = match require_subject_id(query.subject_id.as_deref()) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.interactions.has_liked(&subject_id, actor.actor().id()).await {
        Ok(liked) => Json(LikeStatusResponse { liked }).into_response(),
        Err(e) => errors::interaction_error_to_response(e),
    }
}
