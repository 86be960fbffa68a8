//! Subject reads (cached) and the create/delete glue.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
};

use crate::app::dto::{CountsRequest, CreateSubjectRequest, PopularQuery, parse_subject_id};
use crate::app::{errors, services::AppServices};
use crate::context::ActorContext;

const DEFAULT_POPULAR_LIMIT: usize = 20;

/// GET /api/subjects/:id
pub async fn get_subject(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let subject_id = match parse_subject_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.queries.subject(&subject_id).await {
        Ok(subject) => Json(subject).into_response(),
        Err(e) => errors::query_error_to_response(e),
    }
}

/// POST /api/subjects/counts
pub async fn counts(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<CountsRequest>,
) -> axum::response::Response {
    let mut ids = Vec::with_capacity(body.ids.len());
    for raw in &body.ids {
        match parse_subject_id(raw) {
            Ok(id) => ids.push(id),
            Err(resp) => return resp,
        }
    }

    match services.queries.counts_many(&ids).await {
        Ok(counts) => Json(counts).into_response(),
        Err(e) => errors::query_error_to_response(e),
    }
}

/// GET /api/popular?limit=
pub async fn popular(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<PopularQuery>,
) -> axum::response::Response {
    let limit = query.limit.unwrap_or(DEFAULT_POPULAR_LIMIT);
    match services.queries.popular(limit).await {
        Ok(subjects) => Json(subjects).into_response(),
        Err(e) => errors::query_error_to_response(e),
    }
}

/// POST /api/subjects
pub async fn create_subject(
    Extension(services): Extension<Arc<AppServices>>,
    actor: ActorContext,
    Json(body): Json<CreateSubjectRequest>,
) -> axum::response::Response {
    match services.queries.create_subject(actor.actor(), &body.title).await {
        Ok(subject) => (StatusCode::CREATED, Json(subject)).into_response(),
        Err(e) => errors::query_error_to_response(e),
    }
}

/// DELETE /api/subjects/:id
pub async fn delete_subject(
    Extension(services): Extension<Arc<AppServices>>,
    actor: ActorContext,
    Path(id): Path<String>,
) -> axum::response::Response {
    let subject_id = match parse_subject_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services
        .queries
        .delete_subject(&subject_id, actor.actor(), &services.admins)
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => errors::query_error_to_response(e),
    }
}

/// GET /api/user-likes
pub async fn user_likes(
    Extension(services): Extension<Arc<AppServices>>,
    actor: ActorContext,
) -> axum::response::Response {
    match services.queries.liked_by(actor.actor().id()).await {
        Ok(subjects) => Json(subjects).into_response(),
        Err(e) => errors::query_error_to_response(e),
    }
}
