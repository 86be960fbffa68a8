use axum::{
    Router,
    routing::{get, post},
};

pub mod admin;
pub mod interactions;
pub mod subjects;
pub mod system;

/// Router for the `/api` endpoints outside the admin group.
///
/// Routes needing a verified actor take an `ActorContext`; the rest serve
/// anonymous callers.
pub fn router() -> Router {
    Router::new()
        .route("/record-view", post(interactions::record_view))
        .route("/record-download", post(interactions::record_download))
        .route("/toggle-like", post(interactions::toggle_like))
        .route("/like-status", get(interactions::like_status))
        .route("/subjects", post(subjects::create_subject))
        .route("/subjects/counts", post(subjects::counts))
        .route(
            "/subjects/:id",
            get(subjects::get_subject).delete(subjects::delete_subject),
        )
        .route("/popular", get(subjects::popular))
        .route("/user-likes", get(subjects::user_likes))
}
