use std::net::SocketAddr;

use chrono::{Duration as ChronoDuration, Utc};
use glyphmart_api::app::build_app;
use glyphmart_api::config::ApiConfig;
use glyphmart_auth::{JwtClaims, Role};
use glyphmart_core::ActorId;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::StatusCode;
use serde_json::{Value, json};

const SECRET: &str = "test-secret";

struct TestServer {
    base_url: String,
    client: reqwest::Client,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn() -> Self {
        Self::spawn_with(ApiConfig::for_tests(SECRET)).await
    }

    async fn spawn_with(config: ApiConfig) -> Self {
        // Same router as prod, bound to an ephemeral port.
        let app = build_app(&config).await.expect("failed to build app");
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(
                listener,
                app.router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });

        Self {
            base_url,
            client: reqwest::Client::new(),
            handle,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post(&self, path: &str, token: Option<&str>, body: Value) -> (StatusCode, Value) {
        let mut req = self.client.post(self.url(path)).json(&body);
        if let Some(t) = token {
            req = req.bearer_auth(t);
        }
        let res = req.send().await.unwrap();
        let status = res.status();
        (status, res.json().await.unwrap_or(Value::Null))
    }

    async fn get(&self, path: &str, token: Option<&str>) -> (StatusCode, Value) {
        let mut req = self.client.get(self.url(path));
        if let Some(t) = token {
            req = req.bearer_auth(t);
        }
        let res = req.send().await.unwrap();
        let status = res.status();
        (status, res.json().await.unwrap_or(Value::Null))
    }

    async fn view_from(&self, subject_id: &str, ip: &str) -> (StatusCode, Value) {
        let res = self
            .client
            .post(self.url("/api/record-view"))
            .header("x-forwarded-for", ip)
            .json(&json!({ "subjectId": subject_id }))
            .send()
            .await
            .unwrap();
        let status = res.status();
        (status, res.json().await.unwrap_or(Value::Null))
    }

    async fn create_subject(&self, token: &str, title: &str) -> String {
        let (status, body) = self.post("/api/subjects", Some(token), json!({ "title": title })).await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        body["id"].as_str().unwrap().to_string()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn mint_jwt(sub: &str, roles: Vec<Role>) -> String {
    let now = Utc::now();
    let claims = JwtClaims {
        sub: ActorId::parse(sub).unwrap(),
        roles,
        issued_at: now,
        expires_at: now + ChronoDuration::minutes(10),
    };

    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .expect("failed to encode jwt")
}

#[tokio::test]
async fn health_is_public() {
    let srv = TestServer::spawn().await;
    let (status, body) = srv.get("/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn views_are_deduplicated_per_origin() {
    let srv = TestServer::spawn().await;
    let owner = mint_jwt("owner", vec![]);
    let id = srv.create_subject(&owner, "Pulse").await;

    let (status, body) = srv.view_from(&id, "203.0.113.7").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["recorded"], true);

    let (_, body) = srv.view_from(&id, "203.0.113.7, 10.0.0.1").await;
    assert_eq!(body["recorded"], false);

    let (_, body) = srv.view_from(&id, "198.51.100.2").await;
    assert_eq!(body["recorded"], true);

    let (status, subject) = srv.get(&format!("/api/subjects/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(subject["views"], 2);
    assert_eq!(subject["downloads"], 0);
}

#[tokio::test]
async fn download_uses_peer_address_without_forwarded_header() {
    let srv = TestServer::spawn().await;
    let id = srv.create_subject(&mint_jwt("owner", vec![]), "Pulse").await;

    let (_, first) = srv.post("/api/record-download", None, json!({ "subjectId": id })).await;
    let (_, second) = srv.post("/api/record-download", None, json!({ "subjectId": id })).await;
    assert_eq!(first["recorded"], true);
    assert_eq!(second["recorded"], false);
}

#[tokio::test]
async fn recording_on_unknown_subject_is_404() {
    let srv = TestServer::spawn().await;
    let (status, body) = srv.view_from("nope", "203.0.113.7").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "subject_not_found");
}

#[tokio::test]
async fn missing_subject_id_is_400() {
    let srv = TestServer::spawn().await;
    let (status, body) = srv.post("/api/record-view", None, json!({})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation_error");

    let (status, _) = srv.post("/api/record-view", None, json!({ "subjectId": "a/b" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn like_requires_a_valid_token() {
    let srv = TestServer::spawn().await;
    let id = srv.create_subject(&mint_jwt("owner", vec![]), "Pulse").await;

    let (status, body) = srv.post("/api/toggle-like", None, json!({ "subjectId": id })).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "unauthenticated");

    let (status, _) = srv
        .post("/api/toggle-like", Some("not-a-jwt"), json!({ "subjectId": id }))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (_, subject) = srv.get(&format!("/api/subjects/{id}"), None).await;
    assert_eq!(subject["likes"], 0);
}

#[tokio::test]
async fn toggle_like_flips_and_reports_status() {
    let srv = TestServer::spawn().await;
    let id = srv.create_subject(&mint_jwt("owner", vec![]), "Pulse").await;
    let fan = mint_jwt("fan", vec![]);

    let (status, body) = srv.post("/api/toggle-like", Some(&fan), json!({ "subjectId": id })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "liked": true, "totalLikes": 1 }));

    let (_, status_body) = srv.get(&format!("/api/like-status?subjectId={id}"), Some(&fan)).await;
    assert_eq!(status_body["liked"], true);

    let (_, likes) = srv.get("/api/user-likes", Some(&fan)).await;
    assert_eq!(likes.as_array().unwrap().len(), 1);
    assert_eq!(likes[0]["id"], id.as_str());

    let (_, body) = srv.post("/api/toggle-like", Some(&fan), json!({ "subjectId": id })).await;
    assert_eq!(body, json!({ "liked": false, "totalLikes": 0 }));

    let (_, likes) = srv.get("/api/user-likes", Some(&fan)).await;
    assert!(likes.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn counts_and_popular_reflect_interactions() {
    let srv = TestServer::spawn().await;
    let owner = mint_jwt("owner", vec![]);
    let quiet = srv.create_subject(&owner, "quiet").await;
    let hot = srv.create_subject(&owner, "hot").await;

    for ip in ["198.51.100.1", "198.51.100.2"] {
        srv.client
            .post(srv.url("/api/record-download"))
            .header("x-forwarded-for", ip)
            .json(&json!({ "subjectId": hot }))
            .send()
            .await
            .unwrap();
    }

    let (status, counts) = srv
        .post("/api/subjects/counts", None, json!({ "ids": [quiet, hot, "ghost"] }))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(counts[&hot]["downloads"], 2);
    assert_eq!(counts[&quiet]["downloads"], 0);
    assert_eq!(counts["ghost"], json!({ "views": 0, "downloads": 0, "likes": 0 }));

    let (_, popular) = srv.get("/api/popular?limit=1", None).await;
    assert_eq!(popular.as_array().unwrap().len(), 1);
    assert_eq!(popular[0]["id"], hot.as_str());
}

#[tokio::test]
async fn only_owner_or_admin_may_delete() {
    let srv = TestServer::spawn().await;
    let owner = mint_jwt("owner", vec![]);
    let id = srv.create_subject(&owner, "Pulse").await;

    let res = srv
        .client
        .delete(srv.url(&format!("/api/subjects/{id}")))
        .bearer_auth(mint_jwt("stranger", vec![]))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::FORBIDDEN);

    let res = srv
        .client
        .delete(srv.url(&format!("/api/subjects/{id}")))
        .bearer_auth(mint_jwt("ops", vec![Role::ADMIN]))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NO_CONTENT);

    let (status, _) = srv.get(&format!("/api/subjects/{id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn admin_routes_require_admin() {
    let mut config = ApiConfig::for_tests(SECRET);
    config.admin_actor_ids = vec![ActorId::parse("root").unwrap()];
    let srv = TestServer::spawn_with(config).await;

    let (status, _) = srv.get("/api/admin/cache-stats", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = srv.get("/api/admin/cache-stats", Some(&mint_jwt("someone", vec![]))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "forbidden");

    let (status, body) = srv.get("/api/admin/cache-stats", Some(&mint_jwt("root", vec![]))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["enabled"], true);

    let (status, _) = srv
        .get("/api/admin/stats", Some(&mint_jwt("ops", vec![Role::ADMIN])))
        .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn sync_counts_reports_and_paginates() {
    let srv = TestServer::spawn().await;
    let owner = mint_jwt("owner", vec![]);
    let admin = mint_jwt("ops", vec![Role::ADMIN]);
    let a = srv.create_subject(&owner, "a").await;
    srv.create_subject(&owner, "b").await;
    srv.create_subject(&owner, "c").await;
    srv.view_from(&a, "203.0.113.7").await;
    srv.view_from(&a, "203.0.113.8").await;

    let (status, body) = srv
        .post("/api/admin/sync-counts", Some(&admin), json!({ "subjectId": a }))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["checked"], 1);
    assert_eq!(body["corrected"], 0);
    assert_eq!(body["report"]["views"], 2);

    let (_, page) = srv
        .post("/api/admin/sync-counts", Some(&admin), json!({ "batchSize": 2 }))
        .await;
    assert_eq!(page["checked"], 2);
    let cursor = page["nextCursor"].as_str().unwrap().to_string();

    let (_, rest) = srv
        .post(
            "/api/admin/sync-counts",
            Some(&admin),
            json!({ "batchSize": 2, "cursor": cursor }),
        )
        .await;
    assert_eq!(rest["checked"], 1);
    assert!(rest["nextCursor"].is_null());

    let (status, _) = srv
        .post("/api/admin/sync-counts", Some(&admin), json!({ "subjectId": "ghost" }))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn sync_counts_rejects_a_malformed_body() {
    let srv = TestServer::spawn().await;
    let admin = mint_jwt("ops", vec![Role::ADMIN]);
    srv.create_subject(&admin, "a").await;

    let (status, body) = srv
        .post("/api/admin/sync-counts", Some(&admin), json!({ "subjectId": 5 }))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_body");

    let (status, body) = srv
        .post("/api/admin/sync-counts", Some(&admin), json!({ "batchSize": "ten" }))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_body");

    // No body at all audits the first page.
    let status = srv
        .client
        .post(srv.url("/api/admin/sync-counts"))
        .bearer_auth(&admin)
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn clear_cache_drops_entries() {
    let srv = TestServer::spawn().await;
    let admin = mint_jwt("ops", vec![Role::ADMIN]);
    let id = srv.create_subject(&admin, "Pulse").await;
    srv.get(&format!("/api/subjects/{id}"), None).await;

    let (_, stats) = srv.get("/api/admin/cache-stats", Some(&admin)).await;
    assert!(stats["entries"].as_u64().unwrap() >= 1);

    let (status, body) = srv.post("/api/admin/clear-cache", Some(&admin), json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["cleared"].as_u64().unwrap() >= 1);

    let (_, stats) = srv.get("/api/admin/cache-stats", Some(&admin)).await;
    assert_eq!(stats["entries"], 0);
}
