//! Integration tests for the Goodnight Check-in Server API
//!
//! These tests verify the complete request/response cycle for all endpoints.

use axum::{
    body::Body,
    http::{Request, StatusCode},
    routing::{get, post},
    Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

use goodnight_checkin_server::db::{decode, tables};
use goodnight_checkin_server::models::SlotDailyRollup;
use goodnight_checkin_server::{open_database, AppState, Config, Db};

// Test configuration constants
const ADMIN_KEY: &str = "test-admin-key";

// =============================================================================
// Test Helpers
// =============================================================================

/// Create a test configuration
fn test_config() -> Config {
    Config {
        server_host: "127.0.0.1".to_string(),
        server_port: 0,                // Random port
        database_path: "".to_string(), // Will be set per test
        allowed_origins: vec!["http://localhost:5173".to_string()],
        environment: "test".to_string(),
        admin_secret_key: Some(ADMIN_KEY.to_string()),
        reaction_consume_interval_secs: 0,
    }
}

/// Create a test database in a temporary directory
fn create_test_db(temp_dir: &TempDir) -> Db {
    let db_path = temp_dir.path().join("test.db");
    open_database(&db_path).expect("Failed to create test database")
}

/// Create a test app router
fn create_test_app(db: Db) -> Router {
    use goodnight_checkin_server::routes::*;

    let state = AppState {
        db,
        config: test_config(),
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/api/user/ensure", post(ensure_user_handler))
        .route("/api/user/profile", post(update_profile))
        .route("/api/checkin", post(submit_checkin).get(get_checkin))
        .route("/api/friend/request", post(send_request))
        .route("/api/friend/resolve", post(resolve_request))
        .route("/api/friend/remove", post(remove_friend))
        .route("/api/friend/list", get(list_friends))
        .route("/api/friend/requests", get(list_requests))
        .route("/api/goodnight", post(submit_message))
        .route("/api/goodnight/random", get(pick_random))
        .route("/api/goodnight/react", post(react))
        .route("/api/query", post(execute_query))
        .route("/api/jobs/reactions", post(consume_reactions_handler))
        .route("/api/jobs/rollup", post(rollup_handler))
        .route("/admin/stats", get(admin_stats))
        .with_state(state)
}

/// Parse response body as JSON
async fn body_to_json(body: Body) -> Value {
    let bytes = body.collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

/// Create a POST request with JSON body and a caller identity
fn make_post(uri: &str, identity: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .header("x-identity-key", identity)
        .body(Body::from(body.to_string()))
        .unwrap()
}

/// Create a POST request without an identity header
fn make_anonymous_post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

/// Create a GET request with a caller identity
fn make_get(uri: &str, identity: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("x-identity-key", identity)
        .body(Body::empty())
        .unwrap()
}

/// Ensure a user exists and return its uid
async fn setup_user(db: Db, identity: &str) -> String {
    let app = create_test_app(db);
    let response = app
        .oneshot(make_post("/api/user/ensure", identity, json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_to_json(response.into_body()).await;
    assert_eq!(body["code"], "OK");
    body["user"]["uid"].as_str().unwrap().to_string()
}

/// Submit a check-in for the given identity and return the response body
async fn submit_checkin_for(db: Db, identity: &str, date: &str, status: &str) -> Value {
    let app = create_test_app(db);
    let response = app
        .oneshot(make_post(
            "/api/checkin",
            identity,
            json!({ "date": date, "status": status }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    body_to_json(response.into_body()).await
}

/// Submit a goodnight message and return its id
async fn submit_message_for(db: Db, identity: &str, date: &str, text: &str) -> String {
    let app = create_test_app(db);
    let response = app
        .oneshot(make_post(
            "/api/goodnight",
            identity,
            json!({ "date": date, "text": text }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_to_json(response.into_body()).await;
    body["messageId"].as_str().unwrap().to_string()
}

// =============================================================================
// Health Check Tests
// =============================================================================

#[tokio::test]
async fn test_health_check_returns_healthy() {
    let temp_dir = TempDir::new().unwrap();
    let db = create_test_db(&temp_dir);
    let app = create_test_app(db);

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let body = body_to_json(response.into_body()).await;
    assert_eq!(body["code"], "OK");
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["database"], "connected");
    assert!(body["version"].as_str().is_some());
}

// =============================================================================
// Identity Tests
// =============================================================================

#[tokio::test]
async fn test_ensure_user_creates_once() {
    let temp_dir = TempDir::new().unwrap();
    let db = create_test_db(&temp_dir);

    let app = create_test_app(db.clone());
    let response = app
        .oneshot(make_post(
            "/api/user/ensure",
            "identity-a",
            json!({ "nickname": "early bird", "targetTime": "22:00" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_to_json(response.into_body()).await;
    assert_eq!(body["created"], true);
    assert_eq!(body["user"]["nickname"], "early bird");
    assert_eq!(body["user"]["slotKey"], "22:00");
    assert_eq!(body["user"]["streak"], 0);
    let uid = body["user"]["uid"].as_str().unwrap().to_string();
    assert!(uid.len() >= 8 && uid.len() <= 10);

    // Second call returns the same user unchanged; overrides are ignored
    let app = create_test_app(db);
    let response = app
        .oneshot(make_post(
            "/api/user/ensure",
            "identity-a",
            json!({ "nickname": "night owl" }),
        ))
        .await
        .unwrap();
    let body = body_to_json(response.into_body()).await;
    assert_eq!(body["created"], false);
    assert_eq!(body["user"]["nickname"], "early bird");
    assert_eq!(body["user"]["uid"], uid.as_str());
}

#[tokio::test]
async fn test_missing_identity_is_unauthorized() {
    let temp_dir = TempDir::new().unwrap();
    let db = create_test_db(&temp_dir);
    let app = create_test_app(db);

    let response = app
        .oneshot(make_anonymous_post(
            "/api/checkin",
            json!({ "date": "20240101", "status": "hit" }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_to_json(response.into_body()).await;
    assert_eq!(body["code"], "UNAUTHORIZED");
}

// =============================================================================
// Check-in Ledger Tests
// =============================================================================

#[tokio::test]
async fn test_streak_progression() {
    let temp_dir = TempDir::new().unwrap();
    let db = create_test_db(&temp_dir);
    setup_user(db.clone(), "identity-a").await;

    // First ever check-in
    let body = submit_checkin_for(db.clone(), "identity-a", "20240101", "hit").await;
    assert_eq!(body["duplicate"], false);
    assert_eq!(body["record"]["status"], "hit");

    // Consecutive day
    submit_checkin_for(db.clone(), "identity-a", "20240102", "hit").await;

    // Skipped 20240103
    submit_checkin_for(db.clone(), "identity-a", "20240104", "hit").await;

    let app = create_test_app(db);
    let response = app
        .oneshot(make_post("/api/user/ensure", "identity-a", json!({})))
        .await
        .unwrap();
    let body = body_to_json(response.into_body()).await;
    assert_eq!(body["user"]["streak"], 1);
    assert_eq!(body["user"]["totalDays"], 3);
    assert_eq!(body["user"]["lastCheckinDate"], "20240104");
    assert_eq!(body["user"]["todayStatus"], "hit");
}

#[tokio::test]
async fn test_non_hit_resets_streak() {
    let temp_dir = TempDir::new().unwrap();
    let db = create_test_db(&temp_dir);
    setup_user(db.clone(), "identity-a").await;

    submit_checkin_for(db.clone(), "identity-a", "20240101", "hit").await;
    submit_checkin_for(db.clone(), "identity-a", "20240102", "late").await;

    let app = create_test_app(db);
    let response = app
        .oneshot(make_post("/api/user/ensure", "identity-a", json!({})))
        .await
        .unwrap();
    let body = body_to_json(response.into_body()).await;
    assert_eq!(body["user"]["streak"], 0);
    assert_eq!(body["user"]["totalDays"], 2);
}

#[tokio::test]
async fn test_duplicate_checkin_returns_winner() {
    let temp_dir = TempDir::new().unwrap();
    let db = create_test_db(&temp_dir);
    setup_user(db.clone(), "identity-a").await;

    let first = submit_checkin_for(db.clone(), "identity-a", "20240101", "hit").await;
    assert_eq!(first["duplicate"], false);

    // Repeat submission, even with a different status, returns the stored
    // record and never errors
    let second = submit_checkin_for(db.clone(), "identity-a", "20240101", "miss").await;
    assert_eq!(second["duplicate"], true);
    assert_eq!(second["record"]["status"], "hit");

    // Counters were not advanced by the duplicate
    let app = create_test_app(db);
    let response = app
        .oneshot(make_post("/api/user/ensure", "identity-a", json!({})))
        .await
        .unwrap();
    let body = body_to_json(response.into_body()).await;
    assert_eq!(body["user"]["streak"], 1);
    assert_eq!(body["user"]["totalDays"], 1);
}

#[tokio::test]
async fn test_checkin_validation() {
    let temp_dir = TempDir::new().unwrap();
    let db = create_test_db(&temp_dir);
    setup_user(db.clone(), "identity-a").await;

    let app = create_test_app(db.clone());
    let response = app
        .oneshot(make_post(
            "/api/checkin",
            "identity-a",
            json!({ "date": "2024-01-01", "status": "hit" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_to_json(response.into_body()).await;
    assert_eq!(body["code"], "INVALID_ARG");

    let app = create_test_app(db);
    let response = app
        .oneshot(make_post(
            "/api/checkin",
            "identity-a",
            json!({ "date": "20240101", "status": "snoozed" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_get_checkin_absent_is_null() {
    let temp_dir = TempDir::new().unwrap();
    let db = create_test_db(&temp_dir);
    setup_user(db.clone(), "identity-a").await;

    let app = create_test_app(db);
    let response = app
        .oneshot(make_get("/api/checkin?date=20240101", "identity-a"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_to_json(response.into_body()).await;
    assert_eq!(body["code"], "OK");
    assert!(body["record"].is_null());
}

// =============================================================================
// Friend Graph Tests
// =============================================================================

/// Send a request from `from` to `to_uid` and return the request id
async fn send_friend_request(db: Db, from: &str, to_uid: &str) -> String {
    let app = create_test_app(db);
    let response = app
        .oneshot(make_post(
            "/api/friend/request",
            from,
            json!({ "toUid": to_uid }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_to_json(response.into_body()).await;
    body["requestId"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_friend_accept_is_idempotent() {
    let temp_dir = TempDir::new().unwrap();
    let db = create_test_db(&temp_dir);
    let uid_a = setup_user(db.clone(), "identity-a").await;
    let uid_b = setup_user(db.clone(), "identity-b").await;

    let request_id = send_friend_request(db.clone(), "identity-a", &uid_b).await;

    let app = create_test_app(db.clone());
    let response = app
        .oneshot(make_post(
            "/api/friend/resolve",
            "identity-b",
            json!({ "requestId": request_id, "decision": "accepted" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_to_json(response.into_body()).await;
    assert_eq!(body["status"], "accepted");
    let edge_key = body["edgeKey"].as_str().unwrap().to_string();
    let (min, max) = if uid_a <= uid_b {
        (&uid_a, &uid_b)
    } else {
        (&uid_b, &uid_a)
    };
    assert_eq!(edge_key, format!("{}#{}", min, max));

    // Retrying the resolution is a no-op with the same terminal status
    let app = create_test_app(db.clone());
    let response = app
        .oneshot(make_post(
            "/api/friend/resolve",
            "identity-b",
            json!({ "requestId": request_id, "decision": "accepted" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_to_json(response.into_body()).await;
    assert_eq!(body["status"], "accepted");
    assert_eq!(body["edgeKey"], edge_key.as_str());

    // Both sides see each other
    for (identity, other_uid) in [("identity-a", &uid_b), ("identity-b", &uid_a)] {
        let app = create_test_app(db.clone());
        let response = app
            .oneshot(make_get("/api/friend/list", identity))
            .await
            .unwrap();
        let body = body_to_json(response.into_body()).await;
        let friends = body["friends"].as_array().unwrap();
        assert_eq!(friends.len(), 1);
        assert_eq!(friends[0]["uid"], other_uid.as_str());
    }
}

#[tokio::test]
async fn test_friend_request_rejections() {
    let temp_dir = TempDir::new().unwrap();
    let db = create_test_db(&temp_dir);
    let uid_a = setup_user(db.clone(), "identity-a").await;
    let uid_b = setup_user(db.clone(), "identity-b").await;

    // Self-request
    let app = create_test_app(db.clone());
    let response = app
        .oneshot(make_post(
            "/api/friend/request",
            "identity-a",
            json!({ "toUid": uid_a }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Duplicate pending request for the same ordered pair
    send_friend_request(db.clone(), "identity-a", &uid_b).await;
    let app = create_test_app(db.clone());
    let response = app
        .oneshot(make_post(
            "/api/friend/request",
            "identity-a",
            json!({ "toUid": uid_b }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let body = body_to_json(response.into_body()).await;
    assert_eq!(body["code"], "ALREADY_EXISTS");

    // Unknown target
    let app = create_test_app(db);
    let response = app
        .oneshot(make_post(
            "/api/friend/request",
            "identity-a",
            json!({ "toUid": "zz99xx88" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_request_after_friendship_is_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let db = create_test_db(&temp_dir);
    let uid_a = setup_user(db.clone(), "identity-a").await;
    let uid_b = setup_user(db.clone(), "identity-b").await;

    let request_id = send_friend_request(db.clone(), "identity-a", &uid_b).await;
    let app = create_test_app(db.clone());
    app.oneshot(make_post(
        "/api/friend/resolve",
        "identity-b",
        json!({ "requestId": request_id, "decision": "accepted" }),
    ))
    .await
    .unwrap();

    // Either direction is blocked by the symmetric edge
    let app = create_test_app(db);
    let response = app
        .oneshot(make_post(
            "/api/friend/request",
            "identity-b",
            json!({ "toUid": uid_a }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_only_recipient_may_resolve() {
    let temp_dir = TempDir::new().unwrap();
    let db = create_test_db(&temp_dir);
    setup_user(db.clone(), "identity-a").await;
    let uid_b = setup_user(db.clone(), "identity-b").await;
    setup_user(db.clone(), "identity-c").await;

    let request_id = send_friend_request(db.clone(), "identity-a", &uid_b).await;

    let app = create_test_app(db);
    let response = app
        .oneshot(make_post(
            "/api/friend/resolve",
            "identity-c",
            json!({ "requestId": request_id, "decision": "accepted" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_remove_friend_is_idempotent() {
    let temp_dir = TempDir::new().unwrap();
    let db = create_test_db(&temp_dir);
    setup_user(db.clone(), "identity-a").await;
    let uid_b = setup_user(db.clone(), "identity-b").await;

    let request_id = send_friend_request(db.clone(), "identity-a", &uid_b).await;
    let app = create_test_app(db.clone());
    app.oneshot(make_post(
        "/api/friend/resolve",
        "identity-b",
        json!({ "requestId": request_id, "decision": "accepted" }),
    ))
    .await
    .unwrap();

    let app = create_test_app(db.clone());
    let response = app
        .oneshot(make_post(
            "/api/friend/remove",
            "identity-a",
            json!({ "uid": uid_b }),
        ))
        .await
        .unwrap();
    let body = body_to_json(response.into_body()).await;
    assert_eq!(body["removed"], true);

    // Absence is not an error
    let app = create_test_app(db);
    let response = app
        .oneshot(make_post(
            "/api/friend/remove",
            "identity-a",
            json!({ "uid": uid_b }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_to_json(response.into_body()).await;
    assert_eq!(body["removed"], false);
}

#[tokio::test]
async fn test_rejected_request_allows_retry() {
    let temp_dir = TempDir::new().unwrap();
    let db = create_test_db(&temp_dir);
    setup_user(db.clone(), "identity-a").await;
    let uid_b = setup_user(db.clone(), "identity-b").await;

    let request_id = send_friend_request(db.clone(), "identity-a", &uid_b).await;
    let app = create_test_app(db.clone());
    let response = app
        .oneshot(make_post(
            "/api/friend/resolve",
            "identity-b",
            json!({ "requestId": request_id, "decision": "rejected" }),
        ))
        .await
        .unwrap();
    let body = body_to_json(response.into_body()).await;
    assert_eq!(body["status"], "rejected");
    assert!(body["edgeKey"].is_null());

    // The pending slot is free again
    send_friend_request(db, "identity-a", &uid_b).await;
}

// =============================================================================
// Goodnight Pool Tests
// =============================================================================

#[tokio::test]
async fn test_message_submit_is_idempotent() {
    let temp_dir = TempDir::new().unwrap();
    let db = create_test_db(&temp_dir);
    let uid = setup_user(db.clone(), "identity-a").await;

    let first = submit_message_for(db.clone(), "identity-a", "20240101", "sleep tight").await;
    assert_eq!(first, format!("{}_20240101", uid));

    // Duplicate returns the existing id, not an error
    let app = create_test_app(db.clone());
    let response = app
        .oneshot(make_post(
            "/api/goodnight",
            "identity-a",
            json!({ "date": "20240101", "text": "different text" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_to_json(response.into_body()).await;
    assert_eq!(body["duplicate"], true);
    assert_eq!(body["messageId"], first.as_str());
    assert_eq!(body["message"]["text"], "sleep tight");
}

#[tokio::test]
async fn test_empty_message_is_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let db = create_test_db(&temp_dir);
    setup_user(db.clone(), "identity-a").await;

    let app = create_test_app(db);
    let response = app
        .oneshot(make_post(
            "/api/goodnight",
            "identity-a",
            json!({ "date": "20240101", "text": "   " }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_to_json(response.into_body()).await;
    assert_eq!(body["code"], "INVALID_ARG");
}

#[tokio::test]
async fn test_message_links_same_day_checkin() {
    let temp_dir = TempDir::new().unwrap();
    let db = create_test_db(&temp_dir);
    setup_user(db.clone(), "identity-a").await;

    submit_checkin_for(db.clone(), "identity-a", "20240101", "hit").await;
    let message_id = submit_message_for(db.clone(), "identity-a", "20240101", "goodnight").await;

    let app = create_test_app(db);
    let response = app
        .oneshot(make_get("/api/checkin?date=20240101", "identity-a"))
        .await
        .unwrap();
    let body = body_to_json(response.into_body()).await;
    assert_eq!(body["record"]["goodnightMessageId"], message_id.as_str());
}

#[tokio::test]
async fn test_pick_random_fixed_pivot_is_deterministic() {
    let temp_dir = TempDir::new().unwrap();
    let db = create_test_db(&temp_dir);
    setup_user(db.clone(), "identity-a").await;
    setup_user(db.clone(), "identity-b").await;
    setup_user(db.clone(), "identity-c").await;

    submit_message_for(db.clone(), "identity-a", "20240101", "from a").await;
    submit_message_for(db.clone(), "identity-b", "20240101", "from b").await;

    let mut picked = Vec::new();
    for _ in 0..3 {
        let app = create_test_app(db.clone());
        let response = app
            .oneshot(make_get("/api/goodnight/random?pivot=0.5", "identity-c"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_to_json(response.into_body()).await;
        picked.push(body["messageId"].as_str().unwrap().to_string());
    }
    assert_eq!(picked[0], picked[1]);
    assert_eq!(picked[1], picked[2]);
}

#[tokio::test]
async fn test_pick_random_wraps_and_filters() {
    let temp_dir = TempDir::new().unwrap();
    let db = create_test_db(&temp_dir);
    let uid_a = setup_user(db.clone(), "identity-a").await;
    setup_user(db.clone(), "identity-b").await;

    submit_message_for(db.clone(), "identity-a", "20240101", "only message").await;

    // Any pivot finds the single message: if it sorts after the message's
    // rand key, the wraparound query takes over
    for pivot in ["0.0", "0.25", "0.75", "0.999999"] {
        let app = create_test_app(db.clone());
        let response = app
            .oneshot(make_get(
                &format!("/api/goodnight/random?pivot={}", pivot),
                "identity-b",
            ))
            .await
            .unwrap();
        let body = body_to_json(response.into_body()).await;
        assert_eq!(body["message"]["uid"], uid_a.as_str(), "pivot {}", pivot);
    }

    // The submitter's own message is excluded by default
    let app = create_test_app(db.clone());
    let response = app
        .oneshot(make_get("/api/goodnight/random?pivot=0.5", "identity-a"))
        .await
        .unwrap();
    let body = body_to_json(response.into_body()).await;
    assert!(body["message"].is_null());

    // Fresh messages have score 0, so a min-score filter empties the pool
    let app = create_test_app(db);
    let response = app
        .oneshot(make_get(
            "/api/goodnight/random?pivot=0.5&minScore=1",
            "identity-b",
        ))
        .await
        .unwrap();
    let body = body_to_json(response.into_body()).await;
    assert!(body["message"].is_null());
}

// =============================================================================
// Reaction Aggregation Tests
// =============================================================================

async fn react_to(db: Db, identity: &str, message_id: &str, kind: &str) {
    let app = create_test_app(db);
    let response = app
        .oneshot(make_post(
            "/api/goodnight/react",
            identity,
            json!({ "messageId": message_id, "type": kind }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_reactions_fold_into_one_increment() {
    let temp_dir = TempDir::new().unwrap();
    let db = create_test_db(&temp_dir);
    setup_user(db.clone(), "identity-a").await;
    setup_user(db.clone(), "identity-b").await;

    let message_id = submit_message_for(db.clone(), "identity-a", "20240101", "goodnight").await;

    for _ in 0..3 {
        react_to(db.clone(), "identity-b", &message_id, "like").await;
    }
    react_to(db.clone(), "identity-b", &message_id, "dislike").await;

    // The message document is untouched until the consumer runs
    let app = create_test_app(db.clone());
    let response = app
        .oneshot(make_post(
            "/api/query",
            "identity-b",
            json!({
                "kind": "goodnight_messages",
                "action": "doc.get",
                "payload": { "id": message_id }
            }),
        ))
        .await
        .unwrap();
    let body = body_to_json(response.into_body()).await;
    assert_eq!(body["result"]["likes"], 0);

    let app = create_test_app(db.clone());
    let response = app
        .oneshot(make_post(
            &format!("/api/jobs/reactions?key={}", ADMIN_KEY),
            "identity-b",
            json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_to_json(response.into_body()).await;
    assert_eq!(body["consumed"], 4);
    assert_eq!(body["messages"], 1);
    assert_eq!(body["failed"], 0);

    let app = create_test_app(db.clone());
    let response = app
        .oneshot(make_post(
            "/api/query",
            "identity-b",
            json!({
                "kind": "goodnight_messages",
                "action": "doc.get",
                "payload": { "id": message_id }
            }),
        ))
        .await
        .unwrap();
    let body = body_to_json(response.into_body()).await;
    assert_eq!(body["result"]["likes"], 3);
    assert_eq!(body["result"]["dislikes"], 1);
    assert_eq!(body["result"]["score"], 2);

    // Nothing left in the queue for a second pass
    let app = create_test_app(db);
    let response = app
        .oneshot(make_post(
            &format!("/api/jobs/reactions?key={}", ADMIN_KEY),
            "identity-b",
            json!({}),
        ))
        .await
        .unwrap();
    let body = body_to_json(response.into_body()).await;
    assert_eq!(body["consumed"], 0);
}

#[tokio::test]
async fn test_react_to_unknown_message_is_not_found() {
    let temp_dir = TempDir::new().unwrap();
    let db = create_test_db(&temp_dir);
    setup_user(db.clone(), "identity-a").await;

    let app = create_test_app(db);
    let response = app
        .oneshot(make_post(
            "/api/goodnight/react",
            "identity-a",
            json!({ "messageId": "ghost_20240101", "type": "like" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

// =============================================================================
// Slot Rollup Tests
// =============================================================================

#[tokio::test]
async fn test_rollup_is_idempotent() {
    let temp_dir = TempDir::new().unwrap();
    let db = create_test_db(&temp_dir);

    // Three users in the default 22:30 slot: two hits, one miss
    setup_user(db.clone(), "identity-a").await;
    setup_user(db.clone(), "identity-b").await;
    setup_user(db.clone(), "identity-c").await;
    submit_checkin_for(db.clone(), "identity-a", "20240101", "hit").await;
    submit_checkin_for(db.clone(), "identity-b", "20240101", "hit").await;
    submit_checkin_for(db.clone(), "identity-c", "20240101", "miss").await;

    for _ in 0..2 {
        let app = create_test_app(db.clone());
        let response = app
            .oneshot(make_post(
                &format!("/api/jobs/rollup?key={}", ADMIN_KEY),
                "identity-a",
                json!({ "date": "20240101" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_to_json(response.into_body()).await;
        assert_eq!(body["participants"], 3);
        assert_eq!(body["slots"], 1);
    }

    // Overwritten document holds the recomputed ratio
    let read_txn = redb::ReadableDatabase::begin_read(&*db).unwrap();
    let rollups = read_txn.open_table(tables::SLOT_ROLLUPS).unwrap();
    let doc = rollups.get("22:30#20240101").unwrap().unwrap();
    let rollup: SlotDailyRollup = decode(doc.value()).unwrap();
    assert_eq!(rollup.participants, 3);
    assert_eq!(rollup.hits, 2);
    assert_eq!(rollup.hit_rate, 0.6667);
}

#[tokio::test]
async fn test_jobs_require_admin_key() {
    let temp_dir = TempDir::new().unwrap();
    let db = create_test_db(&temp_dir);
    setup_user(db.clone(), "identity-a").await;

    let app = create_test_app(db);
    let response = app
        .oneshot(make_post(
            "/api/jobs/rollup?key=wrong",
            "identity-a",
            json!({ "date": "20240101" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

// =============================================================================
// Query Authorization Proxy Tests
// =============================================================================

#[tokio::test]
async fn test_query_unknown_kind_is_forbidden() {
    let temp_dir = TempDir::new().unwrap();
    let db = create_test_db(&temp_dir);
    setup_user(db.clone(), "identity-a").await;

    let app = create_test_app(db);
    let response = app
        .oneshot(make_post(
            "/api/query",
            "identity-a",
            json!({ "kind": "reaction_events", "action": "collection.get" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = body_to_json(response.into_body()).await;
    assert_eq!(body["code"], "FORBIDDEN");
}

#[tokio::test]
async fn test_query_undeclared_action_is_forbidden() {
    let temp_dir = TempDir::new().unwrap();
    let db = create_test_db(&temp_dir);
    setup_user(db.clone(), "identity-a").await;

    let app = create_test_app(db);
    let response = app
        .oneshot(make_post(
            "/api/query",
            "identity-a",
            json!({
                "kind": "users",
                "action": "doc.remove",
                "payload": { "id": "identity-a" }
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_query_foreign_user_doc_is_forbidden() {
    let temp_dir = TempDir::new().unwrap();
    let db = create_test_db(&temp_dir);
    setup_user(db.clone(), "identity-a").await;
    setup_user(db.clone(), "identity-b").await;

    let app = create_test_app(db.clone());
    let response = app
        .oneshot(make_post(
            "/api/query",
            "identity-a",
            json!({
                "kind": "users",
                "action": "doc.get",
                "payload": { "id": "identity-b" }
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // Own document works
    let app = create_test_app(db);
    let response = app
        .oneshot(make_post(
            "/api/query",
            "identity-a",
            json!({
                "kind": "users",
                "action": "doc.get",
                "payload": { "id": "identity-a" }
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_to_json(response.into_body()).await;
    assert_eq!(body["result"]["id"], "identity-a");
}

#[tokio::test]
async fn test_query_scoped_checkin_collection() {
    let temp_dir = TempDir::new().unwrap();
    let db = create_test_db(&temp_dir);
    let uid_a = setup_user(db.clone(), "identity-a").await;
    setup_user(db.clone(), "identity-b").await;
    submit_checkin_for(db.clone(), "identity-a", "20240101", "hit").await;
    submit_checkin_for(db.clone(), "identity-a", "20240102", "hit").await;
    submit_checkin_for(db.clone(), "identity-b", "20240101", "hit").await;

    let app = create_test_app(db.clone());
    let response = app
        .oneshot(make_post(
            "/api/query",
            "identity-a",
            json!({
                "kind": "checkins",
                "action": "collection.get",
                "payload": {
                    "query": { "op": "eq", "field": "uid", "value": uid_a },
                    "orderBy": { "field": "date", "direction": "desc" }
                }
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_to_json(response.into_body()).await;
    let docs = body["result"].as_array().unwrap();
    assert_eq!(docs.len(), 2);
    assert_eq!(docs[0]["date"], "20240102");
    assert_eq!(docs[1]["date"], "20240101");

    // An unscoped query is rejected even though it would include own rows
    let app = create_test_app(db.clone());
    let response = app
        .oneshot(make_post(
            "/api/query",
            "identity-a",
            json!({
                "kind": "checkins",
                "action": "collection.get",
                "payload": {
                    "query": { "op": "eq", "field": "date", "value": "20240101" }
                }
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // Scoped count
    let app = create_test_app(db);
    let response = app
        .oneshot(make_post(
            "/api/query",
            "identity-a",
            json!({
                "kind": "checkins",
                "action": "collection.count",
                "payload": {
                    "query": { "op": "eq", "field": "uid", "value": uid_a }
                }
            }),
        ))
        .await
        .unwrap();
    let body = body_to_json(response.into_body()).await;
    assert_eq!(body["result"], 2);
}

#[tokio::test]
async fn test_query_field_outside_allow_list_is_forbidden() {
    let temp_dir = TempDir::new().unwrap();
    let db = create_test_db(&temp_dir);
    let uid_a = setup_user(db.clone(), "identity-a").await;

    let app = create_test_app(db);
    let response = app
        .oneshot(make_post(
            "/api/query",
            "identity-a",
            json!({
                "kind": "checkins",
                "action": "collection.get",
                "payload": {
                    "query": {
                        "op": "and",
                        "clauses": [
                            { "op": "eq", "field": "uid", "value": uid_a },
                            { "op": "eq", "field": "timezoneOffsetMinutes", "value": 480 }
                        ]
                    }
                }
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_query_unknown_operator_is_invalid_arg() {
    let temp_dir = TempDir::new().unwrap();
    let db = create_test_db(&temp_dir);
    let uid_a = setup_user(db.clone(), "identity-a").await;

    let app = create_test_app(db);
    let response = app
        .oneshot(make_post(
            "/api/query",
            "identity-a",
            json!({
                "kind": "checkins",
                "action": "collection.get",
                "payload": {
                    "query": { "op": "regex", "field": "uid", "value": uid_a }
                }
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_to_json(response.into_body()).await;
    assert_eq!(body["code"], "INVALID_ARG");
}

#[tokio::test]
async fn test_query_message_counter_patch() {
    let temp_dir = TempDir::new().unwrap();
    let db = create_test_db(&temp_dir);
    setup_user(db.clone(), "identity-a").await;
    setup_user(db.clone(), "identity-b").await;
    let message_id = submit_message_for(db.clone(), "identity-a", "20240101", "goodnight").await;

    // Owner may patch the reaction counters
    let app = create_test_app(db.clone());
    let response = app
        .oneshot(make_post(
            "/api/query",
            "identity-a",
            json!({
                "kind": "goodnight_messages",
                "action": "doc.update",
                "payload": { "id": message_id, "data": { "likes": 7 } }
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_to_json(response.into_body()).await;
    assert_eq!(body["result"]["likes"], 7);
    assert_eq!(body["result"]["score"], 7);

    // A non-owner may not, even with an allowed field
    let app = create_test_app(db.clone());
    let response = app
        .oneshot(make_post(
            "/api/query",
            "identity-b",
            json!({
                "kind": "goodnight_messages",
                "action": "doc.update",
                "payload": { "id": message_id, "data": { "likes": 1000 } }
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // The owner may not patch outside the allow-list
    let app = create_test_app(db);
    let response = app
        .oneshot(make_post(
            "/api/query",
            "identity-a",
            json!({
                "kind": "goodnight_messages",
                "action": "doc.update",
                "payload": { "id": message_id, "data": { "text": "edited" } }
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_query_public_message_reads() {
    let temp_dir = TempDir::new().unwrap();
    let db = create_test_db(&temp_dir);
    setup_user(db.clone(), "identity-a").await;
    setup_user(db.clone(), "identity-b").await;
    submit_message_for(db.clone(), "identity-a", "20240101", "goodnight").await;

    // Anyone authenticated may read the pool without scoping
    let app = create_test_app(db);
    let response = app
        .oneshot(make_post(
            "/api/query",
            "identity-b",
            json!({
                "kind": "goodnight_messages",
                "action": "collection.get",
                "payload": {
                    "query": { "op": "eq", "field": "date", "value": "20240101" }
                }
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_to_json(response.into_body()).await;
    assert_eq!(body["result"].as_array().unwrap().len(), 1);
}

// =============================================================================
// Admin Tests
// =============================================================================

#[tokio::test]
async fn test_admin_stats() {
    let temp_dir = TempDir::new().unwrap();
    let db = create_test_db(&temp_dir);
    setup_user(db.clone(), "identity-a").await;
    submit_checkin_for(db.clone(), "identity-a", "20240101", "hit").await;

    let app = create_test_app(db.clone());
    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/admin/stats?key={}", ADMIN_KEY))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_to_json(response.into_body()).await;
    assert_eq!(body["user_count"], 1);
    assert_eq!(body["checkin_count"], 1);

    let app = create_test_app(db);
    let response = app
        .oneshot(
            Request::builder()
                .uri("/admin/stats?key=wrong")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}
