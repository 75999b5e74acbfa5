//! Auth and quota enforcement through the real router.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::ServiceExt;

use jengu::auth::rate_limit::SlidingWindowLimiter;
use jengu::auth::{hash_key, Authenticator, NoSessionAuth};
use jengu::config::AppConfig;
use jengu::progress::ProgressBus;
use jengu::queue::memory::MemoryQueue;
use jengu::server::{build_router, ServerState};
use jengu::store::memory::MemoryStore;
use jengu::store::Store;
use jengu::types::ApiKeyRecord;

use crate::mocks::{api_key, paris_property};

async fn router_with_key(key: ApiKeyRecord) -> (axum::Router, Arc<MemoryStore>) {
    let config = Arc::new(AppConfig::for_tests());
    let store = Arc::new(MemoryStore::new());
    store.insert_api_key(&key).await.unwrap();
    store.put_property(&paris_property("prop-1")).await.unwrap();

    let (auth, _writer) =
        Authenticator::new(store.clone(), &config.auth.key_prefix, Arc::new(NoSessionAuth));
    let state = Arc::new(ServerState {
        config,
        store: store.clone(),
        queue: Arc::new(MemoryQueue::new(120)),
        bus: Arc::new(ProgressBus::new()),
        auth: Arc::new(auth),
        limiter: Arc::new(SlidingWindowLimiter::new()),
    });
    (build_router(state), store)
}

fn status_request(key: &str) -> Request<Body> {
    Request::builder()
        .uri("/enrichment/status/prop-1")
        .header("x-api-key", key)
        .header("x-forwarded-for", "203.0.113.9")
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn test_minute_quota_accepts_60_rejects_61st() {
    // Quota 60/minute: the 61st request inside the window is rejected.
    let mut key = api_key("key-s4", &["enrichment:read"]);
    key.key_hash = hash_key("jen_s4");
    key.quota_per_minute = 60;
    key.quota_per_hour = 10_000;
    key.quota_per_day = 100_000;
    let (app, _store) = router_with_key(key).await;

    for i in 0..60 {
        let resp = app.clone().oneshot(status_request("jen_s4")).await.unwrap();
        assert_ne!(
            resp.status(),
            StatusCode::TOO_MANY_REQUESTS,
            "request {i} should pass"
        );
    }

    let resp = app.oneshot(status_request("jen_s4")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);

    let retry_after: u64 = resp
        .headers()
        .get("Retry-After")
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(retry_after > 0 && retry_after <= 60);

    let bytes = axum::body::to_bytes(resp.into_body(), 100_000).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(json["error"], "RATE_LIMIT_EXCEEDED");
    assert_eq!(json["details"]["window"], "minute");
}

#[tokio::test]
async fn test_scope_matrix() {
    // [pricing:*, read:reports] passes pricing:read but not admin:keys.
    let key = api_key("key-s5", &["pricing:*", "read:reports"]);
    assert!(key.has_scope("pricing:read"));
    assert!(key.has_scope("pricing:write"));
    assert!(key.has_scope("read:reports"));
    assert!(!key.has_scope("admin:keys"));
    assert!(!key.has_scope("enrichment:read"));

    // A key without enrichment scope is 403 on the status route.
    let mut stored = key.clone();
    stored.key_hash = hash_key("jen_s5");
    let (app, _store) = router_with_key(stored).await;
    let resp = app.oneshot(status_request("jen_s5")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    let bytes = axum::body::to_bytes(resp.into_body(), 100_000).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(json["message"], "insufficient_scope");
}

#[tokio::test]
async fn test_expired_key_rejected_with_401() {
    let mut key = api_key("key-exp", &["enrichment:read"]);
    key.key_hash = hash_key("jen_expired");
    key.expires_at = Some(chrono::Utc::now() - chrono::Duration::minutes(1));
    let (app, _store) = router_with_key(key).await;

    let resp = app.oneshot(status_request("jen_expired")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_ip_allowlist_through_router() {
    let mut key = api_key("key-ip", &["enrichment:read"]);
    key.key_hash = hash_key("jen_ipbound");
    key.allowed_ips = vec!["10.1.2.3".to_string()];
    let (app, _store) = router_with_key(key).await;

    // Wrong source IP.
    let resp = app.clone().oneshot(status_request("jen_ipbound")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    // Right source IP.
    let request = Request::builder()
        .uri("/enrichment/status/prop-1")
        .header("x-api-key", "jen_ipbound")
        .header("x-forwarded-for", "10.1.2.3")
        .body(Body::empty())
        .unwrap();
    let resp = app.oneshot(request).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_usage_records_flow_to_store() {
    let mut key = api_key("key-usage", &["enrichment:read"]);
    key.key_hash = hash_key("jen_usage");
    let (app, store) = router_with_key(key).await;

    let resp = app.oneshot(status_request("jen_usage")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    // Usage is written off the request path.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let records = store.usage_records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].key_id, "key-usage");
    assert_eq!(records[0].method, "GET");
    assert_eq!(records[0].status, 200);
    assert_eq!(records[0].ip, "203.0.113.9");
}
