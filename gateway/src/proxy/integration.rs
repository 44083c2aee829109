//! End-to-end pipeline tests, in the spirit of the teacher's
//! `proxy/tests.rs`: a real (loopback) upstream server, a real
//! `ProxyEngine` wired over `MemStore`, driven the way an actual caller
//! would. Only the upstream timeout test uses an injected short-timeout
//! client (`ProxyEngine::with_client`) so it doesn't block the suite for
//! 30 real seconds.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderMap, Method, StatusCode};
use axum::routing::get;
use bytes::Bytes;
use chrono::Utc;
use clap::Parser;

use crate::bot::BotClassifier;
use crate::config::AppConfig;
use crate::error::GatewayError;
use crate::ids::ServiceId;
use crate::key_directory::KeyDirectory;
use crate::limiter::Limiter;
use crate::model::{ApiKey, Service};
use crate::store::{MemStore, Store};
use crate::transparency::{AnchorHandle, TransparencyLog};

use super::{ProxyEngine, ProxyRequest};

async fn spawn_upstream() -> SocketAddr {
    let app = axum::Router::new()
        .route(
            "/ok",
            get(|| async {
                (
                    [(axum::http::header::CONTENT_TYPE, "application/json")],
                    r#"{"temperature":72}"#,
                )
            }),
        )
        .route(
            "/plain",
            get(|| async { ([(axum::http::header::CONTENT_TYPE, "text/plain")], "hello") }),
        )
        .route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "too late"
            }),
        );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

struct Harness {
    engine: ProxyEngine,
    store: Arc<MemStore>,
    service: Service,
    key: ApiKey,
}

async fn harness(upstream_addr: SocketAddr, bot_blocking_enabled: bool, watermarking_enabled: bool) -> Harness {
    let store = Arc::new(MemStore::new());
    let service = Service {
        id: ServiceId(1),
        name: "weather-api".into(),
        target_url: format!("http://{upstream_addr}"),
        owner_id: 1,
        watermarking_enabled,
        bot_blocking_enabled,
        bot_threshold: Service::DEFAULT_BOT_THRESHOLD,
    };
    store.seed_service(service.clone());
    let key = ApiKey {
        id: crate::ids::ApiKeyId(1),
        secret: "sk_live_test_key_0123456789".into(),
        service_id: service.id,
        is_active: true,
        created_at: Utc::now(),
        rate_limit_requests: Some(3),
        rate_limit_window_seconds: Some(60),
        price_per_request: 0.01,
        total_cost: 0.0,
    };
    store.seed_api_key(key.clone());

    let config = AppConfig::parse_from(["gateway"]);
    let store_dyn: Arc<dyn Store> = store.clone();
    let key_directory = Arc::new(KeyDirectory::new(store_dyn.clone()));
    let limiter = Arc::new(Limiter::new(&config));
    let bot_classifier = Arc::new(BotClassifier::new(store_dyn.clone()));
    let transparency = Arc::new(TransparencyLog::new(store_dyn.clone(), AnchorHandle::disabled(), &config));
    let engine = ProxyEngine::new(store_dyn, key_directory, limiter, bot_classifier, transparency);

    Harness { engine, store, service, key }
}

fn browser_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(axum::http::header::USER_AGENT, "Mozilla/5.0 Chrome Safari".parse().unwrap());
    for name in ["accept", "accept-language", "accept-encoding", "referer"] {
        headers.insert(
            axum::http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
            "present".parse().unwrap(),
        );
    }
    headers
}

fn request(service_id: ServiceId, path: &str, secret: Option<&str>) -> ProxyRequest {
    ProxyRequest {
        service_id,
        method: Method::GET,
        path_suffix: path.to_string(),
        query: None,
        headers: browser_headers(),
        body: Bytes::new(),
        api_key_secret: secret.map(str::to_string),
    }
}

#[tokio::test]
async fn happy_path_proxies_and_bills_and_commits() {
    let addr = spawn_upstream().await;
    let h = harness(addr, false, true).await;

    let resp = h
        .engine
        .handle(request(h.service.id, "ok", Some(&h.key.secret)))
        .await
        .unwrap();

    assert_eq!(resp.status, StatusCode::OK);
    let body: serde_json::Value = serde_json::from_slice(&resp.body).unwrap();
    assert_eq!(body["temperature"], 72);
    assert!(body["_gaas_watermark"].is_string());

    assert_eq!(h.store.count_usage_since(&h.key.secret, Utc::now() - chrono::Duration::seconds(5)).await.unwrap(), 1);
}

#[tokio::test]
async fn unknown_service_is_not_found() {
    let addr = spawn_upstream().await;
    let h = harness(addr, false, false).await;

    let err = h
        .engine
        .handle(request(ServiceId(999), "ok", Some(&h.key.secret)))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::ServiceNotFound(999)));
}

#[tokio::test]
async fn missing_api_key_is_unauthenticated() {
    let addr = spawn_upstream().await;
    let h = harness(addr, false, false).await;

    let err = h.engine.handle(request(h.service.id, "ok", None)).await.unwrap_err();
    assert!(matches!(err, GatewayError::Unauthenticated));
}

#[tokio::test]
async fn scope_mismatch_is_forbidden() {
    let addr = spawn_upstream().await;
    let h = harness(addr, false, false).await;
    h.store.seed_service(Service {
        id: ServiceId(2),
        name: "other".into(),
        target_url: format!("http://{addr}"),
        owner_id: 1,
        watermarking_enabled: false,
        bot_blocking_enabled: false,
        bot_threshold: Service::DEFAULT_BOT_THRESHOLD,
    });

    let err = h
        .engine
        .handle(request(ServiceId(2), "ok", Some(&h.key.secret)))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::ForbiddenScope));
}

#[tokio::test]
async fn bot_blocked_when_blocking_enabled_and_ua_is_a_script() {
    let addr = spawn_upstream().await;
    let h = harness(addr, true, false).await;

    let mut req = request(h.service.id, "ok", Some(&h.key.secret));
    req.headers = HeaderMap::new();
    req.headers
        .insert(axum::http::header::USER_AGENT, "python-requests/2.31.0".parse().unwrap());

    let err = h.engine.handle(req).await.unwrap_err();
    assert!(matches!(err, GatewayError::ForbiddenBot));
}

#[tokio::test]
async fn rate_limit_denies_once_capacity_is_exhausted() {
    let addr = spawn_upstream().await;
    let h = harness(addr, false, false).await;

    for _ in 0..3 {
        h.engine
            .handle(request(h.service.id, "ok", Some(&h.key.secret)))
            .await
            .unwrap();
    }
    let err = h
        .engine
        .handle(request(h.service.id, "ok", Some(&h.key.secret)))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::RateLimited));
}

#[tokio::test]
async fn pre_dispatch_rejections_never_enter_the_transparency_chain() {
    // spec.md §3/§4.6: a `RequestHash` is committed only for requests
    // that reached upstream dispatch. Scope mismatch, bot blocking, and
    // rate limiting all terminate the pipeline before that point.
    let addr = spawn_upstream().await;
    let h = harness(addr, true, false).await;
    h.store.seed_service(Service {
        id: ServiceId(2),
        name: "other".into(),
        target_url: format!("http://{addr}"),
        owner_id: 1,
        watermarking_enabled: false,
        bot_blocking_enabled: false,
        bot_threshold: Service::DEFAULT_BOT_THRESHOLD,
    });

    let scope_err = h
        .engine
        .handle(request(ServiceId(2), "ok", Some(&h.key.secret)))
        .await
        .unwrap_err();
    assert!(matches!(scope_err, GatewayError::ForbiddenScope));

    let mut bot_req = request(h.service.id, "ok", Some(&h.key.secret));
    bot_req.headers = HeaderMap::new();
    bot_req
        .headers
        .insert(axum::http::header::USER_AGENT, "python-requests/2.31.0".parse().unwrap());
    let bot_err = h.engine.handle(bot_req).await.unwrap_err();
    assert!(matches!(bot_err, GatewayError::ForbiddenBot));

    for _ in 0..3 {
        h.engine
            .handle(request(h.service.id, "ok", Some(&h.key.secret)))
            .await
            .unwrap();
    }
    let rate_err = h
        .engine
        .handle(request(h.service.id, "ok", Some(&h.key.secret)))
        .await
        .unwrap_err();
    assert!(matches!(rate_err, GatewayError::RateLimited));

    // Only the 3 successful dispatches committed a hash; the three
    // rejections above did not.
    let committed = h.store.oldest_unbatched_hashes(10).await.unwrap();
    assert_eq!(committed.len(), 3);
    assert!(committed.iter().all(|r| r.response_status == 200));
}

#[tokio::test]
async fn upstream_connection_refused_maps_to_bad_gateway() {
    // Port 1 is reserved and will refuse the connection immediately.
    let h = harness("127.0.0.1:1".parse().unwrap(), false, false).await;

    let err = h
        .engine
        .handle(request(h.service.id, "ok", Some(&h.key.secret)))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::UpstreamUnreachable(_)));
}

#[tokio::test]
async fn upstream_timeout_maps_to_504_and_still_commits_a_hash() {
    // spec.md §8 scenario 7. Uses a short client timeout instead of a
    // real 35s upstream delay.
    let addr = spawn_upstream().await;
    let h = harness(addr, false, false).await;

    let short_timeout_client = reqwest::Client::builder()
        .timeout(Duration::from_millis(200))
        .connect_timeout(Duration::from_millis(200))
        .build()
        .unwrap();
    let store_dyn: Arc<dyn Store> = h.store.clone();
    let config = AppConfig::parse_from(["gateway"]);
    let engine = ProxyEngine::with_client(
        store_dyn.clone(),
        Arc::new(KeyDirectory::new(store_dyn.clone())),
        Arc::new(Limiter::new(&config)),
        Arc::new(BotClassifier::new(store_dyn.clone())),
        Arc::new(TransparencyLog::new(store_dyn, AnchorHandle::disabled(), &config)),
        short_timeout_client,
    );

    let err = engine
        .handle(request(h.service.id, "slow", Some(&h.key.secret)))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::UpstreamTimeout));

    let committed = h.store.oldest_unbatched_hashes(10).await.unwrap();
    assert_eq!(committed.iter().filter(|r| r.response_status == 504).count(), 1);
}
