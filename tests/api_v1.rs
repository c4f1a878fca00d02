use serde_json::Value;
use std::convert::Infallible;
use std::sync::Arc;
use turnstile::api::v1::{recover_error, routes};
use turnstile::application_impl::*;
use turnstile::application_port::*;
use turnstile::domain_model::*;
use turnstile::domain_port::*;
use turnstile::infra_memory::*;
use turnstile::server::*;
use warp::Filter;
use warp::http::StatusCode;

struct Harness {
    clock: Arc<ManualClock>,
    server: Arc<Server>,
}

async fn harness() -> Harness {
    let clock = Arc::new(ManualClock::default());
    let store: Arc<dyn CounterStore> = Arc::new(MemoryCounterStore::new(clock.clone()));
    let limiter: Arc<dyn RateLimitService> =
        Arc::new(FixedWindowRateLimiter::new(Some(store), clock.clone()));
    let backend = Arc::new(FakeAuthBackend::new(clock.clone(), chrono::Duration::hours(1)));
    let coordinator = SessionRefreshCoordinator::new(backend, clock.clone(), SessionConfig::default());
    coordinator.initialize().await;

    let server = Server::from_parts(
        limiter,
        coordinator,
        ScopePolicies {
            default: RateLimitPolicy::new(3, 60),
            auth: RateLimitPolicy::new(10, 60),
        },
        clock.clone(),
    );
    Harness {
        clock,
        server: Arc::new(server),
    }
}

fn api(server: Arc<Server>) -> impl Filter<Extract = (impl warp::Reply,), Error = Infallible> + Clone {
    warp::path("api")
        .and(warp::path("v1"))
        .and(routes(server))
        .recover(recover_error)
}

fn json(body: &[u8]) -> Value {
    serde_json::from_slice(body).unwrap()
}

fn header<'a>(response: &'a warp::http::Response<warp::hyper::body::Bytes>, name: &str) -> &'a str {
    response.headers().get(name).unwrap().to_str().unwrap()
}

async fn get_health(filter: &(impl Filter<Extract = (impl warp::Reply,), Error = Infallible> + Clone + 'static), ip: &str)
-> warp::http::Response<warp::hyper::body::Bytes> {
    warp::test::request()
        .method("GET")
        .path("/api/v1/health")
        .header("x-forwarded-for", ip)
        .reply(filter)
        .await
}

#[tokio::test]
async fn health_is_served_within_quota() {
    let h = harness().await;
    let filter = api(h.server.clone());

    let response = get_health(&filter, "1.2.3.4").await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json(response.body());
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["status"], "ok");
}

#[tokio::test]
async fn exceeding_quota_returns_429_with_retry_metadata() {
    let h = harness().await;
    let filter = api(h.server.clone());
    let window_started = h.clock.now();

    for _ in 0..3 {
        assert_eq!(get_health(&filter, "1.2.3.4").await.status(), StatusCode::OK);
    }
    let response = get_health(&filter, "1.2.3.4").await;

    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(header(&response, "x-ratelimit-limit"), "3");
    assert_eq!(header(&response, "x-ratelimit-remaining"), "0");
    assert_eq!(
        header(&response, "x-ratelimit-reset"),
        (window_started + chrono::Duration::seconds(60)).timestamp().to_string()
    );
    assert_eq!(header(&response, "retry-after"), "60");

    let body = json(response.body());
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "RateLimited");

    h.clock.advance(chrono::Duration::seconds(45));
    let response = get_health(&filter, "1.2.3.4").await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(header(&response, "retry-after"), "15");
}

#[tokio::test]
async fn each_client_gets_its_own_window() {
    let h = harness().await;
    let filter = api(h.server.clone());

    for _ in 0..3 {
        get_health(&filter, "1.2.3.4").await;
    }
    assert_eq!(get_health(&filter, "1.2.3.4").await.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(get_health(&filter, "5.6.7.8").await.status(), StatusCode::OK);
}

#[tokio::test]
async fn quota_returns_after_the_window() {
    let h = harness().await;
    let filter = api(h.server.clone());

    for _ in 0..4 {
        get_health(&filter, "1.2.3.4").await;
    }
    assert_eq!(get_health(&filter, "1.2.3.4").await.status(), StatusCode::TOO_MANY_REQUESTS);

    h.clock.advance(chrono::Duration::seconds(61));
    assert_eq!(get_health(&filter, "1.2.3.4").await.status(), StatusCode::OK);
}

#[tokio::test]
async fn session_lifecycle_over_http() {
    let h = harness().await;
    let filter = api(h.server.clone());

    let response = warp::test::request()
        .method("GET")
        .path("/api/v1/session")
        .reply(&filter)
        .await;
    assert_eq!(json(response.body())["data"]["state"], "idle");

    let response = warp::test::request()
        .method("POST")
        .path("/api/v1/session/login")
        .json(&serde_json::json!({ "email": "carol@example.com", "password": "pw" }))
        .reply(&filter)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let login = json(response.body());
    assert_eq!(login["data"]["user_id"], fake_user_id("carol@example.com").to_string());

    let response = warp::test::request()
        .method("POST")
        .path("/api/v1/session/refresh")
        .reply(&filter)
        .await;
    assert_eq!(json(response.body())["data"]["refreshed"], true);

    let response = warp::test::request()
        .method("GET")
        .path("/api/v1/session")
        .reply(&filter)
        .await;
    assert_eq!(json(response.body())["data"]["state"], "active");

    let response = warp::test::request()
        .method("POST")
        .path("/api/v1/session/logout")
        .reply(&filter)
        .await;
    assert_eq!(json(response.body())["data"]["state"], "idle");
    assert!(h.server.session_service.get_current_session().is_none());
}

#[tokio::test]
async fn bad_credentials_are_unauthorized() {
    let h = harness().await;
    let filter = api(h.server.clone());

    let response = warp::test::request()
        .method("POST")
        .path("/api/v1/session/login")
        .json(&serde_json::json!({ "email": "carol@example.com", "password": "" }))
        .reply(&filter)
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(json(response.body())["error"]["code"], "InvalidCredentials");
}

#[tokio::test]
async fn refresh_without_session_reports_false() {
    let h = harness().await;
    let filter = api(h.server.clone());

    let response = warp::test::request()
        .method("POST")
        .path("/api/v1/session/refresh")
        .reply(&filter)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json(response.body())["data"]["refreshed"], false);
}

#[tokio::test]
async fn unknown_route_is_not_found() {
    let h = harness().await;
    let filter = api(h.server.clone());

    let response = warp::test::request()
        .method("GET")
        .path("/api/v1/nope")
        .reply(&filter)
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
