use super::handler;
use super::rate_limit::with_rate_limit;
use crate::server::*;
use crate::settings::{AUTH_SCOPE, DEFAULT_SCOPE};
use std::convert::Infallible;
use std::sync::Arc;
use warp::Filter;

pub fn routes(
    server: Arc<Server>,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    let default_limit = with_rate_limit(
        server.rate_limiter.clone(),
        server.clock.clone(),
        DEFAULT_SCOPE,
        server.policies.default,
    );
    let auth_limit = with_rate_limit(
        server.rate_limiter.clone(),
        server.clock.clone(),
        AUTH_SCOPE,
        server.policies.auth,
    );

    let health = warp::get()
        .and(warp::path("health"))
        .and(warp::path::end())
        .and(default_limit.clone())
        .and_then(handler::health);

    let session = warp::get()
        .and(warp::path("session"))
        .and(warp::path::end())
        .and(default_limit)
        .and(with(server.session_service.clone()))
        .and_then(handler::session_status);

    let login = warp::post()
        .and(warp::path!("session" / "login"))
        .and(auth_limit.clone())
        .and(warp::body::json())
        .and(with(server.session_service.clone()))
        .and_then(handler::login);

    let refresh = warp::post()
        .and(warp::path!("session" / "refresh"))
        .and(auth_limit.clone())
        .and(with(server.session_service.clone()))
        .and_then(handler::refresh);

    let logout = warp::post()
        .and(warp::path!("session" / "logout"))
        .and(auth_limit)
        .and(with(server.session_service.clone()))
        .and_then(handler::logout);

    health.or(session).or(login).or(refresh).or(logout)
}

fn with<ServiceType>(
    service: Arc<ServiceType>,
) -> impl Filter<Extract = (Arc<ServiceType>,), Error = Infallible> + Clone
where
    ServiceType: Send + Sync + ?Sized,
{
    warp::any().map(move || service.clone())
}
