use super::error::{ApiErrorCode, RateLimited};
use crate::application_port::RateLimitService;
use crate::domain_model::{RateLimitKey, RateLimitPolicy};
use crate::domain_port::Clock;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;
use warp::{Filter, Rejection, reject};

/// Admit the request under `policy` for `scope`, or reject it with [`RateLimited`].
pub fn with_rate_limit(
    limiter: Arc<dyn RateLimitService>,
    clock: Arc<dyn Clock>,
    scope: &'static str,
    policy: RateLimitPolicy,
) -> impl Filter<Extract = (), Error = Rejection> + Clone {
    client_identifier()
        .and_then(move |identifier: String| {
            let limiter = limiter.clone();
            let clock = clock.clone();
            async move {
                let key = RateLimitKey::new(scope, identifier);
                let decision = limiter
                    .check(&key, policy)
                    .await
                    .map_err(ApiErrorCode::from)
                    .map_err(reject::custom)?;
                if decision.allowed {
                    Ok(())
                } else {
                    debug!(%key, reset_at = %decision.reset_at, "request rate limited");
                    Err(reject::custom(RateLimited {
                        retry_after_secs: decision.retry_after_secs(clock.now()),
                        decision,
                    }))
                }
            }
        })
        .untuple_one()
}

pub fn client_identifier() -> impl Filter<Extract = (String,), Error = Rejection> + Clone {
    warp::header::optional::<String>("x-forwarded-for")
        .and(warp::addr::remote())
        .map(|forwarded: Option<String>, remote: Option<SocketAddr>| {
            identify_client(forwarded.as_deref(), remote)
        })
}

/// First `X-Forwarded-For` hop, else the peer address.
pub fn identify_client(forwarded: Option<&str>, remote: Option<SocketAddr>) -> String {
    let forwarded = forwarded
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty());
    match (forwarded, remote) {
        (Some(ip), _) => format!("ip:{}", ip),
        (None, Some(addr)) => format!("ip:{}", addr.ip()),
        (None, None) => "ip:unknown".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwarded_header_wins_over_peer() {
        let peer: SocketAddr = "10.0.0.1:5555".parse().unwrap();
        assert_eq!(identify_client(Some("1.2.3.4, 10.0.0.9"), Some(peer)), "ip:1.2.3.4");
        assert_eq!(identify_client(Some("  "), Some(peer)), "ip:10.0.0.1");
        assert_eq!(identify_client(None, Some(peer)), "ip:10.0.0.1");
        assert_eq!(identify_client(None, None), "ip:unknown");
    }
}
