//! Walks through one fixed window: five admitted calls, a rejected sixth,
//! and a fresh window once the first has elapsed.
//!
//! $ cargo run --bin rate_limit_demo
//! $ cargo run --bin rate_limit_demo -- redis://127.0.0.1:6379

use std::sync::Arc;
use std::time::Duration;
use turnstile::application_impl::FixedWindowRateLimiter;
use turnstile::application_port::RateLimitService;
use turnstile::domain_model::{RateLimitKey, RateLimitPolicy};
use turnstile::domain_port::{Clock, CounterStore, SystemClock};
use turnstile::infra_memory::{ManualClock, MemoryCounterStore};
use turnstile::infra_redis::RedisCounterStore;
use turnstile::logger::*;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _logger = Logger::new_bootstrap();

    let key = RateLimitKey::new("demo", "ip:1.2.3.4");
    let policy = RateLimitPolicy::new(5, 2);

    let redis_url = std::env::args().nth(1);
    let manual = Arc::new(ManualClock::default());
    let (clock, store): (Arc<dyn Clock>, Arc<dyn CounterStore>) = match redis_url {
        Some(url) => {
            let store = RedisCounterStore::connect(&url, format!("demo:{}", uuid::Uuid::new_v4())).await?;
            (Arc::new(SystemClock), Arc::new(store))
        }
        None => (manual.clone(), Arc::new(MemoryCounterStore::new(manual.clone()))),
    };
    let limiter = FixedWindowRateLimiter::new(Some(store), clock);

    for call in 1..=6 {
        let decision = limiter.check(&key, policy).await?;
        info!(call, allowed = decision.allowed, remaining = decision.remaining, reset_at = %decision.reset_at);
    }

    // Redis keeps real time; the in-memory run advances its clock instead.
    manual.advance(chrono::Duration::seconds(3));
    tokio::time::sleep(Duration::from_millis(2_100)).await;

    let decision = limiter.check(&key, policy).await?;
    info!(call = 7, allowed = decision.allowed, remaining = decision.remaining, "after the window");
    Ok(())
}
