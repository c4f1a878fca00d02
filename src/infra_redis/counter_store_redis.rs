use crate::domain_port::*;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisError, Script};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::{info, warn};

const CAPPED_INCR: &str = include_str!("capped_incr.lua");
const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

/// Counter store on Redis. The connection is opened on first use; while
/// Redis is unreachable calls fail fast and a new attempt is made once
/// the backoff has passed.
pub struct RedisCounterStore {
    client: redis::Client,
    conn: OnceCell<ConnectionManager>,
    backoff: Backoff,
    prefix: String,
    script: Script,
}

impl RedisCounterStore {
    /// Parse `url` without connecting.
    pub fn open(url: &str, prefix: impl Into<String>) -> anyhow::Result<Self> {
        Ok(RedisCounterStore {
            client: redis::Client::open(url)?,
            conn: OnceCell::new(),
            backoff: Backoff::new(RECONNECT_BACKOFF),
            prefix: prefix.into(),
            script: Script::new(CAPPED_INCR),
        })
    }

    pub async fn connect(url: &str, prefix: impl Into<String>) -> anyhow::Result<Self> {
        let store = Self::open(url, prefix)?;
        store.ensure_connected().await?;
        Ok(store)
    }

    pub async fn ensure_connected(&self) -> Result<(), CounterStoreError> {
        self.connection().await.map(|_| ())
    }

    pub fn is_connected(&self) -> bool {
        self.conn.initialized()
    }

    async fn connection(&self) -> Result<ConnectionManager, CounterStoreError> {
        if let Some(conn) = self.conn.get() {
            return Ok(conn.clone());
        }
        if !self.backoff.ready(Instant::now()) {
            return Err(CounterStoreError::Unavailable(
                "waiting to reconnect to redis".to_string(),
            ));
        }
        match self
            .conn
            .get_or_try_init(|| self.client.get_connection_manager())
            .await
        {
            Ok(conn) => {
                info!("connected to redis");
                Ok(conn.clone())
            }
            Err(e) => {
                warn!(error = %e, retry_in = ?RECONNECT_BACKOFF, "redis connection failed");
                self.backoff.failed(Instant::now());
                Err(store_error(e))
            }
        }
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }
}

/// Earliest time the next connection attempt may run.
struct Backoff {
    delay: Duration,
    next_attempt: Mutex<Option<Instant>>,
}

impl Backoff {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            next_attempt: Mutex::new(None),
        }
    }

    fn ready(&self, now: Instant) -> bool {
        let next_attempt = self.next_attempt.lock().unwrap_or_else(PoisonError::into_inner);
        next_attempt.is_none_or(|at| now >= at)
    }

    fn failed(&self, now: Instant) {
        *self.next_attempt.lock().unwrap_or_else(PoisonError::into_inner) = Some(now + self.delay);
    }
}

fn store_error(e: RedisError) -> CounterStoreError {
    if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout() {
        CounterStoreError::Unavailable(e.to_string())
    } else {
        CounterStoreError::Store(e.to_string())
    }
}

/// `PTTL` replies -2 for a missing key and -1 for a key without expiry.
fn ttl_from_pttl(millis: i64) -> Option<Duration> {
    u64::try_from(millis).ok().map(Duration::from_millis)
}

#[async_trait::async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment(&self, key: &str, ceiling: u64) -> Result<u64, CounterStoreError> {
        let key = self.key(key);
        let mut conn = self.connection().await?;
        let value: i64 = self
            .script
            .key(&key)
            .arg(ceiling)
            .invoke_async(&mut conn)
            .await
            .map_err(store_error)?;
        u64::try_from(value).map_err(|e| CounterStoreError::Store(e.to_string()))
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, CounterStoreError> {
        let key = self.key(key);
        let mut conn = self.connection().await?;
        let millis: i64 = conn.pttl(&key).await.map_err(store_error)?;
        Ok(ttl_from_pttl(millis))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), CounterStoreError> {
        let key = self.key(key);
        let mut conn = self.connection().await?;
        let millis = i64::try_from(ttl.as_millis()).map_err(|e| CounterStoreError::Store(e.to_string()))?;
        let _: bool = conn.pexpire(&key, millis).await.map_err(store_error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn backoff_holds_attempts_until_delay_passes() {
        let backoff = Backoff::new(Duration::from_secs(5));
        assert!(backoff.ready(Instant::now()));

        backoff.failed(Instant::now());
        assert!(!backoff.ready(Instant::now()));

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(!backoff.ready(Instant::now()));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(backoff.ready(Instant::now()));
    }

    #[test]
    fn open_parses_without_connecting() {
        let store = RedisCounterStore::open("redis://127.0.0.1:1/", "rl").unwrap();
        assert!(!store.is_connected());
        assert_eq!(store.key("auth:ip:1.2.3.4"), "rl:auth:ip:1.2.3.4");
        assert!(RedisCounterStore::open("not a url", "rl").is_err());
    }

    #[test]
    fn negative_pttl_replies_mean_no_ttl() {
        assert_eq!(ttl_from_pttl(-2), None);
        assert_eq!(ttl_from_pttl(-1), None);
        assert_eq!(ttl_from_pttl(1_500), Some(Duration::from_millis(1_500)));
    }
}
