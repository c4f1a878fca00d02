use std::time::Duration;

/// Shared fixed-window counters.
///
/// Implementations must make `increment` atomic per key: concurrent callers
/// never observe the same post-increment value.
#[async_trait::async_trait]
pub trait CounterStore: Send + Sync {
    /// Add one to the counter at `key` unless it already equals `ceiling`.
    /// Returns the value after the operation. An absent key counts as zero.
    async fn increment(&self, key: &str, ceiling: u64) -> Result<u64, CounterStoreError>;

    /// Remaining lifetime of `key`, or `None` when the key is absent or has
    /// no expiry.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, CounterStoreError>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), CounterStoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum CounterStoreError {
    #[error("counter store unavailable: {0}")]
    Unavailable(String),
    #[error("store error: {0}")]
    Store(String),
}
