use crate::domain_model::*;

#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    #[error("invalid policy: limit and window must be positive (got {limit}/{window_secs}s)")]
    InvalidPolicy { limit: u64, window_secs: u64 },
    #[error("rate limit key must have a scope and an identifier")]
    InvalidKey,
}

#[async_trait::async_trait]
pub trait RateLimitService: Send + Sync {
    /// Count one request against `key` and decide whether it is admitted.
    ///
    /// Only malformed input is an error. An exceeded limit is a normal
    /// decision with `allowed == false`, and store failures fail open.
    async fn check(
        &self,
        key: &RateLimitKey,
        policy: RateLimitPolicy,
    ) -> Result<RateLimitDecision, RateLimitError>;
}
