use crate::domain_model::*;
use crate::domain_port::AuthBackendError;
use std::sync::Arc;

/// Invoked with `expired = true` when the held session can no longer be kept alive.
pub type SessionExpiryListener = Arc<dyn Fn(bool) + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("auth backend error: {0}")]
    Backend(#[from] AuthBackendError),
}

#[async_trait::async_trait]
pub trait SessionService: Send + Sync {
    fn state(&self) -> SessionState;
    fn get_current_session(&self) -> Option<Session>;
    /// Returns whether the held session was refreshed. Concurrent callers
    /// share a single in-flight attempt.
    async fn refresh_session(&self) -> bool;
    fn add_session_expiry_listener(&self, listener: SessionExpiryListener) -> ListenerId;
    fn remove_session_expiry_listener(&self, id: ListenerId) -> bool;
    async fn sign_in(&self, credentials: &Credentials) -> Result<Session, SessionError>;
    async fn sign_out(&self) -> Result<(), SessionError>;
}
