use crate::domain_model::*;
use tokio::sync::broadcast;

#[derive(Debug, Clone, thiserror::Error)]
pub enum AuthBackendError {
    #[error("no session is held")]
    NoSession,
    #[error("rejected by auth backend: {0}")]
    Rejected(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("auth backend did not answer in time")]
    Timeout,
}

/// The identity provider that issues, refreshes and revokes sessions.
///
/// The backend is the source of truth for the session; it may drop the
/// session at any time and announces every change on `subscribe`.
#[async_trait::async_trait]
pub trait AuthBackend: Send + Sync {
    async fn get_session(&self) -> Result<Option<Session>, AuthBackendError>;
    async fn sign_in(&self, credentials: &Credentials) -> Result<Session, AuthBackendError>;
    async fn refresh_session(&self) -> Result<Session, AuthBackendError>;
    async fn sign_out(&self) -> Result<(), AuthBackendError>;
    /// Dropping the receiver unsubscribes.
    fn subscribe(&self) -> broadcast::Receiver<SessionEvent>;
}
