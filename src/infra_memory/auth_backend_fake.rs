use crate::domain_model::*;
use crate::domain_port::*;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 16;

/// An auth backend that issues fake tokens in-process.
///
/// Refresh behaviour is scriptable so callers can simulate revoked refresh
/// tokens and slow networks.
pub struct FakeAuthBackend {
    clock: Arc<dyn Clock>,
    session_ttl: chrono::Duration,
    session: Mutex<Option<Session>>,
    fail_refresh: AtomicBool,
    refresh_delay_ms: AtomicU64,
    refresh_calls: AtomicUsize,
    generation: AtomicU64,
    events: broadcast::Sender<SessionEvent>,
}

impl FakeAuthBackend {
    pub fn new(clock: Arc<dyn Clock>, session_ttl: chrono::Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            clock,
            session_ttl,
            session: Mutex::new(None),
            fail_refresh: AtomicBool::new(false),
            refresh_delay_ms: AtomicU64::new(0),
            refresh_calls: AtomicUsize::new(0),
            generation: AtomicU64::new(0),
            events,
        }
    }

    /// Seed a session silently, as if it had been restored from storage.
    pub fn with_session(self, session: Session) -> Self {
        *self.lock() = Some(session);
        self
    }

    pub fn set_fail_refresh(&self, fail: bool) {
        self.fail_refresh.store(fail, Ordering::SeqCst);
    }

    pub fn set_refresh_delay(&self, delay: Duration) {
        self.refresh_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    /// Drop the session on the backend side and announce it.
    pub fn revoke(&self) {
        *self.lock() = None;
        let _ = self.events.send(SessionEvent::SignedOut);
    }

    /// Announce `event` without changing the held session.
    pub fn publish(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    pub fn issue(&self, user_id: UserId) -> Session {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        Session {
            user_id,
            access_token: AccessToken(format!("fake-access-token:{}:{}", user_id, generation)),
            refresh_token: RefreshToken(format!("fake-refresh-token:{}:{}", user_id, generation)),
            expires_at: self.clock.now() + self.session_ttl,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub fn fake_user_id(email: &str) -> UserId {
    UserId(uuid::Uuid::new_v5(
        &uuid::Uuid::NAMESPACE_OID,
        email.as_bytes(),
    ))
}

#[async_trait::async_trait]
impl AuthBackend for FakeAuthBackend {
    async fn get_session(&self) -> Result<Option<Session>, AuthBackendError> {
        Ok(self.lock().clone())
    }

    async fn sign_in(&self, credentials: &Credentials) -> Result<Session, AuthBackendError> {
        if credentials.email.is_empty() || credentials.password.is_empty() {
            return Err(AuthBackendError::Rejected("invalid login credentials".into()));
        }
        let session = self.issue(fake_user_id(&credentials.email));
        *self.lock() = Some(session.clone());
        let _ = self.events.send(SessionEvent::SignedIn(session.clone()));
        Ok(session)
    }

    async fn refresh_session(&self) -> Result<Session, AuthBackendError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);

        let delay = self.refresh_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        if self.fail_refresh.load(Ordering::SeqCst) {
            return Err(AuthBackendError::Rejected("refresh token revoked".into()));
        }

        let user_id = match self.lock().as_ref() {
            Some(session) => session.user_id,
            None => return Err(AuthBackendError::NoSession),
        };
        let session = self.issue(user_id);
        *self.lock() = Some(session.clone());
        let _ = self.events.send(SessionEvent::TokenRefreshed(session.clone()));
        Ok(session)
    }

    async fn sign_out(&self) -> Result<(), AuthBackendError> {
        *self.lock() = None;
        let _ = self.events.send(SessionEvent::SignedOut);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra_memory::ManualClock;

    fn backend() -> FakeAuthBackend {
        FakeAuthBackend::new(Arc::new(ManualClock::default()), chrono::Duration::hours(1))
    }

    fn credentials() -> Credentials {
        Credentials {
            email: "alice@example.com".into(),
            password: "hunter2".into(),
        }
    }

    #[tokio::test]
    async fn refresh_rotates_tokens_and_announces_it() {
        let backend = backend();
        let mut events = backend.subscribe();
        let first = backend.sign_in(&credentials()).await.unwrap();
        assert!(matches!(events.recv().await.unwrap(), SessionEvent::SignedIn(_)));

        let second = backend.refresh_session().await.unwrap();
        assert_eq!(first.user_id, second.user_id);
        assert_ne!(first.refresh_token, second.refresh_token);
        assert!(matches!(events.recv().await.unwrap(), SessionEvent::TokenRefreshed(_)));
        assert_eq!(backend.refresh_calls(), 1);
    }

    #[tokio::test]
    async fn refresh_without_session_is_an_error() {
        let backend = backend();
        let err = backend.refresh_session().await.unwrap_err();
        assert!(matches!(err, AuthBackendError::NoSession));
    }

    #[tokio::test]
    async fn scripted_failure_rejects_refresh() {
        let backend = backend();
        backend.sign_in(&credentials()).await.unwrap();
        backend.set_fail_refresh(true);
        let err = backend.refresh_session().await.unwrap_err();
        assert!(matches!(err, AuthBackendError::Rejected(_)));
    }

    #[tokio::test]
    async fn sign_in_rejects_empty_password() {
        let backend = backend();
        let err = backend
            .sign_in(&Credentials {
                email: "alice@example.com".into(),
                password: String::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AuthBackendError::Rejected(_)));
        assert!(backend.get_session().await.unwrap().is_none());
    }
}
