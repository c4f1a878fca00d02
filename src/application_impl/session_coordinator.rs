use crate::application_port::*;
use crate::domain_model::*;
use crate::domain_port::*;
use dashmap::DashMap;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub poll_interval: Duration,
    pub refresh_threshold: Duration,
    /// Upper bound on a single refresh call; hitting it counts as a failed refresh.
    pub refresh_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            refresh_threshold: Duration::from_secs(5 * 60),
            refresh_timeout: Duration::from_secs(10),
        }
    }
}

type RefreshFuture = Shared<BoxFuture<'static, bool>>;

struct PollTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct State {
    phase: SessionState,
    session: Option<Session>,
    /// Bumped whenever the held session is replaced or dropped by anything
    /// other than a refresh.
    generation: u64,
    /// Refresh token of the session that last expired.
    expired: Option<RefreshToken>,
    in_flight: Option<RefreshFuture>,
    poll: Option<PollTask>,
}

impl State {
    fn stop_polling(&mut self) -> Option<PollTask> {
        let task = self.poll.take()?;
        task.cancel.cancel();
        Some(task)
    }
}

struct Inner {
    backend: Arc<dyn AuthBackend>,
    clock: Arc<dyn Clock>,
    config: SessionConfig,
    state: Mutex<State>,
    listeners: DashMap<ListenerId, SessionExpiryListener>,
    next_listener_id: AtomicU64,
    shutdown: CancellationToken,
    subscription: Mutex<Option<JoinHandle<()>>>,
}

/// Keeps one authenticated session alive by refreshing it shortly before it
/// expires, and tells registered listeners when that is no longer possible.
///
/// Cloning yields another handle to the same coordinator. Background work
/// (the poll loop and the backend subscription) stops on [`shutdown`] or
/// when the last handle is dropped.
///
/// [`shutdown`]: SessionRefreshCoordinator::shutdown
#[derive(Clone)]
pub struct SessionRefreshCoordinator {
    inner: Arc<Inner>,
}

impl SessionRefreshCoordinator {
    pub fn new(backend: Arc<dyn AuthBackend>, clock: Arc<dyn Clock>, config: SessionConfig) -> Self {
        let inner = Inner {
            backend,
            clock,
            config,
            state: Mutex::new(State {
                phase: SessionState::Uninitialized,
                session: None,
                generation: 0,
                expired: None,
                in_flight: None,
                poll: None,
            }),
            listeners: DashMap::new(),
            next_listener_id: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
            subscription: Mutex::new(None),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Load the backend's current session and start following its changes.
    /// Calling it again after the first time is a no-op.
    pub async fn initialize(&self) -> SessionState {
        if self.inner.lock().phase != SessionState::Uninitialized {
            warn!("session coordinator already initialized");
            return self.state();
        }

        // Subscribe before reading so a change in between is not lost.
        let events = self.inner.backend.subscribe();
        let session = match self.inner.backend.get_session().await {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "could not load current session, starting signed out");
                None
            }
        };

        let handle = tokio::spawn(watch_session_events(
            Arc::downgrade(&self.inner),
            events,
            self.inner.shutdown.child_token(),
        ));
        if let Some(previous) = self.inner.lock_subscription().replace(handle) {
            previous.abort();
        }

        match session {
            Some(session) => self.inner.activate(session),
            None => self.inner.deactivate(),
        }
        self.state()
    }

    /// One poll cycle: refresh if the session is about to expire, expire it
    /// if it already has. Does nothing unless a session is active.
    pub async fn tick(&self) {
        self.inner.tick().await;
    }

    pub async fn shutdown(&self) {
        info!("session coordinator shutting down...");
        self.inner.shutdown.cancel();

        let poll = self.inner.lock().stop_polling();
        if let Some(task) = poll {
            let _ = task.handle.await;
        }
        let subscription = self.inner.lock_subscription().take();
        if let Some(handle) = subscription {
            let _ = handle.await;
        }
    }
}

#[async_trait::async_trait]
impl SessionService for SessionRefreshCoordinator {
    fn state(&self) -> SessionState {
        self.inner.lock().phase
    }

    fn get_current_session(&self) -> Option<Session> {
        let state = self.inner.lock();
        if state.phase.holds_session() {
            state.session.clone()
        } else {
            None
        }
    }

    async fn refresh_session(&self) -> bool {
        self.inner.refresh().await
    }

    fn add_session_expiry_listener(&self, listener: SessionExpiryListener) -> ListenerId {
        let id = ListenerId(self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed));
        self.inner.listeners.insert(id, listener);
        id
    }

    fn remove_session_expiry_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(&id).is_some()
    }

    async fn sign_in(&self, credentials: &Credentials) -> Result<Session, SessionError> {
        let session = self.inner.backend.sign_in(credentials).await?;
        self.inner.activate(session.clone());
        Ok(session)
    }

    async fn sign_out(&self) -> Result<(), SessionError> {
        let result = self.inner.backend.sign_out().await;
        self.inner.deactivate();
        result.map_err(SessionError::from)
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_subscription(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Hold `session` and make sure the poll loop runs.
    fn activate(self: &Arc<Self>, session: Session) {
        let mut state = self.lock();
        let previous = state.phase;
        state.session = Some(session);
        state.phase = SessionState::Active;
        state.generation += 1;
        state.expired = None;

        if state.poll.is_none() && !self.shutdown.is_cancelled() {
            let cancel = self.shutdown.child_token();
            let handle = tokio::spawn(poll_loop(
                Arc::downgrade(self),
                cancel.clone(),
                self.config.poll_interval,
            ));
            state.poll = Some(PollTask { cancel, handle });
        }

        if previous != state.phase {
            info!(from = %previous, to = %state.phase, "session state changed");
        }
    }

    /// Drop the session without notifying listeners; used for sign-out.
    fn deactivate(&self) {
        let mut state = self.lock();
        let previous = state.phase;
        state.phase = SessionState::Idle;
        state.session = None;
        state.generation += 1;
        state.stop_polling();
        if previous != SessionState::Idle {
            info!(from = %previous, to = %state.phase, "session state changed");
        }
    }

    /// Terminal for the current session: stop polling and tell every
    /// listener, at most once per session.
    fn expire(&self, reason: &str) {
        {
            let mut state = self.lock();
            if state.phase == SessionState::Expired {
                return;
            }
            let previous = state.phase;
            state.phase = SessionState::Expired;
            state.expired = state.session.take().map(|session| session.refresh_token);
            state.generation += 1;
            state.stop_polling();
            warn!(from = %previous, reason, "session expired");
        }

        let listeners: Vec<SessionExpiryListener> = self
            .listeners
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for listener in listeners {
            listener(true);
        }
    }

    /// Align with the backend after missed events. A backend that still holds
    /// the session which already expired here does not revive it.
    fn resync(self: &Arc<Self>, session: Option<Session>) {
        let Some(session) = session else {
            self.deactivate();
            return;
        };
        let stale = {
            let state = self.lock();
            state.phase == SessionState::Expired
                && state.expired.as_ref() == Some(&session.refresh_token)
        };
        if stale {
            debug!("backend still reports the expired session, staying expired");
        } else {
            self.activate(session);
        }
    }

    fn adopt_refreshed(&self, session: Session) {
        let mut state = self.lock();
        if state.phase.holds_session() {
            debug!(expires_at = %session.expires_at, "adopting refreshed session");
            state.session = Some(session);
        }
    }

    async fn tick(self: &Arc<Self>) {
        let remaining = {
            let state = self.lock();
            if state.phase != SessionState::Active {
                return;
            }
            match &state.session {
                Some(session) => session.time_until_expiry(self.clock.now()),
                None => return,
            }
        };

        if remaining <= chrono::Duration::zero() {
            self.expire("expiry passed before a refresh was attempted");
            return;
        }

        let threshold = chrono::Duration::from_std(self.config.refresh_threshold)
            .unwrap_or(chrono::Duration::MAX);
        if remaining < threshold {
            debug!(remaining_secs = remaining.num_seconds(), "session close to expiry, refreshing");
            self.refresh().await;
        }
    }

    async fn refresh(self: &Arc<Self>) -> bool {
        let in_flight = {
            let mut state = self.lock();
            if let Some(in_flight) = state.in_flight.clone() {
                in_flight
            } else {
                if !state.phase.holds_session() {
                    debug!(state = %state.phase, "no session to refresh");
                    return false;
                }
                state.phase = SessionState::Refreshing;
                // The attempt runs on its own task so it settles even if
                // every caller stops waiting for it.
                let task = tokio::spawn(self.clone().run_refresh(state.generation));
                let attempt = async move { task.await.unwrap_or(false) }.boxed().shared();
                state.in_flight = Some(attempt.clone());
                attempt
            }
        };
        in_flight.await
    }

    async fn run_refresh(self: Arc<Self>, generation: u64) -> bool {
        let result = match tokio::time::timeout(
            self.config.refresh_timeout,
            self.backend.refresh_session(),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(AuthBackendError::Timeout),
        };

        let failure = {
            let mut state = self.lock();
            state.in_flight = None;
            // A sign-in, sign-out or resync raced the attempt; its outcome wins.
            if state.generation != generation {
                debug!(state = %state.phase, "session changed during refresh, discarding result");
                return false;
            }
            match result {
                Ok(session) => {
                    info!(expires_at = %session.expires_at, "session refreshed");
                    state.phase = SessionState::Active;
                    state.session = Some(session);
                    return true;
                }
                Err(e) => e,
            }
        };

        warn!(error = %failure, "session refresh failed");
        self.expire("refresh failed");
        false
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn poll_loop(inner: Weak<Inner>, cancel: CancellationToken, period: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let Some(inner) = inner.upgrade() else { break };
                inner.tick().await;
            }
        }
    }
    debug!("session poll loop stopped");
}

async fn watch_session_events(
    inner: Weak<Inner>,
    mut events: broadcast::Receiver<SessionEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        let Some(inner) = inner.upgrade() else { break };

        match event {
            Ok(SessionEvent::SignedIn(session)) => inner.activate(session),
            Ok(SessionEvent::TokenRefreshed(session)) => inner.adopt_refreshed(session),
            Ok(SessionEvent::SignedOut) => inner.deactivate(),
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "missed session events, resynchronising");
                match inner.backend.get_session().await {
                    Ok(session) => inner.resync(session),
                    Err(e) => warn!(error = %e, "resynchronisation failed"),
                }
            }
            Err(RecvError::Closed) => break,
        }
    }
    debug!("session event subscription closed");
}
