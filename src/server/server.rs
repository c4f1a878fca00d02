use crate::application_impl::*;
use crate::application_port::*;
use crate::domain_model::*;
use crate::domain_port::*;
use crate::infra_gotrue::*;
use crate::infra_memory::*;
use crate::infra_redis::*;
use crate::logger::*;
use crate::settings::{AUTH_SCOPE, DEFAULT_SCOPE, Settings};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const FAKE_SESSION_TTL_HOURS: i64 = 1;

#[derive(Debug, Clone, Copy)]
pub struct ScopePolicies {
    pub default: RateLimitPolicy,
    pub auth: RateLimitPolicy,
}

pub struct Server {
    pub rate_limiter: Arc<dyn RateLimitService>,
    pub session_service: Arc<dyn SessionService>,
    pub policies: ScopePolicies,
    pub clock: Arc<dyn Clock>,
    coordinator: SessionRefreshCoordinator,
    sweeper_handle: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl Server {
    pub async fn try_new(settings: &Settings) -> anyhow::Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let cancel = CancellationToken::new();
        let mut sweeper_handle = None;

        let store: Option<Arc<dyn CounterStore>> = match settings.rate_limit.backend.as_str() {
            "redis" => {
                let url = settings
                    .rate_limit
                    .redis_url
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("rate_limit.redis_url is not set"))?;
                let store = RedisCounterStore::open(url, settings.rate_limit.key_prefix.clone())?;
                if let Err(e) = store.ensure_connected().await {
                    warn!(error = %e, "redis unreachable, admitting requests until it reconnects");
                }
                Some(Arc::new(store))
            }
            "memory" => {
                let store = Arc::new(MemoryCounterStore::new(clock.clone()));
                let period = Duration::from_secs(settings.rate_limit.sweep_interval_secs);
                sweeper_handle = Some(tokio::spawn(sweep_expired(
                    store.clone(),
                    period,
                    cancel.clone(),
                )));
                Some(store)
            }
            "none" => None,
            other => return Err(anyhow::anyhow!("Unknown rate limit backend: {}", other)),
        };
        let rate_limiter: Arc<dyn RateLimitService> =
            Arc::new(FixedWindowRateLimiter::new(store, clock.clone()));

        let auth_backend: Arc<dyn AuthBackend> = match settings.auth.backend.as_str() {
            "fake" => Arc::new(FakeAuthBackend::new(
                clock.clone(),
                chrono::Duration::hours(FAKE_SESSION_TTL_HOURS),
            )),
            "gotrue" => Arc::new(GoTrueAuthBackend::new(
                GoTrueConfig {
                    url: settings.auth.url.clone(),
                    api_key: settings.auth.api_key.clone(),
                    request_timeout: Duration::from_secs(settings.auth.request_timeout_secs),
                },
                clock.clone(),
            )?),
            other => return Err(anyhow::anyhow!("Unknown auth backend: {}", other)),
        };

        let coordinator = SessionRefreshCoordinator::new(
            auth_backend,
            clock.clone(),
            settings.session.to_config(),
        );
        let state = coordinator.initialize().await;
        coordinator.add_session_expiry_listener(Arc::new(|expired: bool| {
            if expired {
                warn!("session expired, sign in again to resume");
            }
        }));

        if let (SessionState::Idle, Some(email), Some(password)) =
            (state, &settings.auth.email, &settings.auth.password)
        {
            let credentials = Credentials {
                email: email.clone(),
                password: password.clone(),
            };
            if let Err(e) = coordinator.sign_in(&credentials).await {
                warn!(error = %e, "startup sign-in failed");
            }
        }

        let policies = ScopePolicies {
            default: settings.rate_limit.policy(DEFAULT_SCOPE)?,
            auth: settings.rate_limit.policy(AUTH_SCOPE)?,
        };

        info!("server started");

        Ok(Self {
            rate_limiter,
            session_service: Arc::new(coordinator.clone()),
            policies,
            clock,
            coordinator,
            sweeper_handle: Mutex::new(sweeper_handle),
            cancel,
        })
    }

    /// Assemble a server from ready-made parts, without background sweeping.
    pub fn from_parts(
        rate_limiter: Arc<dyn RateLimitService>,
        coordinator: SessionRefreshCoordinator,
        policies: ScopePolicies,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            rate_limiter,
            session_service: Arc::new(coordinator.clone()),
            policies,
            clock,
            coordinator,
            sweeper_handle: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    pub async fn shutdown(&self) {
        info!("server shutting down...");

        self.cancel.cancel();

        let sweeper = match self.sweeper_handle.lock() {
            Ok(mut lock) => lock.take(),
            Err(_) => None,
        };
        if let Some(handle) = sweeper {
            let r = handle.await;
            info!("sweeper handle dropped: {:?}", r);
        }

        self.coordinator.shutdown().await;
    }
}

async fn sweep_expired(store: Arc<MemoryCounterStore>, period: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("counter sweeper shutting down...");
                break;
            }
            _ = ticker.tick() => {
                let removed = store.purge_expired();
                if removed > 0 {
                    trace!(removed, remaining = store.len(), "purged expired counters");
                }
            }
        }
    }
}
