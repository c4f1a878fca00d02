use crate::domain_model::*;
use crate::domain_port::*;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};

const EVENT_CAPACITY: usize = 16;

#[derive(Debug, Clone)]
pub struct GoTrueConfig {
    /// Project base URL, e.g. `https://xyz.supabase.co`.
    pub url: String,
    pub api_key: String,
    pub request_timeout: Duration,
}

/// Client for a GoTrue-compatible auth REST API. Holds the last session it
/// issued and announces changes on a broadcast channel.
pub struct GoTrueAuthBackend {
    http: reqwest::Client,
    config: GoTrueConfig,
    clock: Arc<dyn Clock>,
    session: Mutex<Option<Session>>,
    events: broadcast::Sender<SessionEvent>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    expires_in: Option<i64>,
    expires_at: Option<i64>,
    user: TokenUser,
}

#[derive(Debug, Deserialize)]
struct TokenUser {
    id: UserId,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorResponse {
    error_description: Option<String>,
    msg: Option<String>,
    message: Option<String>,
}

impl ErrorResponse {
    fn into_message(self, status: StatusCode) -> String {
        self.error_description
            .or(self.msg)
            .or(self.message)
            .unwrap_or_else(|| status.to_string())
    }
}

impl TokenResponse {
    fn into_session(self, now: DateTime<Utc>) -> Result<Session, AuthBackendError> {
        let expires_at = match (self.expires_at, self.expires_in) {
            (Some(at), _) => DateTime::from_timestamp(at, 0).ok_or_else(|| {
                AuthBackendError::InvalidResponse(format!("expires_at out of range: {at}"))
            })?,
            (None, Some(secs)) => now + chrono::Duration::seconds(secs),
            (None, None) => {
                return Err(AuthBackendError::InvalidResponse(
                    "token response has no expiry".into(),
                ));
            }
        };
        Ok(Session {
            user_id: self.user.id,
            access_token: AccessToken(self.access_token),
            refresh_token: RefreshToken(self.refresh_token),
            expires_at,
        })
    }
}

fn transport_error(e: reqwest::Error) -> AuthBackendError {
    if e.is_timeout() {
        AuthBackendError::Timeout
    } else {
        AuthBackendError::Transport(e.to_string())
    }
}

impl GoTrueAuthBackend {
    pub fn new(config: GoTrueConfig, clock: Arc<dyn Clock>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            http,
            config,
            clock,
            session: Mutex::new(None),
            events,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/auth/v1/{}", self.config.url.trim_end_matches('/'), path)
    }

    fn lock(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn grant(&self, grant_type: &str, body: serde_json::Value) -> Result<Session, AuthBackendError> {
        let response = self
            .http
            .post(self.endpoint("token"))
            .query(&[("grant_type", grant_type)])
            .header("apikey", &self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status.is_client_error() {
            let err: ErrorResponse = response.json().await.unwrap_or_default();
            return Err(AuthBackendError::Rejected(err.into_message(status)));
        }
        if !status.is_success() {
            return Err(AuthBackendError::Transport(format!("unexpected status {status}")));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| AuthBackendError::InvalidResponse(e.to_string()))?;
        token.into_session(self.clock.now())
    }
}

#[async_trait::async_trait]
impl AuthBackend for GoTrueAuthBackend {
    async fn get_session(&self) -> Result<Option<Session>, AuthBackendError> {
        Ok(self.lock().clone())
    }

    async fn sign_in(&self, credentials: &Credentials) -> Result<Session, AuthBackendError> {
        let session = self
            .grant(
                "password",
                json!({ "email": credentials.email, "password": credentials.password }),
            )
            .await?;
        debug!(user_id = %session.user_id, "signed in");
        *self.lock() = Some(session.clone());
        let _ = self.events.send(SessionEvent::SignedIn(session.clone()));
        Ok(session)
    }

    async fn refresh_session(&self) -> Result<Session, AuthBackendError> {
        let refresh_token = match self.lock().as_ref() {
            Some(session) => session.refresh_token.0.clone(),
            None => return Err(AuthBackendError::NoSession),
        };
        let session = self
            .grant("refresh_token", json!({ "refresh_token": refresh_token }))
            .await?;
        *self.lock() = Some(session.clone());
        let _ = self.events.send(SessionEvent::TokenRefreshed(session.clone()));
        Ok(session)
    }

    async fn sign_out(&self) -> Result<(), AuthBackendError> {
        let Some(session) = self.lock().take() else {
            return Ok(());
        };
        let _ = self.events.send(SessionEvent::SignedOut);

        // The local session is gone either way; a failed revoke only leaves
        // the refresh token alive on the server until it expires.
        let result = self
            .http
            .post(self.endpoint("logout"))
            .header("apikey", &self.config.api_key)
            .bearer_auth(&session.access_token.0)
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => Ok(()),
            Ok(response) => {
                warn!(status = %response.status(), "logout was not acknowledged");
                Ok(())
            }
            Err(e) => Err(transport_error(e)),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }
}
