use super::error::*;
use crate::application_port::*;
use crate::domain_model::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use warp::{self, reject};

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<ApiError>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        ApiResponse {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(code: ApiErrorCode, message: impl Into<String>) -> Self {
        ApiResponse {
            success: false,
            data: None,
            error: Some(ApiError {
                code,
                message: message.into(),
            }),
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

pub async fn health() -> Result<impl warp::Reply, warp::Rejection> {
    Ok(warp::reply::json(&ApiResponse::ok(HealthResponse { status: "ok" })))
}

#[derive(Debug, Serialize)]
struct SessionStatusResponse {
    state: SessionState,
    user_id: Option<UserId>,
    expires_at: Option<DateTime<Utc>>,
}

pub async fn session_status(
    session_service: Arc<dyn SessionService>,
) -> Result<impl warp::Reply, warp::Rejection> {
    let session = session_service.get_current_session();
    let response = SessionStatusResponse {
        state: session_service.state(),
        user_id: session.as_ref().map(|s| s.user_id),
        expires_at: session.as_ref().map(|s| s.expires_at),
    };
    Ok(warp::reply::json(&ApiResponse::ok(response)))
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
struct LoginResponse {
    user_id: UserId,
    expires_at: DateTime<Utc>,
}

pub async fn login(
    request: LoginRequest,
    session_service: Arc<dyn SessionService>,
) -> Result<impl warp::Reply, warp::Rejection> {
    let credentials = Credentials {
        email: request.email,
        password: request.password,
    };
    let session = session_service
        .sign_in(&credentials)
        .await
        .map_err(ApiErrorCode::from)
        .map_err(reject::custom)?;

    Ok(warp::reply::json(&ApiResponse::ok(LoginResponse {
        user_id: session.user_id,
        expires_at: session.expires_at,
    })))
}

#[derive(Debug, Serialize)]
struct RefreshResponse {
    refreshed: bool,
    expires_at: Option<DateTime<Utc>>,
}

pub async fn refresh(
    session_service: Arc<dyn SessionService>,
) -> Result<impl warp::Reply, warp::Rejection> {
    let refreshed = session_service.refresh_session().await;
    let expires_at = session_service
        .get_current_session()
        .map(|session| session.expires_at);
    Ok(warp::reply::json(&ApiResponse::ok(RefreshResponse {
        refreshed,
        expires_at,
    })))
}

#[derive(Debug, Serialize)]
struct LogoutResponse {
    state: SessionState,
}

pub async fn logout(
    session_service: Arc<dyn SessionService>,
) -> Result<impl warp::Reply, warp::Rejection> {
    session_service
        .sign_out()
        .await
        .map_err(ApiErrorCode::from)
        .map_err(reject::custom)?;
    Ok(warp::reply::json(&ApiResponse::ok(LogoutResponse {
        state: session_service.state(),
    })))
}
