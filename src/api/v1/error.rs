use crate::api::v1::handler::ApiResponse;
use crate::application_port::*;
use crate::domain_model::RateLimitDecision;
use crate::domain_port::AuthBackendError;
use serde::Serialize;
use std::convert::Infallible;
use thiserror::Error;
use tracing::warn;
use warp::http::StatusCode;
use warp::reply::Response;
use warp::{Rejection, Reply, reject};

pub async fn recover_error(err: Rejection) -> Result<Response, Infallible> {
    if let Some(limited) = err.find::<RateLimited>() {
        return Ok(limited.to_response());
    }

    if let Some(code) = err.find::<ApiErrorCode>() {
        let json = warp::reply::json(&ApiResponse::<()>::err(code.clone(), code.to_string()));
        return Ok(warp::reply::with_status(json, code.status()).into_response());
    }

    let (code, message) = if err.is_not_found() {
        (ApiErrorCode::NotFound, ApiErrorCode::NotFound.to_string())
    } else if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
        (ApiErrorCode::BadRequest, e.to_string())
    } else if err.find::<reject::MethodNotAllowed>().is_some() {
        (ApiErrorCode::NotFound, ApiErrorCode::NotFound.to_string())
    } else {
        (ApiErrorCode::InternalError, format!("Unhandled error: {:?}", err))
    };
    let status = code.status();
    let json = warp::reply::json(&ApiResponse::<()> {
        success: false,
        data: None,
        error: Some(ApiError { code, message }),
    });
    Ok(warp::reply::with_status(json, status).into_response())
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub code: ApiErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, Error, Serialize)]
pub enum ApiErrorCode {
    #[error("Too many requests")]
    RateLimited,
    #[error("Invalid email or password")]
    InvalidCredentials,
    #[error("Not signed in")]
    NotSignedIn,
    #[error("Malformed request")]
    BadRequest,
    #[error("Not found")]
    NotFound,
    #[error("Internal error")]
    InternalError,
}

impl ApiErrorCode {
    pub fn internal<E: std::fmt::Display>(error: E) -> ApiErrorCode {
        warn!("Internal error: {}", error);
        ApiErrorCode::InternalError
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiErrorCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ApiErrorCode::InvalidCredentials => StatusCode::UNAUTHORIZED,
            ApiErrorCode::NotSignedIn => StatusCode::CONFLICT,
            ApiErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            ApiErrorCode::NotFound => StatusCode::NOT_FOUND,
            ApiErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl reject::Reject for ApiErrorCode {}

impl From<RateLimitError> for ApiErrorCode {
    fn from(error: RateLimitError) -> Self {
        ApiErrorCode::internal(error)
    }
}

impl From<SessionError> for ApiErrorCode {
    fn from(error: SessionError) -> Self {
        match error {
            SessionError::Backend(AuthBackendError::Rejected(_)) => ApiErrorCode::InvalidCredentials,
            SessionError::Backend(AuthBackendError::NoSession) => ApiErrorCode::NotSignedIn,
            SessionError::Backend(e) => ApiErrorCode::internal(e),
        }
    }
}

/// Rejection for a request that exceeded its window.
#[derive(Debug)]
pub struct RateLimited {
    pub decision: RateLimitDecision,
    pub retry_after_secs: u64,
}

impl reject::Reject for RateLimited {}

impl RateLimited {
    fn to_response(&self) -> Response {
        let code = ApiErrorCode::RateLimited;
        let json = warp::reply::json(&ApiResponse::<()>::err(code.clone(), code.to_string()));
        let reply = warp::reply::with_status(json, code.status());
        let reply = warp::reply::with_header(reply, "X-RateLimit-Limit", self.decision.limit.to_string());
        let reply = warp::reply::with_header(
            reply,
            "X-RateLimit-Remaining",
            self.decision.remaining.to_string(),
        );
        let reply = warp::reply::with_header(
            reply,
            "X-RateLimit-Reset",
            self.decision.reset_at.timestamp().to_string(),
        );
        let reply = warp::reply::with_header(reply, "Retry-After", self.retry_after_secs.to_string());
        reply.into_response()
    }
}
