//! The boundary error type: domain failures mapped to HTTP statuses.
//!
//! Expected failures carry messages safe to show a client. Anything
//! unexpected becomes [`ApiError::Internal`]: logged in full server-side,
//! surfaced as a generic 500.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::error;

#[derive(Debug)]
pub enum ApiError {
    NotFound,
    Unauthorized,
    Forbidden,
    BadRequest(String),
    Conflict(String),
    RateLimited { retry_after: u64 },
    RenderUnavailable(String),
    RenderFailed(String),
    RenderTimeout,
    Storage(anyhow::Error),
    ExternalService(String),
    Internal(anyhow::Error),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, message) = match &self {
            Self::NotFound => (StatusCode::NOT_FOUND, "not_found", "not found".to_string()),
            Self::Unauthorized => {
                (StatusCode::UNAUTHORIZED, "unauthorized", "authentication required".to_string())
            }
            Self::Forbidden => (StatusCode::FORBIDDEN, "forbidden", "not allowed".to_string()),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.clone()),
            Self::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg.clone()),
            Self::RateLimited { retry_after } => (
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limited",
                format!("too many attempts, retry after {retry_after}s"),
            ),
            Self::RenderUnavailable(msg) => {
                (StatusCode::BAD_GATEWAY, "render_unavailable", msg.clone())
            }
            Self::RenderFailed(msg) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "render_failed", msg.clone())
            }
            Self::RenderTimeout => {
                (StatusCode::GATEWAY_TIMEOUT, "render_timeout", "render timed out".to_string())
            }
            Self::Storage(err) => {
                error!(error = %format!("{err:#}"), "storage failure");
                (StatusCode::INTERNAL_SERVER_ERROR, "storage_failure", "storage failure".to_string())
            }
            Self::ExternalService(msg) => {
                (StatusCode::BAD_GATEWAY, "external_service_failure", msg.clone())
            }
            Self::Internal(err) => {
                error!(error = %format!("{err:#}"), "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal server error".to_string(),
                )
            }
        };

        let mut body = json!({ "error": kind, "message": message });
        if let Self::RateLimited { retry_after } = &self {
            body["retry_after"] = json!(retry_after);
        }
        let mut response = (status, Json(body)).into_response();
        if let Self::RateLimited { retry_after } = &self
            && let Ok(value) = retry_after.to_string().parse()
        {
            response.headers_mut().insert(axum::http::header::RETRY_AFTER, value);
        }
        response
    }
}

impl From<agblogger_content::ContentError> for ApiError {
    fn from(err: agblogger_content::ContentError) -> Self {
        use agblogger_content::ContentError as E;
        match err {
            E::UnsafePath(p) => Self::BadRequest(format!("unsafe path: {p}")),
            E::NotFound(_) => Self::NotFound,
            E::TooLarge { size, max, .. } => {
                Self::BadRequest(format!("file is {size} bytes, limit is {max}"))
            }
            E::NulBytes(_) => Self::BadRequest("file contains NUL bytes".to_string()),
            E::NotText(_) => Self::BadRequest("file is not valid UTF-8".to_string()),
            E::Io { .. } => Self::Storage(err.into()),
        }
    }
}

impl From<agblogger_cache::CacheError> for ApiError {
    fn from(err: agblogger_cache::CacheError) -> Self {
        match err {
            agblogger_cache::CacheError::NotFound(_) => Self::NotFound,
            other => Self::Storage(other.into()),
        }
    }
}

impl From<agblogger_auth::AuthError> for ApiError {
    fn from(err: agblogger_auth::AuthError) -> Self {
        use agblogger_auth::AuthError as E;
        match err {
            E::InvalidCredentials | E::TokenInvalid => Self::Unauthorized,
            E::Duplicate(what) => Self::Conflict(format!("{what} already exists")),
            E::InviteInvalid => {
                Self::BadRequest("invite code is invalid, used, or expired".to_string())
            }
            E::NotFound => Self::NotFound,
            other => Self::Internal(other.into()),
        }
    }
}

impl From<agblogger_labels::LabelError> for ApiError {
    fn from(err: agblogger_labels::LabelError) -> Self {
        use agblogger_labels::LabelError as E;
        match &err {
            E::InvalidId(id) => Self::BadRequest(format!("invalid label id: {id:?}")),
            E::NotFound(_) => Self::NotFound,
            E::CycleDetected { child, parent } => {
                Self::Conflict(format!("cycle detected: edge {child} -> {parent}"))
            }
        }
    }
}

impl From<agblogger_sync::SyncError> for ApiError {
    fn from(err: agblogger_sync::SyncError) -> Self {
        use agblogger_sync::SyncError as E;
        match err {
            E::UnsafePath(p) => Self::BadRequest(format!("unsafe path: {p}")),
            E::BadCommitRef(c) => Self::BadRequest(format!("invalid commit id: {c}")),
            E::Content(inner) => inner.into(),
            E::Cache(inner) => inner.into(),
            E::Git(inner) => Self::Storage(inner),
        }
    }
}

impl From<agblogger_render::RenderError> for ApiError {
    fn from(err: agblogger_render::RenderError) -> Self {
        use agblogger_render::RenderError as E;
        match err {
            E::Unavailable(msg) => Self::RenderUnavailable(msg),
            E::Failed(msg) => Self::RenderFailed(msg),
            E::InputTooLarge { size, max } => {
                Self::BadRequest(format!("markdown is {size} bytes, render limit is {max}"))
            }
            E::Timeout => Self::RenderTimeout,
        }
    }
}

impl From<agblogger_config::ConfigError> for ApiError {
    fn from(err: agblogger_config::ConfigError) -> Self {
        match err {
            agblogger_config::ConfigError::InvalidPageId(id) => {
                Self::BadRequest(format!("invalid page id: {id:?}"))
            }
            other => Self::Storage(other.into()),
        }
    }
}

impl From<agblogger_outbound::OutboundError> for ApiError {
    fn from(err: agblogger_outbound::OutboundError) -> Self {
        use agblogger_outbound::OutboundError as E;
        match err {
            E::ForbiddenUrl(msg) => Self::BadRequest(msg),
            E::Resolution(host) => Self::ExternalService(format!("dns resolution failed: {host}")),
            E::Request(inner) => Self::ExternalService(inner.to_string()),
            crypto @ E::Crypto(_) => Self::Internal(crypto.into()),
        }
    }
}

impl From<rusqlite::Error> for ApiError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(err.into())
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}
