//! Request authentication extractors and the security middleware.
//!
//! Two credentials are accepted: a bearer personal access token
//! (`Authorization: Bearer agb_…`) for CLI/API use, and the
//! `access_token` JWT cookie for browsers. Cookie-authenticated unsafe
//! methods additionally require the CSRF double-submit header.

use axum::extract::{FromRequestParts, Request, State};
use axum::http::header;
use axum::http::request::Parts;
use axum::middleware::Next;
use axum::response::Response;
use axum_extra::extract::cookie::CookieJar;

use crate::error::ApiError;
use crate::state::AppState;

/// Cookie names.
pub const ACCESS_COOKIE: &str = "access_token";
pub const REFRESH_COOKIE: &str = "refresh_token";
pub const CSRF_COOKIE: &str = "csrf_token";
/// Header carrying the CSRF double-submit value.
pub const CSRF_HEADER: &str = "x-csrf-token";

/// The authenticated caller.
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub id: i64,
    pub username: String,
    pub is_admin: bool,
}

/// Extractor: a valid credential is required.
impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        match authenticate(parts, state).await? {
            Some(user) => Ok(user),
            None => Err(ApiError::Unauthorized),
        }
    }
}

/// Extractor: authentication is optional (draft visibility on public
/// endpoints).
#[derive(Debug, Clone, Default)]
pub struct MaybeUser(pub Option<CurrentUser>);

impl FromRequestParts<AppState> for MaybeUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        Ok(Self(authenticate(parts, state).await?))
    }
}

/// Extractor: admin role required.
#[derive(Debug, Clone)]
pub struct AdminUser(pub CurrentUser);

impl FromRequestParts<AppState> for AdminUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let user = CurrentUser::from_request_parts(parts, state).await?;
        if !user.is_admin {
            return Err(ApiError::Forbidden);
        }
        Ok(Self(user))
    }
}

/// Resolve the caller from a bearer PAT or the access-token cookie.
async fn authenticate(
    parts: &Parts,
    state: &AppState,
) -> Result<Option<CurrentUser>, ApiError> {
    if let Some(token) = bearer_token(parts) {
        // PATs carry their prefix; anything else is tried as an access
        // token JWT (the CLI between login and PAT creation).
        if token.starts_with(agblogger_auth::PAT_PREFIX) {
            let conn = state.db.lock().await;
            if let Some(user_id) = agblogger_auth::authenticate_pat(&conn, token)? {
                return Ok(load_user(&conn, user_id)?);
            }
            return Ok(None);
        }
        let Some(user_id) = state.signer.decode(token) else {
            return Ok(None);
        };
        let conn = state.db.lock().await;
        return Ok(load_user(&conn, user_id)?);
    }

    let jar = CookieJar::from_headers(&parts.headers);
    let Some(cookie) = jar.get(ACCESS_COOKIE) else {
        return Ok(None);
    };
    let Some(user_id) = state.signer.decode(cookie.value()) else {
        return Ok(None);
    };
    let conn = state.db.lock().await;
    Ok(load_user(&conn, user_id)?)
}

fn load_user(
    conn: &rusqlite::Connection,
    user_id: i64,
) -> Result<Option<CurrentUser>, ApiError> {
    let user = agblogger_auth::find_user_by_id(conn, user_id)?;
    Ok(user.map(|u| CurrentUser { id: u.id, username: u.username, is_admin: u.is_admin }))
}

fn bearer_token(parts: &Parts) -> Option<&str> {
    parts.headers.get(header::AUTHORIZATION)?.to_str().ok()?.strip_prefix("Bearer ")
}

/// CSRF double-submit guard for cookie-authenticated unsafe methods.
///
/// Bearer requests are exempt: the token cannot be attached by a hostile
/// site. Requests without the access cookie fall through to the handlers'
/// own auth checks.
pub async fn csrf_guard(request: Request, next: Next) -> Result<Response, ApiError> {
    let method = request.method();
    let unsafe_method = matches!(
        method.as_str(),
        "POST" | "PUT" | "PATCH" | "DELETE"
    );
    let has_bearer = request.headers().contains_key(header::AUTHORIZATION);

    if unsafe_method && !has_bearer {
        let jar = CookieJar::from_headers(request.headers());
        if jar.get(ACCESS_COOKIE).is_some() {
            let cookie_value =
                jar.get(CSRF_COOKIE).map(|c| c.value().to_string()).unwrap_or_default();
            let header_value = request
                .headers()
                .get(CSRF_HEADER)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();
            if cookie_value.is_empty()
                || !agblogger_auth::constant_time_eq(&cookie_value, header_value)
            {
                return Err(ApiError::Forbidden);
            }
        }
    }
    Ok(next.run(request).await)
}

/// Production host allowlist.
pub async fn trusted_hosts_guard(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if state.settings.is_production() {
        let host = request
            .headers()
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(|h| h.split(':').next().unwrap_or(h).to_string())
            .unwrap_or_default();
        if !state.settings.trusted_hosts.iter().any(|t| t == &host) {
            return Err(ApiError::BadRequest(format!("untrusted host {host:?}")));
        }
    }
    Ok(next.run(request).await)
}
