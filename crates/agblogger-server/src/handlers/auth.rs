//! Authentication and session endpoints.

use std::time::Duration;

use axum::Json;
use axum::extract::State;
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::{ApiError, ApiResult};
use crate::extract::{ACCESS_COOKIE, AdminUser, CSRF_COOKIE, CurrentUser, REFRESH_COOKIE};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub user_id: i64,
    pub username: String,
    pub is_admin: bool,
    pub access_token: String,
    pub refresh_token: String,
    pub csrf_token: String,
}

/// `POST /auth/login`
pub async fn login(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(request): Json<LoginRequest>,
) -> ApiResult<(CookieJar, Json<SessionResponse>)> {
    if let Err(retry_after) = state.limiter.check("login", &request.username) {
        return Err(ApiError::RateLimited { retry_after });
    }

    let stored_hash = {
        let conn = state.db.lock().await;
        agblogger_auth::find_user_by_username(&conn, &request.username)?
            .map(|u| u.password_hash)
    };
    // bcrypt is CPU-bound; keep it off the event loop. The dummy round
    // for unknown users equalizes timing.
    let password = request.password.clone();
    let verified = tokio::task::spawn_blocking(move || {
        agblogger_auth::verify_password_timing_safe(&password, stored_hash.as_deref())
    })
    .await
    .map_err(|err| ApiError::Internal(err.into()))?;

    if !verified {
        state.limiter.record_failure("login", &request.username);
        return Err(ApiError::Unauthorized);
    }
    state.limiter.clear("login", &request.username);

    let user = {
        let conn = state.db.lock().await;
        agblogger_auth::find_user_by_username(&conn, &request.username)?
            .ok_or(ApiError::Unauthorized)?
    };
    start_session(&state, jar, user.id, user.username, user.is_admin).await
}

#[derive(Debug, Default, Deserialize)]
pub struct RefreshRequest {
    #[serde(default)]
    pub refresh_token: Option<String>,
}

/// `POST /auth/refresh` — rotates the refresh token and reissues the
/// access and CSRF tokens.
pub async fn refresh(
    State(state): State<AppState>,
    jar: CookieJar,
    body: Result<Json<RefreshRequest>, axum::extract::rejection::JsonRejection>,
) -> ApiResult<(CookieJar, Json<SessionResponse>)> {
    let presented = body
        .ok()
        .and_then(|Json(b)| b.refresh_token)
        .or_else(|| jar.get(REFRESH_COOKIE).map(|c| c.value().to_string()))
        .ok_or(ApiError::Unauthorized)?;

    // Pre-auth identity for the limiter: a digest prefix of the token.
    let identity: String = agblogger_auth::secret_digest(&presented).chars().take(16).collect();
    if let Err(retry_after) = state.limiter.check("refresh", &identity) {
        return Err(ApiError::RateLimited { retry_after });
    }

    let rotated = {
        let mut conn = state.db.lock().await;
        agblogger_auth::rotate_refresh_token(
            &mut conn,
            &presented,
            state.settings.refresh_token_ttl(),
        )
    };
    let (user_id, new_refresh) = match rotated {
        Ok(pair) => pair,
        Err(err) => {
            state.limiter.record_failure("refresh", &identity);
            return Err(err.into());
        }
    };
    state.limiter.clear("refresh", &identity);

    let user = {
        let conn = state.db.lock().await;
        agblogger_auth::find_user_by_id(&conn, user_id)?.ok_or(ApiError::Unauthorized)?
    };
    finish_session(&state, jar, user.id, user.username, user.is_admin, new_refresh)
}

/// `POST /auth/logout`
pub async fn logout(
    State(state): State<AppState>,
    jar: CookieJar,
) -> ApiResult<(CookieJar, Json<Value>)> {
    if let Some(cookie) = jar.get(REFRESH_COOKIE) {
        let conn = state.db.lock().await;
        agblogger_auth::revoke_refresh_token(&conn, cookie.value())?;
    }
    // Removal cookies must carry the same path the session cookies used.
    let jar = jar
        .remove(Cookie::build((ACCESS_COOKIE, "")).path("/").build())
        .remove(Cookie::build((REFRESH_COOKIE, "")).path("/").build())
        .remove(Cookie::build((CSRF_COOKIE, "")).path("/").build());
    Ok((jar, Json(json!({ "status": "ok" }))))
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub invite_code: String,
    pub username: String,
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

/// `POST /auth/register` — invite-gated self-registration; grants the
/// non-admin role.
pub async fn register(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(request): Json<RegisterRequest>,
) -> ApiResult<(CookieJar, Json<SessionResponse>)> {
    if !state.settings.registration_enabled {
        return Err(ApiError::Forbidden);
    }
    if request.username.is_empty() || request.password.len() < 8 {
        return Err(ApiError::BadRequest(
            "username required and password must be at least 8 characters".to_string(),
        ));
    }

    let password = request.password.clone();
    let hash = tokio::task::spawn_blocking(move || agblogger_auth::hash_password(&password))
        .await
        .map_err(|err| ApiError::Internal(err.into()))??;

    let user = {
        let mut conn = state.db.lock().await;
        agblogger_auth::invite_usable(&conn, &request.invite_code)?;
        let user = agblogger_auth::create_user(
            &conn,
            &agblogger_auth::NewUser {
                username: request.username.clone(),
                email: request.email.clone(),
                password_hash: hash,
                display_name: request.display_name.clone(),
                is_admin: false,
            },
        )?;
        agblogger_auth::redeem_invite(&mut conn, &request.invite_code, user.id)?;
        user
    };
    start_session(&state, jar, user.id, user.username, user.is_admin).await
}

/// `GET /auth/me`
pub async fn me(user: CurrentUser) -> Json<Value> {
    Json(json!({
        "user_id": user.id,
        "username": user.username,
        "is_admin": user.is_admin,
    }))
}

#[derive(Debug, Deserialize)]
pub struct InviteRequest {
    /// Invite validity in hours (default one week).
    #[serde(default)]
    pub expires_hours: Option<u64>,
}

/// `POST /auth/invites` (admin)
pub async fn create_invite(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    body: Result<Json<InviteRequest>, axum::extract::rejection::JsonRejection>,
) -> ApiResult<Json<Value>> {
    let hours = body.ok().and_then(|Json(b)| b.expires_hours).unwrap_or(7 * 24);
    let conn = state.db.lock().await;
    let code =
        agblogger_auth::create_invite(&conn, admin.id, Duration::from_secs(hours * 3600))?;
    Ok(Json(json!({ "invite_code": code, "expires_hours": hours })))
}

#[derive(Debug, Deserialize)]
pub struct PatRequest {
    pub label: String,
    #[serde(default)]
    pub expires_days: Option<u64>,
}

/// `POST /auth/tokens`
pub async fn create_pat(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(request): Json<PatRequest>,
) -> ApiResult<Json<Value>> {
    let ttl = request.expires_days.map(|d| Duration::from_secs(d * 24 * 3600));
    let conn = state.db.lock().await;
    let token = agblogger_auth::create_pat(&conn, user.id, &request.label, ttl)?;
    Ok(Json(json!({ "token": token, "label": request.label })))
}

/// `GET /auth/tokens`
pub async fn list_pats(
    State(state): State<AppState>,
    user: CurrentUser,
) -> ApiResult<Json<Vec<agblogger_auth::PatInfo>>> {
    let conn = state.db.lock().await;
    Ok(Json(agblogger_auth::list_pats(&conn, user.id)?))
}

/// `DELETE /auth/tokens/{id}`
pub async fn revoke_pat(
    State(state): State<AppState>,
    user: CurrentUser,
    axum::extract::Path(id): axum::extract::Path<i64>,
) -> ApiResult<Json<Value>> {
    let conn = state.db.lock().await;
    agblogger_auth::revoke_pat(&conn, user.id, id)?;
    Ok(Json(json!({ "status": "revoked" })))
}

/// Issue refresh + access + CSRF and set the cookies.
async fn start_session(
    state: &AppState,
    jar: CookieJar,
    user_id: i64,
    username: String,
    is_admin: bool,
) -> ApiResult<(CookieJar, Json<SessionResponse>)> {
    let refresh_token = {
        let conn = state.db.lock().await;
        agblogger_auth::issue_refresh_token(&conn, user_id, state.settings.refresh_token_ttl())?
    };
    finish_session(state, jar, user_id, username, is_admin, refresh_token)
}

fn finish_session(
    state: &AppState,
    jar: CookieJar,
    user_id: i64,
    username: String,
    is_admin: bool,
    refresh_token: String,
) -> ApiResult<(CookieJar, Json<SessionResponse>)> {
    let access_token = state.signer.issue(user_id)?;
    // The CSRF token rotates with every login and refresh.
    let csrf_token = agblogger_auth::generate_secret();
    let secure = state.settings.secure_cookies();

    let jar = jar
        .add(session_cookie(ACCESS_COOKIE, access_token.clone(), secure, true))
        .add(session_cookie(REFRESH_COOKIE, refresh_token.clone(), secure, true))
        .add(session_cookie(CSRF_COOKIE, csrf_token.clone(), secure, false));

    Ok((
        jar,
        Json(SessionResponse {
            user_id,
            username,
            is_admin,
            access_token,
            refresh_token,
            csrf_token,
        }),
    ))
}

fn session_cookie(
    name: &'static str,
    value: String,
    secure: bool,
    http_only: bool,
) -> Cookie<'static> {
    Cookie::build((name, value))
        .path("/")
        .same_site(SameSite::Strict)
        .http_only(http_only)
        .secure(secure)
        .build()
}
