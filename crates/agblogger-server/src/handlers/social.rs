//! Social account storage and credential validation.
//!
//! Credentials are sealed with a key derived from the application secret
//! before they touch the database; the ciphertext never leaves the
//! server. One row per `(user, platform, account_name)`; an account
//! without a name takes the empty string, so at most one anonymous row
//! per platform.

use agblogger_outbound::{CrossPoster, PlatformCredentials};
use axum::Json;
use axum::extract::{Path, State};
use chrono::Utc;
use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::{ApiError, ApiResult};
use crate::extract::CurrentUser;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct SocialAccount {
    pub id: i64,
    pub platform: String,
    pub account_name: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateAccount {
    pub platform: String,
    #[serde(default)]
    pub account_name: String,
    pub credentials: PlatformCredentials,
}

/// `GET /social/accounts` — the caller's accounts, ciphertext omitted.
pub async fn list(
    State(state): State<AppState>,
    user: CurrentUser,
) -> ApiResult<Json<Vec<SocialAccount>>> {
    let conn = state.db.lock().await;
    let mut stmt = conn
        .prepare(
            "SELECT id, platform, account_name, created_at, updated_at
             FROM social_accounts WHERE user_id = ?1 ORDER BY id",
        )
        .map_err(ApiError::from)?;
    let rows = stmt
        .query_map([user.id], |row| {
            Ok(SocialAccount {
                id: row.get(0)?,
                platform: row.get(1)?,
                account_name: row.get(2)?,
                created_at: row.get(3)?,
                updated_at: row.get(4)?,
            })
        })
        .map_err(ApiError::from)?;
    let accounts = rows.collect::<Result<Vec<_>, _>>().map_err(ApiError::from)?;
    Ok(Json(accounts))
}

/// `POST /social/accounts`
pub async fn create(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(request): Json<CreateAccount>,
) -> ApiResult<Json<SocialAccount>> {
    if CrossPoster::for_platform(&request.platform, request.credentials.clone()).is_none() {
        return Err(ApiError::BadRequest(format!("unknown platform {:?}", request.platform)));
    }
    let plaintext = serde_json::to_vec(&request.credentials)
        .map_err(|err| ApiError::Internal(err.into()))?;
    let sealed = agblogger_outbound::seal(&plaintext, &state.settings.secret_key)?;
    let now = agblogger_datetime::format_canonical(&Utc::now().fixed_offset());

    let conn = state.db.lock().await;
    let inserted = conn.execute(
        "INSERT INTO social_accounts (user_id, platform, account_name,
             credentials_ciphertext, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
        rusqlite::params![user.id, request.platform, request.account_name, sealed, now],
    );
    match inserted {
        Ok(_) => {}
        Err(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            return Err(ApiError::Conflict("account already linked".to_string()));
        }
        Err(err) => return Err(err.into()),
    }
    let id = conn.last_insert_rowid();
    let account = conn
        .query_row(
            "SELECT id, platform, account_name, created_at, updated_at
             FROM social_accounts WHERE id = ?1",
            [id],
            |row| {
                Ok(SocialAccount {
                    id: row.get(0)?,
                    platform: row.get(1)?,
                    account_name: row.get(2)?,
                    created_at: row.get(3)?,
                    updated_at: row.get(4)?,
                })
            },
        )
        .map_err(ApiError::from)?;
    Ok(Json(account))
}

/// `DELETE /social/accounts/{id}`
pub async fn delete(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    let conn = state.db.lock().await;
    let changed = conn
        .execute(
            "DELETE FROM social_accounts WHERE id = ?1 AND user_id = ?2",
            rusqlite::params![id, user.id],
        )
        .map_err(ApiError::from)?;
    if changed == 0 {
        return Err(ApiError::NotFound);
    }
    Ok(Json(json!({ "status": "deleted" })))
}

/// `POST /social/accounts/{id}/validate` — unseal and check the stored
/// credentials against the platform, through the SSRF-safe client.
pub async fn validate(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    let (platform, sealed) = {
        let conn = state.db.lock().await;
        conn.query_row(
            "SELECT platform, credentials_ciphertext FROM social_accounts
             WHERE id = ?1 AND user_id = ?2",
            rusqlite::params![id, user.id],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
        )
        .optional()
        .map_err(ApiError::from)?
        .ok_or(ApiError::NotFound)?
    };

    let plaintext = agblogger_outbound::unseal(&sealed, &state.settings.secret_key)?;
    let credentials: PlatformCredentials = serde_json::from_slice(&plaintext)
        .map_err(|err| ApiError::Internal(err.into()))?;
    let poster = CrossPoster::for_platform(&platform, credentials)
        .ok_or_else(|| ApiError::BadRequest(format!("unknown platform {platform:?}")))?;

    let valid = poster.validate_credentials().await?;
    Ok(Json(json!({ "valid": valid })))
}
