//! Authentication and session primitives.
//!
//! Passwords are bcrypt-hashed; access tokens are short-lived HS256 JWTs;
//! refresh tokens, invite codes, and personal access tokens are opaque
//! random secrets stored only as SHA-256 digests. A sliding-window rate
//! limiter keyed by `(identity, surface)` guards the failure-prone
//! endpoints. All storage lives in the cache database; the functions here
//! take a plain connection so callers control locking and transactions.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use agblogger_datetime::format_canonical;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD as BASE64URL};
use chrono::{DateTime, FixedOffset, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation};
use parking_lot::Mutex;
use rand::RngCore;
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::warn;

/// Prefix carried by personal access tokens so they are recognizable in
/// `Authorization` headers.
pub const PAT_PREFIX: &str = "agb_";

/// Default access token lifetime.
pub const ACCESS_TOKEN_TTL: Duration = Duration::from_secs(15 * 60);
/// Default refresh token lifetime.
pub const REFRESH_TOKEN_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Authentication failures.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("{0} already exists")]
    Duplicate(&'static str),
    #[error("invite code is invalid, used, or expired")]
    InviteInvalid,
    #[error("token is expired or revoked")]
    TokenInvalid,
    #[error("user not found")]
    NotFound,
    #[error("database error")]
    Db(#[from] rusqlite::Error),
    #[error("password hashing failed")]
    Hashing(#[from] bcrypt::BcryptError),
    #[error("token signing failed")]
    Signing(#[from] jsonwebtoken::errors::Error),
}

pub type AuthResult<T> = Result<T, AuthError>;

// ---------------------------------------------------------------------------
// Passwords

/// Pre-computed hash used to equalize timing when the user does not exist.
static DUMMY_HASH: LazyLock<String> =
    LazyLock::new(|| bcrypt::hash("agblogger-timing-dummy", bcrypt::DEFAULT_COST).unwrap_or_default());

/// Hash a password with the default cost.
pub fn hash_password(password: &str) -> AuthResult<String> {
    Ok(bcrypt::hash(password, bcrypt::DEFAULT_COST)?)
}

/// Verify a password. Malformed stored hashes count as a mismatch, never
/// an error.
pub fn verify_password(password: &str, stored_hash: &str) -> bool {
    bcrypt::verify(password, stored_hash).unwrap_or(false)
}

/// Verify against an optional stored hash, burning the same bcrypt work
/// when the user does not exist.
pub fn verify_password_timing_safe(password: &str, stored_hash: Option<&str>) -> bool {
    match stored_hash {
        Some(hash) => verify_password(password, hash),
        None => {
            let _ = verify_password(password, &DUMMY_HASH);
            false
        }
    }
}

// ---------------------------------------------------------------------------
// Opaque secrets

/// 32 random bytes, base64url. Used for refresh tokens, CSRF tokens, and
/// invite codes.
pub fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    BASE64URL.encode(bytes)
}

/// Digest stored at rest in place of the secret itself.
pub fn secret_digest(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

/// Constant-time comparison for CSRF double-submit values.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b) {
        diff |= x ^ y;
    }
    diff == 0
}

// ---------------------------------------------------------------------------
// Access tokens (JWT)

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    /// Decimal user id.
    sub: String,
    iat: i64,
    exp: i64,
}

/// HS256 signer/verifier over the application secret.
#[derive(Clone)]
pub struct TokenSigner {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
}

impl TokenSigner {
    pub fn new(secret: &str, ttl: Duration) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            ttl,
        }
    }

    /// Issue an access token for a user id.
    pub fn issue(&self, user_id: i64) -> AuthResult<String> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: user_id.to_string(),
            iat: now,
            exp: now + self.ttl.as_secs() as i64,
        };
        Ok(jsonwebtoken::encode(&Header::default(), &claims, &self.encoding)?)
    }

    /// Decode an access token to a user id. Every failure mode (bad
    /// signature, expiry, malformed or non-decimal `sub`) is simply "no
    /// user".
    pub fn decode(&self, token: &str) -> Option<i64> {
        let data =
            jsonwebtoken::decode::<Claims>(token, &self.decoding, &Validation::default()).ok()?;
        data.claims.sub.parse().ok()
    }
}

// ---------------------------------------------------------------------------
// Users

/// A user row.
#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub display_name: Option<String>,
    pub is_admin: bool,
    pub created_at: String,
    pub updated_at: String,
}

/// Input for user creation.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub display_name: Option<String>,
    pub is_admin: bool,
}

fn now_canonical() -> String {
    format_canonical(&Utc::now().fixed_offset())
}

pub fn create_user(conn: &Connection, new: &NewUser) -> AuthResult<User> {
    let now = now_canonical();
    let result = conn.execute(
        "INSERT INTO users (username, email, password_hash, display_name, is_admin,
             created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
        rusqlite::params![
            new.username,
            new.email,
            new.password_hash,
            new.display_name,
            new.is_admin,
            now
        ],
    );
    match result {
        Ok(_) => {}
        Err(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            return Err(AuthError::Duplicate("user"));
        }
        Err(err) => return Err(err.into()),
    }
    find_user_by_id(conn, conn.last_insert_rowid())?.ok_or(AuthError::NotFound)
}

pub fn find_user_by_username(conn: &Connection, username: &str) -> AuthResult<Option<User>> {
    Ok(conn
        .query_row("SELECT * FROM users WHERE username = ?1", [username], map_user)
        .optional()?)
}

pub fn find_user_by_id(conn: &Connection, id: i64) -> AuthResult<Option<User>> {
    Ok(conn.query_row("SELECT * FROM users WHERE id = ?1", [id], map_user).optional()?)
}

fn map_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get("id")?,
        username: row.get("username")?,
        email: row.get("email")?,
        password_hash: row.get("password_hash")?,
        display_name: row.get("display_name")?,
        is_admin: row.get("is_admin")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

// ---------------------------------------------------------------------------
// Refresh tokens

/// Issue a fresh refresh token for a user. Returns the secret (the digest
/// is what gets stored).
pub fn issue_refresh_token(conn: &Connection, user_id: i64, ttl: Duration) -> AuthResult<String> {
    let secret = generate_secret();
    let expires = Utc::now() + chrono::Duration::seconds(ttl.as_secs() as i64);
    conn.execute(
        "INSERT INTO refresh_tokens (user_id, token_hash, expires_at, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![
            user_id,
            secret_digest(&secret),
            format_canonical(&expires.fixed_offset()),
            now_canonical()
        ],
    )?;
    Ok(secret)
}

/// Rotate a refresh token: the presented token is revoked and a new one
/// issued in the same transaction. An expired token is deleted on sight.
pub fn rotate_refresh_token(
    conn: &mut Connection,
    presented: &str,
    ttl: Duration,
) -> AuthResult<(i64, String)> {
    let tx = conn.transaction()?;
    let digest = secret_digest(presented);
    let row: Option<(i64, i64, String)> = tx
        .query_row(
            "SELECT id, user_id, expires_at FROM refresh_tokens WHERE token_hash = ?1",
            [&digest],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;
    let Some((row_id, user_id, expires_at)) = row else {
        return Err(AuthError::TokenInvalid);
    };
    tx.execute("DELETE FROM refresh_tokens WHERE id = ?1", [row_id])?;
    if is_past(&expires_at) {
        // Auto-revoke: the delete above commits, the rotation does not
        // happen.
        tx.commit()?;
        return Err(AuthError::TokenInvalid);
    }
    let secret = generate_secret();
    let expires = Utc::now() + chrono::Duration::seconds(ttl.as_secs() as i64);
    tx.execute(
        "INSERT INTO refresh_tokens (user_id, token_hash, expires_at, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![
            user_id,
            secret_digest(&secret),
            format_canonical(&expires.fixed_offset()),
            now_canonical()
        ],
    )?;
    tx.commit()?;
    Ok((user_id, secret))
}

/// Revoke one refresh token (logout). Unknown tokens are a no-op.
pub fn revoke_refresh_token(conn: &Connection, presented: &str) -> AuthResult<()> {
    conn.execute(
        "DELETE FROM refresh_tokens WHERE token_hash = ?1",
        [secret_digest(presented)],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Invite codes

/// Mint a single-use invite code.
pub fn create_invite(conn: &Connection, created_by: i64, ttl: Duration) -> AuthResult<String> {
    let code = generate_secret();
    let expires = Utc::now() + chrono::Duration::seconds(ttl.as_secs() as i64);
    conn.execute(
        "INSERT INTO invite_codes (code_hash, created_by, expires_at, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![
            secret_digest(&code),
            created_by,
            format_canonical(&expires.fixed_offset()),
            now_canonical()
        ],
    )?;
    Ok(code)
}

/// Check that an invite code could be redeemed right now, without
/// consuming it. Registration peeks before creating the user row.
pub fn invite_usable(conn: &Connection, code: &str) -> AuthResult<()> {
    let row: Option<(Option<i64>, String)> = conn
        .query_row(
            "SELECT used_by, expires_at FROM invite_codes WHERE code_hash = ?1",
            [secret_digest(code)],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    match row {
        Some((None, expires_at)) if !is_past(&expires_at) => Ok(()),
        _ => Err(AuthError::InviteInvalid),
    }
}

/// Redeem an invite for a newly registered user. Fails when the code is
/// unknown, already used, or expired.
pub fn redeem_invite(conn: &mut Connection, code: &str, used_by: i64) -> AuthResult<()> {
    let tx = conn.transaction()?;
    let row: Option<(i64, Option<i64>, String)> = tx
        .query_row(
            "SELECT id, used_by, expires_at FROM invite_codes WHERE code_hash = ?1",
            [secret_digest(code)],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;
    let Some((id, used, expires_at)) = row else {
        return Err(AuthError::InviteInvalid);
    };
    if used.is_some() || is_past(&expires_at) {
        return Err(AuthError::InviteInvalid);
    }
    tx.execute(
        "UPDATE invite_codes SET used_by = ?2, used_at = ?3 WHERE id = ?1",
        rusqlite::params![id, used_by, now_canonical()],
    )?;
    tx.commit()?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Personal access tokens

/// A PAT row as listed to its owner (the secret is never stored).
#[derive(Debug, Clone, Serialize)]
pub struct PatInfo {
    pub id: i64,
    pub label: String,
    pub created_at: String,
    pub last_used_at: Option<String>,
    pub expires_at: Option<String>,
    pub revoked: bool,
}

/// Mint a personal access token; the returned secret carries the
/// [`PAT_PREFIX`].
pub fn create_pat(
    conn: &Connection,
    user_id: i64,
    label: &str,
    ttl: Option<Duration>,
) -> AuthResult<String> {
    let secret = format!("{PAT_PREFIX}{}", generate_secret());
    let expires = ttl.map(|t| {
        format_canonical(&(Utc::now() + chrono::Duration::seconds(t.as_secs() as i64)).fixed_offset())
    });
    conn.execute(
        "INSERT INTO personal_access_tokens (user_id, token_hash, label, created_at, expires_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        rusqlite::params![user_id, secret_digest(&secret), label, now_canonical(), expires],
    )?;
    Ok(secret)
}

/// Authenticate a bearer PAT, updating `last_used_at` on success.
pub fn authenticate_pat(conn: &Connection, presented: &str) -> AuthResult<Option<i64>> {
    if !presented.starts_with(PAT_PREFIX) {
        return Ok(None);
    }
    let row: Option<(i64, i64, Option<String>, bool)> = conn
        .query_row(
            "SELECT id, user_id, expires_at, revoked FROM personal_access_tokens
             WHERE token_hash = ?1",
            [secret_digest(presented)],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .optional()?;
    let Some((id, user_id, expires_at, revoked)) = row else {
        return Ok(None);
    };
    if revoked || expires_at.as_deref().is_some_and(is_past) {
        return Ok(None);
    }
    conn.execute(
        "UPDATE personal_access_tokens SET last_used_at = ?2 WHERE id = ?1",
        rusqlite::params![id, now_canonical()],
    )?;
    Ok(Some(user_id))
}

/// List a user's tokens.
pub fn list_pats(conn: &Connection, user_id: i64) -> AuthResult<Vec<PatInfo>> {
    let mut stmt = conn.prepare(
        "SELECT id, label, created_at, last_used_at, expires_at, revoked
         FROM personal_access_tokens WHERE user_id = ?1 ORDER BY id",
    )?;
    let rows = stmt.query_map([user_id], |row| {
        Ok(PatInfo {
            id: row.get(0)?,
            label: row.get(1)?,
            created_at: row.get(2)?,
            last_used_at: row.get(3)?,
            expires_at: row.get(4)?,
            revoked: row.get(5)?,
        })
    })?;
    Ok(rows.collect::<Result<_, _>>()?)
}

/// Revoke one of the user's tokens.
pub fn revoke_pat(conn: &Connection, user_id: i64, pat_id: i64) -> AuthResult<()> {
    let changed = conn.execute(
        "UPDATE personal_access_tokens SET revoked = 1 WHERE id = ?1 AND user_id = ?2",
        rusqlite::params![pat_id, user_id],
    )?;
    if changed == 0 {
        return Err(AuthError::NotFound);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Rate limiting

/// Sliding-window failure limiter keyed by `(identity, surface)`.
///
/// Single-instance by design: state is in-process. Distributed
/// deployments need a shared backend in front of this.
pub struct RateLimiter {
    max_failures: usize,
    window: Duration,
    state: Mutex<HashMap<(String, &'static str), VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(max_failures: usize, window: Duration) -> Self {
        Self { max_failures, window, state: Mutex::new(HashMap::new()) }
    }

    /// Whether another attempt is allowed right now. On a breach, returns
    /// the whole seconds to wait (rounded up).
    pub fn check(&self, surface: &'static str, identity: &str) -> Result<(), u64> {
        let mut state = self.state.lock();
        let key = (identity.to_string(), surface);
        let now = Instant::now();
        let Some(failures) = state.get_mut(&key) else {
            return Ok(());
        };
        while failures.front().is_some_and(|t| now.duration_since(*t) >= self.window) {
            failures.pop_front();
        }
        if failures.is_empty() {
            // Pruned-empty keys are dropped to bound memory.
            state.remove(&key);
            return Ok(());
        }
        if failures.len() < self.max_failures {
            return Ok(());
        }
        let oldest = failures.front().copied().unwrap_or(now);
        let elapsed = now.duration_since(oldest);
        let remaining = self.window.saturating_sub(elapsed);
        Err(remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0))
    }

    /// Record a failed attempt.
    pub fn record_failure(&self, surface: &'static str, identity: &str) {
        let mut state = self.state.lock();
        state
            .entry((identity.to_string(), surface))
            .or_default()
            .push_back(Instant::now());
    }

    /// Forget an identity's failures (successful login).
    pub fn clear(&self, surface: &'static str, identity: &str) {
        let mut state = self.state.lock();
        state.remove(&(identity.to_string(), surface));
    }
}

// ---------------------------------------------------------------------------

fn is_past(canonical: &str) -> bool {
    match agblogger_datetime::parse(canonical, &agblogger_datetime::SiteTz::utc()) {
        Ok(dt) => dt <= now_fixed(),
        Err(err) => {
            warn!(value = canonical, %err, "unparseable stored expiry, treating as expired");
            true
        }
    }
}

fn now_fixed() -> DateTime<FixedOffset> {
    Utc::now().fixed_offset()
}
