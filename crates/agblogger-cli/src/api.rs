//! Blocking HTTP client for the agblogger server API.

use std::time::Duration;

use agblogger_sync::{CommitRequest, CommitResponse, InitRequest, SyncPlan};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use serde_json::{Value, json};
use thiserror::Error;

/// Client-side failures, mapped to exit codes in `main`.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("authentication failed")]
    Auth,
    #[error("path safety violation: {0}")]
    PathSafety(String),
    #[error("network or server error: {0}")]
    Network(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CliError {
    /// CLI exit code: 0 success, 1 generic, 2 auth, 3 path safety,
    /// 4 network/server.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Auth => 2,
            Self::PathSafety(_) => 3,
            Self::Network(_) => 4,
            Self::Other(_) => 1,
        }
    }
}

impl From<reqwest::Error> for CliError {
    fn from(err: reqwest::Error) -> Self {
        Self::Network(err.to_string())
    }
}

pub type CliResult<T> = Result<T, CliError>;

/// One authenticated connection to a server.
pub struct Api {
    base: String,
    token: Option<String>,
    client: reqwest::blocking::Client,
}

impl Api {
    pub fn new(base: &str, token: Option<String>) -> CliResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(CliError::from)?;
        Ok(Self { base: base.trim_end_matches('/').to_string(), token, client })
    }

    /// `POST /auth/login`; returns the short-lived access token.
    pub fn login(&self, username: &str, password: &str) -> CliResult<String> {
        let response = self
            .client
            .post(format!("{}/auth/login", self.base))
            .json(&json!({ "username": username, "password": password }))
            .send()?;
        let body: Value = check(response)?;
        body["access_token"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| CliError::Network("login response missing access_token".to_string()))
    }

    /// `POST /auth/tokens` with an access token; mints a PAT.
    pub fn mint_pat(&self, access_token: &str, label: &str) -> CliResult<String> {
        let response = self
            .client
            .post(format!("{}/auth/tokens", self.base))
            .bearer_auth(access_token)
            .json(&json!({ "label": label }))
            .send()?;
        let body: Value = check(response)?;
        body["token"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| CliError::Network("token response missing token".to_string()))
    }

    pub fn sync_init(&self, request: &InitRequest) -> CliResult<SyncPlan> {
        let response = self
            .authed(self.client.post(format!("{}/sync/init", self.base)))?
            .json(request)
            .send()?;
        check(response)
    }

    pub fn sync_upload(&self, path: &str, bytes: &[u8]) -> CliResult<()> {
        let response = self
            .authed(self.client.post(format!("{}/sync/upload", self.base)))?
            .json(&json!({ "path": path, "content_base64": BASE64.encode(bytes) }))
            .send()?;
        check::<Value>(response).map(|_| ())
    }

    pub fn sync_download(&self, path: &str) -> CliResult<Vec<u8>> {
        let response = self
            .authed(self.client.get(format!("{}/sync/download/{path}", self.base)))?
            .send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(error_for_status(status, response.text().unwrap_or_default()));
        }
        Ok(response.bytes()?.to_vec())
    }

    pub fn sync_commit(&self, request: &CommitRequest) -> CliResult<CommitResponse> {
        let response = self
            .authed(self.client.post(format!("{}/sync/commit", self.base)))?
            .json(request)
            .send()?;
        check(response)
    }

    fn authed(
        &self,
        builder: reqwest::blocking::RequestBuilder,
    ) -> CliResult<reqwest::blocking::RequestBuilder> {
        let token = self.token.as_ref().ok_or(CliError::Auth)?;
        Ok(builder.bearer_auth(token))
    }
}

/// Decode a JSON response, mapping HTTP failures to CLI errors.
fn check<T: serde::de::DeserializeOwned>(response: reqwest::blocking::Response) -> CliResult<T> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().unwrap_or_default();
        return Err(error_for_status(status, body));
    }
    response.json().map_err(|err| CliError::Network(format!("malformed response: {err}")))
}

fn error_for_status(status: reqwest::StatusCode, body: String) -> CliError {
    let message = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| v["message"].as_str().map(str::to_string))
        .unwrap_or(body);
    match status.as_u16() {
        401 | 403 => CliError::Auth,
        400 if message.contains("unsafe path") => CliError::PathSafety(message),
        500..=599 => CliError::Network(format!("server error {status}: {message}")),
        _ => CliError::Other(anyhow::anyhow!("request failed ({status}): {message}")),
    }
}
