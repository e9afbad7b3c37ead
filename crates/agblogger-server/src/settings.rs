//! Server settings, read once from the environment at startup.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use agblogger_render::RenderConfig;
use anyhow::{Context, Result, bail};

/// Deployment environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

/// Everything the binary reads from the environment.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub environment: Environment,
    /// Signing and sealing secret. Required in production.
    pub secret_key: String,
    pub content_dir: PathBuf,
    /// SQLite database path.
    pub database_path: PathBuf,
    /// Host names accepted in production.
    pub trusted_hosts: Vec<String>,
    pub bind: SocketAddr,
    /// Bootstrap admin account.
    pub admin_username: Option<String>,
    pub admin_password: Option<String>,
    /// Whether invite-gated self-registration is open.
    pub registration_enabled: bool,
    pub render: RenderConfig,
}

impl ServerSettings {
    /// Read settings from the process environment.
    pub fn from_env() -> Result<Self> {
        let environment = match std::env::var("AGB_ENV").as_deref() {
            Ok("production") => Environment::Production,
            _ => Environment::Development,
        };

        let secret_key = match std::env::var("SECRET_KEY") {
            Ok(key) if !key.is_empty() => key,
            _ if environment == Environment::Production => {
                bail!("SECRET_KEY is required in production");
            }
            _ => "agblogger-development-secret".to_string(),
        };

        let trusted_hosts: Vec<String> = std::env::var("TRUSTED_HOSTS")
            .unwrap_or_default()
            .split(',')
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())
            .collect();
        if environment == Environment::Production && trusted_hosts.is_empty() {
            bail!("TRUSTED_HOSTS is required in production");
        }

        let content_dir =
            PathBuf::from(std::env::var("CONTENT_DIR").unwrap_or_else(|_| "content".to_string()));
        let database_path = PathBuf::from(
            std::env::var("DATABASE_URL").unwrap_or_else(|_| "agblogger.db".to_string()),
        );
        let bind: SocketAddr = std::env::var("AGB_BIND")
            .unwrap_or_else(|_| "127.0.0.1:8700".to_string())
            .parse()
            .context("AGB_BIND is not a socket address")?;

        let mut render = RenderConfig::default();
        if let Ok(command) = std::env::var("AGB_RENDER_COMMAND") {
            render.command = command;
        }
        if let Ok(args) = std::env::var("AGB_RENDER_ARGS") {
            render.args = args.split_whitespace().map(str::to_string).collect();
        }
        if let Ok(port) = std::env::var("AGB_RENDER_PORT") {
            render.port = port.parse().context("AGB_RENDER_PORT is not a port")?;
        }
        if let Ok(timeout) = std::env::var("AGB_RENDER_TIMEOUT_SECS") {
            render.timeout_secs = timeout.parse().context("AGB_RENDER_TIMEOUT_SECS")?;
        }
        if let Ok(limit) = std::env::var("AGB_RENDER_MAX_CONCURRENCY") {
            render.max_concurrency = limit.parse().context("AGB_RENDER_MAX_CONCURRENCY")?;
        }

        Ok(Self {
            environment,
            secret_key,
            content_dir,
            database_path,
            trusted_hosts,
            bind,
            admin_username: std::env::var("ADMIN_USERNAME").ok().filter(|s| !s.is_empty()),
            admin_password: std::env::var("ADMIN_PASSWORD").ok().filter(|s| !s.is_empty()),
            registration_enabled: std::env::var("AGB_ENABLE_REGISTRATION").as_deref() == Ok("1"),
            render,
        })
    }

    pub fn is_production(&self) -> bool {
        self.environment == Environment::Production
    }

    /// Cookies are `Secure` only in production so local development over
    /// plain http keeps working.
    pub fn secure_cookies(&self) -> bool {
        self.is_production()
    }

    pub fn access_token_ttl(&self) -> Duration {
        agblogger_auth::ACCESS_TOKEN_TTL
    }

    pub fn refresh_token_ttl(&self) -> Duration {
        agblogger_auth::REFRESH_TOKEN_TTL
    }

    /// Settings suitable for tests: everything local, no bootstrap admin.
    pub fn for_tests(content_dir: PathBuf) -> Self {
        Self {
            environment: Environment::Development,
            secret_key: "test-secret".to_string(),
            content_dir,
            database_path: PathBuf::from(":memory:"),
            trusted_hosts: Vec::new(),
            bind: SocketAddr::from(([127, 0, 0, 1], 0)),
            admin_username: None,
            admin_password: None,
            registration_enabled: true,
            render: RenderConfig::default(),
        }
    }
}
