//! Client for the long-lived markdown rendering engine.
//!
//! The engine is an external process that serves `POST /render` and
//! `GET /health` on a local port. This crate owns its lifecycle: lazy
//! spawn behind a double-checked async lock, health polling after spawn,
//! one restart attempt per render call, and SIGTERM→SIGKILL escalation on
//! shutdown. Render concurrency is bounded by a semaphore; each call has a
//! hard timeout. Every rendered document passes through the sanitizer
//! before it is returned.

use std::process::Stdio;
use std::time::Duration;

use agblogger_sanitize::{SanitizeOptions, sanitize_with};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, error, warn};

/// Renderer failures, mapped to HTTP statuses at the boundary.
#[derive(Debug, Error)]
pub enum RenderError {
    /// The engine cannot be reached even after a restart attempt.
    #[error("render engine unavailable: {0}")]
    Unavailable(String),
    /// The engine answered with an error for this document.
    #[error("render failed: {0}")]
    Failed(String),
    #[error("input is {size} bytes, over the {max} byte render limit")]
    InputTooLarge { size: usize, max: usize },
    #[error("render timed out")]
    Timeout,
}

/// Engine process and pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderConfig {
    /// Engine executable.
    pub command: String,
    /// Arguments; every `{port}` placeholder is substituted.
    pub args: Vec<String>,
    /// Local port the engine listens on.
    pub port: u16,
    /// Maximum concurrent render requests.
    pub max_concurrency: usize,
    /// Per-document timeout in seconds.
    pub timeout_secs: u64,
    /// Maximum markdown input size in bytes.
    pub max_input_bytes: usize,
    /// How long to wait for the engine to pass its health check after a
    /// spawn.
    pub startup_timeout_secs: u64,
    #[serde(default)]
    pub sanitize: SanitizeOptions,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            command: "agblogger-mdengine".to_string(),
            args: vec!["--port".to_string(), "{port}".to_string()],
            port: 8701,
            max_concurrency: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4),
            timeout_secs: 10,
            max_input_bytes: 2 * 1024 * 1024,
            startup_timeout_secs: 10,
            sanitize: SanitizeOptions::default(),
        }
    }
}

#[derive(Serialize)]
struct RenderRequest<'md> {
    markdown: &'md str,
}

#[derive(Deserialize)]
struct RenderResponse {
    #[serde(default)]
    html: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Shared renderer handle.
pub struct Renderer {
    config: RenderConfig,
    client: reqwest::Client,
    permits: Semaphore,
    engine: Mutex<Option<Child>>,
}

impl Renderer {
    pub fn new(config: RenderConfig) -> Self {
        let permits = Semaphore::new(config.max_concurrency.max(1));
        Self { config, client: reqwest::Client::new(), permits, engine: Mutex::new(None) }
    }

    /// Render markdown to sanitized HTML.
    pub async fn render(&self, markdown: &str) -> Result<String, RenderError> {
        if markdown.len() > self.config.max_input_bytes {
            return Err(RenderError::InputTooLarge {
                size: markdown.len(),
                max: self.config.max_input_bytes,
            });
        }
        let _permit = self.permits.acquire().await.map_err(|_| {
            RenderError::Unavailable("renderer is shutting down".to_string())
        })?;

        match self.render_once(markdown).await {
            Ok(html) => self.sanitize_off_loop(html).await,
            Err(RenderError::Unavailable(first)) => {
                warn!(error = first, "render transport error, restarting engine");
                self.restart_engine().await?;
                match self.render_once(markdown).await {
                    Ok(html) => self.sanitize_off_loop(html).await,
                    Err(err) => {
                        error!(%err, "render still failing after engine restart");
                        Err(err)
                    }
                }
            }
            Err(err) => Err(err),
        }
    }

    /// Sanitization is CPU-bound and can be large; keep it off the event
    /// loop.
    async fn sanitize_off_loop(&self, html: String) -> Result<String, RenderError> {
        let opts = self.config.sanitize.clone();
        tokio::task::spawn_blocking(move || sanitize_with(&html, &opts))
            .await
            .map_err(|err| RenderError::Unavailable(format!("sanitizer task failed: {err}")))
    }

    /// One HTTP round-trip to the engine.
    async fn render_once(&self, markdown: &str) -> Result<String, RenderError> {
        let url = format!("http://127.0.0.1:{}/render", self.config.port);
        let request = self
            .client
            .post(&url)
            .json(&RenderRequest { markdown })
            .timeout(Duration::from_secs(self.config.timeout_secs))
            .send();

        let response = match request.await {
            Ok(r) => r,
            Err(err) if err.is_timeout() => return Err(RenderError::Timeout),
            Err(err) => return Err(RenderError::Unavailable(err.to_string())),
        };

        let status = response.status();
        let body: RenderResponse = match response.json().await {
            Ok(b) => b,
            Err(err) if err.is_timeout() => return Err(RenderError::Timeout),
            Err(err) => return Err(RenderError::Unavailable(err.to_string())),
        };
        if let Some(error) = body.error {
            return Err(RenderError::Failed(summarize(&error)));
        }
        match body.html {
            Some(html) if status.is_success() => Ok(html),
            _ => Err(RenderError::Failed(format!("engine answered {status} without html"))),
        }
    }

    /// Restart the engine under the lock. Double-checked: if another task
    /// already restarted it and it answers its health check, do nothing.
    async fn restart_engine(&self) -> Result<(), RenderError> {
        let mut guard = self.engine.lock().await;
        if guard.is_some() && self.health_ok().await {
            return Ok(());
        }
        if let Some(child) = guard.take() {
            terminate(child).await;
        }

        let args: Vec<String> = self
            .config
            .args
            .iter()
            .map(|a| a.replace("{port}", &self.config.port.to_string()))
            .collect();
        debug!(command = self.config.command, ?args, "spawning render engine");
        let child = Command::new(&self.config.command)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                RenderError::Unavailable(format!(
                    "failed to spawn {:?}: {err}",
                    self.config.command
                ))
            })?;
        *guard = Some(child);

        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(self.config.startup_timeout_secs);
        loop {
            if self.health_ok().await {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(RenderError::Unavailable(
                    "engine did not become healthy before the startup deadline".to_string(),
                ));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    async fn health_ok(&self) -> bool {
        let url = format!("http://127.0.0.1:{}/health", self.config.port);
        match self.client.get(&url).timeout(Duration::from_secs(1)).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    /// Stop accepting renders and bring the engine down.
    pub async fn shutdown(&self) {
        self.permits.close();
        let mut guard = self.engine.lock().await;
        if let Some(child) = guard.take() {
            terminate(child).await;
        }
    }
}

/// SIGTERM, a grace period, then SIGKILL.
async fn terminate(mut child: Child) {
    if let Some(pid) = child.id() {
        let _ = Command::new("kill")
            .args(["-TERM", &pid.to_string()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if tokio::time::timeout(Duration::from_secs(3), child.wait()).await.is_ok() {
            return;
        }
    }
    let _ = child.kill().await;
}

/// First line of engine output, capped, for error surfaces.
fn summarize(error: &str) -> String {
    let first = error.lines().next().unwrap_or(error);
    if first.len() <= 300 {
        return first.to_string();
    }
    let mut cut = 300;
    while !first.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…", &first[..cut])
}
