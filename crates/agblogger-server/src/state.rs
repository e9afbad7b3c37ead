//! Shared application state.

use std::sync::Arc;
use std::time::Duration;

use agblogger_auth::{RateLimiter, TokenSigner};
use agblogger_cache::Db;
use agblogger_config::IndexConfig;
use agblogger_content::ContentStore;
use agblogger_datetime::SiteTz;
use agblogger_git::GitRepo;
use agblogger_render::Renderer;
use agblogger_sync::SyncEngine;
use anyhow::{Context, Result};
use tokio::sync::RwLock;
use tracing::info;

use crate::settings::ServerSettings;

/// Default author used when neither front matter nor config name one.
pub const FALLBACK_AUTHOR: &str = "anonymous";

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<ServerSettings>,
    pub store: ContentStore,
    pub db: Db,
    pub repo: GitRepo,
    pub renderer: Arc<Renderer>,
    pub sync: Arc<SyncEngine>,
    pub signer: TokenSigner,
    pub limiter: Arc<RateLimiter>,
    /// Site configuration, reloadable through the settings endpoint.
    pub site: Arc<RwLock<IndexConfig>>,
}

impl AppState {
    /// Wire up every subsystem: content store, database, git repository,
    /// renderer, sync engine, and the initial cache rebuild.
    pub async fn initialize(settings: ServerSettings) -> Result<Self> {
        let store =
            ContentStore::open(&settings.content_dir).context("failed to open content dir")?;
        let db = if settings.database_path.to_str() == Some(":memory:") {
            Db::open_in_memory()
        } else {
            Db::open(&settings.database_path)
        }
        .context("failed to open cache database")?;

        let repo = GitRepo::new(store.root());
        repo.init_if_absent().context("failed to initialize content repository")?;

        let site = IndexConfig::load(store.root()).context("failed to load index.toml")?;
        let tz = SiteTz::new(site.site.timezone.as_deref());
        let default_author =
            site.site.default_author.clone().unwrap_or_else(|| FALLBACK_AUTHOR.to_string());

        let renderer = Arc::new(Renderer::new(settings.render.clone()));
        let sync = Arc::new(SyncEngine::new(
            store.clone(),
            repo.clone(),
            db.clone(),
            tz,
            default_author.clone(),
        ));
        let signer = TokenSigner::new(&settings.secret_key, settings.access_token_ttl());
        let limiter = Arc::new(RateLimiter::new(5, Duration::from_secs(15 * 60)));

        let state = Self {
            settings: Arc::new(settings),
            store,
            db,
            repo,
            renderer,
            sync,
            signer,
            limiter,
            site: Arc::new(RwLock::new(site)),
        };

        state.bootstrap_admin().await?;
        let count = agblogger_cache::rebuild_from_disk(
            &state.db,
            &state.store,
            &state.site_tz().await,
            &state.default_author().await,
        )
        .await
        .context("initial cache rebuild failed")?;
        info!(posts = count, "initial cache rebuild complete");

        Ok(state)
    }

    /// The site timezone as currently configured.
    pub async fn site_tz(&self) -> SiteTz {
        let site = self.site.read().await;
        SiteTz::new(site.site.timezone.as_deref())
    }

    /// The default author as currently configured.
    pub async fn default_author(&self) -> String {
        let site = self.site.read().await;
        site.site.default_author.clone().unwrap_or_else(|| FALLBACK_AUTHOR.to_string())
    }

    /// First startup bootstraps a single admin from the environment when
    /// no such user exists yet.
    async fn bootstrap_admin(&self) -> Result<()> {
        let (Some(username), Some(password)) =
            (&self.settings.admin_username, &self.settings.admin_password)
        else {
            return Ok(());
        };
        let conn = self.db.lock().await;
        if agblogger_auth::find_user_by_username(&conn, username)?.is_some() {
            return Ok(());
        }
        let hash = agblogger_auth::hash_password(password)?;
        agblogger_auth::create_user(
            &conn,
            &agblogger_auth::NewUser {
                username: username.clone(),
                email: format!("{username}@localhost"),
                password_hash: hash,
                display_name: None,
                is_admin: true,
            },
        )?;
        info!(username, "bootstrapped admin user");
        Ok(())
    }
}
