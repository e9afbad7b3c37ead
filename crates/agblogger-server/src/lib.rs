//! The agblogger HTTP boundary.
//!
//! Everything here is thin: routing, authentication middleware, and
//! translation between HTTP and the core crates. The subsystems live in
//! the workspace crates (`agblogger-content`, `agblogger-sync`,
//! `agblogger-cache`, …); handlers orchestrate them and map their errors
//! to statuses through [`error::ApiError`].

pub mod error;
pub mod extract;
pub mod handlers;
pub mod settings;
pub mod state;

use axum::Router;
use axum::middleware;
use axum::routing::{delete, get, post};
use tower_http::trace::TraceLayer;

/// Build the full router over an initialized state.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        // Liveness and site shell.
        .route("/healthz", get(handlers::pages::healthz))
        .route("/pages", get(handlers::pages::list_pages))
        .route("/pages/{id}", get(handlers::pages::get_page))
        .route("/assets/{*path}", get(handlers::pages::asset))
        .route("/settings", get(handlers::pages::get_settings).put(handlers::pages::put_settings))
        // Auth and sessions.
        .route("/auth/login", post(handlers::auth::login))
        .route("/auth/refresh", post(handlers::auth::refresh))
        .route("/auth/logout", post(handlers::auth::logout))
        .route("/auth/register", post(handlers::auth::register))
        .route("/auth/me", get(handlers::auth::me))
        .route("/auth/invites", post(handlers::auth::create_invite))
        .route("/auth/tokens", post(handlers::auth::create_pat).get(handlers::auth::list_pats))
        .route("/auth/tokens/{id}", delete(handlers::auth::revoke_pat))
        // Posts.
        .route("/posts", get(handlers::posts::list).post(handlers::posts::create))
        .route(
            "/posts/{*path}",
            get(handlers::posts::get)
                .put(handlers::posts::update)
                .delete(handlers::posts::delete),
        )
        // Labels.
        .route("/labels", get(handlers::labels::list).post(handlers::labels::create))
        .route("/labels/graph", get(handlers::labels::graph))
        .route(
            "/labels/{id}",
            get(handlers::labels::get)
                .put(handlers::labels::update)
                .delete(handlers::labels::delete),
        )
        .route("/labels/{id}/posts", get(handlers::labels::posts))
        // Sync.
        .route("/sync/init", post(handlers::sync::init))
        .route("/sync/upload", post(handlers::sync::upload))
        .route("/sync/download/{*path}", get(handlers::sync::download))
        .route("/sync/commit", post(handlers::sync::commit))
        // Render preview.
        .route("/render/preview", post(handlers::pages::preview))
        // Social accounts.
        .route(
            "/social/accounts",
            get(handlers::social::list).post(handlers::social::create),
        )
        .route("/social/accounts/{id}", delete(handlers::social::delete))
        .route("/social/accounts/{id}/validate", post(handlers::social::validate))
        // Security middleware; CSRF wraps everything, host check first.
        .layer(middleware::from_fn(extract::csrf_guard))
        .layer(middleware::from_fn_with_state(state.clone(), extract::trusted_hosts_guard))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// Re-exports used by the binary and the integration tests.
pub use error::{ApiError, ApiResult};
pub use settings::ServerSettings;
pub use state::AppState;
