//! Site pages, assets, settings, render preview, and liveness.

use agblogger_config::{IndexConfig, SiteSection, TIMELINE_PAGE_ID};
use agblogger_frontmatter::FrontMatter;
use axum::Json;
use axum::extract::{Path, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::error::{ApiError, ApiResult};
use crate::extract::{AdminUser, CurrentUser};
use crate::state::AppState;

/// `GET /healthz`
pub async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// `GET /pages`
pub async fn list_pages(State(state): State<AppState>) -> Json<Value> {
    let site = state.site.read().await;
    Json(json!({
        "site": { "title": site.site.title, "description": site.site.description },
        "pages": site.pages,
    }))
}

/// `GET /pages/{id}` — renders file-backed pages; the timeline id is the
/// built-in post listing and carries no body.
pub async fn get_page(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let (entry, tz) = {
        let site = state.site.read().await;
        let entry = site.page(&id).cloned().ok_or(ApiError::NotFound)?;
        let tz = agblogger_datetime::SiteTz::new(site.site.timezone.as_deref());
        (entry, tz)
    };
    if entry.id == TIMELINE_PAGE_ID {
        return Ok(Json(json!({ "id": entry.id, "title": entry.title, "timeline": true })));
    }
    let Some(file) = &entry.file else {
        return Ok(Json(json!({ "id": entry.id, "title": entry.title, "html": "" })));
    };
    let bytes = state.store.read_bytes(file)?;
    let text =
        String::from_utf8(bytes).map_err(|_| ApiError::BadRequest("page is not UTF-8".into()))?;
    let (_, body) = FrontMatter::parse(&text, &tz);
    let html = state.renderer.render(&body).await?;
    Ok(Json(json!({ "id": entry.id, "title": entry.title, "html": html })))
}

/// `GET /assets/{*path}` — binary asset serving under path safety.
/// Markdown and configuration stay off this surface.
pub async fn asset(
    State(state): State<AppState>,
    Path(path): Path<String>,
) -> ApiResult<Response> {
    if path.ends_with(".md") || path.ends_with(".toml") {
        return Err(ApiError::NotFound);
    }
    if !agblogger_sync::is_syncable_rel_path(&path) {
        return Err(ApiError::BadRequest(format!("unsafe path: {path:?}")));
    }
    let bytes = state.store.read_bytes(&path)?;
    let mime = mime_guess::from_path(&path).first_or_octet_stream();
    Ok(([(header::CONTENT_TYPE, mime.as_ref().to_string())], bytes).into_response())
}

#[derive(Debug, Deserialize)]
pub struct PreviewRequest {
    pub markdown: String,
}

/// `POST /render/preview` — synchronous preview for authenticated users.
pub async fn preview(
    State(state): State<AppState>,
    _user: CurrentUser,
    Json(request): Json<PreviewRequest>,
) -> ApiResult<Json<Value>> {
    let html = state.renderer.render(&request.markdown).await?;
    Ok(Json(json!({ "html": html })))
}

/// `GET /settings` (admin)
pub async fn get_settings(
    State(state): State<AppState>,
    AdminUser(_): AdminUser,
) -> Json<SiteSection> {
    let site = state.site.read().await;
    Json(site.site.clone())
}

/// `PUT /settings` (admin) — replaces the `[site]` section of
/// `index.toml` atomically and reloads the in-memory copy.
pub async fn put_settings(
    State(state): State<AppState>,
    AdminUser(_): AdminUser,
    Json(section): Json<SiteSection>,
) -> ApiResult<Json<SiteSection>> {
    let mut site = state.site.write().await;
    let updated = IndexConfig { site: section, pages: site.pages.clone() };
    updated.store(state.store.root())?;
    *site = updated;
    Ok(Json(site.site.clone()))
}
