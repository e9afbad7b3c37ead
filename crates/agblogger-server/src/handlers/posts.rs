//! Post endpoints: listing, fetching, editing, and mutation.
//!
//! `GET /posts/{*path}` dispatches on a `/raw` or `/edit` suffix so the
//! post path itself may contain slashes. Paths in these endpoints are
//! relative to `posts/`.

use std::collections::BTreeSet;

use agblogger_cache::{CachedPost, PostQuery, PostRecord, PostSort, SortOrder};
use agblogger_frontmatter::FrontMatter;
use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::warn;

use crate::error::{ApiError, ApiResult};
use crate::extract::{AdminUser, MaybeUser};
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    pub label: Option<String>,
    /// Comma-separated list, AND-combined.
    pub labels: Option<String>,
    pub author: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub q: Option<String>,
    pub sort: Option<PostSort>,
    pub order: Option<SortOrder>,
    pub draft: Option<bool>,
    pub page: Option<u32>,
    pub per_page: Option<u32>,
}

/// `GET /posts`
pub async fn list(
    State(state): State<AppState>,
    MaybeUser(user): MaybeUser,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<Value>> {
    let is_admin = user.map(|u| u.is_admin).unwrap_or(false);
    let tz = state.site_tz().await;

    let mut labels: Vec<String> = Vec::new();
    if let Some(label) = &params.label {
        labels.push(label.clone());
    }
    if let Some(more) = &params.labels {
        labels.extend(more.split(',').map(|l| l.trim().to_string()).filter(|l| !l.is_empty()));
    }

    let per_page = params.per_page.unwrap_or(20).clamp(1, 100);
    let page = params.page.unwrap_or(1).max(1);
    let query = PostQuery {
        labels,
        author: params.author.clone(),
        created_from: parse_bound(params.from.as_deref(), &tz)?,
        created_to: parse_bound(params.to.as_deref(), &tz)?,
        text: params.q.clone(),
        sort: params.sort.unwrap_or_default(),
        order: params.order.unwrap_or_default(),
        draft: if is_admin { params.draft } else { None },
        include_drafts: is_admin && params.draft.is_none(),
        limit: per_page,
        offset: (page - 1) * per_page,
    };

    let conn = state.db.lock().await;
    let result = agblogger_cache::list_posts(&conn, &query)?;
    Ok(Json(json!({
        "posts": result.posts,
        "total": result.total,
        "page": page,
        "per_page": per_page,
    })))
}

/// `GET /posts/{*path}` — dispatches `/raw` and `/edit` suffixes.
pub async fn get(
    State(state): State<AppState>,
    MaybeUser(user): MaybeUser,
    Path(path): Path<String>,
) -> ApiResult<Response> {
    let is_admin = user.map(|u| u.is_admin).unwrap_or(false);
    if let Some(stripped) = path.strip_suffix("/raw") {
        return raw(&state, is_admin, stripped).await;
    }
    if let Some(stripped) = path.strip_suffix("/edit") {
        if !is_admin {
            return Err(ApiError::Forbidden);
        }
        return edit(&state, stripped).await;
    }
    show(&state, is_admin, &path).await.map(IntoResponse::into_response)
}

/// Resolve a posts-relative reference to the cached row, enforcing draft
/// visibility.
async fn lookup(
    state: &AppState,
    is_admin: bool,
    rel: &str,
) -> ApiResult<(String, CachedPost)> {
    let file_path = state
        .store
        .resolve_post_rel(&format!("posts/{rel}"))
        .ok_or(ApiError::NotFound)?;
    let conn = state.db.lock().await;
    let post = agblogger_cache::get_post(&conn, &file_path)?.ok_or(ApiError::NotFound)?;
    // Drafts are invisible to everyone but admins, flat or directory form.
    if post.is_draft && !is_admin {
        return Err(ApiError::NotFound);
    }
    Ok((file_path, post))
}

async fn show(state: &AppState, is_admin: bool, rel: &str) -> ApiResult<Json<Value>> {
    let (file_path, mut post) = lookup(state, is_admin, rel).await?;

    if post.rendered_html.is_none() {
        let tz = state.site_tz().await;
        let file = state.store.read_post(&file_path, &tz)?;
        let html = state.renderer.render(&file.body).await?;
        let conn = state.db.lock().await;
        agblogger_cache::set_rendered_html(&conn, &file_path, Some(&html))?;
        post.rendered_html = Some(html);
    }
    Ok(Json(json!({ "post": post })))
}

async fn raw(state: &AppState, is_admin: bool, rel: &str) -> ApiResult<Response> {
    let (file_path, _) = lookup(state, is_admin, rel).await?;
    let bytes = state.store.read_bytes(&file_path)?;
    Ok(([(header::CONTENT_TYPE, "text/markdown; charset=utf-8")], bytes).into_response())
}

async fn edit(state: &AppState, rel: &str) -> ApiResult<Response> {
    let (file_path, _) = lookup(state, true, rel).await?;
    let tz = state.site_tz().await;
    let file = state.store.read_post(&file_path, &tz)?;
    let body = json!({
        "file_path": file.rel_path,
        "title": file.title,
        "body": file.body,
        "author": file.front.author,
        "labels": file.front.labels,
        "draft": file.front.draft,
        "created_at": file.front.created_at.map(|dt| agblogger_datetime::format_canonical(&dt)),
        "modified_at": file.front.modified_at.map(|dt| agblogger_datetime::format_canonical(&dt)),
    });
    Ok(Json(body).into_response())
}

#[derive(Debug, Deserialize)]
pub struct CreatePost {
    /// Path relative to `posts/`, e.g. `tech/new-post.md`.
    pub path: String,
    pub body: String,
    #[serde(default)]
    pub labels: BTreeSet<String>,
    #[serde(default)]
    pub draft: bool,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct MutationResponse {
    pub post: CachedPost,
    pub warnings: Vec<String>,
}

/// `POST /posts` (admin)
pub async fn create(
    State(state): State<AppState>,
    AdminUser(_): AdminUser,
    Json(request): Json<CreatePost>,
) -> ApiResult<Json<MutationResponse>> {
    let file_path = posts_rel(&request.path)?;
    if !file_path.ends_with(".md") {
        return Err(ApiError::BadRequest("post paths must end in .md".to_string()));
    }
    if state.store.exists(&file_path) {
        return Err(ApiError::Conflict(format!("{file_path} already exists")));
    }
    let tz = state.site_tz().await;
    let now = tz.now();

    let mut front = FrontMatter::default();
    front.created_at = match &request.created_at {
        Some(raw) => Some(
            agblogger_datetime::parse(raw, &tz)
                .map_err(|err| ApiError::BadRequest(err.to_string()))?,
        ),
        None => Some(now),
    };
    front.modified_at = Some(now);
    front.author =
        Some(request.author.clone().unwrap_or(state.default_author().await));
    front.labels = request.labels.clone();
    front.draft = request.draft;

    persist(&state, &file_path, front, &request.body).await
}

#[derive(Debug, Deserialize)]
pub struct UpdatePost {
    pub body: String,
    #[serde(default)]
    pub labels: Option<BTreeSet<String>>,
    #[serde(default)]
    pub draft: Option<bool>,
    #[serde(default)]
    pub author: Option<String>,
}

/// `PUT /posts/{*path}` (admin)
pub async fn update(
    State(state): State<AppState>,
    AdminUser(_): AdminUser,
    Path(path): Path<String>,
    Json(request): Json<UpdatePost>,
) -> ApiResult<Json<MutationResponse>> {
    let rel = posts_rel(&path)?;
    let file_path = state.store.resolve_post_rel(&rel).ok_or(ApiError::NotFound)?;
    let tz = state.site_tz().await;

    // Start from the existing header so unknown fields and created_at
    // survive the update.
    let existing = state.store.read_post(&file_path, &tz)?;
    let mut front = existing.front.clone();
    front.modified_at = Some(tz.now());
    if front.created_at.is_none() {
        front.created_at = Some(tz.now());
    }
    if let Some(labels) = request.labels {
        front.labels = labels;
    }
    if let Some(draft) = request.draft {
        front.draft = draft;
    }
    if let Some(author) = request.author {
        front.author = Some(author);
    }

    persist(&state, &file_path, front, &request.body).await
}

/// `DELETE /posts/{*path}` (admin)
pub async fn delete(
    State(state): State<AppState>,
    AdminUser(_): AdminUser,
    Path(path): Path<String>,
) -> ApiResult<Json<Value>> {
    let rel = posts_rel(&path)?;
    let file_path = state.store.resolve_post_rel(&rel).ok_or(ApiError::NotFound)?;

    state.store.delete_post(&file_path)?;
    let mut warnings = Vec::new();
    if let Err(err) = state.repo.commit_all(&format!("delete {file_path}")) {
        warn!(%err, path = file_path, "git commit failed after delete");
        warnings.push(format!("git commit failed: {err}"));
    }
    {
        let mut conn = state.db.lock().await;
        agblogger_cache::remove_post(&mut conn, &file_path)?;
    }
    Ok(Json(json!({ "status": "deleted", "warnings": warnings })))
}

/// Shared tail of create/update: write the file, commit, refresh the
/// cache row, render. Renderer and git failures after the successful
/// write degrade to warnings; the filesystem is already authoritative.
async fn persist(
    state: &AppState,
    file_path: &str,
    front: FrontMatter,
    body: &str,
) -> ApiResult<Json<MutationResponse>> {
    let tz = state.site_tz().await;
    state.store.write_post(file_path, &front, body)?;

    let mut warnings = Vec::new();
    if let Err(err) = state.repo.commit_all(&format!("edit {file_path}")) {
        warn!(%err, path = file_path, "git commit failed after write");
        warnings.push(format!("git commit failed: {err}"));
    }

    let file = state.store.read_post(file_path, &tz)?;
    let record = PostRecord::from_post_file(&file, &state.default_author().await, &tz);
    {
        let mut conn = state.db.lock().await;
        agblogger_cache::upsert_post(&mut conn, &record)?;
    }

    match state.renderer.render(&file.body).await {
        Ok(html) => {
            let conn = state.db.lock().await;
            agblogger_cache::set_rendered_html(&conn, file_path, Some(&html))?;
        }
        Err(err) => {
            warn!(%err, path = file_path, "render after write failed");
            warnings.push(format!("render failed: {err}"));
        }
    }

    let conn = state.db.lock().await;
    let post = agblogger_cache::get_post(&conn, file_path)?.ok_or(ApiError::NotFound)?;
    Ok(Json(MutationResponse { post, warnings }))
}

fn parse_bound(
    raw: Option<&str>,
    tz: &agblogger_datetime::SiteTz,
) -> ApiResult<Option<chrono::DateTime<chrono::FixedOffset>>> {
    match raw {
        None => Ok(None),
        Some(text) => agblogger_datetime::parse(text, tz)
            .map(Some)
            .map_err(|err| ApiError::BadRequest(err.to_string())),
    }
}

/// Normalize a posts-relative reference (the same convention as the GET
/// surface: paths are relative to `posts/`). The content store
/// revalidates on every filesystem touch.
fn posts_rel(raw: &str) -> ApiResult<String> {
    let trimmed = raw.trim_start_matches('/');
    if trimmed.is_empty() {
        return Err(ApiError::BadRequest("empty post path".to_string()));
    }
    let full = format!("posts/{trimmed}");
    if !agblogger_sync::is_syncable_rel_path(&full) {
        return Err(ApiError::BadRequest(format!("unsafe path: {raw:?}")));
    }
    Ok(full)
}
