//! Label endpoints: queries over the cache, mutations through the DAG.
//!
//! Mutations run the in-memory cycle check first, then apply to the
//! database, then write `labels.toml`. The TOML write is atomic; when it
//! fails, the open transaction is rolled back, so cache and file never
//! diverge.

use agblogger_cache::{CachedLabel, PostQuery};
use agblogger_labels::{Label, LabelGraph};
use axum::Json;
use axum::extract::{Path, Query, State};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::error::{ApiError, ApiResult};
use crate::extract::{AdminUser, MaybeUser};
use crate::handlers::posts::ListParams;
use crate::state::AppState;

/// `GET /labels`
pub async fn list(State(state): State<AppState>) -> ApiResult<Json<Vec<CachedLabel>>> {
    let conn = state.db.lock().await;
    Ok(Json(agblogger_cache::list_labels(&conn)?))
}

/// `GET /labels/{id}`
pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let conn = state.db.lock().await;
    let label = agblogger_cache::get_label(&conn, &id)?.ok_or(ApiError::NotFound)?;
    let descendants = agblogger_cache::label_descendants(&conn, &id)?;
    Ok(Json(json!({ "label": label, "descendants": descendants })))
}

/// `GET /labels/{id}/posts` — posts carrying the label or any descendant.
pub async fn posts(
    State(state): State<AppState>,
    MaybeUser(user): MaybeUser,
    Path(id): Path<String>,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<Value>> {
    let is_admin = user.map(|u| u.is_admin).unwrap_or(false);
    let per_page = params.per_page.unwrap_or(20).clamp(1, 100);
    let page = params.page.unwrap_or(1).max(1);

    let conn = state.db.lock().await;
    if agblogger_cache::get_label(&conn, &id)?.is_none() {
        return Err(ApiError::NotFound);
    }
    let query = PostQuery {
        labels: vec![id.clone()],
        include_drafts: is_admin,
        limit: per_page,
        offset: (page - 1) * per_page,
        ..Default::default()
    };
    let result = agblogger_cache::list_posts(&conn, &query)?;
    Ok(Json(json!({
        "label": id,
        "posts": result.posts,
        "total": result.total,
        "page": page,
        "per_page": per_page,
    })))
}

/// `GET /labels/graph` — every node plus the full edge list.
pub async fn graph(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let conn = state.db.lock().await;
    let labels = agblogger_cache::list_labels(&conn)?;
    let edges: Vec<(String, String)> = labels
        .iter()
        .flat_map(|l| l.parents.iter().map(|p| (l.id.clone(), p.clone())))
        .collect();
    Ok(Json(json!({ "labels": labels, "edges": edges })))
}

#[derive(Debug, Deserialize)]
pub struct LabelBody {
    #[serde(default)]
    pub names: Vec<String>,
    #[serde(default)]
    pub parents: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateLabel {
    pub id: String,
    #[serde(flatten)]
    pub body: LabelBody,
}

/// `POST /labels` (admin)
pub async fn create(
    State(state): State<AppState>,
    AdminUser(_): AdminUser,
    Json(request): Json<CreateLabel>,
) -> ApiResult<Json<CachedLabel>> {
    upsert(&state, &request.id, request.body, true).await
}

/// `PUT /labels/{id}` (admin)
pub async fn update(
    State(state): State<AppState>,
    AdminUser(_): AdminUser,
    Path(id): Path<String>,
    Json(body): Json<LabelBody>,
) -> ApiResult<Json<CachedLabel>> {
    upsert(&state, &id, body, false).await
}

/// `DELETE /labels/{id}` (admin) — removes the label and every edge
/// referencing it from both the cache and `labels.toml`.
pub async fn delete(
    State(state): State<AppState>,
    AdminUser(_): AdminUser,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let mut conn = state.db.lock().await;
    let mut graph = load_graph(&conn)?;
    graph.delete(&id)?;

    let tx = conn.transaction().map_err(agblogger_cache::CacheError::from)?;
    agblogger_cache::delete_label(&tx, &id)?;
    graph.to_file().store(state.store.root())?;
    tx.commit().map_err(agblogger_cache::CacheError::from)?;
    Ok(Json(json!({ "status": "deleted", "id": id })))
}

/// Shared create/update body. The cycle check runs on the rebuilt graph
/// before any edge is touched; `create_only` turns an existing id into a
/// 409.
async fn upsert(
    state: &AppState,
    id: &str,
    body: LabelBody,
    create_only: bool,
) -> ApiResult<Json<CachedLabel>> {
    let mut conn = state.db.lock().await;
    let mut graph = load_graph(&conn)?;

    let exists_explicit = graph.get(id).map(|l| !l.is_implicit).unwrap_or(false);
    if create_only && exists_explicit {
        return Err(ApiError::Conflict(format!("label {id:?} already exists")));
    }
    if !create_only && !graph.contains(id) {
        return Err(ApiError::NotFound);
    }

    let label = Label {
        id: id.to_string(),
        names: body.names,
        parents: body.parents.into_iter().collect(),
        is_implicit: false,
    };
    graph.upsert(label.clone())?;

    // Database first, inside a transaction; the TOML write is the
    // reversible step in the middle.
    let tx = conn.transaction().map_err(agblogger_cache::CacheError::from)?;
    agblogger_cache::upsert_label(&tx, &label)?;
    graph.to_file().store(state.store.root())?;
    tx.commit().map_err(agblogger_cache::CacheError::from)?;

    let fresh = agblogger_cache::get_label(&conn, id)?.ok_or(ApiError::NotFound)?;
    Ok(Json(fresh))
}

/// Rebuild the in-memory DAG from the cache rows.
fn load_graph(conn: &rusqlite::Connection) -> ApiResult<LabelGraph> {
    let rows = agblogger_cache::list_labels(conn)?;
    Ok(LabelGraph::from_labels(rows.into_iter().map(|row| Label {
        id: row.id,
        names: row.names,
        parents: row.parents.into_iter().collect(),
        is_implicit: row.is_implicit,
    })))
}
