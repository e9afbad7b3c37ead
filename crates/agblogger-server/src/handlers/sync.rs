//! Sync endpoints: thin wrappers over the sync engine. Admin only.

use agblogger_sync::{CommitRequest, CommitResponse, InitRequest, SyncPlan};
use axum::Json;
use axum::extract::{Path, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::error::{ApiError, ApiResult};
use crate::extract::AdminUser;
use crate::state::AppState;

/// `POST /sync/init`
pub async fn init(
    State(state): State<AppState>,
    AdminUser(_): AdminUser,
    Json(request): Json<InitRequest>,
) -> ApiResult<Json<SyncPlan>> {
    Ok(Json(state.sync.plan(&request).await?))
}

#[derive(Debug, Deserialize)]
pub struct UploadRequest {
    pub path: String,
    pub content_base64: String,
}

/// `POST /sync/upload` — idempotent per path.
pub async fn upload(
    State(state): State<AppState>,
    AdminUser(_): AdminUser,
    Json(request): Json<UploadRequest>,
) -> ApiResult<Json<Value>> {
    let bytes = BASE64
        .decode(&request.content_base64)
        .map_err(|_| ApiError::BadRequest("content is not valid base64".to_string()))?;
    state.sync.receive_upload(&request.path, &bytes).await?;
    Ok(Json(json!({ "status": "stored", "path": request.path })))
}

/// `GET /sync/download/{*path}`
pub async fn download(
    State(state): State<AppState>,
    AdminUser(_): AdminUser,
    Path(path): Path<String>,
) -> ApiResult<Response> {
    let bytes = state.sync.serve_download(&path).await?;
    Ok(([(header::CONTENT_TYPE, "application/octet-stream")], bytes).into_response())
}

/// `POST /sync/commit` — the globally serialized finalization step.
pub async fn commit(
    State(state): State<AppState>,
    AdminUser(_): AdminUser,
    Json(request): Json<CommitRequest>,
) -> ApiResult<Json<CommitResponse>> {
    Ok(Json(state.sync.commit(&request).await?))
}
