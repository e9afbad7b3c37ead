//! Server side of the sync protocol: plan building and COMMIT.

use std::collections::BTreeSet;

use agblogger_cache::Db;
use agblogger_content::{ContentStore, sha256_hex};
use agblogger_datetime::SiteTz;
use agblogger_frontmatter::FrontMatter;
use agblogger_git::GitRepo;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::classify::{Action, classify};
use crate::types::{
    BinaryConflict, CommitRequest, CommitResponse, CommitStatus, ConflictDescriptor, InitRequest,
    Manifest, SyncPlan, is_syncable_rel_path,
};
use crate::{SyncError, SyncResult};

/// Server-side sync engine. Plans are stateless; COMMIT (and the cache
/// rebuild it triggers) is serialized by the engine's async mutex.
pub struct SyncEngine {
    store: ContentStore,
    repo: GitRepo,
    db: Db,
    tz: SiteTz,
    default_author: String,
    commit_lock: Mutex<()>,
}

impl SyncEngine {
    pub fn new(store: ContentStore, repo: GitRepo, db: Db, tz: SiteTz, default_author: String) -> Self {
        Self { store, repo, db, tz, default_author, commit_lock: Mutex::new(()) }
    }

    /// Build the plan for a client manifest. No state is retained; every
    /// later request re-validates against disk.
    pub async fn plan(&self, request: &InitRequest) -> SyncResult<SyncPlan> {
        let base_commit = self.validated_base(&request.last_sync_commit)?;
        for path in request.manifest.keys() {
            if !is_syncable_rel_path(path) {
                return Err(SyncError::UnsafePath(path.clone()));
            }
        }

        let server_manifest = self.store.scan_all();
        let mut plan = SyncPlan {
            server_commit: self.repo.head_commit().map_err(SyncError::Git)?,
            ..Default::default()
        };

        let paths: BTreeSet<&String> =
            request.manifest.keys().chain(server_manifest.keys()).collect();
        for path in paths {
            let client = request.manifest.get(path.as_str()).map(|s| s.sha256.as_str());
            let server = server_manifest.get(path.as_str()).map(|s| s.sha256.as_str());
            let base = self.base_hash(base_commit.as_deref(), path)?;

            match classify(client, server, base.as_deref()) {
                Action::Skip => plan.unchanged.push(path.clone()),
                Action::Upload => plan.upload.push(path.clone()),
                Action::Download => plan.download.push(path.clone()),
                Action::DeleteClient => plan.delete_client.push(path.clone()),
                Action::DeleteServer => plan.delete_server.push(path.clone()),
                Action::Conflict => plan.conflicts.push(path.clone()),
                Action::Coincident => plan.coincident.push(path.clone()),
            }
        }
        Ok(plan)
    }

    /// Handle one uploaded file (idempotent per path). Path safety and the
    /// markdown guardrails apply; nothing is committed until COMMIT.
    pub async fn receive_upload(&self, path: &str, bytes: &[u8]) -> SyncResult<()> {
        if !is_syncable_rel_path(path) {
            return Err(SyncError::UnsafePath(path.to_string()));
        }
        if path.ends_with(".md") {
            let text = std::str::from_utf8(bytes)
                .map_err(|_| agblogger_content::ContentError::NotText(path.to_string()))?;
            self.store.write_text(path, text)?;
        } else {
            self.store.write_bytes(path, bytes)?;
        }
        Ok(())
    }

    /// Read one file for download. The caller streams the bytes.
    pub async fn serve_download(&self, path: &str) -> SyncResult<Vec<u8>> {
        if !is_syncable_rel_path(path) {
            return Err(SyncError::UnsafePath(path.to_string()));
        }
        Ok(self.store.read_bytes(path)?)
    }

    /// Finalize a session. Globally serialized: only one COMMIT (or
    /// commit-triggered rebuild) runs at a time.
    pub async fn commit(&self, request: &CommitRequest) -> SyncResult<CommitResponse> {
        let _serialized = self.commit_lock.lock().await;

        // 1. Validate every path up front; nothing is applied before all
        //    of them pass.
        let base_commit = self.validated_base(&request.last_sync_commit)?;
        for path in request
            .uploaded
            .iter()
            .chain(request.delete_server.iter())
            .chain(request.conflicts.iter().map(|c| &c.path))
        {
            if !is_syncable_rel_path(path) {
                return Err(SyncError::UnsafePath(path.clone()));
            }
            // Resolve-and-contain against the real filesystem too.
            self.store.resolve_safe(path)?;
        }

        let mut response = CommitResponse {
            status: CommitStatus::Ok,
            commit: None,
            warnings: Vec::new(),
            merged: Vec::new(),
            conflicts: Vec::new(),
            binary_conflicts: Vec::new(),
        };

        // 2. Requested deletions, demoted to keep-modified when the server
        //    copy moved since the client's base.
        for path in &request.delete_server {
            let base = self.base_hash(base_commit.as_deref(), path)?;
            let current = self.store.read_bytes(path).ok().map(|b| sha256_hex(&b));
            match (current, base) {
                (None, _) => {} // already gone
                (Some(cur), Some(b)) if cur == b => {
                    self.store.delete_file(path)?;
                }
                (Some(_), _) => {
                    warn!(path, "delete demoted: server copy changed since the sync base");
                    response
                        .warnings
                        .push(format!("{path}: not deleted, server copy was modified"));
                }
            }
        }

        // 3. Conflict merges.
        for conflict in &request.conflicts {
            self.merge_conflict(base_commit.as_deref(), conflict, &mut response)?;
        }

        // 4. Commit. A failure downgrades the response, never the content.
        match self.repo.commit_all("sync commit") {
            Ok(head) => response.commit = head,
            Err(err) => {
                warn!(%err, "git commit failed after sync; content remains authoritative");
                response.status = CommitStatus::Warning;
                response.warnings.push(format!("git commit failed: {err}"));
            }
        }

        // 5–6. Manifest refresh and cache rebuild; failures are warnings.
        let manifest: Manifest = self.store.scan_all();
        {
            let mut conn = self.db.lock().await;
            if let Err(err) = agblogger_cache::replace_manifest(&mut conn, &manifest, &self.tz) {
                warn!(%err, "failed to refresh the server sync manifest");
                response.status = CommitStatus::Warning;
                response.warnings.push("manifest refresh failed".to_string());
            }
        }
        if let Err(err) =
            agblogger_cache::rebuild_from_disk(&self.db, &self.store, &self.tz, &self.default_author)
                .await
        {
            warn!(%err, "cache rebuild after sync failed");
            response.status = CommitStatus::Warning;
            response.warnings.push("cache rebuild failed".to_string());
        }

        info!(
            merged = response.merged.len(),
            conflicts = response.conflicts.len(),
            commit = response.commit.as_deref().unwrap_or("-"),
            "sync commit finished"
        );
        Ok(response)
    }

    /// The server manifest as stored in the cache.
    pub async fn stored_manifest(&self) -> SyncResult<Manifest> {
        let conn = self.db.lock().await;
        Ok(agblogger_cache::get_manifest(&conn)?)
    }

    fn merge_conflict(
        &self,
        base_commit: Option<&str>,
        conflict: &crate::types::ConflictUpload,
        response: &mut CommitResponse,
    ) -> SyncResult<()> {
        let path = &conflict.path;
        let client_bytes = BASE64
            .decode(&conflict.content_base64)
            .map_err(|_| SyncError::UnsafePath(path.clone()))?;

        let server_bytes = self.store.read_bytes(path).ok();
        let Some(server_bytes) = server_bytes else {
            // Server side vanished since INIT: the client's copy wins
            // outright (modify/delete preservation).
            self.write_merged(path, &client_bytes)?;
            response.merged.push(path.clone());
            return Ok(());
        };

        let text_pair = (std::str::from_utf8(&client_bytes), std::str::from_utf8(&server_bytes));
        let is_text = path.ends_with(".md");
        match text_pair {
            (Ok(client_text), Ok(server_text)) if is_text => {
                let base = match base_commit {
                    Some(commit) => self
                        .repo
                        .blob_at_commit(commit, path)
                        .map_err(SyncError::Git)?
                        .unwrap_or_default(),
                    None => String::new(),
                };
                let outcome = agblogger_git::merge3(&base, client_text, server_text)
                    .map_err(SyncError::Git)?;
                if outcome.conflicted {
                    // Server keeps its version; the client gets the full
                    // descriptor and writes its local conflict backup.
                    response.conflicts.push(ConflictDescriptor {
                        path: path.clone(),
                        base,
                        ours: client_text.to_string(),
                        theirs: server_text.to_string(),
                        merged_with_markers: outcome.merged,
                    });
                } else {
                    let normalized = normalize_front_matter(&outcome.merged, &self.tz);
                    self.store.write_text(path, &normalized)?;
                    response.merged.push(path.clone());
                }
            }
            _ => {
                // Binary (or undecodable) content: last writer wins by
                // mtime; the losing server copy is kept alongside.
                let server_mtime =
                    self.store.scan_all().get(path.as_str()).map(|s| s.mtime).unwrap_or(0);
                if conflict.mtime >= server_mtime {
                    let backup = format!("{path}.conflict-backup");
                    self.store.write_bytes(&backup, &server_bytes)?;
                    self.write_merged(path, &client_bytes)?;
                    response
                        .binary_conflicts
                        .push(BinaryConflict { path: path.clone(), winner: "client".into() });
                } else {
                    response
                        .binary_conflicts
                        .push(BinaryConflict { path: path.clone(), winner: "server".into() });
                }
            }
        }
        Ok(())
    }

    fn write_merged(&self, path: &str, bytes: &[u8]) -> SyncResult<()> {
        if path.ends_with(".md") {
            let text = std::str::from_utf8(bytes)
                .map_err(|_| agblogger_content::ContentError::NotText(path.to_string()))?;
            self.store.write_text(path, text)?;
        } else {
            self.store.write_bytes(path, bytes)?;
        }
        Ok(())
    }

    /// Validate and return the client's base commit, if it still exists.
    fn validated_base(&self, last_sync_commit: &Option<String>) -> SyncResult<Option<String>> {
        let Some(commit) = last_sync_commit else {
            return Ok(None);
        };
        if !agblogger_git::is_valid_commit_ref(commit) {
            return Err(SyncError::BadCommitRef(commit.clone()));
        }
        Ok(Some(commit.clone()))
    }

    /// Hash of the blob at the base commit, or `None` when unavailable.
    fn base_hash(&self, base_commit: Option<&str>, path: &str) -> SyncResult<Option<String>> {
        let Some(commit) = base_commit else {
            return Ok(None);
        };
        let blob = self.repo.blob_at_commit(commit, path).map_err(SyncError::Git)?;
        Ok(blob.map(|text| sha256_hex(text.as_bytes())))
    }
}

/// Canonicalize front-matter timestamps after a genuine merge; files
/// restored as server-wins are left untouched by the caller.
fn normalize_front_matter(text: &str, tz: &SiteTz) -> String {
    let (front, body) = FrontMatter::parse(text, tz);
    if front.is_empty() { text.to_string() } else { front.serialize(&body) }
}
