//! Client side of a sync session: local state, plan execution, conflict
//! backups.

use std::fs;
use std::path::{Path, PathBuf};

use agblogger_content::ContentStore;
use agblogger_sync::{
    ClientState, CommitRequest, CommitStatus, ConflictUpload, InitRequest, SyncPlan,
    is_syncable_rel_path,
};
use anyhow::Context;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use tracing::{info, warn};

use crate::api::{Api, CliError, CliResult};

/// Local state file, inside a dot-directory so the sync surface never
/// sees it.
const STATE_FILE: &str = ".agblogger/state.json";

pub struct Syncer {
    api: Api,
    store: ContentStore,
    state_path: PathBuf,
}

/// What a sync run did, for reporting.
#[derive(Debug, Default)]
pub struct SyncReport {
    pub uploaded: usize,
    pub downloaded: usize,
    pub deleted_locally: usize,
    pub merged: usize,
    pub conflicts: Vec<String>,
    pub warnings: Vec<String>,
    /// Paths that failed client-side validation and were aborted.
    pub rejected_paths: Vec<String>,
}

impl Syncer {
    pub fn new(api: Api, dir: &Path) -> CliResult<Self> {
        let store = ContentStore::open(dir)
            .map_err(|err| CliError::Other(anyhow::Error::new(err).context("open local dir")))?;
        let state_path = store.root().join(STATE_FILE);
        Ok(Self { api, store, state_path })
    }

    /// Run a full sync session: INIT → transfers → COMMIT → state update.
    pub fn sync(&self, dry_run: bool) -> CliResult<SyncReport> {
        let state = self.load_state();
        let manifest = self.store.scan_all();
        let plan = self.api.sync_init(&InitRequest {
            manifest: manifest.clone(),
            last_sync_commit: state.last_sync_commit.clone(),
        })?;

        info!(
            upload = plan.upload.len(),
            download = plan.download.len(),
            conflicts = plan.conflicts.len(),
            delete_client = plan.delete_client.len(),
            delete_server = plan.delete_server.len(),
            "sync plan received"
        );
        if dry_run {
            return Ok(report_for_dry_run(&plan));
        }

        let mut report = SyncReport::default();

        // Uploads are idempotent per path; a retry of the whole session
        // is always safe.
        for path in &plan.upload {
            let bytes = self
                .store
                .read_bytes(path)
                .map_err(|err| CliError::Other(anyhow::Error::new(err).context("read for upload")))?;
            self.api.sync_upload(path, &bytes)?;
            report.uploaded += 1;
        }

        for path in &plan.download {
            if !self.write_validated(path, &self.api.sync_download(path)?, &mut report)? {
                continue;
            }
            report.downloaded += 1;
        }

        for path in &plan.delete_client {
            if !is_syncable_rel_path(path) {
                warn!(path, "server sent an unsafe deletion path, aborting it");
                report.rejected_paths.push(path.clone());
                continue;
            }
            self.store
                .delete_file(path)
                .map_err(|err| CliError::Other(anyhow::Error::new(err).context("local delete")))?;
            report.deleted_locally += 1;
        }

        // Conflicted paths travel with COMMIT so the server can run the
        // three-way merge under its lock.
        let mut conflict_uploads = Vec::new();
        for path in &plan.conflicts {
            let bytes = self
                .store
                .read_bytes(path)
                .map_err(|err| CliError::Other(anyhow::Error::new(err).context("read conflict")))?;
            let mtime = manifest.get(path).map(|s| s.mtime).unwrap_or(0);
            conflict_uploads.push(ConflictUpload {
                path: path.clone(),
                content_base64: BASE64.encode(&bytes),
                mtime,
            });
        }

        let response = self.api.sync_commit(&CommitRequest {
            last_sync_commit: state.last_sync_commit.clone(),
            uploaded: plan.upload.clone(),
            delete_server: plan.delete_server.clone(),
            conflicts: conflict_uploads,
        })?;

        // Cleanly merged files come back down so both sides converge on
        // the normalized bytes.
        for path in &response.merged {
            if self.write_validated(path, &self.api.sync_download(path)?, &mut report)? {
                report.merged += 1;
            }
        }

        // Unresolved conflicts: back up our version, adopt the server's.
        for conflict in &response.conflicts {
            let path = &conflict.path;
            if !is_syncable_rel_path(path) {
                report.rejected_paths.push(path.clone());
                continue;
            }
            let backup = format!("{path}.conflict-backup");
            self.store
                .write_bytes(&backup, conflict.ours.as_bytes())
                .map_err(|err| CliError::Other(anyhow::Error::new(err).context("write backup")))?;
            if self.write_validated(path, conflict.theirs.as_bytes(), &mut report)? {
                report.conflicts.push(path.clone());
                warn!(path, backup, "conflict: server version adopted, local copy backed up");
            }
        }

        for binary in &response.binary_conflicts {
            if binary.winner == "server" {
                let path = &binary.path;
                let bytes = self.api.sync_download(path)?;
                let backup = format!("{path}.conflict-backup");
                if let Ok(local) = self.store.read_bytes(path) {
                    let _ = self.store.write_bytes(&backup, &local);
                }
                if self.write_validated(path, &bytes, &mut report)? {
                    report.conflicts.push(path.clone());
                }
            }
        }

        report.warnings = response.warnings.clone();
        if response.status == CommitStatus::Warning {
            warn!(warnings = ?response.warnings, "server reported warnings during commit");
        }

        // Persist the new baseline: fresh local manifest plus the commit
        // we just synchronized to. A failed git commit keeps the old
        // anchor.
        let new_state = ClientState {
            last_sync_commit: response.commit.clone().or(state.last_sync_commit),
            manifest: self.store.scan_all(),
        };
        self.save_state(&new_state)?;
        Ok(report)
    }

    /// Compare the working tree against the last synced manifest.
    pub fn status(&self) -> CliResult<(Vec<String>, Vec<String>, Vec<String>)> {
        let state = self.load_state();
        let current = self.store.scan_all();

        let mut added = Vec::new();
        let mut modified = Vec::new();
        let mut deleted = Vec::new();
        for (path, stat) in &current {
            match state.manifest.get(path) {
                None => added.push(path.clone()),
                Some(old) if old.sha256 != stat.sha256 => modified.push(path.clone()),
                Some(_) => {}
            }
        }
        for path in state.manifest.keys() {
            if !current.contains_key(path) {
                deleted.push(path.clone());
            }
        }
        Ok((added, modified, deleted))
    }

    /// Validate a server-provided path and write the bytes. Returns
    /// `false` (after recording the rejection) when validation fails; the
    /// file is aborted, not counted.
    fn write_validated(
        &self,
        path: &str,
        bytes: &[u8],
        report: &mut SyncReport,
    ) -> CliResult<bool> {
        if !is_syncable_rel_path(path) || self.store.resolve_safe(path).is_err() {
            warn!(path, "server sent an unsafe path, aborting this file");
            report.rejected_paths.push(path.to_string());
            return Ok(false);
        }
        self.store
            .write_bytes(path, bytes)
            .map_err(|err| CliError::Other(anyhow::Error::new(err).context("write download")))?;
        Ok(true)
    }

    fn load_state(&self) -> ClientState {
        match fs::read_to_string(&self.state_path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_else(|err| {
                warn!(%err, "unreadable sync state, starting from scratch");
                ClientState::default()
            }),
            Err(_) => ClientState::default(),
        }
    }

    fn save_state(&self, state: &ClientState) -> CliResult<()> {
        let parent = self.state_path.parent().unwrap_or(self.store.root());
        fs::create_dir_all(parent)
            .with_context(|| format!("create {}", parent.display()))
            .map_err(CliError::Other)?;
        let text = serde_json::to_string_pretty(state)
            .context("serialize sync state")
            .map_err(CliError::Other)?;
        fs::write(&self.state_path, text)
            .with_context(|| format!("write {}", self.state_path.display()))
            .map_err(CliError::Other)?;
        Ok(())
    }
}

fn report_for_dry_run(plan: &SyncPlan) -> SyncReport {
    SyncReport {
        uploaded: plan.upload.len(),
        downloaded: plan.download.len(),
        deleted_locally: plan.delete_client.len(),
        merged: 0,
        conflicts: plan.conflicts.clone(),
        warnings: Vec::new(),
        rejected_paths: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_roundtrip() {
        let td = tempfile::tempdir().expect("tempdir");
        let api = Api::new("http://localhost:0", Some("agb_test".into())).expect("api");
        let syncer = Syncer::new(api, td.path()).expect("syncer");

        let state = ClientState {
            last_sync_commit: Some("abcd1234".to_string()),
            manifest: Default::default(),
        };
        syncer.save_state(&state).expect("save");
        let loaded = syncer.load_state();
        assert_eq!(loaded.last_sync_commit.as_deref(), Some("abcd1234"));
    }

    #[test]
    fn corrupt_state_degrades_to_default() {
        let td = tempfile::tempdir().expect("tempdir");
        let api = Api::new("http://localhost:0", None).expect("api");
        let syncer = Syncer::new(api, td.path()).expect("syncer");
        fs::create_dir_all(td.path().join(".agblogger")).expect("mkdir");
        fs::write(td.path().join(STATE_FILE), "{ not json").expect("write");

        let state = syncer.load_state();
        assert!(state.last_sync_commit.is_none());
        assert!(state.manifest.is_empty());
    }

    #[test]
    fn status_detects_changes() {
        let td = tempfile::tempdir().expect("tempdir");
        let api = Api::new("http://localhost:0", None).expect("api");
        let syncer = Syncer::new(api, td.path()).expect("syncer");

        syncer.store.write_text("posts/a.md", "one\n").expect("a");
        let baseline = ClientState {
            last_sync_commit: None,
            manifest: syncer.store.scan_all(),
        };
        syncer.save_state(&baseline).expect("save");

        syncer.store.write_text("posts/a.md", "changed\n").expect("edit");
        syncer.store.write_text("posts/b.md", "new\n").expect("new");

        let (added, modified, deleted) = syncer.status().expect("status");
        assert_eq!(added, vec!["posts/b.md"]);
        assert_eq!(modified, vec!["posts/a.md"]);
        assert!(deleted.is_empty());
    }

    #[test]
    fn state_file_is_invisible_to_scans() {
        let td = tempfile::tempdir().expect("tempdir");
        let api = Api::new("http://localhost:0", None).expect("api");
        let syncer = Syncer::new(api, td.path()).expect("syncer");
        syncer.save_state(&ClientState::default()).expect("save");

        assert!(syncer.store.scan_all().is_empty());
    }
}
