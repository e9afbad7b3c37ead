//! Wire and state types shared by the server and the sync client.

use std::collections::BTreeMap;

use agblogger_content::FileStat;
use serde::{Deserialize, Serialize};

/// `path → stat` for one side of a sync.
pub type Manifest = BTreeMap<String, FileStat>;

/// Whether a relative path may appear on the sync surface at all: no dot
/// segments (which also hides `.git/` and local state files), no parent
/// traversal, no absolute paths, no backslashes.
pub fn is_syncable_rel_path(path: &str) -> bool {
    !path.is_empty()
        && !path.contains('\\')
        && !path.contains('\0')
        && !path.starts_with('/')
        && path.split('/').all(|seg| !seg.is_empty() && seg != ".." && !seg.starts_with('.'))
}

/// Client state persisted between syncs (`.agblogger/state.json` in the
/// local content directory).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientState {
    /// Server HEAD observed after the previous successful sync; the merge
    /// base anchor.
    pub last_sync_commit: Option<String>,
    /// Manifest as of the previous successful sync.
    #[serde(default)]
    pub manifest: Manifest,
}

/// Body of `POST /sync/init`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitRequest {
    pub manifest: Manifest,
    #[serde(default)]
    pub last_sync_commit: Option<String>,
}

/// The plan: a partition of every path on either side into actions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncPlan {
    /// Client → server transfers.
    pub upload: Vec<String>,
    /// Server → client transfers.
    pub download: Vec<String>,
    /// Deletions the client should apply locally.
    pub delete_client: Vec<String>,
    /// Deletions the client should request at COMMIT.
    pub delete_server: Vec<String>,
    /// Paths needing a three-way merge at COMMIT.
    pub conflicts: Vec<String>,
    /// Both sides changed identically; no transfer either way.
    pub coincident: Vec<String>,
    /// Unchanged paths.
    pub unchanged: Vec<String>,
    /// Server HEAD at plan time; becomes the client's merge base after a
    /// successful COMMIT.
    pub server_commit: Option<String>,
}

impl SyncPlan {
    /// Total number of path entries across every category.
    pub fn len(&self) -> usize {
        self.upload.len()
            + self.download.len()
            + self.delete_client.len()
            + self.delete_server.len()
            + self.conflicts.len()
            + self.coincident.len()
            + self.unchanged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether anything needs transferring or merging.
    pub fn has_work(&self) -> bool {
        self.len() > self.coincident.len() + self.unchanged.len()
    }
}

/// One conflicted path's client-side content, sent with COMMIT.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictUpload {
    pub path: String,
    /// Raw client bytes, base64.
    pub content_base64: String,
    /// Client file mtime (seconds), used for binary last-writer-wins.
    pub mtime: i64,
}

/// Body of `POST /sync/commit`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommitRequest {
    #[serde(default)]
    pub last_sync_commit: Option<String>,
    /// Paths the client uploaded during this session.
    #[serde(default)]
    pub uploaded: Vec<String>,
    /// Server-side deletions the client requests.
    #[serde(default)]
    pub delete_server: Vec<String>,
    /// Conflict merge inputs.
    #[serde(default)]
    pub conflicts: Vec<ConflictUpload>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitStatus {
    Ok,
    Warning,
}

/// A text conflict that did not merge cleanly. `ours` is the client's
/// version, `theirs` the server's; the server kept its own copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictDescriptor {
    pub path: String,
    pub base: String,
    pub ours: String,
    pub theirs: String,
    pub merged_with_markers: String,
}

/// A binary conflict resolved by last-writer-wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinaryConflict {
    pub path: String,
    /// `"client"` or `"server"`.
    pub winner: String,
}

/// Body of the COMMIT response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitResponse {
    pub status: CommitStatus,
    /// New HEAD; null when the git commit failed.
    pub commit: Option<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    /// Paths merged cleanly on the server.
    #[serde(default)]
    pub merged: Vec<String>,
    /// Text conflicts the client must resolve locally.
    #[serde(default)]
    pub conflicts: Vec<ConflictDescriptor>,
    /// Binary conflicts and who won.
    #[serde(default)]
    pub binary_conflicts: Vec<BinaryConflict>,
}
