//! The bidirectional sync engine.
//!
//! Sync is a hash-anchored three-way merge between a client's working
//! directory and the server's content tree, with the git history supplying
//! merge bases. A session is INIT (client posts its manifest, server
//! answers with a plan) → UPLOAD/DOWNLOAD (independent, idempotent,
//! per-path requests) → COMMIT (the only globally serialized step: the
//! server applies deletions and conflict merges, commits to git, refreshes
//! its manifest, and rebuilds the cache).
//!
//! "Hash is truth": size and mtime only pre-filter; every decision
//! compares SHA-256 digests of file bytes.

mod classify;
mod engine;
mod types;

pub use classify::{Action, classify};
pub use engine::SyncEngine;
pub use types::{
    BinaryConflict, ClientState, CommitRequest, CommitResponse, CommitStatus, ConflictDescriptor,
    ConflictUpload, InitRequest, Manifest, SyncPlan, is_syncable_rel_path,
};

use thiserror::Error;

/// Sync failures. Path and commit-ref validation failures map to 400 at
/// the boundary; the rest are storage-level.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("unsafe path in sync request: {0:?}")]
    UnsafePath(String),
    #[error("invalid commit id: {0:?}")]
    BadCommitRef(String),
    #[error(transparent)]
    Content(#[from] agblogger_content::ContentError),
    #[error("git operation failed")]
    Git(#[source] anyhow::Error),
    #[error(transparent)]
    Cache(#[from] agblogger_cache::CacheError),
}

pub type SyncResult<T> = Result<T, SyncError>;
