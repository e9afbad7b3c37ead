//! The content store: the filesystem directory that is the source of truth.
//!
//! Everything under the content root is canonical state: `index.toml`,
//! `labels.toml`, top-level pages, and `posts/**/*.md` with colocated
//! asset directories. This crate owns scanning, reading, and (atomically)
//! writing that tree, plus the path-safety gate every externally supplied
//! path must pass through.
//!
//! Dot-files and dot-directories (`.git/` in particular) are invisible to
//! scans and manifests.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

use agblogger_datetime::SiteTz;
use agblogger_frontmatter::FrontMatter;
use chrono::{DateTime, FixedOffset};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::warn;
use walkdir::WalkDir;

/// Default cap on a single markdown file.
pub const DEFAULT_MAX_FILE_BYTES: u64 = 10 * 1024 * 1024;

/// Content store failures.
#[derive(Debug, Error)]
pub enum ContentError {
    /// The supplied path resolves outside the content root (or is
    /// syntactically unacceptable).
    #[error("unsafe path: {0:?}")]
    UnsafePath(String),
    #[error("no such file: {0:?}")]
    NotFound(String),
    #[error("file {path:?} is {size} bytes, over the {max} byte limit")]
    TooLarge { path: String, size: u64, max: u64 },
    #[error("file {0:?} contains NUL bytes")]
    NulBytes(String),
    #[error("file {0:?} is not valid UTF-8")]
    NotText(String),
    #[error("failed to access {path:?}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl ContentError {
    fn io(path: &str) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.to_string();
        move |source| Self::Io { path, source }
    }
}

/// Stat line of one file in a sync manifest.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FileStat {
    /// SHA-256 of the raw bytes, lowercase hex.
    pub sha256: String,
    pub size: u64,
    /// Modification time, seconds since the epoch.
    pub mtime: i64,
}

/// A parsed markdown post.
#[derive(Debug, Clone)]
pub struct PostFile {
    /// Path relative to the content root, forward slashes.
    pub rel_path: String,
    pub front: FrontMatter,
    pub body: String,
    /// First `# ` heading, or derived from the file name.
    pub title: String,
    pub content_hash: String,
    pub size: u64,
    pub mtime: i64,
}

/// Handle on the content root. The root is canonicalized once at open so
/// containment checks compare resolved paths.
#[derive(Debug, Clone)]
pub struct ContentStore {
    root: PathBuf,
    max_file_bytes: u64,
}

impl ContentStore {
    /// Open (creating if needed) the content root.
    pub fn open(root: &Path) -> Result<Self, ContentError> {
        Self::open_with_limit(root, DEFAULT_MAX_FILE_BYTES)
    }

    pub fn open_with_limit(root: &Path, max_file_bytes: u64) -> Result<Self, ContentError> {
        let display = root.display().to_string();
        fs::create_dir_all(root).map_err(ContentError::io(&display))?;
        fs::create_dir_all(root.join("posts")).map_err(ContentError::io(&display))?;
        let root = root.canonicalize().map_err(ContentError::io(&display))?;
        Ok(Self { root, max_file_bytes })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn max_file_bytes(&self) -> u64 {
        self.max_file_bytes
    }

    /// Resolve a user-supplied relative path to an absolute path inside
    /// the content root, or fail.
    ///
    /// Rejects absolute paths, `..` components, NUL bytes, and any path
    /// whose resolved form (following symlinks through the deepest
    /// existing ancestor) escapes the root.
    pub fn resolve_safe(&self, user_path: &str) -> Result<PathBuf, ContentError> {
        let unsafe_path = || ContentError::UnsafePath(user_path.to_string());
        if user_path.is_empty() || user_path.contains('\0') {
            return Err(unsafe_path());
        }
        let mut candidate = self.root.clone();
        for component in Path::new(user_path).components() {
            match component {
                Component::Normal(part) => candidate.push(part),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(unsafe_path());
                }
            }
        }
        // Follow symlinks through whatever already exists and make sure we
        // are still inside the root; the not-yet-existing tail cannot
        // escape because `..` was rejected above.
        let (existing, tail) = deepest_existing(&candidate);
        let resolved = existing
            .canonicalize()
            .map_err(ContentError::io(user_path))?;
        if !resolved.starts_with(&self.root) {
            return Err(unsafe_path());
        }
        if tail.as_os_str().is_empty() { Ok(resolved) } else { Ok(resolved.join(tail)) }
    }

    /// Scan `posts/**/*.md` into parsed posts. Individual file failures
    /// are logged and skipped; unreadable subtrees are skipped.
    pub fn scan_posts(&self, tz: &SiteTz) -> Vec<PostFile> {
        let posts_root = self.root.join("posts");
        let mut out = Vec::new();
        let walker = WalkDir::new(&posts_root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !is_hidden(e.file_name()));
        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(err) => {
                    warn!(%err, "skipping unreadable directory entry during post scan");
                    continue;
                }
            };
            if !entry.file_type().is_file() || !has_md_extension(entry.path()) {
                continue;
            }
            let Some(rel) = self.rel_path(entry.path()) else {
                continue;
            };
            match self.read_post(&rel, tz) {
                Ok(post) => out.push(post),
                Err(err) => warn!(path = rel, %err, "skipping unparseable post"),
            }
        }
        out
    }

    /// Read and parse one post.
    pub fn read_post(&self, rel_path: &str, tz: &SiteTz) -> Result<PostFile, ContentError> {
        let abs = self.resolve_safe(rel_path)?;
        let bytes = read_existing(&abs, rel_path)?;
        self.check_text_guardrails(rel_path, &bytes)?;
        let text =
            String::from_utf8(bytes).map_err(|_| ContentError::NotText(rel_path.to_string()))?;

        let (front, body) = FrontMatter::parse(&text, tz);
        let meta = fs::metadata(&abs).map_err(ContentError::io(rel_path))?;
        Ok(PostFile {
            rel_path: rel_path.to_string(),
            title: extract_title(&body, rel_path),
            front,
            content_hash: sha256_hex(text.as_bytes()),
            size: meta.len(),
            mtime: mtime_secs(&meta),
            body,
        })
    }

    /// Serialize and atomically write one post; parent directories are
    /// created as needed. Returns the canonical on-disk text.
    pub fn write_post(
        &self,
        rel_path: &str,
        front: &FrontMatter,
        body: &str,
    ) -> Result<String, ContentError> {
        let text = front.serialize(body);
        self.write_text(rel_path, &text)?;
        Ok(text)
    }

    /// Atomically write a UTF-8 file with the markdown guardrails applied.
    pub fn write_text(&self, rel_path: &str, text: &str) -> Result<(), ContentError> {
        self.check_text_guardrails(rel_path, text.as_bytes())?;
        self.write_bytes(rel_path, text.as_bytes())
    }

    /// Atomically write raw bytes (assets, sync uploads of binaries).
    pub fn write_bytes(&self, rel_path: &str, bytes: &[u8]) -> Result<(), ContentError> {
        let abs = self.resolve_safe(rel_path)?;
        if let Some(parent) = abs.parent() {
            fs::create_dir_all(parent).map_err(ContentError::io(rel_path))?;
        }
        let dir = abs.parent().unwrap_or(&self.root);
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(ContentError::io(rel_path))?;
        tmp.write_all(bytes).map_err(ContentError::io(rel_path))?;
        tmp.as_file().sync_all().map_err(ContentError::io(rel_path))?;
        tmp.persist(&abs)
            .map_err(|err| ContentError::Io { path: rel_path.to_string(), source: err.error })?;
        Ok(())
    }

    /// Read raw bytes of any file under the root.
    pub fn read_bytes(&self, rel_path: &str) -> Result<Vec<u8>, ContentError> {
        let abs = self.resolve_safe(rel_path)?;
        read_existing(&abs, rel_path)
    }

    pub fn exists(&self, rel_path: &str) -> bool {
        self.resolve_safe(rel_path).map(|p| p.is_file()).unwrap_or(false)
    }

    /// Delete a post file and, when present, its colocated asset
    /// directory (`posts/a/b.md` ⇒ `posts/a/b/`).
    pub fn delete_post(&self, rel_path: &str) -> Result<(), ContentError> {
        let abs = self.resolve_safe(rel_path)?;
        if !abs.is_file() {
            return Err(ContentError::NotFound(rel_path.to_string()));
        }
        fs::remove_file(&abs).map_err(ContentError::io(rel_path))?;
        let sibling = abs.with_extension("");
        if sibling.is_dir() {
            fs::remove_dir_all(&sibling).map_err(ContentError::io(rel_path))?;
        }
        Ok(())
    }

    /// Delete any single file under the root (sync deletions). Missing
    /// files are not an error; empty parent directories are pruned up to
    /// the root.
    pub fn delete_file(&self, rel_path: &str) -> Result<(), ContentError> {
        let abs = self.resolve_safe(rel_path)?;
        match fs::remove_file(&abs) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(ContentError::Io { path: rel_path.to_string(), source: err }),
        }
        let mut dir = abs.parent().map(Path::to_path_buf);
        while let Some(d) = dir {
            if d == self.root || fs::remove_dir(&d).is_err() {
                break;
            }
            dir = d.parent().map(Path::to_path_buf);
        }
        Ok(())
    }

    /// Manifest over every file under the root, excluding dot-entries and
    /// therefore the `.git/` subtree.
    pub fn scan_all(&self) -> BTreeMap<String, FileStat> {
        let mut out = BTreeMap::new();
        let walker = WalkDir::new(&self.root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !is_hidden(e.file_name()));
        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(err) => {
                    warn!(%err, "skipping unreadable directory entry during manifest scan");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(rel) = self.rel_path(entry.path()) else {
                continue;
            };
            match stat_file(entry.path()) {
                Ok(stat) => {
                    out.insert(rel, stat);
                }
                Err(err) => warn!(path = rel, %err, "skipping unreadable file in manifest scan"),
            }
        }
        out
    }

    /// Resolve a post reference that may be flat (`posts/x.md`) or
    /// directory-form (`posts/x` holding an `index.md`).
    pub fn resolve_post_rel(&self, rel_path: &str) -> Option<String> {
        if self.exists(rel_path) {
            return Some(rel_path.to_string());
        }
        if !rel_path.ends_with(".md") {
            let index = format!("{}/index.md", rel_path.trim_end_matches('/'));
            if self.exists(&index) {
                return Some(index);
            }
        }
        None
    }

    fn rel_path(&self, abs: &Path) -> Option<String> {
        let rel = abs.strip_prefix(&self.root).ok()?;
        let text = rel.to_str()?;
        Some(text.replace('\\', "/"))
    }

    fn check_text_guardrails(&self, rel_path: &str, bytes: &[u8]) -> Result<(), ContentError> {
        let size = bytes.len() as u64;
        if size > self.max_file_bytes {
            return Err(ContentError::TooLarge {
                path: rel_path.to_string(),
                size,
                max: self.max_file_bytes,
            });
        }
        if bytes.contains(&0) {
            return Err(ContentError::NulBytes(rel_path.to_string()));
        }
        Ok(())
    }
}

/// First `# ` heading of the body, or the file stem with `-`/`_` turned
/// into spaces.
pub fn extract_title(body: &str, rel_path: &str) -> String {
    for line in body.lines() {
        let trimmed = line.trim_start();
        if let Some(heading) = trimmed.strip_prefix("# ") {
            let title = heading.trim();
            if !title.is_empty() {
                return title.to_string();
            }
        }
    }
    let stem = Path::new(rel_path)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(rel_path);
    stem.replace(['-', '_'], " ")
}

/// SHA-256 of raw bytes, lowercase hex.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Best creation/modification timestamps for a post, preferring front
/// matter, falling back to file mtime.
pub fn effective_timestamps(
    post: &PostFile,
    tz: &SiteTz,
) -> (DateTime<FixedOffset>, DateTime<FixedOffset>) {
    let mtime = DateTime::from_timestamp(post.mtime, 0)
        .map(|dt| dt.fixed_offset())
        .unwrap_or_else(|| tz.now());
    let created = post.front.created_at.unwrap_or(mtime);
    let modified = post.front.modified_at.unwrap_or(mtime);
    (created, modified)
}

fn stat_file(path: &Path) -> Result<FileStat, std::io::Error> {
    let bytes = fs::read(path)?;
    let meta = fs::metadata(path)?;
    Ok(FileStat { sha256: sha256_hex(&bytes), size: meta.len(), mtime: mtime_secs(&meta) })
}

fn mtime_secs(meta: &fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn read_existing(abs: &Path, rel_path: &str) -> Result<Vec<u8>, ContentError> {
    match fs::read(abs) {
        Ok(bytes) => Ok(bytes),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            Err(ContentError::NotFound(rel_path.to_string()))
        }
        Err(err) => Err(ContentError::Io { path: rel_path.to_string(), source: err }),
    }
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_str().map(|s| s.starts_with('.')).unwrap_or(false)
}

fn has_md_extension(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()).map(|e| e.eq_ignore_ascii_case("md")).unwrap_or(false)
}

/// Split a candidate path into its deepest existing ancestor and the
/// remaining (not yet created) tail.
fn deepest_existing(candidate: &Path) -> (PathBuf, PathBuf) {
    let mut existing = candidate.to_path_buf();
    let mut tail_parts: Vec<std::ffi::OsString> = Vec::new();
    while !existing.exists() {
        let Some(name) = existing.file_name().map(|n| n.to_os_string()) else {
            break;
        };
        tail_parts.push(name);
        if !existing.pop() {
            break;
        }
    }
    tail_parts.reverse();
    let mut tail = PathBuf::new();
    for part in tail_parts {
        tail.push(part);
    }
    (existing, tail)
}
