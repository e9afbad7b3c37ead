//! The relational cache over the content directory.
//!
//! Everything in the `*_cache` tables and the FTS index is derived state,
//! rebuildable from the filesystem at any time; the user and credential
//! tables are the only authoritative records here. The cache exists to
//! make listing, filtering, and full-text search fast, and is kept
//! incrementally consistent by the mutation endpoints with a full rebuild
//! as the reconciliation path.
//!
//! The connection lives behind an async mutex; long jobs (the rebuild)
//! take and release it per post so readers interleave.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use std::sync::LazyLock;

use agblogger_content::{FileStat, PostFile, effective_timestamps};
use agblogger_datetime::{SiteTz, format_canonical};
use agblogger_labels::LabelGraph;
use chrono::{DateTime, FixedOffset};
use regex::Regex;
use rusqlite::{Connection, OptionalExtension, types::ToSql};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

/// Number of characters kept in a post excerpt.
const EXCERPT_CHARS: usize = 300;

/// Cache failures.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("database error")]
    Db(#[from] rusqlite::Error),
    #[error("no cached post for {0:?}")]
    NotFound(String),
    #[error("failed to load label definitions")]
    Config(#[from] agblogger_config::ConfigError),
}

pub type CacheResult<T> = Result<T, CacheError>;

/// Shared handle on the cache database.
#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    /// Open (creating and migrating if needed) the cache database.
    pub fn open(path: &Path) -> CacheResult<Self> {
        let conn = Connection::open(path)?;
        Self::prepare(conn)
    }

    /// In-memory database, for tests and ephemeral deployments.
    pub fn open_in_memory() -> CacheResult<Self> {
        Self::prepare(Connection::open_in_memory()?)
    }

    fn prepare(conn: Connection) -> CacheResult<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        init_schema(&conn)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    /// Acquire the connection. Every database touch is a suspension point
    /// at this mutex.
    pub async fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().await
    }
}

/// Everything the cache stores about one post.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedPost {
    pub id: i64,
    pub file_path: String,
    pub title: String,
    pub author: String,
    /// Canonical timestamp strings.
    pub created_at: String,
    pub modified_at: String,
    pub is_draft: bool,
    pub labels: Vec<String>,
    pub content_hash: String,
    pub excerpt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rendered_html: Option<String>,
}

/// Input row for upserts, derived from a parsed post file.
#[derive(Debug, Clone)]
pub struct PostRecord {
    pub file_path: String,
    pub title: String,
    pub author: String,
    pub created_at: DateTime<FixedOffset>,
    pub modified_at: DateTime<FixedOffset>,
    pub is_draft: bool,
    pub labels: BTreeSet<String>,
    pub content_hash: String,
    pub body: String,
}

impl PostRecord {
    /// Build a record from a scanned post, applying the site default
    /// author and the directory-derived implicit labels.
    pub fn from_post_file(post: &PostFile, default_author: &str, tz: &SiteTz) -> Self {
        let (created, modified) = effective_timestamps(post, tz);
        let mut labels = post.front.labels.clone();
        labels.extend(agblogger_labels::path_implicit_labels(&post.rel_path));
        Self {
            file_path: post.rel_path.clone(),
            title: post.title.clone(),
            author: post.front.author.clone().unwrap_or_else(|| default_author.to_string()),
            created_at: created,
            modified_at: modified,
            is_draft: post.front.draft,
            labels,
            content_hash: post.content_hash.clone(),
            body: post.body.clone(),
        }
    }
}

/// One label as the API exposes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedLabel {
    pub id: String,
    pub names: Vec<String>,
    pub parents: Vec<String>,
    pub is_implicit: bool,
    pub post_count: i64,
}

/// Sort keys accepted by the listing query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostSort {
    #[default]
    CreatedAt,
    ModifiedAt,
    Title,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

/// Listing filters; all optional, all AND-combined.
#[derive(Debug, Clone, Default)]
pub struct PostQuery {
    /// Posts carrying this label or any of its descendants.
    pub labels: Vec<String>,
    pub author: Option<String>,
    pub created_from: Option<DateTime<FixedOffset>>,
    pub created_to: Option<DateTime<FixedOffset>>,
    /// Full-text query over title/excerpt/body.
    pub text: Option<String>,
    pub sort: PostSort,
    pub order: SortOrder,
    /// None: exclude drafts. Some(true)/Some(false): only/never drafts.
    pub draft: Option<bool>,
    pub include_drafts: bool,
    pub limit: u32,
    pub offset: u32,
}

/// One page of listing results.
#[derive(Debug, Clone, Serialize)]
pub struct PostPage {
    pub posts: Vec<CachedPost>,
    pub total: i64,
}

/// Current schema version, recorded in `meta` for future migrations.
const SCHEMA_VERSION: &str = "1";

pub fn init_schema(conn: &Connection) -> CacheResult<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS posts_cache (
            id INTEGER PRIMARY KEY,
            file_path TEXT NOT NULL UNIQUE,
            title TEXT NOT NULL,
            author TEXT NOT NULL,
            created_at TEXT NOT NULL,
            modified_at TEXT NOT NULL,
            created_ts INTEGER NOT NULL,
            modified_ts INTEGER NOT NULL,
            is_draft INTEGER NOT NULL DEFAULT 0,
            content_hash TEXT NOT NULL,
            excerpt TEXT NOT NULL,
            rendered_html TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_posts_created ON posts_cache(created_ts);
        CREATE INDEX IF NOT EXISTS idx_posts_author ON posts_cache(author);

        CREATE TABLE IF NOT EXISTS labels_cache (
            id TEXT PRIMARY KEY,
            names_json TEXT NOT NULL DEFAULT '[]',
            is_implicit INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS post_labels_cache (
            post_id INTEGER NOT NULL REFERENCES posts_cache(id) ON DELETE CASCADE,
            label_id TEXT NOT NULL REFERENCES labels_cache(id) ON DELETE CASCADE,
            PRIMARY KEY (post_id, label_id)
        );

        CREATE TABLE IF NOT EXISTS label_parents_cache (
            child_id TEXT NOT NULL REFERENCES labels_cache(id) ON DELETE CASCADE,
            parent_id TEXT NOT NULL REFERENCES labels_cache(id) ON DELETE CASCADE,
            PRIMARY KEY (child_id, parent_id)
        );

        CREATE VIRTUAL TABLE IF NOT EXISTS posts_fts USING fts5(title, excerpt, body);

        CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY,
            username TEXT NOT NULL UNIQUE,
            email TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL,
            display_name TEXT,
            is_admin INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS refresh_tokens (
            id INTEGER PRIMARY KEY,
            user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            token_hash TEXT NOT NULL UNIQUE,
            expires_at TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS invite_codes (
            id INTEGER PRIMARY KEY,
            code_hash TEXT NOT NULL UNIQUE,
            created_by INTEGER NOT NULL REFERENCES users(id),
            used_by INTEGER REFERENCES users(id),
            used_at TEXT,
            expires_at TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS personal_access_tokens (
            id INTEGER PRIMARY KEY,
            user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            token_hash TEXT NOT NULL UNIQUE,
            label TEXT NOT NULL,
            created_at TEXT NOT NULL,
            last_used_at TEXT,
            expires_at TEXT,
            revoked INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS social_accounts (
            id INTEGER PRIMARY KEY,
            user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            platform TEXT NOT NULL,
            account_name TEXT NOT NULL DEFAULT '',
            credentials_ciphertext TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE (user_id, platform, account_name)
        );

        CREATE TABLE IF NOT EXISTS sync_manifest (
            file_path TEXT PRIMARY KEY,
            content_hash TEXT NOT NULL,
            file_size INTEGER NOT NULL,
            file_mtime INTEGER NOT NULL,
            recorded_at TEXT NOT NULL
        );
        "#,
    )?;
    conn.execute(
        "INSERT INTO meta (key, value) VALUES ('schema_version', ?1)
         ON CONFLICT(key) DO UPDATE SET value = ?1",
        [SCHEMA_VERSION],
    )?;
    Ok(())
}

/// The schema version stored in `meta`.
pub fn schema_version(conn: &Connection) -> CacheResult<Option<String>> {
    Ok(conn
        .query_row("SELECT value FROM meta WHERE key = 'schema_version'", [], |row| row.get(0))
        .optional()?)
}

/// Insert or update one post row, with the paired FTS delete+insert in
/// the same transaction. Labels referenced for the first time materialize
/// as implicit. Returns the row id.
pub fn upsert_post(conn: &mut Connection, record: &PostRecord) -> CacheResult<i64> {
    let tx = conn.transaction()?;
    let excerpt = excerpt_of(&record.body);
    let created = format_canonical(&record.created_at);
    let modified = format_canonical(&record.modified_at);

    let existing: Option<i64> = tx
        .query_row(
            "SELECT id FROM posts_cache WHERE file_path = ?1",
            [&record.file_path],
            |row| row.get(0),
        )
        .optional()?;

    let id = match existing {
        Some(id) => {
            tx.execute(
                "UPDATE posts_cache SET title = ?2, author = ?3, created_at = ?4,
                     modified_at = ?5, created_ts = ?6, modified_ts = ?7, is_draft = ?8,
                     content_hash = ?9, excerpt = ?10, rendered_html = NULL
                 WHERE id = ?1",
                rusqlite::params![
                    id,
                    record.title,
                    record.author,
                    created,
                    modified,
                    record.created_at.timestamp_micros(),
                    record.modified_at.timestamp_micros(),
                    record.is_draft,
                    record.content_hash,
                    excerpt,
                ],
            )?;
            id
        }
        None => {
            tx.execute(
                "INSERT INTO posts_cache (file_path, title, author, created_at, modified_at,
                     created_ts, modified_ts, is_draft, content_hash, excerpt)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                rusqlite::params![
                    record.file_path,
                    record.title,
                    record.author,
                    created,
                    modified,
                    record.created_at.timestamp_micros(),
                    record.modified_at.timestamp_micros(),
                    record.is_draft,
                    record.content_hash,
                    excerpt,
                ],
            )?;
            tx.last_insert_rowid()
        }
    };

    // Paired FTS maintenance: delete then insert under the post's rowid.
    tx.execute("DELETE FROM posts_fts WHERE rowid = ?1", [id])?;
    tx.execute(
        "INSERT INTO posts_fts (rowid, title, excerpt, body) VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![id, record.title, excerpt, record.body],
    )?;

    // Label links; unseen labels materialize as implicit.
    tx.execute("DELETE FROM post_labels_cache WHERE post_id = ?1", [id])?;
    for label in &record.labels {
        if !agblogger_labels::is_valid_label_id(label) {
            warn!(label, path = record.file_path, "skipping invalid label id on post");
            continue;
        }
        tx.execute(
            "INSERT OR IGNORE INTO labels_cache (id, names_json, is_implicit)
             VALUES (?1, '[]', 1)",
            [label],
        )?;
        tx.execute(
            "INSERT OR IGNORE INTO post_labels_cache (post_id, label_id) VALUES (?1, ?2)",
            rusqlite::params![id, label],
        )?;
    }
    // A rewrite may have dropped this post's last reference to an
    // implicit label.
    drop_unreferenced_implicit_labels(&tx)?;

    tx.commit()?;
    Ok(id)
}

/// Remove a post row, its label links, and its FTS entry. Implicit labels
/// that lose their last reference are dropped too.
pub fn remove_post(conn: &mut Connection, file_path: &str) -> CacheResult<()> {
    let tx = conn.transaction()?;
    let id: Option<i64> = tx
        .query_row("SELECT id FROM posts_cache WHERE file_path = ?1", [file_path], |row| {
            row.get(0)
        })
        .optional()?;
    if let Some(id) = id {
        tx.execute("DELETE FROM posts_fts WHERE rowid = ?1", [id])?;
        tx.execute("DELETE FROM posts_cache WHERE id = ?1", [id])?;
        drop_unreferenced_implicit_labels(&tx)?;
    }
    tx.commit()?;
    Ok(())
}

/// Fetch one post with its labels.
pub fn get_post(conn: &Connection, file_path: &str) -> CacheResult<Option<CachedPost>> {
    let row = conn
        .query_row(
            "SELECT id, file_path, title, author, created_at, modified_at, is_draft,
                    content_hash, excerpt, rendered_html
             FROM posts_cache WHERE file_path = ?1",
            [file_path],
            map_post_row,
        )
        .optional()?;
    let Some(mut post) = row else {
        return Ok(None);
    };
    post.labels = labels_of(conn, post.id)?;
    Ok(Some(post))
}

/// Store (or clear) the rendered HTML for a post.
pub fn set_rendered_html(
    conn: &Connection,
    file_path: &str,
    html: Option<&str>,
) -> CacheResult<()> {
    let changed = conn.execute(
        "UPDATE posts_cache SET rendered_html = ?2 WHERE file_path = ?1",
        rusqlite::params![file_path, html],
    )?;
    if changed == 0 {
        return Err(CacheError::NotFound(file_path.to_string()));
    }
    Ok(())
}

/// Listing with filters, label-descendant expansion, FTS, and pagination.
pub fn list_posts(conn: &Connection, query: &PostQuery) -> CacheResult<PostPage> {
    let mut clauses: Vec<String> = Vec::new();
    let mut params: Vec<Box<dyn ToSql>> = Vec::new();

    match query.draft {
        Some(want) => {
            clauses.push(format!("p.is_draft = ?{}", params.len() + 1));
            params.push(Box::new(want));
        }
        None if !query.include_drafts => clauses.push("p.is_draft = 0".to_string()),
        None => {}
    }
    if let Some(author) = &query.author {
        clauses.push(format!("p.author = ?{}", params.len() + 1));
        params.push(Box::new(author.clone()));
    }
    if let Some(from) = &query.created_from {
        clauses.push(format!("p.created_ts >= ?{}", params.len() + 1));
        params.push(Box::new(from.timestamp_micros()));
    }
    if let Some(to) = &query.created_to {
        clauses.push(format!("p.created_ts <= ?{}", params.len() + 1));
        params.push(Box::new(to.timestamp_micros()));
    }
    for label in &query.labels {
        // The label itself or any transitive descendant.
        clauses.push(format!(
            "p.id IN (SELECT pl.post_id FROM post_labels_cache pl WHERE pl.label_id IN (
                WITH RECURSIVE sub(id) AS (
                    SELECT ?{n}
                    UNION
                    SELECT lp.child_id FROM label_parents_cache lp
                        JOIN sub s ON lp.parent_id = s.id
                ) SELECT id FROM sub))",
            n = params.len() + 1
        ));
        params.push(Box::new(label.clone()));
    }
    if let Some(text) = &query.text {
        clauses.push(format!(
            "p.id IN (SELECT rowid FROM posts_fts WHERE posts_fts MATCH ?{})",
            params.len() + 1
        ));
        params.push(Box::new(fts_escape(text)));
    }

    let where_sql =
        if clauses.is_empty() { String::new() } else { format!("WHERE {}", clauses.join(" AND ")) };
    let sort_sql = match query.sort {
        PostSort::CreatedAt => "p.created_ts",
        PostSort::ModifiedAt => "p.modified_ts",
        PostSort::Title => "p.title COLLATE NOCASE",
    };
    let order_sql = match query.order {
        SortOrder::Asc => "ASC",
        SortOrder::Desc => "DESC",
    };

    let count_sql = format!("SELECT COUNT(*) FROM posts_cache p {where_sql}");
    let param_refs: Vec<&dyn ToSql> = params.iter().map(|b| b.as_ref()).collect();
    let total: i64 = conn.query_row(&count_sql, param_refs.as_slice(), |row| row.get(0))?;

    let limit = if query.limit == 0 { 50 } else { query.limit };
    let list_sql = format!(
        "SELECT p.id, p.file_path, p.title, p.author, p.created_at, p.modified_at,
                p.is_draft, p.content_hash, p.excerpt, NULL
         FROM posts_cache p {where_sql}
         ORDER BY {sort_sql} {order_sql}, p.file_path ASC
         LIMIT {limit} OFFSET {offset}",
        offset = query.offset
    );
    let mut stmt = conn.prepare(&list_sql)?;
    let mut posts: Vec<CachedPost> = stmt
        .query_map(param_refs.as_slice(), map_post_row)?
        .collect::<Result<_, _>>()?;
    for post in &mut posts {
        post.labels = labels_of(conn, post.id)?;
    }
    Ok(PostPage { posts, total })
}

/// Replace the whole label universe with the given graph.
pub fn replace_labels(conn: &mut Connection, graph: &LabelGraph) -> CacheResult<()> {
    let tx = conn.transaction()?;
    let keep: Vec<String> = graph.iter().map(|l| l.id.clone()).collect();
    // Delete rows for labels that vanished; cascades clear their edges.
    {
        let mut stmt = tx.prepare("SELECT id FROM labels_cache")?;
        let existing: Vec<String> =
            stmt.query_map([], |row| row.get(0))?.collect::<Result<_, _>>()?;
        for id in existing {
            if !keep.contains(&id) {
                tx.execute("DELETE FROM labels_cache WHERE id = ?1", [&id])?;
            }
        }
    }
    for label in graph.iter() {
        let names = serde_json::to_string(&label.names).unwrap_or_else(|_| "[]".to_string());
        tx.execute(
            "INSERT INTO labels_cache (id, names_json, is_implicit) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET names_json = ?2, is_implicit = ?3",
            rusqlite::params![label.id, names, label.is_implicit],
        )?;
        tx.execute("DELETE FROM label_parents_cache WHERE child_id = ?1", [&label.id])?;
        for parent in &label.parents {
            tx.execute(
                "INSERT OR IGNORE INTO label_parents_cache (child_id, parent_id)
                 VALUES (?1, ?2)",
                rusqlite::params![label.id, parent],
            )?;
        }
    }
    tx.commit()?;
    Ok(())
}

/// Insert or update a single label row and its parent edges. The caller
/// has already run the cycle check on the in-memory graph.
pub fn upsert_label(conn: &Connection, label: &agblogger_labels::Label) -> CacheResult<()> {
    let names = serde_json::to_string(&label.names).unwrap_or_else(|_| "[]".to_string());
    conn.execute(
        "INSERT INTO labels_cache (id, names_json, is_implicit) VALUES (?1, ?2, ?3)
         ON CONFLICT(id) DO UPDATE SET names_json = ?2, is_implicit = ?3",
        rusqlite::params![label.id, names, label.is_implicit],
    )?;
    conn.execute("DELETE FROM label_parents_cache WHERE child_id = ?1", [&label.id])?;
    for parent in &label.parents {
        conn.execute(
            "INSERT OR IGNORE INTO labels_cache (id, names_json, is_implicit)
             VALUES (?1, '[]', 1)",
            [parent],
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO label_parents_cache (child_id, parent_id) VALUES (?1, ?2)",
            rusqlite::params![label.id, parent],
        )?;
    }
    Ok(())
}

/// Remove one label and every edge referencing it.
pub fn delete_label(conn: &Connection, id: &str) -> CacheResult<()> {
    conn.execute("DELETE FROM labels_cache WHERE id = ?1", [id])?;
    Ok(())
}

/// All labels with their parents and post counts.
pub fn list_labels(conn: &Connection) -> CacheResult<Vec<CachedLabel>> {
    let mut stmt = conn.prepare(
        "SELECT l.id, l.names_json, l.is_implicit,
                (SELECT COUNT(*) FROM post_labels_cache pl WHERE pl.label_id = l.id)
         FROM labels_cache l ORDER BY l.id",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, bool>(2)?,
            row.get::<_, i64>(3)?,
        ))
    })?;
    let mut labels = Vec::new();
    for row in rows {
        let (id, names_json, is_implicit, post_count) = row?;
        let names: Vec<String> = serde_json::from_str(&names_json).unwrap_or_default();
        let parents = label_parents(conn, &id)?;
        labels.push(CachedLabel { id, names, parents, is_implicit, post_count });
    }
    Ok(labels)
}

/// One label, or `None`.
pub fn get_label(conn: &Connection, id: &str) -> CacheResult<Option<CachedLabel>> {
    let row = conn
        .query_row(
            "SELECT l.id, l.names_json, l.is_implicit,
                    (SELECT COUNT(*) FROM post_labels_cache pl WHERE pl.label_id = l.id)
             FROM labels_cache l WHERE l.id = ?1",
            [id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, bool>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            },
        )
        .optional()?;
    let Some((id, names_json, is_implicit, post_count)) = row else {
        return Ok(None);
    };
    let names: Vec<String> = serde_json::from_str(&names_json).unwrap_or_default();
    let parents = label_parents(conn, &id)?;
    Ok(Some(CachedLabel { id, names, parents, is_implicit, post_count }))
}

/// Transitive descendants of a label via a recursive query.
pub fn label_descendants(conn: &Connection, id: &str) -> CacheResult<Vec<String>> {
    let mut stmt = conn.prepare(
        "WITH RECURSIVE sub(id) AS (
             SELECT child_id FROM label_parents_cache WHERE parent_id = ?1
             UNION
             SELECT lp.child_id FROM label_parents_cache lp JOIN sub s ON lp.parent_id = s.id
         ) SELECT id FROM sub ORDER BY id",
    )?;
    let rows = stmt.query_map([id], |row| row.get(0))?;
    Ok(rows.collect::<Result<_, _>>()?)
}

/// Replace the server sync manifest.
pub fn replace_manifest(
    conn: &mut Connection,
    manifest: &BTreeMap<String, FileStat>,
    tz: &SiteTz,
) -> CacheResult<()> {
    let tx = conn.transaction()?;
    let now = format_canonical(&tz.now());
    tx.execute("DELETE FROM sync_manifest", [])?;
    for (path, stat) in manifest {
        tx.execute(
            "INSERT INTO sync_manifest (file_path, content_hash, file_size, file_mtime,
                 recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![path, stat.sha256, stat.size as i64, stat.mtime, now],
        )?;
    }
    tx.commit()?;
    Ok(())
}

/// The stored server manifest.
pub fn get_manifest(conn: &Connection) -> CacheResult<BTreeMap<String, FileStat>> {
    let mut stmt =
        conn.prepare("SELECT file_path, content_hash, file_size, file_mtime FROM sync_manifest")?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            FileStat {
                sha256: row.get(1)?,
                size: row.get::<_, i64>(2)? as u64,
                mtime: row.get(3)?,
            },
        ))
    })?;
    Ok(rows.collect::<Result<_, _>>()?)
}

/// Full refresh from scanned state, partitioned per post so readers can
/// interleave on the connection mutex.
pub async fn rebuild(db: &Db, posts: Vec<PostRecord>, graph: &LabelGraph) -> CacheResult<usize> {
    {
        let mut conn = db.lock().await;
        replace_labels(&mut conn, graph)?;
    }
    let keep: BTreeSet<String> = posts.iter().map(|p| p.file_path.clone()).collect();
    let count = posts.len();
    for record in posts {
        let mut conn = db.lock().await;
        upsert_post(&mut conn, &record)?;
    }
    {
        let mut conn = db.lock().await;
        let stale: Vec<String> = {
            let mut stmt = conn.prepare("SELECT file_path FROM posts_cache")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            rows.filter_map(|r| r.ok()).filter(|p| !keep.contains(p)).collect()
        };
        for path in stale {
            remove_post(&mut conn, &path)?;
        }
        let tx = conn.transaction()?;
        drop_unreferenced_implicit_labels(&tx)?;
        tx.commit()?;
    }
    debug!(posts = count, "cache rebuild complete");
    Ok(count)
}

/// Scan the content tree and rebuild the whole cache from it: posts,
/// explicit + implicit labels (with the cycle repair pass for externally
/// edited `labels.toml`), links, and FTS.
pub async fn rebuild_from_disk(
    db: &Db,
    store: &agblogger_content::ContentStore,
    tz: &SiteTz,
    default_author: &str,
) -> CacheResult<usize> {
    let posts = store.scan_posts(tz);
    let records: Vec<PostRecord> =
        posts.iter().map(|p| PostRecord::from_post_file(p, default_author, tz)).collect();

    let labels_file = agblogger_config::LabelsFile::load(store.root())?;
    let implicit: BTreeSet<String> = records.iter().flat_map(|r| r.labels.iter().cloned()).collect();
    let mut graph = LabelGraph::reconcile(&labels_file, &implicit);
    let repaired = graph.break_cycles();
    if !repaired.is_empty() {
        warn!(edges = ?repaired, "label graph required cycle repair during rebuild");
    }

    rebuild(db, records, &graph).await
}

/// Drop implicit labels that no post references anymore; explicit labels
/// always stay.
fn drop_unreferenced_implicit_labels(conn: &Connection) -> CacheResult<()> {
    conn.execute(
        "DELETE FROM labels_cache
         WHERE is_implicit = 1
           AND id NOT IN (SELECT label_id FROM post_labels_cache)
           AND id NOT IN (SELECT parent_id FROM label_parents_cache)",
        [],
    )?;
    Ok(())
}

fn labels_of(conn: &Connection, post_id: i64) -> CacheResult<Vec<String>> {
    let mut stmt = conn
        .prepare("SELECT label_id FROM post_labels_cache WHERE post_id = ?1 ORDER BY label_id")?;
    let rows = stmt.query_map([post_id], |row| row.get(0))?;
    Ok(rows.collect::<Result<_, _>>()?)
}

fn label_parents(conn: &Connection, id: &str) -> CacheResult<Vec<String>> {
    let mut stmt = conn
        .prepare("SELECT parent_id FROM label_parents_cache WHERE child_id = ?1 ORDER BY parent_id")?;
    let rows = stmt.query_map([id], |row| row.get(0))?;
    Ok(rows.collect::<Result<_, _>>()?)
}

fn map_post_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CachedPost> {
    Ok(CachedPost {
        id: row.get(0)?,
        file_path: row.get(1)?,
        title: row.get(2)?,
        author: row.get(3)?,
        created_at: row.get(4)?,
        modified_at: row.get(5)?,
        is_draft: row.get(6)?,
        labels: Vec::new(),
        content_hash: row.get(7)?,
        excerpt: row.get(8)?,
        rendered_html: row.get(9)?,
    })
}

/// Quote the user's query so FTS5 operators cannot leak in.
fn fts_escape(text: &str) -> String {
    format!("\"{}\"", text.replace('"', "\"\""))
}

static EXCERPT_STRIP: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    vec![
        // Fenced code blocks go entirely.
        (Regex::new(r"(?s)```.*?```").expect("static regex"), " "),
        // Images keep their alt text, links keep their label.
        (Regex::new(r"!\[([^\]]*)\]\([^)]*\)").expect("static regex"), "$1"),
        (Regex::new(r"\[([^\]]*)\]\([^)]*\)").expect("static regex"), "$1"),
        // Inline code keeps its content.
        (Regex::new(r"`([^`]*)`").expect("static regex"), "$1"),
        // Heading markers, blockquotes, emphasis.
        (Regex::new(r"(?m)^#{1,6}\s*").expect("static regex"), ""),
        (Regex::new(r"(?m)^>\s*").expect("static regex"), ""),
        (Regex::new(r"[*_~]").expect("static regex"), ""),
    ]
});

/// Conservative plain-text prefix of a markdown body.
pub fn excerpt_of(body: &str) -> String {
    let mut text = body.to_string();
    for (re, replacement) in EXCERPT_STRIP.iter() {
        text = re.replace_all(&text, *replacement).into_owned();
    }
    let collapsed: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.chars().take(EXCERPT_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use agblogger_config::LabelsFile;
    use chrono::TimeZone;

    fn record(path: &str, labels: &[&str]) -> PostRecord {
        let created = chrono::FixedOffset::east_opt(0)
            .expect("offset")
            .with_ymd_and_hms(2024, 6, 1, 12, 0, 0)
            .single()
            .expect("dt");
        PostRecord {
            file_path: path.to_string(),
            title: format!("Title of {path}"),
            author: "alice".to_string(),
            created_at: created,
            modified_at: created,
            is_draft: false,
            labels: labels.iter().map(|s| s.to_string()).collect(),
            content_hash: "h".repeat(64),
            body: format!("# Title of {path}\n\nSome body about gardening.\n"),
        }
    }

    async fn test_db() -> Db {
        Db::open_in_memory().expect("open")
    }

    #[tokio::test]
    async fn schema_initializes_with_version() {
        let db = test_db().await;
        let conn = db.lock().await;
        assert_eq!(schema_version(&conn).expect("version").as_deref(), Some("1"));
        // Re-running the migration is harmless.
        init_schema(&conn).expect("idempotent init");
    }

    #[tokio::test]
    async fn upsert_and_get_roundtrip() {
        let db = test_db().await;
        let mut conn = db.lock().await;
        let id = upsert_post(&mut conn, &record("posts/a.md", &["tech"])).expect("upsert");

        let post = get_post(&conn, "posts/a.md").expect("get").expect("present");
        assert_eq!(post.id, id);
        assert_eq!(post.labels, vec!["tech"]);
        assert_eq!(post.created_at, "2024-06-01 12:00:00.000000+0000");
        assert!(post.excerpt.contains("gardening"));
    }

    #[tokio::test]
    async fn upsert_twice_keeps_one_row_and_one_fts_entry() {
        let db = test_db().await;
        let mut conn = db.lock().await;
        upsert_post(&mut conn, &record("posts/a.md", &[])).expect("first");
        upsert_post(&mut conn, &record("posts/a.md", &["x"])).expect("second");

        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM posts_cache", [], |r| r.get(0))
            .expect("count");
        let fts: i64 =
            conn.query_row("SELECT COUNT(*) FROM posts_fts", [], |r| r.get(0)).expect("fts count");
        assert_eq!(rows, 1);
        assert_eq!(fts, 1);
    }

    #[tokio::test]
    async fn remove_post_clears_fts_and_implicit_labels() {
        let db = test_db().await;
        let mut conn = db.lock().await;
        upsert_post(&mut conn, &record("posts/a.md", &["only-here"])).expect("upsert");
        remove_post(&mut conn, "posts/a.md").expect("remove");

        let fts: i64 =
            conn.query_row("SELECT COUNT(*) FROM posts_fts", [], |r| r.get(0)).expect("fts");
        assert_eq!(fts, 0);
        assert!(get_label(&conn, "only-here").expect("label").is_none());
    }

    #[tokio::test]
    async fn fts_search_finds_body_words() {
        let db = test_db().await;
        let mut conn = db.lock().await;
        upsert_post(&mut conn, &record("posts/a.md", &[])).expect("a");
        let mut other = record("posts/b.md", &[]);
        other.body = "# B\n\nNothing relevant here.\n".to_string();
        upsert_post(&mut conn, &other).expect("b");

        let page = list_posts(
            &conn,
            &PostQuery { text: Some("gardening".to_string()), ..Default::default() },
        )
        .expect("list");
        assert_eq!(page.total, 1);
        assert_eq!(page.posts[0].file_path, "posts/a.md");

        // FTS operators must not break the query.
        let page = list_posts(
            &conn,
            &PostQuery { text: Some("\"garden* OR".to_string()), ..Default::default() },
        )
        .expect("list with operators");
        assert_eq!(page.total, 0);
    }

    #[tokio::test]
    async fn label_filter_includes_descendants() {
        let db = test_db().await;
        let mut conn = db.lock().await;
        let mut file = LabelsFile::default();
        file.labels.insert(
            "rust".into(),
            agblogger_config::LabelEntry { names: vec![], parents: vec!["tech".into()] },
        );
        file.labels
            .insert("tech".into(), agblogger_config::LabelEntry { names: vec![], parents: vec![] });
        let graph = LabelGraph::reconcile(&file, &BTreeSet::new());
        replace_labels(&mut conn, &graph).expect("labels");

        upsert_post(&mut conn, &record("posts/rusty.md", &["rust"])).expect("rusty");
        upsert_post(&mut conn, &record("posts/techy.md", &["tech"])).expect("techy");
        upsert_post(&mut conn, &record("posts/other.md", &[])).expect("other");

        let page = list_posts(
            &conn,
            &PostQuery { labels: vec!["tech".to_string()], ..Default::default() },
        )
        .expect("list");
        let mut paths: Vec<&str> = page.posts.iter().map(|p| p.file_path.as_str()).collect();
        paths.sort();
        assert_eq!(paths, vec!["posts/rusty.md", "posts/techy.md"]);

        let descendants = label_descendants(&conn, "tech").expect("desc");
        assert_eq!(descendants, vec!["rust"]);
    }

    #[tokio::test]
    async fn draft_filtering() {
        let db = test_db().await;
        let mut conn = db.lock().await;
        let mut draft = record("posts/draft.md", &[]);
        draft.is_draft = true;
        upsert_post(&mut conn, &draft).expect("draft");
        upsert_post(&mut conn, &record("posts/live.md", &[])).expect("live");

        let public = list_posts(&conn, &PostQuery::default()).expect("public");
        assert_eq!(public.total, 1);
        assert_eq!(public.posts[0].file_path, "posts/live.md");

        let admin = list_posts(&conn, &PostQuery { include_drafts: true, ..Default::default() })
            .expect("admin");
        assert_eq!(admin.total, 2);

        let only_drafts =
            list_posts(&conn, &PostQuery { draft: Some(true), ..Default::default() })
                .expect("drafts");
        assert_eq!(only_drafts.posts[0].file_path, "posts/draft.md");
    }

    #[tokio::test]
    async fn sort_and_pagination() {
        let db = test_db().await;
        let mut conn = db.lock().await;
        for (i, name) in ["c", "a", "b"].iter().enumerate() {
            let mut r = record(&format!("posts/{name}.md"), &[]);
            r.title = name.to_uppercase();
            r.created_at += chrono::Duration::hours(i as i64);
            r.modified_at = r.created_at;
            upsert_post(&mut conn, &r).expect("upsert");
        }

        let by_title = list_posts(
            &conn,
            &PostQuery { sort: PostSort::Title, order: SortOrder::Asc, ..Default::default() },
        )
        .expect("by title");
        let titles: Vec<&str> = by_title.posts.iter().map(|p| p.title.as_str()).collect();
        assert_eq!(titles, vec!["A", "B", "C"]);

        let newest_first = list_posts(&conn, &PostQuery::default()).expect("newest");
        assert_eq!(newest_first.posts[0].file_path, "posts/b.md");

        let page2 = list_posts(
            &conn,
            &PostQuery { limit: 2, offset: 2, ..Default::default() },
        )
        .expect("page 2");
        assert_eq!(page2.total, 3);
        assert_eq!(page2.posts.len(), 1);
    }

    #[tokio::test]
    async fn rendered_html_cache_set_and_cleared_on_upsert() {
        let db = test_db().await;
        let mut conn = db.lock().await;
        upsert_post(&mut conn, &record("posts/a.md", &[])).expect("upsert");
        set_rendered_html(&conn, "posts/a.md", Some("<p>x</p>")).expect("set");
        assert_eq!(
            get_post(&conn, "posts/a.md").expect("get").expect("post").rendered_html.as_deref(),
            Some("<p>x</p>")
        );

        // Any rewrite invalidates the cached HTML.
        upsert_post(&mut conn, &record("posts/a.md", &[])).expect("re-upsert");
        assert_eq!(
            get_post(&conn, "posts/a.md").expect("get").expect("post").rendered_html,
            None
        );

        assert!(matches!(
            set_rendered_html(&conn, "posts/ghost.md", Some("x")),
            Err(CacheError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn rebuild_converges_with_incremental(){
        let db = test_db().await;
        // Incremental path.
        {
            let mut conn = db.lock().await;
            upsert_post(&mut conn, &record("posts/a.md", &["x"])).expect("a");
            upsert_post(&mut conn, &record("posts/b.md", &["y"])).expect("b");
            remove_post(&mut conn, "posts/b.md").expect("rm b");
            upsert_post(&mut conn, &record("posts/c.md", &["x", "z"])).expect("c");
        }
        let incremental = snapshot(&db).await;

        // Fresh database, same end state via rebuild.
        let db2 = test_db().await;
        let graph = LabelGraph::reconcile(&LabelsFile::default(), &BTreeSet::new());
        rebuild(
            &db2,
            vec![record("posts/a.md", &["x"]), record("posts/c.md", &["x", "z"])],
            &graph,
        )
        .await
        .expect("rebuild");
        let rebuilt = snapshot(&db2).await;

        assert_eq!(incremental, rebuilt);
    }

    #[tokio::test]
    async fn manifest_roundtrip() {
        let db = test_db().await;
        let mut conn = db.lock().await;
        let mut manifest = BTreeMap::new();
        manifest.insert(
            "posts/a.md".to_string(),
            FileStat { sha256: "a".repeat(64), size: 10, mtime: 1_700_000_000 },
        );
        replace_manifest(&mut conn, &manifest, &SiteTz::utc()).expect("replace");
        assert_eq!(get_manifest(&conn).expect("get"), manifest);

        replace_manifest(&mut conn, &BTreeMap::new(), &SiteTz::utc()).expect("clear");
        assert!(get_manifest(&conn).expect("get").is_empty());
    }

    #[tokio::test]
    async fn rebuild_from_disk_scans_everything() {
        use agblogger_frontmatter::FrontMatter;

        let td = tempfile::tempdir().expect("tempdir");
        let store = agblogger_content::ContentStore::open(td.path()).expect("store");
        let tz = SiteTz::utc();

        let mut front = FrontMatter::default();
        front.labels = ["rust".to_string()].into();
        store.write_post("posts/tech/swe/a.md", &front, "# A\n\nbody\n").expect("a");
        let mut draft = FrontMatter::default();
        draft.draft = true;
        store.write_post("posts/hidden.md", &draft, "# Hidden\n").expect("hidden");
        std::fs::write(
            td.path().join("labels.toml"),
            "[labels.rust]\nnames = [\"Rust\"]\nparent = \"tech\"\n",
        )
        .expect("labels.toml");

        let db = test_db().await;
        let count = rebuild_from_disk(&db, &store, &tz, "site-author").await.expect("rebuild");
        assert_eq!(count, 2);

        let conn = db.lock().await;
        let post = get_post(&conn, "posts/tech/swe/a.md").expect("get").expect("cached");
        // Front-matter label plus both directory segments.
        assert_eq!(post.labels, vec!["rust", "swe", "tech"]);
        assert_eq!(post.author, "site-author");

        let rust = get_label(&conn, "rust").expect("label").expect("rust");
        assert!(!rust.is_implicit);
        assert_eq!(rust.parents, vec!["tech"]);
        let swe = get_label(&conn, "swe").expect("label").expect("swe");
        assert!(swe.is_implicit);

        let hidden = get_post(&conn, "posts/hidden.md").expect("get").expect("cached");
        assert!(hidden.is_draft);
    }

    #[test]
    fn excerpt_strips_markdown() {
        let body = "# Heading\n\nSome *bold* text with [a link](https://x) and \
                    `code`.\n\n```rust\nfn secret() {}\n```\n\n> quoted\n";
        let excerpt = excerpt_of(body);
        assert!(excerpt.contains("Some bold text with a link and code."));
        assert!(!excerpt.contains("secret"));
        assert!(!excerpt.contains('#'));
        assert!(!excerpt.contains('['));
    }

    #[test]
    fn excerpt_caps_length() {
        let body = "word ".repeat(200);
        assert_eq!(excerpt_of(&body).chars().count(), EXCERPT_CHARS);
    }

    /// Deterministic dump of the derived tables for convergence checks.
    async fn snapshot(db: &Db) -> Vec<String> {
        let conn = db.lock().await;
        let mut out = Vec::new();
        let mut stmt = conn
            .prepare(
                "SELECT file_path, title, author, created_at, is_draft, content_hash, excerpt
                 FROM posts_cache ORDER BY file_path",
            )
            .expect("prepare");
        let rows = stmt
            .query_map([], |row| {
                Ok(format!(
                    "{}|{}|{}|{}|{}|{}|{}",
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, bool>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })
            .expect("query");
        for row in rows {
            out.push(row.expect("row"));
        }
        let mut stmt = conn
            .prepare(
                "SELECT p.file_path, pl.label_id FROM post_labels_cache pl
                 JOIN posts_cache p ON p.id = pl.post_id ORDER BY p.file_path, pl.label_id",
            )
            .expect("prepare");
        let rows = stmt
            .query_map([], |row| {
                Ok(format!("{}#{}", row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .expect("query");
        for row in rows {
            out.push(row.expect("row"));
        }
        let mut stmt =
            conn.prepare("SELECT id, is_implicit FROM labels_cache ORDER BY id").expect("prepare");
        let rows = stmt
            .query_map([], |row| {
                Ok(format!("label:{}:{}", row.get::<_, String>(0)?, row.get::<_, bool>(1)?))
            })
            .expect("query");
        for row in rows {
            out.push(row.expect("row"));
        }
        out
    }
}
