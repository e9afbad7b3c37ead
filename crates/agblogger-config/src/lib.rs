//! TOML configuration codec for the content directory.
//!
//! Two files live at the content root: `index.toml` (site metadata plus the
//! ordered page list) and `labels.toml` (explicit label definitions). Reads
//! are forgiving: a missing or unparseable file yields defaults with a
//! logged warning. Writes are atomic: a unique temporary file in the same
//! directory, fsynced, then renamed over the target.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// File name of the site configuration, relative to the content root.
pub const INDEX_FILE: &str = "index.toml";
/// File name of the label definitions, relative to the content root.
pub const LABELS_FILE: &str = "labels.toml";
/// The built-in page id that denotes the post timeline.
pub const TIMELINE_PAGE_ID: &str = "timeline";

static PAGE_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^[a-z0-9_-]+$").expect("static regex"));

/// Configuration codec failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("page id {0:?} is not lowercase alphanumeric/_/-")]
    InvalidPageId(String),
    #[error("failed to access {path}")]
    IoFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// The `[site]` section of `index.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SiteSection {
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_author: Option<String>,
    /// IANA timezone name; validated downstream, stored verbatim here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

/// One `[[pages]]` entry of `index.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageEntry {
    pub id: String,
    pub title: String,
    /// Markdown file backing the page, relative to the content root.
    /// Absent for built-in pages such as the timeline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

/// Parsed `index.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexConfig {
    #[serde(default)]
    pub site: SiteSection,
    #[serde(default)]
    pub pages: Vec<PageEntry>,
}

impl IndexConfig {
    /// Load `index.toml` from the content root.
    ///
    /// Missing file or parse failure yields defaults with a warning; other
    /// IO errors propagate.
    pub fn load(content_dir: &Path) -> Result<Self, ConfigError> {
        let path = content_dir.join(INDEX_FILE);
        let Some(text) = read_optional(&path)? else {
            return Ok(Self::default());
        };
        let mut config: Self = match toml::from_str(&text) {
            Ok(c) => c,
            Err(err) => {
                warn!(path = %path.display(), %err, "unparseable index.toml, using defaults");
                return Ok(Self::default());
            }
        };
        config.pages.retain(|page| {
            let keep = is_valid_page_id(&page.id);
            if !keep {
                warn!(id = page.id, "dropping page entry with invalid id");
            }
            keep
        });
        Ok(config)
    }

    /// Atomically write `index.toml`, rejecting invalid page ids.
    pub fn store(&self, content_dir: &Path) -> Result<(), ConfigError> {
        for page in &self.pages {
            if !is_valid_page_id(&page.id) {
                return Err(ConfigError::InvalidPageId(page.id.clone()));
            }
        }
        let text = to_toml(self, content_dir.join(INDEX_FILE))?;
        write_atomic(&content_dir.join(INDEX_FILE), text.as_bytes())
    }

    /// Find a page entry by id.
    pub fn page(&self, id: &str) -> Option<&PageEntry> {
        self.pages.iter().find(|p| p.id == id)
    }
}

/// One `[labels.<id>]` entry of `labels.toml`, normalized.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LabelEntry {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub names: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parents: Vec<String>,
}

/// Parsed `labels.toml`: label id → definition, in id order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LabelsFile {
    pub labels: BTreeMap<String, LabelEntry>,
}

/// `parent = "x"` / `parents = ["x", "y"]` both deserialize; serialization
/// always writes the list form.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn into_vec(self) -> Vec<String> {
        match self {
            Self::One(s) => vec![s],
            Self::Many(v) => v,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawLabelEntry {
    #[serde(default)]
    names: Vec<String>,
    parent: Option<OneOrMany>,
    parents: Option<OneOrMany>,
}

#[derive(Debug, Default, Deserialize)]
struct RawLabelsFile {
    #[serde(default)]
    labels: BTreeMap<String, RawLabelEntry>,
}

#[derive(Debug, Serialize)]
struct LabelsFileOut<'a> {
    labels: &'a BTreeMap<String, LabelEntry>,
}

impl LabelsFile {
    /// Load `labels.toml` from the content root; same failure policy as
    /// [`IndexConfig::load`].
    pub fn load(content_dir: &Path) -> Result<Self, ConfigError> {
        let path = content_dir.join(LABELS_FILE);
        let Some(text) = read_optional(&path)? else {
            return Ok(Self::default());
        };
        let raw: RawLabelsFile = match toml::from_str(&text) {
            Ok(r) => r,
            Err(err) => {
                warn!(path = %path.display(), %err, "unparseable labels.toml, using defaults");
                return Ok(Self::default());
            }
        };
        let labels = raw
            .labels
            .into_iter()
            .map(|(id, entry)| {
                let mut parents: Vec<String> = entry
                    .parent
                    .into_iter()
                    .chain(entry.parents)
                    .flat_map(OneOrMany::into_vec)
                    .collect();
                parents.sort();
                parents.dedup();
                (id, LabelEntry { names: entry.names, parents })
            })
            .collect();
        Ok(Self { labels })
    }

    /// Atomically write `labels.toml`.
    pub fn store(&self, content_dir: &Path) -> Result<(), ConfigError> {
        let out = LabelsFileOut { labels: &self.labels };
        let text = to_toml(&out, content_dir.join(LABELS_FILE))?;
        write_atomic(&content_dir.join(LABELS_FILE), text.as_bytes())
    }
}

fn to_toml<T: Serialize>(value: &T, path: PathBuf) -> Result<String, ConfigError> {
    toml::to_string_pretty(value).map_err(|err| ConfigError::IoFailure {
        path,
        source: std::io::Error::new(std::io::ErrorKind::InvalidData, err),
    })
}

/// Whether `id` matches the page id pattern `^[a-z0-9_-]+$`.
pub fn is_valid_page_id(id: &str) -> bool {
    PAGE_ID_RE.is_match(id)
}

/// Atomic replace: unique temp file in the target's directory, fsync,
/// rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), ConfigError> {
    let io_err = |source| ConfigError::IoFailure { path: path.to_path_buf(), source };
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
    tmp.write_all(bytes).map_err(io_err)?;
    tmp.as_file().sync_all().map_err(io_err)?;
    tmp.persist(path)
        .map_err(|err| ConfigError::IoFailure { path: path.to_path_buf(), source: err.error })?;
    Ok(())
}

fn read_optional(path: &Path) -> Result<Option<String>, ConfigError> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(ConfigError::IoFailure { path: path.to_path_buf(), source: err }),
    }
}
