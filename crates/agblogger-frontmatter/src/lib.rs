//! YAML front-matter codec for agblogger markdown files.
//!
//! A post file is an optional YAML header fenced by `---` lines followed by
//! the markdown body. The codec recognizes `created_at`, `modified_at`,
//! `author`, `labels`, and `draft`; every other field round-trips verbatim.
//! Timestamps are canonicalized on serialization, label tokens are stored
//! without their `#` sigil and re-emitted with it, sorted.
//!
//! A missing or malformed header never fails: the whole file becomes the
//! body and the header is empty.

use std::collections::BTreeSet;

use agblogger_datetime::{SiteTz, format_canonical};
use chrono::{DateTime, FixedOffset};
use serde_yaml::{Mapping, Value};
use tracing::warn;

const FENCE: &str = "---";

/// Parsed front-matter header.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrontMatter {
    pub created_at: Option<DateTime<FixedOffset>>,
    pub modified_at: Option<DateTime<FixedOffset>>,
    pub author: Option<String>,
    /// Label ids, without the `#` sigil.
    pub labels: BTreeSet<String>,
    pub draft: bool,
    /// Unrecognized fields, preserved in original order.
    pub extra: Mapping,
}

impl FrontMatter {
    /// True when serialization would emit no header at all.
    pub fn is_empty(&self) -> bool {
        self.created_at.is_none()
            && self.modified_at.is_none()
            && self.author.is_none()
            && self.labels.is_empty()
            && !self.draft
            && self.extra.is_empty()
    }

    /// Split a markdown file into its header and body.
    ///
    /// The header must start at byte zero with a `---` line and end at the
    /// next `---` line. Unparseable YAML degrades to an empty header with
    /// the entire input as body.
    pub fn parse(text: &str, tz: &SiteTz) -> (Self, String) {
        let Some((header_text, body)) = split_fences(text) else {
            return (Self::default(), text.to_string());
        };

        let mapping: Mapping = match serde_yaml::from_str(header_text) {
            Ok(Value::Mapping(m)) => m,
            Ok(Value::Null) => Mapping::new(),
            Ok(_) | Err(_) => {
                warn!("malformed front-matter header, treating whole file as body");
                return (Self::default(), text.to_string());
            }
        };

        let mut fm = Self::default();
        for (key, value) in mapping {
            let Some(name) = key.as_str() else {
                fm.extra.insert(key, value);
                continue;
            };
            match name {
                "created_at" => fm.created_at = parse_timestamp(&value, tz),
                "modified_at" => fm.modified_at = parse_timestamp(&value, tz),
                "author" => fm.author = value.as_str().map(str::to_string),
                "draft" => fm.draft = value.as_bool().unwrap_or(false),
                "labels" => fm.labels = parse_labels(&value),
                _ => {
                    fm.extra.insert(Value::String(name.to_string()), value);
                }
            }
        }
        (fm, body.to_string())
    }

    /// Reassemble the file with a normalized header.
    ///
    /// Timestamps come out canonical, labels sorted with their `#` sigil,
    /// `draft` only when set. An empty header serializes to the bare body.
    pub fn serialize(&self, body: &str) -> String {
        if self.is_empty() {
            return body.to_string();
        }

        let mut mapping = Mapping::new();
        if let Some(created) = &self.created_at {
            mapping.insert(
                Value::String("created_at".into()),
                Value::String(format_canonical(created)),
            );
        }
        if let Some(modified) = &self.modified_at {
            mapping.insert(
                Value::String("modified_at".into()),
                Value::String(format_canonical(modified)),
            );
        }
        if let Some(author) = &self.author {
            mapping.insert(Value::String("author".into()), Value::String(author.clone()));
        }
        if !self.labels.is_empty() {
            let tokens: Vec<Value> = self
                .labels
                .iter()
                .map(|id| Value::String(format!("#{id}")))
                .collect();
            mapping.insert(Value::String("labels".into()), Value::Sequence(tokens));
        }
        if self.draft {
            mapping.insert(Value::String("draft".into()), Value::Bool(true));
        }
        for (key, value) in &self.extra {
            mapping.insert(key.clone(), value.clone());
        }

        // serde_yaml output for a mapping always ends with a newline.
        let yaml = serde_yaml::to_string(&mapping).unwrap_or_default();
        format!("{FENCE}\n{yaml}{FENCE}\n{body}")
    }
}

/// Strip the `#` sigil from a label token; bare ids pass through.
pub fn label_token_to_id(token: &str) -> Option<String> {
    let id = token.strip_prefix('#').unwrap_or(token).trim();
    if id.is_empty() { None } else { Some(id.to_ascii_lowercase()) }
}

fn parse_labels(value: &Value) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    match value {
        Value::Sequence(items) => {
            for item in items {
                if let Some(token) = item.as_str()
                    && let Some(id) = label_token_to_id(token)
                {
                    out.insert(id);
                }
            }
        }
        // A single scalar is tolerated as a one-element list.
        Value::String(token) => {
            if let Some(id) = label_token_to_id(token) {
                out.insert(id);
            }
        }
        _ => {}
    }
    out
}

fn parse_timestamp(value: &Value, tz: &SiteTz) -> Option<DateTime<FixedOffset>> {
    let raw = value.as_str()?;
    match agblogger_datetime::parse(raw, tz) {
        Ok(dt) => Some(dt),
        Err(err) => {
            warn!(value = raw, %err, "ignoring unparseable front-matter timestamp");
            None
        }
    }
}

/// Locate the fenced header. Returns `(header_yaml, body)`.
fn split_fences(text: &str) -> Option<(&str, &str)> {
    let after_open = text.strip_prefix("---\n").or_else(|| text.strip_prefix("---\r\n"))?;
    // The closing fence is a `---` on its own line; also accept it as the
    // final line without a trailing newline.
    let mut offset = 0;
    for line in after_open.split_inclusive('\n') {
        if line.trim_end_matches(['\r', '\n']) == FENCE {
            let header = &after_open[..offset];
            let body = &after_open[offset + line.len()..];
            return Some((header, body));
        }
        offset += line.len();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc() -> SiteTz {
        SiteTz::utc()
    }

    const SAMPLE: &str = "---\n\
created_at: 2024-06-01 10:00:00\n\
author: alice\n\
labels:\n\
  - \"#tech\"\n\
  - rust\n\
draft: true\n\
custom_field: kept\n\
---\n\
# Title\n\nBody text.\n";

    #[test]
    fn parses_recognized_fields() {
        let (fm, body) = FrontMatter::parse(SAMPLE, &utc());
        assert_eq!(fm.author.as_deref(), Some("alice"));
        assert!(fm.draft);
        assert_eq!(
            fm.labels.iter().cloned().collect::<Vec<_>>(),
            vec!["rust".to_string(), "tech".to_string()]
        );
        assert!(fm.created_at.is_some());
        assert!(fm.modified_at.is_none());
        assert_eq!(body, "# Title\n\nBody text.\n");
    }

    #[test]
    fn unknown_fields_survive_roundtrip() {
        let (fm, body) = FrontMatter::parse(SAMPLE, &utc());
        let rendered = fm.serialize(&body);
        let (fm2, body2) = FrontMatter::parse(&rendered, &utc());
        assert_eq!(fm, fm2);
        assert_eq!(body, body2);
        assert!(rendered.contains("custom_field: kept"));
    }

    #[test]
    fn serialization_canonicalizes_timestamps() {
        let (fm, body) = FrontMatter::parse(SAMPLE, &utc());
        let rendered = fm.serialize(&body);
        assert!(rendered.contains("2024-06-01 10:00:00.000000+0000"));
    }

    #[test]
    fn labels_emit_sorted_with_sigil() {
        let (fm, body) = FrontMatter::parse(SAMPLE, &utc());
        let rendered = fm.serialize(&body);
        let rust_pos = rendered.find("'#rust'").expect("rust label");
        let tech_pos = rendered.find("'#tech'").expect("tech label");
        assert!(rust_pos < tech_pos);
    }

    #[test]
    fn no_header_means_whole_file_is_body() {
        let text = "# Just a post\n\nNo header here.\n";
        let (fm, body) = FrontMatter::parse(text, &utc());
        assert!(fm.is_empty());
        assert_eq!(body, text);
    }

    #[test]
    fn unterminated_fence_is_body() {
        let text = "---\nauthor: alice\nno closing fence\n";
        let (fm, body) = FrontMatter::parse(text, &utc());
        assert!(fm.is_empty());
        assert_eq!(body, text);
    }

    #[test]
    fn malformed_yaml_is_body() {
        let text = "---\n: : : not yaml : :\n---\nbody\n";
        let (fm, body) = FrontMatter::parse(text, &utc());
        assert!(fm.is_empty());
        assert_eq!(body, text);
    }

    #[test]
    fn empty_header_serializes_to_bare_body() {
        let fm = FrontMatter::default();
        assert_eq!(fm.serialize("hello\n"), "hello\n");
    }

    #[test]
    fn single_label_scalar_tolerated() {
        let text = "---\nlabels: \"#solo\"\n---\nbody\n";
        let (fm, _) = FrontMatter::parse(text, &utc());
        assert_eq!(fm.labels.iter().cloned().collect::<Vec<_>>(), vec!["solo".to_string()]);
    }

    #[test]
    fn label_tokens_lowercase_and_strip_sigil() {
        assert_eq!(label_token_to_id("#Tech"), Some("tech".to_string()));
        assert_eq!(label_token_to_id("rust"), Some("rust".to_string()));
        assert_eq!(label_token_to_id("#"), None);
        assert_eq!(label_token_to_id(""), None);
    }

    #[test]
    fn naive_timestamp_uses_site_timezone() {
        let berlin = SiteTz::new(Some("Europe/Berlin"));
        let text = "---\ncreated_at: 2024-06-01 10:00:00\n---\nbody\n";
        let (fm, _) = FrontMatter::parse(text, &berlin);
        let created = fm.created_at.expect("created");
        assert_eq!(format_canonical(&created), "2024-06-01 10:00:00.000000+0200");
    }

    #[test]
    fn bad_timestamp_dropped_not_fatal() {
        let text = "---\ncreated_at: yesterdayish\nauthor: bob\n---\nbody\n";
        let (fm, _) = FrontMatter::parse(text, &utc());
        assert!(fm.created_at.is_none());
        assert_eq!(fm.author.as_deref(), Some("bob"));
    }

    #[test]
    fn draft_non_bool_defaults_false() {
        let text = "---\ndraft: maybe\n---\nbody\n";
        let (fm, _) = FrontMatter::parse(text, &utc());
        assert!(!fm.draft);
    }
}
