//! The label DAG: a multi-parent graph over label ids.
//!
//! Labels come from two sources. Explicit labels are defined in
//! `labels.toml` with display names and parents. Implicit labels
//! materialize on first reference, from a `#token` in front matter or a
//! directory segment under `posts/`, and carry no names or parents.
//!
//! The one structural invariant is that the parent relation stays acyclic
//! across the union of all labels. Interactive updates enforce it with a
//! reachability check that runs before any edge is touched; bulk rebuilds
//! tolerate externally edited TOML through an edge-removing repair pass.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::LazyLock;

use agblogger_config::{LabelEntry, LabelsFile};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

static LABEL_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^[a-z0-9][a-z0-9_-]*$").expect("static regex"));

/// Whether `id` matches the label id pattern `^[a-z0-9][a-z0-9_-]*$`.
pub fn is_valid_label_id(id: &str) -> bool {
    LABEL_ID_RE.is_match(id)
}

/// Label DAG failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LabelError {
    #[error("label id {0:?} is invalid")]
    InvalidId(String),
    #[error("label {0:?} does not exist")]
    NotFound(String),
    /// Applying the update would close a cycle through the named edge.
    #[error("edge {child} -> {parent} would create a cycle")]
    CycleDetected { child: String, parent: String },
}

/// A single label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub id: String,
    /// Ordered display aliases; empty for implicit labels.
    pub names: Vec<String>,
    pub parents: BTreeSet<String>,
    pub is_implicit: bool,
}

impl Label {
    /// An implicit label: no names, no parents.
    pub fn implicit(id: impl Into<String>) -> Self {
        Self { id: id.into(), names: Vec::new(), parents: BTreeSet::new(), is_implicit: true }
    }
}

/// Adjacency-map label graph, keyed by id for deterministic iteration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelGraph {
    labels: BTreeMap<String, Label>,
}

impl LabelGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rehydrate a graph from trusted rows (the cache). No cycle check
    /// runs here; the rows were validated when they were written.
    pub fn from_labels(labels: impl IntoIterator<Item = Label>) -> Self {
        Self { labels: labels.into_iter().map(|l| (l.id.clone(), l)).collect() }
    }

    /// Combine explicit definitions with implicitly referenced ids.
    ///
    /// Parents that name undefined labels materialize those labels as
    /// implicit. The result is not checked for cycles here; interactive
    /// paths are protected by [`LabelGraph::upsert`], and rebuilds run
    /// [`LabelGraph::break_cycles`] afterwards.
    pub fn reconcile(file: &LabelsFile, implicit: &BTreeSet<String>) -> Self {
        let mut graph = Self::new();
        for (id, entry) in &file.labels {
            if !is_valid_label_id(id) {
                warn!(id, "skipping labels.toml entry with invalid id");
                continue;
            }
            let parents: BTreeSet<String> =
                entry.parents.iter().filter(|p| is_valid_label_id(p)).cloned().collect();
            graph.labels.insert(
                id.clone(),
                Label { id: id.clone(), names: entry.names.clone(), parents, is_implicit: false },
            );
        }
        // Parents referencing unknown ids, then the scan-provided set.
        let dangling: Vec<String> = graph
            .labels
            .values()
            .flat_map(|l| l.parents.iter())
            .filter(|p| !graph.labels.contains_key(*p))
            .cloned()
            .collect();
        for id in dangling.into_iter().chain(implicit.iter().cloned()) {
            if is_valid_label_id(&id) {
                graph.labels.entry(id.clone()).or_insert_with(|| Label::implicit(id));
            }
        }
        graph
    }

    pub fn get(&self, id: &str) -> Option<&Label> {
        self.labels.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.labels.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Label> {
        self.labels.values()
    }

    /// Insert or update a label.
    ///
    /// The cycle check runs against the graph as it would look after the
    /// update, before any existing edge is deleted, so a rejected update
    /// leaves the graph untouched. Unknown parents materialize as implicit
    /// labels on success.
    pub fn upsert(&mut self, label: Label) -> Result<(), LabelError> {
        if !is_valid_label_id(&label.id) {
            return Err(LabelError::InvalidId(label.id));
        }
        for parent in &label.parents {
            if !is_valid_label_id(parent) {
                return Err(LabelError::InvalidId(parent.clone()));
            }
            if *parent == label.id {
                return Err(LabelError::CycleDetected {
                    child: label.id.clone(),
                    parent: parent.clone(),
                });
            }
        }
        if let Some(offending) = self.first_cycle_edge(&label.id, &label.parents) {
            return Err(LabelError::CycleDetected { child: label.id, parent: offending });
        }
        for parent in &label.parents {
            if !self.labels.contains_key(parent) {
                self.labels.insert(parent.clone(), Label::implicit(parent.clone()));
            }
        }
        self.labels.insert(label.id.clone(), label);
        Ok(())
    }

    /// Remove a label and every edge referencing it, in either direction.
    pub fn delete(&mut self, id: &str) -> Result<Label, LabelError> {
        let removed = self.labels.remove(id).ok_or_else(|| LabelError::NotFound(id.into()))?;
        for label in self.labels.values_mut() {
            label.parents.remove(id);
        }
        Ok(removed)
    }

    /// Transitive parents of `id` (not including `id`).
    pub fn ancestors(&self, id: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        if let Some(label) = self.labels.get(id) {
            queue.extend(label.parents.iter().map(String::as_str));
        }
        while let Some(current) = queue.pop_front() {
            if !seen.insert(current.to_string()) {
                continue;
            }
            if let Some(label) = self.labels.get(current) {
                queue.extend(label.parents.iter().map(String::as_str));
            }
        }
        seen
    }

    /// Transitive children of `id` (not including `id`).
    pub fn descendants(&self, id: &str) -> BTreeSet<String> {
        let mut children: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for label in self.labels.values() {
            for parent in &label.parents {
                children.entry(parent.as_str()).or_default().push(label.id.as_str());
            }
        }
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<&str> = children.get(id).into_iter().flatten().copied().collect();
        while let Some(current) = queue.pop_front() {
            if !seen.insert(current.to_string()) {
                continue;
            }
            queue.extend(children.get(current).into_iter().flatten().copied());
        }
        seen
    }

    /// Resolve an id or any declared display name (names compare
    /// case-insensitively).
    pub fn resolve_by_name(&self, name: &str) -> Option<&Label> {
        if let Some(label) = self.labels.get(name) {
            return Some(label);
        }
        let folded = name.to_lowercase();
        self.labels
            .values()
            .find(|label| label.names.iter().any(|n| n.to_lowercase() == folded))
    }

    /// Explicit labels only, in the shape `labels.toml` persists.
    pub fn to_file(&self) -> LabelsFile {
        let labels = self
            .labels
            .values()
            .filter(|l| !l.is_implicit)
            .map(|l| {
                (
                    l.id.clone(),
                    LabelEntry {
                        names: l.names.clone(),
                        parents: l.parents.iter().cloned().collect(),
                    },
                )
            })
            .collect();
        LabelsFile { labels }
    }

    /// Repair pass for bulk rebuilds: while a cycle exists, remove the
    /// highest-ordered edge on it. Returns the removed edges. Only used
    /// when reloading externally edited state; interactive updates never
    /// need it.
    pub fn break_cycles(&mut self) -> Vec<(String, String)> {
        let mut removed = Vec::new();
        while let Some(cycle) = self.find_cycle() {
            // `cycle` is a list of (child, parent) edges; drop the
            // lexicographically greatest one for determinism.
            let Some((child, parent)) = cycle.into_iter().max() else {
                break;
            };
            warn!(child, parent, "breaking label cycle by removing edge");
            if let Some(label) = self.labels.get_mut(&child) {
                label.parents.remove(&parent);
            }
            removed.push((child, parent));
        }
        removed
    }

    /// If pointing `child` at `parents` would close a cycle, return one
    /// offending parent: a proposed parent from which `child` is already
    /// reachable via parent edges.
    fn first_cycle_edge(&self, child: &str, parents: &BTreeSet<String>) -> Option<String> {
        for parent in parents {
            let mut seen: BTreeSet<&str> = BTreeSet::new();
            let mut queue: VecDeque<&str> = VecDeque::new();
            queue.push_back(parent.as_str());
            while let Some(current) = queue.pop_front() {
                if current == child {
                    return Some(parent.clone());
                }
                if !seen.insert(current) {
                    continue;
                }
                if let Some(label) = self.labels.get(current) {
                    queue.extend(label.parents.iter().map(String::as_str));
                }
            }
        }
        None
    }

    /// Iterative DFS over parent edges; returns the edge list of one cycle
    /// if any exists.
    fn find_cycle(&self) -> Option<Vec<(String, String)>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }
        let mut color: BTreeMap<&str, Color> =
            self.labels.keys().map(|k| (k.as_str(), Color::White)).collect();

        let parents_of = |id: &str| -> Vec<&str> {
            self.labels
                .get(id)
                .map(|l| l.parents.iter().map(String::as_str).collect())
                .unwrap_or_default()
        };

        for start in self.labels.keys() {
            if color[start.as_str()] != Color::White {
                continue;
            }
            // Explicit stack of (node, parents not yet visited); the node
            // column is the gray chain root..current.
            let mut stack: Vec<(&str, Vec<&str>)> = Vec::new();
            color.insert(start.as_str(), Color::Gray);
            stack.push((start.as_str(), parents_of(start)));

            loop {
                let Some((_, pending)) = stack.last_mut() else {
                    break;
                };
                let Some(next) = pending.pop() else {
                    if let Some((node, _)) = stack.pop() {
                        color.insert(node, Color::Black);
                    }
                    continue;
                };
                match color.get(next).copied().unwrap_or(Color::Black) {
                    Color::Gray => {
                        // Back edge closes a cycle: the stack frames from
                        // `next` to the top, plus the back edge itself.
                        let frames: Vec<&str> = stack.iter().map(|(n, _)| *n).collect();
                        let from = frames.iter().position(|n| *n == next).unwrap_or(0);
                        let mut edges: Vec<(String, String)> = frames[from..]
                            .windows(2)
                            .map(|w| (w[0].to_string(), w[1].to_string()))
                            .collect();
                        let top = frames.last().copied().unwrap_or(next);
                        edges.push((top.to_string(), next.to_string()));
                        return Some(edges);
                    }
                    Color::White => {
                        color.insert(next, Color::Gray);
                        stack.push((next, parents_of(next)));
                    }
                    Color::Black => {}
                }
            }
        }
        None
    }
}

/// Implicit labels contributed by a post's directory segments:
/// `posts/tech/swe/x.md` ⇒ `{tech, swe}`. Segments that do not form a
/// valid label id after lowercasing are skipped.
pub fn path_implicit_labels(rel_path: &str) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    let Some(rest) = rel_path.strip_prefix("posts/") else {
        return out;
    };
    let mut segments: Vec<&str> = rest.split('/').collect();
    // Last segment is the file name.
    segments.pop();
    for segment in segments {
        let id = segment.to_lowercase();
        if is_valid_label_id(&id) {
            out.insert(id);
        }
    }
    out
}
