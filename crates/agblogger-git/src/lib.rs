//! Git operations for the content directory.
//!
//! The content tree doubles as a git working tree: every content mutation
//! is followed by a commit, and the history supplies merge bases for the
//! sync engine. Everything shells out to `git` with captured output; the
//! server forces its own author identity per invocation so no global git
//! configuration is needed.
//!
//! # Example
//!
//! ```no_run
//! use agblogger_git::GitRepo;
//! use std::path::Path;
//!
//! let repo = GitRepo::new(Path::new("content"));
//! repo.init_if_absent().expect("init");
//! let head = repo.commit_all("edit: posts/a.md").expect("commit");
//! println!("HEAD is now {head:?}");
//! ```

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use tracing::debug;

/// Identity used for server-side commits.
const COMMIT_AUTHOR_NAME: &str = "agblogger";
const COMMIT_AUTHOR_EMAIL: &str = "agblogger@localhost";

static COMMIT_REF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^[0-9a-f]{4,40}$").expect("static regex"));

/// Whether a client-supplied commit id is safe to pass as a subprocess
/// argument.
pub fn is_valid_commit_ref(value: &str) -> bool {
    COMMIT_REF_RE.is_match(value)
}

/// Result of a three-way merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Merged text; contains conflict markers when `conflicted`.
    pub merged: String,
    pub conflicted: bool,
}

/// Handle on the content repository's working tree.
#[derive(Debug, Clone)]
pub struct GitRepo {
    workdir: PathBuf,
}

impl GitRepo {
    pub fn new(workdir: &Path) -> Self {
        Self { workdir: workdir.to_path_buf() }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Initialize the repository if the directory is not one already.
    pub fn init_if_absent(&self) -> Result<()> {
        if self.is_repo() {
            return Ok(());
        }
        let output = self.git(&["init"])?;
        if !output.status.success() {
            anyhow::bail!("git init failed: {}", String::from_utf8_lossy(&output.stderr));
        }
        debug!(workdir = %self.workdir.display(), "initialized content repository");
        Ok(())
    }

    /// Whether the directory is inside a git working tree.
    pub fn is_repo(&self) -> bool {
        self.git(&["rev-parse", "--is-inside-work-tree"])
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    /// Current HEAD commit, or `None` on an empty repository.
    pub fn head_commit(&self) -> Result<Option<String>> {
        let output = self.git(&["rev-parse", "HEAD"])?;
        if !output.status.success() {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&output.stdout).trim().to_string()))
    }

    /// Stage everything and commit. "Nothing to commit" is success; the
    /// returned value is the HEAD after the call (None only for an empty
    /// repository with nothing staged).
    pub fn commit_all(&self, message: &str) -> Result<Option<String>> {
        let add = self.git(&["add", "-A"])?;
        if !add.status.success() {
            anyhow::bail!("git add failed: {}", String::from_utf8_lossy(&add.stderr));
        }
        let commit = self.git(&[
            "-c",
            &format!("user.name={COMMIT_AUTHOR_NAME}"),
            "-c",
            &format!("user.email={COMMIT_AUTHOR_EMAIL}"),
            "commit",
            "-m",
            message,
        ])?;
        if !commit.status.success() {
            let stdout = String::from_utf8_lossy(&commit.stdout);
            let stderr = String::from_utf8_lossy(&commit.stderr);
            let nothing_staged = stdout.contains("nothing to commit")
                || stdout.contains("nothing added to commit")
                || stderr.contains("nothing to commit");
            if !nothing_staged {
                anyhow::bail!("git commit failed: {stderr}");
            }
        }
        self.head_commit()
    }

    /// The text of `path` as of `commit`, or `None` when the blob does not
    /// exist there. The commit id must already be validated.
    pub fn blob_at_commit(&self, commit: &str, path: &str) -> Result<Option<String>> {
        if !is_valid_commit_ref(commit) {
            anyhow::bail!("invalid commit id: {commit:?}");
        }
        let spec = format!("{commit}:{path}");
        let output = self.git(&["show", &spec])?;
        if !output.status.success() {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&output.stdout).into_owned()))
    }

    fn git(&self, args: &[&str]) -> Result<std::process::Output> {
        Command::new("git")
            .arg("-C")
            .arg(&self.workdir)
            .args(args)
            .output()
            .with_context(|| format!("failed to run git {args:?}"))
    }
}

/// Three-way line-based merge of UTF-8 text via `git merge-file`.
///
/// The three inputs go to temporary files in the system temp directory,
/// never inside any working tree, so a concurrent `git add -A` cannot
/// stage them.
pub fn merge3(base: &str, ours: &str, theirs: &str) -> Result<MergeOutcome> {
    let write = |content: &str| -> Result<tempfile::NamedTempFile> {
        let mut file = tempfile::NamedTempFile::new().context("failed to create merge input")?;
        std::io::Write::write_all(&mut file, content.as_bytes())
            .context("failed to write merge input")?;
        Ok(file)
    };
    let ours_file = write(ours)?;
    let base_file = write(base)?;
    let theirs_file = write(theirs)?;

    let output = Command::new("git")
        .args(["merge-file", "-p", "-L", "ours", "-L", "base", "-L", "theirs"])
        .arg(ours_file.path())
        .arg(base_file.path())
        .arg(theirs_file.path())
        .output()
        .context("failed to run git merge-file")?;

    // merge-file exits 0 on a clean merge, with the number of conflicts
    // (capped at 127) when markers were written, and negative on error.
    let code = output.status.code().unwrap_or(-1);
    if !(0..=127).contains(&code) {
        anyhow::bail!("git merge-file failed: {}", String::from_utf8_lossy(&output.stderr));
    }
    let merged = String::from_utf8(output.stdout).context("merge produced non-UTF-8 output")?;
    Ok(MergeOutcome { merged, conflicted: code != 0 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn repo(dir: &Path) -> GitRepo {
        let repo = GitRepo::new(dir);
        repo.init_if_absent().expect("init");
        repo
    }

    #[test]
    fn init_is_idempotent() {
        let td = tempdir().expect("tempdir");
        let r = repo(td.path());
        assert!(r.is_repo());
        r.init_if_absent().expect("second init");
    }

    #[test]
    fn head_commit_none_on_empty_repo() {
        let td = tempdir().expect("tempdir");
        let r = repo(td.path());
        assert_eq!(r.head_commit().expect("head"), None);
    }

    #[test]
    fn commit_all_advances_head() {
        let td = tempdir().expect("tempdir");
        let r = repo(td.path());
        fs::write(td.path().join("a.md"), "# A\n").expect("write");

        let first = r.commit_all("add a.md").expect("commit").expect("head");
        assert_eq!(first.len(), 40);

        fs::write(td.path().join("a.md"), "# A changed\n").expect("rewrite");
        let second = r.commit_all("edit a.md").expect("commit").expect("head");
        assert_ne!(first, second);
    }

    #[test]
    fn commit_with_nothing_staged_keeps_head() {
        let td = tempdir().expect("tempdir");
        let r = repo(td.path());
        fs::write(td.path().join("a.md"), "x").expect("write");
        let head = r.commit_all("add").expect("commit");

        let unchanged = r.commit_all("no-op").expect("no-op commit");
        assert_eq!(head, unchanged);
    }

    #[test]
    fn blob_at_commit_reads_old_version() {
        let td = tempdir().expect("tempdir");
        let r = repo(td.path());
        fs::write(td.path().join("a.md"), "version one\n").expect("write");
        let first = r.commit_all("v1").expect("commit").expect("head");
        fs::write(td.path().join("a.md"), "version two\n").expect("rewrite");
        r.commit_all("v2").expect("commit");

        let blob = r.blob_at_commit(&first, "a.md").expect("show");
        assert_eq!(blob.as_deref(), Some("version one\n"));
        assert_eq!(r.blob_at_commit(&first, "missing.md").expect("show"), None);
    }

    #[test]
    fn blob_at_commit_rejects_bad_refs() {
        let td = tempdir().expect("tempdir");
        let r = repo(td.path());
        assert!(r.blob_at_commit("HEAD", "a.md").is_err());
        assert!(r.blob_at_commit("--exec=x", "a.md").is_err());
        assert!(r.blob_at_commit("abC123", "a.md").is_err());
    }

    #[test]
    fn commit_ref_pattern() {
        assert!(is_valid_commit_ref("abcd"));
        assert!(is_valid_commit_ref(&"a".repeat(40)));
        assert!(!is_valid_commit_ref("abc"));
        assert!(!is_valid_commit_ref(&"a".repeat(41)));
        assert!(!is_valid_commit_ref("ABCD"));
        assert!(!is_valid_commit_ref("main"));
    }

    #[test]
    fn merge3_clean() {
        let base = "L1\nL2\nL3\n";
        let ours = "L1a\nL2\nL3\n";
        let theirs = "L1\nL2\nL3b\n";
        let outcome = merge3(base, ours, theirs).expect("merge");
        assert!(!outcome.conflicted);
        assert_eq!(outcome.merged, "L1a\nL2\nL3b\n");
    }

    #[test]
    fn merge3_conflicting() {
        let base = "L1\nL2\nL3\n";
        let ours = "L1\nclient\nL3\n";
        let theirs = "L1\nserver\nL3\n";
        let outcome = merge3(base, ours, theirs).expect("merge");
        assert!(outcome.conflicted);
        assert!(outcome.merged.contains("<<<<<<<"));
        assert!(outcome.merged.contains(">>>>>>>"));
        assert!(outcome.merged.contains("client"));
        assert!(outcome.merged.contains("server"));
    }

    #[test]
    fn merge3_identical_sides() {
        let outcome = merge3("a\n", "b\n", "b\n").expect("merge");
        assert!(!outcome.conflicted);
        assert_eq!(outcome.merged, "b\n");
    }
}
