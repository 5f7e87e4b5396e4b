use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::Command;
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, info, warn};

use crate::coverage::ChangeSet;
use crate::error::{Error, Result};

/// Base refs tried, in order, when none is configured.
pub const BASE_REF_CANDIDATES: &[&str] = &["origin/main", "origin/master", "main", "master"];

const UNMERGED_CODES: &[&str] = &["UU", "AA", "DD", "AU", "UA", "DU", "UD"];

static HUNK_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^@@ -\d+(?:,\d+)? \+(\d+)(?:,(\d+))? @@").expect("hunk header regex is valid")
});

/// Produces the set of changed lines between two refs.
pub trait DiffScopeProvider {
    fn changed_lines(&self, base_ref: &str, head_ref: &str) -> Result<ChangeSet>;
}

/// Reject refs that could be read as options or that git would not accept
/// as a plain revision.
pub fn validate_ref(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::Vcs("ref must not be empty".to_string()));
    }
    if name.starts_with('-') {
        return Err(Error::Vcs(format!("ref must not start with '-': {name}")));
    }
    if name.contains("..") {
        return Err(Error::Vcs(format!("ref must not contain '..': {name}")));
    }
    if !name.chars().all(|c| {
        c.is_ascii_alphanumeric() || matches!(c, '/' | '_' | '.' | '-' | '~' | '^' | '@')
    }) {
        return Err(Error::Vcs(format!(
            "ref contains invalid characters (allowed: a-zA-Z0-9/_.-~^@): {name}"
        )));
    }
    Ok(())
}

/// Diff scope read from a local git repository.
pub struct GitDiffProvider {
    repo_root: PathBuf,
    include_extensions: Vec<String>,
}

impl GitDiffProvider {
    pub fn new(repo_root: PathBuf, include_extensions: Vec<String>) -> Self {
        Self {
            repo_root,
            include_extensions,
        }
    }

    /// First candidate in [`BASE_REF_CANDIDATES`] that resolves.
    pub fn detect_base_ref(&self) -> Result<String> {
        for candidate in BASE_REF_CANDIDATES {
            if self.resolve(candidate).is_ok() {
                debug!(base = candidate, "detected base ref");
                return Ok(candidate.to_string());
            }
        }
        Err(Error::Vcs(format!(
            "could not detect a base ref (tried {}); pass --base",
            BASE_REF_CANDIDATES.join(", ")
        )))
    }

    /// Resolve a ref to a commit sha.
    pub fn resolve(&self, name: &str) -> Result<String> {
        validate_ref(name)?;
        let spec = format!("{name}^{{commit}}");
        self.git(&["rev-parse", "--verify", "--quiet", &spec])
            .map(|sha| sha.trim().to_string())
            .map_err(|e| Error::Vcs(format!("invalid ref '{name}': {}", e.trim())))
    }

    pub fn repo_root(&self) -> &PathBuf {
        &self.repo_root
    }

    fn check_working_tree(&self) -> Result<()> {
        let status = self
            .git(&["status", "--porcelain"])
            .map_err(|e| Error::Vcs(format!("git status failed: {}", e.trim())))?;

        let unmerged: Vec<&str> = status
            .lines()
            .filter(|line| line.len() >= 3 && UNMERGED_CODES.contains(&&line[..2]))
            .map(|line| line[3..].trim())
            .collect();
        if !unmerged.is_empty() {
            return Err(Error::Vcs(format!(
                "working tree has unmerged paths: {}",
                unmerged.join(", ")
            )));
        }

        let dirty = status.lines().filter(|l| !l.trim().is_empty()).count();
        if dirty > 0 {
            warn!(
                files = dirty,
                "working tree has local modifications; they are not part of the diff"
            );
        }
        Ok(())
    }

    fn git(&self, args: &[&str]) -> std::result::Result<String, String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.repo_root)
            .output()
            .map_err(|e| format!("failed to run git: {e}"))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            Err(String::from_utf8_lossy(&output.stderr).to_string())
        }
    }
}

impl DiffScopeProvider for GitDiffProvider {
    fn changed_lines(&self, base_ref: &str, head_ref: &str) -> Result<ChangeSet> {
        self.check_working_tree()?;
        let base = self.resolve(base_ref)?;
        let head = self.resolve(head_ref)?;

        let range = format!("{base}...{head}");
        let diff = self
            .git(&[
                "diff",
                "--unified=0",
                "--no-color",
                "--no-ext-diff",
                &range,
            ])
            .map_err(|e| Error::Vcs(format!("git diff {range} failed: {}", e.trim())))?;

        let change_set = parse_unified_diff(&diff).retain_extensions(&self.include_extensions);
        info!(
            base = base_ref,
            head = head_ref,
            files = change_set.files().len(),
            lines = change_set.total_lines(),
            "computed change set"
        );
        Ok(change_set)
    }
}

/// Added and modified line numbers (new side) per file from a zero-context
/// unified diff. Deleted files and pure deletions contribute nothing.
pub fn parse_unified_diff(diff: &str) -> ChangeSet {
    let mut entries: Vec<(String, BTreeSet<u32>)> = Vec::new();
    let mut current: Option<usize> = None;

    for line in diff.lines() {
        if line.starts_with("diff --git ") {
            current = None;
        } else if let Some(target) = line.strip_prefix("+++ ") {
            let target = target.trim().trim_matches('"');
            current = if target == "/dev/null" {
                None
            } else {
                let path = target.strip_prefix("b/").unwrap_or(target).to_string();
                entries.push((path, BTreeSet::new()));
                Some(entries.len() - 1)
            };
        } else if let Some(idx) = current
            && let Some(caps) = HUNK_HEADER.captures(line)
        {
            let start: u32 = caps[1].parse().unwrap_or(0);
            let count: u32 = caps
                .get(2)
                .and_then(|m| m.as_str().parse().ok())
                .unwrap_or(1);
            entries[idx].1.extend(start..start.saturating_add(count));
        }
    }

    ChangeSet::new(entries)
}
