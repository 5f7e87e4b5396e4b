use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::process::Command;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Check that `path` is relative and stays inside the directory it is
/// joined to.
pub fn validate_relative_path(path: &str) -> Result<()> {
    if path.trim().is_empty() {
        return Err(Error::Sandbox("path must not be empty".to_string()));
    }
    let p = Path::new(path);
    if p.is_absolute() {
        return Err(Error::Sandbox(format!("path must be relative: {path}")));
    }
    for component in p.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => {
                return Err(Error::Sandbox(format!(
                    "path must not leave the working copy: {path}"
                )));
            }
        }
    }
    Ok(())
}

/// Original contents of every file written through the sandbox. `None`
/// means the file did not exist.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxJournal {
    originals: BTreeMap<String, Option<String>>,
    iteration: BTreeMap<String, Option<String>>,
}

impl SandboxJournal {
    pub fn touched_files(&self) -> Vec<String> {
        self.originals.keys().cloned().collect()
    }
}

/// The private working copy the controller mutates. Every write is
/// journaled so an iteration, or the whole session, can be undone.
#[derive(Debug)]
pub struct Sandbox {
    root: PathBuf,
    journal: SandboxJournal,
}

impl Sandbox {
    pub fn open(root: PathBuf) -> Self {
        Self::with_journal(root, SandboxJournal::default())
    }

    /// Reattach to a sandbox whose journal was persisted earlier.
    pub fn with_journal(root: PathBuf, journal: SandboxJournal) -> Self {
        Self { root, journal }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn journal(&self) -> &SandboxJournal {
        &self.journal
    }

    fn resolve(&self, rel: &str) -> Result<PathBuf> {
        validate_relative_path(rel)?;
        Ok(self.root.join(rel))
    }

    pub fn read_file(&self, rel: &str) -> Result<Option<String>> {
        let path = self.resolve(rel)?;
        if !path.exists() {
            return Ok(None);
        }
        std::fs::read_to_string(&path)
            .map(Some)
            .map_err(|e| Error::Sandbox(format!("failed to read {}: {e}", path.display())))
    }

    pub fn write_file(&mut self, rel: &str, content: &str) -> Result<()> {
        let path = self.resolve(rel)?;
        let previous = self.read_file(rel)?;
        self.journal
            .originals
            .entry(rel.to_string())
            .or_insert_with(|| previous.clone());
        self.journal
            .iteration
            .entry(rel.to_string())
            .or_insert(previous);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::Sandbox(format!("failed to create {}: {e}", parent.display()))
            })?;
        }
        std::fs::write(&path, content)
            .map_err(|e| Error::Sandbox(format!("failed to write {}: {e}", path.display())))?;
        debug!(file = rel, bytes = content.len(), "wrote sandbox file");
        Ok(())
    }

    /// Start journaling a new iteration; earlier writes become permanent
    /// for [`Sandbox::rollback_iteration`].
    pub fn begin_iteration(&mut self) {
        self.journal.iteration.clear();
    }

    /// Undo every write since [`Sandbox::begin_iteration`]. Returns the
    /// restored files.
    pub fn rollback_iteration(&mut self) -> Result<Vec<String>> {
        let entries = std::mem::take(&mut self.journal.iteration);
        let mut restored = Vec::new();
        for (rel, original) in entries {
            self.restore(&rel, original.as_deref())?;
            if original.is_none() {
                self.journal.originals.remove(&rel);
            }
            restored.push(rel);
        }
        info!(files = restored.len(), "rolled back iteration changes");
        Ok(restored)
    }

    /// Undo every write made through this sandbox.
    pub fn discard(&mut self) -> Result<()> {
        let entries = std::mem::take(&mut self.journal.originals);
        self.journal.iteration.clear();
        for (rel, original) in &entries {
            self.restore(rel, original.as_deref())?;
        }
        info!(files = entries.len(), "discarded sandbox changes");
        Ok(())
    }

    fn restore(&self, rel: &str, original: Option<&str>) -> Result<()> {
        let path = self.resolve(rel)?;
        match original {
            Some(content) => std::fs::write(&path, content),
            None if path.exists() => std::fs::remove_file(&path),
            None => Ok(()),
        }
        .map_err(|e| Error::Sandbox(format!("failed to restore {}: {e}", path.display())))
    }

    /// Unified diff of every file written through the sandbox, relative to
    /// the checked-out commit. Requires the sandbox to be a git worktree.
    pub fn export_patch(&self) -> Result<String> {
        let files = self.journal.touched_files();
        if files.is_empty() {
            return Ok(String::new());
        }

        let mut add = vec!["add", "--intent-to-add", "--"];
        add.extend(files.iter().map(String::as_str));
        git(&self.root, &add).map_err(|e| Error::Sandbox(format!("git add failed: {e}")))?;

        let mut diff = vec!["diff", "--no-color", "--no-ext-diff", "--"];
        diff.extend(files.iter().map(String::as_str));
        git(&self.root, &diff).map_err(|e| Error::Sandbox(format!("git diff failed: {e}")))
    }
}

/// Creates and removes detached git worktrees that serve as sandboxes.
pub struct SandboxManager {
    repo_root: PathBuf,
    base_dir: PathBuf,
}

impl SandboxManager {
    pub fn new(repo_root: PathBuf, base_dir: PathBuf) -> Self {
        Self {
            repo_root,
            base_dir,
        }
    }

    pub fn sandbox_path(&self, session_id: &str) -> PathBuf {
        self.base_dir.join(format!("covloop-{session_id}"))
    }

    /// Check out `head_ref` into a fresh detached worktree for the session.
    pub fn create(&self, session_id: &str, head_ref: &str) -> Result<Sandbox> {
        crate::diff::validate_ref(head_ref)?;
        std::fs::create_dir_all(&self.base_dir).map_err(|e| {
            Error::Sandbox(format!(
                "failed to create sandbox dir {}: {e}",
                self.base_dir.display()
            ))
        })?;

        let path = self.sandbox_path(session_id);
        if path.exists() {
            debug!(path = %path.display(), "removing stale sandbox");
            let _ = git(
                &self.repo_root,
                &["worktree", "remove", "--force", &path.to_string_lossy()],
            );
        }
        let _ = git(&self.repo_root, &["worktree", "prune"]);

        git(
            &self.repo_root,
            &[
                "worktree",
                "add",
                "--detach",
                &path.to_string_lossy(),
                head_ref,
            ],
        )
        .map_err(|e| {
            Error::Sandbox(format!(
                "git worktree add failed for {}: {}",
                path.display(),
                e.trim()
            ))
        })?;

        // resolve symlinks so coverage paths match (/var -> /private/var on macOS)
        let canonical = path.canonicalize().unwrap_or(path);
        info!(path = %canonical.display(), head = head_ref, "created sandbox");
        Ok(Sandbox::open(canonical))
    }

    pub fn remove(&self, path: &Path) -> Result<()> {
        let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        let _ = git(&self.repo_root, &["worktree", "prune"]);
        match git(
            &self.repo_root,
            &["worktree", "remove", "--force", &path.to_string_lossy()],
        ) {
            Ok(_) => {
                info!(path = %path.display(), "removed sandbox");
                Ok(())
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e.trim(), "failed to remove sandbox");
                Err(Error::Sandbox(format!(
                    "failed to remove sandbox {}: {}",
                    path.display(),
                    e.trim()
                )))
            }
        }
    }
}

fn git(dir: &Path, args: &[&str]) -> std::result::Result<String, String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .map_err(|e| format!("failed to run git: {e}"))?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    } else {
        Err(String::from_utf8_lossy(&output.stderr).to_string())
    }
}
