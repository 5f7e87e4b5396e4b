#![allow(dead_code)]

use std::path::Path;
use std::process::Command;

pub fn run_git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "git {:?} in {} failed: {}",
        args,
        dir.display(),
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).to_string()
}

/// A repo on `main` with one committed source file.
pub fn setup_git_repo() -> tempfile::TempDir {
    let repo_dir = tempfile::TempDir::new().unwrap();
    let repo = repo_dir.path();
    run_git(repo, &["init"]);
    run_git(repo, &["config", "user.email", "test@test.com"]);
    run_git(repo, &["config", "user.name", "Test"]);
    write_file(repo, "src/lib.rs", "pub fn one() -> u32 {\n    1\n}\n");
    run_git(repo, &["add", "."]);
    run_git(repo, &["commit", "-m", "init"]);
    run_git(repo, &["branch", "-M", "main"]);
    repo_dir
}

/// Check out a feature branch and commit `files` on it.
pub fn commit_on_branch(repo: &Path, branch: &str, files: &[(&str, &str)]) {
    run_git(repo, &["checkout", "-B", branch]);
    for (path, content) in files {
        write_file(repo, path, content);
    }
    run_git(repo, &["add", "."]);
    run_git(repo, &["commit", "-m", &format!("change on {branch}")]);
}

pub fn write_file(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, content).unwrap();
}
