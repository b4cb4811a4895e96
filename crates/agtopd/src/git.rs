//! Git subprocess helpers.
//!
//! Every invocation sets an explicit working directory; nothing relies on
//! the process cwd. Non-interactive rebase continuation passes
//! `GIT_EDITOR=true` so git never opens an editor for commit messages.

use std::path::Path;
use std::process::Command;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("git {args} failed: {stderr}")]
    CommandFailed { args: String, stderr: String },
    #[error("failed to execute git: {0}")]
    Execution(#[from] std::io::Error),
    #[error("invalid utf-8 in git output")]
    InvalidUtf8,
}

pub type Result<T> = std::result::Result<T, GitError>;

/// Raw output of a git command that is allowed to fail.
#[derive(Debug, Clone)]
pub struct GitOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    /// Combined stdout + stderr, for conflict reports.
    pub fn combined(&self) -> String {
        let mut out = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(&self.stderr);
        }
        out
    }
}

/// Run git and return its output without treating failure as an error.
pub fn git_raw(dir: &Path, args: &[&str]) -> Result<GitOutput> {
    git_raw_env(dir, args, &[])
}

/// Like [`git_raw`] with extra environment variables.
pub fn git_raw_env(dir: &Path, args: &[&str], env: &[(&str, &str)]) -> Result<GitOutput> {
    let mut cmd = Command::new("git");
    cmd.args(args).current_dir(dir);
    for (key, value) in env {
        cmd.env(key, value);
    }
    let output = cmd.output()?;
    Ok(GitOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Run git and fail on non-zero exit.
pub fn git(dir: &Path, args: &[&str]) -> Result<String> {
    let out = git_raw(dir, args)?;
    if !out.success {
        return Err(GitError::CommandFailed {
            args: args.join(" "),
            stderr: out.stderr.trim().to_string(),
        });
    }
    Ok(out.stdout)
}

/// Detect the default branch: `origin/HEAD` first, then `main`/`master`.
pub fn detect_default_branch(repo: &Path) -> Result<String> {
    let out = git_raw(repo, &["symbolic-ref", "refs/remotes/origin/HEAD"])?;
    if out.success {
        let full_ref = out.stdout.trim();
        if let Some(branch) = full_ref.strip_prefix("refs/remotes/origin/") {
            return Ok(branch.to_string());
        }
    }

    for candidate in ["main", "master"] {
        let check = git_raw(repo, &["rev-parse", "--verify", &format!("refs/heads/{candidate}")])?;
        if check.success {
            return Ok(candidate.to_string());
        }
    }

    Ok("main".to_string())
}

pub fn branch_exists(repo: &Path, branch: &str) -> Result<bool> {
    let out = git_raw(repo, &["rev-parse", "--verify", &format!("refs/heads/{branch}")])?;
    Ok(out.success)
}

/// Create a branch from a base without checking it out.
pub fn create_branch(repo: &Path, branch: &str, base: &str) -> Result<()> {
    git(repo, &["branch", branch, base]).map(|_| ())
}

/// Delete a branch, tolerating "already gone".
pub fn delete_branch_idempotent(repo: &Path, branch: &str) -> Result<()> {
    let out = git_raw(repo, &["branch", "-D", branch])?;
    if !out.success && !out.stderr.contains("not found") {
        return Err(GitError::CommandFailed {
            args: format!("branch -D {branch}"),
            stderr: out.stderr.trim().to_string(),
        });
    }
    Ok(())
}

/// Create a worktree for `branch` (creating the branch from HEAD when it
/// does not exist yet).
pub fn add_worktree(repo: &Path, worktree_path: &Path, branch: &str) -> Result<()> {
    if let Some(parent) = worktree_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if !branch_exists(repo, branch)? {
        create_branch(repo, branch, "HEAD")?;
    }
    git(
        repo,
        &[
            "worktree",
            "add",
            worktree_path.to_string_lossy().as_ref(),
            branch,
        ],
    )
    .map(|_| ())
}

/// Remove a worktree, tolerating "already gone".
pub fn remove_worktree_idempotent(repo: &Path, worktree_path: &Path) -> Result<()> {
    let out = git_raw(
        repo,
        &[
            "worktree",
            "remove",
            "--force",
            worktree_path.to_string_lossy().as_ref(),
        ],
    )?;
    if !out.success
        && !out.stderr.contains("is not a working tree")
        && !out.stderr.contains("No such file")
    {
        return Err(GitError::CommandFailed {
            args: "worktree remove".to_string(),
            stderr: out.stderr.trim().to_string(),
        });
    }
    // Drop stale administrative entries either way.
    let _ = git_raw(repo, &["worktree", "prune"]);
    Ok(())
}

/// One entry from `git worktree list --porcelain`.
#[derive(Debug, Clone)]
pub struct WorktreeEntry {
    pub path: String,
    pub branch: Option<String>,
}

pub fn list_worktrees(repo: &Path) -> Result<Vec<WorktreeEntry>> {
    let stdout = git(repo, &["worktree", "list", "--porcelain"])?;
    let mut entries = Vec::new();
    let mut current: Option<WorktreeEntry> = None;
    for line in stdout.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            if let Some(entry) = current.take() {
                entries.push(entry);
            }
            current = Some(WorktreeEntry {
                path: path.to_string(),
                branch: None,
            });
        } else if let Some(branch) = line.strip_prefix("branch refs/heads/") {
            if let Some(entry) = current.as_mut() {
                entry.branch = Some(branch.to_string());
            }
        }
    }
    if let Some(entry) = current {
        entries.push(entry);
    }
    Ok(entries)
}

/// Paths with unresolved conflicts (`--diff-filter=U`).
pub fn conflicted_files(dir: &Path) -> Result<Vec<String>> {
    let stdout = git(dir, &["diff", "--name-only", "--diff-filter=U"])?;
    Ok(stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect())
}

pub fn is_dirty(dir: &Path) -> Result<bool> {
    let stdout = git(dir, &["status", "--porcelain"])?;
    Ok(!stdout.trim().is_empty())
}

/// True when any changes are staged.
pub fn has_staged_changes(dir: &Path) -> Result<bool> {
    let out = git_raw(dir, &["diff", "--cached", "--quiet"])?;
    Ok(!out.success)
}

pub fn stash_push(dir: &Path) -> Result<()> {
    git(dir, &["stash", "push", "--include-untracked"]).map(|_| ())
}

pub fn stash_pop(dir: &Path) -> Result<GitOutput> {
    git_raw(dir, &["stash", "pop"])
}

pub fn stash_drop(dir: &Path) -> Result<()> {
    git(dir, &["stash", "drop"]).map(|_| ())
}

pub fn checkout_theirs(dir: &Path, path: &str) -> Result<()> {
    git(dir, &["checkout", "--theirs", "--", path]).map(|_| ())
}

pub fn add(dir: &Path, path: &str) -> Result<()> {
    git(dir, &["add", "--", path]).map(|_| ())
}

pub fn add_all(dir: &Path) -> Result<()> {
    git(dir, &["add", "-A"]).map(|_| ())
}

pub fn commit_no_edit(dir: &Path) -> Result<()> {
    git(dir, &["commit", "--no-edit"]).map(|_| ())
}

pub fn merge(dir: &Path, branch: &str) -> Result<GitOutput> {
    git_raw(dir, &["merge", branch, "--no-edit"])
}

pub fn merge_abort(dir: &Path) {
    let _ = git_raw(dir, &["merge", "--abort"]);
}

pub fn rebase(dir: &Path, onto: &str) -> Result<GitOutput> {
    git_raw_env(dir, &["rebase", onto], &[("GIT_EDITOR", "true")])
}

pub fn rebase_continue(dir: &Path) -> Result<GitOutput> {
    git_raw_env(dir, &["rebase", "--continue"], &[("GIT_EDITOR", "true")])
}

pub fn rebase_abort(dir: &Path) {
    let _ = git_raw(dir, &["rebase", "--abort"]);
}

pub fn fetch(dir: &Path, remote: &str, branch: &str) -> Result<()> {
    git(dir, &["fetch", remote, branch]).map(|_| ())
}

pub fn push_force_with_lease(dir: &Path, branch: &str) -> Result<()> {
    git(dir, &["push", "origin", branch, "--force-with-lease"]).map(|_| ())
}

pub fn reset_hard(dir: &Path, target: &str) -> Result<()> {
    git(dir, &["reset", "--hard", target]).map(|_| ())
}

/// Restore the working tree from HEAD, discarding local edits.
pub fn checkout_head_all(dir: &Path) -> Result<()> {
    git(dir, &["checkout", "HEAD", "--", "."]).map(|_| ())
}


#[cfg(test)]
mod tests {
    use super::testutil::{commit_file, init_repo, run};
    use super::*;

    #[test]
    fn detect_default_branch_prefers_main() {
        let repo = init_repo();
        assert_eq!(detect_default_branch(repo.path()).unwrap(), "main");
    }

    #[test]
    fn branch_lifecycle() {
        let repo = init_repo();
        assert!(!branch_exists(repo.path(), "agtop/001").unwrap());
        create_branch(repo.path(), "agtop/001", "HEAD").unwrap();
        assert!(branch_exists(repo.path(), "agtop/001").unwrap());
        delete_branch_idempotent(repo.path(), "agtop/001").unwrap();
        assert!(!branch_exists(repo.path(), "agtop/001").unwrap());
        // Second delete is a no-op.
        delete_branch_idempotent(repo.path(), "agtop/001").unwrap();
    }

    #[test]
    fn worktree_add_list_remove() {
        let repo = init_repo();
        let wt = repo.path().join("wt/001");
        add_worktree(repo.path(), &wt, "agtop/001").unwrap();
        assert!(wt.join("README.md").exists());

        let entries = list_worktrees(repo.path()).unwrap();
        assert!(entries
            .iter()
            .any(|e| e.branch.as_deref() == Some("agtop/001")));

        remove_worktree_idempotent(repo.path(), &wt).unwrap();
        assert!(!wt.exists());
        remove_worktree_idempotent(repo.path(), &wt).unwrap();
    }

    #[test]
    fn dirty_and_staged_detection() {
        let repo = init_repo();
        assert!(!is_dirty(repo.path()).unwrap());
        std::fs::write(repo.path().join("x.txt"), "x").unwrap();
        assert!(is_dirty(repo.path()).unwrap());
        assert!(!has_staged_changes(repo.path()).unwrap());
        run(repo.path(), &["add", "x.txt"]);
        assert!(has_staged_changes(repo.path()).unwrap());
    }

    #[test]
    fn conflicted_files_lists_unmerged_paths() {
        let repo = init_repo();
        commit_file(repo.path(), "a.txt", "base\n", "base");
        run(repo.path(), &["checkout", "-b", "other"]);
        commit_file(repo.path(), "a.txt", "theirs\n", "theirs");
        run(repo.path(), &["checkout", "main"]);
        commit_file(repo.path(), "a.txt", "ours\n", "ours");

        let out = merge(repo.path(), "other").unwrap();
        assert!(!out.success);
        let conflicts = conflicted_files(repo.path()).unwrap();
        assert_eq!(conflicts, vec!["a.txt"]);
        merge_abort(repo.path());
        assert!(conflicted_files(repo.path()).unwrap().is_empty());
    }

    #[test]
    fn rebase_moves_branch_forward() {
        let repo = init_repo();
        run(repo.path(), &["checkout", "-b", "feature"]);
        commit_file(repo.path(), "feature.txt", "f\n", "feature work");
        run(repo.path(), &["checkout", "main"]);
        commit_file(repo.path(), "main.txt", "m\n", "main work");
        run(repo.path(), &["checkout", "feature"]);

        let out = rebase(repo.path(), "main").unwrap();
        assert!(out.success, "rebase failed: {}", out.stderr);
        assert!(repo.path().join("main.txt").exists());
        assert!(repo.path().join("feature.txt").exists());
    }
}
