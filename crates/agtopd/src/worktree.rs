//! Worktree lifecycle and merge-with-golden-resolution.
//!
//! Single-repo runs get one worktree under the configured base; multi-repo
//! projects get a composite directory mirroring the project layout, one
//! worktree per sub-repo, all on the same branch. Merging a run back into
//! the main repo rebases first, stashes dirty target state, and
//! auto-resolves golden-file conflicts by taking the incoming side.

use crate::git::{self, GitError};
use agtop_core::config::Config;
use agtop_core::types::{branch_for_run, Run, SubWorktree};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error(transparent)]
    Git(#[from] GitError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("merge conflict on {branch}: {files:?}")]
    MergeConflict {
        branch: String,
        files: Vec<String>,
        output: String,
    },
}

pub type Result<T> = std::result::Result<T, WorktreeError>;

/// Outcome of a successful merge.
#[derive(Debug, Clone, Default)]
pub struct MergeResult {
    /// Golden files that were auto-resolved during rebase or merge.
    pub golden_files_resolved: Vec<String>,
}

/// A path is golden iff it ends in `.golden` and lives under a
/// `testdata/` directory. Golden files are opaque snapshots; the
/// incoming side always wins.
pub fn is_golden_file(path: &str) -> bool {
    path.ends_with(".golden") && (path.contains("/testdata/") || path.starts_with("testdata/"))
}

/// One repository participating in a run.
#[derive(Debug, Clone)]
struct RepoTarget {
    /// Empty in single-repo mode.
    name: String,
    root: PathBuf,
    /// Path relative to the project root; empty in single-repo mode.
    rel: PathBuf,
}

/// Everything created for a run's working copy.
#[derive(Debug, Clone)]
pub struct CreatedWorktree {
    pub path: PathBuf,
    pub branch: String,
    pub sub_worktrees: Vec<SubWorktree>,
}

/// Manages worktree creation, removal, and merge-back. A single mutex
/// serializes all git orchestration, reads included.
#[derive(Debug)]
pub struct WorktreeManager {
    config: Arc<Config>,
    lock: Mutex<()>,
}

impl WorktreeManager {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            lock: Mutex::new(()),
        }
    }

    fn repos(&self) -> Vec<RepoTarget> {
        let root = self.config.project_root();
        if self.config.multi_repo() {
            self.config
                .repos
                .iter()
                .map(|repo| RepoTarget {
                    name: repo.name.clone(),
                    root: root.join(&repo.path),
                    rel: repo.path.clone(),
                })
                .collect()
        } else {
            vec![RepoTarget {
                name: String::new(),
                root,
                rel: PathBuf::new(),
            }]
        }
    }

    /// Create the worktree(s) for a run: branch `agtop/<id>` rooted at
    /// each repo's current HEAD. In multi-repo mode a failure rolls back
    /// every sub-worktree created so far.
    pub fn create(&self, run_id: &str) -> Result<CreatedWorktree> {
        let _guard = self.lock.lock();
        let branch = branch_for_run(run_id);
        let base = self.config.worktree_base();
        let root_path = base.join(run_id);

        if !self.config.multi_repo() {
            let repos = self.repos();
            let repo = &repos[0];
            git::add_worktree(&repo.root, &root_path, &branch)?;
            info!(run_id, path = %root_path.display(), %branch, "worktree created");
            return Ok(CreatedWorktree {
                path: root_path,
                branch,
                sub_worktrees: Vec::new(),
            });
        }

        let mut created: Vec<(RepoTarget, PathBuf)> = Vec::new();
        for repo in self.repos() {
            let wt_path = root_path.join(&repo.rel);
            if let Err(e) = git::add_worktree(&repo.root, &wt_path, &branch) {
                // Roll back everything created so far.
                for (done, done_path) in &created {
                    let _ = git::remove_worktree_idempotent(&done.root, done_path);
                    let _ = git::delete_branch_idempotent(&done.root, &branch);
                }
                let _ = std::fs::remove_dir_all(&root_path);
                return Err(e.into());
            }
            created.push((repo, wt_path));
        }

        let sub_worktrees = created
            .iter()
            .map(|(repo, path)| SubWorktree {
                name: repo.name.clone(),
                path: path.clone(),
                repo_root: repo.root.clone(),
            })
            .collect();
        info!(run_id, path = %root_path.display(), %branch, repos = created.len(), "composite worktree created");
        Ok(CreatedWorktree {
            path: root_path,
            branch,
            sub_worktrees,
        })
    }

    /// Remove a run's worktree(s) and branch. Idempotent: already-gone
    /// worktrees and branches are not errors.
    pub fn remove(&self, run: &Run) -> Result<()> {
        let _guard = self.lock.lock();
        let branch = if run.branch.is_empty() {
            branch_for_run(&run.id)
        } else {
            run.branch.clone()
        };

        if run.sub_worktrees.is_empty() {
            let repos = self.repos();
            let repo = &repos[0];
            if !run.worktree.as_os_str().is_empty() {
                git::remove_worktree_idempotent(&repo.root, &run.worktree)?;
            }
            git::delete_branch_idempotent(&repo.root, &branch)?;
        } else {
            for sub in &run.sub_worktrees {
                git::remove_worktree_idempotent(&sub.repo_root, &sub.path)?;
                git::delete_branch_idempotent(&sub.repo_root, &branch)?;
            }
        }

        // Drop the (now empty) composite root.
        let composite = self.config.worktree_base().join(&run.id);
        let _ = std::fs::remove_dir_all(composite);
        Ok(())
    }

    /// List worktrees under the configured base. In multi-repo mode
    /// entries are deduplicated by branch.
    pub fn list(&self) -> Result<Vec<git::WorktreeEntry>> {
        let _guard = self.lock.lock();
        let base = self.config.worktree_base();
        let mut seen_branches = std::collections::HashSet::new();
        let mut entries = Vec::new();
        for repo in self.repos() {
            for entry in git::list_worktrees(&repo.root)? {
                if !Path::new(&entry.path).starts_with(&base) {
                    continue;
                }
                if let Some(branch) = &entry.branch {
                    if !seen_branches.insert(branch.clone()) {
                        continue;
                    }
                }
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    /// Whether the run's (composite) worktree root exists on disk.
    pub fn exists(&self, run_id: &str) -> bool {
        self.config.worktree_base().join(run_id).exists()
    }

    /// Merge a run's branch back into each repo's default branch.
    /// Already-merged repos are rolled back when a later repo fails.
    pub fn merge(&self, run: &Run) -> Result<MergeResult> {
        let _guard = self.lock.lock();
        let branch = &run.branch;

        if run.sub_worktrees.is_empty() {
            let repos = self.repos();
            let repo = &repos[0];
            return self.merge_one(&repo.root, &run.worktree, branch);
        }

        let mut result = MergeResult::default();
        let mut merged: Vec<PathBuf> = Vec::new();
        for sub in &run.sub_worktrees {
            match self.merge_one(&sub.repo_root, &sub.path, branch) {
                Ok(one) => {
                    result
                        .golden_files_resolved
                        .extend(one.golden_files_resolved);
                    merged.push(sub.repo_root.clone());
                }
                Err(e) => {
                    for done in &merged {
                        if let Err(undo) = git::reset_hard(done, "HEAD~1") {
                            warn!(repo = %done.display(), error = %undo, "failed to roll back merged repo");
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(result)
    }

    /// Merge one repo: rebase the worktree branch onto the default
    /// branch, stash dirty target state, merge, auto-resolve golden-only
    /// conflicts, and unstash on every exit path.
    fn merge_one(&self, repo_root: &Path, wt_dir: &Path, branch: &str) -> Result<MergeResult> {
        let target = git::detect_default_branch(repo_root)?;
        let mut golden_resolved = self.rebase_resolving_golden(wt_dir, &target, branch)?;

        let stashed = git::is_dirty(repo_root)?;
        if stashed {
            git::stash_push(repo_root)?;
        }

        let merge_out = match git::merge(repo_root, branch) {
            Ok(out) => out,
            Err(e) => {
                self.unstash(repo_root, stashed);
                return Err(e.into());
            }
        };

        if merge_out.success {
            if !golden_resolved.is_empty() {
                self.run_golden_update(repo_root);
            }
            self.unstash(repo_root, stashed);
            return Ok(MergeResult {
                golden_files_resolved: golden_resolved,
            });
        }

        let conflicts = match git::conflicted_files(repo_root) {
            Ok(conflicts) => conflicts,
            Err(e) => {
                git::merge_abort(repo_root);
                self.unstash(repo_root, stashed);
                return Err(e.into());
            }
        };
        let all_golden = !conflicts.is_empty() && conflicts.iter().all(|f| is_golden_file(f));

        if all_golden {
            for file in &conflicts {
                git::checkout_theirs(repo_root, file)?;
                git::add(repo_root, file)?;
            }
            git::commit_no_edit(repo_root)?;
            golden_resolved.extend(conflicts);
            self.run_golden_update(repo_root);
            self.unstash(repo_root, stashed);
            return Ok(MergeResult {
                golden_files_resolved: golden_resolved,
            });
        }

        git::merge_abort(repo_root);
        self.unstash(repo_root, stashed);
        Err(WorktreeError::MergeConflict {
            branch: branch.to_string(),
            files: conflicts,
            output: merge_out.combined(),
        })
    }

    /// Rebase the worktree branch onto the target, auto-resolving golden
    /// conflicts. Any non-golden conflict aborts the rebase.
    fn rebase_resolving_golden(
        &self,
        wt_dir: &Path,
        target: &str,
        branch: &str,
    ) -> Result<Vec<String>> {
        let first = git::rebase(wt_dir, target)?;
        if first.success {
            return Ok(Vec::new());
        }

        let mut resolved = Vec::new();
        loop {
            let conflicts = git::conflicted_files(wt_dir)?;
            let non_golden: Vec<String> = conflicts
                .iter()
                .filter(|f| !is_golden_file(f))
                .cloned()
                .collect();
            if !non_golden.is_empty() {
                git::rebase_abort(wt_dir);
                return Err(WorktreeError::MergeConflict {
                    branch: branch.to_string(),
                    files: non_golden,
                    output: first.combined(),
                });
            }
            if conflicts.is_empty() {
                // Rebase stopped without conflicts (e.g. empty commit);
                // there is nothing we can resolve.
                git::rebase_abort(wt_dir);
                return Err(WorktreeError::MergeConflict {
                    branch: branch.to_string(),
                    files: Vec::new(),
                    output: first.combined(),
                });
            }
            for file in &conflicts {
                git::checkout_theirs(wt_dir, file)?;
                git::add(wt_dir, file)?;
                resolved.push(file.clone());
            }
            let cont = git::rebase_continue(wt_dir)?;
            if cont.success {
                return Ok(resolved);
            }
        }
    }

    /// Pop the stash if one was pushed. A conflicting pop is resolved in
    /// favor of the merged content: restore from HEAD and drop the stash.
    fn unstash(&self, repo_root: &Path, stashed: bool) {
        if !stashed {
            return;
        }
        match git::stash_pop(repo_root) {
            Ok(out) if out.success => {}
            Ok(_) | Err(_) => {
                warn!(repo = %repo_root.display(), "stash pop conflicted; keeping merged content");
                let _ = git::checkout_head_all(repo_root);
                let _ = git::stash_drop(repo_root);
            }
        }
    }

    /// Re-generate golden files after auto-resolution, when configured.
    /// Best-effort: failures are logged, never fatal.
    pub(crate) fn run_golden_update(&self, repo_root: &Path) {
        let Some(command) = &self.config.merge.golden_update_command else {
            return;
        };
        info!(repo = %repo_root.display(), command, "running golden update command");
        let result = std::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(repo_root)
            .output();
        match result {
            Ok(out) if out.status.success() => {}
            Ok(out) => warn!(
                command,
                stderr = %String::from_utf8_lossy(&out.stderr),
                "golden update command failed"
            ),
            Err(e) => warn!(command, error = %e, "failed to run golden update command"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::testutil::{commit_file, init_repo_at};
    use tempfile::TempDir;

    fn config_for(root: &Path) -> Arc<Config> {
        let mut config = Config::default();
        config.project.root = root.to_path_buf();
        Arc::new(config)
    }

    fn manager(root: &Path) -> WorktreeManager {
        WorktreeManager::new(config_for(root))
    }

    #[test]
    fn golden_detection() {
        assert!(is_golden_file("internal/ui/testdata/TestSnapshot.golden"));
        assert!(is_golden_file("testdata/out.golden"));
        assert!(!is_golden_file("testdata/out.txt"));
        assert!(!is_golden_file("src/main.golden"));
        assert!(!is_golden_file("mytestdata/out.golden"));
        assert!(!is_golden_file("a/testdata.golden"));
    }

    #[test]
    fn create_exists_remove_single_repo() {
        let dir = TempDir::new().unwrap();
        init_repo_at(dir.path());
        let mgr = manager(dir.path());

        let created = mgr.create("007").unwrap();
        assert_eq!(created.branch, "agtop/007");
        assert!(created.path.join("README.md").exists());
        assert!(created.sub_worktrees.is_empty());
        assert!(mgr.exists("007"));

        let run = Run {
            id: "007".to_string(),
            branch: created.branch.clone(),
            worktree: created.path.clone(),
            ..Run::new("p", "build")
        };
        mgr.remove(&run).unwrap();
        assert!(!mgr.exists("007"));
        // Idempotent.
        mgr.remove(&run).unwrap();
        assert!(!git::branch_exists(dir.path(), "agtop/007").unwrap());
    }

    #[test]
    fn list_filters_to_base_and_skips_primary_checkout() {
        let dir = TempDir::new().unwrap();
        init_repo_at(dir.path());
        let mgr = manager(dir.path());
        mgr.create("001").unwrap();

        let entries = mgr.list().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].branch.as_deref(), Some("agtop/001"));
    }

    #[test]
    fn multi_repo_create_shares_branch_and_rolls_back() {
        let project = TempDir::new().unwrap();
        let api = project.path().join("services/api");
        let web = project.path().join("services/web");
        std::fs::create_dir_all(&api).unwrap();
        std::fs::create_dir_all(&web).unwrap();
        init_repo_at(&api);
        init_repo_at(&web);

        let mut config = Config::default();
        config.project.root = project.path().to_path_buf();
        config.repos = vec![
            agtop_core::config::RepoConfig {
                name: "api".to_string(),
                path: PathBuf::from("services/api"),
            },
            agtop_core::config::RepoConfig {
                name: "web".to_string(),
                path: PathBuf::from("services/web"),
            },
        ];
        let mgr = WorktreeManager::new(Arc::new(config.clone()));

        let created = mgr.create("030").unwrap();
        assert_eq!(created.sub_worktrees.len(), 2);
        assert!(created.path.join("services/api/README.md").exists());
        assert!(created.path.join("services/web/README.md").exists());
        for sub in &created.sub_worktrees {
            let out = std::process::Command::new("git")
                .args(["branch", "--show-current"])
                .current_dir(&sub.path)
                .output()
                .unwrap();
            assert_eq!(
                String::from_utf8_lossy(&out.stdout).trim(),
                "agtop/030",
                "all sub-worktrees share the branch"
            );
        }

        // A failing repo rolls back the ones already created.
        config.repos.push(agtop_core::config::RepoConfig {
            name: "ghost".to_string(),
            path: PathBuf::from("services/ghost"),
        });
        let mgr = WorktreeManager::new(Arc::new(config));
        assert!(mgr.create("031").is_err());
        assert!(!git::branch_exists(&api, "agtop/031").unwrap());
        assert!(!git::branch_exists(&web, "agtop/031").unwrap());
        assert!(!mgr.exists("031"));
    }

    #[test]
    fn merge_rebases_before_merging() {
        let dir = TempDir::new().unwrap();
        init_repo_at(dir.path());
        let mgr = manager(dir.path());
        let created = mgr.create("010").unwrap();

        // Branch work in the worktree.
        commit_file(&created.path, "branch.txt", "branch\n", "branch work");
        // Main moves forward with a non-conflicting commit.
        commit_file(dir.path(), "mainline.txt", "main\n", "main work");

        let run = Run {
            id: "010".to_string(),
            branch: created.branch,
            worktree: created.path,
            ..Run::new("p", "build")
        };
        let result = mgr.merge(&run).unwrap();
        assert!(result.golden_files_resolved.is_empty());
        assert!(dir.path().join("branch.txt").exists());
        assert!(dir.path().join("mainline.txt").exists());
    }

    #[test]
    fn merge_resolves_golden_only_conflicts_taking_branch_side() {
        let dir = TempDir::new().unwrap();
        init_repo_at(dir.path());
        commit_file(
            dir.path(),
            "internal/ui/testdata/TestSnapshot.golden",
            "base\n",
            "add golden",
        );
        let mgr = manager(dir.path());
        let created = mgr.create("030").unwrap();

        // Divergent edits to the same golden file on both sides.
        commit_file(
            &created.path,
            "internal/ui/testdata/TestSnapshot.golden",
            "branch version\n",
            "branch golden",
        );
        commit_file(
            dir.path(),
            "internal/ui/testdata/TestSnapshot.golden",
            "main version\n",
            "main golden",
        );

        let run = Run {
            id: "030".to_string(),
            branch: created.branch,
            worktree: created.path,
            ..Run::new("p", "build")
        };
        let result = mgr.merge(&run).unwrap();
        assert!(!result.golden_files_resolved.is_empty());
        let on_disk =
            std::fs::read_to_string(dir.path().join("internal/ui/testdata/TestSnapshot.golden"))
                .unwrap();
        assert_eq!(on_disk, "branch version\n");
    }

    #[test]
    fn merge_aborts_cleanly_on_non_golden_conflict() {
        let dir = TempDir::new().unwrap();
        init_repo_at(dir.path());
        commit_file(dir.path(), "src/app.rs", "base\n", "base");
        let mgr = manager(dir.path());
        let created = mgr.create("011").unwrap();

        commit_file(&created.path, "src/app.rs", "branch\n", "branch edit");
        commit_file(dir.path(), "src/app.rs", "main\n", "main edit");

        let run = Run {
            id: "011".to_string(),
            branch: created.branch,
            worktree: created.path,
            ..Run::new("p", "build")
        };
        let err = mgr.merge(&run).unwrap_err();
        let WorktreeError::MergeConflict { files, .. } = &err else {
            panic!("expected merge conflict, got {err:?}");
        };
        assert!(files.iter().any(|f| f.contains("app.rs")));
        // Repo left clean: no staged changes, no conflict markers.
        assert!(!git::has_staged_changes(dir.path()).unwrap());
        assert!(git::conflicted_files(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn merge_stashes_and_restores_dirty_target() {
        let dir = TempDir::new().unwrap();
        init_repo_at(dir.path());
        let mgr = manager(dir.path());
        let created = mgr.create("012").unwrap();
        commit_file(&created.path, "feature.txt", "feature\n", "feature");

        // Uncommitted local edit in the target repo, untouched by the run.
        std::fs::write(dir.path().join("scratch.txt"), "scratch\n").unwrap();

        let run = Run {
            id: "012".to_string(),
            branch: created.branch,
            worktree: created.path,
            ..Run::new("p", "build")
        };
        mgr.merge(&run).unwrap();
        assert!(dir.path().join("feature.txt").exists());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("scratch.txt")).unwrap(),
            "scratch\n"
        );
    }

    #[test]
    fn merge_content_wins_when_stash_pop_conflicts() {
        let dir = TempDir::new().unwrap();
        init_repo_at(dir.path());
        commit_file(dir.path(), "shared.txt", "base\n", "base");
        let mgr = manager(dir.path());
        let created = mgr.create("013").unwrap();
        commit_file(&created.path, "shared.txt", "merged\n", "branch edit");

        // Dirty edit to the same file the merge will rewrite.
        std::fs::write(dir.path().join("shared.txt"), "dirty local\n").unwrap();

        let run = Run {
            id: "013".to_string(),
            branch: created.branch,
            worktree: created.path,
            ..Run::new("p", "build")
        };
        mgr.merge(&run).unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("shared.txt")).unwrap(),
            "merged\n"
        );
        assert!(git::conflicted_files(dir.path()).unwrap().is_empty());
    }
}
