//! Merge pipeline: rebase, push, PR, checks, fix loop, merge.
//!
//! One worker per accepted run. Every stage records its substate in
//! `merge_status`; any failure stamps the run `failed` with the stage
//! error, suffixed `(repo: <name>)` in multi-repo mode. PR URLs are
//! write-once per attempt: a re-accept skips creation and resumes from
//! the first stage that still has work.

use crate::checks::{parse_check_results, CheckSummary};
use crate::executor::Executor;
use crate::git;
use crate::store::RunStore;
use crate::worktree::{is_golden_file, WorktreeManager};
use agtop_core::config::{Config, MergeStrategy};
use agtop_core::types::RunState;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Delay before the first CI poll of each checks round.
const INITIAL_POLL_DELAY: Duration = Duration::from_secs(10);
/// Conflict-resolution rounds before giving up on a rebase.
const CONFLICT_ROUNDS: u32 = 3;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("run not found: {0}")]
    RunNotFound(String),
    #[error("{0}")]
    Stage(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// One repo's view of the run: where to run git/gh, and which PR key it
/// stores its URL under.
#[derive(Debug, Clone)]
struct RepoTarget {
    /// Empty in single-repo mode.
    name: String,
    worktree: PathBuf,
}

impl RepoTarget {
    fn suffix(&self, message: impl std::fmt::Display) -> String {
        if self.name.is_empty() {
            message.to_string()
        } else {
            format!("{message} (repo: {})", self.name)
        }
    }
}

/// What the checks/fix loop should do after a poll round.
#[derive(Debug, PartialEq, Eq)]
enum ChecksAction {
    Merge,
    Fix(Vec<String>),
    Fail(String),
}

fn decide_checks(summary: &CheckSummary, attempt: u32, fix_attempts: u32) -> ChecksAction {
    if summary.all_passed {
        return ChecksAction::Merge;
    }
    // Deadline expiry folds still-pending checks into the failing set.
    let mut failing = summary.failed.clone();
    failing.extend(summary.pending.iter().cloned());
    if attempt >= fix_attempts {
        ChecksAction::Fail(format!(
            "checks still failing after {fix_attempts} fix attempts: {}",
            failing.join(", ")
        ))
    } else {
        ChecksAction::Fix(failing)
    }
}

/// Drives accepted runs through rebase → push → PR → checks → merge.
pub struct MergePipeline {
    store: Arc<RunStore>,
    config: Arc<Config>,
    executor: Arc<Executor>,
    worktrees: Arc<WorktreeManager>,
}

impl std::fmt::Debug for MergePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergePipeline").finish_non_exhaustive()
    }
}

impl MergePipeline {
    pub fn new(
        store: Arc<RunStore>,
        config: Arc<Config>,
        executor: Arc<Executor>,
        worktrees: Arc<WorktreeManager>,
    ) -> Self {
        Self {
            store,
            config,
            executor,
            worktrees,
        }
    }

    fn set_status(&self, run_id: &str, status: &str) {
        self.store.update(run_id, |run| {
            run.state = RunState::Merging;
            run.merge_status = status.to_string();
        });
    }

    fn targets(&self, run_id: &str) -> Result<Vec<RepoTarget>> {
        let run = self
            .store
            .get(run_id)
            .ok_or_else(|| PipelineError::RunNotFound(run_id.to_string()))?;
        if run.sub_worktrees.is_empty() {
            Ok(vec![RepoTarget {
                name: String::new(),
                worktree: run.worktree,
            }])
        } else {
            Ok(run
                .sub_worktrees
                .iter()
                .map(|sub| RepoTarget {
                    name: sub.name.clone(),
                    worktree: sub.path.clone(),
                })
                .collect())
        }
    }

    /// Run the full pipeline for an accepted run. Transient failures set
    /// `state=failed`, `merge_status="failed"`, and stamp `completed_at`;
    /// a later re-accept resumes from the first stage with work left.
    pub async fn run(&self, run_id: &str) -> Result<()> {
        info!(run_id, "merge pipeline started");
        match self.run_inner(run_id).await {
            Ok(()) => {
                self.store.update(run_id, |run| {
                    run.state = RunState::Accepted;
                    run.merge_status = "merged".to_string();
                    run.completed_at = Some(Utc::now());
                });
                info!(run_id, "merge pipeline finished");
                Ok(())
            }
            Err(e) => {
                warn!(run_id, error = %e, "merge pipeline failed");
                self.store.update(run_id, |run| {
                    run.state = RunState::Failed;
                    run.merge_status = "failed".to_string();
                    run.error = e.to_string();
                    run.completed_at = Some(Utc::now());
                });
                Err(e)
            }
        }
    }

    async fn run_inner(&self, run_id: &str) -> Result<()> {
        let run = self
            .store
            .get(run_id)
            .ok_or_else(|| PipelineError::RunNotFound(run_id.to_string()))?;
        let branch = run.branch.clone();
        let targets = self.targets(run_id)?;

        // Rebase onto the freshly fetched target branch.
        self.set_status(run_id, "rebasing");
        for target in &targets {
            self.rebase_repo(run_id, target)
                .await
                .map_err(|e| PipelineError::Stage(target.suffix(e)))?;
        }

        self.push_all(run_id, &targets, &branch)?;

        // Create PRs where none are recorded yet.
        self.set_status(run_id, "pr-created");
        for target in &targets {
            let existing = self.pr_url_for(run_id, target);
            if existing.is_some() {
                continue;
            }
            let url = self
                .create_pr(target, &branch, &run.prompt, run_id)
                .map_err(|e| PipelineError::Stage(target.suffix(e)))?;
            let name = target.name.clone();
            self.store.update(run_id, |run| {
                if name.is_empty() {
                    run.pr_url = url.clone();
                } else {
                    run.pr_urls.insert(name.clone(), url.clone());
                    if run.pr_url.is_empty() {
                        run.pr_url = url.clone();
                    }
                }
            });
        }

        self.checks_and_fix_loop(run_id, &targets, &branch).await?;

        // Merge every PR.
        self.set_status(run_id, "merging");
        for target in &targets {
            let url = self
                .pr_url_for(run_id, target)
                .ok_or_else(|| PipelineError::Stage(target.suffix("no PR URL recorded")))?;
            self.merge_pr(target, &url)
                .map_err(|e| PipelineError::Stage(target.suffix(e)))?;
        }
        Ok(())
    }

    fn pr_url_for(&self, run_id: &str, target: &RepoTarget) -> Option<String> {
        let run = self.store.get(run_id)?;
        if target.name.is_empty() {
            (!run.pr_url.is_empty()).then_some(run.pr_url)
        } else {
            run.pr_urls.get(&target.name).cloned()
        }
    }

    fn push_all(&self, run_id: &str, targets: &[RepoTarget], branch: &str) -> Result<()> {
        self.set_status(run_id, "pushing");
        for target in targets {
            git::push_force_with_lease(&target.worktree, branch)
                .map_err(|e| PipelineError::Stage(target.suffix(e)))?;
        }
        Ok(())
    }

    async fn rebase_repo(
        &self,
        run_id: &str,
        target: &RepoTarget,
    ) -> std::result::Result<(), String> {
        let dir = &target.worktree;
        let target_branch = self.resolve_target_branch(dir).map_err(|e| e.to_string())?;
        git::fetch(dir, "origin", &target_branch).map_err(|e| e.to_string())?;

        let rebase = git::rebase(dir, &format!("origin/{target_branch}"))
            .map_err(|e| e.to_string())?;
        if rebase.success {
            return Ok(());
        }
        self.resolve_conflicts_with_agent(run_id, dir).await
    }

    /// Target branch: config wins, then the repo's `origin/HEAD`, then
    /// `main`/`master`.
    fn resolve_target_branch(&self, dir: &Path) -> git::Result<String> {
        if let Some(configured) = &self.config.merge.target_branch {
            return Ok(configured.clone());
        }
        git::detect_default_branch(dir)
    }

    /// Agent-assisted rebase conflict resolution, up to three rounds.
    /// Golden files resolve mechanically; the build skill handles the
    /// rest. Exhaustion aborts the rebase.
    async fn resolve_conflicts_with_agent(
        &self,
        run_id: &str,
        dir: &Path,
    ) -> std::result::Result<(), String> {
        let mut golden_resolved = false;
        for round in 0..CONFLICT_ROUNDS {
            let conflicts = git::conflicted_files(dir).map_err(|e| e.to_string())?;
            if conflicts.is_empty() {
                let cont = git::rebase_continue(dir).map_err(|e| e.to_string())?;
                if cont.success {
                    if golden_resolved {
                        self.worktrees.run_golden_update(dir);
                    }
                    return Ok(());
                }
                continue;
            }

            let (golden, non_golden): (Vec<String>, Vec<String>) =
                conflicts.into_iter().partition(|f| is_golden_file(f));
            for file in &golden {
                git::checkout_theirs(dir, file).map_err(|e| e.to_string())?;
                git::add(dir, file).map_err(|e| e.to_string())?;
                golden_resolved = true;
            }

            if non_golden.is_empty() {
                let cont = git::rebase_continue(dir).map_err(|e| e.to_string())?;
                if cont.success {
                    if golden_resolved {
                        self.worktrees.run_golden_update(dir);
                    }
                    return Ok(());
                }
                continue;
            }

            info!(run_id, round, files = non_golden.len(), "agent conflict resolution round");
            let prompt = conflict_fix_prompt(dir, &non_golden);
            self.executor
                .run_fix_build(run_id, &prompt)
                .await
                .map_err(|e| format!("conflict-resolution agent failed: {e}"))?;
            git::add_all(dir).map_err(|e| e.to_string())?;
            let cont = git::rebase_continue(dir).map_err(|e| e.to_string())?;
            if cont.success {
                if golden_resolved {
                    self.worktrees.run_golden_update(dir);
                }
                return Ok(());
            }
        }

        git::rebase_abort(dir);
        Err(format!(
            "rebase conflicts unresolved after {CONFLICT_ROUNDS} rounds"
        ))
    }

    /// Poll checks until they pass, fixing failures up to
    /// `fix_attempts` times.
    async fn checks_and_fix_loop(
        &self,
        run_id: &str,
        targets: &[RepoTarget],
        branch: &str,
    ) -> Result<()> {
        let fix_attempts = self.config.merge.fix_attempts;
        for attempt in 0..=fix_attempts {
            self.set_status(run_id, "checks-pending");
            let summary = self.poll_until_settled(run_id, targets).await?;

            match decide_checks(&summary, attempt, fix_attempts) {
                ChecksAction::Merge => return Ok(()),
                ChecksAction::Fail(message) => return Err(PipelineError::Stage(message)),
                ChecksAction::Fix(failing) => {
                    self.set_status(run_id, "fixing");
                    info!(run_id, attempt, checks = ?failing, "fixing failing checks");
                    let prompt = check_fix_prompt(&failing);
                    self.executor
                        .run_fix_build(run_id, &prompt)
                        .await
                        .map_err(|e| PipelineError::Stage(format!("check fix failed: {e}")))?;
                    self.executor.commit_best_effort(run_id).await;
                    self.push_all(run_id, targets, branch)?;
                }
            }
        }
        // The final iteration either merged or failed above.
        Err(PipelineError::Stage(
            "checks loop exited without a verdict".to_string(),
        ))
    }

    /// Poll all repos until nothing is pending or the poll deadline
    /// passes. The returned summary's pending set is non-empty only on
    /// deadline expiry.
    async fn poll_until_settled(
        &self,
        run_id: &str,
        targets: &[RepoTarget],
    ) -> Result<CheckSummary> {
        tokio::time::sleep(INITIAL_POLL_DELAY).await;
        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(self.config.merge.poll_timeout);
        let interval = Duration::from_secs(self.config.merge.poll_interval);

        loop {
            let mut combined = CheckSummary {
                all_passed: true,
                ..CheckSummary::default()
            };
            for target in targets {
                let summary = self
                    .fetch_checks(run_id, target)
                    .map_err(|e| PipelineError::Stage(target.suffix(e)))?;
                combined.all_passed &= summary.all_passed;
                combined.pending.extend(summary.pending);
                combined.failed.extend(summary.failed);
            }

            if combined.all_passed || !combined.failed.is_empty() {
                return Ok(combined);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(combined);
            }
            tokio::time::sleep(interval).await;
        }
    }

    fn fetch_checks(
        &self,
        run_id: &str,
        target: &RepoTarget,
    ) -> std::result::Result<CheckSummary, String> {
        let url = self
            .pr_url_for(run_id, target)
            .ok_or_else(|| "no PR URL recorded".to_string())?;
        let out = gh(
            &target.worktree,
            &["pr", "checks", &url, "--json", "name,state,conclusion"],
        )?;
        // `gh pr checks` exits non-zero while checks fail or pend; the
        // JSON on stdout is still authoritative.
        if out.stdout.trim().is_empty() && !out.success {
            return Err(format!("checks query failed: {}", out.stderr.trim()));
        }
        Ok(parse_check_results(&out.stdout))
    }

    fn create_pr(
        &self,
        target: &RepoTarget,
        branch: &str,
        prompt: &str,
        run_id: &str,
    ) -> std::result::Result<String, String> {
        let title = pr_title(prompt);
        let body = format!("{prompt}\n\n---\nAutomated change from agtop run {run_id}.");
        let out = gh(
            &target.worktree,
            &[
                "pr", "create", "--head", branch, "--title", &title, "--body", &body,
            ],
        )?;
        if !out.success {
            return Err(format!("pr create failed: {}", out.stderr.trim()));
        }
        // The PR URL is the last non-empty stdout line.
        out.stdout
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(String::from)
            .ok_or_else(|| "pr create returned no URL".to_string())
    }

    fn merge_pr(&self, target: &RepoTarget, url: &str) -> std::result::Result<(), String> {
        let strategy_flag = match self.config.merge.merge_strategy {
            MergeStrategy::Squash => "--squash",
            MergeStrategy::Merge => "--merge",
            MergeStrategy::Rebase => "--rebase",
        };
        let out = gh(
            &target.worktree,
            &["pr", "merge", url, strategy_flag, "--delete-branch"],
        )?;
        if !out.success {
            return Err(format!("pr merge failed: {}", out.stderr.trim()));
        }
        Ok(())
    }
}

/// Run `gh` with an explicit working directory.
fn gh(dir: &Path, args: &[&str]) -> std::result::Result<git::GitOutput, String> {
    let output = std::process::Command::new("gh")
        .args(args)
        .current_dir(dir)
        .output()
        .map_err(|e| format!("failed to execute gh: {e}"))?;
    Ok(git::GitOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

fn pr_title(prompt: &str) -> String {
    let first_line = prompt.lines().next().unwrap_or("agtop change").trim();
    if first_line.len() <= 72 {
        first_line.to_string()
    } else {
        let cut = first_line
            .char_indices()
            .take_while(|(i, _)| *i < 69)
            .last()
            .map_or(0, |(i, c)| i + c.len_utf8());
        format!("{}...", &first_line[..cut])
    }
}

fn conflict_fix_prompt(dir: &Path, files: &[String]) -> String {
    format!(
        "A git rebase in {} stopped on conflicts in these files:\n{}\n\n\
         Edit each file to resolve the conflict, removing all conflict \
         markers (<<<<<<<, =======, >>>>>>>), then run `git add` on each \
         resolved file. Do not run `git rebase --continue`.",
        dir.display(),
        files
            .iter()
            .map(|f| format!("- {f}"))
            .collect::<Vec<_>>()
            .join("\n")
    )
}

fn check_fix_prompt(failing: &[String]) -> String {
    format!(
        "CI checks are failing on this branch: {}.\n\
         Inspect the failures, fix the code, and make the checks pass. \
         Commit your fixes.",
        failing.join(", ")
    )
}
