//! Core types for the orchestrator engine.
//!
//! The run record is the central entity: one user-initiated task with its
//! own branch, worktree, state machine, and telemetry ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Run lifecycle state.
///
/// `completed` and `reviewing` are quiescent but actionable: the run is
/// idle but may still be accepted, rejected, or followed up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    #[default]
    Queued,
    Routing,
    Running,
    Paused,
    Reviewing,
    Completed,
    Merging,
    Accepted,
    Rejected,
    Failed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Routing => "routing",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Reviewing => "reviewing",
            Self::Completed => "completed",
            Self::Merging => "merging",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
            Self::Failed => "failed",
        }
    }

    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Accepted | Self::Rejected | Self::Failed)
    }

    /// A run is active while a worker or the merge pipeline may still
    /// mutate it.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Queued | Self::Routing | Self::Running | Self::Paused | Self::Merging
        )
    }

    /// States in which `completed_at` is stamped.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Reviewing | Self::Accepted | Self::Rejected | Self::Failed
        )
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry in a run's append-only cost ledger: a single skill
/// invocation's telemetry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SkillCost {
    pub skill: String,
    pub cost: f64,
    pub tokens: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

/// One git worktree inside a composite (multi-repo) worktree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubWorktree {
    /// Repo name from config.
    pub name: String,
    /// Path of this repo's worktree under the composite root.
    pub path: PathBuf,
    /// Root of the source repository the worktree belongs to.
    pub repo_root: PathBuf,
}

/// A single user-initiated task with its own branch, worktree, and state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Run {
    /// Monotonic zero-padded decimal id, assigned by the store on insert.
    pub id: String,

    // Inputs
    /// Latest prompt, after ticket expansion.
    pub prompt: String,
    pub original_prompt: String,
    pub workflow: String,
    pub model: String,
    /// Optional ticket key the prompt was expanded from.
    pub task_id: Option<String>,
    pub follow_up_prompts: Vec<String>,

    // Environment
    /// Branch name, `agtop/<id>`, shared across all sub-worktrees.
    pub branch: String,
    /// Worktree path; the composite root in multi-repo mode.
    pub worktree: PathBuf,
    pub sub_worktrees: Vec<SubWorktree>,

    // Progress
    pub state: RunState,
    pub current_skill: String,
    /// 1-based position in the workflow; 0 before the first skill.
    pub skill_index: usize,
    pub skill_total: usize,
    /// Free-form substate while the merge pipeline runs.
    pub merge_status: String,
    pub error: String,
    pub pr_url: String,
    /// Per-repo PR URLs in multi-repo mode.
    pub pr_urls: BTreeMap<String, String>,

    // Telemetry
    pub tokens: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost: f64,
    pub skill_costs: Vec<SkillCost>,
    pub dev_server_port: u16,
    pub dev_server_url: String,

    // Time
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Default for Run {
    fn default() -> Self {
        Self {
            id: String::new(),
            prompt: String::new(),
            original_prompt: String::new(),
            workflow: String::new(),
            model: String::new(),
            task_id: None,
            follow_up_prompts: Vec::new(),
            branch: String::new(),
            worktree: PathBuf::new(),
            sub_worktrees: Vec::new(),
            state: RunState::Queued,
            current_skill: String::new(),
            skill_index: 0,
            skill_total: 0,
            merge_status: String::new(),
            error: String::new(),
            pr_url: String::new(),
            pr_urls: BTreeMap::new(),
            tokens: 0,
            tokens_in: 0,
            tokens_out: 0,
            cost: 0.0,
            skill_costs: Vec::new(),
            dev_server_port: 0,
            dev_server_url: String::new(),
            created_at: DateTime::UNIX_EPOCH,
            started_at: None,
            completed_at: None,
        }
    }
}

impl Run {
    /// Create a run for a fresh prompt. Id, branch, and worktree are
    /// filled in by the store and worktree manager.
    pub fn new(prompt: impl Into<String>, workflow: impl Into<String>) -> Self {
        let prompt = prompt.into();
        Self {
            original_prompt: prompt.clone(),
            prompt,
            workflow: workflow.into(),
            ..Self::default()
        }
    }

    /// Whether the store still needs to stamp `created_at`.
    pub fn created_at_is_unset(&self) -> bool {
        self.created_at == DateTime::UNIX_EPOCH
    }

    /// Append a ledger entry and fold it into the run totals, keeping
    /// `cost` and `tokens` equal to the ledger sums.
    pub fn add_skill_cost(&mut self, entry: SkillCost) {
        self.cost += entry.cost;
        self.tokens += entry.tokens;
        self.tokens_in += entry.tokens_in;
        self.tokens_out += entry.tokens_out;
        self.skill_costs.push(entry);
    }

    /// Fold another run's ledger into this one (parallel sub-task
    /// completion).
    pub fn absorb_telemetry(&mut self, other: &Run) {
        self.cost += other.cost;
        self.tokens += other.tokens;
        self.tokens_in += other.tokens_in;
        self.tokens_out += other.tokens_out;
        self.skill_costs.extend(other.skill_costs.iter().cloned());
    }
}

/// Branch name for a run id.
pub fn branch_for_run(run_id: &str) -> String {
    format!("agtop/{run_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&RunState::Running).unwrap(),
            "\"running\""
        );
        assert_eq!(
            serde_json::to_string(&RunState::Reviewing).unwrap(),
            "\"reviewing\""
        );
    }

    #[test]
    fn terminal_set() {
        assert!(RunState::Accepted.is_terminal());
        assert!(RunState::Rejected.is_terminal());
        assert!(RunState::Failed.is_terminal());
        assert!(!RunState::Completed.is_terminal());
        assert!(!RunState::Reviewing.is_terminal());
    }

    #[test]
    fn active_set() {
        for state in [
            RunState::Queued,
            RunState::Routing,
            RunState::Running,
            RunState::Paused,
            RunState::Merging,
        ] {
            assert!(state.is_active(), "{state} should be active");
        }
        for state in [
            RunState::Reviewing,
            RunState::Completed,
            RunState::Accepted,
            RunState::Rejected,
            RunState::Failed,
        ] {
            assert!(!state.is_active(), "{state} should not be active");
        }
    }

    #[test]
    fn add_skill_cost_keeps_totals_consistent() {
        let mut run = Run::new("do the thing", "build");
        run.add_skill_cost(SkillCost {
            skill: "plan".to_string(),
            cost: 0.25,
            tokens: 100,
            tokens_in: 60,
            tokens_out: 40,
        });
        run.add_skill_cost(SkillCost {
            skill: "build".to_string(),
            cost: 0.75,
            tokens: 300,
            tokens_in: 200,
            tokens_out: 100,
        });

        assert_eq!(run.skill_costs.len(), 2);
        assert!((run.cost - 1.0).abs() < f64::EPSILON);
        assert_eq!(run.tokens, 400);
        assert_eq!(run.tokens_in, 260);
        assert_eq!(run.tokens_out, 140);
        let ledger_cost: f64 = run.skill_costs.iter().map(|c| c.cost).sum();
        assert!((run.cost - ledger_cost).abs() < f64::EPSILON);
    }

    #[test]
    fn new_run_keeps_original_prompt() {
        let run = Run::new("fix the login page", "auto");
        assert_eq!(run.prompt, run.original_prompt);
        assert!(run.created_at_is_unset());
        assert_eq!(run.skill_index, 0);
    }

    #[test]
    fn branch_naming() {
        assert_eq!(branch_for_run("042"), "agtop/042");
    }
}
