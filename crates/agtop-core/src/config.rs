//! Configuration for the orchestrator.
//!
//! Discovery order: `<cwd>/agtop.yaml`, then `~/.config/agtop/config.yaml`;
//! first hit wins. Environment overrides beat file values which beat
//! defaults. Unknown keys are rejected at parse time; semantic problems
//! are aggregated into a single validation error.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid configuration:\n{}", .0.join("\n"))]
    Validation(Vec<String>),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Labels for skill sources that may be ignored via
/// `project.ignore_skill_sources`.
pub const SKILL_SOURCE_LABELS: [&str; 8] = [
    "project-agtop",
    "project-claude",
    "project-opencode",
    "project-agents",
    "user-agtop",
    "user-claude",
    "user-opencode",
    "builtin",
];

/// Agent runtime selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeKind {
    #[default]
    Claude,
    Opencode,
}

impl RuntimeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Opencode => "opencode",
        }
    }
}

/// Permission mode handed to the claude runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PermissionMode {
    #[default]
    #[serde(rename = "acceptEdits")]
    AcceptEdits,
    #[serde(rename = "acceptAll")]
    AcceptAll,
    #[serde(rename = "manual")]
    Manual,
}

impl PermissionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AcceptEdits => "acceptEdits",
            Self::AcceptAll => "acceptAll",
            Self::Manual => "manual",
        }
    }
}

/// Strategy used when merging an accepted run's pull request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    #[default]
    Squash,
    Merge,
    Rebase,
}

impl MergeStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Squash => "squash",
            Self::Merge => "merge",
            Self::Rebase => "rebase",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProjectConfig {
    /// Repo root; `.` resolves to the process working directory.
    pub root: PathBuf,
    /// Base directory for worktrees; `~` expanded, relative paths
    /// resolved against the root. Defaults to `<root>/.agtop/worktrees`.
    pub worktree_path: Option<PathBuf>,
    /// Skill-source labels to drop entirely; see [`SKILL_SOURCE_LABELS`].
    pub ignore_skill_sources: Vec<String>,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            worktree_path: None,
            ignore_skill_sources: Vec::new(),
        }
    }
}

/// One sub-repository of a multi-repo project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RepoConfig {
    pub name: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClaudeRuntimeConfig {
    pub model: String,
    pub permission_mode: PermissionMode,
    pub max_turns: Option<u32>,
    pub allowed_tools: Vec<String>,
    pub subscription: bool,
}

impl Default for ClaudeRuntimeConfig {
    fn default() -> Self {
        Self {
            model: "sonnet".to_string(),
            permission_mode: PermissionMode::AcceptEdits,
            max_turns: None,
            allowed_tools: Vec::new(),
            subscription: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OpencodeRuntimeConfig {
    pub model: String,
    pub agent: Option<String>,
}

impl Default for OpencodeRuntimeConfig {
    fn default() -> Self {
        Self {
            model: "anthropic/claude-sonnet-4-5".to_string(),
            agent: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    pub default: RuntimeKind,
    pub claude: ClaudeRuntimeConfig,
    pub opencode: OpencodeRuntimeConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkflowConfig {
    pub skills: Vec<String>,
}

/// Per-skill overrides. Three-valued booleans are `Option<bool>`: a
/// present value always applies, absence never does.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SkillOverride {
    pub model: Option<String>,
    /// Timeout in seconds.
    pub timeout: Option<u64>,
    pub parallel: Option<bool>,
    pub allowed_tools: Option<Vec<String>>,
    pub ignore: Option<bool>,
}

impl SkillOverride {
    pub fn is_ignored(&self) -> bool {
        self.ignore == Some(true)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SafetyConfig {
    /// Regex patterns the agent must not work around.
    pub blocked_patterns: Vec<String>,
    pub allow_overrides: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LimitsConfig {
    pub max_tokens_per_run: u64,
    pub max_cost_per_run: f64,
    pub max_concurrent_runs: usize,
    /// Seconds to sleep before retrying a rate-limited skill.
    pub rate_limit_backoff: u64,
    pub rate_limit_max_retries: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_tokens_per_run: 2_000_000,
            max_cost_per_run: 25.0,
            max_concurrent_runs: 3,
            rate_limit_backoff: 30,
            rate_limit_max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MergeConfig {
    /// Target branch; detected from `origin/HEAD` when unset.
    pub target_branch: Option<String>,
    pub auto_merge: bool,
    pub merge_strategy: MergeStrategy,
    /// Fix-loop iterations after the first failing check poll.
    pub fix_attempts: u32,
    /// Seconds between CI polls.
    pub poll_interval: u64,
    /// Seconds before a poll round gives up.
    pub poll_timeout: u64,
    /// Command to re-generate golden files after auto-resolution.
    pub golden_update_command: Option<String>,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            target_branch: None,
            auto_merge: true,
            merge_strategy: MergeStrategy::Squash,
            fix_attempts: 3,
            poll_interval: 30,
            poll_timeout: 600,
            golden_update_command: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub project: ProjectConfig,
    pub repos: Vec<RepoConfig>,
    pub runtime: RuntimeConfig,
    pub workflows: BTreeMap<String, WorkflowConfig>,
    pub skills: BTreeMap<String, SkillOverride>,
    pub safety: SafetyConfig,
    pub limits: LimitsConfig,
    pub merge: MergeConfig,
}

impl Default for Config {
    fn default() -> Self {
        let mut workflows = BTreeMap::new();
        workflows.insert(
            "build".to_string(),
            WorkflowConfig {
                skills: vec!["build".to_string(), "test".to_string()],
            },
        );
        workflows.insert(
            "plan-build".to_string(),
            WorkflowConfig {
                skills: vec!["plan".to_string(), "build".to_string(), "test".to_string()],
            },
        );
        workflows.insert(
            "sdlc".to_string(),
            WorkflowConfig {
                skills: vec![
                    "plan".to_string(),
                    "build".to_string(),
                    "test".to_string(),
                    "review".to_string(),
                    "document".to_string(),
                ],
            },
        );

        // Empty overrides for every built-in so the default workflows
        // pass skill-reference validation.
        let mut skills = BTreeMap::new();
        for name in [
            "route",
            "decompose",
            "plan",
            "build",
            "test",
            "review",
            "commit",
            "document",
        ] {
            skills.insert(name.to_string(), SkillOverride::default());
        }

        Self {
            project: ProjectConfig::default(),
            repos: Vec::new(),
            runtime: RuntimeConfig::default(),
            workflows,
            skills,
            safety: SafetyConfig::default(),
            limits: LimitsConfig::default(),
            merge: MergeConfig::default(),
        }
    }
}

impl Config {
    /// Find the config file: `<cwd>/agtop.yaml`, then
    /// `~/.config/agtop/config.yaml`.
    pub fn discover() -> Option<PathBuf> {
        let local = PathBuf::from("agtop.yaml");
        if local.exists() {
            return Some(local);
        }
        let user = dirs::config_dir()?.join("agtop/config.yaml");
        user.exists().then_some(user)
    }

    /// Load from a file, apply environment overrides, and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Self =
            serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load the discovered config, or defaults with env overrides when no
    /// file exists.
    pub fn load_discovered() -> Result<Self> {
        match Self::discover() {
            Some(path) => Self::load(&path),
            None => {
                let mut config = Self::default();
                config.apply_env_overrides();
                config.validate()?;
                Ok(config)
            }
        }
    }

    /// True when the project is a multi-repo composite.
    pub fn multi_repo(&self) -> bool {
        !self.repos.is_empty()
    }

    /// Resolved project root.
    pub fn project_root(&self) -> PathBuf {
        if self.project.root == Path::new(".") {
            std::env::current_dir().unwrap_or_else(|_| self.project.root.clone())
        } else {
            self.project.root.clone()
        }
    }

    /// Base directory for worktrees: `~` expanded, relative paths
    /// resolved against the project root.
    pub fn worktree_base(&self) -> PathBuf {
        let root = self.project_root();
        match &self.project.worktree_path {
            None => root.join(".agtop/worktrees"),
            Some(configured) => {
                let expanded = expand_tilde(configured);
                if expanded.is_absolute() {
                    expanded
                } else {
                    root.join(expanded)
                }
            }
        }
    }

    /// Apply `AGTOP_*` environment overrides. Invalid values are ignored
    /// with a warning on stderr.
    pub fn apply_env_overrides(&mut self) {
        let vars: Vec<(String, String)> = std::env::vars()
            .filter(|(k, _)| k.starts_with("AGTOP_"))
            .collect();
        self.apply_overrides(&vars);
    }

    fn apply_overrides(&mut self, vars: &[(String, String)]) {
        // AGTOP_RUNTIME must land before AGTOP_MODEL so the model override
        // targets the selected runtime.
        let lookup = |name: &str| vars.iter().find(|(k, _)| k == name).map(|(_, v)| v.clone());
        let ordered = [
            "AGTOP_RUNTIME",
            "AGTOP_MODEL",
            "AGTOP_PERMISSION_MODE",
            "AGTOP_MAX_COST",
            "AGTOP_MAX_TOKENS",
            "AGTOP_MAX_CONCURRENT",
        ];
        for key in ordered {
            let Some(value) = lookup(key) else { continue };
            let value = &value;
            match key {
                "AGTOP_RUNTIME" => match value.as_str() {
                    "claude" => self.runtime.default = RuntimeKind::Claude,
                    "opencode" => self.runtime.default = RuntimeKind::Opencode,
                    other => eprintln!("Warning: invalid AGTOP_RUNTIME: {other}"),
                },
                "AGTOP_MODEL" => match self.runtime.default {
                    RuntimeKind::Claude => self.runtime.claude.model = value.clone(),
                    RuntimeKind::Opencode => self.runtime.opencode.model = value.clone(),
                },
                "AGTOP_PERMISSION_MODE" => match value.as_str() {
                    "acceptEdits" => {
                        self.runtime.claude.permission_mode = PermissionMode::AcceptEdits;
                    }
                    "acceptAll" => {
                        self.runtime.claude.permission_mode = PermissionMode::AcceptAll;
                    }
                    "manual" => self.runtime.claude.permission_mode = PermissionMode::Manual,
                    other => eprintln!("Warning: invalid AGTOP_PERMISSION_MODE: {other}"),
                },
                "AGTOP_MAX_COST" => match value.parse::<f64>() {
                    Ok(v) => self.limits.max_cost_per_run = v,
                    Err(_) => eprintln!("Warning: invalid AGTOP_MAX_COST: {value}"),
                },
                "AGTOP_MAX_TOKENS" => match value.parse::<u64>() {
                    Ok(v) => self.limits.max_tokens_per_run = v,
                    Err(_) => eprintln!("Warning: invalid AGTOP_MAX_TOKENS: {value}"),
                },
                "AGTOP_MAX_CONCURRENT" => match value.parse::<usize>() {
                    Ok(v) => self.limits.max_concurrent_runs = v,
                    Err(_) => eprintln!("Warning: invalid AGTOP_MAX_CONCURRENT: {value}"),
                },
                _ => {}
            }
        }
    }

    /// Validate semantic constraints, aggregating every problem into one
    /// error.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        for label in &self.project.ignore_skill_sources {
            if !SKILL_SOURCE_LABELS.contains(&label.as_str()) {
                problems.push(format!("unknown skill source label: {label}"));
            }
        }

        for (name, workflow) in &self.workflows {
            if workflow.skills.is_empty() {
                problems.push(format!("workflow {name} has no skills"));
            }
            for skill in &workflow.skills {
                if !self.skills.contains_key(skill) {
                    problems.push(format!("workflow {name} references unknown skill {skill}"));
                }
            }
        }

        for pattern in &self.safety.blocked_patterns {
            if let Err(e) = regex::Regex::new(pattern) {
                problems.push(format!("invalid safety pattern {pattern:?}: {e}"));
            }
        }

        if self.limits.max_tokens_per_run == 0 {
            problems.push("limits.max_tokens_per_run must be positive".to_string());
        }
        if self.limits.max_cost_per_run <= 0.0 {
            problems.push("limits.max_cost_per_run must be positive".to_string());
        }
        if self.limits.max_concurrent_runs == 0 {
            problems.push("limits.max_concurrent_runs must be positive".to_string());
        }
        if self.limits.rate_limit_backoff == 0 {
            problems.push("limits.rate_limit_backoff must be positive".to_string());
        }
        if self.merge.poll_interval == 0 {
            problems.push("merge.poll_interval must be positive".to_string());
        }
        if self.merge.poll_timeout == 0 {
            problems.push("merge.poll_timeout must be positive".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(problems))
        }
    }
}

/// Expand a leading `~/` against the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let Some(s) = path.to_str() else {
        return path.to_path_buf();
    };
    if s == "~" {
        return dirs::home_dir().unwrap_or_else(|| path.to_path_buf());
    }
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn default_workflows_present() {
        let config = Config::default();
        assert_eq!(
            config.workflows["plan-build"].skills,
            vec!["plan", "build", "test"]
        );
        assert!(config.workflows.contains_key("build"));
        assert!(config.workflows.contains_key("sdlc"));
    }

    #[test]
    fn parses_full_yaml() {
        let yaml = r#"
project:
  root: /srv/app
  worktree_path: ~/worktrees
  ignore_skill_sources: [project-claude]
repos:
  - name: api
    path: services/api
  - name: web
    path: services/web
runtime:
  default: claude
  claude:
    model: opus
    permission_mode: acceptAll
    max_turns: 40
    allowed_tools: [Bash, Edit]
workflows:
  build:
    skills: [build, test]
skills:
  build:
    model: opus
    timeout: 1200
  test: {}
safety:
  blocked_patterns: ["rm -rf /"]
limits:
  max_cost_per_run: 5.0
merge:
  merge_strategy: merge
  fix_attempts: 2
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.project.root, PathBuf::from("/srv/app"));
        assert!(config.multi_repo());
        assert_eq!(config.repos[1].name, "web");
        assert_eq!(config.runtime.claude.model, "opus");
        assert_eq!(
            config.runtime.claude.permission_mode,
            PermissionMode::AcceptAll
        );
        assert_eq!(config.skills["build"].timeout, Some(1200));
        assert_eq!(config.merge.merge_strategy, MergeStrategy::Merge);
        assert_eq!(config.merge.fix_attempts, 2);
        assert!((config.limits.max_cost_per_run - 5.0).abs() < f64::EPSILON);
    }

    #[test]
    fn rejects_unknown_keys() {
        let yaml = "project:\n  root: .\n  no_such_key: 1\n";
        assert!(serde_yaml::from_str::<Config>(yaml).is_err());
    }

    #[test]
    fn validation_aggregates_all_problems() {
        let mut config = Config::default();
        config
            .project
            .ignore_skill_sources
            .push("project-vscode".to_string());
        config.workflows.insert(
            "broken".to_string(),
            WorkflowConfig {
                skills: vec!["missing-skill".to_string()],
            },
        );
        config.safety.blocked_patterns.push("(unclosed".to_string());
        config.limits.max_cost_per_run = 0.0;

        let err = config.validate().unwrap_err();
        let ConfigError::Validation(problems) = err else {
            panic!("expected validation error");
        };
        assert_eq!(problems.len(), 4, "problems: {problems:?}");
    }

    #[test]
    fn workflow_with_no_skills_is_invalid() {
        let mut config = Config::default();
        config
            .workflows
            .insert("empty".to_string(), WorkflowConfig::default());
        assert!(config.validate().is_err());
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = Config::default();
        config.apply_overrides(&[
            ("AGTOP_RUNTIME".to_string(), "opencode".to_string()),
            ("AGTOP_MAX_COST".to_string(), "2.5".to_string()),
            ("AGTOP_MAX_TOKENS".to_string(), "50000".to_string()),
            ("AGTOP_MAX_CONCURRENT".to_string(), "7".to_string()),
        ]);
        assert_eq!(config.runtime.default, RuntimeKind::Opencode);
        assert!((config.limits.max_cost_per_run - 2.5).abs() < f64::EPSILON);
        assert_eq!(config.limits.max_tokens_per_run, 50_000);
        assert_eq!(config.limits.max_concurrent_runs, 7);
    }

    #[test]
    fn invalid_env_values_are_ignored() {
        let mut config = Config::default();
        let before = config.limits.max_cost_per_run;
        config.apply_overrides(&[
            ("AGTOP_MAX_COST".to_string(), "not-a-float".to_string()),
            ("AGTOP_RUNTIME".to_string(), "copilot".to_string()),
        ]);
        assert!((config.limits.max_cost_per_run - before).abs() < f64::EPSILON);
        assert_eq!(config.runtime.default, RuntimeKind::Claude);
    }

    #[test]
    fn model_override_targets_default_runtime() {
        let mut config = Config::default();
        config.apply_overrides(&[("AGTOP_MODEL".to_string(), "haiku".to_string())]);
        assert_eq!(config.runtime.claude.model, "haiku");

        let mut config = Config::default();
        config.apply_overrides(&[
            ("AGTOP_RUNTIME".to_string(), "opencode".to_string()),
            ("AGTOP_MODEL".to_string(), "anthropic/claude-opus-4-1".to_string()),
        ]);
        assert_eq!(config.runtime.opencode.model, "anthropic/claude-opus-4-1");
    }

    #[test]
    fn worktree_base_defaults_under_root() {
        let mut config = Config::default();
        config.project.root = PathBuf::from("/srv/app");
        assert_eq!(
            config.worktree_base(),
            PathBuf::from("/srv/app/.agtop/worktrees")
        );
    }

    #[test]
    fn worktree_base_resolves_relative_against_root() {
        let mut config = Config::default();
        config.project.root = PathBuf::from("/srv/app");
        config.project.worktree_path = Some(PathBuf::from("tmp/wt"));
        assert_eq!(config.worktree_base(), PathBuf::from("/srv/app/tmp/wt"));
    }

    #[test]
    fn expand_tilde_home() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde(Path::new("~/x")), home.join("x"));
        }
        assert_eq!(expand_tilde(Path::new("/abs/x")), PathBuf::from("/abs/x"));
    }
}
