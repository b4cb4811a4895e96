//! Skill registry: precedence-ordered sources, ignore semantics, config
//! overrides, and per-invocation run options.
//!
//! Sources are scanned from the lowest precedence (embedded built-ins) up
//! to the highest (`<project>/.agtop/skills`), each insert overwriting the
//! previous holder of the name, so lower priority numbers win.

use agtop_core::config::{Config, PermissionMode, RuntimeKind};
use agtop_core::skills::{parse_skill, Skill, BUILTIN_SCHEME};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Embedded built-in skills, priority 7.
const BUILTIN_SKILLS: [(&str, &str); 8] = [
    ("route", include_str!("../builtin/route.md")),
    ("decompose", include_str!("../builtin/decompose.md")),
    ("plan", include_str!("../builtin/plan.md")),
    ("build", include_str!("../builtin/build.md")),
    ("test", include_str!("../builtin/test.md")),
    ("review", include_str!("../builtin/review.md")),
    ("commit", include_str!("../builtin/commit.md")),
    ("document", include_str!("../builtin/document.md")),
];

/// Priority of the embedded built-ins (lowest precedence).
pub const BUILTIN_PRIORITY: u8 = 7;

/// One skill directory in the precedence order.
#[derive(Debug, Clone)]
pub struct SkillSource {
    pub label: &'static str,
    pub priority: u8,
    /// `None` for the embedded built-ins.
    pub dir: Option<PathBuf>,
}

/// Sources in precedence order (priority 0 wins). User-level directories
/// resolve against the home/config dirs; project-level against the root.
pub fn default_sources(config: &Config) -> Vec<SkillSource> {
    let root = config.project_root();
    let mut sources = vec![
        SkillSource {
            label: "project-agtop",
            priority: 0,
            dir: Some(root.join(".agtop/skills")),
        },
        SkillSource {
            label: "project-claude",
            priority: 1,
            dir: Some(root.join(".claude/skills")),
        },
        SkillSource {
            label: "project-opencode",
            priority: 2,
            dir: Some(root.join(".opencode/skills")),
        },
        SkillSource {
            label: "project-agents",
            priority: 3,
            dir: Some(root.join(".agents/skills")),
        },
    ];
    if let Some(config_dir) = dirs::config_dir() {
        sources.push(SkillSource {
            label: "user-agtop",
            priority: 4,
            dir: Some(config_dir.join("agtop/skills")),
        });
    }
    if let Some(home) = dirs::home_dir() {
        sources.push(SkillSource {
            label: "user-claude",
            priority: 5,
            dir: Some(home.join(".claude/skills")),
        });
    }
    if let Some(config_dir) = dirs::config_dir() {
        sources.push(SkillSource {
            label: "user-opencode",
            priority: 6,
            dir: Some(config_dir.join("opencode/skills")),
        });
    }
    sources.push(SkillSource {
        label: "builtin",
        priority: BUILTIN_PRIORITY,
        dir: None,
    });
    sources
}

/// Runtime-agnostic options for one skill invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOptions {
    pub runtime: RuntimeKind,
    pub model: String,
    pub allowed_tools: Vec<String>,
    pub max_turns: Option<u32>,
    pub permission_mode: Option<PermissionMode>,
    /// opencode agent name.
    pub agent: Option<String>,
    /// Timeout in seconds for the invocation.
    pub timeout: Option<u64>,
}

/// Immutable-after-load registry of skills.
#[derive(Debug)]
pub struct SkillRegistry {
    skills: HashMap<String, Skill>,
}

impl SkillRegistry {
    /// Load skills from the default sources for this config.
    pub fn load(config: &Config) -> Self {
        Self::load_from(config, default_sources(config))
    }

    /// Load from an explicit source list (tests inject temp dirs here).
    pub fn load_from(config: &Config, mut sources: Vec<SkillSource>) -> Self {
        // Reverse priority order: later (higher-precedence) writes
        // overwrite earlier ones in the map.
        sources.sort_by(|a, b| b.priority.cmp(&a.priority));

        let mut skills: HashMap<String, Skill> = HashMap::new();
        for source in &sources {
            if config
                .project
                .ignore_skill_sources
                .iter()
                .any(|label| label == source.label)
            {
                debug!(source = source.label, "skill source ignored by config");
                continue;
            }
            match &source.dir {
                None => {
                    for (name, content) in BUILTIN_SKILLS {
                        match parse_skill(
                            content,
                            name,
                            format!("{BUILTIN_SCHEME}{name}"),
                            source.priority,
                        ) {
                            Ok(skill) => {
                                skills.insert(skill.name.clone(), skill);
                            }
                            Err(e) => warn!(name, error = %e, "failed to parse built-in skill"),
                        }
                    }
                }
                Some(dir) => scan_directory(config, dir, source, &mut skills),
            }
        }

        // Config overrides, applied after all sources have loaded.
        for (name, overrides) in &config.skills {
            if let Some(skill) = skills.get_mut(name) {
                skill.apply_override(overrides);
            }
        }

        debug!(count = skills.len(), "skill registry loaded");
        Self { skills }
    }

    pub fn get(&self, name: &str) -> Option<&Skill> {
        self.skills.get(name)
    }

    pub fn len(&self) -> usize {
        self.skills.len()
    }

    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
    }

    /// All skill names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.skills.keys().cloned().collect();
        names.sort();
        names
    }

    /// Resolve a skill plus the options its invocation should run with.
    pub fn skill_for_run(&self, config: &Config, name: &str) -> Option<(Skill, RunOptions)> {
        let skill = self.skills.get(name)?.clone();
        let options = match config.runtime.default {
            RuntimeKind::Claude => {
                let claude = &config.runtime.claude;
                RunOptions {
                    runtime: RuntimeKind::Claude,
                    model: skill.model.clone().unwrap_or_else(|| claude.model.clone()),
                    allowed_tools: if skill.allowed_tools.is_empty() {
                        claude.allowed_tools.clone()
                    } else {
                        skill.allowed_tools.clone()
                    },
                    max_turns: claude.max_turns,
                    permission_mode: Some(claude.permission_mode),
                    agent: None,
                    timeout: skill.timeout,
                }
            }
            RuntimeKind::Opencode => {
                let opencode = &config.runtime.opencode;
                RunOptions {
                    runtime: RuntimeKind::Opencode,
                    model: skill
                        .model
                        .clone()
                        .unwrap_or_else(|| opencode.model.clone()),
                    allowed_tools: Vec::new(),
                    max_turns: None,
                    permission_mode: None,
                    agent: opencode.agent.clone(),
                    timeout: skill.timeout,
                }
            }
        };
        Some((skill, options))
    }
}

/// Scan one `<dir>/*/SKILL.md` source into the map. A skill name marked
/// `ignore` in config is excluded here unless the source is priority 0
/// (project-agtop); built-ins are handled separately and also never
/// hidden.
fn scan_directory(
    config: &Config,
    dir: &std::path::Path,
    source: &SkillSource,
    skills: &mut HashMap<String, Skill>,
) {
    let ignorable = source.priority >= 1 && source.priority <= 6;
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };

    for entry in entries.filter_map(std::result::Result::ok) {
        let skill_dir = entry.path();
        if !skill_dir.is_dir() {
            continue;
        }
        let skill_md = skill_dir.join("SKILL.md");
        if !skill_md.exists() {
            continue;
        }
        let fallback_name = skill_dir
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();

        let content = match std::fs::read_to_string(&skill_md) {
            Ok(content) => content,
            Err(e) => {
                warn!(path = %skill_md.display(), error = %e, "failed to read SKILL.md");
                continue;
            }
        };

        match parse_skill(
            &content,
            &fallback_name,
            skill_md.to_string_lossy().into_owned(),
            source.priority,
        ) {
            Ok(skill) => {
                if ignorable
                    && config
                        .skills
                        .get(&skill.name)
                        .is_some_and(|overrides| overrides.is_ignored())
                {
                    debug!(name = %skill.name, source = source.label, "skill ignored by config");
                    continue;
                }
                skills.insert(skill.name.clone(), skill);
            }
            Err(e) => {
                warn!(path = %skill_md.display(), error = %e, "skipping malformed skill");
            }
        }
    }
}
