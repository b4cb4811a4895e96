//! Workflow resolution and agent-output parsing.
//!
//! Maps workflow names to skill lists, parses decompose plans into
//! topologically ordered parallel groups, and recovers workflow names
//! from free-form route output.

use crate::config::Config;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use thiserror::Error;

/// Workflow name that routes to whatever the route skill picks.
pub const AUTO_WORKFLOW: &str = "auto";
/// Workflow name for the single-shot fix path with no skill sequence.
pub const QUICK_FIX_WORKFLOW: &str = "quick-fix";

pub const ROUTE_SKILL: &str = "route";
pub const DECOMPOSE_SKILL: &str = "decompose";
pub const BUILD_SKILL: &str = "build";
pub const COMMIT_SKILL: &str = "commit";
pub const REVIEW_SKILL: &str = "review";

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("unknown workflow: {0}")]
    Unknown(String),
    #[error("workflow {0} has no skills")]
    NoSkills(String),
}

/// Resolve a workflow name to its ordered skill list.
///
/// `auto` maps to `[route]` without consulting config.
pub fn resolve_workflow(config: &Config, name: &str) -> Result<Vec<String>, WorkflowError> {
    if name == AUTO_WORKFLOW {
        return Ok(vec![ROUTE_SKILL.to_string()]);
    }
    let workflow = config
        .workflows
        .get(name)
        .ok_or_else(|| WorkflowError::Unknown(name.to_string()))?;
    if workflow.skills.is_empty() {
        return Err(WorkflowError::NoSkills(name.to_string()));
    }
    Ok(workflow.skills.clone())
}

/// One sub-task from a decompose plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecomposeTask {
    pub name: String,
    pub parallel_group: String,
    pub dependencies: Vec<String>,
}

impl Default for DecomposeTask {
    fn default() -> Self {
        Self {
            name: String::new(),
            parallel_group: String::new(),
            dependencies: Vec::new(),
        }
    }
}

/// Parsed decompose output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecomposeResult {
    pub tasks: Vec<DecomposeTask>,
}

impl DecomposeResult {
    /// Group tasks so that each group's cross-group dependencies appear
    /// in earlier groups.
    ///
    /// Tasks without a `parallel_group` get synthetic singleton groups
    /// keyed `_solo_<i>`. Order comes from a depth-first topological walk
    /// over the deduplicated group dependency graph, with lexicographic
    /// tie-breaking on group names for determinism. Within a group, tasks
    /// keep their source order.
    pub fn group_by_parallel(&self) -> Vec<Vec<DecomposeTask>> {
        let mut group_of: HashMap<&str, String> = HashMap::new();
        let mut groups: BTreeMap<String, Vec<DecomposeTask>> = BTreeMap::new();

        for (i, task) in self.tasks.iter().enumerate() {
            let key = if task.parallel_group.is_empty() {
                format!("_solo_{i}")
            } else {
                task.parallel_group.clone()
            };
            group_of.insert(task.name.as_str(), key.clone());
            groups.entry(key).or_default().push(task.clone());
        }

        // Group-level edges: a group depends on the groups of its tasks'
        // dependencies. Unknown dependency names are ignored.
        let mut deps: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for task in &self.tasks {
            let Some(own) = group_of.get(task.name.as_str()) else {
                continue;
            };
            for dep in &task.dependencies {
                if let Some(dep_group) = group_of.get(dep.as_str()) {
                    if dep_group != own {
                        deps.entry(own.clone()).or_default().insert(dep_group.clone());
                    }
                }
            }
        }

        let mut order = Vec::new();
        let mut visited = BTreeSet::new();
        let mut visiting = BTreeSet::new();
        let names: Vec<String> = groups.keys().cloned().collect();
        for name in &names {
            visit(name, &deps, &mut visited, &mut visiting, &mut order);
        }

        order
            .into_iter()
            .filter_map(|name| groups.remove(&name))
            .collect()
    }
}

fn visit(
    name: &str,
    deps: &BTreeMap<String, BTreeSet<String>>,
    visited: &mut BTreeSet<String>,
    visiting: &mut BTreeSet<String>,
    order: &mut Vec<String>,
) {
    if visited.contains(name) || visiting.contains(name) {
        // Back edges (cycles) are dropped rather than looped on.
        return;
    }
    visiting.insert(name.to_string());
    if let Some(children) = deps.get(name) {
        for child in children {
            visit(child, deps, visited, visiting, order);
        }
    }
    visiting.remove(name);
    visited.insert(name.to_string());
    order.push(name.to_string());
}

/// Parse decompose output: strict JSON first, then the largest embedded
/// object (agents often wrap the plan in prose or fences).
pub fn parse_decompose_result(output: &str) -> Option<DecomposeResult> {
    let trimmed = output.trim();
    if let Ok(result) = serde_json::from_str::<DecomposeResult>(trimmed) {
        return Some(result);
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<DecomposeResult>(&trimmed[start..=end]).ok()
}

#[derive(Debug, Deserialize)]
struct RouteJson {
    workflow: String,
}

/// Recover a workflow name from route-skill output.
///
/// Tries strict JSON (`{"workflow":"name"}`), then scans lines last to
/// first for a bare identifier (surrounding backticks/quotes/asterisks
/// and trailing punctuation stripped), then for a known workflow name
/// embedded in a line of at most four words. Returns an empty string
/// when nothing matches; callers fall back to the build workflow.
pub fn parse_route_result(output: &str, workflows: &[String]) -> String {
    if let Ok(route) = serde_json::from_str::<RouteJson>(output.trim()) {
        if !route.workflow.is_empty() {
            return route.workflow;
        }
    }

    let lines: Vec<&str> = output.lines().collect();

    for line in lines.iter().rev() {
        let candidate = strip_decoration(line);
        if !candidate.is_empty() && is_identifier(candidate) {
            return candidate.to_string();
        }
    }

    // Sentence fallback: a known name inside a short line.
    for line in lines.iter().rev() {
        if line.split_whitespace().count() > 4 {
            continue;
        }
        let lower = line.to_lowercase();
        let best = workflows
            .iter()
            .filter(|w| lower.contains(&w.to_lowercase()))
            .max_by_key(|w| w.len());
        if let Some(found) = best {
            return found.clone();
        }
    }

    String::new()
}

fn strip_decoration(line: &str) -> &str {
    let mut s = line.trim();
    loop {
        let stripped = s
            .trim_matches(['`', '"', '\'', '*'])
            .trim_end_matches(['.', ',', ':', ';', '!', '?']);
        if stripped == s {
            return s;
        }
        s = stripped;
    }
}

fn is_identifier(s: &str) -> bool {
    s.chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Parse a review verdict: a JSON object (whole output or embedded)
/// carrying a boolean `success`. `None` means unparseable.
pub fn parse_review_result(output: &str) -> Option<bool> {
    let trimmed = output.trim();
    if let Some(success) = success_field(trimmed) {
        return Some(success);
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    success_field(&trimmed[start..=end])
}

fn success_field(text: &str) -> Option<bool> {
    serde_json::from_str::<serde_json::Value>(text)
        .ok()?
        .get("success")?
        .as_bool()
}
