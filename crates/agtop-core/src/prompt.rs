//! Prompt assembly.
//!
//! The final prompt is the skill body, an optional safety section, a
//! context section, and the task, in that order.

use crate::skills::Skill;
use std::fmt::Write as _;
use std::path::PathBuf;

/// Per-invocation context woven into the prompt.
#[derive(Debug, Clone, Default)]
pub struct PromptContext {
    pub work_dir: PathBuf,
    pub branch: String,
    /// Result text of the previous skill, if any.
    pub previous_output: String,
    pub user_prompt: String,
    pub safety_patterns: Vec<String>,
    /// Offered to the route skill only.
    pub workflow_names: Vec<String>,
    pub spec_file: Option<PathBuf>,
    pub modified_files: Vec<String>,
}

/// Utility skills whose task line is fixed; the raw user prompt never
/// reaches them.
const UTILITY_TASKS: [(&str, &str); 4] = [
    (
        "test",
        "Run the project's test suite and fix any failures you find.",
    ),
    (
        "commit",
        "Commit all outstanding changes with a concise, descriptive message.",
    ),
    (
        "review",
        "Review the changes on this branch and output a JSON verdict of the form {\"success\": true} or {\"success\": false} with brief notes.",
    ),
    (
        "document",
        "Update project documentation to cover the changes on this branch.",
    ),
];

fn task_for(skill_name: &str, user_prompt: &str) -> String {
    UTILITY_TASKS
        .iter()
        .find(|(name, _)| *name == skill_name)
        .map_or_else(|| user_prompt.to_string(), |(_, task)| (*task).to_string())
}

/// Assemble the final prompt for one skill invocation.
pub fn build_prompt(skill: &Skill, ctx: &PromptContext) -> String {
    let mut out = String::with_capacity(skill.content.len() + 512);
    out.push_str(&skill.content);

    if !ctx.safety_patterns.is_empty() {
        out.push_str("\n\n## Safety Constraints\n\nNever run commands matching these patterns:\n");
        for pattern in &ctx.safety_patterns {
            let _ = writeln!(out, "- `{pattern}`");
        }
        out.push_str(
            "If a required action matches a blocked pattern, stop and report it instead of working around it.",
        );
    }

    out.push_str("\n\n## Context\n\n");
    let _ = writeln!(out, "Working directory: {}", ctx.work_dir.display());
    let _ = writeln!(out, "Branch: {}", ctx.branch);
    if let Some(spec) = &ctx.spec_file {
        let _ = writeln!(out, "Spec file: {}", spec.display());
    }
    if !ctx.modified_files.is_empty() {
        let _ = writeln!(
            out,
            "Files modified by previous step: {}",
            ctx.modified_files.join(", ")
        );
    }
    if !ctx.workflow_names.is_empty() {
        let _ = writeln!(out, "Available workflows: {}", ctx.workflow_names.join(", "));
    }
    if !ctx.previous_output.is_empty() {
        out.push_str("\nPrevious skill output:\n");
        out.push_str(&ctx.previous_output);
        out.push('\n');
    }

    out.push_str("\n## Task\n\n");
    out.push_str(&task_for(&skill.name, &ctx.user_prompt));
    out
}

/// Assemble a prompt with no skill body: safety, context, and task only.
/// Used for quick-fix and follow-up invocations.
pub fn build_minimal_prompt(ctx: &PromptContext) -> String {
    let skill = Skill {
        name: String::new(),
        description: String::new(),
        model: None,
        timeout: None,
        parallel: false,
        allowed_tools: Vec::new(),
        content: "Make the change described in the task below.".to_string(),
        source: String::new(),
        priority: 0,
    };
    build_prompt(&skill, ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skills::parse_skill;

    fn skill(name: &str) -> Skill {
        parse_skill(
            &format!("---\nname: {name}\n---\nBody for {name}."),
            name,
            "test",
            0,
        )
        .unwrap()
    }

    fn ctx() -> PromptContext {
        PromptContext {
            work_dir: PathBuf::from("/work/042"),
            branch: "agtop/042".to_string(),
            user_prompt: "Add dark mode".to_string(),
            ..PromptContext::default()
        }
    }

    #[test]
    fn body_comes_first_then_context_then_task() {
        let prompt = build_prompt(&skill("build"), &ctx());
        assert!(prompt.starts_with("Body for build."));
        let context_at = prompt.find("## Context").unwrap();
        let task_at = prompt.find("## Task").unwrap();
        assert!(context_at < task_at);
        assert!(prompt.contains("Working directory: /work/042"));
        assert!(prompt.contains("Branch: agtop/042"));
        assert!(prompt.ends_with("Add dark mode"));
    }

    #[test]
    fn safety_section_only_with_patterns() {
        let mut c = ctx();
        assert!(!build_prompt(&skill("build"), &c).contains("## Safety Constraints"));

        c.safety_patterns = vec!["rm -rf".to_string(), "git push --force".to_string()];
        let prompt = build_prompt(&skill("build"), &c);
        assert!(prompt.contains("## Safety Constraints"));
        assert!(prompt.contains("- `rm -rf`"));
        assert!(prompt.contains("- `git push --force`"));
        assert!(prompt.contains("stop and report"));
        // Safety sits between the body and the context.
        assert!(prompt.find("## Safety Constraints").unwrap() < prompt.find("## Context").unwrap());
    }

    #[test]
    fn workflows_listed_only_when_present() {
        let mut c = ctx();
        assert!(!build_prompt(&skill("route"), &c).contains("Available workflows"));

        c.workflow_names = vec!["build".to_string(), "sdlc".to_string()];
        let prompt = build_prompt(&skill("route"), &c);
        assert!(prompt.contains("Available workflows: build, sdlc"));
    }

    #[test]
    fn previous_output_block_is_optional() {
        let mut c = ctx();
        assert!(!build_prompt(&skill("build"), &c).contains("Previous skill output"));

        c.previous_output = "plan: three steps".to_string();
        let prompt = build_prompt(&skill("build"), &c);
        assert!(prompt.contains("Previous skill output:\nplan: three steps"));
    }

    #[test]
    fn spec_file_and_modified_files_are_optional() {
        let mut c = ctx();
        c.spec_file = Some(PathBuf::from("/work/042/SPEC.md"));
        c.modified_files = vec!["src/a.rs".to_string(), "src/b.rs".to_string()];
        let prompt = build_prompt(&skill("build"), &c);
        assert!(prompt.contains("Spec file: /work/042/SPEC.md"));
        assert!(prompt.contains("Files modified by previous step: src/a.rs, src/b.rs"));
    }

    #[test]
    fn minimal_prompt_has_context_and_task() {
        let mut c = ctx();
        c.safety_patterns = vec!["rm -rf".to_string()];
        let prompt = build_minimal_prompt(&c);
        assert!(prompt.contains("## Safety Constraints"));
        assert!(prompt.contains("## Context"));
        assert!(prompt.contains("## Task"));
        assert!(prompt.ends_with("Add dark mode"));
    }

    #[test]
    fn utility_skills_get_fixed_tasks() {
        for name in ["test", "commit", "review", "document"] {
            let prompt = build_prompt(&skill(name), &ctx());
            assert!(
                !prompt.contains("Add dark mode"),
                "{name} leaked the user prompt"
            );
            assert!(prompt.contains("## Task"));
        }
        // Review asks for the JSON verdict shape.
        let prompt = build_prompt(&skill("review"), &ctx());
        assert!(prompt.contains("{\"success\": true}"));
    }
}
