//! Skill definitions and SKILL.md frontmatter parsing.
//!
//! A skill file is optional YAML-ish frontmatter delimited by lines of
//! exactly three dashes, followed by the prompt body. Missing or
//! unterminated frontmatter is not an error: the whole file becomes the
//! body and the name falls back to the parent directory's basename.
//! Malformed frontmatter fails only that file; the registry skips it
//! with a warning.

use crate::config::SkillOverride;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Source scheme for embedded built-in skills.
pub const BUILTIN_SCHEME: &str = "builtin://";

#[derive(Debug, Error)]
pub enum SkillError {
    #[error("invalid frontmatter: {0}")]
    Frontmatter(String),
    #[error("skill has no name")]
    MissingName,
}

/// A named unit of agent work: one markdown file, one child process per
/// invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Skill {
    pub name: String,
    pub description: String,
    pub model: Option<String>,
    /// Timeout in seconds for one invocation.
    pub timeout: Option<u64>,
    pub parallel: bool,
    pub allowed_tools: Vec<String>,
    /// Prompt body.
    pub content: String,
    /// Origin path, or `builtin://<name>` for embedded skills.
    pub source: String,
    /// Source priority; lower wins.
    pub priority: u8,
}

impl Skill {
    /// Apply config overrides: a present value always applies, absence
    /// never does. Empty strings and lists count as absent.
    pub fn apply_override(&mut self, overrides: &SkillOverride) {
        if let Some(model) = &overrides.model {
            if !model.is_empty() {
                self.model = Some(model.clone());
            }
        }
        if let Some(timeout) = overrides.timeout {
            if timeout > 0 {
                self.timeout = Some(timeout);
            }
        }
        if let Some(parallel) = overrides.parallel {
            self.parallel = parallel;
        }
        if let Some(tools) = &overrides.allowed_tools {
            if !tools.is_empty() {
                self.allowed_tools = tools.clone();
            }
        }
    }
}

/// Frontmatter fields as written in SKILL.md.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawFrontmatter {
    name: Option<String>,
    description: Option<String>,
    model: Option<String>,
    timeout: Option<u64>,
    parallel: Option<bool>,
    #[serde(rename = "allowed-tools", alias = "allowed_tools")]
    allowed_tools: Option<ToolList>,
}

/// `allowed-tools` accepts either a YAML list or a space-delimited string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ToolList {
    List(Vec<String>),
    Spaced(String),
}

impl ToolList {
    fn into_vec(self) -> Vec<String> {
        match self {
            Self::List(list) => list,
            Self::Spaced(s) => s.split_whitespace().map(String::from).collect(),
        }
    }
}

/// Split content into `(frontmatter, body)`.
///
/// Returns `None` for the frontmatter when the opening or closing `---`
/// line is absent; the body is then the whole content.
fn split_frontmatter(content: &str) -> (Option<&str>, &str) {
    let mut lines = content.split_inclusive('\n');
    let Some(first) = lines.next() else {
        return (None, content);
    };
    if first.trim_end() != "---" {
        return (None, content);
    }

    let after_open = &content[first.len()..];
    let mut offset = 0;
    for line in after_open.split_inclusive('\n') {
        if line.trim_end() == "---" {
            let frontmatter = &after_open[..offset];
            let body = &after_open[offset + line.len()..];
            return (Some(frontmatter), body);
        }
        offset += line.len();
    }

    // Unterminated frontmatter: treat the whole file as body.
    (None, content)
}

/// Parse a skill file. `fallback_name` is the parent directory's
/// basename; `source` records where the file came from.
pub fn parse_skill(
    content: &str,
    fallback_name: &str,
    source: impl Into<String>,
    priority: u8,
) -> Result<Skill, SkillError> {
    let (frontmatter, body) = split_frontmatter(content);

    let raw = match frontmatter {
        None => RawFrontmatter::default(),
        Some(block) => serde_yaml::from_str::<RawFrontmatter>(block)
            .map_err(|e| SkillError::Frontmatter(e.to_string()))?,
    };

    let name = match raw.name {
        Some(name) if !name.is_empty() => name,
        _ => {
            if fallback_name.is_empty() {
                return Err(SkillError::MissingName);
            }
            fallback_name.to_string()
        }
    };

    Ok(Skill {
        name,
        description: raw.description.unwrap_or_default(),
        model: raw.model.filter(|m| !m.is_empty()),
        timeout: raw.timeout.filter(|t| *t > 0),
        parallel: raw.parallel.unwrap_or(false),
        allowed_tools: raw.allowed_tools.map(ToolList::into_vec).unwrap_or_default(),
        content: body.trim_start_matches('\n').trim_end().to_string(),
        source: source.into(),
        priority,
    })
}
