//! CI check-result parsing.
//!
//! The host's PR tool reports checks as a JSON array of
//! `{name, state, conclusion}`. An empty list (or empty output) counts as
//! passing; unknown conclusions like `NEUTRAL` and `SKIPPED` pass too.

use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CheckRun {
    name: String,
    state: String,
    conclusion: String,
}

/// Classified poll result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckSummary {
    pub all_passed: bool,
    pub pending: Vec<String>,
    pub failed: Vec<String>,
}

fn is_pending(state: &str) -> bool {
    matches!(state, "PENDING" | "QUEUED" | "IN_PROGRESS")
}

fn is_failed(conclusion: &str) -> bool {
    matches!(conclusion, "FAILURE" | "TIMED_OUT" | "CANCELLED")
}

/// Parse one poll of check results. Parse errors surface as a synthetic
/// failed entry so the fix loop sees them instead of looping forever.
pub fn parse_check_results(json: &str) -> CheckSummary {
    let trimmed = json.trim();
    if trimmed.is_empty() {
        return CheckSummary {
            all_passed: true,
            ..CheckSummary::default()
        };
    }

    let checks: Vec<CheckRun> = match serde_json::from_str(trimmed) {
        Ok(checks) => checks,
        Err(e) => {
            return CheckSummary {
                all_passed: false,
                pending: Vec::new(),
                failed: vec![format!("parse error: {e}")],
            };
        }
    };

    let mut pending = Vec::new();
    let mut failed = Vec::new();
    for check in &checks {
        if is_pending(&check.state) {
            pending.push(check.name.clone());
        } else if is_failed(&check.conclusion) {
            failed.push(check.name.clone());
        }
    }

    CheckSummary {
        all_passed: pending.is_empty() && failed.is_empty(),
        pending,
        failed,
    }
}
