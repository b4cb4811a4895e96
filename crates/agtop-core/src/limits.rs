//! Per-run limit checks and rate-limit detection.

use crate::config::LimitsConfig;
use regex::Regex;
use std::sync::OnceLock;

/// Phrases the hosted agent CLIs emit when throttled.
const RATE_LIMIT_PATTERN: &str =
    r"(?i)(rate.?limit|too many requests|\b429\b|overloaded|quota exceeded)";

fn rate_limit_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(RATE_LIMIT_PATTERN).expect("constant pattern parses"))
}

/// Checks per-run ceilings and classifies transient rate-limit errors.
#[derive(Debug, Clone)]
pub struct LimitChecker {
    max_tokens: u64,
    max_cost: f64,
}

impl LimitChecker {
    pub fn new(limits: &LimitsConfig) -> Self {
        Self {
            max_tokens: limits.max_tokens_per_run,
            max_cost: limits.max_cost_per_run,
        }
    }

    /// Whether an error message looks like a provider rate limit and the
    /// invocation is worth retrying after a backoff.
    pub fn is_rate_limit(&self, error_text: &str) -> bool {
        rate_limit_regex().is_match(error_text)
    }

    pub fn tokens_exceeded(&self, tokens: u64) -> bool {
        tokens > self.max_tokens
    }

    pub fn cost_exceeded(&self, cost: f64) -> bool {
        cost > self.max_cost
    }
}

impl Default for LimitChecker {
    fn default() -> Self {
        Self::new(&LimitsConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_rate_limit_phrasings() {
        let checker = LimitChecker::default();
        assert!(checker.is_rate_limit("API error: rate limit exceeded"));
        assert!(checker.is_rate_limit("Rate-limited, retry later"));
        assert!(checker.is_rate_limit("HTTP 429 from upstream"));
        assert!(checker.is_rate_limit("model is overloaded"));
        assert!(checker.is_rate_limit("Quota exceeded for this billing period"));
    }

    #[test]
    fn ignores_ordinary_failures() {
        let checker = LimitChecker::default();
        assert!(!checker.is_rate_limit("compile error in src/main.rs"));
        assert!(!checker.is_rate_limit("process exited with code 1"));
        assert!(!checker.is_rate_limit("file not found: 4290.txt"));
    }

    #[test]
    fn ceilings() {
        let checker = LimitChecker::new(&LimitsConfig {
            max_tokens_per_run: 1000,
            max_cost_per_run: 2.0,
            ..LimitsConfig::default()
        });
        assert!(!checker.tokens_exceeded(1000));
        assert!(checker.tokens_exceeded(1001));
        assert!(!checker.cost_exceeded(2.0));
        assert!(checker.cost_exceeded(2.01));
    }
}
