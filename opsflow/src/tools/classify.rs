//! Failure classification for external command output.

use crate::errors::ErrorKind;
use regex::RegexSet;
use std::sync::OnceLock;

/// Patterns that mark a command failure as fatal. Credentials and
/// permissions do not fix themselves; retrying only burns the budget.
const FATAL_PATTERNS: &[&str] = &[
    r"(?i)authentication fail",
    r"(?i)authorization fail",
    r"(?i)invalid credentials",
    r"(?i)permission denied",
    r"(?i)invalid client secret",
];

fn fatal_set() -> &'static RegexSet {
    static SET: OnceLock<RegexSet> = OnceLock::new();
    SET.get_or_init(|| RegexSet::new(FATAL_PATTERNS).unwrap_or_else(|_| RegexSet::empty()))
}

/// Classifies a command failure message.
///
/// Credential and permission failures are [`ErrorKind::Fatal`];
/// everything else defaults to [`ErrorKind::Transient`] and is left to
/// the retry policy.
#[must_use]
pub fn classify_command_failure(message: &str) -> ErrorKind {
    if fatal_set().is_match(message) {
        ErrorKind::Fatal
    } else {
        ErrorKind::Transient
    }
}
