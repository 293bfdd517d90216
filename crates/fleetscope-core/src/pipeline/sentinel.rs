//! "Not applicable" detection for step output.
//!
//! A step whose entire answer is a bail-out marker is still recorded, but
//! contributes nothing to downstream context.

use std::sync::LazyLock;

use regex::Regex;

static NOT_APPLICABLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^\s*(?:not applicable|n/?a|no database(?:s)?(?: detected| found| used)?|none found|nothing found)\s*\.?\s*$",
    )
    .expect("sentinel pattern is valid")
});

/// True when `content` consists only of a not-applicable marker.
pub fn is_not_applicable(content: &str) -> bool {
    let trimmed = content.trim().trim_matches(|c| c == '*' || c == '_' || c == '`');
    trimmed.is_empty() || NOT_APPLICABLE.is_match(trimmed)
}
