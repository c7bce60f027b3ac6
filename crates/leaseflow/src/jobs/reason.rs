//! Failure text written to `failed_reason`.
//!
//! The column holds at most [`MAX_REASON_CHARS`] characters. Writers truncate
//! instead of failing so a long diagnostic can never block a state transition.

pub const MAX_REASON_CHARS: usize = 65_000;

pub const WATCHDOG_TIMEOUT: &str = "watchdog_timeout";

pub const UNSPECIFIED_FAILURE: &str = "unspecified_failure";

pub const SEPARATOR: &str = " | ";

/// Prepare a caller-supplied reason for storage.
///
/// NUL characters are dropped (PostgreSQL rejects them in TEXT) and the result
/// is cut to `MAX_REASON_CHARS` characters. Never returns an empty string.
pub fn sanitize(reason: &str) -> String {
    let cleaned: String = reason
        .chars()
        .filter(|c| *c != '\0')
        .take(MAX_REASON_CHARS)
        .collect();

    if cleaned.trim().is_empty() {
        UNSPECIFIED_FAILURE.to_string()
    } else {
        cleaned
    }
}

/// Append `marker` to an earlier reason, trimming the earlier text so the
/// marker itself always fits.
pub fn append(prior: Option<&str>, marker: &str) -> String {
    let prior = prior.filter(|p| !p.is_empty());
    let Some(prior) = prior else {
        return sanitize(marker);
    };

    let budget = MAX_REASON_CHARS
        .saturating_sub(marker.chars().count())
        .saturating_sub(SEPARATOR.chars().count());

    let mut out: String = prior.chars().filter(|c| *c != '\0').take(budget).collect();
    out.push_str(SEPARATOR);
    out.push_str(marker);
    out
}
