//! Classification and backoff for transient LLM errors.
//!
//! Context-overflow errors are deliberately not retryable here; they are
//! handled by compaction.

use std::sync::LazyLock;

use pi_protocol::RetryConfig;
use regex::Regex;
use regex::RegexBuilder;

#[allow(clippy::expect_used)]
fn ci(pattern: &str) -> Regex {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .expect("static retry pattern")
}

static RETRYABLE: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        ci(r"overloaded"),
        ci(r"rate ?limit"),
        ci(r"usage ?limit"),
        ci(r"too many requests"),
        ci(r"\b429\b"),
        ci(r"\b50[0-4]\b"),
        ci(r"service ?unavailable"),
        ci(r"server error"),
        ci(r"internal error"),
        ci(r"connection ?error"),
        ci(r"fetch failed"),
    ]
});

static USAGE_LIMIT: LazyLock<Regex> = LazyLock::new(|| ci(r"usage ?limit"));

static RETRY_AFTER_MS: LazyLock<Regex> = LazyLock::new(|| ci(r"retry-after-ms:\s*(\d+)"));
static RETRY_AFTER: LazyLock<Regex> = LazyLock::new(|| ci(r"retry-after:\s*([^\r\n]+)"));
static RESET_MS: LazyLock<Regex> = LazyLock::new(|| ci(r"x-ratelimit-reset-ms:\s*(\d+)"));
static RESET: LazyLock<Regex> = LazyLock::new(|| ci(r"x-ratelimit-reset:\s*(\d+)"));

/// Whether the error text looks like a transient failure worth retrying.
pub fn is_retryable(error: &str) -> bool {
    RETRYABLE.iter().any(|re| re.is_match(error))
}

/// Whether the error is a usage-limit error (may warrant a credential
/// rotation before retrying).
pub fn is_usage_limit(error: &str) -> bool {
    USAGE_LIMIT.is_match(error)
}

/// Server-requested delay parsed out of the error text, in milliseconds.
///
/// Recognises `retry-after-ms: N`, `retry-after: N` (seconds or an HTTP
/// date), `x-ratelimit-reset-ms: N`, and `x-ratelimit-reset: N` (unix
/// seconds). Absolute times are measured against the wall clock; values in
/// the past yield zero.
pub fn parse_retry_after(error: &str) -> Option<i64> {
    if let Some(caps) = RETRY_AFTER_MS.captures(error) {
        return caps[1].parse::<i64>().ok();
    }
    if let Some(caps) = RETRY_AFTER.captures(error) {
        let value = caps[1].trim();
        if let Ok(seconds) = value.parse::<i64>() {
            return Some(seconds.saturating_mul(1_000));
        }
        if let Ok(date) = chrono::DateTime::parse_from_rfc2822(value) {
            let delta = date.timestamp_millis() - chrono::Utc::now().timestamp_millis();
            return Some(delta.max(0));
        }
    }
    if let Some(caps) = RESET_MS.captures(error) {
        return caps[1].parse::<i64>().ok();
    }
    if let Some(caps) = RESET.captures(error) {
        if let Ok(unix_seconds) = caps[1].parse::<i64>() {
            let delta = unix_seconds.saturating_mul(1_000) - chrono::Utc::now().timestamp_millis();
            return Some(delta.max(0));
        }
    }
    None
}

/// Backoff delay for an attempt: exponential base, raised to any
/// server-requested delay found in the error text.
pub fn compute_delay(config: &RetryConfig, attempt: i32, error: &str) -> i64 {
    let backoff = config.backoff_delay_ms(attempt);
    match parse_retry_after(error) {
        Some(requested) => backoff.max(requested),
        None => backoff,
    }
}

/// Hook into a credential store that may switch to a fresh credential on
/// usage-limit errors. A reported switch zeroes the retry delay.
pub trait CredentialCycler: Send + Sync {
    /// Attempt to rotate credentials; returns true if a switch occurred.
    fn try_rotate(&self) -> bool;
}

#[cfg(test)]
#[path = "retry.test.rs"]
mod tests;
