use pretty_assertions::assert_eq;

use super::*;

#[test]
fn classifies_transient_errors() {
    for error in [
        "Overloaded",
        "rate limit exceeded",
        "ratelimit hit",
        "usage limit reached",
        "Too Many Requests",
        "HTTP 429",
        "got 503 from upstream",
        "Service Unavailable",
        "internal error, try again",
        "connection error: reset by peer",
        "fetch failed",
    ] {
        assert!(is_retryable(error), "{error} should be retryable");
    }
}

#[test]
fn non_transient_errors_are_not_retryable() {
    for error in [
        "invalid api key",
        "model not found",
        "prompt is too long: 210000 tokens > 200000 maximum",
        "bad request",
    ] {
        assert!(!is_retryable(error), "{error} should not be retryable");
    }
}

#[test]
fn usage_limit_detection() {
    assert!(is_usage_limit("monthly usage limit reached"));
    assert!(is_usage_limit("usagelimit"));
    assert!(!is_usage_limit("rate limit"));
}

#[test]
fn parses_retry_after_ms() {
    assert_eq!(
        parse_retry_after("429 retry-after-ms: 1500 please"),
        Some(1500)
    );
}

#[test]
fn parses_retry_after_seconds() {
    assert_eq!(parse_retry_after("retry-after: 12"), Some(12_000));
}

#[test]
fn parses_retry_after_http_date_in_past_as_zero() {
    assert_eq!(
        parse_retry_after("retry-after: Wed, 21 Oct 2015 07:28:00 GMT"),
        Some(0)
    );
}

#[test]
fn parses_ratelimit_reset_ms() {
    assert_eq!(
        parse_retry_after("x-ratelimit-reset-ms: 2500"),
        Some(2500)
    );
}

#[test]
fn past_unix_reset_clamps_to_zero() {
    assert_eq!(parse_retry_after("x-ratelimit-reset: 1500000000"), Some(0));
}

#[test]
fn compute_delay_takes_max_of_backoff_and_server_request() {
    let config = pi_protocol::RetryConfig {
        base_delay_ms: 1_000,
        max_retries: 5,
    };
    // Backoff dominates.
    assert_eq!(compute_delay(&config, 3, "overloaded"), 4_000);
    // Server request dominates.
    assert_eq!(
        compute_delay(&config, 1, "overloaded retry-after-ms: 9000"),
        9_000
    );
}
