//! Configuration types shared between the loop, compaction, and retry.

use serde::Deserialize;
use serde::Serialize;

use crate::queue::QueueMode;

/// Which flavour of the edit tool the loop exposes.
///
/// Only `hashline` is implemented in-core; the other values parse so outer
/// layers can reserve them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditVariant {
    Replace,
    Patch,
    Hashline,
    #[default]
    Auto,
}

impl EditVariant {
    /// Parse from the `PI_EDIT_VARIANT` environment variable.
    ///
    /// Unknown values fall back to `Auto`.
    pub fn from_env() -> Self {
        match std::env::var("PI_EDIT_VARIANT").as_deref() {
            Ok("replace") => EditVariant::Replace,
            Ok("patch") => EditVariant::Patch,
            Ok("hashline") => EditVariant::Hashline,
            _ => EditVariant::Auto,
        }
    }
}

/// Configuration for the agent loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopConfig {
    /// Maximum turns before stopping (None = unlimited).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_turns: Option<i32>,
    /// How queued user messages are drained.
    #[serde(default)]
    pub queue_mode: QueueMode,
    /// Edit tool flavour.
    #[serde(default)]
    pub edit_variant: EditVariant,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_turns: None,
            queue_mode: QueueMode::default(),
            edit_variant: EditVariant::default(),
        }
    }
}

/// Configuration for the compaction engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactConfig {
    /// Usage ratio of the context window that triggers auto-compaction.
    pub threshold_ratio: f64,
    /// Usage ratio that emits a context-usage warning.
    pub warning_ratio: f64,
    /// Minimum estimated tokens the summarized prefix must hold; below this
    /// compaction is skipped.
    pub min_tokens_to_summarize: i64,
    /// Number of trailing turns kept verbatim after a splice.
    pub keep_recent_turns: usize,
    /// Tool results older than this many turns are eligible for pruning.
    pub prune_retention_turns: usize,
    /// Tool result text larger than this is truncated during pruning.
    pub prune_max_tool_result_chars: usize,
    /// Maximum retry attempts for the summarization call.
    pub max_retries: i32,
    /// Inject "Continue if you have next steps." after an auto-compaction.
    pub inject_continuation: bool,
}

impl Default for CompactConfig {
    fn default() -> Self {
        Self {
            threshold_ratio: 0.75,
            warning_ratio: 0.6,
            min_tokens_to_summarize: 4_000,
            keep_recent_turns: 5,
            prune_retention_turns: 5,
            prune_max_tool_result_chars: 20_000,
            max_retries: 3,
            inject_continuation: true,
        }
    }
}

impl CompactConfig {
    /// Token count at which auto-compaction triggers.
    pub fn threshold_tokens(&self, context_window: i64) -> i64 {
        (context_window as f64 * self.threshold_ratio) as i64
    }

    /// Token count at which the usage warning fires.
    pub fn warning_tokens(&self, context_window: i64) -> i64 {
        (context_window as f64 * self.warning_ratio) as i64
    }
}

/// Configuration for transient-error retry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Base delay for exponential backoff, in milliseconds.
    pub base_delay_ms: i64,
    /// Maximum retry attempts before giving up.
    pub max_retries: i32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 2_000,
            max_retries: 5,
        }
    }
}

impl RetryConfig {
    /// Exponential backoff delay for a 1-indexed attempt.
    pub fn backoff_delay_ms(&self, attempt: i32) -> i64 {
        self.base_delay_ms.saturating_mul(1_i64 << (attempt - 1).clamp(0, 32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_defaults_sit_in_band() {
        let config = CompactConfig::default();
        assert!(config.threshold_ratio >= 0.7 && config.threshold_ratio <= 0.8);
        assert!(config.warning_ratio < config.threshold_ratio);
        assert_eq!(config.threshold_tokens(200_000), 150_000);
        assert_eq!(config.warning_tokens(200_000), 120_000);
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let config = RetryConfig::default();
        assert_eq!(config.backoff_delay_ms(1), 2_000);
        assert_eq!(config.backoff_delay_ms(2), 4_000);
        assert_eq!(config.backoff_delay_ms(3), 8_000);
    }

    #[test]
    fn edit_variant_parses_known_values() {
        assert_eq!(
            serde_json::from_str::<EditVariant>("\"hashline\"").unwrap(),
            EditVariant::Hashline
        );
        assert_eq!(EditVariant::default(), EditVariant::Auto);
    }
}
