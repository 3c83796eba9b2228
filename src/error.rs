/*
 * Call Insights - Rust Edition
 * Copyright (c) 2025 Call Insights Contributors
 *
 * This work is licensed under the Creative Commons Attribution-NonCommercial 4.0 International License.
 * To view a copy of this license, visit http://creativecommons.org/licenses/by-nc/4.0/
 *
 * You are free to share and adapt this work for non-commercial purposes with attribution.
 * Commercial use is prohibited without explicit written permission.
 *
 * For commercial licensing inquiries, please contact the project maintainers.
 */

use thiserror::Error;

/// Errors shared across the workers and the audio pipeline.
///
/// The broker-related variants must stay distinguishable: the retry wrapper
/// only ever retries `RateLimitExceeded`, and `RequestTooLarge` is permanent
/// for the current window.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// A prompt template referenced a variable that was not supplied.
    #[error("missing template variable: {0}")]
    Template(String),

    /// The broker denied admission because the minute budget is exhausted.
    /// Carries the broker's hint about when the window resets.
    #[error("rate limit exceeded, window resets in {reset_seconds}s")]
    RateLimitExceeded { reset_seconds: u64 },

    /// The estimate alone exceeds the per-window ceiling; retrying within
    /// this window can never succeed.
    #[error("request of {estimated} tokens exceeds the per-minute ceiling of {limit}")]
    RequestTooLarge { estimated: u64, limit: u64 },

    /// Transient remote failure (HTTP error, connection reset, bad payload).
    #[error("backend error: {0}")]
    Backend(String),

    /// A pipeline stage failed; the orchestrator short-circuits on this.
    #[error("stage '{stage}' failed: {reason}")]
    Stage { stage: String, reason: String },

    /// The handler exceeded its wall-clock budget.
    #[error("handler timed out after {0}s")]
    Timeout(u64),

    /// The bus payload could not be parsed into the family's input envelope.
    #[error("malformed input: {0}")]
    MalformedInput(String),
}

impl WorkerError {
    pub fn stage(stage: &str, reason: impl Into<String>) -> Self {
        Self::Stage {
            stage: stage.to_string(),
            reason: reason.into(),
        }
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Self::RateLimitExceeded { .. })
    }
}
