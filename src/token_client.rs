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

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::broker::{BrokerStatus, LockOutcome, TokenBudgetBroker};

// Wire shapes of the broker API. The broker runs embedded today; keeping the
// request/response types serde-ready lets the same client front a standalone
// deployment without touching callers.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRequest {
    pub app_id: String,
    pub estimated_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockResponse {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub reset_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitRequest {
    pub app_id: String,
    pub request_id: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseRequest {
    pub app_id: String,
    pub request_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub available_tokens: u64,
    pub used_tokens: u64,
    pub locked_tokens: u64,
    pub reset_time_seconds: u64,
}

impl From<BrokerStatus> for StatusResponse {
    fn from(status: BrokerStatus) -> Self {
        Self {
            available_tokens: status.available_tokens,
            used_tokens: status.used_tokens,
            locked_tokens: status.locked_tokens,
            reset_time_seconds: status.reset_time_seconds,
        }
    }
}

/// In-process proxy to the token budget broker, bound to one `app_id`.
///
/// Preserves the broker's denial reason verbatim so callers can tell a
/// retryable rate-limit denial from a permanently oversized request.
#[derive(Clone)]
pub struct TokenClient {
    app_id: String,
    broker: Arc<TokenBudgetBroker>,
}

impl TokenClient {
    pub fn new(app_id: impl Into<String>, broker: Arc<TokenBudgetBroker>) -> Self {
        Self {
            app_id: app_id.into(),
            broker,
        }
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn tokens_per_minute(&self) -> u64 {
        self.broker.tokens_per_minute()
    }

    pub fn lock_tokens(&self, estimated_tokens: u64) -> LockResponse {
        match self.broker.lock(&self.app_id, estimated_tokens) {
            LockOutcome::Allowed { request_id } => LockResponse {
                allowed: true,
                request_id: Some(request_id),
                reason: None,
                reset_seconds: 0,
            },
            LockOutcome::Denied {
                reason,
                reset_seconds,
            } => LockResponse {
                allowed: false,
                request_id: None,
                reason: Some(reason.to_string()),
                reset_seconds,
            },
        }
    }

    /// Typed view of a denial, for callers that branch on the reason.
    pub fn lock_outcome(&self, estimated_tokens: u64) -> LockOutcome {
        self.broker.lock(&self.app_id, estimated_tokens)
    }

    pub fn report_usage(&self, request_id: &str, prompt_tokens: u64, completion_tokens: u64) -> bool {
        self.broker
            .commit(&self.app_id, request_id, prompt_tokens, completion_tokens)
    }

    pub fn release_tokens(&self, request_id: &str) -> bool {
        self.broker.release(&self.app_id, request_id)
    }

    pub fn get_status(&self) -> StatusResponse {
        self.broker.status().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::DenyReason;

    #[test]
    fn denial_reason_strings_survive_the_client() {
        let broker = Arc::new(TokenBudgetBroker::new(100));
        let client = TokenClient::new("app", broker);

        let denied = client.lock_tokens(101);
        assert!(!denied.allowed);
        assert_eq!(denied.reason.as_deref(), Some("token_limit_exceeded"));

        let ok = client.lock_tokens(60);
        assert!(ok.allowed);
        let denied = client.lock_tokens(60);
        assert_eq!(denied.reason.as_deref(), Some("rate_limit_exceeded"));
    }

    #[test]
    fn typed_outcome_matches_the_wire_reason() {
        let broker = Arc::new(TokenBudgetBroker::new(100));
        let client = TokenClient::new("app", broker);
        client.lock_tokens(90);

        match client.lock_outcome(50) {
            LockOutcome::Denied { reason, .. } => assert_eq!(reason, DenyReason::RateLimitExceeded),
            other => panic!("expected denial, got {other:?}"),
        }
    }

    #[test]
    fn usage_is_reported_under_the_bound_app_id() {
        let broker = Arc::new(TokenBudgetBroker::new(1_000));
        let client = TokenClient::new("app_feedbackform", Arc::clone(&broker));
        let other = TokenClient::new("app_reasoner", broker);

        let response = client.lock_tokens(100);
        let request_id = response.request_id.unwrap();

        // a different app cannot commit or release someone else's reservation
        assert!(!other.report_usage(&request_id, 10, 10));
        assert!(!other.release_tokens(&request_id));
        assert!(client.report_usage(&request_id, 10, 10));
        assert_eq!(client.get_status().used_tokens, 20);
    }
}
