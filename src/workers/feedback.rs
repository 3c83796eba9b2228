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

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::WorkerError;
use crate::llm::{LlmClient, ValidatedResponse};
use crate::worker::MessageHandler;

const SCHEMA_RETRIES: usize = 3;

const SYSTEM_PROMPT: &str = "You process customer feedback. Summarize it with all PII removed, \
classify it into one of the provided hashtags, suggest one additional AI hashtag, and report \
whether the original text contains PII or customer identifiers. Respond with JSON only, using \
the keys summary, hashtag, ai_hashtag, contains_pii_or_cid and category.";

const USER_PROMPT: &str = "Available hashtags:\n{hashtag_options}\n\nFeedback ({language}):\n{text}";

lazy_static! {
    static ref HASHTAG: Regex = Regex::new(r"^#\w+$").unwrap();
}

#[derive(Debug, Clone, Deserialize)]
pub struct InputFeedbackForm {
    pub id: String,
    #[serde(rename = "taskId")]
    pub task_id: Option<String>,
    pub language: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutputFeedbackForm {
    pub id: String,
    #[serde(rename = "taskId", skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub hashtag: String,
    pub category: String,
    pub summary: String,
    pub ai_hashtag: String,
    pub message: String,
}

/// The validated LLM response for one feedback item. `contains_pii_or_cid`
/// is logged for auditing but never serialized onto the out-queue.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedbackResponse {
    pub summary: String,
    pub hashtag: String,
    pub ai_hashtag: String,
    pub contains_pii_or_cid: String,
    #[serde(default)]
    pub category: String,
}

impl ValidatedResponse for FeedbackResponse {
    fn validate(&self) -> Result<(), String> {
        if self.summary.len() < 5 || self.summary.len() > 500 {
            return Err(format!(
                "summary length {} outside 5..500",
                self.summary.len()
            ));
        }
        if !HASHTAG.is_match(&self.hashtag) {
            return Err(format!("hashtag '{}' does not match ^#\\w+$", self.hashtag));
        }
        if !HASHTAG.is_match(&self.ai_hashtag) {
            return Err(format!(
                "ai_hashtag '{}' does not match ^#\\w+$",
                self.ai_hashtag
            ));
        }
        if self.contains_pii_or_cid != "Yes" && self.contains_pii_or_cid != "No" {
            return Err(format!(
                "contains_pii_or_cid must be Yes or No, got '{}'",
                self.contains_pii_or_cid
            ));
        }
        Ok(())
    }
}

/// Worker family that classifies feedback-form submissions.
pub struct FeedbackHandler {
    llm: LlmClient,
    hashtag_options: String,
}

impl FeedbackHandler {
    pub fn new(llm: LlmClient, hashtag_options: String) -> Self {
        Self {
            llm,
            hashtag_options,
        }
    }
}

#[async_trait]
impl MessageHandler for FeedbackHandler {
    fn family(&self) -> &str {
        "app_feedbackform"
    }

    async fn handle(&self, raw_message: &str) -> Result<serde_json::Value, WorkerError> {
        let input: InputFeedbackForm = serde_json::from_str(raw_message)
            .map_err(|e| WorkerError::MalformedInput(e.to_string()))?;
        tracing::info!(id = %input.id, "Processing feedback form");

        let mut variables = HashMap::new();
        variables.insert("text".to_string(), input.text.clone());
        variables.insert("language".to_string(), input.language.clone());
        variables.insert("hashtag_options".to_string(), self.hashtag_options.clone());

        let response: FeedbackResponse = self
            .llm
            .structured_prompt(SYSTEM_PROMPT, USER_PROMPT, &variables, SCHEMA_RETRIES)
            .await?;

        // audit trail only; the flag stays off the wire
        tracing::info!(
            id = %input.id,
            contains_pii_or_cid = %response.contains_pii_or_cid,
            "Feedback form processed"
        );

        let output = OutputFeedbackForm {
            id: input.id,
            task_id: input.task_id,
            hashtag: response.hashtag,
            category: response.category,
            summary: response.summary,
            ai_hashtag: response.ai_hashtag,
            message: "SUCCESS".to_string(),
        };

        serde_json::to_value(&output).map_err(|e| WorkerError::Backend(e.to_string()))
    }

    fn failure_envelope(
        &self,
        raw_message: &str,
        error: &WorkerError,
    ) -> Option<serde_json::Value> {
        let parsed: serde_json::Value = serde_json::from_str(raw_message).unwrap_or_default();
        let id = parsed
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();
        let task_id = parsed
            .get("taskId")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let output = OutputFeedbackForm {
            id,
            task_id,
            hashtag: "#error".to_string(),
            category: String::new(),
            summary: format!("Processing error: {error}"),
            ai_hashtag: "#processing_failed".to_string(),
            message: "failed".to_string(),
        };
        serde_json::to_value(&output).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::TokenBudgetBroker;
    use crate::config::LlmConfig;
    use crate::token_client::TokenClient;
    use mockito::Matcher;
    use std::sync::Arc;

    fn valid_response() -> FeedbackResponse {
        FeedbackResponse {
            summary: "Customer loves the new card design".to_string(),
            hashtag: "#product".to_string(),
            ai_hashtag: "#design".to_string(),
            contains_pii_or_cid: "No".to_string(),
            category: "Product".to_string(),
        }
    }

    #[test]
    fn valid_response_passes() {
        assert!(valid_response().validate().is_ok());
    }

    #[test]
    fn short_summary_fails() {
        let mut response = valid_response();
        response.summary = "ok".to_string();
        assert!(response.validate().is_err());
    }

    #[test]
    fn hashtag_must_match_pattern() {
        let mut response = valid_response();
        response.hashtag = "product".to_string();
        assert!(response.validate().is_err());

        response.hashtag = "#with spaces".to_string();
        assert!(response.validate().is_err());
    }

    #[test]
    fn pii_flag_is_yes_or_no() {
        let mut response = valid_response();
        response.contains_pii_or_cid = "Maybe".to_string();
        assert!(response.validate().is_err());
    }

    fn handler(endpoint: &str, tokens_per_minute: u64) -> FeedbackHandler {
        let broker = Arc::new(TokenBudgetBroker::new(tokens_per_minute));
        let llm = LlmClient::new(
            LlmConfig {
                endpoint: endpoint.to_string(),
                deployment: "gpt-4".to_string(),
                api_version: "2024-02-01".to_string(),
                api_key: "test-key".to_string(),
                max_tokens: 100,
                temperature: 0.0,
            },
            TokenClient::new("app_feedbackform", broker),
            1,
        );
        FeedbackHandler::new(llm, "#product: product feedback\n#service: service".to_string())
    }

    #[tokio::test]
    async fn happy_path_produces_a_success_envelope() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/openai/deployments/gpt-4/chat/completions")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(
                serde_json::json!({
                    "choices": [{"message": {"role": "assistant", "content":
                        "{\"summary\": \"Customer loves the new card\", \"hashtag\": \"#product\", \
                         \"ai_hashtag\": \"#design\", \"contains_pii_or_cid\": \"No\", \
                         \"category\": \"Product\"}"}}],
                    "usage": {"prompt_tokens": 50, "completion_tokens": 30}
                })
                .to_string(),
            )
            .create_async()
            .await;

        let handler = handler(&server.url(), 100_000);
        let envelope = handler
            .handle(r#"{"id": "f1", "language": "en", "text": "Love the new card!"}"#)
            .await
            .unwrap();

        assert_eq!(envelope["message"], "SUCCESS");
        assert_eq!(envelope["id"], "f1");
        assert_eq!(envelope["hashtag"], "#product");
        let summary = envelope["summary"].as_str().unwrap();
        assert!(summary.len() >= 5 && summary.len() <= 500);
        // the PII flag never reaches the wire
        assert!(envelope.get("contains_pii_or_cid").is_none());
    }

    #[tokio::test]
    async fn malformed_payload_is_reported_as_such() {
        let server = mockito::Server::new_async().await;
        let handler = handler(&server.url(), 100_000);

        let err = handler.handle("not json at all").await.unwrap_err();
        assert!(matches!(err, WorkerError::MalformedInput(_)));

        let envelope = handler.failure_envelope("not json at all", &err).unwrap();
        assert_eq!(envelope["message"], "failed");
        assert_eq!(envelope["id"], "unknown");
    }

    #[tokio::test]
    async fn oversized_request_fails_without_broker_retries() {
        let server = mockito::Server::new_async().await;
        // completion budget alone exceeds this ceiling
        let handler = handler(&server.url(), 50);

        let raw = r#"{"id": "f2", "taskId": "t9", "language": "en", "text": "hello"}"#;
        let err = handler.handle(raw).await.unwrap_err();
        assert!(matches!(err, WorkerError::RequestTooLarge { .. }));

        let envelope = handler.failure_envelope(raw, &err).unwrap();
        assert_eq!(envelope["message"], "failed");
        assert_eq!(envelope["id"], "f2");
        assert_eq!(envelope["taskId"], "t9");
        assert_eq!(envelope["hashtag"], "#error");
    }
}
