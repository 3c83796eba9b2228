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

const SYSTEM_PROMPT: &str = "You analyse call-centre transcripts. Summarize the call with all \
PII removed, pick the call reason from the provided list, suggest one additional AI reason, and \
report whether the transcript contains PII or customer identifiers. Respond with JSON only, \
using the keys summary, reason, ai_reason and contains_pii_or_cid.";

const USER_PROMPT: &str = "Available reasons:\n{reason_options}\n\nTranscript ({language}):\n{text}";

lazy_static! {
    static ref REASON: Regex = Regex::new(r"^#\w+$").unwrap();
}

#[derive(Debug, Clone, Deserialize)]
pub struct InputReasoner {
    pub id: String,
    #[serde(rename = "taskId")]
    pub task_id: String,
    pub language: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutputReasoner {
    pub id: String,
    #[serde(rename = "taskId")]
    pub task_id: String,
    pub ai_reason: String,
    pub reason: String,
    pub summary: String,
    pub message: String,
}

/// The validated LLM response for one call transcript.
#[derive(Debug, Clone, Deserialize)]
pub struct CallResponse {
    pub summary: String,
    pub reason: String,
    pub ai_reason: String,
    pub contains_pii_or_cid: String,
}

impl ValidatedResponse for CallResponse {
    fn validate(&self) -> Result<(), String> {
        if self.summary.len() < 5 || self.summary.len() > 500 {
            return Err(format!(
                "summary length {} outside 5..500",
                self.summary.len()
            ));
        }
        if !REASON.is_match(&self.reason) {
            return Err(format!("reason '{}' does not match ^#\\w+$", self.reason));
        }
        if !REASON.is_match(&self.ai_reason) {
            return Err(format!(
                "ai_reason '{}' does not match ^#\\w+$",
                self.ai_reason
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

/// Worker family that reasons over call transcripts.
pub struct ReasonerHandler {
    llm: LlmClient,
    reason_options: String,
}

impl ReasonerHandler {
    pub fn new(llm: LlmClient, reason_options: String) -> Self {
        Self {
            llm,
            reason_options,
        }
    }
}

#[async_trait]
impl MessageHandler for ReasonerHandler {
    fn family(&self) -> &str {
        "app_reasoner"
    }

    async fn handle(&self, raw_message: &str) -> Result<serde_json::Value, WorkerError> {
        let input: InputReasoner = serde_json::from_str(raw_message)
            .map_err(|e| WorkerError::MalformedInput(e.to_string()))?;
        tracing::info!(id = %input.id, "Processing call transcript");

        let mut variables = HashMap::new();
        variables.insert("text".to_string(), input.text.clone());
        variables.insert("language".to_string(), input.language.clone());
        variables.insert("reason_options".to_string(), self.reason_options.clone());

        let response: CallResponse = self
            .llm
            .structured_prompt(SYSTEM_PROMPT, USER_PROMPT, &variables, SCHEMA_RETRIES)
            .await?;

        tracing::info!(
            id = %input.id,
            contains_pii_or_cid = %response.contains_pii_or_cid,
            "Call transcript processed"
        );

        let output = OutputReasoner {
            id: input.id,
            task_id: input.task_id,
            ai_reason: response.ai_reason,
            reason: response.reason,
            summary: response.summary,
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
            .unwrap_or("unknown")
            .to_string();

        let output = OutputReasoner {
            id,
            task_id,
            ai_reason: "#processing_failed".to_string(),
            reason: "#error".to_string(),
            summary: format!("Processing error: {error}"),
            message: "failed".to_string(),
        };
        serde_json::to_value(&output).ok()
    }
}
