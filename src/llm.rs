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

use lazy_static::lazy_static;
use regex::Regex;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tiktoken_rs::{cl100k_base, get_bpe_from_model, CoreBPE};

use crate::broker::{DenyReason, LockOutcome};
use crate::config::LlmConfig;
use crate::error::WorkerError;
use crate::retry::with_rate_limit_retry;
use crate::token_client::TokenClient;

lazy_static! {
    /// Fallback encoder for deployment names tiktoken does not recognize.
    static ref FALLBACK_BPE: CoreBPE =
        cl100k_base().expect("embedded cl100k_base encoder data");
    static ref PLACEHOLDER: Regex = Regex::new(r"\{(\w+)\}").unwrap();
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct ChatUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

/// A structured LLM response type: deserializable and self-checking.
/// Validation failures trigger internal re-prompts, never broker retries.
pub trait ValidatedResponse: DeserializeOwned {
    fn validate(&self) -> Result<(), String>;
}

/// Build the message list from a system prompt, a user template with
/// `{name}` placeholders, and optional few-shot example turns.
///
/// A placeholder with no matching variable is a `Template` error naming the
/// variable, surfaced before any tokens are locked.
pub fn format_prompt(
    system_prompt: &str,
    user_prompt: &str,
    variables: &HashMap<String, String>,
    examples: &[ChatMessage],
) -> Result<Vec<ChatMessage>, WorkerError> {
    let mut missing = None;
    let formatted = PLACEHOLDER.replace_all(user_prompt, |caps: &regex::Captures<'_>| {
        let key = &caps[1];
        match variables.get(key) {
            Some(value) => value.clone(),
            None => {
                if missing.is_none() {
                    missing = Some(key.to_string());
                }
                String::new()
            }
        }
    });

    if let Some(name) = missing {
        tracing::error!(variable = %name, "Prompt template variable missing");
        return Err(WorkerError::Template(name));
    }

    let mut messages = Vec::with_capacity(examples.len() + 2);
    messages.push(ChatMessage::system(system_prompt));
    messages.extend_from_slice(examples);
    messages.push(ChatMessage::user(formatted.into_owned()));
    Ok(messages)
}

/// Estimate the token cost of a request: per-message content plus 4 framing
/// tokens each, 3 priming tokens for the reply, and the completion budget.
pub fn estimate_tokens(messages: &[ChatMessage], model: &str, max_tokens: u32) -> u64 {
    let model_bpe = get_bpe_from_model(model).ok();
    if model_bpe.is_none() {
        tracing::debug!(model, "Unknown model, falling back to cl100k_base encoding");
    }
    let bpe = model_bpe.as_ref().unwrap_or(&*FALLBACK_BPE);

    let mut count: u64 = 3; // every reply is primed with <|start|>assistant<|message|>
    for message in messages {
        count += bpe.encode_with_special_tokens(&message.content).len() as u64;
        count += 4; // role and message framing
    }
    count + max_tokens as u64
}

/// Chat-completions adapter with broker-governed admission.
///
/// Every call estimates, locks, invokes the backend, then commits actual
/// usage on success or releases the reservation on failure.
pub struct LlmClient {
    client: Client,
    config: LlmConfig,
    token_client: TokenClient,
    max_retries: usize,
}

impl LlmClient {
    pub fn new(config: LlmConfig, token_client: TokenClient, max_retries: usize) -> Self {
        Self {
            client: Client::new(),
            config,
            token_client,
            max_retries,
        }
    }

    fn completions_url(&self) -> String {
        format!(
            "{}/openai/deployments/{}/chat/completions?api-version={}",
            self.config.endpoint.trim_end_matches('/'),
            self.config.deployment,
            self.config.api_version
        )
    }

    /// One lock→call→commit/release round trip. Raises `RateLimitExceeded`
    /// on a retryable denial and `RequestTooLarge` on an oversized one.
    pub async fn chat_completion(
        &self,
        messages: &[ChatMessage],
    ) -> Result<(String, ChatUsage), WorkerError> {
        let estimated = estimate_tokens(messages, &self.config.deployment, self.config.max_tokens);

        let request_id = match self.token_client.lock_outcome(estimated) {
            LockOutcome::Allowed { request_id } => request_id,
            LockOutcome::Denied {
                reason: DenyReason::RateLimitExceeded,
                reset_seconds,
            } => return Err(WorkerError::RateLimitExceeded { reset_seconds }),
            LockOutcome::Denied {
                reason: DenyReason::TokenLimitExceeded,
                ..
            } => {
                return Err(WorkerError::RequestTooLarge {
                    estimated,
                    limit: self.token_client.tokens_per_minute(),
                })
            }
        };

        match self.invoke_backend(messages).await {
            Ok((content, usage)) => {
                self.token_client.report_usage(
                    &request_id,
                    usage.prompt_tokens,
                    usage.completion_tokens,
                );
                Ok((content, usage))
            }
            Err(err) => {
                self.token_client.release_tokens(&request_id);
                Err(err)
            }
        }
    }

    async fn invoke_backend(
        &self,
        messages: &[ChatMessage],
    ) -> Result<(String, ChatUsage), WorkerError> {
        let request_body = serde_json::json!({
            "messages": messages,
            "max_tokens": self.config.max_tokens,
            "temperature": self.config.temperature,
        });

        let response = self
            .client
            .post(self.completions_url())
            .header("api-key", &self.config.api_key)
            .json(&request_body)
            .send()
            .await
            .map_err(|e| WorkerError::Backend(format!("chat completion request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(WorkerError::Backend(format!(
                "chat completion returned {status}: {body}"
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| WorkerError::Backend(format!("invalid completion payload: {e}")))?;

        let content = parsed
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();
        let usage = parsed.usage.unwrap_or_default();

        Ok((content, usage))
    }

    /// Raw mode: format, call, return the content string. Rate-limit
    /// denials are waited out via the broker's reset hint.
    pub async fn send_prompt(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        variables: &HashMap<String, String>,
        examples: &[ChatMessage],
    ) -> Result<String, WorkerError> {
        let messages = format_prompt(system_prompt, user_prompt, variables, examples)?;

        let (content, _) = with_rate_limit_retry(&self.token_client, self.max_retries, || {
            self.chat_completion(&messages)
        })
        .await?;

        Ok(content)
    }

    /// Structured mode: the response must deserialize into `T` and pass its
    /// own validation. Parse/validation failures re-run the whole call
    /// (estimate, lock, invoke, commit) up to `schema_retries` times; the
    /// model can usually be coaxed into valid JSON on a second attempt.
    pub async fn structured_prompt<T: ValidatedResponse>(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        variables: &HashMap<String, String>,
        schema_retries: usize,
    ) -> Result<T, WorkerError> {
        let mut last_failure = String::new();

        for attempt in 1..=schema_retries.max(1) {
            let content = self
                .send_prompt(system_prompt, user_prompt, variables, &[])
                .await?;

            match parse_structured::<T>(&content) {
                Ok(value) => return Ok(value),
                Err(reason) => {
                    tracing::warn!(attempt, %reason, "Structured response failed validation");
                    last_failure = reason;
                }
            }
        }

        Err(WorkerError::Backend(format!(
            "structured response failed validation after {} attempts: {last_failure}",
            schema_retries.max(1)
        )))
    }
}

fn parse_structured<T: ValidatedResponse>(content: &str) -> Result<T, String> {
    let json = extract_json(content);
    let value: T =
        serde_json::from_str(json).map_err(|e| format!("response is not valid JSON: {e}"))?;
    value.validate()?;
    Ok(value)
}

/// Models sometimes wrap JSON in prose or code fences; take the outermost
/// object literal.
fn extract_json(content: &str) -> &str {
    match (content.find('{'), content.rfind('}')) {
        (Some(start), Some(end)) if end > start => &content[start..=end],
        _ => content,
    }
}
