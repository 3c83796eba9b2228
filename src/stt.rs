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

use reqwest::multipart;
use reqwest::Client;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::broker::{DenyReason, LockOutcome};
use crate::config::SttConfig;
use crate::error::WorkerError;
use crate::token_client::TokenClient;

const TRANSIENT_ATTEMPTS: usize = 3;
const TRANSIENT_DELAY: Duration = Duration::from_millis(500);

/// One segment of a verbose-JSON transcription, in chunk-local time.
#[derive(Debug, Clone, Deserialize)]
pub struct VerboseSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
    #[serde(default)]
    pub avg_logprob: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TranscriptionResponse {
    pub text: String,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub segments: Vec<VerboseSegment>,
}

/// Speech-to-text adapter with the same lock/commit/release discipline as
/// the chat adapter.
///
/// The remote service bills by audio seconds, so the broker is charged a
/// fixed per-request estimate configured for the deployment rather than a
/// measured token count.
pub struct SttClient {
    client: Client,
    config: SttConfig,
    token_client: TokenClient,
}

impl SttClient {
    pub fn new(config: SttConfig, token_client: TokenClient) -> Self {
        Self {
            client: Client::new(),
            config,
            token_client,
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.config.max_concurrent
    }

    /// Exposed so callers can wait out the broker window between retries.
    pub fn token_client(&self) -> &TokenClient {
        &self.token_client
    }

    fn transcriptions_url(&self) -> String {
        format!(
            "{}/openai/deployments/{}/audio/transcriptions?api-version={}",
            self.config.endpoint.trim_end_matches('/'),
            self.config.deployment,
            self.config.api_version
        )
    }

    /// Transcribe one audio file with segment timestamps.
    pub async fn transcribe(
        &self,
        audio_path: &Path,
        language: Option<&str>,
        temperature: f32,
    ) -> Result<TranscriptionResponse, WorkerError> {
        let estimate = self.config.request_token_estimate;

        let request_id = match self.token_client.lock_outcome(estimate) {
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
                    estimated: estimate,
                    limit: self.token_client.tokens_per_minute(),
                })
            }
        };

        match self
            .invoke_with_transient_retry(audio_path, language, temperature)
            .await
        {
            Ok(response) => {
                self.token_client.report_usage(&request_id, estimate, 0);
                Ok(response)
            }
            Err(err) => {
                self.token_client.release_tokens(&request_id);
                Err(err)
            }
        }
    }

    /// Transient network failures get a small local retry before the error
    /// surfaces; broker-level waiting is the caller's business.
    async fn invoke_with_transient_retry(
        &self,
        audio_path: &Path,
        language: Option<&str>,
        temperature: f32,
    ) -> Result<TranscriptionResponse, WorkerError> {
        let mut last_error = String::new();

        for attempt in 1..=TRANSIENT_ATTEMPTS {
            match self.invoke_backend(audio_path, language, temperature).await {
                Ok(response) => return Ok(response),
                Err(reason) => {
                    tracing::warn!(
                        attempt,
                        file = %audio_path.display(),
                        %reason,
                        "Transcription attempt failed"
                    );
                    last_error = reason;
                    if attempt < TRANSIENT_ATTEMPTS {
                        tokio::time::sleep(TRANSIENT_DELAY).await;
                    }
                }
            }
        }

        Err(WorkerError::Backend(format!(
            "transcription failed after {TRANSIENT_ATTEMPTS} attempts: {last_error}"
        )))
    }

    async fn invoke_backend(
        &self,
        audio_path: &Path,
        language: Option<&str>,
        temperature: f32,
    ) -> Result<TranscriptionResponse, String> {
        let file_data = tokio::fs::read(audio_path)
            .await
            .map_err(|e| format!("failed to read audio file: {e}"))?;

        let file_name = audio_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("audio.wav")
            .to_string();

        let part = multipart::Part::bytes(file_data)
            .file_name(file_name)
            .mime_str("audio/wav")
            .map_err(|e| format!("invalid mime type: {e}"))?;

        let mut form = multipart::Form::new()
            .part("file", part)
            .text("response_format", "verbose_json")
            .text("timestamp_granularities[]", "segment")
            .text("temperature", temperature.to_string());

        if let Some(language) = language {
            form = form.text("language", language.to_string());
        }

        let response = self
            .client
            .post(self.transcriptions_url())
            .header("api-key", &self.config.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| format!("transcription request failed: {e}"))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(format!("transcription returned {status}: {body}"));
        }

        response
            .json::<TranscriptionResponse>()
            .await
            .map_err(|e| format!("invalid transcription payload: {e}"))
    }
}
