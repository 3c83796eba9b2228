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
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::audio::pipeline::AudioPipeline;
use crate::config::Config;
use crate::error::WorkerError;
use crate::stt::SttClient;
use crate::worker::MessageHandler;

#[derive(Debug, Clone, Deserialize)]
pub struct InputWhisper {
    pub id: String,
    pub filename: String,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub client_manager: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutputWhisper {
    pub id: String,
    pub filename: String,
    pub transcription: String,
    pub diarization: bool,
    pub message: String,
}

/// Worker family that transcribes stereo call recordings.
pub struct WhisperHandler {
    config: Arc<Config>,
    stt: Arc<SttClient>,
}

impl WhisperHandler {
    pub fn new(config: Arc<Config>, stt: Arc<SttClient>) -> Self {
        Self { config, stt }
    }
}

#[async_trait]
impl MessageHandler for WhisperHandler {
    fn family(&self) -> &str {
        "app_whisper"
    }

    async fn handle(&self, raw_message: &str) -> Result<serde_json::Value, WorkerError> {
        let input: InputWhisper = serde_json::from_str(raw_message)
            .map_err(|e| WorkerError::MalformedInput(e.to_string()))?;
        tracing::info!(id = %input.id, filename = %input.filename, "Processing audio job");

        let pipeline = AudioPipeline::new(
            &self.config.audio,
            &self.config.storage,
            &self.stt,
            self.config.worker.max_retries,
        );

        // the pipeline never panics outward: failures arrive as a result
        // with the error text and partial metadata
        let (success, result) = pipeline
            .run(&input.filename, input.language.as_deref())
            .await;

        let output = OutputWhisper {
            id: input.id,
            filename: input.filename,
            transcription: result.text,
            diarization: result.diarization,
            message: if success { "SUCCESS" } else { "failed" }.to_string(),
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
        let filename = parsed
            .get("filename")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();

        let output = OutputWhisper {
            id,
            filename,
            transcription: format!("Processing error: {error}"),
            diarization: false,
            message: "failed".to_string(),
        };
        serde_json::to_value(&output).ok()
    }
}
