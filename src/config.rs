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

use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Fully qualified namespace, e.g. `mybus.servicebus.windows.net`.
    pub namespace: String,
    pub in_queue: String,
    pub out_queue: String,
    pub command_queue: String,
    pub sas_key_name: String,
    pub sas_key: String,
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub endpoint: String,
    pub deployment: String,
    pub api_version: String,
    pub api_key: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[derive(Debug, Clone)]
pub struct SttConfig {
    pub endpoint: String,
    pub deployment: String,
    pub api_version: String,
    pub api_key: String,
    /// The remote service bills by audio seconds; the broker is charged a
    /// fixed per-request budget configured for the deployment.
    pub request_token_estimate: u64,
    pub max_concurrent: usize,
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub tokens_per_minute: u64,
    pub reservation_ttl_secs: u64,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub batch_size: usize,
    pub handler_timeout_secs: u64,
    pub max_retries: usize,
    /// UTC `HH:MM:SS` at which the daily log upload marker fires.
    pub log_target_upload_time: String,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Base URL of the blob store, e.g. `https://acct.blob.core.windows.net`.
    pub account_url: String,
    pub audio_container: String,
    pub log_container: String,
    pub access_token: String,
}

#[derive(Debug, Clone)]
pub struct AudioPipelineConfig {
    pub target_sample_rate: u32,
    pub max_chunk_size_mb: f64,
    /// "wav" or "flac".
    pub output_format: String,
    pub min_segment_duration: f64,
    pub merge_threshold: f64,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bus: BusConfig,
    pub llm: LlmConfig,
    pub stt: SttConfig,
    pub broker: BrokerConfig,
    pub worker: WorkerConfig,
    pub storage: StorageConfig,
    pub audio: AudioPipelineConfig,
    pub log_dir: PathBuf,
    /// Opaque, pre-formatted option blocks handed to the prompts at runtime.
    pub feedback_hashtag_options: String,
    pub reasoner_reason_options: String,
}

impl Config {
    pub fn load() -> Result<Self> {
        // Load environment variables from .env file if it exists
        dotenv::dotenv().ok();

        let bus = BusConfig {
            namespace: env::var("APP_SB_FULLY_QUALIFIED_NAMESPACE")
                .context("APP_SB_FULLY_QUALIFIED_NAMESPACE environment variable not found")?,
            in_queue: env::var("APP_SERVICE_IN_QUEUE")
                .context("APP_SERVICE_IN_QUEUE environment variable not found")?,
            out_queue: env::var("APP_SERVICE_OUT_QUEUE")
                .context("APP_SERVICE_OUT_QUEUE environment variable not found")?,
            command_queue: env_or("APP_SERVICE_COMMAND_QUEUE", "commands"),
            sas_key_name: env_or("APP_SB_SAS_KEY_NAME", "RootManageSharedAccessKey"),
            sas_key: env_or("APP_SB_SAS_KEY", ""),
        };

        let llm = LlmConfig {
            endpoint: env::var("APP_OPENAI_API_BASE")
                .context("APP_OPENAI_API_BASE environment variable not found")?,
            deployment: env_or("APP_OPENAI_DEPLOYMENT_NAME", "gpt-4"),
            api_version: env_or("APP_OPENAI_API_VERSION", "2024-02-01"),
            api_key: env_or("APP_OPENAI_API_KEY", ""),
            max_tokens: env_parse("APP_OPENAI_MAX_TOKENS", 1000u32),
            temperature: env_parse("APP_OPENAI_TEMPERATURE", 0.0f32),
        };

        let stt = SttConfig {
            endpoint: env_or("APP_WHISPER_API_BASE", &llm.endpoint),
            deployment: env_or("APP_WHISPER_DEPLOYMENT_NAME", "whisper-1"),
            api_version: env_or("APP_WHISPER_API_VERSION", &llm.api_version),
            api_key: env_or("APP_WHISPER_API_KEY", &llm.api_key),
            request_token_estimate: env_parse("STT_REQUEST_TOKEN_ESTIMATE", 1000u64),
            max_concurrent: env_parse("STT_MAX_CONCURRENT", 3usize),
        };

        let broker = BrokerConfig {
            tokens_per_minute: env_parse("TOKENS_PER_MINUTE", 100_000u64),
            reservation_ttl_secs: env_parse("RESERVATION_TTL_SECONDS", 300u64),
        };

        let worker = WorkerConfig {
            batch_size: env_parse("MESSAGE_BATCH_SIZE", 5usize),
            handler_timeout_secs: env_parse("HANDLER_TIMEOUT_SECONDS", 600u64),
            max_retries: env_parse("RATE_LIMIT_MAX_RETRIES", 3usize),
            log_target_upload_time: env_or("LOG_TARGET_UPLOAD_TIME", "02:00:00"),
        };

        let storage = StorageConfig {
            account_url: env_or("AZURE_STORAGE_ACCOUNT_URL", ""),
            audio_container: env_or("WHISPER_AUDIO_CONTAINER", "audio-files"),
            log_container: env_or("LOG_CONTAINER", "service-logs"),
            access_token: env_or("AZURE_STORAGE_ACCESS_TOKEN", ""),
        };

        let audio = AudioPipelineConfig {
            target_sample_rate: env_parse("AUDIO_SAMPLE_RATE", 16_000u32),
            max_chunk_size_mb: env_parse("MAX_CHUNK_SIZE_MB", 24.0f64),
            output_format: env_or("AUDIO_OUTPUT_FORMAT", "wav"),
            min_segment_duration: env_parse("MIN_SEGMENT_DURATION", 0.5f64),
            merge_threshold: env_parse("MERGE_THRESHOLD", 1.0f64),
        };

        let log_dir = env::var("LOG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("logs"));
        std::fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

        let feedback_hashtag_options =
            Self::load_options("FEEDBACK_HASHTAG_OPTIONS", "FEEDBACK_HASHTAG_OPTIONS_FILE")?;
        let reasoner_reason_options =
            Self::load_options("REASONER_REASON_OPTIONS", "REASONER_REASON_OPTIONS_FILE")?;

        Ok(Config {
            bus,
            llm,
            stt,
            broker,
            worker,
            storage,
            audio,
            log_dir,
            feedback_hashtag_options,
            reasoner_reason_options,
        })
    }

    /// Option blocks are opaque runtime input: either inline in the
    /// environment or via a file path, never compiled in.
    fn load_options(inline_key: &str, file_key: &str) -> Result<String> {
        if let Ok(path) = env::var(file_key) {
            return std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read options file {path}"));
        }
        Ok(env_or(inline_key, ""))
    }
}
