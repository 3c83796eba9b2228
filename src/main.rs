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
use chrono::NaiveTime;
use clap::{Parser, ValueEnum};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use call_insights_rs::broker::TokenBudgetBroker;
use call_insights_rs::bus::ServiceBusQueue;
use call_insights_rs::config::Config;
use call_insights_rs::llm::LlmClient;
use call_insights_rs::stt::SttClient;
use call_insights_rs::token_client::TokenClient;
use call_insights_rs::uploader::LogUploader;
use call_insights_rs::worker::{MessageHandler, Service};
use call_insights_rs::workers::feedback::FeedbackHandler;
use call_insights_rs::workers::reasoner::ReasonerHandler;
use call_insights_rs::workers::whisper::WhisperHandler;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Family {
    /// Text feedback classifier
    Feedback,
    /// Call-transcript reasoner
    Reasoner,
    /// Audio transcription + diarization
    Whisper,
}

impl Family {
    fn app_id(&self) -> &'static str {
        match self {
            Family::Feedback => "app_feedbackform",
            Family::Reasoner => "app_reasoner",
            Family::Whisper => "app_whisper",
        }
    }
}

#[derive(Parser)]
#[command(
    name = "call-insights",
    about = "Queue-driven workers for call analytics",
    version
)]
struct Cli {
    /// Which worker family to run
    #[arg(long, value_enum)]
    family: Family,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Arc::new(Config::load()?);

    // stdout for the console, a daily-rolling file for the upload side task
    let file_appender = tracing_appender::rolling::daily(&config.log_dir, "call-insights.log");
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false),
        )
        .init();

    tracing::info!(family = ?cli.family, "Starting call-insights worker");

    let broker = Arc::new(TokenBudgetBroker::with_timing(
        config.broker.tokens_per_minute,
        Duration::from_secs(60),
        Duration::from_secs(config.broker.reservation_ttl_secs),
    ));
    let _sweeper = broker.spawn_sweeper(Duration::from_secs(60));

    let app_id = cli.family.app_id();
    let handler: Arc<dyn MessageHandler> = match cli.family {
        Family::Feedback => Arc::new(FeedbackHandler::new(
            LlmClient::new(
                config.llm.clone(),
                TokenClient::new(app_id, Arc::clone(&broker)),
                config.worker.max_retries,
            ),
            config.feedback_hashtag_options.clone(),
        )),
        Family::Reasoner => Arc::new(ReasonerHandler::new(
            LlmClient::new(
                config.llm.clone(),
                TokenClient::new(app_id, Arc::clone(&broker)),
                config.worker.max_retries,
            ),
            config.reasoner_reason_options.clone(),
        )),
        Family::Whisper => Arc::new(WhisperHandler::new(
            Arc::clone(&config),
            Arc::new(SttClient::new(
                config.stt.clone(),
                TokenClient::new(app_id, Arc::clone(&broker)),
            )),
        )),
    };

    let target_time = NaiveTime::parse_from_str(&config.worker.log_target_upload_time, "%H:%M:%S")
        .context("LOG_TARGET_UPLOAD_TIME must be HH:MM:SS")?;

    let service = Service::new(
        Arc::new(ServiceBusQueue::new(&config.bus, &config.bus.in_queue)),
        Arc::new(ServiceBusQueue::new(&config.bus, &config.bus.out_queue)),
        Arc::new(ServiceBusQueue::new(&config.bus, &config.bus.command_queue)),
        handler,
        Arc::new(LogUploader::new(&config.storage, config.log_dir.clone())),
        config.worker.batch_size,
        Duration::from_secs(config.worker.handler_timeout_secs),
        target_time,
    );

    service.run().await;
    Ok(())
}
