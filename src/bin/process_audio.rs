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

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use call_insights_rs::audio::pipeline::AudioPipeline;
use call_insights_rs::broker::TokenBudgetBroker;
use call_insights_rs::config::Config;
use call_insights_rs::stt::SttClient;
use call_insights_rs::token_client::TokenClient;

/// Run the transcription pipeline against a local audio file, bypassing the
/// bus and the blob download. Useful for debugging a single recording.
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let audio_file = match std::env::args().nth(1) {
        Some(path) => PathBuf::from(path),
        None => {
            eprintln!("Usage: cargo run --bin process_audio <audio_file_path> [language]");
            std::process::exit(1);
        }
    };

    if !audio_file.exists() {
        eprintln!("Audio file not found: {}", audio_file.display());
        std::process::exit(1);
    }

    let language = std::env::args().nth(2);
    let config = Config::load()?;

    let broker = Arc::new(TokenBudgetBroker::with_timing(
        config.broker.tokens_per_minute,
        Duration::from_secs(60),
        Duration::from_secs(config.broker.reservation_ttl_secs),
    ));
    let stt = SttClient::new(
        config.stt.clone(),
        TokenClient::new("app_whisper", broker),
    );

    let pipeline = AudioPipeline::new(
        &config.audio,
        &config.storage,
        &stt,
        config.worker.max_retries,
    );

    let filename = audio_file
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("local_audio")
        .to_string();

    println!("Processing {} ...", audio_file.display());
    let (success, result) = pipeline
        .process_local(&filename, &audio_file, language.as_deref(), Instant::now())
        .await;

    println!();
    println!(
        "== {} in {:.1}s ==",
        if success { "SUCCESS" } else { "FAILED" },
        result.processing_metadata.processing_time_seconds
    );
    println!(
        "diarization: {}  confidence: {:.3}  segments: {}",
        result.diarization,
        result.confidence,
        result.speaker_segments.len()
    );
    println!();
    println!("{}", result.text);

    if !success {
        std::process::exit(1);
    }
    Ok(())
}
