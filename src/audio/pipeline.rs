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

use std::path::Path;
use std::time::Instant;

use crate::audio::chunker::AudioChunker;
use crate::audio::diarizer::SpeakerDiarizer;
use crate::audio::downloader::AudioDownloader;
use crate::audio::postprocessor::TranscriptionPostProcessor;
use crate::audio::preprocessor::AudioPreprocessor;
use crate::audio::transcriber::TranscriptionFanout;
use crate::audio::types::{PipelineResult, ProcessingMetadata};
use crate::config::{AudioPipelineConfig, StorageConfig};
use crate::error::WorkerError;
use crate::stt::SttClient;

/// Linear orchestration of the transcription pipeline:
/// download → preprocess → chunk → transcribe → diarize → post-process.
///
/// Any stage failure short-circuits into a failure result carrying the
/// metadata gathered so far. Scratch directories are owned by the stage
/// objects and dropped on every exit path, panics included.
pub struct AudioPipeline<'a> {
    audio_config: &'a AudioPipelineConfig,
    storage: &'a StorageConfig,
    stt: &'a SttClient,
    max_retries: usize,
}

impl<'a> AudioPipeline<'a> {
    pub fn new(
        audio_config: &'a AudioPipelineConfig,
        storage: &'a StorageConfig,
        stt: &'a SttClient,
        max_retries: usize,
    ) -> Self {
        Self {
            audio_config,
            storage,
            stt,
            max_retries,
        }
    }

    /// Full run against a blob name from the bus message.
    pub async fn run(&self, filename: &str, language: Option<&str>) -> (bool, PipelineResult) {
        let started = Instant::now();
        tracing::info!(filename, "Starting audio processing pipeline");

        let downloader = match AudioDownloader::new(self.storage) {
            Ok(downloader) => downloader,
            Err(e) => return failure(filename, "download", &e.to_string(), started, None),
        };

        let local_path = match downloader.download(filename).await {
            Ok(path) => path,
            Err(e) => return failure(filename, "download", &e.to_string(), started, None),
        };

        // the downloader owns the scratch file; it must outlive processing
        self.process_local(filename, &local_path, language, started)
            .await
    }

    /// Pipeline from a local file onward; also the entry point for the
    /// standalone `process_audio` binary.
    pub async fn process_local(
        &self,
        filename: &str,
        local_path: &Path,
        language: Option<&str>,
        started: Instant,
    ) -> (bool, PipelineResult) {
        let mut metadata = ProcessingMetadata::failed(filename, 0.0);

        // Stage: preprocess (split channels, resample, trim)
        let preprocessor = match AudioPreprocessor::new(
            self.audio_config.target_sample_rate,
            &self.audio_config.output_format,
        ) {
            Ok(preprocessor) => preprocessor,
            Err(e) => return failure(filename, "preprocess", &e.to_string(), started, Some(metadata)),
        };

        let preprocessed = match preprocessor.preprocess(local_path).await {
            Ok(output) => output,
            Err(e) => return failure(filename, "preprocess", &e.to_string(), started, Some(metadata)),
        };
        metadata.original_audio_info = Some(preprocessed.original_info.clone());
        metadata.preprocessed_audio_info = Some(crate::audio::types::AudioInfo {
            duration_sec: preprocessed
                .channels
                .iter()
                .map(|c| c.duration_sec)
                .fold(0.0, f64::max),
            sample_rate: self.audio_config.target_sample_rate,
            channels: preprocessed.channels.len() as u16,
            size_bytes: preprocessed
                .channels
                .iter()
                .map(|c| (c.size_mb * 1024.0 * 1024.0) as u64)
                .sum(),
            format: self.audio_config.output_format.to_uppercase(),
        });

        // Stage: size-bounded chunking
        let chunker = match AudioChunker::new(self.audio_config.max_chunk_size_mb) {
            Ok(chunker) => chunker,
            Err(e) => return failure(filename, "chunk", &e.to_string(), started, Some(metadata)),
        };

        let chunks = match chunker.chunk_channels(&preprocessed.channels).await {
            Ok(chunks) => chunks,
            Err(e) => return failure(filename, "chunk", &e.to_string(), started, Some(metadata)),
        };
        metadata.total_chunks = chunks.len();
        metadata.chunk_method = if chunks.len() > preprocessed.channels.len() {
            "chunked".to_string()
        } else {
            "direct".to_string()
        };

        // Stage: bounded-concurrency transcription
        let fanout =
            TranscriptionFanout::new(self.stt, self.max_retries, language.map(str::to_string));
        let transcripts = match fanout.transcribe_chunks(&chunks).await {
            Ok(transcripts) => transcripts,
            Err(e) => return failure(filename, "transcribe", &e.to_string(), started, Some(metadata)),
        };
        metadata.transcription_method = "whisper".to_string();

        // Stage: channel-based diarization
        let diarizer = SpeakerDiarizer::new(
            self.audio_config.merge_threshold,
            self.audio_config.min_segment_duration,
        );
        let segments = match diarizer.create_speaker_segments(&transcripts) {
            Ok(segments) => segments,
            Err(e) => return failure(filename, "diarize", &e.to_string(), started, Some(metadata)),
        };
        metadata.has_speaker_alignment = preprocessed.stereo;
        metadata.diarization_summary = Some(diarizer.summary(&segments));

        // Stage: final assembly
        let postprocessor = TranscriptionPostProcessor::new();
        let transcript = match postprocessor.create_final_transcript(&segments) {
            Ok(transcript) => transcript,
            Err(e) => return failure(filename, "postprocess", &e.to_string(), started, Some(metadata)),
        };

        metadata.processing_time_seconds = started.elapsed().as_secs_f64();
        tracing::info!(
            filename,
            elapsed = metadata.processing_time_seconds,
            segments = segments.len(),
            "Pipeline completed successfully"
        );

        (
            true,
            PipelineResult {
                text: transcript.text,
                diarization: preprocessed.stereo && !segments.is_empty(),
                confidence: transcript.confidence,
                speaker_segments: segments,
                processing_metadata: metadata,
            },
        )
    }
}

fn failure(
    filename: &str,
    stage: &str,
    reason: &str,
    started: Instant,
    metadata: Option<ProcessingMetadata>,
) -> (bool, PipelineResult) {
    let error = WorkerError::stage(stage, reason);
    tracing::error!(filename, %error, "Pipeline stage failed");

    let mut metadata =
        metadata.unwrap_or_else(|| ProcessingMetadata::failed(filename, 0.0));
    metadata.processing_time_seconds = started.elapsed().as_secs_f64();
    metadata.transcription_method = "failed".to_string();

    (
        false,
        PipelineResult {
            text: error.to_string(),
            diarization: false,
            confidence: 0.0,
            speaker_segments: Vec::new(),
            processing_metadata: metadata,
        },
    )
}
