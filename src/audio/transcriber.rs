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
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::audio::types::{AudioChunk, SpeakerSegment};
use crate::retry::with_rate_limit_retry;
use crate::stt::{SttClient, TranscriptionResponse};

const MIN_SUCCESS_RATE: f64 = 0.8;

/// One channel's reassembled transcription: rebased segments in original-
/// audio time, ordered by start.
#[derive(Debug, Clone)]
pub struct ChannelTranscript {
    pub speaker_id: String,
    pub text: String,
    pub segments: Vec<SpeakerSegment>,
    pub confidence: f64,
    pub language: Option<String>,
}

struct ChunkOutcome {
    speaker_id: String,
    start_sec: f64,
    end_sec: f64,
    response: Option<TranscriptionResponse>,
}

/// Bounded-concurrency fan-out of chunks to the STT backend.
///
/// The semaphore caps in-flight requests per pipeline run independently of
/// the broker: the broker protects the shared minute budget, the semaphore
/// protects the remote endpoint from a burst within one run.
pub struct TranscriptionFanout<'a> {
    stt: &'a SttClient,
    max_retries: usize,
    language: Option<String>,
}

impl<'a> TranscriptionFanout<'a> {
    pub fn new(stt: &'a SttClient, max_retries: usize, language: Option<String>) -> Self {
        Self {
            stt,
            max_retries,
            language,
        }
    }

    /// Transcribe every chunk and reassemble per channel. Fails when fewer
    /// than 80% of chunks transcribe.
    pub async fn transcribe_chunks(&self, chunks: &[AudioChunk]) -> Result<Vec<ChannelTranscript>> {
        if chunks.is_empty() {
            anyhow::bail!("no audio chunks to transcribe");
        }

        tracing::info!(
            chunks = chunks.len(),
            max_concurrent = self.stt.max_concurrent(),
            "Starting transcription fan-out"
        );

        let semaphore = Arc::new(Semaphore::new(self.stt.max_concurrent()));
        let tasks = chunks.iter().map(|chunk| {
            let semaphore = Arc::clone(&semaphore);
            async move {
                let _permit = semaphore.acquire().await;
                self.transcribe_one(chunk).await
            }
        });

        let outcomes: Vec<ChunkOutcome> = futures::future::join_all(tasks).await;

        let successful = outcomes.iter().filter(|o| o.response.is_some()).count();
        let success_rate = successful as f64 / outcomes.len() as f64;
        tracing::info!(
            successful,
            total = outcomes.len(),
            success_rate,
            "Transcription fan-out finished"
        );

        if success_rate < MIN_SUCCESS_RATE {
            anyhow::bail!(
                "too many transcription failures: {}/{} chunks failed",
                outcomes.len() - successful,
                outcomes.len()
            );
        }

        Ok(assemble_channels(outcomes))
    }

    async fn transcribe_one(&self, chunk: &AudioChunk) -> ChunkOutcome {
        tracing::debug!(chunk_id = %chunk.chunk_id, "Transcribing chunk");

        let result = with_rate_limit_retry(self.stt.token_client(), self.max_retries, || {
            self.stt
                .transcribe(&chunk.file_path, self.language.as_deref(), 0.0)
        })
        .await;

        match result {
            Ok(response) => ChunkOutcome {
                speaker_id: chunk.speaker_id.clone(),
                start_sec: chunk.start_sec,
                end_sec: chunk.end_sec,
                response: Some(response),
            },
            Err(err) => {
                tracing::error!(chunk_id = %chunk.chunk_id, error = %err, "Chunk transcription failed");
                ChunkOutcome {
                    speaker_id: chunk.speaker_id.clone(),
                    start_sec: chunk.start_sec,
                    end_sec: chunk.end_sec,
                    response: None,
                }
            }
        }
    }
}

/// Rebase chunk-local timestamps into original-audio time and merge each
/// channel's chunks in start order. This is the only place timestamps are
/// shifted; segments are immutable afterwards.
fn assemble_channels(mut outcomes: Vec<ChunkOutcome>) -> Vec<ChannelTranscript> {
    outcomes.sort_by(|a, b| a.start_sec.total_cmp(&b.start_sec));

    let mut by_speaker: BTreeMap<String, Vec<ChunkOutcome>> = BTreeMap::new();
    for outcome in outcomes {
        by_speaker
            .entry(outcome.speaker_id.clone())
            .or_default()
            .push(outcome);
    }

    by_speaker
        .into_iter()
        .map(|(speaker_id, outcomes)| {
            let mut segments: Vec<SpeakerSegment> = Vec::new();
            let mut text_parts: Vec<String> = Vec::new();
            let mut language = None;

            for outcome in &outcomes {
                let Some(response) = &outcome.response else {
                    // failed chunk: zero-confidence empty segment list
                    continue;
                };

                if language.is_none() {
                    language = response.language.clone();
                }
                let trimmed = response.text.trim();
                if !trimmed.is_empty() {
                    text_parts.push(trimmed.to_string());
                }

                if response.segments.is_empty() {
                    if !trimmed.is_empty() {
                        segments.push(SpeakerSegment::new(
                            outcome.start_sec,
                            outcome.end_sec,
                            &speaker_id,
                            trimmed,
                            segment_confidence(None),
                        ));
                    }
                    continue;
                }

                for segment in &response.segments {
                    let text = segment.text.trim();
                    if text.is_empty() {
                        continue;
                    }
                    segments.push(SpeakerSegment::new(
                        segment.start + outcome.start_sec,
                        segment.end + outcome.start_sec,
                        &speaker_id,
                        text,
                        segment_confidence(segment.avg_logprob),
                    ));
                }
            }

            segments.sort_by(|a, b| a.start_sec.total_cmp(&b.start_sec));
            let confidence = duration_weighted_confidence(&segments);

            ChannelTranscript {
                speaker_id,
                text: text_parts.join(" "),
                segments,
                confidence,
                language,
            }
        })
        .collect()
}

/// Whisper reports no direct confidence; bucket the average log-probability.
fn segment_confidence(avg_logprob: Option<f64>) -> f64 {
    match avg_logprob {
        Some(lp) if lp < -1.0 => 0.3,
        Some(lp) if lp < -0.5 => 0.6,
        Some(_) => 0.9,
        None => 0.8,
    }
}

fn duration_weighted_confidence(segments: &[SpeakerSegment]) -> f64 {
    let mut weighted = 0.0;
    let mut total = 0.0;
    for segment in segments {
        let duration = segment.duration().max(0.1);
        weighted += segment.confidence * duration;
        total += duration;
    }
    if total > 0.0 {
        (weighted / total).min(1.0)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::types::SPEAKER_ONE;
    use crate::broker::TokenBudgetBroker;
    use crate::config::SttConfig;
    use crate::stt::SttClient;
    use crate::token_client::TokenClient;
    use mockito::Matcher;
    use std::io::Write;
    use std::path::PathBuf;

    fn stt_client(endpoint: &str) -> SttClient {
        let broker = Arc::new(TokenBudgetBroker::new(1_000_000));
        SttClient::new(
            SttConfig {
                endpoint: endpoint.to_string(),
                deployment: "whisper-1".to_string(),
                api_version: "2024-02-01".to_string(),
                api_key: "test-key".to_string(),
                request_token_estimate: 1000,
                max_concurrent: 3,
            },
            TokenClient::new("app_whisper", broker),
        )
    }

    fn chunk(path: PathBuf, speaker: &str, start: f64, end: f64) -> AudioChunk {
        AudioChunk {
            chunk_id: format!("chunk_{start}"),
            file_path: path,
            start_sec: start,
            end_sec: end,
            size_bytes: 16,
            speaker_id: speaker.to_string(),
        }
    }

    fn audio_file(dir: &tempfile::TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(b"RIFF....WAVEfmt ").unwrap();
        path
    }

    fn verbose_body() -> String {
        serde_json::json!({
            "text": "hello world",
            "language": "en",
            "duration": 4.0,
            "segments": [
                {"start": 0.0, "end": 2.0, "text": "hello", "avg_logprob": -0.2},
                {"start": 2.0, "end": 4.0, "text": "world", "avg_logprob": -0.7}
            ]
        })
        .to_string()
    }

    #[tokio::test]
    async fn segments_are_rebased_by_chunk_offset() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/openai/deployments/whisper-1/audio/transcriptions")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(verbose_body())
            .expect(2)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let stt = stt_client(&server.url());
        let fanout = TranscriptionFanout::new(&stt, 1, Some("en".to_string()));

        let chunks = vec![
            chunk(audio_file(&dir, "c0.wav"), SPEAKER_ONE, 0.0, 4.0),
            chunk(audio_file(&dir, "c1.wav"), SPEAKER_ONE, 10.0, 14.0),
        ];

        let transcripts = fanout.transcribe_chunks(&chunks).await.unwrap();
        assert_eq!(transcripts.len(), 1);

        let transcript = &transcripts[0];
        assert_eq!(transcript.speaker_id, SPEAKER_ONE);
        assert_eq!(transcript.segments.len(), 4);
        let starts: Vec<f64> = transcript.segments.iter().map(|s| s.start_sec).collect();
        assert_eq!(starts, [0.0, 2.0, 10.0, 12.0]);
        assert_eq!(transcript.text, "hello world hello world");
        assert_eq!(transcript.language.as_deref(), Some("en"));
    }

    #[test]
    fn logprob_buckets_drive_segment_confidence() {
        assert_eq!(segment_confidence(Some(-1.5)), 0.3);
        assert_eq!(segment_confidence(Some(-0.7)), 0.6);
        assert_eq!(segment_confidence(Some(-0.1)), 0.9);
        assert_eq!(segment_confidence(None), 0.8);
    }

    #[tokio::test]
    async fn chunk_without_segments_synthesizes_one_span() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/openai/deployments/whisper-1/audio/transcriptions")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(serde_json::json!({"text": "just text", "segments": []}).to_string())
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let stt = stt_client(&server.url());
        let fanout = TranscriptionFanout::new(&stt, 1, None);

        let chunks = vec![chunk(audio_file(&dir, "c0.wav"), SPEAKER_ONE, 5.0, 9.0)];
        let transcripts = fanout.transcribe_chunks(&chunks).await.unwrap();

        let segments = &transcripts[0].segments;
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].start_sec, 5.0);
        assert_eq!(segments[0].end_sec, 9.0);
        assert_eq!(segments[0].confidence, 0.8);
    }

    #[tokio::test]
    async fn total_failure_fails_the_stage_and_leaks_no_tokens() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/openai/deployments/whisper-1/audio/transcriptions")
            .match_query(Matcher::Any)
            .with_status(500)
            .with_body("boom")
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let stt = stt_client(&server.url());
        let fanout = TranscriptionFanout::new(&stt, 1, None);

        let chunks = vec![chunk(audio_file(&dir, "c0.wav"), SPEAKER_ONE, 0.0, 4.0)];
        assert!(fanout.transcribe_chunks(&chunks).await.is_err());
        assert_eq!(stt.token_client().get_status().locked_tokens, 0);
    }
}
