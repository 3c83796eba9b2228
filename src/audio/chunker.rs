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
use tempfile::TempDir;
use uuid::Uuid;

use crate::audio::ffmpeg;
use crate::audio::types::{AudioChunk, ChannelAudio};

/// A planned slice of one channel, in original-audio time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChunkPlan {
    pub start_sec: f64,
    pub end_sec: f64,
}

/// Size-bounded planning: a file within the ceiling is one chunk covering
/// the whole duration; a larger file becomes `ceil(size / ceiling)`
/// contiguous, equal-duration, zero-overlap slices.
pub fn plan_chunks(size_bytes: u64, ceiling_bytes: u64, duration_sec: f64) -> Vec<ChunkPlan> {
    if size_bytes <= ceiling_bytes || duration_sec <= 0.0 {
        return vec![ChunkPlan {
            start_sec: 0.0,
            end_sec: duration_sec,
        }];
    }

    let count = (size_bytes as f64 / ceiling_bytes as f64).ceil() as usize;
    let slice = duration_sec / count as f64;

    (0..count)
        .map(|i| ChunkPlan {
            start_sec: i as f64 * slice,
            end_sec: if i + 1 == count {
                duration_sec
            } else {
                (i + 1) as f64 * slice
            },
        })
        .collect()
}

/// Cuts channel files into transcription-sized chunks. Chunk files live in a
/// scratch directory removed when the chunker is dropped.
pub struct AudioChunker {
    max_chunk_bytes: u64,
    scratch: TempDir,
}

impl AudioChunker {
    pub fn new(max_chunk_size_mb: f64) -> Result<Self> {
        let scratch = tempfile::Builder::new()
            .prefix("whisper_chunks_")
            .tempdir()
            .context("Failed to create chunk scratch directory")?;
        tracing::debug!(dir = %scratch.path().display(), "Created chunk scratch directory");

        Ok(Self {
            max_chunk_bytes: (max_chunk_size_mb * 1024.0 * 1024.0) as u64,
            scratch,
        })
    }

    /// Chunk every channel; results keep the owning channel's speaker id so
    /// the fan-out can reassemble per channel.
    pub async fn chunk_channels(&self, channels: &[ChannelAudio]) -> Result<Vec<AudioChunk>> {
        let mut chunks = Vec::new();
        for channel in channels {
            let channel_chunks = self
                .chunk_channel(channel)
                .await
                .with_context(|| format!("Failed to chunk {} channel", channel.channel_id))?;
            chunks.extend(channel_chunks);
        }
        Ok(chunks)
    }

    async fn chunk_channel(&self, channel: &ChannelAudio) -> Result<Vec<AudioChunk>> {
        let size_bytes = tokio::fs::metadata(&channel.path).await?.len();
        let plans = plan_chunks(size_bytes, self.max_chunk_bytes, channel.duration_sec);

        if plans.len() == 1 {
            // within the ceiling the channel file itself is the chunk
            tracing::info!(
                channel = %channel.channel_id,
                size_bytes,
                "Channel fits in one chunk"
            );
            return Ok(vec![AudioChunk {
                chunk_id: format!("chunk_whole_{}", short_id()),
                file_path: channel.path.clone(),
                start_sec: 0.0,
                end_sec: channel.duration_sec,
                size_bytes,
                speaker_id: channel.speaker_id.clone(),
            }]);
        }

        tracing::info!(
            channel = %channel.channel_id,
            size_bytes,
            count = plans.len(),
            "Splitting channel into chunks"
        );

        let mut chunks = Vec::with_capacity(plans.len());
        for (index, plan) in plans.iter().enumerate() {
            let chunk_id = format!("chunk_{:03}_{}", index + 1, short_id());
            let extension = channel
                .path
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("wav");
            let chunk_path = self.scratch.path().join(format!("{chunk_id}.{extension}"));

            ffmpeg::run_ffmpeg(&[
                "-i",
                &channel.path.to_string_lossy(),
                "-ss",
                &plan.start_sec.to_string(),
                "-t",
                &(plan.end_sec - plan.start_sec).to_string(),
                "-c",
                "copy",
                &chunk_path.to_string_lossy(),
            ])
            .await?;

            let chunk_size = tokio::fs::metadata(&chunk_path).await?.len();
            tracing::info!(
                chunk_id = %chunk_id,
                start = plan.start_sec,
                end = plan.end_sec,
                size_bytes = chunk_size,
                "Created chunk"
            );

            chunks.push(AudioChunk {
                chunk_id,
                file_path: chunk_path,
                start_sec: plan.start_sec,
                end_sec: plan.end_sec,
                size_bytes: chunk_size,
                speaker_id: channel.speaker_id.clone(),
            });
        }

        Ok(chunks)
    }
}

fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}
