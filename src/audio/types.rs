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

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

pub const SPEAKER_ONE: &str = "Speaker_1";
pub const SPEAKER_TWO: &str = "Speaker_2";

/// Which side of the stereo recording a channel came from. The mapping is
/// fixed: left is `Speaker_1`, right is `Speaker_2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelId {
    Left,
    Right,
}

impl ChannelId {
    pub fn speaker_id(&self) -> &'static str {
        match self {
            ChannelId::Left => SPEAKER_ONE,
            ChannelId::Right => SPEAKER_TWO,
        }
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelId::Left => write!(f, "left"),
            ChannelId::Right => write!(f, "right"),
        }
    }
}

/// One preprocessed mono stream: 16 kHz, silence-trimmed, ready to chunk.
#[derive(Debug, Clone)]
pub struct ChannelAudio {
    pub channel_id: ChannelId,
    pub speaker_id: String,
    pub path: PathBuf,
    pub duration_sec: f64,
    pub size_mb: f64,
}

/// A contiguous, size-bounded slice of one channel, addressed in
/// original-audio time.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub chunk_id: String,
    pub file_path: PathBuf,
    pub start_sec: f64,
    pub end_sec: f64,
    pub size_bytes: u64,
    pub speaker_id: String,
}

impl AudioChunk {
    pub fn duration(&self) -> f64 {
        self.end_sec - self.start_sec
    }
}

/// A timestamped, speaker-attributed span of text. Timestamps are in
/// original-audio coordinates and never mutated after construction; the
/// rebase from chunk-local time happens exactly once, at fan-out reassembly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeakerSegment {
    pub start_sec: f64,
    pub end_sec: f64,
    pub speaker_id: String,
    pub text: String,
    pub confidence: f64,
}

impl SpeakerSegment {
    pub fn new(
        start_sec: f64,
        end_sec: f64,
        speaker_id: impl Into<String>,
        text: impl Into<String>,
        confidence: f64,
    ) -> Self {
        Self {
            start_sec,
            end_sec,
            speaker_id: speaker_id.into(),
            text: text.into(),
            confidence,
        }
    }

    pub fn duration(&self) -> f64 {
        self.end_sec - self.start_sec
    }

    pub fn word_count(&self) -> usize {
        self.text.split_whitespace().count()
    }
}

/// Basic facts about an audio file, from ffprobe.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AudioInfo {
    pub duration_sec: f64,
    pub sample_rate: u32,
    pub channels: u16,
    pub size_bytes: u64,
    pub format: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DiarizationSummary {
    pub num_speakers: usize,
    pub num_segments: usize,
    pub total_duration: f64,
}

/// Everything we know about a pipeline run, populated up to the point of
/// failure when a stage short-circuits.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessingMetadata {
    pub filename: String,
    pub processing_time_seconds: f64,
    pub transcription_method: String,
    pub chunk_method: String,
    pub total_chunks: usize,
    pub has_speaker_alignment: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diarization_summary: Option<DiarizationSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_audio_info: Option<AudioInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preprocessed_audio_info: Option<AudioInfo>,
}

impl ProcessingMetadata {
    pub fn failed(filename: &str, elapsed_seconds: f64) -> Self {
        Self {
            filename: filename.to_string(),
            processing_time_seconds: elapsed_seconds,
            transcription_method: "failed".to_string(),
            chunk_method: "none".to_string(),
            total_chunks: 0,
            has_speaker_alignment: false,
            diarization_summary: None,
            original_audio_info: None,
            preprocessed_audio_info: None,
        }
    }
}

/// Internal result of one pipeline run, before it is mapped onto the
/// out-queue envelope.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub text: String,
    pub diarization: bool,
    pub confidence: f64,
    pub speaker_segments: Vec<SpeakerSegment>,
    pub processing_metadata: ProcessingMetadata,
}
