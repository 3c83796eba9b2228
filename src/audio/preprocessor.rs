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
use std::path::Path;
use tempfile::TempDir;

use crate::audio::ffmpeg;
use crate::audio::types::{AudioInfo, ChannelAudio, ChannelId};

const SILENCE_THRESHOLD_DB: i32 = -40;
const SILENCE_MIN_RUN_SECS: f64 = 0.5;
const SILENCE_PADDING_SECS: f64 = 0.1;

#[derive(Debug)]
pub struct PreprocessOutput {
    pub channels: Vec<ChannelAudio>,
    /// False for mono inputs; diarization is unavailable downstream.
    pub stereo: bool,
    pub original_info: AudioInfo,
}

/// Splits a stereo recording into two mono streams (left → `Speaker_1`,
/// right → `Speaker_2`), resamples to the target rate and trims leading and
/// trailing silence. Emitted files live in a scratch directory that is
/// removed when the preprocessor is dropped.
pub struct AudioPreprocessor {
    target_sample_rate: u32,
    output_format: String,
    scratch: TempDir,
}

impl AudioPreprocessor {
    pub fn new(target_sample_rate: u32, output_format: &str) -> Result<Self> {
        let scratch = tempfile::Builder::new()
            .prefix("whisper_preprocessed_")
            .tempdir()
            .context("Failed to create preprocessing scratch directory")?;
        tracing::debug!(dir = %scratch.path().display(), "Created preprocessing scratch directory");

        Ok(Self {
            target_sample_rate,
            output_format: output_format.to_string(),
            scratch,
        })
    }

    pub async fn preprocess(&self, input: &Path) -> Result<PreprocessOutput> {
        let original_info = ffmpeg::probe(input)
            .await
            .context("Failed to probe input audio")?;
        tracing::info!(
            duration = original_info.duration_sec,
            sample_rate = original_info.sample_rate,
            channels = original_info.channels,
            "Preprocessing audio"
        );

        let stereo = original_info.channels >= 2;
        if !stereo {
            tracing::warn!("Input is not stereo; emitting a single channel without diarization");
        }

        let channel_ids: &[ChannelId] = if stereo {
            &[ChannelId::Left, ChannelId::Right]
        } else {
            &[ChannelId::Left]
        };

        let mut channels = Vec::with_capacity(channel_ids.len());
        for &channel_id in channel_ids {
            let channel = self
                .extract_channel(input, channel_id, stereo)
                .await
                .with_context(|| format!("Failed to extract {channel_id} channel"))?;
            channels.push(channel);
        }

        Ok(PreprocessOutput {
            channels,
            stereo,
            original_info,
        })
    }

    async fn extract_channel(
        &self,
        input: &Path,
        channel_id: ChannelId,
        stereo: bool,
    ) -> Result<ChannelAudio> {
        let output_path = self
            .scratch
            .path()
            .join(format!("{channel_id}.{}", self.output_format));

        let filter = channel_filter(channel_id, stereo, self.target_sample_rate);
        ffmpeg::run_ffmpeg(&[
            "-i",
            &input.to_string_lossy(),
            "-af",
            &filter,
            "-ac",
            "1",
            &output_path.to_string_lossy(),
        ])
        .await?;

        let duration_sec = ffmpeg::duration_of(&output_path).await?;
        let size_bytes = tokio::fs::metadata(&output_path).await?.len();
        let size_mb = size_bytes as f64 / (1024.0 * 1024.0);

        tracing::info!(
            channel = %channel_id,
            duration = duration_sec,
            size_mb,
            "Channel extracted"
        );

        Ok(ChannelAudio {
            channel_id,
            speaker_id: channel_id.speaker_id().to_string(),
            path: output_path,
            duration_sec,
            size_mb,
        })
    }
}

/// The per-channel filter chain: pick one side of the stereo image,
/// resample, then strip silence runs of at least 500 ms below −40 dBFS from
/// both ends, keeping 100 ms of padding.
fn channel_filter(channel_id: ChannelId, stereo: bool, sample_rate: u32) -> String {
    let trim = format!(
        "silenceremove=start_periods=1:start_duration={run}:start_threshold={db}dB:start_silence={pad},\
         areverse,\
         silenceremove=start_periods=1:start_duration={run}:start_threshold={db}dB:start_silence={pad},\
         areverse",
        run = SILENCE_MIN_RUN_SECS,
        db = SILENCE_THRESHOLD_DB,
        pad = SILENCE_PADDING_SECS,
    );

    if stereo {
        let source = match channel_id {
            ChannelId::Left => "FL",
            ChannelId::Right => "FR",
        };
        format!("pan=mono|c0={source},aresample={sample_rate},{trim}")
    } else {
        format!("aresample={sample_rate},{trim}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stereo_filter_selects_the_channel() {
        let left = channel_filter(ChannelId::Left, true, 16_000);
        let right = channel_filter(ChannelId::Right, true, 16_000);

        assert!(left.starts_with("pan=mono|c0=FL,aresample=16000,"));
        assert!(right.starts_with("pan=mono|c0=FR,aresample=16000,"));
        assert!(left.contains("silenceremove=start_periods=1:start_duration=0.5"));
        assert!(left.contains("start_threshold=-40dB"));
        assert!(left.contains("start_silence=0.1"));
    }

    #[test]
    fn mono_filter_skips_the_pan() {
        let filter = channel_filter(ChannelId::Left, false, 16_000);
        assert!(filter.starts_with("aresample=16000,"));
        assert!(!filter.contains("pan="));
    }

    #[test]
    fn trim_runs_on_both_ends() {
        let filter = channel_filter(ChannelId::Left, true, 16_000);
        assert_eq!(filter.matches("silenceremove").count(), 2);
        assert_eq!(filter.matches("areverse").count(), 2);
    }
}
