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
use serde::Deserialize;
use std::path::Path;
use tokio::process::Command;

use crate::audio::types::AudioInfo;

#[derive(Debug, Deserialize)]
struct ProbeStream {
    #[serde(default)]
    channels: Option<u16>,
    #[serde(default)]
    sample_rate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    #[serde(default)]
    duration: Option<String>,
    #[serde(default)]
    format_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: ProbeFormat,
}

/// Inspect an audio file with ffprobe.
pub async fn probe(path: &Path) -> Result<AudioInfo> {
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
            "-select_streams",
            "a:0",
            &path.to_string_lossy(),
        ])
        .output()
        .await
        .context("Failed to run ffprobe")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("ffprobe failed for {}: {stderr}", path.display());
    }

    let parsed: ProbeOutput = serde_json::from_slice(&output.stdout)
        .context("Failed to parse ffprobe output")?;

    let stream = parsed.streams.first();
    let duration_sec = parsed
        .format
        .duration
        .as_deref()
        .and_then(|d| d.parse::<f64>().ok())
        .unwrap_or(0.0);

    let size_bytes = tokio::fs::metadata(path)
        .await
        .map(|m| m.len())
        .unwrap_or(0);

    Ok(AudioInfo {
        duration_sec,
        sample_rate: stream
            .and_then(|s| s.sample_rate.as_deref())
            .and_then(|r| r.parse::<u32>().ok())
            .unwrap_or(0),
        channels: stream.and_then(|s| s.channels).unwrap_or(0),
        size_bytes,
        format: parsed.format.format_name.unwrap_or_default(),
    })
}

/// Run ffmpeg with `-y` appended, surfacing stderr on failure.
pub async fn run_ffmpeg(args: &[&str]) -> Result<()> {
    let output = Command::new("ffmpeg")
        .args(args)
        .arg("-y")
        .output()
        .await
        .context("Failed to run ffmpeg")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("ffmpeg failed: {stderr}");
    }
    Ok(())
}

/// Duration of a WAV file from its header, without a subprocess. Falls back
/// to ffprobe for other containers.
pub async fn duration_of(path: &Path) -> Result<f64> {
    if path.extension().and_then(|e| e.to_str()) == Some("wav") {
        let reader = hound::WavReader::open(path)
            .with_context(|| format!("Failed to open WAV file {}", path.display()))?;
        let spec = reader.spec();
        if spec.sample_rate > 0 {
            return Ok(reader.duration() as f64 / spec.sample_rate as f64);
        }
    }
    Ok(probe(path).await?.duration_sec)
}
