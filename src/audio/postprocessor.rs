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
use serde::Serialize;
use std::collections::BTreeMap;

use crate::audio::types::SpeakerSegment;

const REPEAT_THRESHOLD: usize = 3;

#[derive(Debug, Clone, Serialize)]
pub struct ConversationTurn {
    pub turn_id: usize,
    pub speaker_id: String,
    pub start_sec: f64,
    pub end_sec: f64,
    pub duration: f64,
    pub text: String,
    pub confidence: f64,
    pub word_count: usize,
    pub gap_from_previous: f64,
    pub speaker_changed: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SpeakerStats {
    pub segment_count: usize,
    pub total_speaking_time: f64,
    pub total_words: usize,
    pub avg_confidence: f64,
    pub longest_segment: f64,
    pub shortest_segment: f64,
    pub avg_segment_duration: f64,
    pub speaking_percentage: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TimingSummary {
    pub total_duration: f64,
    pub total_speaking_time: f64,
    pub total_silence_time: f64,
    pub speaking_percentage: f64,
    pub silence_percentage: f64,
    pub average_gap: f64,
    pub max_gap: f64,
    pub total_gaps: usize,
    pub speaker_changes: usize,
    pub segments_per_minute: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FinalTranscript {
    pub text: String,
    pub conversation_flow: Vec<ConversationTurn>,
    pub speaker_summary: BTreeMap<String, SpeakerStats>,
    pub timing_summary: TimingSummary,
    pub confidence: f64,
}

/// Final assembly: hallucination-condensed, speaker-labeled transcript plus
/// the summary metrics, all derived from one pass over the segment list.
pub struct TranscriptionPostProcessor;

impl TranscriptionPostProcessor {
    pub fn new() -> Self {
        Self
    }

    pub fn create_final_transcript(
        &self,
        speaker_segments: &[SpeakerSegment],
    ) -> Result<FinalTranscript> {
        if speaker_segments.is_empty() {
            anyhow::bail!("no speaker segments provided for transcript creation");
        }

        let mut segments: Vec<SpeakerSegment> = speaker_segments.to_vec();
        segments.sort_by(|a, b| a.start_sec.total_cmp(&b.start_sec));
        for segment in &mut segments {
            segment.text = condense_repetitions(&segment.text);
        }

        let text = consolidated_transcript(&segments);
        let conversation_flow = conversation_flow(&segments);
        let speaker_summary = speaker_summary(&segments);
        let timing_summary = timing_summary(&segments);
        let confidence = overall_confidence(&segments);

        tracing::info!(
            characters = text.len(),
            turns = conversation_flow.len(),
            confidence,
            "Final transcript assembled"
        );

        Ok(FinalTranscript {
            text,
            conversation_flow,
            speaker_summary,
            timing_summary,
            confidence,
        })
    }

    /// SRT subtitle rendering of the conversation flow.
    pub fn export_srt(&self, transcript: &FinalTranscript) -> String {
        let mut lines = Vec::new();
        for (index, turn) in transcript.conversation_flow.iter().enumerate() {
            lines.push(format!("{}", index + 1));
            lines.push(format!(
                "{} --> {}",
                srt_time(turn.start_sec),
                srt_time(turn.end_sec)
            ));
            lines.push(format!("{}: {}", turn.speaker_id, turn.text));
            lines.push(String::new());
        }
        lines.join("\n")
    }

    /// Bare `speaker: text` lines, one per turn.
    pub fn export_conversation(&self, transcript: &FinalTranscript) -> String {
        transcript
            .conversation_flow
            .iter()
            .map(|turn| format!("{}: {}", turn.speaker_id, turn.text))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Machine-readable rendering for API consumers.
    pub fn export_json(&self, transcript: &FinalTranscript) -> serde_json::Value {
        serde_json::json!({
            "conversation": transcript.conversation_flow,
            "summary": transcript.speaker_summary,
            "timing": transcript.timing_summary,
            "confidence": transcript.confidence,
        })
    }
}

impl Default for TranscriptionPostProcessor {
    fn default() -> Self {
        Self::new()
    }
}

/// Collapse model-emitted repetition: any contiguous phrase repeated more
/// than three times in a row becomes three copies followed by `...`.
/// The longest repeated extent wins; ties go to the shorter phrase. Repeats
/// until a full pass changes nothing, and compares case-insensitively.
pub fn condense_repetitions(text: &str) -> String {
    let mut words: Vec<String> = text.split_whitespace().map(str::to_string).collect();

    loop {
        let Some((start, length, count)) = best_repetition(&words) else {
            break;
        };

        let kept = REPEAT_THRESHOLD * length;
        let mut rewritten: Vec<String> = Vec::with_capacity(words.len());
        rewritten.extend_from_slice(&words[..start + kept]);
        if let Some(last) = rewritten.last_mut() {
            last.push_str("...");
        }
        rewritten.extend_from_slice(&words[start + count * length..]);
        words = rewritten;
    }

    words.join(" ")
}

/// Find the repetition with the largest repeated extent (`length × count`),
/// preferring shorter phrases and earlier positions on ties.
fn best_repetition(words: &[String]) -> Option<(usize, usize, usize)> {
    let mut best: Option<(usize, usize, usize)> = None;
    let mut best_extent = 0usize;

    let max_length = words.len() / (REPEAT_THRESHOLD + 1);
    for length in 1..=max_length {
        for start in 0..words.len().saturating_sub(length * 2 - 1) {
            let mut count = 1;
            while start + (count + 1) * length <= words.len()
                && phrase_eq(
                    &words[start..start + length],
                    &words[start + count * length..start + (count + 1) * length],
                )
            {
                count += 1;
            }

            if count <= REPEAT_THRESHOLD {
                continue;
            }

            let extent = count * length;
            let better = match best {
                None => true,
                // strictly larger extent wins; equal extent keeps the
                // earlier, shorter find (scan order guarantees both)
                Some(_) => extent > best_extent,
            };
            if better {
                best = Some((start, length, count));
                best_extent = extent;
            }
        }
    }

    best
}

fn phrase_eq(a: &[String], b: &[String]) -> bool {
    a.len() == b.len()
        && a.iter()
            .zip(b.iter())
            .all(|(x, y)| x.eq_ignore_ascii_case(y))
}

/// Speaker labels only appear when the speaker changes; same-speaker runs
/// are joined into one line.
fn consolidated_transcript(segments: &[SpeakerSegment]) -> String {
    let mut lines: Vec<String> = Vec::new();
    let mut current_speaker: Option<&str> = None;
    let mut buffer: Vec<&str> = Vec::new();

    for segment in segments {
        if current_speaker != Some(segment.speaker_id.as_str()) {
            if let Some(speaker) = current_speaker {
                lines.push(format!("{speaker}: {}", buffer.join(" ")));
            }
            current_speaker = Some(&segment.speaker_id);
            buffer = vec![&segment.text];
        } else {
            buffer.push(&segment.text);
        }
    }
    if let Some(speaker) = current_speaker {
        lines.push(format!("{speaker}: {}", buffer.join(" ")));
    }

    lines.join("\n")
}

fn conversation_flow(segments: &[SpeakerSegment]) -> Vec<ConversationTurn> {
    segments
        .iter()
        .enumerate()
        .map(|(i, segment)| {
            let (gap_from_previous, speaker_changed) = if i == 0 {
                (0.0, true)
            } else {
                let previous = &segments[i - 1];
                (
                    segment.start_sec - previous.end_sec,
                    segment.speaker_id != previous.speaker_id,
                )
            };

            ConversationTurn {
                turn_id: i + 1,
                speaker_id: segment.speaker_id.clone(),
                start_sec: segment.start_sec,
                end_sec: segment.end_sec,
                duration: segment.duration(),
                text: segment.text.clone(),
                confidence: segment.confidence,
                word_count: segment.word_count(),
                gap_from_previous,
                speaker_changed,
            }
        })
        .collect()
}

fn speaker_summary(segments: &[SpeakerSegment]) -> BTreeMap<String, SpeakerStats> {
    let total_conversation_time = segments
        .iter()
        .map(|s| s.end_sec)
        .fold(0.0f64, f64::max);

    let mut confidences: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    let mut stats: BTreeMap<String, SpeakerStats> = BTreeMap::new();

    for segment in segments {
        let entry = stats
            .entry(segment.speaker_id.clone())
            .or_insert_with(|| SpeakerStats {
                shortest_segment: f64::INFINITY,
                ..SpeakerStats::default()
            });
        let duration = segment.duration();

        entry.segment_count += 1;
        entry.total_speaking_time += duration;
        entry.total_words += segment.word_count();
        entry.longest_segment = entry.longest_segment.max(duration);
        entry.shortest_segment = entry.shortest_segment.min(duration);
        confidences
            .entry(segment.speaker_id.clone())
            .or_default()
            .push(segment.confidence);
    }

    for (speaker, entry) in stats.iter_mut() {
        if let Some(list) = confidences.get(speaker) {
            entry.avg_confidence = list.iter().sum::<f64>() / list.len() as f64;
        }
        if total_conversation_time > 0.0 {
            entry.speaking_percentage = entry.total_speaking_time / total_conversation_time * 100.0;
        }
        if entry.shortest_segment.is_infinite() {
            entry.shortest_segment = 0.0;
        }
        entry.avg_segment_duration = entry.total_speaking_time / entry.segment_count.max(1) as f64;
    }

    stats
}

fn timing_summary(segments: &[SpeakerSegment]) -> TimingSummary {
    if segments.is_empty() {
        return TimingSummary::default();
    }

    let start = segments[0].start_sec;
    let end = segments.iter().map(|s| s.end_sec).fold(0.0f64, f64::max);
    let total_duration = end - start;
    let total_speaking_time: f64 = segments.iter().map(SpeakerSegment::duration).sum();
    let total_silence_time = (total_duration - total_speaking_time).max(0.0);

    let mut gaps = Vec::new();
    let mut speaker_changes = 0;
    for pair in segments.windows(2) {
        let gap = pair[1].start_sec - pair[0].end_sec;
        if gap > 0.0 {
            gaps.push(gap);
        }
        if pair[1].speaker_id != pair[0].speaker_id {
            speaker_changes += 1;
        }
    }

    TimingSummary {
        total_duration,
        total_speaking_time,
        total_silence_time,
        speaking_percentage: percentage(total_speaking_time, total_duration),
        silence_percentage: percentage(total_silence_time, total_duration),
        average_gap: if gaps.is_empty() {
            0.0
        } else {
            gaps.iter().sum::<f64>() / gaps.len() as f64
        },
        max_gap: gaps.iter().copied().fold(0.0, f64::max),
        total_gaps: gaps.len(),
        speaker_changes,
        segments_per_minute: if total_duration > 0.0 {
            segments.len() as f64 / (total_duration / 60.0)
        } else {
            0.0
        },
    }
}

fn percentage(part: f64, whole: f64) -> f64 {
    if whole > 0.0 {
        part / whole * 100.0
    } else {
        0.0
    }
}

/// Duration-weighted confidence over all segments, clamped to [0, 1].
fn overall_confidence(segments: &[SpeakerSegment]) -> f64 {
    let mut weighted = 0.0;
    let mut total = 0.0;
    for segment in segments {
        let duration = segment.duration();
        weighted += segment.confidence * duration;
        total += duration;
    }
    if total > 0.0 {
        (weighted / total).clamp(0.0, 1.0)
    } else {
        0.0
    }
}

fn srt_time(seconds: f64) -> String {
    let hours = (seconds / 3600.0) as u64;
    let minutes = ((seconds % 3600.0) / 60.0) as u64;
    let secs = (seconds % 60.0) as u64;
    let millis = ((seconds % 1.0) * 1000.0) as u64;
    format!("{hours:02}:{minutes:02}:{secs:02},{millis:03}")
}
