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
use std::collections::{BTreeSet, HashMap};

use crate::audio::transcriber::ChannelTranscript;
use crate::audio::types::{DiarizationSummary, SpeakerSegment};

/// A detected cross-speaker overlap window.
#[derive(Debug, Clone)]
struct Overlap {
    start_sec: f64,
    end_sec: f64,
    speaker_a: String,
    speaker_b: String,
}

impl Overlap {
    fn duration(&self) -> f64 {
        self.end_sec - self.start_sec
    }
}

/// Channel-based speaker diarization: merges per-channel transcriptions into
/// one overlap-resolved, time-ordered list of speaker segments.
///
/// Channels arrive already speaker-attributed (left/right mapping), so the
/// work here is resolving cross-talk, not identifying voices.
pub struct SpeakerDiarizer {
    merge_threshold: f64,
    min_segment_duration: f64,
}

impl SpeakerDiarizer {
    pub fn new(merge_threshold: f64, min_segment_duration: f64) -> Self {
        Self {
            merge_threshold,
            min_segment_duration,
        }
    }

    /// Produce the final segment list from the per-channel transcripts.
    pub fn create_speaker_segments(
        &self,
        channels: &[ChannelTranscript],
    ) -> Result<Vec<SpeakerSegment>> {
        let mut segments: Vec<SpeakerSegment> = channels
            .iter()
            .flat_map(|c| c.segments.iter().cloned())
            .filter(|s| s.duration() >= self.min_segment_duration && !s.text.trim().is_empty())
            .collect();

        if segments.is_empty() {
            anyhow::bail!("no valid segments to diarize");
        }

        segments.sort_by(|a, b| a.start_sec.total_cmp(&b.start_sec));

        let speakers: BTreeSet<&str> = segments.iter().map(|s| s.speaker_id.as_str()).collect();
        if speakers.len() > 1 {
            let overlaps = detect_overlaps(&segments);
            if !overlaps.is_empty() {
                tracing::info!(
                    overlaps = overlaps.len(),
                    total_overlap = overlaps.iter().map(Overlap::duration).sum::<f64>(),
                    "Resolving cross-speaker overlaps"
                );
                segments = resolve_overlaps(segments, &overlaps);
            }
        }

        let merged = self.merge_consecutive(segments);
        let cleaned = self.cleanup(merged);

        tracing::info!(segments = cleaned.len(), "Speaker diarization completed");
        Ok(cleaned)
    }

    /// Merge consecutive segments of the same speaker whose gap is within
    /// the threshold: text concatenated, end extended, confidence averaged.
    fn merge_consecutive(&self, segments: Vec<SpeakerSegment>) -> Vec<SpeakerSegment> {
        let mut iter = segments.into_iter();
        let Some(mut current) = iter.next() else {
            return Vec::new();
        };

        let mut merged = Vec::new();
        for next in iter {
            let gap = next.start_sec - current.end_sec;
            if next.speaker_id == current.speaker_id && gap <= self.merge_threshold {
                current = SpeakerSegment::new(
                    current.start_sec,
                    next.end_sec.max(current.end_sec),
                    &current.speaker_id,
                    format!("{} {}", current.text, next.text),
                    (current.confidence + next.confidence) / 2.0,
                );
            } else {
                merged.push(current);
                current = next;
            }
        }
        merged.push(current);
        merged
    }

    /// Normalize whitespace and drop anything that fell below the validity
    /// bar during earlier steps.
    fn cleanup(&self, segments: Vec<SpeakerSegment>) -> Vec<SpeakerSegment> {
        segments
            .into_iter()
            .filter_map(|segment| {
                let text = segment.text.split_whitespace().collect::<Vec<_>>().join(" ");
                if text.is_empty()
                    || segment.end_sec <= segment.start_sec
                    || segment.duration() < self.min_segment_duration
                {
                    return None;
                }
                Some(SpeakerSegment::new(
                    segment.start_sec,
                    segment.end_sec,
                    &segment.speaker_id,
                    text,
                    segment.confidence,
                ))
            })
            .collect()
    }

    pub fn summary(&self, segments: &[SpeakerSegment]) -> DiarizationSummary {
        let speakers: BTreeSet<&str> = segments.iter().map(|s| s.speaker_id.as_str()).collect();
        DiarizationSummary {
            num_speakers: speakers.len(),
            num_segments: segments.len(),
            total_duration: segments.iter().map(SpeakerSegment::duration).sum(),
        }
    }
}

/// Pairwise scan of the sorted list for intersecting spans of different
/// speakers.
fn detect_overlaps(segments: &[SpeakerSegment]) -> Vec<Overlap> {
    let mut overlaps = Vec::new();

    for i in 0..segments.len() {
        let current = &segments[i];
        for next in &segments[i + 1..] {
            // sorted by start: once a segment starts after we end, no later
            // one can overlap either
            if next.start_sec >= current.end_sec {
                break;
            }
            if next.speaker_id == current.speaker_id {
                continue;
            }

            let start = current.start_sec.max(next.start_sec);
            let end = current.end_sec.min(next.end_sec);
            if end > start {
                overlaps.push(Overlap {
                    start_sec: start,
                    end_sec: end,
                    speaker_a: current.speaker_id.clone(),
                    speaker_b: next.speaker_id.clone(),
                });
            }
        }
    }

    overlaps
}

/// For each overlap window, score the participants and remove non-dominant
/// segments that sit (half or more) inside the window.
fn resolve_overlaps(segments: Vec<SpeakerSegment>, overlaps: &[Overlap]) -> Vec<SpeakerSegment> {
    let mut to_remove: BTreeSet<usize> = BTreeSet::new();

    for overlap in overlaps {
        let participants: Vec<(usize, &SpeakerSegment)> = segments
            .iter()
            .enumerate()
            .filter(|(_, s)| {
                s.start_sec < overlap.end_sec
                    && s.end_sec > overlap.start_sec
                    && (s.speaker_id == overlap.speaker_a || s.speaker_id == overlap.speaker_b)
            })
            .collect();

        if participants.len() < 2 {
            continue;
        }

        let dominant = dominant_speaker(&participants, overlap);

        for (index, segment) in &participants {
            if segment.speaker_id == dominant {
                continue;
            }

            let inside_start = segment.start_sec.max(overlap.start_sec);
            let inside_end = segment.end_sec.min(overlap.end_sec);
            let inside = (inside_end - inside_start).max(0.0);
            let fraction = if segment.duration() > 0.0 {
                inside / segment.duration()
            } else {
                0.0
            };
            let fully_inside =
                segment.start_sec >= overlap.start_sec && segment.end_sec <= overlap.end_sec;

            if fraction >= 0.5 || fully_inside {
                tracing::debug!(
                    speaker = %segment.speaker_id,
                    start = segment.start_sec,
                    end = segment.end_sec,
                    fraction,
                    "Removing non-dominant overlapping segment"
                );
                to_remove.insert(*index);
            }
        }
    }

    segments
        .into_iter()
        .enumerate()
        .filter(|(i, _)| !to_remove.contains(i))
        .map(|(_, s)| s)
        .collect()
}

/// Dominance per segment: 70% duration coverage of the window, 30% text
/// density (estimated words in the window against a 3 words/second ceiling).
/// The dominant speaker has the highest average across its segments.
fn dominant_speaker(participants: &[(usize, &SpeakerSegment)], overlap: &Overlap) -> String {
    let mut scores: HashMap<&str, Vec<f64>> = HashMap::new();
    let window = overlap.duration();

    for (_, segment) in participants {
        let inside_start = segment.start_sec.max(overlap.start_sec);
        let inside_end = segment.end_sec.min(overlap.end_sec);
        let inside = inside_end - inside_start;
        if inside <= 0.0 || window <= 0.0 {
            continue;
        }

        let duration_score = inside / window;

        let total_words = segment.word_count() as f64;
        let text_score = if segment.duration() > 0.0 && total_words > 0.0 {
            let words_in_overlap = (total_words * inside / segment.duration()).round().max(1.0);
            (words_in_overlap / (inside * 3.0)).min(1.0)
        } else {
            0.1
        };

        let score = 0.7 * duration_score + 0.3 * text_score;
        scores.entry(segment.speaker_id.as_str()).or_default().push(score);
    }

    scores
        .into_iter()
        .map(|(speaker, list)| {
            let avg = list.iter().sum::<f64>() / list.len() as f64;
            (speaker.to_string(), avg)
        })
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(speaker, _)| speaker)
        .unwrap_or_else(|| overlap.speaker_a.clone())
}
