use chrono::Utc;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::time::Duration;

use crate::model::{count_words, Metadata, Segment, TranscriptRecord, Units, WorkItem};
use crate::transcribe::RawPayload;

#[derive(Debug, thiserror::Error)]
#[error("malformed {backend} payload: {source}")]
pub struct NormalizationError {
    backend: &'static str,
    #[source]
    source: serde_json::Error,
}

#[derive(Deserialize, Debug)]
struct WhisperOutput {
    #[serde(default)]
    transcription: Vec<WhisperSegment>,
}

#[derive(Deserialize, Debug)]
struct WhisperSegment {
    text: String,
    offsets: WhisperOffsets,
    #[serde(default)]
    timestamps: Option<WhisperTimestamps>,
}

#[derive(Deserialize, Debug)]
struct WhisperOffsets {
    from: i64,
    to: i64,
}

#[derive(Deserialize, Debug)]
struct WhisperTimestamps {
    from: String,
    to: String,
}

#[derive(Deserialize, Debug)]
struct AssemblyAiTranscript {
    /// Whole seconds of audio, as reported by the service.
    #[serde(default)]
    audio_duration: Option<f64>,
    #[serde(default)]
    utterances: Option<Vec<Utterance>>,
}

#[derive(Deserialize, Debug)]
struct Utterance {
    text: String,
    start: i64,
    end: i64,
    #[serde(default)]
    speaker: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
}

/// Turns a backend payload into the common record. `processed_at` is a
/// placeholder here; the store stamps the real write time.
pub fn normalize(
    item: &WorkItem,
    payload: RawPayload,
    processing_time: Duration,
) -> Result<TranscriptRecord, NormalizationError> {
    let (units, duration_seconds, unit_count) = match payload {
        RawPayload::Segments(json) => {
            let out: WhisperOutput = serde_json::from_value(json).map_err(|source| {
                NormalizationError {
                    backend: "whisper",
                    source,
                }
            })?;
            let segments: Vec<_> = out
                .transcription
                .into_iter()
                .map(|s| {
                    let mut seg = Segment::new(&s.text, s.offsets.from, s.offsets.to);
                    if let Some(ts) = s.timestamps {
                        seg.timestamp_from = Some(ts.from);
                        seg.timestamp_to = Some(ts.to);
                    }
                    seg
                })
                .collect();
            let duration = last_end_seconds(&segments);
            let count = segments.len();
            (Units::Segments(segments), duration, count)
        }
        RawPayload::Utterances(json) => {
            let out: AssemblyAiTranscript =
                serde_json::from_value(json).map_err(|source| NormalizationError {
                    backend: "assemblyai",
                    source,
                })?;
            let utterances: Vec<_> = out
                .utterances
                .unwrap_or_default()
                .into_iter()
                .map(|u| {
                    let mut seg = Segment::new(&u.text, u.start, u.end);
                    seg.speaker = u.speaker;
                    seg.confidence = u.confidence;
                    seg
                })
                .collect();
            let speakers: BTreeSet<_> = utterances
                .iter()
                .filter_map(|u| u.speaker.as_deref())
                .collect();
            let speakers = speakers.len();
            let duration = out
                .audio_duration
                .filter(|d| d.is_finite() && *d >= 0.0)
                .unwrap_or_else(|| last_end_seconds(&utterances));
            (Units::Utterances(utterances), duration, speakers)
        }
    };

    let full_text = units
        .as_slice()
        .iter()
        .map(|s| s.text.as_str())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    let word_count = count_words(&full_text);

    Ok(TranscriptRecord {
        episode_id: item.id.clone(),
        season: item.season.clone(),
        episode_number: item.episode.clone(),
        metadata: Metadata {
            duration_seconds,
            processing_time_seconds: processing_time.as_secs_f64(),
            word_count,
            unit_count,
            processed_at: Utc::now(),
        },
        full_text,
        units,
    })
}

fn last_end_seconds(units: &[Segment]) -> f64 {
    units
        .last()
        .map(|s| s.end_ms.max(0) as f64 / 1000.0)
        .unwrap_or(0.0)
}
