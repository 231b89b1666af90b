use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One audio file to transcribe, derived from its `SxxEyy` file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub id: String,
    pub season: String,
    pub episode: String,
    pub source_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub text: String,
    pub start_ms: i64,
    pub end_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp_from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp_to: Option<String>,
    pub word_count: usize,
}

impl Segment {
    /// Builds a segment from raw backend values, trimming the text and
    /// clamping an inverted time range.
    pub fn new(text: &str, start_ms: i64, end_ms: i64) -> Self {
        let text = text.trim().to_string();
        Segment {
            word_count: count_words(&text),
            text,
            start_ms,
            end_ms: end_ms.max(start_ms),
            speaker: None,
            confidence: None,
            timestamp_from: None,
            timestamp_to: None,
        }
    }
}

/// The transcribed units of an episode. The local backend yields timed
/// segments, the hosted backend yields speaker-labeled utterances; both
/// share the `Segment` shape but are stored under different keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Units {
    Segments(Vec<Segment>),
    Utterances(Vec<Segment>),
}

impl Units {
    pub fn as_slice(&self) -> &[Segment] {
        match self {
            Units::Segments(s) | Units::Utterances(s) => s,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Units::Segments(_) => "segments",
            Units::Utterances(_) => "speakers",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub duration_seconds: f64,
    pub processing_time_seconds: f64,
    pub word_count: usize,
    /// Segment count for the local backend, distinct speakers for the hosted one.
    pub unit_count: usize,
    pub processed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptRecord {
    pub episode_id: String,
    pub season: String,
    pub episode_number: String,
    pub metadata: Metadata,
    pub full_text: String,
    #[serde(flatten)]
    pub units: Units,
}

/// Aggregate counters for a single batch run. Only ever incremented.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchStats {
    pub processed: usize,
    pub skipped: usize,
    pub errors: usize,
    pub total_duration_seconds: f64,
    pub total_words: usize,
}

impl BatchStats {
    pub fn record_success(&mut self, record: &TranscriptRecord) {
        self.processed += 1;
        self.total_duration_seconds += record.metadata.duration_seconds;
        self.total_words += record.metadata.word_count;
    }

    pub fn average_words(&self) -> Option<f64> {
        (self.processed > 0).then(|| self.total_words as f64 / self.processed as f64)
    }
}

pub fn count_words(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Formats a millisecond offset as `HH:MM:SS,mmm`.
pub fn ms_to_timestamp(ms: i64) -> String {
    let ms = ms.max(0);
    let h = ms / 3_600_000;
    let m = (ms / 60_000) % 60;
    let s = (ms / 1000) % 60;
    let frac = ms % 1000;
    format!("{h:02}:{m:02}:{s:02},{frac:03}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_ones() {
        assert_eq!(ms_to_timestamp(3_661_300), "01:01:01,300");
    }

    #[test]
    fn zero_fract() {
        assert_eq!(ms_to_timestamp(3_661_000), "01:01:01,000");
    }

    #[test]
    fn segment_trims_and_clamps() {
        let s = Segment::new("  hello  there ", 1500, 1200);
        assert_eq!(s.text, "hello  there");
        assert_eq!(s.word_count, 2);
        assert_eq!(s.end_ms, 1500);
    }

    #[test]
    fn units_serialize_under_their_own_key() {
        let record = TranscriptRecord {
            episode_id: "S01E01".into(),
            season: "01".into(),
            episode_number: "01".into(),
            metadata: Metadata {
                duration_seconds: 1.0,
                processing_time_seconds: 0.5,
                word_count: 1,
                unit_count: 1,
                processed_at: Utc::now(),
            },
            full_text: "hi".into(),
            units: Units::Utterances(vec![Segment::new("hi", 0, 1000)]),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("utterances").is_some());
        assert!(json.get("segments").is_none());
        assert_eq!(json["metadata"]["unit_count"], 1);
        assert!(json["utterances"][0].get("speaker").is_none());

        let back: TranscriptRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }
}
