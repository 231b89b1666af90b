use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::discovery::{self, DiscoveryError};
use crate::model::{ms_to_timestamp, BatchStats, TranscriptRecord, WorkItem};
use crate::normalize::{normalize, NormalizationError};
use crate::retry::{with_retries, Clock, RetryError, RetryPolicy};
use crate::store::{PersistenceError, ResultStore};
use crate::transcribe::Transcriber;

const SAMPLE_SEGMENTS: usize = 3;

/// Everything that can sink a single item without stopping the run.
#[derive(Debug, thiserror::Error)]
pub enum ItemError {
    #[error(transparent)]
    Transcription(#[from] RetryError),
    #[error(transparent)]
    Normalization(#[from] NormalizationError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Skipped,
    Succeeded,
    Failed,
}

pub struct BatchRunner<'a, T, C> {
    transcriber: &'a T,
    store: &'a ResultStore,
    clock: C,
    retry: RetryPolicy,
    pause: Duration,
    extensions: Vec<String>,
    interrupted: Arc<AtomicBool>,
}

impl<'a, T, C> BatchRunner<'a, T, C>
where
    T: Transcriber,
    C: Clock,
{
    pub fn new(transcriber: &'a T, store: &'a ResultStore, clock: C) -> Self {
        Self {
            transcriber,
            store,
            clock,
            retry: RetryPolicy::default(),
            pause: Duration::from_millis(500),
            extensions: vec!["wav".to_string()],
            interrupted: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn pause(mut self, pause: Duration) -> Self {
        self.pause = pause;
        self
    }

    pub fn extensions(mut self, extensions: Vec<String>) -> Self {
        self.extensions = extensions;
        self
    }

    /// Flag checked before each item; once set the run stops.
    pub fn interrupt_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupted = flag;
        self
    }

    /// Discovers the items under `root` and processes up to `limit` of them.
    pub async fn run(&self, root: &Path, limit: Option<usize>) -> Result<BatchStats, DiscoveryError> {
        println!("==> finding audio files in {}", root.display());
        let mut items = discovery::discover(root, &self.extensions)?;
        if items.is_empty() {
            println!(" -> no audio files found, nothing to do");
            return Ok(BatchStats::default());
        }
        println!(" -> found {} episodes", items.len());

        if let Some(limit) = limit {
            if limit < items.len() {
                items.truncate(limit);
                println!(" -> limiting to the first {limit}");
            }
        }

        let minutes: f64 = items
            .iter()
            .filter_map(|i| discovery::audio_length(&i.source_path))
            .map(|d| d.as_secs_f64() / 60.0)
            .sum();
        println!(" -> about {minutes:.1} minutes of audio");

        println!("==> transcribing with {}", self.transcriber.name());
        Ok(self.process(&items).await)
    }

    async fn process(&self, items: &[WorkItem]) -> BatchStats {
        let mut stats = BatchStats::default();
        for (i, item) in items.iter().enumerate() {
            if self.interrupted.load(Ordering::Acquire) {
                println!(" -> interrupted, stopping before {}", item.id);
                break;
            }

            println!(" -> [{}/{}] {}", i + 1, items.len(), item.id);
            match self.process_one(item, &mut stats).await {
                Outcome::Skipped => continue,
                Outcome::Succeeded | Outcome::Failed => {}
            }

            if i + 1 < items.len() && !self.pause.is_zero() {
                self.clock.sleep(self.pause).await;
            }
        }
        stats
    }

    async fn process_one(&self, item: &WorkItem, stats: &mut BatchStats) -> Outcome {
        if self.store.is_done(&item.id).await {
            println!(" .. {} | skipping (already processed)", item.id);
            stats.skipped += 1;
            return Outcome::Skipped;
        }

        match self.transcribe_one(item).await {
            Ok(record) => {
                stats.record_success(&record);
                log_summary(&record);
                Outcome::Succeeded
            }
            Err(e) => {
                tracing::error!(episode = %item.id, "failed: {e:#}");
                stats.errors += 1;
                Outcome::Failed
            }
        }
    }

    async fn transcribe_one(&self, item: &WorkItem) -> Result<TranscriptRecord, ItemError> {
        let started = Instant::now();
        let payload = with_retries(&self.retry, &self.clock, &item.id, |attempt| {
            tracing::info!(
                episode = %item.id,
                attempt,
                max = self.retry.max_attempts,
                path = %item.source_path.display(),
                "transcribing"
            );
            self.transcriber.transcribe(&item.source_path)
        })
        .await?;
        let mut record = normalize(item, payload, started.elapsed())?;
        let path = self.store.persist(&mut record).await?;
        println!(" .. {} | saved to {}", item.id, path.display());
        Ok(record)
    }
}

fn log_summary(record: &TranscriptRecord) {
    let meta = &record.metadata;
    tracing::info!(
        episode = %record.episode_id,
        duration_seconds = meta.duration_seconds,
        words = meta.word_count,
        units = meta.unit_count,
        unit_kind = record.units.kind(),
        processing_seconds = meta.processing_time_seconds,
        "episode done"
    );
    let units = record.units.as_slice();
    for seg in units.iter().take(SAMPLE_SEGMENTS) {
        let text: String = seg.text.chars().take(50).collect();
        tracing::debug!(
            "[{} -> {}] {text}",
            ms_to_timestamp(seg.start_ms),
            ms_to_timestamp(seg.end_ms)
        );
    }
    if units.len() > SAMPLE_SEGMENTS {
        tracing::debug!("... and {} more", units.len() - SAMPLE_SEGMENTS);
    }
}
