//! Batch orchestration: every segment of a batch goes out concurrently, the
//! batch is joined in full, results are folded in index order, then the next
//! batch starts.

use std::collections::BTreeMap;
use std::ops::Range;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use futures::future::join_all;
use serde::Serialize;
use thiserror::Error;

use crate::config::ProcessingConfig;
use crate::matching::{MatchingConfig, TrackDetection, TrackMatch};
use crate::progress::{ProgressSnapshot, ProgressTracker};
use crate::recognition::{BackendRouter, RecognitionMatch, RetryStats, RouterStats, Source};
use crate::segment::Segment;
use crate::tracklist::format_timestamp;

/// Never more recognitions in flight than this.
pub const MAX_CONCURRENCY: usize = 50;
/// Smallest batch the heuristic will pick.
pub const MIN_BATCH_SIZE: usize = 5;

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("no audio segments to process")]
    NoSegments,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("segments out of order: index {found} after {previous}")]
    UnorderedSegments { previous: usize, found: usize },
}

/// Terminal result for one segment.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SegmentOutcome {
    Matched(RecognitionMatch),
    NoMatch,
    Failed { error: String },
}

impl SegmentOutcome {
    pub fn is_match(&self) -> bool {
        matches!(self, SegmentOutcome::Matched(_))
    }
}

/// Matched segments per backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SourceCounts {
    pub primary: usize,
    pub fallback: usize,
}

/// Everything a run produced.
#[derive(Debug)]
pub struct ProcessResult {
    pub outcomes: BTreeMap<usize, SegmentOutcome>,
    /// Raw per-key state, valid or not.
    pub track_matches: BTreeMap<String, TrackMatch>,
    /// Validated detections keyed by track key.
    pub tracklist: BTreeMap<String, TrackDetection>,
    pub total_segments: usize,
    pub segment_seconds: f64,
    pub batch_size: usize,
    pub matched_segments: usize,
    pub failed_segments: usize,
    /// Percent of all segments that matched.
    pub success_rate: f64,
    pub source_counts: SourceCounts,
    pub progress: ProgressSnapshot,
    pub router: RouterStats,
    pub retry_stats: Vec<(&'static str, RetryStats)>,
}

impl ProcessResult {
    pub fn detected_tracks(&self) -> usize {
        self.tracklist.len()
    }
}

/// Receives live progress while a run is going.
pub trait ProgressObserver {
    fn batch_started(&mut self, _batch: usize, _segments: Range<usize>) {}

    /// Called once per segment, in index order, after its batch resolved.
    fn segment_resolved(
        &mut self,
        segment: &Segment,
        outcome: &SegmentOutcome,
        snapshot: &ProgressSnapshot,
    );
}

/// Observer that ignores everything.
pub struct Quiet;

impl ProgressObserver for Quiet {
    fn segment_resolved(&mut self, _: &Segment, _: &SegmentOutcome, _: &ProgressSnapshot) {}
}

/// Batch size from segment count and parallelism.
///
/// Scales up for longer recordings, goes up a further 50% when there are more
/// than 100 segments per parallelism unit, never exceeds 10% of the segments
/// or [`MAX_CONCURRENCY`], and never drops below [`MIN_BATCH_SIZE`].
pub fn optimal_batch_size(total_segments: usize, parallelism: usize) -> usize {
    let cpus = parallelism.max(1);
    let total = total_segments as f64;

    let mut base = if total_segments < 100 {
        (total_segments / 10).clamp(5, 10) as f64
    } else if total_segments < 500 {
        (cpus * 3).clamp(10, 20) as f64
    } else {
        (cpus * 2).clamp(15, 30) as f64
    };

    if total / cpus as f64 > 100.0 {
        base = (base * 1.5).min(MAX_CONCURRENCY as f64);
    }

    let batch = base.min(total * 0.1).min(MAX_CONCURRENCY as f64) as usize;
    batch.max(MIN_BATCH_SIZE)
}

pub struct BatchOrchestrator {
    router: BackendRouter,
    processing: ProcessingConfig,
    matching: MatchingConfig,
}

impl BatchOrchestrator {
    pub fn new(
        router: BackendRouter,
        processing: ProcessingConfig,
        matching: MatchingConfig,
    ) -> Result<Self, ProcessError> {
        processing.validate()?;
        Ok(Self {
            router,
            processing,
            matching,
        })
    }

    fn batch_size(&self, total_segments: usize) -> usize {
        match self.processing.batch_size {
            Some(n) if n > MAX_CONCURRENCY => {
                log::warn!("Batch size {n} capped at {MAX_CONCURRENCY}");
                MAX_CONCURRENCY
            }
            Some(n) => n,
            None => optimal_batch_size(total_segments, self.processing.resolve_parallelism()),
        }
    }

    /// Recognize every segment and build the tracklist.
    ///
    /// Consumes the orchestrator: the router and its HTTP clients are released
    /// when this returns, on success and error alike. Per-segment failures only
    /// lower the success rate; the run itself fails only on empty or unordered
    /// input.
    pub async fn process_all(
        self,
        segments: &[Segment],
        observer: &mut dyn ProgressObserver,
    ) -> Result<ProcessResult, ProcessError> {
        if segments.is_empty() {
            return Err(ProcessError::NoSegments);
        }
        if let Some(w) = segments.windows(2).find(|w| w[0].index >= w[1].index) {
            return Err(ProcessError::UnorderedSegments {
                previous: w[0].index,
                found: w[1].index,
            });
        }

        let total = segments.len();
        let batch_size = self.batch_size(total);
        let segment_seconds = self.processing.segment_seconds();
        let batch_delay = self.processing.batch_delay();
        log::info!("Processing {total} segments in batches of {batch_size}");

        let mut tracker = ProgressTracker::new(total);
        let mut outcomes = BTreeMap::new();
        let mut track_matches: BTreeMap<String, TrackMatch> = BTreeMap::new();
        let mut source_counts = SourceCounts::default();
        let mut failed_segments = 0;

        for (batch_no, batch) in segments.chunks(batch_size).enumerate() {
            if batch_no > 0 && !batch_delay.is_zero() {
                tokio::time::sleep(batch_delay).await;
            }

            let first = batch[0].index;
            let last = batch[batch.len() - 1].index;
            observer.batch_started(batch_no, first..last + 1);
            log::debug!("Batch {batch_no}: segments {first}..={last}");

            // Barrier: nothing below runs until every segment in the batch resolved
            let results = join_all(batch.iter().map(|segment| self.recognize(segment))).await;

            for (segment, outcome) in batch.iter().zip(results) {
                let timestamp = format_timestamp(segment.start_offset);
                tracker.update(outcome.is_match());
                match &outcome {
                    SegmentOutcome::Matched(hit) => {
                        track_matches
                            .entry(hit.track_key.clone())
                            .or_insert_with(|| TrackMatch::new(hit, self.matching))
                            .add_hit(segment.index, hit.confidence);
                        match hit.source {
                            Source::Primary => source_counts.primary += 1,
                            Source::Fallback => source_counts.fallback += 1,
                        }
                        log::info!(
                            "Found [{timestamp}] (segment {}): {} - {} via {}",
                            segment.index + 1,
                            hit.artist,
                            hit.title,
                            hit.source
                        );
                    }
                    SegmentOutcome::NoMatch => {
                        log::debug!("No match [{timestamp}] (segment {})", segment.index + 1);
                    }
                    SegmentOutcome::Failed { error } => {
                        failed_segments += 1;
                        log::warn!(
                            "Error recognizing segment {} [{timestamp}]: {error}",
                            segment.index + 1
                        );
                    }
                }

                observer.segment_resolved(segment, &outcome, &tracker.snapshot());
                outcomes.insert(segment.index, outcome);
            }
        }

        let tracklist: BTreeMap<String, TrackDetection> = track_matches
            .iter()
            .filter_map(|(key, m)| m.to_detection(segment_seconds).map(|d| (key.clone(), d)))
            .collect();

        let matched_segments = source_counts.primary + source_counts.fallback;
        log::info!(
            "{} of {} tracks passed validation",
            tracklist.len(),
            track_matches.len()
        );

        Ok(ProcessResult {
            outcomes,
            track_matches,
            tracklist,
            total_segments: total,
            segment_seconds,
            batch_size,
            matched_segments,
            failed_segments,
            success_rate: matched_segments as f64 / total as f64 * 100.0,
            source_counts,
            progress: tracker.snapshot(),
            router: self.router.stats(),
            retry_stats: self.router.retry_stats(),
        })
    }

    async fn recognize(&self, segment: &Segment) -> SegmentOutcome {
        let audio = match segment.read().await {
            Ok(audio) => audio,
            Err(e) => {
                return SegmentOutcome::Failed {
                    error: format!("could not read segment audio: {e}"),
                };
            }
        };

        let call = self.router.recognize_segment(&audio, segment.index);
        match AssertUnwindSafe(call).catch_unwind().await {
            Ok(Ok(Some(hit))) => SegmentOutcome::Matched(hit),
            Ok(Ok(None)) => SegmentOutcome::NoMatch,
            Ok(Err(e)) => SegmentOutcome::Failed { error: e.to_string() },
            Err(_) => SegmentOutcome::Failed {
                error: "recognition backend panicked".to_string(),
            },
        }
    }
}
