use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use serde::Serialize;

use crate::gaps::GapEntry;
use crate::matching::TrackDetection;
use crate::orchestrator::{ProcessResult, SourceCounts};

/// `MM:SS`, or `HH:MM:SS` from one hour on. Fractions are truncated.
pub fn format_timestamp(seconds: f64) -> String {
    let total = if seconds.is_finite() && seconds > 0.0 {
        seconds as u64
    } else {
        0
    };
    let (hours, minutes, secs) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{hours:02}:{minutes:02}:{secs:02}")
    } else {
        format!("{minutes:02}:{secs:02}")
    }
}

/// One line of the final tracklist.
#[derive(Debug, Clone, Copy)]
pub enum TracklistEntry<'a> {
    Track(&'a TrackDetection),
    Gap(&'a GapEntry),
}

impl TracklistEntry<'_> {
    pub fn timestamp(&self) -> f64 {
        match self {
            TracklistEntry::Track(t) => t.timestamp_seconds,
            TracklistEntry::Gap(g) => g.start_timestamp,
        }
    }

    /// Render with a 1-based position.
    pub fn render(&self, position: usize) -> String {
        match self {
            TracklistEntry::Track(t) => format!(
                "{position}. {} - {} ({}) [segments: {}, confidence: {:.2}, total matches: {}]",
                t.artist,
                t.title,
                format_timestamp(t.timestamp_seconds),
                list_segments(&t.segments),
                t.confidence,
                t.total_matches,
            ),
            TracklistEntry::Gap(g) => format!(
                "{position}. ID - ID ({}) [duration: {}]",
                format_timestamp(g.start_timestamp),
                format_timestamp(g.duration),
            ),
        }
    }
}

/// At most this many segment numbers are listed per track.
const LISTED_SEGMENTS: usize = 5;

/// 1-based segment numbers, the first few only.
fn list_segments(segments: &[usize]) -> String {
    let mut listed: Vec<String> = segments
        .iter()
        .take(LISTED_SEGMENTS)
        .map(|s| (s + 1).to_string())
        .collect();
    if segments.len() > LISTED_SEGMENTS {
        listed.push("...".to_string());
    }
    listed.join(", ")
}

/// Detections and gaps in chronological order.
pub fn merge<'a, I>(detections: I, gaps: &'a [GapEntry]) -> Vec<TracklistEntry<'a>>
where
    I: IntoIterator<Item = &'a TrackDetection>,
{
    let mut entries: Vec<TracklistEntry<'a>> = detections
        .into_iter()
        .map(TracklistEntry::Track)
        .chain(gaps.iter().map(TracklistEntry::Gap))
        .collect();
    entries.sort_by(|a, b| {
        a.timestamp()
            .partial_cmp(&b.timestamp())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    entries
}

/// Summary block printed after the tracklist.
pub fn summary_lines(result: &ProcessResult) -> Vec<String> {
    let mut lines = vec![
        format!("Total Segments: {}", result.total_segments),
        format!("Detected Tracks: {}", result.detected_tracks()),
        format!("Success Rate: {:.1}%", result.success_rate),
        format!(
            "Matches by source: {} primary, {} fallback",
            result.source_counts.primary, result.source_counts.fallback
        ),
    ];
    if result.failed_segments > 0 {
        lines.push(format!("Failed Segments: {}", result.failed_segments));
    }
    for (backend, stats) in &result.retry_stats {
        if stats.total_retries == 0 {
            continue;
        }
        lines.push(format!(
            "Retries ({backend}): {} segments retried, {} total, {:.1} avg, {} max",
            stats.segments, stats.total_retries, stats.avg_retries, stats.max_retries
        ));
    }
    lines
}

/// The JSON document written by `--json`.
#[derive(Debug, Serialize)]
pub struct TracklistDocument<'a> {
    pub total_segments: usize,
    pub segment_seconds: f64,
    pub detected_tracks: usize,
    pub success_rate: f64,
    pub source_counts: SourceCounts,
    pub tracklist: &'a BTreeMap<String, TrackDetection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gaps: Option<&'a [GapEntry]>,
}

impl<'a> TracklistDocument<'a> {
    pub fn new(result: &'a ProcessResult, gaps: Option<&'a [GapEntry]>) -> Self {
        Self {
            total_segments: result.total_segments,
            segment_seconds: result.segment_seconds,
            detected_tracks: result.detected_tracks(),
            success_rate: result.success_rate,
            source_counts: result.source_counts,
            tracklist: &result.tracklist,
            gaps,
        }
    }

    pub fn write_to<W: Write>(&self, writer: W) -> io::Result<()> {
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    pub fn write_json(&self, path: &Path) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        self.write_to(&mut writer)?;
        writer.flush()
    }
}
