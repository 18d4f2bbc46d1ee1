use serde::Serialize;

use crate::matching::TrackDetection;

/// A stretch of the recording no validated detection accounts for.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GapEntry {
    pub start_segment: usize,
    /// Exclusive.
    pub end_segment: usize,
    pub start_timestamp: f64,
    pub end_timestamp: f64,
    pub duration: f64,
}

/// Find unidentified regions between detections.
///
/// A gap is reported only if it spans at least `min_gap_segments` segments and
/// lasts at least `min_gap_duration` seconds. After each detection the cursor
/// moves past the end of its representative cluster, never backwards, so
/// overlapping detections do not open phantom gaps.
///
/// Only the representative cluster claims segments. An earlier or later play
/// of the same track key (a secondary cluster) is still reported as a gap;
/// callers that want it claimed can look at `TrackDetection::clusters`.
pub fn find_gaps<'a, I>(
    detections: I,
    total_segments: usize,
    segment_seconds: f64,
    min_gap_segments: usize,
    min_gap_duration: f64,
) -> Vec<GapEntry>
where
    I: IntoIterator<Item = &'a TrackDetection>,
{
    let mut sorted: Vec<&TrackDetection> = detections.into_iter().collect();
    sorted.sort_by(|a, b| {
        a.timestamp_seconds
            .partial_cmp(&b.timestamp_seconds)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.canonical_segment.cmp(&b.canonical_segment))
    });

    let qualifies = |start: usize, end: usize| -> Option<GapEntry> {
        if end <= start {
            return None;
        }
        let size = end - start;
        let gap = GapEntry {
            start_segment: start,
            end_segment: end,
            start_timestamp: start as f64 * segment_seconds,
            end_timestamp: end as f64 * segment_seconds,
            duration: size as f64 * segment_seconds,
        };
        (size >= min_gap_segments && gap.duration >= min_gap_duration).then_some(gap)
    };

    let mut gaps = Vec::new();
    let mut cursor = 0usize;

    for detection in sorted {
        if let Some(gap) = qualifies(cursor, detection.canonical_segment) {
            gaps.push(gap);
        }
        cursor = cursor.max(detection.last_segment() + 1);
    }

    if let Some(gap) = qualifies(cursor, total_segments) {
        gaps.push(gap);
    }

    gaps
}
