use serde::{Deserialize, Serialize};

use crate::recognition::{RecognitionMatch, Source};

/// Allowed deviation (in segments) of any inter-hit distance from the mean
/// distance when `consistency_check` is on. Tunable heuristic.
pub const CONSISTENCY_TOLERANCE: f64 = 2.0;

/// How far apart two hits of the same track may be and still share a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "policy", rename_all = "lowercase")]
pub enum MaxGapPolicy {
    /// The same threshold regardless of how many hits a track has.
    Fixed { segments: usize },
    /// Starts at `initial` and tightens by one every `hits_per_step` hits, never
    /// below `floor`. Long, well-evidenced tracks get stricter clustering.
    Shrinking {
        initial: usize,
        floor: usize,
        hits_per_step: usize,
    },
}

impl MaxGapPolicy {
    /// Threshold for a track that currently has `hits` segment hits.
    ///
    /// Taken as configured: a threshold of 0 puts every hit in its own cluster.
    pub fn max_gap(&self, hits: usize) -> usize {
        match *self {
            MaxGapPolicy::Fixed { segments } => segments,
            MaxGapPolicy::Shrinking {
                initial,
                floor,
                hits_per_step,
            } => initial
                .saturating_sub(hits / hits_per_step.max(1))
                .max(floor),
        }
    }
}

impl Default for MaxGapPolicy {
    fn default() -> Self {
        MaxGapPolicy::Fixed { segments: 3 }
    }
}

/// Validation and clustering thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    /// Minimum segment hits for a track to count at all.
    pub min_segment_matches: usize,
    /// Minimum hits in a cluster for it to survive.
    pub min_cluster_size: usize,
    /// Minimum mean confidence across hits.
    pub min_confidence: f64,
    pub max_gap: MaxGapPolicy,
    /// Reject tracks whose hits are spaced irregularly (scattered false positives).
    pub consistency_check: bool,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            min_segment_matches: 2,
            min_cluster_size: 2,
            min_confidence: 0.5,
            max_gap: MaxGapPolicy::default(),
            consistency_check: false,
        }
    }
}

/// Everything known about one track key during a run.
///
/// Hits only ever get added. Clusters are rebuilt from scratch after every
/// new hit, so they are always a pure function of `segments` and the config.
#[derive(Debug, Clone)]
pub struct TrackMatch {
    pub track_key: String,
    pub title: String,
    pub artist: String,
    /// Source of the first hit.
    pub source: Source,
    pub metadata: serde_json::Value,
    config: MatchingConfig,
    segments: Vec<usize>,
    confidence_sum: f64,
    clusters: Vec<Vec<usize>>,
}

/// A validated track, ready for the tracklist.
#[derive(Debug, Clone, Serialize)]
pub struct TrackDetection {
    pub title: String,
    pub artist: String,
    pub track_key: String,
    pub confidence: f64,
    pub total_matches: usize,
    /// The strongest cluster; it anchors the timestamp.
    pub representative_cluster: Vec<usize>,
    pub canonical_segment: usize,
    pub timestamp_seconds: f64,
    pub cluster_count: usize,
    pub cluster_sizes: Vec<usize>,
    /// Every surviving cluster. Separate plays of one track key stay here.
    pub clusters: Vec<Vec<usize>>,
    pub segments: Vec<usize>,
    pub source: Source,
    pub metadata: serde_json::Value,
}

impl TrackDetection {
    /// Last segment claimed by the representative cluster.
    pub fn last_segment(&self) -> usize {
        self.representative_cluster
            .last()
            .copied()
            .unwrap_or(self.canonical_segment)
    }
}

impl TrackMatch {
    /// Start tracking the identity carried by `hit`. No segments yet.
    pub fn new(hit: &RecognitionMatch, config: MatchingConfig) -> Self {
        Self {
            track_key: hit.track_key.clone(),
            title: hit.title.clone(),
            artist: hit.artist.clone(),
            source: hit.source,
            metadata: hit.metadata.clone(),
            config,
            segments: Vec::new(),
            confidence_sum: 0.0,
            clusters: Vec::new(),
        }
    }

    /// Record a hit on `segment`. Returns false if the segment was already known.
    pub fn add_hit(&mut self, segment: usize, confidence: f64) -> bool {
        match self.segments.binary_search(&segment) {
            Ok(_) => false,
            Err(pos) => {
                self.segments.insert(pos, segment);
                self.confidence_sum += confidence;
                self.recluster();
                true
            }
        }
    }

    fn recluster(&mut self) {
        let max_gap = self.config.max_gap.max_gap(self.segments.len());
        self.clusters = cluster_segments(&self.segments, max_gap, self.config.min_cluster_size);
    }

    /// Sorted, duplicate-free hit segments.
    pub fn segments(&self) -> &[usize] {
        &self.segments
    }

    pub fn clusters(&self) -> &[Vec<usize>] {
        &self.clusters
    }

    pub fn total_matches(&self) -> usize {
        self.segments.len()
    }

    /// Mean confidence over all hits.
    pub fn confidence(&self) -> f64 {
        if self.segments.is_empty() {
            0.0
        } else {
            self.confidence_sum / self.segments.len() as f64
        }
    }

    pub fn is_valid(&self) -> bool {
        self.segments.len() >= self.config.min_segment_matches
            && self.confidence() >= self.config.min_confidence
            && !self.clusters.is_empty()
            && (!self.config.consistency_check || gaps_are_consistent(&self.segments))
    }

    pub fn strongest_cluster(&self) -> Option<&[usize]> {
        strongest_cluster(&self.clusters, self.config.min_cluster_size)
    }

    /// First segment of the strongest cluster, not the first raw hit.
    pub fn canonical_segment(&self) -> Option<usize> {
        self.strongest_cluster().and_then(|c| c.first().copied())
    }

    /// Freeze into a detection. `None` unless the track passes validation.
    pub fn to_detection(&self, segment_seconds: f64) -> Option<TrackDetection> {
        if !self.is_valid() {
            return None;
        }
        let strongest = self.strongest_cluster()?;
        let canonical = *strongest.first()?;

        Some(TrackDetection {
            title: self.title.clone(),
            artist: self.artist.clone(),
            track_key: self.track_key.clone(),
            confidence: self.confidence(),
            total_matches: self.total_matches(),
            representative_cluster: strongest.to_vec(),
            canonical_segment: canonical,
            timestamp_seconds: canonical as f64 * segment_seconds,
            cluster_count: self.clusters.len(),
            cluster_sizes: self.clusters.iter().map(Vec::len).collect(),
            clusters: self.clusters.clone(),
            segments: self.segments.clone(),
            source: self.source,
            metadata: self.metadata.clone(),
        })
    }
}

/// Split sorted segment indices into runs whose neighbours are at most
/// `max_gap` apart. Runs shorter than `min_cluster_size` are dropped.
pub fn cluster_segments(
    segments: &[usize],
    max_gap: usize,
    min_cluster_size: usize,
) -> Vec<Vec<usize>> {
    let mut clusters = Vec::new();
    let mut current: Vec<usize> = Vec::new();

    for &segment in segments {
        match current.last() {
            Some(&last) if segment - last <= max_gap => current.push(segment),
            Some(_) => {
                if current.len() >= min_cluster_size {
                    clusters.push(std::mem::take(&mut current));
                } else {
                    current.clear();
                }
                current.push(segment);
            }
            None => current.push(segment),
        }
    }

    if !current.is_empty() && current.len() >= min_cluster_size {
        clusters.push(current);
    }

    clusters
}

/// Sum of distances between neighbouring hits in a cluster.
fn gap_sum(cluster: &[usize]) -> usize {
    cluster.windows(2).map(|w| w[1] - w[0]).sum()
}

/// Largest cluster of at least `min_size`; ties go to the tighter one, then the earlier one.
pub fn strongest_cluster(clusters: &[Vec<usize>], min_size: usize) -> Option<&[usize]> {
    let mut best: Option<&[usize]> = None;

    for cluster in clusters
        .iter()
        .map(Vec::as_slice)
        .filter(|c| !c.is_empty() && c.len() >= min_size)
    {
        best = match best {
            None => Some(cluster),
            Some(b) => {
                let better = cluster.len() > b.len()
                    || (cluster.len() == b.len() && gap_sum(cluster) < gap_sum(b));
                if better { Some(cluster) } else { Some(b) }
            }
        };
    }

    best
}

/// True when every distance between neighbouring hits stays within
/// [`CONSISTENCY_TOLERANCE`] of the mean distance.
pub fn gaps_are_consistent(segments: &[usize]) -> bool {
    if segments.len() < 3 {
        return true;
    }
    let diffs: Vec<f64> = segments.windows(2).map(|w| (w[1] - w[0]) as f64).collect();
    let mean = diffs.iter().sum::<f64>() / diffs.len() as f64;
    diffs.iter().all(|d| (d - mean).abs() <= CONSISTENCY_TOLERANCE)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_hit(key: &str) -> RecognitionMatch {
        RecognitionMatch {
            track_key: key.to_string(),
            title: format!("Title {key}"),
            artist: format!("Artist {key}"),
            confidence: 0.9,
            source: Source::Primary,
            metadata: serde_json::Value::Null,
        }
    }

    fn make_match(segments: &[usize], config: MatchingConfig) -> TrackMatch {
        let mut m = TrackMatch::new(&make_hit("A"), config);
        for &s in segments {
            m.add_hit(s, 0.9);
        }
        m
    }

    #[test]
    fn test_single_contiguous_cluster() {
        let clusters = cluster_segments(&[2, 3, 4, 5], 3, 2);
        assert_eq!(clusters, vec![vec![2, 3, 4, 5]]);
    }

    #[test]
    fn test_gap_splits_clusters() {
        // 5 -> 9 is a gap of 4, above the threshold of 3
        let clusters = cluster_segments(&[1, 2, 5, 9, 10, 12], 3, 2);
        assert_eq!(clusters, vec![vec![1, 2, 5], vec![9, 10, 12]]);
    }

    #[test]
    fn test_small_clusters_dropped() {
        let clusters = cluster_segments(&[0, 10, 11, 30], 3, 2);
        assert_eq!(clusters, vec![vec![10, 11]]);
        assert!(cluster_segments(&[7], 3, 2).is_empty());
        assert!(cluster_segments(&[], 3, 2).is_empty());
    }

    #[test]
    fn test_cluster_properties_hold() {
        let inputs: Vec<Vec<usize>> = vec![
            vec![0],
            vec![0, 1, 2, 3],
            vec![0, 4, 8, 12],
            vec![1, 2, 3, 10, 11, 20, 22, 24, 40],
            vec![5, 6, 9, 13, 14, 15, 19, 23, 100, 101],
            (0..50).step_by(2).collect(),
        ];

        for segments in &inputs {
            for max_gap in 1..=4 {
                for min_size in 1..=3 {
                    let clusters = cluster_segments(segments, max_gap, min_size);
                    let mut seen = std::collections::HashSet::new();
                    for cluster in &clusters {
                        assert!(cluster.len() >= min_size);
                        for w in cluster.windows(2) {
                            assert!(w[0] < w[1]);
                            assert!(w[1] - w[0] <= max_gap);
                        }
                        for s in cluster {
                            assert!(segments.contains(s));
                            assert!(seen.insert(*s), "segment {s} in two clusters");
                        }
                    }
                    // Idempotent
                    assert_eq!(clusters, cluster_segments(segments, max_gap, min_size));
                }
            }
        }
    }

    #[test]
    fn test_add_hit_keeps_segments_sorted_and_unique() {
        let mut m = TrackMatch::new(&make_hit("A"), MatchingConfig::default());
        assert!(m.add_hit(5, 0.9));
        assert!(m.add_hit(2, 0.9));
        assert!(m.add_hit(3, 0.9));
        assert!(!m.add_hit(3, 0.1));
        assert_eq!(m.segments(), &[2, 3, 5]);
        assert_eq!(m.total_matches(), 3);
        // Duplicate hit did not pull the mean down
        assert!((m.confidence() - 0.9).abs() < 1e-9);
        assert_eq!(m.clusters(), &[vec![2, 3, 5]]);
    }

    #[test]
    fn test_strongest_prefers_size_then_tightness() {
        let clusters = vec![vec![0, 3, 6], vec![10, 11, 12, 13], vec![20, 21, 22, 23]];
        assert_eq!(strongest_cluster(&clusters, 2), Some(&[10, 11, 12, 13][..]));

        let tied = vec![vec![0, 2, 4], vec![10, 11, 12]];
        assert_eq!(strongest_cluster(&tied, 2), Some(&[10, 11, 12][..]));

        assert_eq!(strongest_cluster(&[], 2), None);
        assert_eq!(strongest_cluster(&[vec![1]], 2), None);
    }

    #[test]
    fn test_canonical_segment_ignores_outlier() {
        // Outlier at 0, real play 20..=24
        let config = MatchingConfig {
            min_cluster_size: 1,
            ..MatchingConfig::default()
        };
        let m = make_match(&[0, 20, 21, 22, 23, 24], config);
        assert_eq!(m.clusters().len(), 2);
        assert_eq!(m.canonical_segment(), Some(20));
    }

    #[test]
    fn test_is_valid_requires_min_matches() {
        let config = MatchingConfig {
            min_segment_matches: 3,
            min_cluster_size: 1,
            min_confidence: 0.0,
            ..MatchingConfig::default()
        };
        let mut m = TrackMatch::new(&make_hit("A"), config);
        m.add_hit(1, 1.0);
        m.add_hit(2, 1.0);
        assert!(!m.is_valid());
        m.add_hit(3, 1.0);
        assert!(m.is_valid());
    }

    #[test]
    fn test_is_valid_requires_confidence() {
        let mut m = TrackMatch::new(&make_hit("A"), MatchingConfig::default());
        m.add_hit(1, 0.4);
        m.add_hit(2, 0.5);
        assert!(!m.is_valid());
        m.add_hit(3, 0.9);
        // mean = 0.6
        assert!(m.is_valid());
    }

    #[test]
    fn test_is_valid_requires_a_cluster() {
        // Enough hits, but all too far apart to cluster
        let m = make_match(&[0, 10, 20], MatchingConfig::default());
        assert!(m.clusters().is_empty());
        assert!(!m.is_valid());
        assert!(m.to_detection(12.0).is_none());
    }

    #[test]
    fn test_consistency_check() {
        assert!(gaps_are_consistent(&[1, 2, 3, 4, 6]));
        assert!(gaps_are_consistent(&[4, 40]));
        assert!(!gaps_are_consistent(&[1, 2, 3, 4, 5, 6, 15]));

        let config = MatchingConfig {
            consistency_check: true,
            max_gap: MaxGapPolicy::Fixed { segments: 10 },
            ..MatchingConfig::default()
        };
        let scattered = make_match(&[1, 2, 3, 4, 5, 6, 15], config);
        assert!(!scattered.is_valid());
        let steady = make_match(&[1, 2, 3, 4, 5, 6], config);
        assert!(steady.is_valid());
    }

    #[test]
    fn test_shrinking_policy() {
        let policy = MaxGapPolicy::Shrinking {
            initial: 3,
            floor: 1,
            hits_per_step: 10,
        };
        assert_eq!(policy.max_gap(0), 3);
        assert_eq!(policy.max_gap(9), 3);
        assert_eq!(policy.max_gap(10), 2);
        assert_eq!(policy.max_gap(25), 1);
        assert_eq!(policy.max_gap(1000), 1);
    }

    #[test]
    fn test_zero_max_gap_kept_as_configured() {
        assert_eq!(MaxGapPolicy::Fixed { segments: 0 }.max_gap(5), 0);
        let shrinking = MaxGapPolicy::Shrinking {
            initial: 2,
            floor: 0,
            hits_per_step: 1,
        };
        assert_eq!(shrinking.max_gap(10), 0);

        // Adjacent hits no longer share a cluster
        assert_eq!(cluster_segments(&[4, 5, 6], 0, 1), vec![vec![4], vec![5], vec![6]]);
        assert!(cluster_segments(&[4, 5, 6], 0, 2).is_empty());

        let config = MatchingConfig {
            max_gap: MaxGapPolicy::Fixed { segments: 0 },
            ..MatchingConfig::default()
        };
        let mut track = TrackMatch::new(&make_hit("A"), config);
        for segment in 4..=6 {
            track.add_hit(segment, 0.9);
        }
        assert!(track.clusters().is_empty());
        assert!(!track.is_valid());
    }

    #[test]
    fn test_shrinking_policy_tightens_clusters() {
        let config = MatchingConfig {
            max_gap: MaxGapPolicy::Shrinking {
                initial: 3,
                floor: 1,
                hits_per_step: 4,
            },
            ..MatchingConfig::default()
        };
        let mut m = make_match(&[0, 1, 2], config);
        m.add_hit(5, 0.9);
        // 4 hits -> max gap 2, so 2 -> 5 splits off a singleton
        assert_eq!(m.clusters(), &[vec![0, 1, 2]]);
    }

    #[test]
    fn test_detection_fields() {
        let m = make_match(&[2, 3, 4, 5], MatchingConfig::default());
        let d = m.to_detection(12.0).unwrap();
        assert_eq!(d.representative_cluster, vec![2, 3, 4, 5]);
        assert_eq!(d.canonical_segment, 2);
        assert_eq!(d.timestamp_seconds, 24.0);
        assert_eq!(d.cluster_count, 1);
        assert_eq!(d.cluster_sizes, vec![4]);
        assert_eq!(d.total_matches, 4);
        assert_eq!(d.last_segment(), 5);
    }

    #[test]
    fn test_max_gap_policy_from_toml() {
        #[derive(Deserialize)]
        struct Wrap {
            max_gap: MaxGapPolicy,
        }
        let w: Wrap = toml::from_str(r#"max_gap = { policy = "fixed", segments = 4 }"#).unwrap();
        assert_eq!(w.max_gap, MaxGapPolicy::Fixed { segments: 4 });
        let w: Wrap = toml::from_str(
            r#"max_gap = { policy = "shrinking", initial = 4, floor = 2, hits_per_step = 5 }"#,
        )
        .unwrap();
        assert_eq!(w.max_gap.max_gap(10), 2);
    }
}
