use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::process::Command;

use thiserror::Error;

/// ffmpeg output naming; the number is the segment index.
const SEGMENT_PATTERN: &str = "segment_%03d.wav";
const SEGMENT_PREFIX: &str = "segment_";

#[derive(Error, Debug)]
pub enum SegmentError {
    #[error("ffmpeg not found (required to split the recording)")]
    FfmpegNotFound,
    #[error("ffmpeg failed: {0}")]
    Ffmpeg(String),
    #[error("segmenting produced no audio segments")]
    NoSegments,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where a segment's audio lives.
#[derive(Debug, Clone)]
pub enum SegmentAudio {
    File(PathBuf),
    Memory(Vec<u8>),
}

/// One fixed-length slice of the recording. Index order is time order.
#[derive(Debug, Clone)]
pub struct Segment {
    pub index: usize,
    pub start_offset: f64,
    pub audio: SegmentAudio,
}

impl Segment {
    pub async fn read(&self) -> std::io::Result<Cow<'_, [u8]>> {
        match &self.audio {
            SegmentAudio::File(path) => tokio::fs::read(path).await.map(Cow::Owned),
            SegmentAudio::Memory(bytes) => Ok(Cow::Borrowed(bytes.as_slice())),
        }
    }
}

/// Wrap in-memory chunks as consecutive segments.
pub fn segments_from_memory(chunks: Vec<Vec<u8>>, segment_seconds: f64) -> Vec<Segment> {
    chunks
        .into_iter()
        .enumerate()
        .map(|(index, bytes)| Segment {
            index,
            start_offset: index as f64 * segment_seconds,
            audio: SegmentAudio::Memory(bytes),
        })
        .collect()
}

/// Split `source` into `segment_seconds`-long 44.1 kHz PCM WAV files in `out_dir`.
///
/// The last segment may be shorter. Fails with [`SegmentError::NoSegments`]
/// if ffmpeg ran but produced nothing.
pub fn split_audio(
    source: &Path,
    out_dir: &Path,
    segment_seconds: f64,
) -> Result<Vec<Segment>, SegmentError> {
    if Command::new("ffmpeg").arg("-version").output().is_err() {
        return Err(SegmentError::FfmpegNotFound);
    }

    let pattern = out_dir.join(SEGMENT_PATTERN);
    log::debug!(
        "Splitting {} into {segment_seconds}s segments",
        source.display()
    );

    let output = Command::new("ffmpeg")
        .args([
            "-i",
            &source.to_string_lossy(),
            "-f",
            "segment",
            "-segment_time",
            &segment_seconds.to_string(),
            "-acodec",
            "pcm_s16le",
            "-ar",
            "44100",
            &pattern.to_string_lossy(),
            "-loglevel",
            "error",
        ])
        .output()?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(SegmentError::Ffmpeg(stderr.trim().to_string()));
    }

    collect_segments(out_dir, segment_seconds)
}

/// Gather `segment_NNN.wav` files from `dir` in numeric order.
pub fn collect_segments(dir: &Path, segment_seconds: f64) -> Result<Vec<Segment>, SegmentError> {
    let mut numbered: Vec<(usize, PathBuf)> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter_map(|path| segment_number(&path).map(|n| (n, path)))
        .collect();

    if numbered.is_empty() {
        return Err(SegmentError::NoSegments);
    }
    numbered.sort_by_key(|(n, _)| *n);

    Ok(numbered
        .into_iter()
        .enumerate()
        .map(|(index, (_, path))| Segment {
            index,
            start_offset: index as f64 * segment_seconds,
            audio: SegmentAudio::File(path),
        })
        .collect())
}

fn segment_number(path: &Path) -> Option<usize> {
    if path.extension().and_then(|e| e.to_str()) != Some("wav") {
        return None;
    }
    path.file_stem()?
        .to_str()?
        .strip_prefix(SEGMENT_PREFIX)?
        .parse()
        .ok()
}
