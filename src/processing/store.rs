//! Sample and video-frame logs loaded for offline analysis

use crate::core::AlignError;
use crate::processing::align::{closest, closest_index_by};
use crate::processing::sample::{DistanceSample, SampleParseError};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Timestamp of one captured video frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoFrameRecord {
    pub frame_id: u64,
    pub timestamp_ms: u64,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("line {line}: {source}")]
    Sample {
        line: usize,
        #[source]
        source: SampleParseError,
    },
    #[error("line {line}: malformed video frame record {content:?}")]
    VideoFrame { line: usize, content: String },
    #[error("line {line}: timestamp {timestamp_ms} is earlier than its predecessor")]
    NonMonotonic { line: usize, timestamp_ms: u64 },
}

pub fn parse_samples(reader: impl BufRead) -> Result<Vec<DistanceSample>, StoreError> {
    let mut samples: Vec<DistanceSample> = Vec::new();
    for (number, line) in reader.lines().enumerate() {
        let line_no = number + 1;
        let line = line.map_err(|source| StoreError::Io {
            path: PathBuf::from("<samples>"),
            source,
        })?;
        if line.trim().is_empty() {
            continue;
        }
        let sample = DistanceSample::parse_record(&line).map_err(|source| StoreError::Sample { line: line_no, source })?;
        if samples.last().is_some_and(|last| sample.receipt_ms < last.receipt_ms) {
            return Err(StoreError::NonMonotonic {
                line: line_no,
                timestamp_ms: sample.receipt_ms,
            });
        }
        samples.push(sample);
    }
    Ok(samples)
}

/// Parse `frameID wallClockMs` lines; timestamps must strictly increase
pub fn parse_video_frames(reader: impl BufRead) -> Result<Vec<VideoFrameRecord>, StoreError> {
    let mut frames: Vec<VideoFrameRecord> = Vec::new();
    for (number, line) in reader.lines().enumerate() {
        let line_no = number + 1;
        let line = line.map_err(|source| StoreError::Io {
            path: PathBuf::from("<video>"),
            source,
        })?;
        let mut fields = line.split_whitespace();
        let (Some(id), Some(ts)) = (fields.next(), fields.next()) else {
            if line.trim().is_empty() {
                continue;
            }
            return Err(StoreError::VideoFrame { line: line_no, content: line });
        };
        let (Ok(frame_id), Ok(timestamp_ms)) = (id.parse(), ts.parse()) else {
            return Err(StoreError::VideoFrame { line: line_no, content: line });
        };
        if frames.last().is_some_and(|last| timestamp_ms <= last.timestamp_ms) {
            return Err(StoreError::NonMonotonic {
                line: line_no,
                timestamp_ms,
            });
        }
        frames.push(VideoFrameRecord { frame_id, timestamp_ms });
    }
    Ok(frames)
}

fn open(path: &Path) -> Result<BufReader<File>, StoreError> {
    File::open(path).map(BufReader::new).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// In-memory view of one recording session
#[derive(Debug, Clone, Default)]
pub struct SampleStore {
    samples: Vec<DistanceSample>,
    frames: Vec<VideoFrameRecord>,
    by_tag: BTreeMap<u16, Vec<usize>>,
}

impl SampleStore {
    pub fn new(samples: Vec<DistanceSample>, frames: Vec<VideoFrameRecord>) -> Self {
        let mut by_tag: BTreeMap<u16, Vec<usize>> = BTreeMap::new();
        for (position, sample) in samples.iter().enumerate() {
            by_tag.entry(sample.tag_id).or_default().push(position);
        }
        Self { samples, frames, by_tag }
    }

    pub fn load(sample_log: impl AsRef<Path>, video_log: impl AsRef<Path>) -> Result<Self, StoreError> {
        let sample_log = sample_log.as_ref();
        let video_log = video_log.as_ref();
        let samples = parse_samples(open(sample_log)?)?;
        let frames = parse_video_frames(open(video_log)?)?;
        info!(
            samples = samples.len(),
            frames = frames.len(),
            "loaded {} and {}",
            sample_log.display(),
            video_log.display()
        );
        let store = Self::new(samples, frames);
        debug!(tags = ?store.tag_ids(), "tags in recording");
        Ok(store)
    }

    pub fn samples(&self) -> &[DistanceSample] {
        &self.samples
    }

    pub fn frames(&self) -> &[VideoFrameRecord] {
        &self.frames
    }

    pub fn tag_ids(&self) -> Vec<u16> {
        self.by_tag.keys().copied().collect()
    }

    /// Samples of one tag in receipt order
    pub fn samples_for_tag(&self, tag_id: u16) -> impl Iterator<Item = &DistanceSample> + '_ {
        self.by_tag
            .get(&tag_id)
            .into_iter()
            .flatten()
            .map(|&position| &self.samples[position])
    }

    /// Positions in [`samples`](Self::samples) of one tag's samples
    pub fn tag_positions(&self, tag_id: u16) -> &[usize] {
        self.by_tag.get(&tag_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn first_frame_ms(&self) -> Option<u64> {
        self.frames.first().map(|frame| frame.timestamp_ms)
    }

    pub fn closest_frame(&self, timestamp_ms: u64) -> Result<&VideoFrameRecord, AlignError> {
        closest(&self.frames, timestamp_ms)
    }

    pub fn closest_sample_index(&self, timestamp_ms: u64) -> Result<usize, AlignError> {
        closest_index_by(&self.samples, timestamp_ms, |sample| sample.receipt_ms)
    }

    pub fn closest_sample(&self, timestamp_ms: u64) -> Result<&DistanceSample, AlignError> {
        closest(&self.samples, timestamp_ms)
    }

    pub fn closest_sample_for_tag(&self, tag_id: u16, timestamp_ms: u64) -> Result<&DistanceSample, AlignError> {
        let positions = self.tag_positions(tag_id);
        let found = closest_index_by(positions, timestamp_ms, |&position| self.samples[position].receipt_ms)?;
        Ok(&self.samples[positions[found]])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLES: &str = "\
0 1000 1 101 1.0 102 2.0, overall request duration: 30ms
1 1040 2 103 1.5 104 fail, overall request duration: 31ms

2 1080 1 101 1.1 102 2.1 12.5, overall request duration: 29ms
";

    const FRAMES: &str = "0 990\n1 1023\n2 1056\n3 1090\n";

    fn store() -> SampleStore {
        SampleStore::new(
            parse_samples(SAMPLES.as_bytes()).unwrap(),
            parse_video_frames(FRAMES.as_bytes()).unwrap(),
        )
    }

    #[test]
    fn test_per_tag_index() {
        let store = store();
        assert_eq!(store.tag_ids(), vec![1, 2]);
        let indices: Vec<u64> = store.samples_for_tag(1).map(|sample| sample.index).collect();
        assert_eq!(indices, vec![0, 2]);
        assert_eq!(store.samples_for_tag(9).count(), 0);
    }

    #[test]
    fn test_alignment_both_ways() {
        let store = store();
        assert_eq!(store.closest_frame(1035).unwrap().frame_id, 1);
        assert_eq!(store.closest_sample(1056).unwrap().index, 1);
        assert_eq!(store.closest_sample_for_tag(1, 1056).unwrap().index, 2);
        assert_eq!(store.closest_sample_for_tag(9, 1056), Err(AlignError::Empty));
    }

    #[test]
    fn test_rejects_out_of_order_records() {
        let err = parse_samples("0 1000 1 101 1.0 102 2.0\n1 999 1 101 1.0 102 2.0\n".as_bytes()).unwrap_err();
        assert!(matches!(err, StoreError::NonMonotonic { line: 2, timestamp_ms: 999 }));

        let err = parse_video_frames("0 10\n1 10\n".as_bytes()).unwrap_err();
        assert!(matches!(err, StoreError::NonMonotonic { line: 2, .. }));
    }

    #[test]
    fn test_reports_bad_lines() {
        let err = parse_samples("0 1000 1 101 abc 102 2.0\n".as_bytes()).unwrap_err();
        assert!(matches!(err, StoreError::Sample { line: 1, .. }));

        let err = parse_video_frames("0\n".as_bytes()).unwrap_err();
        assert!(matches!(err, StoreError::VideoFrame { line: 1, .. }));
    }

    #[test]
    fn test_load_from_files() {
        let dir = tempfile::tempdir().unwrap();
        let samples = dir.path().join("samples.txt");
        let video = dir.path().join("video.txt");
        File::create(&samples).unwrap().write_all(SAMPLES.as_bytes()).unwrap();
        File::create(&video).unwrap().write_all(FRAMES.as_bytes()).unwrap();

        let store = SampleStore::load(&samples, &video).unwrap();
        assert_eq!(store.samples().len(), 3);
        assert_eq!(store.first_frame_ms(), Some(990));

        assert!(matches!(
            SampleStore::load(dir.path().join("missing.txt"), &video),
            Err(StoreError::Io { .. })
        ));
    }
}
