//! Offline position pipeline over one loaded recording
//!
//! Couples the sample store, the trilateration engine and the segmenter:
//! per-frame positions for playback and export, analysis windows, per
//! tag/anchor distance series and stationary segments mapped to frames.

use crate::algorithms::trilateration::{PositionEstimate, TrilaterationEngine};
use crate::core::{AlignError, PositioningResult, Range};
use crate::processing::calibration::QuadraticCalibration;
use crate::processing::segment::{Segment, Segmenter};
use crate::processing::store::{SampleStore, VideoFrameRecord};
use crate::utils::config::{ConfigError, ConfigurationManager};
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PipelineError {
    #[error("alignment failed: {0}")]
    Alignment(#[from] AlignError),
    #[error("window end {end_s}s precedes its start {start_s}s")]
    InvalidWindow { start_s: f64, end_s: f64 },
}

/// Slice of a recording selected by offsets from the first video frame
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisWindow {
    pub start_frame: VideoFrameRecord,
    pub end_frame: VideoFrameRecord,
    /// Positions in the store's sample list, end exclusive
    pub samples: std::ops::Range<usize>,
    /// Sorted, unique
    pub tag_ids: Vec<u16>,
}

/// One point of a tag/anchor distance series
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeriesPoint {
    /// Position in the store's sample list
    pub sample: usize,
    /// Receipt time relative to the first video frame
    pub offset_ms: i64,
    pub distance: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TagFix {
    pub tag_id: u16,
    pub sample_index: u64,
    pub result: PositioningResult<PositionEstimate>,
}

/// Stationary segment with the video frame nearest its middle sample
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmentFrame {
    pub segment: Segment,
    pub sample: usize,
    pub frame: VideoFrameRecord,
}

pub struct PositionPipeline {
    store: SampleStore,
    engine: TrilaterationEngine,
    segmenter: Segmenter,
}

impl PositionPipeline {
    pub fn new(store: SampleStore, engine: TrilaterationEngine, segmenter: Segmenter) -> Self {
        Self {
            store,
            engine,
            segmenter,
        }
    }

    pub fn from_config(store: SampleStore, config: &ConfigurationManager) -> Result<Self, ConfigError> {
        Ok(Self::new(store, config.build_engine()?, config.segmenter()))
    }

    pub fn store(&self) -> &SampleStore {
        &self.store
    }

    pub fn engine(&self) -> &TrilaterationEngine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut TrilaterationEngine {
        &mut self.engine
    }

    pub fn segmenter(&self) -> Segmenter {
        self.segmenter
    }

    fn offset_ms(&self, timestamp_ms: u64) -> i64 {
        let origin = self.store.first_frame_ms().unwrap_or(0);
        timestamp_ms as i64 - origin as i64
    }

    /// Closest sample of every tag to the frame, trilaterated
    pub fn positions_for_frame(&mut self, frame: &VideoFrameRecord) -> Vec<TagFix> {
        let mut fixes = Vec::new();
        for tag_id in self.store.tag_ids() {
            let Ok(sample) = self.store.closest_sample_for_tag(tag_id, frame.timestamp_ms) else {
                continue;
            };
            let result = self.engine.locate(sample);
            if let Err(e) = &result {
                debug!(frame = frame.frame_id, tag_id, error = %e, "no position");
            }
            fixes.push(TagFix {
                tag_id,
                sample_index: sample.index,
                result,
            });
        }
        fixes
    }

    pub fn analysis_window(&self, start_s: f64, end_s: f64) -> Result<AnalysisWindow, PipelineError> {
        if end_s < start_s {
            return Err(PipelineError::InvalidWindow { start_s, end_s });
        }
        let origin = self.store.first_frame_ms().ok_or(AlignError::Empty)?;
        let to_ms = |seconds: f64| origin.saturating_add_signed((seconds * 1000.0).round() as i64);

        let start_frame = *self.store.closest_frame(to_ms(start_s))?;
        let end_frame = *self.store.closest_frame(to_ms(end_s))?;
        let first = self.store.closest_sample_index(start_frame.timestamp_ms)?;
        let last = self.store.closest_sample_index(end_frame.timestamp_ms)?;
        let samples = first..last + 1;

        let tag_ids: BTreeSet<u16> = self.store.samples()[samples.clone()]
            .iter()
            .map(|sample| sample.tag_id)
            .collect();
        trace!(?samples, ?tag_ids, "analysis window");

        Ok(AnalysisWindow {
            start_frame,
            end_frame,
            samples,
            tag_ids: tag_ids.into_iter().collect(),
        })
    }

    fn tag_positions_in<'a>(&'a self, tag_id: u16, window: Option<&'a AnalysisWindow>) -> impl Iterator<Item = usize> + 'a {
        self.store
            .tag_positions(tag_id)
            .iter()
            .copied()
            .filter(move |position| window.map_or(true, |window| window.samples.contains(position)))
    }

    /// Anchors with at least one measured range for the tag, sorted
    pub fn anchors_for_tag(&self, tag_id: u16, window: Option<&AnalysisWindow>) -> Vec<u16> {
        let anchors: BTreeSet<u16> = self
            .tag_positions_in(tag_id, window)
            .flat_map(|position| self.store.samples()[position].ranges.iter())
            .filter(|(_, range)| range.is_measured())
            .map(|(anchor_id, _)| *anchor_id)
            .collect();
        anchors.into_iter().collect()
    }

    /// Measured distances between a tag and an anchor in receipt order
    pub fn distance_series(&self, tag_id: u16, anchor_id: u16, window: Option<&AnalysisWindow>) -> Vec<SeriesPoint> {
        self.tag_positions_in(tag_id, window)
            .filter_map(|position| {
                let sample = &self.store.samples()[position];
                let distance = sample.range_to(anchor_id)?.distance()?;
                Some(SeriesPoint {
                    sample: position,
                    offset_ms: self.offset_ms(sample.receipt_ms),
                    distance,
                })
            })
            .collect()
    }

    /// Stationary segments of a series, each mapped to the frame nearest
    /// its representative sample
    pub fn segment_frames(&self, series: &[SeriesPoint]) -> Result<Vec<SegmentFrame>, AlignError> {
        let distances: Vec<f64> = series.iter().map(|point| point.distance).collect();
        self.segmenter
            .split(&distances)
            .into_iter()
            .map(|segment| -> Result<SegmentFrame, AlignError> {
                let sample = series[segment.representative].sample;
                let frame = *self.store.closest_frame(self.store.samples()[sample].receipt_ms)?;
                Ok(SegmentFrame { segment, sample, frame })
            })
            .collect()
    }

    /// Trilaterate a segment from the per-anchor mean distance over its samples
    pub fn locate_segment(&mut self, tag_id: u16, series: &[SeriesPoint], segment: &Segment) -> PositioningResult<PositionEstimate> {
        let samples = self.store.samples();
        let members = &series[segment.start..segment.start + segment.len];
        let anchors = samples[series[segment.representative].sample]
            .ranges
            .iter()
            .map(|(anchor_id, _)| *anchor_id);

        let ranges: Vec<(u16, Range)> = anchors
            .map(|anchor_id| {
                let measured: Vec<f64> = members
                    .iter()
                    .filter_map(|point| samples[point.sample].range_to(anchor_id)?.distance())
                    .collect();
                let range = if measured.is_empty() {
                    Range::Failed
                } else {
                    Range::Measured(measured.iter().sum::<f64>() / measured.len() as f64)
                };
                (anchor_id, range)
            })
            .collect();
        self.engine.locate_ranges(tag_id, &ranges)
    }

    /// Series with the calibration applied to every distance
    pub fn calibrated_series(series: &[SeriesPoint], calibration: &QuadraticCalibration) -> Vec<SeriesPoint> {
        series
            .iter()
            .map(|point| SeriesPoint {
                distance: calibration.apply(point.distance),
                ..*point
            })
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::algorithms::trilateration::{PairPolicy, DEFAULT_CONTINUITY_TOLERANCE_M};
    use crate::core::AnchorPosition;
    use crate::processing::sample::DistanceSample;

    pub(crate) fn distance(x: f64, y: f64, ax: f64) -> f64 {
        ((x - ax).powi(2) + y * y).sqrt()
    }

    /// Tag 1 stands at (1.25, 2) then (1.0, 1.0); tag 2 stays at (2, 1).
    /// Samples every 100 ms from t=10_000, frames every 40 ms from 10_020.
    pub(crate) fn recording() -> SampleStore {
        let mut samples = Vec::new();
        for step in 0..20u64 {
            let (x, y) = if step < 10 { (1.25, 2.0) } else { (1.0, 1.0) };
            let (tag_id, x, y) = if step % 2 == 0 { (1, x, y) } else { (2, 2.0, 1.0) };
            samples.push(DistanceSample {
                index: step + 1,
                tag_id,
                receipt_ms: 10_000 + step * 100,
                ranges: vec![(101, Range::Measured(distance(x, y, 0.0))), (102, Range::Measured(distance(x, y, 2.5)))],
                onboard_duration_ms: None,
                request_duration_ms: Some(30),
            });
        }
        let frames = (0..50u64)
            .map(|frame_id| VideoFrameRecord {
                frame_id,
                timestamp_ms: 10_020 + frame_id * 40,
            })
            .collect();
        SampleStore::new(samples, frames)
    }

    pub(crate) fn pipeline() -> PositionPipeline {
        let engine = TrilaterationEngine::new(
            [AnchorPosition::origin(101, 0.0, 0.0), AnchorPosition::new(102, 2.5, 0.0)],
            PairPolicy::deployment_defaults(),
            DEFAULT_CONTINUITY_TOLERANCE_M,
        );
        PositionPipeline::new(recording(), engine, Segmenter::new(3, 0.001))
    }

    #[test]
    fn test_positions_for_frame() {
        let mut pipeline = pipeline();
        let frame = pipeline.store().frames()[0];
        let fixes = pipeline.positions_for_frame(&frame);
        assert_eq!(fixes.len(), 2);

        let tag1 = fixes[0].result.as_ref().unwrap();
        assert_eq!(fixes[0].tag_id, 1);
        assert!((tag1.position.x - 1.25).abs() < 1e-9);
        assert!((tag1.position.y - 2.0).abs() < 1e-9);

        let tag2 = fixes[1].result.as_ref().unwrap();
        assert!((tag2.position.x - 2.0).abs() < 1e-9);
        assert!((tag2.position.y - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_analysis_window() {
        let pipeline = pipeline();
        // 0.4 s after the first frame is frame 10 at 10_420; nearest sample 10_400
        let window = pipeline.analysis_window(0.4, 0.8).unwrap();
        assert_eq!(window.start_frame.frame_id, 10);
        assert_eq!(window.end_frame.frame_id, 20);
        assert_eq!(window.samples, 4..9);
        assert_eq!(window.tag_ids, vec![1, 2]);

        assert_eq!(
            pipeline.analysis_window(2.0, 1.0),
            Err(PipelineError::InvalidWindow { start_s: 2.0, end_s: 1.0 })
        );
    }

    #[test]
    fn test_distance_series_and_anchors() {
        let pipeline = pipeline();
        let series = pipeline.distance_series(1, 101, None);
        assert_eq!(series.len(), 10);
        assert_eq!(series[0].offset_ms, -20);
        assert_eq!(series[1].sample, 2);
        assert!((series[0].distance - distance(1.25, 2.0, 0.0)).abs() < 1e-12);

        assert_eq!(pipeline.anchors_for_tag(1, None), vec![101, 102]);
        assert!(pipeline.anchors_for_tag(9, None).is_empty());
    }

    #[test]
    fn test_segments_map_to_frames_and_positions() {
        let mut pipeline = pipeline();
        let series = pipeline.distance_series(1, 101, None);
        let segments = pipeline.segment_frames(&series).unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].segment.start, 0);

        let second = segments[1];
        let estimate = pipeline.locate_segment(1, &series, &second.segment).unwrap();
        assert!((estimate.position.x - 1.0).abs() < 1e-9);
        assert!((estimate.position.y - 1.0).abs() < 1e-9);
        let representative = &pipeline.store().samples()[second.sample];
        assert!(second.frame.timestamp_ms.abs_diff(representative.receipt_ms) <= 20);
    }

    #[test]
    fn test_calibrated_series() {
        let pipeline = pipeline();
        let series = pipeline.distance_series(2, 102, None);
        let shifted = QuadraticCalibration {
            coefficients: [0.5, 1.0, 0.0],
        };
        let calibrated = PositionPipeline::calibrated_series(&series, &shifted);
        assert!((calibrated[0].distance - series[0].distance - 0.5).abs() < 1e-12);
        assert_eq!(calibrated[0].sample, series[0].sample);
    }
}
