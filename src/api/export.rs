//! Position export to a writer
//!
//! Exports check an abort flag between records. The writer is flushed on
//! every exit path, so an aborted or failed export leaves complete lines.

use crate::api::formatting::{LineRenderer, OutputFormat, PositionFormatter};
use crate::api::pipeline::{AnalysisWindow, PositionPipeline};
use crate::core::AlignError;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("export write failed: {0}")]
    Io(#[from] io::Error),
    #[error("failed to encode record: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Alignment(#[from] AlignError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportOptions {
    pub format: OutputFormat,
    pub precision: u8,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            format: OutputFormat::Text,
            precision: 4,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExportSummary {
    pub records: usize,
    /// Frames or segments without a position
    pub skipped: usize,
    pub aborted: bool,
}

struct RecordWriter<'w, W: Write> {
    writer: &'w mut W,
    renderer: LineRenderer,
    formatter: PositionFormatter,
}

impl<W: Write> RecordWriter<'_, W> {
    fn header(&mut self) -> io::Result<()> {
        if let Some(header) = self.renderer.header() {
            writeln!(self.writer, "{header}")?;
        }
        Ok(())
    }
}

fn finish<W: Write>(writer: &mut W, result: Result<ExportSummary, ExportError>) -> Result<ExportSummary, ExportError> {
    let flushed = writer.flush();
    let summary = result?;
    flushed?;
    if summary.aborted {
        info!(records = summary.records, "export aborted");
    } else {
        info!(records = summary.records, skipped = summary.skipped, "export finished");
    }
    Ok(summary)
}

/// Every frame (inside `window`, if given) with the position of each tag
pub fn export_frames<W: Write>(
    pipeline: &mut PositionPipeline,
    window: Option<&AnalysisWindow>,
    options: ExportOptions,
    writer: &mut W,
    abort: &AtomicBool,
) -> Result<ExportSummary, ExportError> {
    let result = write_frames(pipeline, window, options, writer, abort);
    finish(writer, result)
}

fn write_frames<W: Write>(
    pipeline: &mut PositionPipeline,
    window: Option<&AnalysisWindow>,
    options: ExportOptions,
    writer: &mut W,
    abort: &AtomicBool,
) -> Result<ExportSummary, ExportError> {
    let mut out = RecordWriter {
        writer,
        renderer: LineRenderer::new(options.format),
        formatter: PositionFormatter::new().with_precision(options.precision),
    };
    out.header()?;

    let frames: Vec<_> = pipeline
        .store()
        .frames()
        .iter()
        .filter(|frame| {
            window.map_or(true, |window| {
                (window.start_frame.timestamp_ms..=window.end_frame.timestamp_ms).contains(&frame.timestamp_ms)
            })
        })
        .copied()
        .collect();

    let mut summary = ExportSummary::default();
    for frame in frames {
        if abort.load(Ordering::Relaxed) {
            summary.aborted = true;
            break;
        }
        for fix in pipeline.positions_for_frame(&frame) {
            match fix.result {
                Ok(estimate) => {
                    let line = out.renderer.render(&out.formatter.format(Some(frame.frame_id), &estimate))?;
                    writeln!(out.writer, "{line}")?;
                    summary.records += 1;
                }
                Err(_) => summary.skipped += 1,
            }
        }
    }
    Ok(summary)
}

/// One position per stationary segment of a tag/anchor series, computed
/// from segment-averaged distances and keyed by the segment's frame
pub fn export_segments<W: Write>(
    pipeline: &mut PositionPipeline,
    tag_id: u16,
    anchor_id: u16,
    window: Option<&AnalysisWindow>,
    options: ExportOptions,
    writer: &mut W,
    abort: &AtomicBool,
) -> Result<ExportSummary, ExportError> {
    let result = write_segments(pipeline, tag_id, anchor_id, window, options, writer, abort);
    finish(writer, result)
}

fn write_segments<W: Write>(
    pipeline: &mut PositionPipeline,
    tag_id: u16,
    anchor_id: u16,
    window: Option<&AnalysisWindow>,
    options: ExportOptions,
    writer: &mut W,
    abort: &AtomicBool,
) -> Result<ExportSummary, ExportError> {
    let mut out = RecordWriter {
        writer,
        renderer: LineRenderer::new(options.format),
        formatter: PositionFormatter::new().with_precision(options.precision),
    };
    out.header()?;

    let series = pipeline.distance_series(tag_id, anchor_id, window);
    let segments = pipeline.segment_frames(&series)?;
    debug!(tag_id, anchor_id, segments = segments.len(), "exporting segments");

    let mut summary = ExportSummary::default();
    for segment in segments {
        if abort.load(Ordering::Relaxed) {
            summary.aborted = true;
            break;
        }
        match pipeline.locate_segment(tag_id, &series, &segment.segment) {
            Ok(estimate) => {
                let line = out.renderer.render(&out.formatter.format(Some(segment.frame.frame_id), &estimate))?;
                writeln!(out.writer, "{line}")?;
                summary.records += 1;
            }
            Err(e) => {
                warn!(tag_id, frame = segment.frame.frame_id, error = %e, "segment without position");
                summary.skipped += 1;
            }
        }
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::pipeline::tests::pipeline;

    /// Writer recording flushes, optionally failing after `fail_after` writes
    #[derive(Default)]
    struct FlushCounter {
        data: Vec<u8>,
        writes: usize,
        flushes: usize,
        fail_after: Option<usize>,
    }

    impl Write for FlushCounter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.fail_after.is_some_and(|limit| self.writes >= limit) {
                return Err(io::Error::new(io::ErrorKind::Other, "disk full"));
            }
            self.writes += 1;
            self.data.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            self.flushes += 1;
            Ok(())
        }
    }

    #[test]
    fn test_frame_export_lines() {
        let mut pipeline = pipeline();
        let mut out = Vec::new();
        let summary = export_frames(&mut pipeline, None, ExportOptions::default(), &mut out, &AtomicBool::new(false)).unwrap();

        // 50 frames, two tags each
        assert_eq!(summary, ExportSummary { records: 100, skipped: 0, aborted: false });
        let text = String::from_utf8(out).unwrap();
        let first: Vec<&str> = text.lines().next().unwrap().split(' ').collect();
        assert_eq!(first, vec!["0", "1.25", "2"]);
    }

    #[test]
    fn test_window_limits_frames() {
        let mut pipeline = pipeline();
        let window = pipeline.analysis_window(0.4, 0.8).unwrap();
        let mut out = Vec::new();
        let summary = export_frames(&mut pipeline, Some(&window), ExportOptions::default(), &mut out, &AtomicBool::new(false)).unwrap();
        assert_eq!(summary.records, 2 * 11);
    }

    #[test]
    fn test_abort_flushes() {
        let mut pipeline = pipeline();
        let mut writer = FlushCounter::default();
        let summary = export_frames(&mut pipeline, None, ExportOptions::default(), &mut writer, &AtomicBool::new(true)).unwrap();
        assert!(summary.aborted);
        assert_eq!(summary.records, 0);
        assert_eq!(writer.flushes, 1);
    }

    #[test]
    fn test_write_error_still_flushes() {
        let mut pipeline = pipeline();
        let mut writer = FlushCounter {
            fail_after: Some(3),
            ..FlushCounter::default()
        };
        let result = export_frames(&mut pipeline, None, ExportOptions::default(), &mut writer, &AtomicBool::new(false));
        assert!(matches!(result, Err(ExportError::Io(_))));
        assert_eq!(writer.flushes, 1);
    }

    #[test]
    fn test_segment_export_csv() {
        let mut pipeline = pipeline();
        let mut out = Vec::new();
        let options = ExportOptions {
            format: OutputFormat::Csv,
            precision: 3,
        };
        let summary = export_segments(&mut pipeline, 1, 101, None, options, &mut out, &AtomicBool::new(false)).unwrap();
        assert_eq!(summary.records, 2);

        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("frame_id,"));
        let fields: Vec<&str> = lines[2].split(',').collect();
        assert_eq!((fields[1], fields[2], fields[3]), ("1", "1", "1"));
    }
}
