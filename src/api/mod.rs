//! Offline analysis surface: per-frame positions, export and formatting

pub mod export;
pub mod formatting;
pub mod pipeline;

pub use export::{export_frames, export_segments, ExportError, ExportOptions, ExportSummary};
pub use formatting::{CsvFormatter, FormattedPosition, JsonFormatter, LineRenderer, OutputFormat, PositionFormatter, TextFormatter};
pub use pipeline::{AnalysisWindow, PipelineError, PositionPipeline, SegmentFrame, SeriesPoint, TagFix};
