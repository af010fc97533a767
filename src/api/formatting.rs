//! Position output formatting
//!
//! Estimates are first flattened into a [`FormattedPosition`] rounded to the
//! formatter's precision, then rendered as text, JSON or CSV.

use crate::algorithms::trilateration::{CandidateChoice, PositionEstimate};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// `frameID x y`, one line per tag
    #[default]
    Text,
    Json,
    Csv,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OutputFormat::Text => "text",
            OutputFormat::Json => "json",
            OutputFormat::Csv => "csv",
        };
        f.write_str(name)
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "txt" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            "csv" => Ok(OutputFormat::Csv),
            other => Err(format!("unknown output format {other:?} (expected text, json or csv)")),
        }
    }
}

/// Position flattened for output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormattedPosition {
    pub frame_id: Option<u64>,
    pub tag_id: u16,
    pub x: f64,
    pub y: f64,
    pub anchors: [u16; 2],
    pub choice: String,
    pub inconsistent: bool,
}

fn choice_label(choice: CandidateChoice) -> String {
    match choice {
        CandidateChoice::Layout(rule) => format!("layout:{rule:?}"),
        CandidateChoice::Continuity => "continuity".to_string(),
        CandidateChoice::Held => "held".to_string(),
        CandidateChoice::Initial => "initial".to_string(),
    }
}

pub struct PositionFormatter {
    /// Decimal places kept for coordinates
    pub precision: u8,
}

impl Default for PositionFormatter {
    fn default() -> Self {
        Self { precision: 4 }
    }
}

impl PositionFormatter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_precision(mut self, precision: u8) -> Self {
        self.precision = precision;
        self
    }

    pub fn format(&self, frame_id: Option<u64>, estimate: &PositionEstimate) -> FormattedPosition {
        FormattedPosition {
            frame_id,
            tag_id: estimate.tag_id,
            x: self.round_to_precision(estimate.position.x),
            y: self.round_to_precision(estimate.position.y),
            anchors: [estimate.anchors.0, estimate.anchors.1],
            choice: choice_label(estimate.choice),
            inconsistent: estimate.inconsistent,
        }
    }

    fn round_to_precision(&self, value: f64) -> f64 {
        let multiplier = 10_f64.powi(self.precision as i32);
        (value * multiplier).round() / multiplier
    }
}

#[derive(Default)]
pub struct TextFormatter {
    /// Bare `frameID x y` lines
    pub compact: bool,
}

impl TextFormatter {
    pub fn compact() -> Self {
        Self { compact: true }
    }

    pub fn format_text(&self, position: &FormattedPosition) -> String {
        let frame = position.frame_id.map_or_else(|| "-".to_string(), |id| id.to_string());
        if self.compact {
            return format!("{} {} {}", frame, position.x, position.y);
        }
        let mut output = format!(
            "frame {} tag {}: ({}, {}) from {}/{} [{}]",
            frame, position.tag_id, position.x, position.y, position.anchors[0], position.anchors[1], position.choice
        );
        if position.inconsistent {
            output.push_str(" inconsistent ranges");
        }
        output
    }
}

#[derive(Default)]
pub struct JsonFormatter {
    pub pretty: bool,
}

impl JsonFormatter {
    pub fn pretty() -> Self {
        Self { pretty: true }
    }

    pub fn format_json(&self, position: &FormattedPosition) -> Result<String, serde_json::Error> {
        if self.pretty {
            serde_json::to_string_pretty(position)
        } else {
            serde_json::to_string(position)
        }
    }
}

pub struct CsvFormatter {
    pub include_header: bool,
}

impl Default for CsvFormatter {
    fn default() -> Self {
        Self { include_header: true }
    }
}

impl CsvFormatter {
    pub fn header(&self) -> &'static str {
        "frame_id,tag_id,x,y,anchor1,anchor2,choice,inconsistent"
    }

    pub fn format_csv(&self, position: &FormattedPosition) -> String {
        format!(
            "{},{},{},{},{},{},{},{}",
            position.frame_id.map_or_else(String::new, |id| id.to_string()),
            position.tag_id,
            position.x,
            position.y,
            position.anchors[0],
            position.anchors[1],
            position.choice,
            position.inconsistent
        )
    }
}

/// Renders positions one line at a time in a chosen format
pub struct LineRenderer {
    format: OutputFormat,
    text: TextFormatter,
    json: JsonFormatter,
    csv: CsvFormatter,
}

impl LineRenderer {
    pub fn new(format: OutputFormat) -> Self {
        Self {
            format,
            text: TextFormatter::compact(),
            json: JsonFormatter::default(),
            csv: CsvFormatter::default(),
        }
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    /// Line to write before any record
    pub fn header(&self) -> Option<&'static str> {
        match self.format {
            OutputFormat::Csv if self.csv.include_header => Some(self.csv.header()),
            _ => None,
        }
    }

    pub fn render(&self, position: &FormattedPosition) -> Result<String, serde_json::Error> {
        match self.format {
            OutputFormat::Text => Ok(self.text.format_text(position)),
            OutputFormat::Json => self.json.format_json(position),
            OutputFormat::Csv => Ok(self.csv.format_csv(position)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::trilateration::LayoutRule;
    use nalgebra::Point2;

    fn estimate() -> PositionEstimate {
        PositionEstimate {
            tag_id: 3,
            position: Point2::new(1.234_567, 2.0),
            anchors: (101, 102),
            choice: CandidateChoice::Layout(LayoutRule::PreferLargerY),
            inconsistent: false,
        }
    }

    #[test]
    fn test_precision_rounding() {
        let formatted = PositionFormatter::new().with_precision(2).format(Some(7), &estimate());
        assert_eq!(formatted.x, 1.23);
        assert_eq!(formatted.choice, "layout:PreferLargerY");
    }

    #[test]
    fn test_text_formats() {
        let formatted = PositionFormatter::new().format(Some(7), &estimate());
        assert_eq!(TextFormatter::compact().format_text(&formatted), "7 1.2346 2");
        let verbose = TextFormatter::default().format_text(&formatted);
        assert!(verbose.starts_with("frame 7 tag 3: (1.2346, 2) from 101/102"));
    }

    #[test]
    fn test_json_and_csv() {
        let formatted = PositionFormatter::new().format(None, &estimate());
        let json = JsonFormatter::default().format_json(&formatted).unwrap();
        let back: FormattedPosition = serde_json::from_str(&json).unwrap();
        assert_eq!(back, formatted);

        let csv = CsvFormatter::default();
        assert_eq!(csv.format_csv(&formatted), ",3,1.2346,2,101,102,layout:PreferLargerY,false");
        assert_eq!(csv.header().split(',').count(), csv.format_csv(&formatted).split(',').count());
    }

    #[test]
    fn test_output_format_parsing() {
        assert_eq!("CSV".parse::<OutputFormat>(), Ok(OutputFormat::Csv));
        assert!("xml".parse::<OutputFormat>().is_err());
        assert_eq!(LineRenderer::new(OutputFormat::Csv).header(), Some(CsvFormatter::default().header()));
        assert_eq!(LineRenderer::new(OutputFormat::Text).header(), None);
    }
}
