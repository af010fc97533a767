use nalgebra::{Point2, Vector2};
use std::collections::HashMap;
use std::io::BufRead;
use thiserror::Error;
use tracing::debug;

/// Accuracy of estimated positions against reference coordinates
#[derive(Debug, Default)]
pub struct AccuracyValidator {
    pub position_error_history: Vec<PositionError>,
}

/// Error of one estimate
#[derive(Debug, Clone, PartialEq)]
pub struct PositionError {
    pub reference: Point2<f64>,
    pub estimated: Point2<f64>,
    /// Estimated minus reference
    pub error_vector: Vector2<f64>,
    pub error_magnitude: f64,
}

/// Mean absolute, mean squared and root mean squared error of one axis
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AxisStatistics {
    pub mae: f64,
    pub mse: f64,
    pub rmse: f64,
}

impl AxisStatistics {
    fn from_errors(errors: impl Iterator<Item = f64>) -> Self {
        let (count, abs_sum, sq_sum) = errors.fold((0usize, 0.0, 0.0), |(n, a, s), e| (n + 1, a + e.abs(), s + e * e));
        if count == 0 {
            return Self::default();
        }
        let mse = sq_sum / count as f64;
        Self {
            mae: abs_sum / count as f64,
            mse,
            rmse: mse.sqrt(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccuracyStatistics {
    pub x: AxisStatistics,
    pub y: AxisStatistics,
    /// Mean Euclidean error (meters)
    pub mean_error: f64,
    pub std_dev_error: f64,
    pub error_95_percentile: f64,
    pub max_error: f64,
    pub min_error: f64,
    pub sample_count: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AccuracyReport {
    pub statistics: AccuracyStatistics,
    /// Share of estimates within the tolerance (0-1)
    pub within_tolerance_rate: f64,
    pub tolerance_m: f64,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Error)]
pub enum AccuracyError {
    #[error("failed to read coordinates: {0}")]
    Io(#[from] std::io::Error),
    #[error("line {line}: expected `[frameID] x y`, got {content:?}")]
    Malformed { line: usize, content: String },
    #[error("no coordinate pairs to compare")]
    Empty,
}

/// Point from a coordinate file, optionally keyed by frame id
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoordinateRecord {
    pub frame_id: Option<u64>,
    pub point: Point2<f64>,
}

/// Parse `x y` or `frameID x y` lines; blank lines are skipped
pub fn parse_coordinates(reader: impl BufRead) -> Result<Vec<CoordinateRecord>, AccuracyError> {
    let mut records = Vec::new();
    for (number, line) in reader.lines().enumerate() {
        let line = line?;
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let malformed = || AccuracyError::Malformed {
            line: number + 1,
            content: line.clone(),
        };
        let (frame_id, x, y) = match tokens.as_slice() {
            [] => continue,
            [x, y] => (None, *x, *y),
            [frame, x, y] => (Some(frame.parse::<u64>().map_err(|_| malformed())?), *x, *y),
            _ => return Err(malformed()),
        };
        let (Ok(x), Ok(y)) = (x.parse::<f64>(), y.parse::<f64>()) else {
            return Err(malformed());
        };
        records.push(CoordinateRecord {
            frame_id,
            point: Point2::new(x, y),
        });
    }
    Ok(records)
}

/// Pair estimates with references by frame id when both carry one,
/// otherwise line by line
pub fn pair_records(reference: &[CoordinateRecord], estimated: &[CoordinateRecord]) -> Vec<(Point2<f64>, Point2<f64>)> {
    let keyed = reference.iter().chain(estimated).all(|record| record.frame_id.is_some());
    if !keyed {
        return reference
            .iter()
            .zip(estimated)
            .map(|(reference, estimated)| (reference.point, estimated.point))
            .collect();
    }

    let by_frame: HashMap<u64, Point2<f64>> = reference
        .iter()
        .filter_map(|record| record.frame_id.map(|id| (id, record.point)))
        .collect();
    let pairs: Vec<_> = estimated
        .iter()
        .filter_map(|record| {
            let reference = by_frame.get(&record.frame_id?)?;
            Some((*reference, record.point))
        })
        .collect();
    debug!(pairs = pairs.len(), estimated = estimated.len(), "paired by frame id");
    pairs
}

impl AccuracyValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calculate_position_error(&self, reference: &Point2<f64>, estimated: &Point2<f64>) -> PositionError {
        let error_vector = estimated - reference;
        PositionError {
            reference: *reference,
            estimated: *estimated,
            error_vector,
            error_magnitude: error_vector.norm(),
        }
    }

    pub fn add_error_to_history(&mut self, error: PositionError) {
        self.position_error_history.push(error);
    }

    pub fn add_pairs(&mut self, pairs: &[(Point2<f64>, Point2<f64>)]) {
        for (reference, estimated) in pairs {
            let error = self.calculate_position_error(reference, estimated);
            self.add_error_to_history(error);
        }
    }

    pub fn calculate_statistics(&self) -> AccuracyStatistics {
        let history = &self.position_error_history;
        if history.is_empty() {
            return AccuracyStatistics::default();
        }
        let n = history.len();

        let mean_error = history.iter().map(|e| e.error_magnitude).sum::<f64>() / n as f64;
        let variance = history
            .iter()
            .map(|e| (e.error_magnitude - mean_error).powi(2))
            .sum::<f64>()
            / n as f64;

        let mut sorted_errors: Vec<f64> = history.iter().map(|e| e.error_magnitude).collect();
        sorted_errors.sort_by(f64::total_cmp);
        let index_95 = ((n as f64 * 0.95).ceil() as usize).saturating_sub(1);

        AccuracyStatistics {
            x: AxisStatistics::from_errors(history.iter().map(|e| e.error_vector.x)),
            y: AxisStatistics::from_errors(history.iter().map(|e| e.error_vector.y)),
            mean_error,
            std_dev_error: variance.sqrt(),
            error_95_percentile: sorted_errors[index_95.min(n - 1)],
            max_error: sorted_errors[n - 1],
            min_error: sorted_errors[0],
            sample_count: n,
        }
    }

    pub fn validate_accuracy(&self, tolerance_m: f64) -> Result<AccuracyReport, AccuracyError> {
        if self.position_error_history.is_empty() {
            return Err(AccuracyError::Empty);
        }
        let statistics = self.calculate_statistics();
        let within = self
            .position_error_history
            .iter()
            .filter(|e| e.error_magnitude <= tolerance_m)
            .count();
        let within_tolerance_rate = within as f64 / self.position_error_history.len() as f64;

        let mut recommendations = Vec::new();
        if statistics.x.rmse > tolerance_m {
            recommendations.push("x error exceeds tolerance: check the anchor baseline measurement".to_string());
        }
        if statistics.y.rmse > tolerance_m {
            recommendations.push("y error exceeds tolerance: calibrate distances from stationary segments".to_string());
        }

        Ok(AccuracyReport {
            statistics,
            within_tolerance_rate,
            tolerance_m,
            recommendations,
        })
    }
}
