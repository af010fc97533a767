//! Quadratic correction of measured distances
//!
//! Fits `d' = b0 + b1*d + b2*d^2` by least squares from stationary-segment
//! means against distances measured by hand.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CalibrationError {
    #[error("{measured} segment means but {reference} reference distances")]
    LengthMismatch { measured: usize, reference: usize },
    #[error("at least 3 points are needed, got {points}")]
    TooFewPoints { points: usize },
    #[error("normal equations are singular")]
    Singular,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuadraticCalibration {
    pub coefficients: [f64; 3],
}

impl QuadraticCalibration {
    pub const IDENTITY: QuadraticCalibration = QuadraticCalibration {
        coefficients: [0.0, 1.0, 0.0],
    };

    pub fn fit(measured: &[f64], reference: &[f64]) -> Result<Self, CalibrationError> {
        if measured.len() != reference.len() {
            return Err(CalibrationError::LengthMismatch {
                measured: measured.len(),
                reference: reference.len(),
            });
        }
        if measured.len() < 3 {
            return Err(CalibrationError::TooFewPoints { points: measured.len() });
        }

        let design = DMatrix::from_fn(measured.len(), 3, |row, col| measured[row].powi(col as i32));
        let target = DVector::from_column_slice(reference);
        let normal = design.transpose() * &design;
        let rhs = design.transpose() * target;

        let solution = normal.cholesky().ok_or(CalibrationError::Singular)?.solve(&rhs);
        Ok(Self {
            coefficients: [solution[0], solution[1], solution[2]],
        })
    }

    pub fn apply(&self, distance: f64) -> f64 {
        let [b0, b1, b2] = self.coefficients;
        b0 + b1 * distance + b2 * distance * distance
    }

    pub fn apply_all(&self, distances: &[f64]) -> Vec<f64> {
        distances.iter().map(|&distance| self.apply(distance)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recovers_exact_quadratic() {
        let measured = [0.5, 1.0, 2.0, 3.0, 4.5];
        let truth = QuadraticCalibration {
            coefficients: [0.12, 0.95, -0.01],
        };
        let reference = truth.apply_all(&measured);

        let fitted = QuadraticCalibration::fit(&measured, &reference).unwrap();
        for (got, want) in fitted.coefficients.iter().zip(truth.coefficients) {
            assert!((got - want).abs() < 1e-8, "{got} vs {want}");
        }
    }

    #[test]
    fn test_identity() {
        assert_eq!(QuadraticCalibration::IDENTITY.apply(2.5), 2.5);
    }

    #[test]
    fn test_rejects_bad_input() {
        assert_eq!(
            QuadraticCalibration::fit(&[1.0, 2.0], &[1.0]),
            Err(CalibrationError::LengthMismatch { measured: 2, reference: 1 })
        );
        assert_eq!(
            QuadraticCalibration::fit(&[1.0, 2.0], &[1.0, 2.0]),
            Err(CalibrationError::TooFewPoints { points: 2 })
        );
        assert_eq!(
            QuadraticCalibration::fit(&[0.0, 0.0, 0.0], &[1.0, 2.0, 3.0]),
            Err(CalibrationError::Singular)
        );
    }
}
