//! Evaluation of estimated positions against reference coordinates

pub mod accuracy;

pub use accuracy::{
    pair_records, parse_coordinates, AccuracyError, AccuracyReport, AccuracyStatistics, AccuracyValidator, AxisStatistics,
    CoordinateRecord, PositionError,
};
