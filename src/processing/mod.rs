//! Offline processing of logged ranging data

pub mod align;
pub mod calibration;
pub mod sample;
pub mod segment;
pub mod store;

pub use align::{closest, closest_index, closest_index_by, Timestamped};
pub use calibration::{CalibrationError, QuadraticCalibration};
pub use sample::{DistanceSample, SampleParseError, SamplePayload};
pub use segment::{rolling_deviation, segments, Segment, Segmenter};
pub use store::{SampleStore, StoreError, VideoFrameRecord};
