//! UWB indoor positioning
//!
//! Two-way ranging between a wearable tag and fixed anchors, a relay that
//! serializes ranging rounds from many tags into a durable log, and an
//! offline engine that aligns the logged distances with a video timeline
//! and turns pairs of anchor distances into 2-D positions.

pub mod algorithms;
pub mod api;
pub mod core;
pub mod hardware;
pub mod processing;
pub mod ranging;
pub mod relay;
pub mod utils;
pub mod validation;

// Re-export commonly used types
pub use crate::core::{Address, AnchorPosition, PositioningError, RadioTimestamp, Range};
pub use algorithms::trilateration::{PairPolicy, PositionEstimate, TrilaterationEngine};
pub use api::{OutputFormat, PositionPipeline};
pub use hardware::{CommError, CommResult, RadioInterface};
pub use processing::{DistanceSample, SampleStore, Segmenter};
pub use ranging::{AnchorNode, Frame, MessageKind, TagNode};
pub use relay::{RelayClient, RelayServer, TurnScheduler};
pub use utils::config::ConfigurationManager;
pub use validation::AccuracyValidator;
