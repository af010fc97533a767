//! Core types, constants and errors for the UWB positioning system

pub mod constants;
pub mod error;
pub mod types;

pub use constants::*;
pub use error::{AlignError, PositioningError, PositioningResult};
pub use types::*;
