//! Two-way ranging protocol run by tags and anchors

pub mod anchor;
pub mod frame;
pub mod sim;
pub mod tag;
pub mod twr;

pub use anchor::{AnchorEvent, AnchorNode, AnchorState};
pub use frame::{decode, encode, Frame, FrameError, MessageKind, FAILURE_MARKER, FRAME_LEN};
pub use sim::{Simulation, SimulationError};
pub use tag::{RoundReport, StartError, TagEvent, TagNode, TagState};
pub use twr::{compute_distance, TwrError, TwrTimestamps};
