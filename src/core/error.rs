//! Errors raised by the offline positioning engine

use thiserror::Error;

/// Temporal alignment failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AlignError {
    /// Nothing to align against
    #[error("cannot align against an empty sequence")]
    Empty,
}

/// Reasons a sample cannot be turned into a position
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PositioningError {
    #[error("tag {tag_id} has {measured} usable ranges, two are required")]
    InsufficientRanges { tag_id: u16, measured: usize },

    #[error("anchor {anchor_id} is not in the anchor table")]
    UnknownAnchor { anchor_id: u16 },

    #[error("anchors {first} and {second} coincide")]
    DegenerateBaseline { first: u16, second: u16 },

    #[error(transparent)]
    Alignment(#[from] AlignError),
}

pub type PositioningResult<T> = Result<T, PositioningError>;
