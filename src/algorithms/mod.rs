//! Position estimation from anchor ranges

pub mod trilateration;

pub use trilateration::{
    intersect, CandidateChoice, Intersection, LayoutRule, PairPolicy, PositionEstimate, TrilaterationEngine,
    DEFAULT_CONTINUITY_TOLERANCE_M,
};
