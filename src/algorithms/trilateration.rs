//! Two-anchor circle-intersection trilateration
//!
//! Two ranges give two candidate points mirrored across the anchor baseline.
//! The candidate is picked by a configured layout rule for known anchor
//! pairs, otherwise by continuity with the tag's previous position.

use crate::core::{AnchorPosition, PositioningError, PositioningResult, Range};
use crate::processing::sample::DistanceSample;
use nalgebra::{Point2, Vector2};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, trace};

/// Default acceptance radius for continuity-based disambiguation (metres)
pub const DEFAULT_CONTINUITY_TOLERANCE_M: f64 = 0.1;

/// Which side of the baseline a pair of anchors sees the tag on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LayoutRule {
    PreferLargerY,
    PreferSmallerY,
}

/// Layout rule bound to an unordered anchor pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairPolicy {
    pub anchors: [u16; 2],
    pub rule: LayoutRule,
}

impl PairPolicy {
    pub fn new(first: u16, second: u16, rule: LayoutRule) -> Self {
        Self {
            anchors: [first, second],
            rule,
        }
    }

    pub fn matches(&self, first: u16, second: u16) -> bool {
        let [a, b] = self.anchors;
        (a == first && b == second) || (a == second && b == first)
    }

    /// Policies of the reference deployment
    pub fn deployment_defaults() -> Vec<PairPolicy> {
        vec![
            PairPolicy::new(101, 102, LayoutRule::PreferLargerY),
            PairPolicy::new(103, 104, LayoutRule::PreferSmallerY),
        ]
    }
}

/// How the emitted position was chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CandidateChoice {
    /// Layout policy for the anchor pair
    Layout(LayoutRule),
    /// Candidate closest to the previous position
    Continuity,
    /// Neither candidate was acceptable; previous position repeated
    Held,
    /// No history yet; second candidate taken
    Initial,
}

/// Both intersection candidates of two range circles
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Intersection {
    pub first: Point2<f64>,
    pub second: Point2<f64>,
    /// Half chord length
    pub h: f64,
    /// Circles did not intersect and `h` was clamped to zero
    pub inconsistent: bool,
}

/// Intersect the circle of radius `d1` around `a1` with radius `d2` around `a2`.
///
/// Returns `None` when the anchors coincide.
pub fn intersect(a1: Point2<f64>, a2: Point2<f64>, d1: f64, d2: f64) -> Option<Intersection> {
    let delta: Vector2<f64> = a2 - a1;
    let baseline = delta.norm();
    if baseline <= f64::EPSILON {
        return None;
    }

    let a = (d1 * d1 - d2 * d2 + baseline * baseline) / (2.0 * baseline);
    let radicand = d1 * d1 - a * a;
    let inconsistent = radicand < 0.0;
    let h = radicand.max(0.0).sqrt();

    let midpoint = a1 + delta * (a / baseline);
    let offset = Vector2::new(-delta.y, delta.x) * (h / baseline);

    Some(Intersection {
        first: midpoint + offset,
        second: midpoint - offset,
        h,
        inconsistent,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PositionEstimate {
    pub tag_id: u16,
    #[serde(serialize_with = "serialize_point")]
    pub position: Point2<f64>,
    pub anchors: (u16, u16),
    pub choice: CandidateChoice,
    pub inconsistent: bool,
}

fn serialize_point<S: serde::Serializer>(point: &Point2<f64>, serializer: S) -> Result<S::Ok, S::Error> {
    use serde::ser::SerializeStruct;
    let mut state = serializer.serialize_struct("Point", 2)?;
    state.serialize_field("x", &point.x)?;
    state.serialize_field("y", &point.y)?;
    state.end()
}

/// Stateful trilateration engine owning the per-tag position history
pub struct TrilaterationEngine {
    anchors: BTreeMap<u16, AnchorPosition>,
    policies: Vec<PairPolicy>,
    continuity_tolerance: f64,
    history: HashMap<u16, Point2<f64>>,
}

impl TrilaterationEngine {
    pub fn new(
        anchors: impl IntoIterator<Item = AnchorPosition>,
        policies: Vec<PairPolicy>,
        continuity_tolerance: f64,
    ) -> Self {
        Self {
            anchors: anchors.into_iter().map(|anchor| (anchor.id, anchor)).collect(),
            policies,
            continuity_tolerance,
            history: HashMap::new(),
        }
    }

    pub fn anchor(&self, id: u16) -> Option<&AnchorPosition> {
        self.anchors.get(&id)
    }

    pub fn origin(&self) -> Option<&AnchorPosition> {
        self.anchors.values().find(|anchor| anchor.is_origin)
    }

    pub fn last_position(&self, tag_id: u16) -> Option<Point2<f64>> {
        self.history.get(&tag_id).copied()
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    pub fn locate(&mut self, sample: &DistanceSample) -> PositioningResult<PositionEstimate> {
        self.locate_ranges(sample.tag_id, &sample.ranges)
    }

    /// Position from the first two measured ranges to configured anchors
    pub fn locate_ranges(&mut self, tag_id: u16, ranges: &[(u16, Range)]) -> PositioningResult<PositionEstimate> {
        let mut usable = Vec::with_capacity(2);
        let mut unknown = None;
        for &(anchor_id, range) in ranges {
            let Some(distance) = range.distance() else {
                continue;
            };
            match self.anchors.get(&anchor_id) {
                Some(anchor) => usable.push((*anchor, distance)),
                None => unknown = Some(anchor_id),
            }
            if usable.len() == 2 {
                break;
            }
        }

        if usable.len() < 2 {
            return Err(match unknown {
                Some(anchor_id) => PositioningError::UnknownAnchor { anchor_id },
                None => PositioningError::InsufficientRanges {
                    tag_id,
                    measured: usable.len(),
                },
            });
        }

        let (first, d1) = usable[0];
        let (second, d2) = usable[1];
        let intersection = intersect(
            Point2::new(first.x, first.y),
            Point2::new(second.x, second.y),
            d1,
            d2,
        )
        .ok_or(PositioningError::DegenerateBaseline {
            first: first.id,
            second: second.id,
        })?;

        if intersection.inconsistent {
            debug!(tag_id, d1, d2, "range circles do not intersect, clamping");
        }

        let (position, choice) = self.choose(tag_id, first.id, second.id, &intersection);
        trace!(tag_id, x = position.x, y = position.y, ?choice, "position");
        self.history.insert(tag_id, position);

        Ok(PositionEstimate {
            tag_id,
            position,
            anchors: (first.id, second.id),
            choice,
            inconsistent: intersection.inconsistent,
        })
    }

    fn choose(&self, tag_id: u16, first: u16, second: u16, candidates: &Intersection) -> (Point2<f64>, CandidateChoice) {
        let Intersection { first: p1, second: p2, h, .. } = *candidates;

        if let Some(policy) = self.policies.iter().find(|policy| policy.matches(first, second)) {
            let take_first = match policy.rule {
                LayoutRule::PreferLargerY => p1.y > p2.y,
                LayoutRule::PreferSmallerY => p1.y < p2.y,
            };
            let position = if take_first { p1 } else { p2 };
            return (position, CandidateChoice::Layout(policy.rule));
        }

        let Some(last) = self.history.get(&tag_id).copied() else {
            return (p2, CandidateChoice::Initial);
        };

        // Continuity compares x only; equal deltas go to P2
        let delta1 = (p1.x - last.x).abs();
        let delta2 = (p2.x - last.x).abs();
        let tolerance = self.continuity_tolerance;

        if h > 0.0 && (delta1 < tolerance || delta2 < tolerance) {
            let closer = if delta1 < delta2 { p1 } else { p2 };
            (closer, CandidateChoice::Continuity)
        } else {
            (last, CandidateChoice::Held)
        }
    }
}
