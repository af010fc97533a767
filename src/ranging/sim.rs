//! Tag and anchors wired together over a simulated radio medium

use crate::core::{Address, AnchorPosition, RADIO_HALF_RANGE};
use crate::hardware::{AirRadio, MockAir};
use crate::ranging::anchor::AnchorNode;
use crate::ranging::tag::{RoundReport, StartError, TagEvent, TagNode};
use crate::utils::config::RangingConfig;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SimulationError {
    #[error("tag refused to start: {0}")]
    StartRefused(#[from] StartError),
    #[error("round aborted by {0:?}")]
    Aborted(TagEvent),
    #[error("round did not finish within {budget_ms}ms")]
    BudgetExceeded { budget_ms: u64 },
}

pub struct Simulation {
    air: MockAir,
    tag: TagNode<AirRadio>,
    anchors: Vec<AnchorNode<AirRadio>>,
    now_ms: u64,
}

impl Simulation {
    /// One tag at `tag_position` and one anchor per entry of `anchors`.
    ///
    /// Every anchor clock starts at a different, arbitrary offset.
    pub fn new(config: RangingConfig, tag_id: u16, tag_position: (f64, f64), anchors: &[AnchorPosition]) -> Self {
        let air = MockAir::new();
        let tag_radio = air.attach(Address::tag(tag_id), tag_position.0, tag_position.1, 0);
        let anchors = anchors
            .iter()
            .enumerate()
            .map(|(index, anchor)| {
                let offset = (index as u64 + 1).wrapping_mul(987_654_321_011) % (RADIO_HALF_RANGE * 2);
                let radio = air.attach(Address::anchor(anchor.id), anchor.x, anchor.y, offset);
                AnchorNode::new(radio, anchor.id, config.clone())
            })
            .collect();
        Self {
            tag: TagNode::new(tag_radio, tag_id, config),
            air,
            anchors,
            now_ms: 0,
        }
    }

    pub fn air(&self) -> &MockAir {
        &self.air
    }

    pub fn now_ms(&self) -> u64 {
        self.now_ms
    }

    pub fn move_tag(&self, x: f64, y: f64) {
        self.air.move_node(self.tag.address(), x, y);
    }

    fn tick(&mut self) -> Vec<TagEvent> {
        let events = self.tag.step(self.now_ms);
        for anchor in &mut self.anchors {
            anchor.step(self.now_ms);
        }
        self.air.advance_ms(1);
        self.now_ms += 1;
        events
    }

    /// Run one full ranging round, waiting out any post-round sleep first
    pub fn run_round(&mut self, budget_ms: u64) -> Result<RoundReport, SimulationError> {
        let deadline = self.now_ms + budget_ms;
        while self.now_ms < self.tag.ready_at() {
            self.tick();
        }
        self.tag.start_round(self.now_ms)?;

        while self.now_ms < deadline {
            for event in self.tick() {
                match event {
                    TagEvent::RoundComplete(report) => {
                        debug!(tag = report.tag_id, duration_ms = report.duration_ms, "simulated round done");
                        return Ok(report);
                    }
                    TagEvent::HardReset => return Err(SimulationError::Aborted(event)),
                    _ => {}
                }
            }
        }
        Err(SimulationError::BudgetExceeded { budget_ms })
    }
}
