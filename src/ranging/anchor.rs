//! Anchor side of the ranging protocol

use crate::core::{Address, RadioTimestamp, Range};
use crate::hardware::RadioInterface;
use crate::ranging::frame::{self, Frame, MessageKind};
use crate::ranging::twr::{compute_distance, TwrTimestamps};
use crate::utils::config::RangingConfig;
use crate::utils::logging::{log_frame, Direction};
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnchorState {
    Idle,
    AwaitingRange { tag: Address },
}

#[derive(Debug, Clone, PartialEq)]
pub enum AnchorEvent {
    RangeComputed { tag: Address, range: Range },
    SessionTimedOut { tag: Address },
}

#[derive(Debug, Clone, Copy)]
struct AnchorSession {
    tag: Address,
    poll_received: RadioTimestamp,
    poll_ack_sent: RadioTimestamp,
    started_ms: u64,
}

pub struct AnchorNode<R: RadioInterface> {
    radio: R,
    address: Address,
    config: RangingConfig,
    session: Option<AnchorSession>,
}

impl<R: RadioInterface> AnchorNode<R> {
    pub fn new(radio: R, anchor_id: u16, config: RangingConfig) -> Self {
        Self {
            radio,
            address: Address::anchor(anchor_id),
            config,
            session: None,
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn state(&self) -> AnchorState {
        match self.session {
            Some(session) => AnchorState::AwaitingRange { tag: session.tag },
            None => AnchorState::Idle,
        }
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }

    pub fn step(&mut self, now_ms: u64) -> Vec<AnchorEvent> {
        let mut events = Vec::new();

        loop {
            let raw = match self.radio.receive() {
                Ok(Some(raw)) => raw,
                Ok(None) => break,
                Err(e) => {
                    warn!(anchor = %self.address, error = %e, "receive failed");
                    break;
                }
            };
            let decoded = match frame::decode(&raw.data) {
                Ok(decoded) => decoded,
                Err(e) => {
                    trace!(anchor = %self.address, error = %e, "dropping frame");
                    continue;
                }
            };
            if !decoded.sender.is_tag() || !self.config.tag_ids.contains(decoded.sender.id()) {
                continue;
            }
            self.handle_frame(decoded, raw.rx_timestamp, now_ms, &mut events);
        }

        if let Some(session) = self.session {
            if now_ms.saturating_sub(session.started_ms) >= self.config.range_timeout_ms {
                debug!(anchor = %self.address, tag = %session.tag, "range timed out");
                self.session = None;
                events.push(AnchorEvent::SessionTimedOut { tag: session.tag });
            }
        }
        events
    }

    fn handle_frame(&mut self, frame: Frame, rx: RadioTimestamp, now_ms: u64, events: &mut Vec<AnchorEvent>) {
        let tag = frame.sender;
        match frame.kind {
            MessageKind::Blink if frame.receiver.is_none() => {
                self.transmit(&Frame::new(MessageKind::AnchorAddr, self.address, tag));
            }
            MessageKind::AnchorAddr if frame.receiver.is_none() => {
                let Some(position) = frame.listed_anchors().iter().position(|anchor| *anchor == self.address) else {
                    return;
                };
                let ack = Frame::new(MessageKind::AnchorAddr, self.address, tag).with_slot(0, position as u64);
                self.transmit(&ack);
            }
            MessageKind::Poll if frame.receiver == self.address => {
                let poll_ack_sent = rx.wrapping_add(self.config.reply_delay());
                let bytes = frame::encode(&Frame::new(MessageKind::PollAck, self.address, tag));
                match self.radio.transmit_at(&bytes, poll_ack_sent) {
                    Ok(()) => {
                        log_frame("anchor", Direction::Tx, "PollAck", &bytes);
                        self.session = Some(AnchorSession {
                            tag,
                            poll_received: rx,
                            poll_ack_sent,
                            started_ms: now_ms,
                        });
                    }
                    Err(e) => warn!(anchor = %self.address, %tag, error = %e, "poll ack transmission failed"),
                }
            }
            MessageKind::Range if frame.receiver == self.address => {
                let Some(session) = self.session.filter(|session| session.tag == tag) else {
                    return;
                };
                let [poll_sent, poll_ack_received, range_sent] = frame.timestamps;
                let timestamps = TwrTimestamps {
                    poll_sent,
                    poll_received: session.poll_received,
                    poll_ack_sent: session.poll_ack_sent,
                    poll_ack_received,
                    range_sent,
                    range_received: rx,
                };
                let range = match compute_distance(&timestamps, self.config.max_plausible_distance_m) {
                    Ok(distance) => Range::Measured(distance),
                    Err(e) => {
                        warn!(anchor = %self.address, %tag, error = %e, "reporting failed measurement");
                        Range::Failed
                    }
                };
                debug!(anchor = %self.address, %tag, %range, "range computed");
                self.session = None;
                self.transmit(&Frame::range_report(self.address, tag, range));
                events.push(AnchorEvent::RangeComputed { tag, range });
            }
            kind => trace!(anchor = %self.address, ?kind, "frame ignored"),
        }
    }

    fn transmit(&mut self, frame: &Frame) {
        let bytes = frame::encode(frame);
        match self.radio.transmit(&bytes) {
            Ok(_) => log_frame("anchor", Direction::Tx, &format!("{:?}", frame.kind), &bytes),
            Err(e) => warn!(anchor = %self.address, error = %e, kind = ?frame.kind, "transmission failed"),
        }
    }
}
