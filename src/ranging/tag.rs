//! Tag side of the ranging protocol
//!
//! A round walks `Discovery -> RangingInit -> (Poll -> PollAckWait -> Range
//! -> RangeReportWait)` once per discovered anchor, then returns to `Idle`
//! with a [`RoundReport`]. The machine is driven by [`TagNode::step`] with a
//! monotonic millisecond clock; every transition runs to completion.

use crate::core::{Address, RadioTimestamp, Range};
use crate::hardware::RadioInterface;
use crate::ranging::frame::{self, Frame, MessageKind};
use crate::utils::config::RangingConfig;
use crate::utils::logging::{log_frame, Direction};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagState {
    Idle,
    Discovery,
    RangingInit,
    Poll,
    PollAckWait,
    Range,
    RangeReportWait,
}

/// Consolidated result of one ranging round
#[derive(Debug, Clone, PartialEq)]
pub struct RoundReport {
    pub tag_id: u16,
    /// Per-anchor outcome in ranging order
    pub ranges: Vec<(u16, Range)>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TagEvent {
    AnchorDiscovered(Address),
    /// Anchor exhausted its retries and was recorded as failed
    AnchorStale(Address),
    RoundComplete(RoundReport),
    SoftReset,
    HardReset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StartError {
    #[error("a ranging round is already running")]
    Busy,
    #[error("sleeping for another {remaining_ms}ms after the last round")]
    Sleeping { remaining_ms: u64 },
}

/// Timestamps captured by the tag for the anchor being ranged
#[derive(Debug, Clone, Copy)]
struct TagSession {
    anchor: Address,
    poll_sent: RadioTimestamp,
}

pub struct TagNode<R: RadioInterface> {
    radio: R,
    address: Address,
    config: RangingConfig,
    state: TagState,
    anchors: Vec<Address>,
    acknowledged: Vec<Address>,
    current: usize,
    session: Option<TagSession>,
    ranges: Vec<(u16, Range)>,
    consecutive_timeouts: u8,
    state_entered_ms: u64,
    last_blink_ms: Option<u64>,
    backoff_until_ms: Option<u64>,
    round_started_ms: u64,
    last_activity_ms: u64,
    last_reset_ms: u64,
    sleep_until_ms: u64,
}

impl<R: RadioInterface> TagNode<R> {
    pub fn new(radio: R, tag_id: u16, config: RangingConfig) -> Self {
        Self {
            radio,
            address: Address::tag(tag_id),
            config,
            state: TagState::Idle,
            anchors: Vec::new(),
            acknowledged: Vec::new(),
            current: 0,
            session: None,
            ranges: Vec::new(),
            consecutive_timeouts: 0,
            state_entered_ms: 0,
            last_blink_ms: None,
            backoff_until_ms: None,
            round_started_ms: 0,
            last_activity_ms: 0,
            last_reset_ms: 0,
            sleep_until_ms: 0,
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn state(&self) -> TagState {
        self.state
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }

    /// Anchors found by the current round's discovery, in ranging order
    pub fn anchors(&self) -> &[Address] {
        &self.anchors
    }

    /// Earliest time a new round may start
    pub fn ready_at(&self) -> u64 {
        self.sleep_until_ms
    }

    pub fn start_round(&mut self, now_ms: u64) -> Result<(), StartError> {
        if self.state != TagState::Idle {
            return Err(StartError::Busy);
        }
        if now_ms < self.sleep_until_ms {
            return Err(StartError::Sleeping {
                remaining_ms: self.sleep_until_ms - now_ms,
            });
        }
        debug!(tag = %self.address, "starting ranging round");
        self.round_started_ms = now_ms;
        self.last_activity_ms = now_ms;
        self.last_reset_ms = now_ms;
        self.ranges.clear();
        self.enter_discovery(now_ms);
        Ok(())
    }

    /// Advance the machine: escalation checks, pending frames, then timers
    pub fn step(&mut self, now_ms: u64) -> Vec<TagEvent> {
        let mut events = Vec::new();
        if self.state == TagState::Idle {
            self.drain_idle();
            return events;
        }

        if let Some(event) = self.check_escalation(now_ms) {
            events.push(event);
            if self.state == TagState::Idle {
                return events;
            }
        }

        loop {
            let raw = match self.radio.receive() {
                Ok(Some(raw)) => raw,
                Ok(None) => break,
                Err(e) => {
                    warn!(tag = %self.address, error = %e, "receive failed");
                    break;
                }
            };
            if !frame::receiver_matches(&raw.data, self.address) {
                continue;
            }
            let decoded = match frame::decode(&raw.data) {
                Ok(decoded) => decoded,
                Err(e) => {
                    trace!(tag = %self.address, error = %e, "dropping frame");
                    continue;
                }
            };
            if decoded.sender.is_tag() || !self.config.anchor_ids.contains(decoded.sender.id()) {
                continue;
            }
            log_frame("tag", Direction::Rx, &format!("{:?}", decoded.kind), &raw.data);
            self.handle_frame(decoded, raw.rx_timestamp, now_ms, &mut events);
            if self.state == TagState::Idle {
                return events;
            }
        }

        self.handle_timers(now_ms, &mut events);
        events
    }

    fn drain_idle(&mut self) {
        while let Ok(Some(_)) = self.radio.receive() {}
    }

    fn check_escalation(&mut self, now_ms: u64) -> Option<TagEvent> {
        let silent_for = now_ms.saturating_sub(self.last_activity_ms);
        if silent_for >= self.config.hard_reset_timeout_ms {
            warn!(tag = %self.address, silent_for, "no traffic, hard reset");
            if let Err(e) = self.radio.reset() {
                warn!(tag = %self.address, error = %e, "radio reset failed");
            }
            self.session = None;
            self.state = TagState::Idle;
            self.sleep_until_ms = now_ms;
            return Some(TagEvent::HardReset);
        }

        let since_reset = now_ms.saturating_sub(self.last_activity_ms.max(self.last_reset_ms));
        if since_reset >= self.config.reset_timeout_ms {
            info!(tag = %self.address, silent_for, "no traffic, restarting discovery");
            self.last_reset_ms = now_ms;
            self.ranges.clear();
            self.enter_discovery(now_ms);
            return Some(TagEvent::SoftReset);
        }
        None
    }

    fn handle_frame(&mut self, frame: Frame, rx: RadioTimestamp, now_ms: u64, events: &mut Vec<TagEvent>) {
        match (self.state, frame.kind) {
            (TagState::Discovery, MessageKind::AnchorAddr) => {
                self.last_activity_ms = now_ms;
                let max = usize::from(self.config.max_anchors);
                if self.anchors.contains(&frame.sender) || self.anchors.len() >= max {
                    return;
                }
                debug!(tag = %self.address, anchor = %frame.sender, "anchor discovered");
                self.anchors.push(frame.sender);
                events.push(TagEvent::AnchorDiscovered(frame.sender));
                if self.anchors.len() >= usize::from(self.config.min_anchors) {
                    self.enter_ranging_init(now_ms);
                }
            }
            (TagState::RangingInit, MessageKind::AnchorAddr) => {
                let Some(position) = self.anchors.iter().position(|anchor| *anchor == frame.sender) else {
                    return;
                };
                if frame.timestamps[0].raw() != position as u64 {
                    return;
                }
                self.last_activity_ms = now_ms;
                if !self.acknowledged.contains(&frame.sender) {
                    self.acknowledged.push(frame.sender);
                }
                if self.acknowledged.len() == self.anchors.len() {
                    self.current = 0;
                    self.consecutive_timeouts = 0;
                    self.send_poll(now_ms, events);
                }
            }
            (TagState::PollAckWait, MessageKind::PollAck) => {
                let Some(session) = self.session.filter(|session| session.anchor == frame.sender) else {
                    return;
                };
                self.last_activity_ms = now_ms;
                self.state = TagState::Range;
                let range_sent = rx.wrapping_add(self.config.reply_delay());
                let range = Frame::new(MessageKind::Range, self.address, session.anchor)
                    .with_timestamps([session.poll_sent, rx, range_sent]);
                let bytes = frame::encode(&range);
                match self.radio.transmit_at(&bytes, range_sent) {
                    Ok(()) => {
                        log_frame("tag", Direction::Tx, "Range", &bytes);
                        self.enter(TagState::RangeReportWait, now_ms);
                    }
                    Err(e) => {
                        warn!(tag = %self.address, error = %e, "range transmission failed");
                        self.on_timeout(now_ms, events);
                    }
                }
            }
            (TagState::RangeReportWait, MessageKind::RangeReport) => {
                if self.session.map(|session| session.anchor) != Some(frame.sender) {
                    return;
                }
                self.last_activity_ms = now_ms;
                let range = frame.reported_range();
                debug!(tag = %self.address, anchor = %frame.sender, %range, "range reported");
                self.ranges.push((frame.sender.id(), range));
                self.advance(now_ms, events);
            }
            (state, kind) => {
                trace!(tag = %self.address, ?state, ?kind, "unexpected frame dropped");
            }
        }
    }

    fn handle_timers(&mut self, now_ms: u64, events: &mut Vec<TagEvent>) {
        let elapsed = now_ms.saturating_sub(self.state_entered_ms);
        match self.state {
            TagState::Discovery => {
                if let Some(until) = self.backoff_until_ms {
                    if now_ms < until {
                        return;
                    }
                    self.enter_discovery(now_ms);
                }
                let elapsed = now_ms.saturating_sub(self.state_entered_ms);
                if elapsed >= self.config.discovery_timeout_ms {
                    if self.anchors.is_empty() {
                        debug!(tag = %self.address, "no anchor answered, backing off");
                        self.backoff_until_ms = Some(now_ms + self.config.discovery_backoff_ms);
                    } else {
                        self.enter_ranging_init(now_ms);
                    }
                    return;
                }
                let blink_due = self
                    .last_blink_ms
                    .map_or(true, |last| now_ms.saturating_sub(last) >= self.config.blink_interval_ms);
                if blink_due {
                    let blink = Frame::new(MessageKind::Blink, self.address, Address::NONE);
                    if self.transmit(&blink) {
                        self.last_blink_ms = Some(now_ms);
                    }
                }
            }
            TagState::RangingInit if elapsed >= self.config.ranging_init_timeout_ms => {
                debug!(tag = %self.address, acknowledged = self.acknowledged.len(), "ranging init timed out");
                self.enter_discovery(now_ms);
            }
            TagState::Poll => self.send_poll(now_ms, events),
            TagState::PollAckWait if elapsed >= self.config.poll_ack_timeout_ms => self.on_timeout(now_ms, events),
            TagState::RangeReportWait if elapsed >= self.config.range_report_timeout_ms => {
                self.on_timeout(now_ms, events)
            }
            _ => {}
        }
    }

    fn enter(&mut self, state: TagState, now_ms: u64) {
        self.state = state;
        self.state_entered_ms = now_ms;
    }

    fn enter_discovery(&mut self, now_ms: u64) {
        self.enter(TagState::Discovery, now_ms);
        self.anchors.clear();
        self.acknowledged.clear();
        self.session = None;
        self.last_blink_ms = None;
        self.backoff_until_ms = None;
    }

    fn enter_ranging_init(&mut self, now_ms: u64) {
        self.enter(TagState::RangingInit, now_ms);
        self.acknowledged.clear();
        let announce = Frame::anchor_list(self.address, &self.anchors);
        self.transmit(&announce);
    }

    fn send_poll(&mut self, now_ms: u64, events: &mut Vec<TagEvent>) {
        let Some(&anchor) = self.anchors.get(self.current) else {
            self.finish_round(now_ms, events);
            return;
        };
        self.enter(TagState::Poll, now_ms);
        let poll = frame::encode(&Frame::new(MessageKind::Poll, self.address, anchor));
        match self.radio.transmit(&poll) {
            Ok(poll_sent) => {
                log_frame("tag", Direction::Tx, "Poll", &poll);
                self.session = Some(TagSession { anchor, poll_sent });
                self.enter(TagState::PollAckWait, now_ms);
            }
            Err(e) => warn!(tag = %self.address, error = %e, "poll transmission failed"),
        }
    }

    fn on_timeout(&mut self, now_ms: u64, events: &mut Vec<TagEvent>) {
        self.consecutive_timeouts += 1;
        let Some(&anchor) = self.anchors.get(self.current) else {
            self.finish_round(now_ms, events);
            return;
        };
        if self.consecutive_timeouts > self.config.max_poll_retries {
            warn!(tag = %self.address, %anchor, "anchor stale");
            self.ranges.push((anchor.id(), Range::Failed));
            events.push(TagEvent::AnchorStale(anchor));
            self.advance(now_ms, events);
        } else {
            debug!(tag = %self.address, %anchor, attempt = self.consecutive_timeouts, "retrying poll");
            self.send_poll(now_ms, events);
        }
    }

    fn advance(&mut self, now_ms: u64, events: &mut Vec<TagEvent>) {
        self.session = None;
        self.consecutive_timeouts = 0;
        self.current += 1;
        self.send_poll(now_ms, events);
    }

    fn finish_round(&mut self, now_ms: u64, events: &mut Vec<TagEvent>) {
        let report = RoundReport {
            tag_id: self.address.id(),
            ranges: std::mem::take(&mut self.ranges),
            duration_ms: now_ms.saturating_sub(self.round_started_ms),
        };
        info!(tag = %self.address, ranges = report.ranges.len(), duration_ms = report.duration_ms, "round complete");
        self.session = None;
        self.enter(TagState::Idle, now_ms);
        self.sleep_until_ms = now_ms + self.config.round_sleep_ms;
        events.push(TagEvent::RoundComplete(report));
    }

    fn transmit(&mut self, frame: &Frame) -> bool {
        let bytes = frame::encode(frame);
        match self.radio.transmit(&bytes) {
            Ok(_) => {
                log_frame("tag", Direction::Tx, &format!("{:?}", frame.kind), &bytes);
                true
            }
            Err(e) => {
                warn!(tag = %self.address, error = %e, kind = ?frame.kind, "transmission failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::hardware::MockRadio;

    const A1: Address = Address::anchor(101);
    const A2: Address = Address::anchor(102);
    const ME: Address = Address::tag(1);

    fn tag() -> TagNode<MockRadio> {
        TagNode::new(MockRadio::new(ME), 1, RangingConfig::default())
    }

    fn deliver(node: &mut TagNode<MockRadio>, frame: Frame, rx: u64) {
        node.radio_mut().push_frame(frame::encode(&frame).to_vec(), RadioTimestamp::new(rx));
    }

    fn sent_kinds(node: &TagNode<MockRadio>) -> Vec<(MessageKind, Address)> {
        node.radio()
            .sent_frames()
            .iter()
            .map(|sent| {
                let frame = frame::decode(&sent.data).unwrap();
                (frame.kind, frame.receiver)
            })
            .collect()
    }

    /// Run discovery and ranging init against two anchors
    fn ranging_tag(now: u64) -> TagNode<MockRadio> {
        let mut node = tag();
        node.start_round(now).unwrap();
        node.step(now);
        for anchor in [A1, A2] {
            deliver(&mut node, Frame::new(MessageKind::AnchorAddr, anchor, ME), 0);
        }
        let events = node.step(now + 1);
        assert_eq!(events, vec![TagEvent::AnchorDiscovered(A1), TagEvent::AnchorDiscovered(A2)]);
        assert_eq!(node.state(), TagState::RangingInit);

        for (position, anchor) in [A1, A2].into_iter().enumerate() {
            let ack = Frame::new(MessageKind::AnchorAddr, anchor, ME).with_slot(0, position as u64);
            deliver(&mut node, ack, 0);
        }
        node.step(now + 2);
        assert_eq!(node.state(), TagState::PollAckWait);
        node
    }

    #[test]
    fn test_discovery_blinks_and_lists_anchors() {
        let node = ranging_tag(0);
        assert_eq!(node.address(), ME);
        let kinds = sent_kinds(&node);
        assert_eq!(kinds[0], (MessageKind::Blink, Address::NONE));
        assert_eq!(kinds[1], (MessageKind::AnchorAddr, Address::NONE));
        assert_eq!(kinds[2], (MessageKind::Poll, A1));

        let announce = frame::decode(&node.radio().sent_frames()[1].data).unwrap();
        assert_eq!(announce.listed_anchors(), vec![A1, A2]);
    }

    #[test]
    fn test_poll_ack_schedules_range() {
        let mut node = ranging_tag(0);
        node.radio_mut().set_clock(RadioTimestamp::new(1_000));
        deliver(&mut node, Frame::new(MessageKind::PollAck, A1, ME), 500_000);
        node.step(3);
        assert_eq!(node.state(), TagState::RangeReportWait);

        let sent = node.radio().sent_frames().last().unwrap().clone();
        let range = frame::decode(&sent.data).unwrap();
        assert_eq!(range.kind, MessageKind::Range);
        assert_eq!(range.timestamps[1].raw(), 500_000);
        assert_eq!(range.timestamps[2].raw(), 500_000 + 191_692_800);
        assert!(sent.delayed);
        assert_eq!(sent.at, range.timestamps[2]);
    }

    #[test]
    fn test_poll_timeout_retries_once_then_advances() {
        let mut node = ranging_tag(0);

        let events = node.step(12);
        assert!(events.is_empty());
        assert_eq!(node.state(), TagState::PollAckWait);

        let events = node.step(22);
        assert_eq!(events, vec![TagEvent::AnchorStale(A1)]);

        let polls: Vec<Address> = sent_kinds(&node)
            .into_iter()
            .filter(|(kind, _)| *kind == MessageKind::Poll)
            .map(|(_, receiver)| receiver)
            .collect();
        assert_eq!(polls, vec![A1, A1, A2]);
    }

    #[test]
    fn test_full_round_reports_ranges() {
        let mut node = ranging_tag(0);
        for (step, anchor, range) in [(3, A1, Range::Measured(2.5)), (5, A2, Range::Failed)] {
            deliver(&mut node, Frame::new(MessageKind::PollAck, anchor, ME), 1_000);
            node.step(step);
            deliver(&mut node, Frame::range_report(anchor, ME, range), 0);
            let events = node.step(step + 1);
            if anchor == A2 {
                assert_eq!(
                    events,
                    vec![TagEvent::RoundComplete(RoundReport {
                        tag_id: 1,
                        ranges: vec![(101, Range::Measured(2.5)), (102, Range::Failed)],
                        duration_ms: 6,
                    })]
                );
            }
        }
        assert_eq!(node.state(), TagState::Idle);
        assert_eq!(node.start_round(50), Err(StartError::Sleeping { remaining_ms: 56 }));
        assert!(node.start_round(106).is_ok());
    }

    #[test]
    fn test_foreign_and_malformed_frames_are_ignored() {
        let mut node = ranging_tag(0);
        deliver(&mut node, Frame::new(MessageKind::PollAck, A1, Address::tag(2)), 0);
        deliver(&mut node, Frame::new(MessageKind::PollAck, A2, ME), 0);
        node.radio_mut().push_frame(vec![4, 1, 2], RadioTimestamp::ZERO);
        node.step(3);
        assert_eq!(node.state(), TagState::PollAckWait);
    }

    #[test]
    fn test_discovery_backs_off_without_anchors() {
        let mut node = tag();
        node.start_round(0).unwrap();
        node.step(0);
        node.step(100);
        assert_eq!(node.state(), TagState::Discovery);
        let blinks = sent_kinds(&node).len();

        node.step(150);
        assert_eq!(sent_kinds(&node).len(), blinks);
        node.step(200);
        assert_eq!(sent_kinds(&node).len(), blinks + 1);
    }

    #[test]
    fn test_single_anchor_proceeds_after_discovery_timeout() {
        let mut node = tag();
        node.start_round(0).unwrap();
        node.step(0);
        deliver(&mut node, Frame::new(MessageKind::AnchorAddr, A1, ME), 0);
        node.step(10);
        assert_eq!(node.state(), TagState::Discovery);
        node.step(100);
        assert_eq!(node.state(), TagState::RangingInit);
    }

    #[test]
    fn test_silence_escalates_to_soft_then_hard_reset() {
        let mut node = tag();
        node.start_round(0).unwrap();
        let mut soft = 0;
        let mut hard = 0;
        for now in (0..=3_000).step_by(10) {
            for event in node.step(now) {
                match event {
                    TagEvent::SoftReset => soft += 1,
                    TagEvent::HardReset => hard += 1,
                    _ => {}
                }
            }
        }
        assert_eq!(soft, 5);
        assert_eq!(hard, 1);
        assert_eq!(node.state(), TagState::Idle);
        assert_eq!(node.radio().status().resets, 1);
    }

    #[test]
    fn test_start_refused_while_busy() {
        let mut node = tag();
        node.start_round(0).unwrap();
        assert_eq!(node.start_round(1), Err(StartError::Busy));
    }
}
