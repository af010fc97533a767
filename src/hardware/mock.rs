//! Mock radios for tests and simulation

use crate::core::{Address, RadioTimestamp, DISTANCE_PER_RADIO_UNIT_M, RADIO_HALF_RANGE, RADIO_UNITS_PER_MILLISECOND};
use crate::hardware::{CommError, CommResult, RadioConfig, RadioInterface, RadioStatus, RawFrame};
use std::cell::RefCell;
use std::collections::{HashSet, VecDeque};
use std::rc::Rc;

/// Frame handed to a mock radio for transmission
#[derive(Debug, Clone, PartialEq)]
pub struct SentFrame {
    pub data: Vec<u8>,
    /// Counter value at which the frame left the antenna
    pub at: RadioTimestamp,
    pub delayed: bool,
}

/// Scripted radio: tests push inbound frames and inspect what was sent
pub struct MockRadio {
    status: RadioStatus,
    config: RadioConfig,
    inbound: VecDeque<RawFrame>,
    sent: Vec<SentFrame>,
    clock: RadioTimestamp,
    simulate_errors: bool,
    error_probability: f32,
}

impl MockRadio {
    pub fn new(address: Address) -> Self {
        Self {
            status: RadioStatus::new(address),
            config: RadioConfig::for_address(address),
            inbound: VecDeque::new(),
            sent: Vec::new(),
            clock: RadioTimestamp::ZERO,
            simulate_errors: false,
            error_probability: 0.0,
        }
    }

    /// Queue a frame as if it had been received at `rx_timestamp`
    pub fn push_frame(&mut self, data: Vec<u8>, rx_timestamp: RadioTimestamp) {
        self.inbound.push_back(RawFrame::new(data).with_timestamp(rx_timestamp).with_signal_strength(75));
    }

    pub fn set_clock(&mut self, clock: RadioTimestamp) {
        self.clock = clock;
    }

    pub fn advance_clock(&mut self, ticks: u64) {
        self.clock = self.clock.wrapping_add(RadioTimestamp::new(ticks));
    }

    pub fn sent_frames(&self) -> &[SentFrame] {
        &self.sent
    }

    pub fn clear_sent(&mut self) {
        self.sent.clear();
    }

    pub fn queued_frame_count(&self) -> usize {
        self.inbound.len()
    }

    /// Enable error simulation with given probability (0.0 to 1.0)
    pub fn simulate_errors(&mut self, enable: bool, probability: f32) {
        self.simulate_errors = enable;
        self.error_probability = probability.clamp(0.0, 1.0);
    }

    pub fn disconnect(&mut self) {
        self.status.connected = false;
    }

    pub fn reconnect(&mut self) {
        self.status.connected = true;
    }

    fn should_simulate_error(&self) -> bool {
        if !self.simulate_errors {
            return false;
        }

        use rand::Rng;
        let mut rng = rand::thread_rng();
        rng.gen::<f32>() < self.error_probability
    }

    fn check_link(&mut self, len: usize) -> CommResult<()> {
        if !self.status.connected {
            return Err(CommError::ConnectionLost {
                address: self.status.address.raw(),
            });
        }
        if self.should_simulate_error() {
            self.status.error_count += 1;
            return Err(CommError::HardwareError {
                code: 1001,
                description: "simulated radio failure".to_string(),
            });
        }
        if len > self.config.max_frame_size {
            return Err(CommError::FrameTooLarge {
                len,
                max: self.config.max_frame_size,
            });
        }
        Ok(())
    }
}

impl RadioInterface for MockRadio {
    fn receive(&mut self) -> CommResult<Option<RawFrame>> {
        if !self.status.connected {
            return Err(CommError::ConnectionLost {
                address: self.status.address.raw(),
            });
        }
        let frame = self.inbound.pop_front();
        if frame.is_some() {
            self.status.frames_received += 1;
        }
        Ok(frame)
    }

    fn transmit(&mut self, data: &[u8]) -> CommResult<RadioTimestamp> {
        self.check_link(data.len())?;
        self.sent.push(SentFrame {
            data: data.to_vec(),
            at: self.clock,
            delayed: false,
        });
        self.status.frames_sent += 1;
        Ok(self.clock)
    }

    fn transmit_at(&mut self, data: &[u8], at: RadioTimestamp) -> CommResult<()> {
        self.check_link(data.len())?;
        if at.ticks_since(self.clock) >= RADIO_HALF_RANGE {
            return Err(CommError::LateTransmission {
                requested: at.raw(),
                now: self.clock.raw(),
            });
        }
        self.sent.push(SentFrame {
            data: data.to_vec(),
            at,
            delayed: true,
        });
        self.status.frames_sent += 1;
        Ok(())
    }

    fn now(&self) -> RadioTimestamp {
        self.clock
    }

    fn status(&self) -> RadioStatus {
        self.status.clone()
    }

    fn configure(&mut self, config: &RadioConfig) -> CommResult<()> {
        config.validate()?;
        self.status.address = config.address;
        self.config = config.clone();
        Ok(())
    }

    fn reset(&mut self) -> CommResult<()> {
        self.inbound.clear();
        self.status.error_count = 0;
        self.status.resets += 1;
        Ok(())
    }
}

struct AirNode {
    address: Address,
    position: (f64, f64),
    clock_offset: u64,
    inbound: VecDeque<RawFrame>,
    status: RadioStatus,
    max_frame_size: usize,
}

impl AirNode {
    fn local_time(&self, true_ticks: u64) -> RadioTimestamp {
        RadioTimestamp::new(true_ticks.wrapping_add(self.clock_offset))
    }
}

struct AirState {
    true_ticks: u64,
    nodes: Vec<AirNode>,
    silenced: HashSet<Address>,
}

impl AirState {
    fn deliver(&mut self, from: usize, data: &[u8], true_ticks: u64) {
        let sender = self.nodes[from].address;
        if self.silenced.contains(&sender) {
            return;
        }
        let origin = self.nodes[from].position;
        for (index, node) in self.nodes.iter_mut().enumerate() {
            if index == from || self.silenced.contains(&node.address) {
                continue;
            }
            let distance = ((node.position.0 - origin.0).powi(2) + (node.position.1 - origin.1).powi(2)).sqrt();
            let flight = (distance / DISTANCE_PER_RADIO_UNIT_M).round() as u64;
            let rx = node.local_time(true_ticks + flight);
            node.inbound.push_back(RawFrame::new(data.to_vec()).with_timestamp(rx));
        }
    }
}

/// Shared radio medium with node geometry and free-running clocks.
///
/// Every transmission reaches every other attached radio, stamped with the
/// receiver's own counter at arrival time.
#[derive(Clone)]
pub struct MockAir {
    state: Rc<RefCell<AirState>>,
}

impl MockAir {
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(AirState {
                true_ticks: 0,
                nodes: Vec::new(),
                silenced: HashSet::new(),
            })),
        }
    }

    /// Attach a radio at `(x, y)` metres whose counter runs `clock_offset`
    /// ticks ahead of the medium's reference clock
    pub fn attach(&self, address: Address, x: f64, y: f64, clock_offset: u64) -> AirRadio {
        let mut state = self.state.borrow_mut();
        state.nodes.push(AirNode {
            address,
            position: (x, y),
            clock_offset,
            inbound: VecDeque::new(),
            status: RadioStatus::new(address),
            max_frame_size: RadioConfig::default().max_frame_size,
        });
        AirRadio {
            state: Rc::clone(&self.state),
            index: state.nodes.len() - 1,
        }
    }

    pub fn advance_ms(&self, ms: u64) {
        self.state.borrow_mut().true_ticks += ms * RADIO_UNITS_PER_MILLISECOND;
    }

    pub fn move_node(&self, address: Address, x: f64, y: f64) {
        let mut state = self.state.borrow_mut();
        if let Some(node) = state.nodes.iter_mut().find(|node| node.address == address) {
            node.position = (x, y);
        }
    }

    /// Stop a node from sending or hearing anything
    pub fn silence(&self, address: Address) {
        self.state.borrow_mut().silenced.insert(address);
    }

    pub fn unsilence(&self, address: Address) {
        self.state.borrow_mut().silenced.remove(&address);
    }
}

impl Default for MockAir {
    fn default() -> Self {
        Self::new()
    }
}

/// One node's view of a [`MockAir`]
pub struct AirRadio {
    state: Rc<RefCell<AirState>>,
    index: usize,
}

impl RadioInterface for AirRadio {
    fn receive(&mut self) -> CommResult<Option<RawFrame>> {
        let mut state = self.state.borrow_mut();
        let node = &mut state.nodes[self.index];
        let frame = node.inbound.pop_front();
        if frame.is_some() {
            node.status.frames_received += 1;
        }
        Ok(frame)
    }

    fn transmit(&mut self, data: &[u8]) -> CommResult<RadioTimestamp> {
        let mut state = self.state.borrow_mut();
        let max = state.nodes[self.index].max_frame_size;
        if data.len() > max {
            return Err(CommError::FrameTooLarge { len: data.len(), max });
        }
        let true_ticks = state.true_ticks;
        state.deliver(self.index, data, true_ticks);
        let node = &mut state.nodes[self.index];
        node.status.frames_sent += 1;
        Ok(node.local_time(true_ticks))
    }

    fn transmit_at(&mut self, data: &[u8], at: RadioTimestamp) -> CommResult<()> {
        let mut state = self.state.borrow_mut();
        let true_now = state.true_ticks;
        let node = &state.nodes[self.index];
        if data.len() > node.max_frame_size {
            return Err(CommError::FrameTooLarge {
                len: data.len(),
                max: node.max_frame_size,
            });
        }
        let now = node.local_time(true_now);
        let ahead = at.ticks_since(now);
        if ahead >= RADIO_HALF_RANGE {
            return Err(CommError::LateTransmission {
                requested: at.raw(),
                now: now.raw(),
            });
        }
        state.deliver(self.index, data, true_now + ahead);
        state.nodes[self.index].status.frames_sent += 1;
        Ok(())
    }

    fn now(&self) -> RadioTimestamp {
        let state = self.state.borrow();
        state.nodes[self.index].local_time(state.true_ticks)
    }

    fn status(&self) -> RadioStatus {
        self.state.borrow().nodes[self.index].status.clone()
    }

    fn configure(&mut self, config: &RadioConfig) -> CommResult<()> {
        config.validate()?;
        let mut state = self.state.borrow_mut();
        let node = &mut state.nodes[self.index];
        node.address = config.address;
        node.status.address = config.address;
        node.max_frame_size = config.max_frame_size;
        Ok(())
    }

    fn reset(&mut self) -> CommResult<()> {
        let mut state = self.state.borrow_mut();
        let node = &mut state.nodes[self.index];
        node.inbound.clear();
        node.status.error_count = 0;
        node.status.resets += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_radio_queue() {
        let mut radio = MockRadio::new(Address::tag(1));
        radio.push_frame(vec![1, 2, 3], RadioTimestamp::new(42));
        assert_eq!(radio.queued_frame_count(), 1);

        let frame = radio.receive().unwrap().unwrap();
        assert_eq!(frame.data, vec![1, 2, 3]);
        assert_eq!(frame.rx_timestamp.raw(), 42);
        assert!(radio.receive().unwrap().is_none());
    }

    #[test]
    fn test_mock_radio_rejects_late_transmission() {
        let mut radio = MockRadio::new(Address::anchor(101));
        radio.set_clock(RadioTimestamp::new(1_000));

        assert!(radio.transmit_at(&[0; 20], RadioTimestamp::new(2_000)).is_ok());
        let err = radio.transmit_at(&[0; 20], RadioTimestamp::new(500)).unwrap_err();
        assert!(matches!(err, CommError::LateTransmission { .. }));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_mock_radio_disconnect() {
        let mut radio = MockRadio::new(Address::tag(1));
        radio.disconnect();
        assert!(matches!(radio.transmit(&[0; 20]), Err(CommError::ConnectionLost { .. })));
        radio.reconnect();
        assert!(radio.transmit(&[0; 20]).is_ok());
        assert_eq!(radio.status().frames_sent, 1);
    }

    #[test]
    fn test_air_stamps_flight_time() {
        let air = MockAir::new();
        let mut a = air.attach(Address::tag(1), 0.0, 0.0, 0);
        let mut b = air.attach(Address::anchor(101), 3.0, 4.0, 1_000_000);

        let sent = a.transmit(&[7; 20]).unwrap();
        let frame = b.receive().unwrap().unwrap();
        let flight = (5.0 / DISTANCE_PER_RADIO_UNIT_M).round() as u64;
        assert_eq!(frame.rx_timestamp.raw(), sent.raw() + flight + 1_000_000);
        assert!(a.receive().unwrap().is_none());
    }

    #[test]
    fn test_air_silenced_node() {
        let air = MockAir::new();
        let mut a = air.attach(Address::tag(1), 0.0, 0.0, 0);
        let mut b = air.attach(Address::anchor(101), 1.0, 0.0, 0);
        air.silence(Address::anchor(101));

        a.transmit(&[1; 20]).unwrap();
        assert!(b.receive().unwrap().is_none());
    }
}
