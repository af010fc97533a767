//! Fixed-layout ranging frame codec
//!
//! Layout (20 bytes, little-endian):
//! `[kind(1)] [sender(2)] [receiver(2)] [slot0(5)] [slot1(5)] [slot2(5)]`

use crate::core::{Address, RadioTimestamp, Range};
use std::ops::Range as ByteRange;
use thiserror::Error;

pub const FRAME_LEN: usize = 20;

const KIND_BYTE: usize = 0;
const SENDER_BYTES: ByteRange<usize> = 1..3;
const RECEIVER_BYTES: ByteRange<usize> = 3..5;
const SLOTS_START: usize = 5;

/// Slot value reporting a failed measurement
pub const FAILURE_MARKER: u64 = 0xFF_FFFF_FFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Blink = 1,
    AnchorAddr = 2,
    Poll = 3,
    PollAck = 4,
    Range = 5,
    RangeReport = 6,
}

impl TryFrom<u8> for MessageKind {
    type Error = FrameError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            1 => Ok(MessageKind::Blink),
            2 => Ok(MessageKind::AnchorAddr),
            3 => Ok(MessageKind::Poll),
            4 => Ok(MessageKind::PollAck),
            5 => Ok(MessageKind::Range),
            6 => Ok(MessageKind::RangeReport),
            other => Err(FrameError::UnknownKind { kind: other }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("malformed frame: expected 20 bytes, got {len}")]
    Malformed { len: usize },
    #[error("unknown message kind {kind}")]
    UnknownKind { kind: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub kind: MessageKind,
    pub sender: Address,
    pub receiver: Address,
    pub timestamps: [RadioTimestamp; 3],
}

impl Frame {
    pub fn new(kind: MessageKind, sender: Address, receiver: Address) -> Self {
        Self {
            kind,
            sender,
            receiver,
            timestamps: [RadioTimestamp::ZERO; 3],
        }
    }

    pub fn with_timestamps(mut self, timestamps: [RadioTimestamp; 3]) -> Self {
        self.timestamps = timestamps;
        self
    }

    pub fn with_slot(mut self, slot: usize, value: u64) -> Self {
        if let Some(target) = self.timestamps.get_mut(slot) {
            *target = RadioTimestamp::new(value);
        }
        self
    }

    /// Ranging-init announcement listing the anchors in ranging order
    pub fn anchor_list(sender: Address, anchors: &[Address]) -> Self {
        let mut packed = [0u8; 8];
        for (chunk, anchor) in packed.chunks_exact_mut(2).zip(anchors.iter().take(2)) {
            chunk.copy_from_slice(&anchor.to_le_bytes());
        }
        Self::new(MessageKind::AnchorAddr, sender, Address::NONE).with_slot(0, u64::from_le_bytes(packed))
    }

    /// Anchors packed by [`Frame::anchor_list`], in order
    pub fn listed_anchors(&self) -> Vec<Address> {
        let packed = self.timestamps[0].raw().to_le_bytes();
        packed[..4]
            .chunks_exact(2)
            .map(|chunk| Address::from_le_bytes([chunk[0], chunk[1]]))
            .filter(|address| !address.is_none())
            .collect()
    }

    /// Distance report carrying millimetres or the failure marker
    pub fn range_report(sender: Address, receiver: Address, range: Range) -> Self {
        let value = match range {
            Range::Measured(metres) => ((metres * 1000.0).round() as u64).min(FAILURE_MARKER - 1),
            Range::Failed => FAILURE_MARKER,
        };
        Self::new(MessageKind::RangeReport, sender, receiver).with_slot(0, value)
    }

    pub fn reported_range(&self) -> Range {
        match self.timestamps[0].raw() {
            FAILURE_MARKER => Range::Failed,
            millimetres => Range::Measured(millimetres as f64 / 1000.0),
        }
    }
}

pub fn encode(frame: &Frame) -> [u8; FRAME_LEN] {
    let mut bytes = [0u8; FRAME_LEN];
    bytes[KIND_BYTE] = frame.kind as u8;
    bytes[SENDER_BYTES].copy_from_slice(&frame.sender.to_le_bytes());
    bytes[RECEIVER_BYTES].copy_from_slice(&frame.receiver.to_le_bytes());
    for (slot, timestamp) in frame.timestamps.iter().enumerate() {
        let start = SLOTS_START + slot * RadioTimestamp::ENCODED_LEN;
        bytes[start..start + RadioTimestamp::ENCODED_LEN].copy_from_slice(&timestamp.to_le_bytes());
    }
    bytes
}

pub fn decode(bytes: &[u8]) -> Result<Frame, FrameError> {
    if bytes.len() != FRAME_LEN {
        return Err(FrameError::Malformed { len: bytes.len() });
    }

    let kind = MessageKind::try_from(bytes[KIND_BYTE])?;
    let sender = Address::from_le_bytes([bytes[1], bytes[2]]);
    let receiver = Address::from_le_bytes([bytes[3], bytes[4]]);

    let mut timestamps = [RadioTimestamp::ZERO; 3];
    for (slot, timestamp) in timestamps.iter_mut().enumerate() {
        let start = SLOTS_START + slot * RadioTimestamp::ENCODED_LEN;
        let mut raw = [0u8; RadioTimestamp::ENCODED_LEN];
        raw.copy_from_slice(&bytes[start..start + RadioTimestamp::ENCODED_LEN]);
        *timestamp = RadioTimestamp::from_le_bytes(raw);
    }

    Ok(Frame {
        kind,
        sender,
        receiver,
        timestamps,
    })
}

/// Compare the sender bytes without decoding the frame
pub fn sender_matches(bytes: &[u8], address: Address) -> bool {
    bytes.get(SENDER_BYTES) == Some(&address.to_le_bytes()[..])
}

/// Compare the receiver bytes without decoding the frame
pub fn receiver_matches(bytes: &[u8], address: Address) -> bool {
    bytes.get(RECEIVER_BYTES) == Some(&address.to_le_bytes()[..])
}

pub fn kind_of(bytes: &[u8]) -> Option<MessageKind> {
    bytes.get(KIND_BYTE).and_then(|byte| MessageKind::try_from(*byte).ok())
}
