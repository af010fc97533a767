//! Core data types shared by the radio nodes, the relay and the offline engine

use crate::core::constants::{RADIO_TIMESTAMP_BITS, RADIO_UNITS_PER_MICROSECOND, TAG_ADDRESS_FLAG};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 16-bit radio node address.
///
/// Address 0 means "nobody" and doubles as the broadcast receiver. Bit 15
/// flags a tag; the remaining bits carry the configured node id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Address(u16);

impl Address {
    pub const NONE: Address = Address(0);

    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    /// Address of the tag with the given id
    pub const fn tag(id: u16) -> Self {
        Self(id | TAG_ADDRESS_FLAG)
    }

    /// Address of the anchor with the given id
    pub const fn anchor(id: u16) -> Self {
        Self(id & !TAG_ADDRESS_FLAG)
    }

    pub const fn raw(self) -> u16 {
        self.0
    }

    /// Node id without the tag flag
    pub const fn id(self) -> u16 {
        self.0 & !TAG_ADDRESS_FLAG
    }

    pub const fn is_tag(self) -> bool {
        self.0 & TAG_ADDRESS_FLAG != 0 && self.id() != 0
    }

    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    pub fn to_le_bytes(self) -> [u8; 2] {
        self.0.to_le_bytes()
    }

    pub fn from_le_bytes(bytes: [u8; 2]) -> Self {
        Self(u16::from_le_bytes(bytes))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "none")
        } else if self.is_tag() {
            write!(f, "tag-{}", self.id())
        } else {
            write!(f, "anchor-{}", self.id())
        }
    }
}

/// 40-bit radio counter value. Arithmetic wraps modulo 2^40.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct RadioTimestamp(u64);

impl RadioTimestamp {
    pub const MASK: u64 = (1 << RADIO_TIMESTAMP_BITS) - 1;
    pub const ZERO: RadioTimestamp = RadioTimestamp(0);
    pub const ENCODED_LEN: usize = 5;

    pub const fn new(raw: u64) -> Self {
        Self(raw & Self::MASK)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Counter ticks covering the given number of microseconds
    pub fn from_micros(micros: u64) -> Self {
        Self::new((micros as f64 * RADIO_UNITS_PER_MICROSECOND).round() as u64)
    }

    pub fn wrapping_add(self, other: RadioTimestamp) -> Self {
        Self::new(self.0.wrapping_add(other.0))
    }

    /// Ticks elapsed from `earlier` to `self`, modulo the counter width.
    ///
    /// An `earlier` that is actually later shows up as a value in the upper
    /// half of the counter range.
    pub fn ticks_since(self, earlier: RadioTimestamp) -> u64 {
        self.0.wrapping_sub(earlier.0) & Self::MASK
    }

    pub fn to_le_bytes(self) -> [u8; 5] {
        let bytes = self.0.to_le_bytes();
        [bytes[0], bytes[1], bytes[2], bytes[3], bytes[4]]
    }

    pub fn from_le_bytes(bytes: [u8; 5]) -> Self {
        let mut wide = [0u8; 8];
        wide[..5].copy_from_slice(&bytes);
        Self::new(u64::from_le_bytes(wide))
    }
}

/// Fixed anchor with operator-configured coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnchorPosition {
    pub id: u16,
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub is_origin: bool,
}

impl AnchorPosition {
    pub fn new(id: u16, x: f64, y: f64) -> Self {
        Self { id, x, y, is_origin: false }
    }

    pub fn origin(id: u16, x: f64, y: f64) -> Self {
        Self { id, x, y, is_origin: true }
    }
}

/// Outcome of ranging against one anchor
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Range {
    /// Measured distance in metres, never negative
    Measured(f64),
    /// Explicit failure marker: implausible measurement or stale anchor
    Failed,
}

impl Range {
    pub fn distance(self) -> Option<f64> {
        match self {
            Range::Measured(distance) => Some(distance),
            Range::Failed => None,
        }
    }

    pub fn is_measured(self) -> bool {
        matches!(self, Range::Measured(_))
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Range::Measured(distance) => write!(f, "{}", distance),
            Range::Failed => write!(f, "fail"),
        }
    }
}
