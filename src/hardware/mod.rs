//! Hardware abstraction layer for UWB radios
//!
//! The ranging state machines only talk to [`RadioInterface`]; tests and the
//! simulator drive them through [`MockRadio`] and [`MockAir`].

pub mod error;
pub mod mock;
pub mod radio;

pub use error::{CommError, CommResult, RecoveryStrategy};
pub use mock::{AirRadio, MockAir, MockRadio};
pub use radio::{RadioConfig, RadioInterface, RadioStatus};

use crate::core::RadioTimestamp;

/// Frame as delivered by the radio, stamped with the receive counter value
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    pub data: Vec<u8>,
    pub rx_timestamp: RadioTimestamp,
    pub signal_strength: Option<u8>,
}

impl RawFrame {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            rx_timestamp: RadioTimestamp::ZERO,
            signal_strength: None,
        }
    }

    pub fn with_timestamp(mut self, rx_timestamp: RadioTimestamp) -> Self {
        self.rx_timestamp = rx_timestamp;
        self
    }

    pub fn with_signal_strength(mut self, strength: u8) -> Self {
        self.signal_strength = Some(strength);
        self
    }
}
