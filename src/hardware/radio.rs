//! Radio interface trait and configuration

use crate::core::{Address, RadioTimestamp};
use crate::hardware::{CommError, CommResult, RawFrame};
use serde::{Deserialize, Serialize};

/// Hardware abstraction for a UWB radio with a 40-bit timestamp counter
pub trait RadioInterface {
    /// Poll for a received frame.
    /// Returns Ok(None) when nothing is pending (non-blocking).
    fn receive(&mut self) -> CommResult<Option<RawFrame>>;

    /// Transmit immediately and return the counter value at transmission
    fn transmit(&mut self, data: &[u8]) -> CommResult<RadioTimestamp>;

    /// Transmit when the counter reaches `at`
    fn transmit_at(&mut self, data: &[u8], at: RadioTimestamp) -> CommResult<()>;

    /// Current counter value
    fn now(&self) -> RadioTimestamp;

    fn status(&self) -> RadioStatus;

    fn configure(&mut self, config: &RadioConfig) -> CommResult<()>;

    /// Reinitialize the radio, dropping anything pending
    fn reset(&mut self) -> CommResult<()>;
}

/// Radio status counters
#[derive(Debug, Clone, PartialEq)]
pub struct RadioStatus {
    pub address: Address,
    pub connected: bool,
    pub frames_received: u32,
    pub frames_sent: u32,
    pub error_count: u32,
    pub resets: u32,
}

impl RadioStatus {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            connected: true,
            frames_received: 0,
            frames_sent: 0,
            error_count: 0,
            resets: 0,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.connected && self.error_count < 10
    }
}

/// Radio configuration parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RadioConfig {
    pub address: Address,
    /// PAN identifier shared by every node of one deployment
    pub network_id: u16,
    /// Antenna delay in counter ticks
    pub antenna_delay: u16,
    pub max_frame_size: usize,
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            address: Address::NONE,
            network_id: 0xDECA,
            antenna_delay: 16_436,
            max_frame_size: 127,
        }
    }
}

impl RadioConfig {
    pub fn for_address(address: Address) -> Self {
        Self {
            address,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> CommResult<()> {
        if self.address.is_none() {
            return Err(CommError::ConfigurationError {
                parameter: "address".to_string(),
                value: self.address.raw().to_string(),
            });
        }

        if self.max_frame_size == 0 || self.max_frame_size > 1023 {
            return Err(CommError::ConfigurationError {
                parameter: "max_frame_size".to_string(),
                value: self.max_frame_size.to_string(),
            });
        }

        Ok(())
    }
}
