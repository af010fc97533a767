//! Radio error types and recovery hints

use thiserror::Error;

/// Errors raised by a radio interface
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CommError {
    /// Radio stopped answering
    #[error("radio {address:#06x} is not responding")]
    ConnectionLost { address: u16 },
    /// Delayed transmission requested for a time already in the past
    #[error("delayed transmission at {requested} missed, radio clock at {now}")]
    LateTransmission { requested: u64, now: u64 },
    /// Frame larger than the radio accepts
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },
    /// Hardware-specific failure
    #[error("hardware error {code}: {description}")]
    HardwareError { code: u32, description: String },
    /// Rejected configuration value
    #[error("configuration error: invalid {parameter} = {value}")]
    ConfigurationError { parameter: String, value: String },
}

/// Result type for radio operations
pub type CommResult<T> = Result<T, CommError>;

/// Recovery strategy for radio failures
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RecoveryStrategy {
    /// Retry the operation immediately
    Retry,
    /// Reset the radio and retry
    ResetAndRetry,
    /// Skip this operation and continue
    Skip,
    /// Fail permanently
    Fail,
}

impl CommError {
    /// Recommended recovery strategy for this error
    pub fn recovery_strategy(&self) -> RecoveryStrategy {
        match self {
            CommError::ConnectionLost { .. } => RecoveryStrategy::ResetAndRetry,
            CommError::LateTransmission { .. } => RecoveryStrategy::Retry,
            CommError::FrameTooLarge { .. } => RecoveryStrategy::Skip,
            CommError::HardwareError { .. } => RecoveryStrategy::ResetAndRetry,
            CommError::ConfigurationError { .. } => RecoveryStrategy::Fail,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        !matches!(self.recovery_strategy(), RecoveryStrategy::Fail)
    }
}
