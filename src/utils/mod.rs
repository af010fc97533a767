//! Configuration and logging

pub mod config;
pub mod logging;

pub use config::{ConfigError, ConfigurationManager, RangingConfig, RelayConfig, SystemConfig, ValidationResult};
pub use logging::{init_logging, LogLevel};
