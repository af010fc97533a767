//! Relay between ranging tags and the durable sample log

pub mod client;
pub mod log;
pub mod scheduler;
pub mod server;

pub use client::{payload_from_report, ClientError, RelayClient};
pub use log::SampleLog;
pub use scheduler::{ClientId, SchedulerError, TurnOutcome, TurnScheduler, TurnState};
pub use server::{wall_clock_ms, RelayError, RelayServer, RelayStats, ACK_TOKEN, GRANT_TOKEN};
