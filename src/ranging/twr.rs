//! Double-sided two-way ranging
//!
//! tof = (round1 * round2 - reply1 * reply2) / (round1 + round2 + reply1 + reply2)
//!
//! Clock offsets between tag and anchor cancel out because every interval is
//! measured on a single node's counter.

use crate::core::{RadioTimestamp, DISTANCE_PER_RADIO_UNIT_M, RADIO_HALF_RANGE};
use thiserror::Error;

/// The six timestamps of one ranging exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TwrTimestamps {
    pub poll_sent: RadioTimestamp,
    pub poll_received: RadioTimestamp,
    pub poll_ack_sent: RadioTimestamp,
    pub poll_ack_received: RadioTimestamp,
    pub range_sent: RadioTimestamp,
    pub range_received: RadioTimestamp,
}

/// Intervals in radio ticks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TwrIntervals {
    pub round1: u64,
    pub reply1: u64,
    pub round2: u64,
    pub reply2: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum TwrError {
    #[error("{interval} interval runs backwards")]
    NegativeInterval { interval: &'static str },
    #[error("interval sum is zero")]
    ZeroDenominator,
    #[error("negative time of flight ({ticks} ticks)")]
    NegativeTimeOfFlight { ticks: f64 },
    #[error("implausible distance {distance_m:.2}m (limit {limit_m}m)")]
    Implausible { distance_m: f64, limit_m: f64 },
}

fn interval(end: RadioTimestamp, start: RadioTimestamp, name: &'static str) -> Result<u64, TwrError> {
    let ticks = end.ticks_since(start);
    if ticks >= RADIO_HALF_RANGE {
        return Err(TwrError::NegativeInterval { interval: name });
    }
    Ok(ticks)
}

impl TwrTimestamps {
    pub fn intervals(&self) -> Result<TwrIntervals, TwrError> {
        Ok(TwrIntervals {
            round1: interval(self.poll_ack_received, self.poll_sent, "round1")?,
            reply1: interval(self.poll_ack_sent, self.poll_received, "reply1")?,
            round2: interval(self.range_received, self.poll_ack_sent, "round2")?,
            reply2: interval(self.range_sent, self.poll_ack_received, "reply2")?,
        })
    }
}

/// Time of flight in radio ticks
pub fn time_of_flight(intervals: &TwrIntervals) -> Result<f64, TwrError> {
    let TwrIntervals { round1, reply1, round2, reply2 } = *intervals;
    let denominator = round1 as i128 + round2 as i128 + reply1 as i128 + reply2 as i128;
    if denominator == 0 {
        return Err(TwrError::ZeroDenominator);
    }
    let numerator = round1 as i128 * round2 as i128 - reply1 as i128 * reply2 as i128;
    let ticks = numerator as f64 / denominator as f64;
    if ticks < 0.0 {
        return Err(TwrError::NegativeTimeOfFlight { ticks });
    }
    Ok(ticks)
}

/// Distance in metres, or the reason the exchange must be reported as failed
pub fn compute_distance(timestamps: &TwrTimestamps, max_plausible_m: f64) -> Result<f64, TwrError> {
    let intervals = timestamps.intervals()?;
    let distance_m = time_of_flight(&intervals)? * DISTANCE_PER_RADIO_UNIT_M;
    if distance_m > max_plausible_m {
        return Err(TwrError::Implausible {
            distance_m,
            limit_m: max_plausible_m,
        });
    }
    Ok(distance_m)
}
