//! Distance samples and their textual log format

use crate::core::Range;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const REQUEST_DURATION_MARKER: &str = ", overall request duration:";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SampleParseError {
    #[error("empty record")]
    Empty,
    #[error("invalid {field}: {value:?}")]
    InvalidField { field: &'static str, value: String },
    #[error("record carries no anchor ranges")]
    MissingRanges,
    #[error("expected two `anchorID distance` pairs and an optional duration, got {tokens} tokens")]
    RangeCount { tokens: usize },
}

/// Anchor ranges carried by every payload line
pub const RANGES_PER_PAYLOAD: usize = 2;

fn parse_field<T: FromStr>(field: &'static str, token: Option<&str>) -> Result<T, SampleParseError> {
    let token = token.ok_or(SampleParseError::InvalidField {
        field,
        value: String::new(),
    })?;
    token.parse().map_err(|_| SampleParseError::InvalidField {
        field,
        value: token.to_string(),
    })
}

fn parse_range(token: &str) -> Result<Range, SampleParseError> {
    if token.eq_ignore_ascii_case("fail") {
        return Ok(Range::Failed);
    }
    match token.parse::<f64>() {
        Ok(distance) if distance.is_finite() && distance >= 0.0 => Ok(Range::Measured(distance)),
        _ => Err(SampleParseError::InvalidField {
            field: "distance",
            value: token.to_string(),
        }),
    }
}

/// Line a tag sends to the relay:
/// `tagID anchor1ID distance1 anchor2ID distance2 [onboardDurationMs]`
#[derive(Debug, Clone, PartialEq)]
pub struct SamplePayload {
    pub tag_id: u16,
    pub ranges: Vec<(u16, Range)>,
    pub onboard_duration_ms: Option<f64>,
}

impl fmt::Display for SamplePayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag_id)?;
        for (anchor_id, range) in &self.ranges {
            write!(f, " {} {}", anchor_id, range)?;
        }
        if let Some(duration) = self.onboard_duration_ms {
            write!(f, " {}", duration)?;
        }
        Ok(())
    }
}

impl FromStr for SamplePayload {
    type Err = SampleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tokens: Vec<&str> = s.split_whitespace().collect();
        let (tag, rest) = tokens.split_first().ok_or(SampleParseError::Empty)?;
        let tag_id = parse_field("tag id", Some(tag))?;

        if rest.is_empty() {
            return Err(SampleParseError::MissingRanges);
        }
        let pair_tokens = 2 * RANGES_PER_PAYLOAD;
        let (pairs, duration) = match rest.len() {
            n if n == pair_tokens => (rest, None),
            n if n == pair_tokens + 1 => (&rest[..pair_tokens], rest.last().copied()),
            n => return Err(SampleParseError::RangeCount { tokens: n }),
        };

        let ranges = pairs
            .chunks_exact(2)
            .map(|pair| -> Result<(u16, Range), SampleParseError> {
                Ok((parse_field("anchor id", Some(pair[0]))?, parse_range(pair[1])?))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let onboard_duration_ms = duration
            .map(|token| parse_field::<f64>("onboard duration", Some(token)))
            .transpose()?;

        Ok(Self {
            tag_id,
            ranges,
            onboard_duration_ms,
        })
    }
}

/// One logged ranging round
#[derive(Debug, Clone, PartialEq)]
pub struct DistanceSample {
    /// Sequence number assigned by the relay
    pub index: u64,
    pub tag_id: u16,
    /// Wall-clock receipt time at the relay (ms since the Unix epoch)
    pub receipt_ms: u64,
    pub ranges: Vec<(u16, Range)>,
    pub onboard_duration_ms: Option<f64>,
    pub request_duration_ms: Option<u64>,
}

impl DistanceSample {
    pub fn from_payload(index: u64, receipt_ms: u64, payload: SamplePayload) -> Self {
        Self {
            index,
            tag_id: payload.tag_id,
            receipt_ms,
            ranges: payload.ranges,
            onboard_duration_ms: payload.onboard_duration_ms,
            request_duration_ms: None,
        }
    }

    pub fn payload(&self) -> SamplePayload {
        SamplePayload {
            tag_id: self.tag_id,
            ranges: self.ranges.clone(),
            onboard_duration_ms: self.onboard_duration_ms,
        }
    }

    pub fn range_to(&self, anchor_id: u16) -> Option<Range> {
        self.ranges
            .iter()
            .find(|(id, _)| *id == anchor_id)
            .map(|(_, range)| *range)
    }

    /// Parse `index wallClockMs payload[, overall request duration: Xms]`
    pub fn parse_record(line: &str) -> Result<Self, SampleParseError> {
        let (body, request_duration_ms) = match line.split_once(REQUEST_DURATION_MARKER) {
            Some((body, suffix)) => {
                let value = suffix.trim().trim_end_matches("ms").trim();
                (body, Some(parse_field("request duration", Some(value))?))
            }
            None => (line, None),
        };

        let body = body.trim();
        if body.is_empty() {
            return Err(SampleParseError::Empty);
        }
        let mut head = body.splitn(3, char::is_whitespace);
        let index = parse_field("index", head.next())?;
        let receipt_ms = parse_field("timestamp", head.next())?;
        let payload: SamplePayload = head.next().unwrap_or("").parse()?;

        Ok(Self {
            request_duration_ms,
            ..Self::from_payload(index, receipt_ms, payload)
        })
    }

    pub fn to_record(&self) -> String {
        let mut record = format!("{} {} {}", self.index, self.receipt_ms, self.payload());
        if let Some(duration) = self.request_duration_ms {
            record.push_str(&format!("{} {}ms", REQUEST_DURATION_MARKER, duration));
        }
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_with_onboard_duration() {
        let payload: SamplePayload = "7 101 2.5 102 fail 41.5".parse().unwrap();
        assert_eq!(payload.tag_id, 7);
        assert_eq!(payload.ranges, vec![(101, Range::Measured(2.5)), (102, Range::Failed)]);
        assert_eq!(payload.onboard_duration_ms, Some(41.5));
        assert_eq!(payload.to_string(), "7 101 2.5 102 fail 41.5");
    }

    #[test]
    fn test_payload_without_duration() {
        let payload: SamplePayload = "3 103 1.25 104 0.75".parse().unwrap();
        assert_eq!(payload.ranges.len(), 2);
        assert_eq!(payload.onboard_duration_ms, None);
    }

    #[test]
    fn test_payload_errors() {
        assert_eq!("".parse::<SamplePayload>(), Err(SampleParseError::Empty));
        assert_eq!("7".parse::<SamplePayload>(), Err(SampleParseError::MissingRanges));
        assert_eq!(
            "1 101 2.5 102".parse::<SamplePayload>(),
            Err(SampleParseError::RangeCount { tokens: 3 })
        );
        assert_eq!(
            "1 101 2.5".parse::<SamplePayload>(),
            Err(SampleParseError::RangeCount { tokens: 2 })
        );
        assert_eq!(
            "1 101 2.5 102 1.0 40 9".parse::<SamplePayload>(),
            Err(SampleParseError::RangeCount { tokens: 6 })
        );
        assert!(matches!(
            "7 101 -2.0 102 1.0".parse::<SamplePayload>(),
            Err(SampleParseError::InvalidField { field: "distance", .. })
        ));
        assert!(matches!(
            "x 101 2.0 102 1.0".parse::<SamplePayload>(),
            Err(SampleParseError::InvalidField { field: "tag id", .. })
        ));
    }

    #[test]
    fn test_relay_record() {
        let line = "12 1700000000123 7 101 2.5 102 3.1 40, overall request duration: 57ms";
        let sample = DistanceSample::parse_record(line).unwrap();
        assert_eq!(sample.index, 12);
        assert_eq!(sample.receipt_ms, 1_700_000_000_123);
        assert_eq!(sample.tag_id, 7);
        assert_eq!(sample.range_to(102), Some(Range::Measured(3.1)));
        assert_eq!(sample.onboard_duration_ms, Some(40.0));
        assert_eq!(sample.request_duration_ms, Some(57));
        assert_eq!(sample.to_record(), line);
    }

    #[test]
    fn test_bare_record() {
        let sample = DistanceSample::parse_record("0 1000 1 101 1.0 102 2.0").unwrap();
        assert_eq!(sample.request_duration_ms, None);
        assert_eq!(sample.range_to(103), None);
    }

    #[test]
    fn test_truncated_record_is_rejected() {
        assert_eq!(
            DistanceSample::parse_record("5 1000 1 101 2.5 102, overall request duration: 3ms"),
            Err(SampleParseError::RangeCount { tokens: 3 })
        );
    }
}
