//! Nearest-timestamp lookup over sorted sequences

use crate::core::AlignError;
use crate::processing::sample::DistanceSample;
use crate::processing::store::VideoFrameRecord;

/// Anything carrying a wall-clock timestamp in milliseconds
pub trait Timestamped {
    fn timestamp_ms(&self) -> u64;
}

impl Timestamped for DistanceSample {
    fn timestamp_ms(&self) -> u64 {
        self.receipt_ms
    }
}

impl Timestamped for VideoFrameRecord {
    fn timestamp_ms(&self) -> u64 {
        self.timestamp_ms
    }
}

impl Timestamped for u64 {
    fn timestamp_ms(&self) -> u64 {
        *self
    }
}

/// Index of the element whose key is nearest to `query`.
///
/// `items` must be sorted by `key`. Every probed midpoint is compared
/// against the best so far, and the search always brackets the query, so
/// both neighbours of the query are probed and the result is the global
/// minimum. Ties keep the element probed first.
pub fn closest_index_by<T>(items: &[T], query: u64, key: impl Fn(&T) -> u64) -> Result<usize, AlignError> {
    if items.is_empty() {
        return Err(AlignError::Empty);
    }

    let mut best = 0usize;
    let mut best_delta = key(&items[0]).abs_diff(query);
    let (mut left, mut right) = (0usize, items.len());

    while left < right {
        let mid = left + (right - left) / 2;
        let value = key(&items[mid]);
        let delta = value.abs_diff(query);
        if delta < best_delta {
            best = mid;
            best_delta = delta;
        }
        if query > value {
            left = mid + 1;
        } else {
            right = mid;
        }
    }

    Ok(best)
}

pub fn closest_index<T: Timestamped>(items: &[T], query: u64) -> Result<usize, AlignError> {
    closest_index_by(items, query, Timestamped::timestamp_ms)
}

pub fn closest<T: Timestamped>(items: &[T], query: u64) -> Result<&T, AlignError> {
    closest_index(items, query).map(|index| &items[index])
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_empty_input() {
        let empty: [u64; 0] = [];
        assert_eq!(closest(&empty, 5), Err(AlignError::Empty));
    }

    #[test]
    fn test_exact_and_between() {
        let stamps = [10u64, 20, 30, 40];
        assert_eq!(*closest(&stamps, 30).unwrap(), 30);
        assert_eq!(*closest(&stamps, 24).unwrap(), 20);
        assert_eq!(*closest(&stamps, 26).unwrap(), 30);
        assert_eq!(*closest(&stamps, 0).unwrap(), 10);
        assert_eq!(*closest(&stamps, 1_000).unwrap(), 40);
    }

    proptest! {
        #[test]
        fn closest_matches_linear_scan(
            mut stamps in proptest::collection::vec(0u64..10_000, 1..200),
            query in 0u64..12_000,
        ) {
            stamps.sort_unstable();
            let found = *closest(&stamps, query).unwrap();
            let best = stamps.iter().map(|stamp| stamp.abs_diff(query)).min().unwrap();
            prop_assert_eq!(found.abs_diff(query), best);
        }
    }
}
