// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! An ordered set of disjoint integer ranges.
//!
//! Instead of storing one entry per value, only `(low, count)` pairs are
//! stored. Ranges that touch or overlap are merged on insert, so the
//! stored subranges are always strictly increasing and non-adjacent.
//!
//! The structure backs both the received-packet-number tracker used for
//! ACK generation and the reassembly offsets of receive buffers. Both
//! uses bound memory with a byte budget on subrange storage; when the
//! budget is exhausted, inserts at the high end evict the lowest
//! subrange so the tracker always follows the newest values.

use core::{fmt, mem::size_of};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RangeSetError {
    /// The subrange storage budget was exceeded
    LimitExceeded,
    /// `count` was zero or the range wrapped the integer space
    InvalidRange,
}

impl fmt::Display for RangeSetError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::LimitExceeded => write!(f, "subrange storage budget exceeded"),
            Self::InvalidRange => write!(f, "invalid range"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for RangeSetError {}

/// A maximal run of consecutive values, `[low, low + count)`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Subrange {
    pub low: u64,
    pub count: u64,
}

impl Subrange {
    #[inline]
    pub fn high(&self) -> u64 {
        debug_assert!(self.count >= 1);
        self.low + self.count - 1
    }

    #[inline]
    fn end(&self) -> u64 {
        self.low + self.count
    }
}

/// Outcome of a range search: either some subrange fully contains the
/// searched interval, or the interval is absent and would be inserted at
/// the returned position.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SearchResult {
    Match(usize),
    Insert(usize),
}

impl SearchResult {
    #[inline]
    pub fn is_match(self) -> bool {
        matches!(self, Self::Match(_))
    }
}

#[derive(Clone, Default, PartialEq, Eq)]
pub struct RangeSet {
    subranges: Vec<Subrange>,
    /// Storage budget in bytes of subrange storage; `None` is unbounded
    max_alloc_bytes: Option<usize>,
}

impl fmt::Debug for RangeSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list()
            .entries(self.subranges.iter().map(|s| s.low..s.end()))
            .finish()
    }
}

impl RangeSet {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a set whose subrange storage may not exceed `max_alloc_bytes`
    #[inline]
    pub fn with_max_alloc(max_alloc_bytes: usize) -> Self {
        Self {
            subranges: Vec::new(),
            max_alloc_bytes: Some(max_alloc_bytes),
        }
    }

    #[inline]
    fn entry_limit(&self) -> usize {
        match self.max_alloc_bytes {
            Some(bytes) => (bytes / size_of::<Subrange>()).max(1),
            None => usize::MAX,
        }
    }

    /// Returns the number of maximal disjoint subranges
    #[inline]
    pub fn len(&self) -> usize {
        self.subranges.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.subranges.is_empty()
    }

    #[inline]
    pub fn get(&self, index: usize) -> Option<Subrange> {
        self.subranges.get(index).copied()
    }

    /// Returns the lowest contained value
    #[inline]
    pub fn min_value(&self) -> Option<u64> {
        self.subranges.first().map(|s| s.low)
    }

    /// Returns the highest contained value
    #[inline]
    pub fn max_value(&self) -> Option<u64> {
        self.subranges.last().map(|s| s.high())
    }

    #[inline]
    pub fn clear(&mut self) {
        self.subranges.clear();
    }

    #[inline]
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = Subrange> + ExactSizeIterator + '_ {
        self.subranges.iter().copied()
    }

    /// The subranges in ascending order
    #[inline]
    pub fn as_slice(&self) -> &[Subrange] {
        &self.subranges
    }

    #[inline]
    pub fn contains(&self, value: u64) -> bool {
        self.search(value, value).is_match()
    }

    /// Searches for a subrange fully containing `[low, high]`.
    ///
    /// Returns `Match` with the subrange index, or `Insert` with the
    /// position a new subrange for the interval would occupy.
    #[inline]
    pub fn search(&self, low: u64, high: u64) -> SearchResult {
        debug_assert!(low <= high);

        let mut lo = 0usize;
        let mut hi = self.subranges.len();

        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let subrange = &self.subranges[mid];

            if high < subrange.low {
                hi = mid;
            } else if low > subrange.high() {
                lo = mid + 1;
            } else if low >= subrange.low && high <= subrange.high() {
                return SearchResult::Match(mid);
            } else {
                // partial overlap only; a full containment is impossible
                return SearchResult::Insert(mid);
            }
        }

        SearchResult::Insert(lo)
    }

    /// Inserts `[low, low + count)`, merging with any subrange it abuts
    /// or overlaps.
    ///
    /// Returns `true` iff a previously-absent value was added. If the
    /// insert needs a new subrange beyond the storage budget, the lowest
    /// subrange is evicted when the new values are above it; otherwise
    /// the set is left unmodified and `false` is returned.
    pub fn add(&mut self, low: u64, count: u64) -> bool {
        if count == 0 || low.checked_add(count).is_none() {
            return false;
        }
        let high = low + count - 1;

        // the window of subranges that merge with [low, high]: anything
        // overlapping or abutting it on either side
        let merge_low = low.saturating_sub(1);
        let merge_high = high.saturating_add(1);

        let mut window = None;
        for (i, s) in self.subranges.iter().enumerate() {
            if s.high() < merge_low {
                continue;
            }
            if s.low > merge_high {
                break;
            }
            window = Some(match window {
                None => (i, i),
                Some((first, _)) => (first, i),
            });
        }

        match window {
            None => {
                // no neighbors; a fresh subrange is required
                let index = self.search_insert_index(low);
                if !self.reserve_entry(index == 0) {
                    return false;
                }
                let index = self.search_insert_index(low);
                self.subranges.insert(index, Subrange { low, count });
                true
            }
            Some((first, last)) => {
                let merged_low = self.subranges[first].low.min(low);
                let merged_high = self.subranges[last].high().max(high);

                // every gap between merged neighbors lies inside the
                // inserted interval, so bridging always adds values
                let added = last > first
                    || low < self.subranges[first].low
                    || high > self.subranges[last].high();

                self.subranges[first] = Subrange {
                    low: merged_low,
                    count: merged_high - merged_low + 1,
                };
                self.subranges.drain(first + 1..=last);
                added
            }
        }
    }

    /// Inserts a single value
    #[inline]
    pub fn add_value(&mut self, value: u64) -> bool {
        self.add(value, 1)
    }

    /// Removes `[low, low + count)`, trimming, splitting or dropping the
    /// subranges it intersects.
    pub fn remove(&mut self, low: u64, count: u64) -> Result<(), RangeSetError> {
        if count == 0 || low.checked_add(count).is_none() {
            return Err(RangeSetError::InvalidRange);
        }
        let high = low + count - 1;

        let mut i = 0;
        while i < self.subranges.len() {
            let s = self.subranges[i];
            if s.high() < low {
                i += 1;
                continue;
            }
            if s.low > high {
                break;
            }

            let keep_left = s.low < low;
            let keep_right = s.high() > high;

            match (keep_left, keep_right) {
                (false, false) => {
                    self.subranges.remove(i);
                }
                (true, false) => {
                    self.subranges[i].count = low - s.low;
                    i += 1;
                }
                (false, true) => {
                    self.subranges[i] = Subrange {
                        low: high + 1,
                        count: s.high() - high,
                    };
                    break;
                }
                (true, true) => {
                    // split into two; the right half is a new subrange
                    if self.subranges.len() >= self.entry_limit() {
                        return Err(RangeSetError::LimitExceeded);
                    }
                    self.subranges[i].count = low - s.low;
                    self.subranges.insert(
                        i + 1,
                        Subrange {
                            low: high + 1,
                            count: s.high() - high,
                        },
                    );
                    break;
                }
            }
        }

        Ok(())
    }

    #[inline]
    fn search_insert_index(&self, low: u64) -> usize {
        self.subranges
            .partition_point(|s| s.high() < low)
    }

    /// Makes room for one more subrange, evicting the lowest when the
    /// budget is exhausted and the insert is not itself at the low end.
    fn reserve_entry(&mut self, at_low_end: bool) -> bool {
        if self.subranges.len() < self.entry_limit() {
            return true;
        }
        if at_low_end {
            return false;
        }
        self.subranges.remove(0);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_of(ranges: &[(u64, u64)]) -> RangeSet {
        let mut set = RangeSet::new();
        for &(low, count) in ranges {
            assert!(set.add(low, count));
        }
        set
    }

    #[test]
    fn merge_on_insert() {
        let mut set = RangeSet::new();
        assert!(set.add_value(0));
        assert!(set.add_value(1));
        assert!(set.add_value(3));
        assert_eq!(set.len(), 2);

        // bridging value merges both neighbors
        assert!(set.add_value(2));
        assert_eq!(set.len(), 1);
        assert_eq!(set.get(0), Some(Subrange { low: 0, count: 4 }));

        // duplicate adds report no new values
        assert!(!set.add_value(2));
        assert!(!set.add(0, 4));
        assert!(set.add(0, 5));
    }

    #[test]
    fn ack_tracker_sequence() {
        // feed 10000,10001,10003,10002 and watch the subrange count
        let mut set = RangeSet::new();
        assert!(set.add_value(10_000));
        assert_eq!(set.len(), 1);
        assert!(set.add_value(10_001));
        assert_eq!(set.len(), 1);
        assert!(set.add_value(10_003));
        assert_eq!(set.len(), 2);
        assert!(set.add_value(10_002));
        assert_eq!(set.len(), 1);

        set.remove(10_000, 2).unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set.min_value(), Some(10_002));
        assert_eq!(set.max_value(), Some(10_003));

        set.remove(10_002, 2).unwrap();
        assert_eq!(set.len(), 0);
        assert!(set.is_empty());
    }

    #[test]
    fn remove_splits() {
        let mut set = set_of(&[(0, 10)]);
        set.remove(3, 4).unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.get(0), Some(Subrange { low: 0, count: 3 }));
        assert_eq!(set.get(1), Some(Subrange { low: 7, count: 3 }));

        // add/remove of an absent range leaves the set unchanged
        let before = set.clone();
        assert!(set.add(20, 5));
        set.remove(20, 5).unwrap();
        assert_eq!(set, before);
    }

    #[test]
    fn search_results() {
        let set = set_of(&[(10, 5), (20, 5), (30, 5)]);

        assert_eq!(set.search(12, 12), SearchResult::Match(0));
        assert_eq!(set.search(20, 24), SearchResult::Match(1));
        assert_eq!(set.search(34, 34), SearchResult::Match(2));

        assert_eq!(set.search(0, 5), SearchResult::Insert(0));
        assert_eq!(set.search(16, 17), SearchResult::Insert(1));
        assert_eq!(set.search(26, 27), SearchResult::Insert(2));
        assert_eq!(set.search(40, 41), SearchResult::Insert(3));

        // partial overlap is not a match
        assert!(!set.search(14, 16).is_match());
    }

    #[test]
    fn eviction_at_budget() {
        // room for exactly two subranges
        let mut set = RangeSet::with_max_alloc(2 * size_of::<Subrange>());
        assert!(set.add(0, 1));
        assert!(set.add(10, 1));

        // a new high subrange evicts the lowest
        assert!(set.add(20, 1));
        assert_eq!(set.len(), 2);
        assert_eq!(set.min_value(), Some(10));
        assert_eq!(set.max_value(), Some(20));

        // a new low subrange fails without mutating
        assert!(!set.add(0, 1));
        assert_eq!(set.len(), 2);
        assert_eq!(set.min_value(), Some(10));

        // merging inserts never need new storage
        assert!(set.add(11, 1));
        assert_eq!(set.len(), 2);

        // splitting past the budget is rejected
        let mut set = RangeSet::with_max_alloc(size_of::<Subrange>());
        assert!(set.add(0, 10));
        assert_eq!(set.remove(4, 2), Err(RangeSetError::LimitExceeded));
    }

    #[test]
    fn invariants_hold() {
        bolero::check!()
            .with_type::<Vec<(u16, u8, bool)>>()
            .for_each(|ops| {
                let mut set = RangeSet::new();
                let mut model = std::collections::BTreeSet::new();

                for &(low, count, insert) in ops {
                    let low = low as u64;
                    let count = (count as u64).max(1).min(64);
                    if insert {
                        let added = set.add(low, count);
                        let mut fresh = false;
                        for v in low..low + count {
                            fresh |= model.insert(v);
                        }
                        assert_eq!(added, fresh);
                    } else {
                        set.remove(low, count).unwrap();
                        for v in low..low + count {
                            model.remove(&v);
                        }
                    }

                    assert_eq!(set.min_value(), model.iter().next().copied());
                    assert_eq!(set.max_value(), model.iter().next_back().copied());

                    // len() equals the number of maximal runs in the model
                    let mut runs = 0usize;
                    let mut prev: Option<u64> = None;
                    for &v in model.iter() {
                        if prev != Some(v.wrapping_sub(1)) {
                            runs += 1;
                        }
                        prev = Some(v);
                    }
                    assert_eq!(set.len(), runs);
                }
            });
    }
}
