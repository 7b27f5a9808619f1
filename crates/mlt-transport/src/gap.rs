//! # Gap Tracker
//!
//! Records which sequence numbers of a flow have arrived and enumerates the
//! ranges still missing. Two interchangeable representations:
//!
//! - [`BitmapTracker`] — dense bit array plus a running count of missing
//!   runs; O(1) take, serialization walks words with `trailing_zeros`.
//! - [`IntervalTracker`] — ordered map of missing `[first, last)` intervals;
//!   O(log n) take, natural for trackers that start empty and grow.
//!
//! Both serialize the **missing** ranges as ascending, disjoint [`Block`]
//! records in exactly `byte_size()` bytes. An empty serialization means
//! everything has arrived and no retransmit is needed.

use bytes::{BufMut, Bytes, BytesMut};

use crate::wire::Block;

// ─── Capability ─────────────────────────────────────────────────────────────

/// Common capability of the gap-tracker variants.
pub trait Tracker {
    /// Number of sequence numbers tracked, i.e. valid seqs are `[0, size)`.
    fn size(&self) -> u32;

    /// Grow the tracked range. Monotone: a target at or below the current
    /// size is a no-op. All prior `take` state is preserved.
    fn resize(&mut self, size: u32);

    /// Whether `seq` has been taken.
    fn check(&self, seq: u32) -> bool;

    /// Record `seq` as received. Taking an already-taken seq is a no-op.
    fn take(&mut self, seq: u32);

    /// Count of sequence numbers not yet taken.
    fn free_len(&self) -> u32;

    /// Exact serialized size of the missing ranges in bytes.
    fn byte_size(&self) -> usize;

    /// Write the missing ranges as ascending disjoint blocks. Writes exactly
    /// [`Tracker::byte_size`] bytes.
    fn serialize_missing(&self, buf: &mut impl BufMut)
    where
        Self: Sized;
}

// ─── Bitmap Variant ─────────────────────────────────────────────────────────

const WORD_BITS: u32 = u64::BITS;

/// Dense bitmap of taken sequence numbers.
///
/// `segments` counts the maximal runs of *missing* seqs, maintained
/// incrementally from the neighbors of each newly taken bit, so
/// `byte_size()` needs no scan.
pub struct BitmapTracker {
    size: u32,
    used: u32,
    segments: u32,
    words: Vec<u64>,
}

impl BitmapTracker {
    pub fn new(size: u32) -> Self {
        BitmapTracker {
            size,
            used: 0,
            segments: u32::from(size > 0),
            words: vec![0; size.div_ceil(WORD_BITS) as usize],
        }
    }

    #[inline]
    fn test(&self, seq: u32) -> bool {
        (self.words[(seq / WORD_BITS) as usize] >> (seq % WORD_BITS)) & 1 == 1
    }

    #[inline]
    fn set(&mut self, seq: u32) {
        self.words[(seq / WORD_BITS) as usize] |= 1u64 << (seq % WORD_BITS);
    }
}

impl Tracker for BitmapTracker {
    fn size(&self) -> u32 {
        self.size
    }

    fn resize(&mut self, size: u32) {
        if size <= self.size {
            return;
        }
        self.words.resize(size.div_ceil(WORD_BITS) as usize, 0);
        if self.size == 0 || self.test(self.size - 1) {
            // The new region opens a missing run; otherwise the tail run
            // simply extends.
            self.segments += 1;
        }
        self.size = size;
    }

    fn check(&self, seq: u32) -> bool {
        assert!(seq < self.size, "seq {} out of range {}", seq, self.size);
        self.test(seq)
    }

    fn take(&mut self, seq: u32) {
        assert!(seq < self.size, "seq {} out of range {}", seq, self.size);
        if self.test(seq) {
            return;
        }
        self.used += 1;
        self.segments += 1;
        if seq == 0 || self.test(seq - 1) {
            self.segments -= 1;
        }
        if seq + 1 == self.size || self.test(seq + 1) {
            self.segments -= 1;
        }
        self.set(seq);
    }

    fn free_len(&self) -> u32 {
        self.size - self.used
    }

    fn byte_size(&self) -> usize {
        self.segments as usize * Block::SIZE
    }

    fn serialize_missing(&self, buf: &mut impl BufMut) {
        let mut first = 0u32;
        for (idx, &word) in self.words.iter().enumerate() {
            let base = idx as u32 * WORD_BITS;
            let mut seg = word;
            while seg != 0 {
                // Run of missing seqs ends at the lowest set bit.
                let tz = seg.trailing_zeros();
                let last = base + tz;
                if first < last {
                    Block::new(first, last).encode(buf);
                }
                // Skip the run of taken seqs to the next clear bit.
                let next_clear = (tz + (!seg >> tz).trailing_zeros()).min(WORD_BITS);
                first = base + next_clear;
                seg = if next_clear == WORD_BITS {
                    0
                } else {
                    seg & (!0u64 << next_clear)
                };
            }
        }
        if first < self.size {
            Block::new(first, self.size).encode(buf);
        }
    }
}

// ─── Interval Variant ───────────────────────────────────────────────────────

/// Ordered set of missing intervals, keyed by interval start.
///
/// Initialized to `{[0, size)}`; each `take` splits, trims, or erases the
/// covering interval.
pub struct IntervalTracker {
    size: u32,
    used: u32,
    tree: std::collections::BTreeMap<u32, u32>,
}

impl IntervalTracker {
    pub fn new(size: u32) -> Self {
        let mut tree = std::collections::BTreeMap::new();
        if size > 0 {
            tree.insert(0, size);
        }
        IntervalTracker {
            size,
            used: 0,
            tree,
        }
    }

    /// The missing interval covering `seq`, if any.
    fn covering(&self, seq: u32) -> Option<(u32, u32)> {
        self.tree
            .range(..=seq)
            .next_back()
            .map(|(&first, &last)| (first, last))
            .filter(|&(_, last)| seq < last)
    }
}

impl Tracker for IntervalTracker {
    fn size(&self) -> u32 {
        self.size
    }

    fn resize(&mut self, size: u32) {
        if size <= self.size {
            return;
        }
        let tail_abuts = self
            .tree
            .iter()
            .next_back()
            .is_some_and(|(_, &last)| last == self.size);
        if tail_abuts {
            // Tail interval abuts the new region: extend it.
            let (_, last) = self.tree.iter_mut().next_back().unwrap();
            *last = size;
        } else {
            self.tree.insert(self.size, size);
        }
        self.size = size;
    }

    fn check(&self, seq: u32) -> bool {
        assert!(seq < self.size, "seq {} out of range {}", seq, self.size);
        self.covering(seq).is_none()
    }

    fn take(&mut self, seq: u32) {
        assert!(seq < self.size, "seq {} out of range {}", seq, self.size);
        let Some((first, last)) = self.covering(seq) else {
            return;
        };
        self.used += 1;
        if first == seq {
            self.tree.remove(&first);
            if seq + 1 < last {
                self.tree.insert(seq + 1, last);
            }
        } else if last == seq + 1 {
            self.tree.insert(first, seq);
        } else {
            self.tree.insert(first, seq);
            self.tree.insert(seq + 1, last);
        }
    }

    fn free_len(&self) -> u32 {
        self.size - self.used
    }

    fn byte_size(&self) -> usize {
        self.tree.len() * Block::SIZE
    }

    fn serialize_missing(&self, buf: &mut impl BufMut) {
        for (&first, &last) in &self.tree {
            Block::new(first, last).encode(buf);
        }
    }
}

// ─── Per-Flow Selection ─────────────────────────────────────────────────────

/// A gap tracker with the variant chosen per flow.
pub enum GapTracker {
    Bitmap(BitmapTracker),
    Interval(IntervalTracker),
}

impl GapTracker {
    /// Interval-tree tracker, the default for receive flows that start at
    /// size zero and grow as packets arrive.
    pub fn interval(size: u32) -> Self {
        GapTracker::Interval(IntervalTracker::new(size))
    }

    /// Bitmap tracker for flows whose extent is known up front.
    pub fn bitmap(size: u32) -> Self {
        GapTracker::Bitmap(BitmapTracker::new(size))
    }

    /// Serialize the missing ranges into a fresh buffer and decode them as
    /// blocks, ready for a retransmit request.
    pub fn missing_blocks(&self) -> Vec<Block> {
        let mut buf = BytesMut::with_capacity(self.byte_size());
        match self {
            GapTracker::Bitmap(t) => t.serialize_missing(&mut buf),
            GapTracker::Interval(t) => t.serialize_missing(&mut buf),
        }
        let mut bytes: Bytes = buf.freeze();
        let mut blocks = Vec::with_capacity(bytes.len() / Block::SIZE);
        while let Some(block) = Block::decode(&mut bytes) {
            blocks.push(block);
        }
        blocks
    }
}

impl Default for GapTracker {
    fn default() -> Self {
        GapTracker::interval(0)
    }
}

impl Tracker for GapTracker {
    fn size(&self) -> u32 {
        match self {
            GapTracker::Bitmap(t) => t.size(),
            GapTracker::Interval(t) => t.size(),
        }
    }

    fn resize(&mut self, size: u32) {
        match self {
            GapTracker::Bitmap(t) => t.resize(size),
            GapTracker::Interval(t) => t.resize(size),
        }
    }

    fn check(&self, seq: u32) -> bool {
        match self {
            GapTracker::Bitmap(t) => t.check(seq),
            GapTracker::Interval(t) => t.check(seq),
        }
    }

    fn take(&mut self, seq: u32) {
        match self {
            GapTracker::Bitmap(t) => t.take(seq),
            GapTracker::Interval(t) => t.take(seq),
        }
    }

    fn free_len(&self) -> u32 {
        match self {
            GapTracker::Bitmap(t) => t.free_len(),
            GapTracker::Interval(t) => t.free_len(),
        }
    }

    fn byte_size(&self) -> usize {
        match self {
            GapTracker::Bitmap(t) => t.byte_size(),
            GapTracker::Interval(t) => t.byte_size(),
        }
    }

    fn serialize_missing(&self, buf: &mut impl BufMut) {
        match self {
            GapTracker::Bitmap(t) => t.serialize_missing(buf),
            GapTracker::Interval(t) => t.serialize_missing(buf),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn missing_of(tracker: &impl Tracker) -> Vec<Block> {
        let mut buf = BytesMut::new();
        tracker.serialize_missing(&mut buf);
        assert_eq!(buf.len(), tracker.byte_size(), "byte_size contract");
        let mut bytes = buf.freeze();
        let mut blocks = Vec::new();
        while let Some(block) = Block::decode(&mut bytes) {
            blocks.push(block);
        }
        blocks
    }

    fn assert_missing(tracker: &impl Tracker, expected: &[(u32, u32)]) {
        let blocks = missing_of(tracker);
        let got: Vec<(u32, u32)> = blocks.iter().map(|b| (b.first, b.last)).collect();
        assert_eq!(got, expected);
    }

    // ─── Shared Behaviors ───────────────────────────────────────────────

    fn take_and_check(mut tracker: impl Tracker) {
        assert!(!tracker.check(3));
        tracker.take(3);
        assert!(tracker.check(3));
        for seq in 0..10 {
            assert_eq!(tracker.check(seq), seq == 3);
        }
        assert_eq!(tracker.free_len(), 9);
        // Taking again is a no-op.
        tracker.take(3);
        assert_eq!(tracker.free_len(), 9);
    }

    #[test]
    fn bitmap_take_and_check() {
        take_and_check(BitmapTracker::new(10));
    }

    #[test]
    fn interval_take_and_check() {
        take_and_check(IntervalTracker::new(10));
    }

    fn serialize_interior_takes(mut tracker: impl Tracker) {
        tracker.take(3);
        tracker.take(7);
        assert_missing(&tracker, &[(0, 3), (4, 7), (8, 10)]);
    }

    #[test]
    fn bitmap_serialize_interior_takes() {
        serialize_interior_takes(BitmapTracker::new(10));
    }

    #[test]
    fn interval_serialize_interior_takes() {
        serialize_interior_takes(IntervalTracker::new(10));
    }

    fn serialize_all_taken(mut tracker: impl Tracker) {
        for seq in 0..10 {
            tracker.take(seq);
        }
        assert_eq!(tracker.byte_size(), 0);
        assert_missing(&tracker, &[]);
        assert_eq!(tracker.free_len(), 0);
    }

    #[test]
    fn bitmap_serialize_all_taken() {
        serialize_all_taken(BitmapTracker::new(10));
    }

    #[test]
    fn interval_serialize_all_taken() {
        serialize_all_taken(IntervalTracker::new(10));
    }

    fn boundary_take_last(mut tracker: impl Tracker) {
        tracker.take(9);
        assert_missing(&tracker, &[(0, 9)]);
        tracker.take(0);
        assert_missing(&tracker, &[(1, 9)]);
    }

    #[test]
    fn bitmap_boundary_take_last() {
        boundary_take_last(BitmapTracker::new(10));
    }

    #[test]
    fn interval_boundary_take_last() {
        boundary_take_last(IntervalTracker::new(10));
    }

    fn size_zero_serializes_empty(tracker: impl Tracker) {
        assert_eq!(tracker.size(), 0);
        assert_eq!(tracker.byte_size(), 0);
        assert_missing(&tracker, &[]);
    }

    #[test]
    fn bitmap_size_zero() {
        size_zero_serializes_empty(BitmapTracker::new(0));
    }

    #[test]
    fn interval_size_zero() {
        size_zero_serializes_empty(IntervalTracker::new(0));
    }

    fn resize_same_size_is_noop(mut tracker: impl Tracker) {
        tracker.take(2);
        let before = missing_of(&tracker).len();
        tracker.resize(8);
        assert_eq!(tracker.size(), 8);
        assert_eq!(missing_of(&tracker).len(), before);
        tracker.resize(3); // shrinking is also a no-op
        assert_eq!(tracker.size(), 8);
    }

    #[test]
    fn bitmap_resize_noop() {
        resize_same_size_is_noop(BitmapTracker::new(8));
    }

    #[test]
    fn interval_resize_noop() {
        resize_same_size_is_noop(IntervalTracker::new(8));
    }

    fn resize_preserves_takes(mut tracker: impl Tracker) {
        tracker.take(1);
        tracker.take(3);
        tracker.resize(16);
        assert!(tracker.check(1));
        assert!(tracker.check(3));
        assert!(!tracker.check(2));
        assert!(!tracker.check(15));
        assert_missing(&tracker, &[(0, 1), (2, 3), (4, 16)]);
    }

    #[test]
    fn bitmap_resize_preserves_takes() {
        resize_preserves_takes(BitmapTracker::new(8));
    }

    #[test]
    fn interval_resize_preserves_takes() {
        resize_preserves_takes(IntervalTracker::new(8));
    }

    fn resize_extends_abutting_tail(mut tracker: impl Tracker) {
        // Tail interval [2, 4) abuts the old end: grows into [2, 12).
        tracker.take(0);
        tracker.take(1);
        tracker.resize(12);
        assert_missing(&tracker, &[(2, 12)]);
    }

    #[test]
    fn bitmap_resize_extends_tail() {
        resize_extends_abutting_tail(BitmapTracker::new(4));
    }

    #[test]
    fn interval_resize_extends_tail() {
        resize_extends_abutting_tail(IntervalTracker::new(4));
    }

    fn resize_appends_tail_after_full(mut tracker: impl Tracker) {
        for seq in 0..4 {
            tracker.take(seq);
        }
        tracker.resize(12);
        assert_missing(&tracker, &[(4, 12)]);
    }

    #[test]
    fn bitmap_resize_appends_tail() {
        resize_appends_tail_after_full(BitmapTracker::new(4));
    }

    #[test]
    fn interval_resize_appends_tail() {
        resize_appends_tail_after_full(IntervalTracker::new(4));
    }

    fn resize_from_zero(mut tracker: impl Tracker) {
        tracker.resize(6);
        assert_missing(&tracker, &[(0, 6)]);
        tracker.take(5);
        assert_missing(&tracker, &[(0, 5)]);
    }

    #[test]
    fn bitmap_resize_from_zero() {
        resize_from_zero(BitmapTracker::new(0));
    }

    #[test]
    fn interval_resize_from_zero() {
        resize_from_zero(IntervalTracker::new(0));
    }

    // ─── Word-Boundary Cases (bitmap) ───────────────────────────────────

    #[test]
    fn bitmap_run_across_word_boundary() {
        let mut tracker = BitmapTracker::new(200);
        // Take a run straddling the first word boundary.
        for seq in 60..70 {
            tracker.take(seq);
        }
        assert_missing(&tracker, &[(0, 60), (70, 200)]);
    }

    #[test]
    fn bitmap_taken_to_word_end() {
        let mut tracker = BitmapTracker::new(128);
        for seq in 32..64 {
            tracker.take(seq);
        }
        assert_missing(&tracker, &[(0, 32), (64, 128)]);
    }

    #[test]
    fn bitmap_alternating_bits() {
        let mut tracker = BitmapTracker::new(8);
        for seq in [0u32, 2, 4, 6] {
            tracker.take(seq);
        }
        assert_missing(&tracker, &[(1, 2), (3, 4), (5, 6), (7, 8)]);
    }

    // ─── GapTracker Enum ────────────────────────────────────────────────

    #[test]
    fn default_is_growable_interval() {
        let mut tracker = GapTracker::default();
        assert_eq!(tracker.size(), 0);
        tracker.resize(5);
        tracker.take(2);
        assert_eq!(
            tracker.missing_blocks(),
            vec![Block::new(0, 2), Block::new(3, 5)]
        );
    }

    #[test]
    fn missing_blocks_matches_serialize() {
        let mut tracker = GapTracker::bitmap(10);
        tracker.take(3);
        tracker.take(7);
        assert_eq!(
            tracker.missing_blocks(),
            vec![Block::new(0, 3), Block::new(4, 7), Block::new(8, 10)]
        );
    }

    // ─── proptest: Variant Agreement and Round-Trip Law ─────────────────

    proptest! {
        /// Both variants agree bit-for-bit on check answers and on the
        /// serialized missing ranges, for any take sequence with interleaved
        /// resizes.
        #[test]
        fn proptest_variants_agree(
            initial in 1u32..300,
            grow in 0u32..300,
            seqs in proptest::collection::vec(any::<u32>(), 0..200),
        ) {
            let mut bitmap = BitmapTracker::new(initial);
            let mut interval = IntervalTracker::new(initial);

            for (i, &raw) in seqs.iter().enumerate() {
                if i == seqs.len() / 2 {
                    bitmap.resize(initial + grow);
                    interval.resize(initial + grow);
                }
                let seq = raw % bitmap.size();
                bitmap.take(seq);
                interval.take(seq);
            }

            prop_assert_eq!(bitmap.free_len(), interval.free_len());
            prop_assert_eq!(bitmap.byte_size(), interval.byte_size());
            prop_assert_eq!(missing_of(&bitmap), missing_of(&interval));
            for seq in 0..bitmap.size() {
                prop_assert_eq!(bitmap.check(seq), interval.check(seq));
            }
        }

        /// Serialize → deserialize reproduces the same check answers for
        /// every index: indices inside a missing block are exactly the
        /// not-taken ones.
        #[test]
        fn proptest_roundtrip_law(
            size in 1u32..400,
            seqs in proptest::collection::vec(any::<u32>(), 0..300),
        ) {
            let mut tracker = BitmapTracker::new(size);
            for &raw in &seqs {
                tracker.take(raw % size);
            }

            let blocks = missing_of(&tracker);
            // Disjoint, ascending, non-empty ranges.
            for pair in blocks.windows(2) {
                prop_assert!(pair[0].last <= pair[1].first);
            }
            for block in &blocks {
                prop_assert!(block.first < block.last);
            }

            let mut missing = vec![false; size as usize];
            for block in &blocks {
                for seq in block.first..block.last {
                    missing[seq as usize] = true;
                }
            }
            for seq in 0..size {
                prop_assert_eq!(tracker.check(seq), !missing[seq as usize]);
            }
        }
    }
}
