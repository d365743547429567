use std::{
    cmp::{Ordering, Reverse},
    collections::BinaryHeap,
    time::Duration,
};

use crate::SegmentId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    duration: Duration,
    sequence: u64,
    segment: SegmentId,
}

// Longer durations rank higher. Between equal durations the earlier-seen
// segment ranks higher, so later arrivals are the ones evicted.
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.duration
            .cmp(&other.duration)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Keeps the `capacity` longest segments it is offered.
#[derive(Debug)]
pub struct RetentionHeap {
    capacity: usize,
    next_sequence: u64,
    // Min-heap so the weakest entry is always at the top, ready for eviction.
    entries: BinaryHeap<Reverse<Entry>>,
}

impl RetentionHeap {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            next_sequence: 0,
            entries: BinaryHeap::with_capacity(capacity.min(4096)),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn offer(&mut self, segment: SegmentId, duration: Duration) {
        let entry = Entry {
            duration,
            sequence: self.next_sequence,
            segment,
        };
        self.next_sequence += 1;

        if self.capacity == 0 {
            return;
        }
        if self.entries.len() < self.capacity {
            self.entries.push(Reverse(entry));
            return;
        }
        if let Some(mut weakest) = self.entries.peek_mut() {
            if entry > weakest.0 {
                *weakest = Reverse(entry);
            }
        }
    }

    /// The retained segments, longest first.
    pub fn into_sorted_segments(self) -> Vec<SegmentId> {
        self.entries
            .into_sorted_vec()
            .into_iter()
            .map(|Reverse(entry)| entry.segment)
            .collect()
    }
}
