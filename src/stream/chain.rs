//! Ordered segment history for one channel
//!
//! Oldest segment at the front, the head (the one being written) at the
//! back. Segment ids are assigned sequentially, so the chain doubles as an
//! index: the entry for id `n` lives at position `n - front_id`.

use std::collections::VecDeque;
use std::sync::Arc;

use super::segment::{GrowthPolicy, Segment};

#[derive(Debug)]
struct ChainEntry {
    segment: Arc<Segment>,
    listeners: u32,
}

/// Doubly-ended history of segments with per-segment listener counts
#[derive(Debug)]
pub struct StreamChain {
    entries: VecDeque<ChainEntry>,
    next_id: u64,
    policy: GrowthPolicy,
}

impl StreamChain {
    /// Create a chain holding a single empty head segment
    pub fn new(policy: GrowthPolicy) -> Self {
        let mut chain = Self {
            entries: VecDeque::new(),
            next_id: 0,
            policy,
        };
        chain.push_head();
        chain
    }

    fn push_head(&mut self) -> Arc<Segment> {
        let segment = Arc::new(Segment::new(self.next_id, self.policy));
        self.next_id += 1;
        self.entries.push_back(ChainEntry {
            segment: Arc::clone(&segment),
            listeners: 0,
        });
        segment
    }

    fn position(&self, id: u64) -> Option<usize> {
        let front = self.entries.front()?.segment.id();
        let idx = id.checked_sub(front)? as usize;
        (idx < self.entries.len()).then_some(idx)
    }

    /// Newest segment, the one the fetcher appends to
    pub fn head(&self) -> Option<&Arc<Segment>> {
        self.entries.back().map(|e| &e.segment)
    }

    /// Oldest retained segment
    pub fn oldest(&self) -> Option<&Arc<Segment>> {
        self.entries.front().map(|e| &e.segment)
    }

    /// Look up a segment by id
    pub fn get(&self, id: u64) -> Option<&Arc<Segment>> {
        self.position(id).map(|idx| &self.entries[idx].segment)
    }

    /// Segment following `id` toward the head, if one exists yet
    pub fn next_after(&self, id: u64) -> Option<&Arc<Segment>> {
        self.position(id)
            .and_then(|idx| self.entries.get(idx + 1))
            .map(|e| &e.segment)
    }

    /// Number of retained segments
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the chain has been drained
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Listener count of one segment (0 for unknown ids)
    pub fn listeners(&self, id: u64) -> u32 {
        self.position(id)
            .map(|idx| self.entries[idx].listeners)
            .unwrap_or(0)
    }

    /// Sum of all segment listener counts
    pub fn listener_total(&self) -> u32 {
        self.entries.iter().map(|e| e.listeners).sum()
    }

    /// Bytes held across all retained segments
    pub fn buffered_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.segment.len()).sum()
    }

    /// Take a listener reference on a segment
    ///
    /// Returns false if the segment is no longer in the chain.
    pub fn acquire(&mut self, id: u64) -> bool {
        match self.position(id) {
            Some(idx) => {
                self.entries[idx].listeners += 1;
                true
            }
            None => false,
        }
    }

    /// Drop a listener reference and reclaim anything no longer needed
    ///
    /// Returns the segment's remaining count. Releasing an id that is not
    /// in the chain (already drained) is a no-op.
    pub fn release(&mut self, id: u64) -> u32 {
        let remaining = match self.position(id) {
            Some(idx) => {
                let entry = &mut self.entries[idx];
                debug_assert!(entry.listeners > 0, "segment {} released twice", id);
                entry.listeners = entry.listeners.saturating_sub(1);
                entry.listeners
            }
            None => return 0,
        };

        if remaining == 0 {
            self.trim();
        }
        remaining
    }

    /// Finish the head and link a fresh one in front of it
    ///
    /// The previous head stays in the chain while listeners still read it.
    pub fn start_new_segment(&mut self) -> Arc<Segment> {
        if let Some(head) = self.head() {
            head.finish();
        }
        let segment = self.push_head();
        self.trim();
        segment
    }

    /// Reclaim finished, unreferenced segments from the old end
    ///
    /// The head is never trimmed: the fetcher still needs it. A segment
    /// in the middle is kept while an older one is referenced, since that
    /// listener will pass through it.
    pub fn trim(&mut self) -> usize {
        let mut removed = 0;
        while self.entries.len() > 1 {
            let front = &self.entries[0];
            if front.listeners > 0 || !front.segment.is_finished() {
                break;
            }
            tracing::debug!(
                segment = front.segment.id(),
                len = front.segment.len(),
                "Segment reclaimed"
            );
            self.entries.pop_front();
            removed += 1;
        }
        removed
    }

    /// Drop every segment regardless of listener counts
    ///
    /// Used on channel teardown. Segments are finished first so any reader
    /// still holding one sees a terminal state.
    pub fn drain(&mut self) -> usize {
        let count = self.entries.len();
        for entry in self.entries.drain(..) {
            entry.segment.finish();
        }
        count
    }
}
