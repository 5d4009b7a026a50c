//! Append-only segment storage
//!
//! A segment holds one contiguous upstream transmission ("track"). Bytes are
//! written into fixed-capacity blocks; a block is never reallocated, so every
//! `Bytes` view handed to a reader stays valid while the writer keeps
//! appending.
//!
//! ```text
//!   block 0 (initial_capacity)         block 1 (increment)
//!  ┌──────────────────────────────┐   ┌──────────────────┐
//!  │ piece │ piece │ ...  │ piece │   │ piece │ spare... │
//!  └──────────────────────────────┘   └──────────────────┘
//!     ▲ readers clone `Bytes` views       ▲ writer appends into spare
//! ```

use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::{Bytes, BytesMut};
use tokio::sync::futures::Notified;
use tokio::sync::Notify;

/// Default first allocation, sized for an average track
pub const DEFAULT_INITIAL_CAPACITY: usize = 6_000_000;

/// Default size of each additional block
pub const DEFAULT_INCREMENT: usize = 1_500_000;

/// Default hard limit for a single segment (512 MiB)
///
/// A segment is one origin response, so for an origin that never ends its
/// response this bounds the whole stream: about 9 hours at 128 kbit/s.
/// Past it the channel fails. Use [`GrowthPolicy::unlimited`] for such
/// origins.
pub const DEFAULT_MAX_SIZE: u64 = 512 * 1024 * 1024;

/// How a segment allocates storage as it grows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrowthPolicy {
    /// Capacity of the first block
    pub initial_capacity: usize,
    /// Capacity of every further block (linear growth)
    pub increment: usize,
    /// Upper bound on a segment's length; exceeding it fails the append
    pub max_size: u64,
}

impl Default for GrowthPolicy {
    fn default() -> Self {
        Self {
            initial_capacity: DEFAULT_INITIAL_CAPACITY,
            increment: DEFAULT_INCREMENT,
            max_size: DEFAULT_MAX_SIZE,
        }
    }
}

impl GrowthPolicy {
    /// Set the first block capacity
    pub fn initial_capacity(mut self, bytes: usize) -> Self {
        self.initial_capacity = bytes.max(1);
        self
    }

    /// Set the growth increment
    pub fn increment(mut self, bytes: usize) -> Self {
        self.increment = bytes.max(1);
        self
    }

    /// Set the per-segment size limit
    pub fn max_size(mut self, bytes: u64) -> Self {
        self.max_size = bytes;
        self
    }

    /// Remove the per-segment size limit
    ///
    /// For continuous origins that never close a response. Memory then
    /// grows for as long as a listener holds the oldest segment.
    pub fn unlimited(self) -> Self {
        self.max_size(u64::MAX)
    }
}

/// Error type for segment writes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentError {
    /// The segment was finished and accepts no more bytes
    Finished { segment: u64 },
    /// Appending would grow the segment past its size limit
    CapacityExceeded { segment: u64, limit: u64 },
}

impl std::fmt::Display for SegmentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SegmentError::Finished { segment } => {
                write!(f, "Segment {} is finished", segment)
            }
            SegmentError::CapacityExceeded { segment, limit } => {
                write!(f, "Segment {} would exceed {} bytes", segment, limit)
            }
        }
    }
}

impl std::error::Error for SegmentError {}

/// Result of a single read attempt at some offset
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentRead {
    /// Bytes available starting at the requested offset
    Data(Bytes),
    /// Caught up; the writer may still append
    Pending,
    /// Caught up and the writer's transport failed
    Broken,
    /// Caught up and the segment will never grow again
    Finished,
}

#[derive(Debug)]
struct Store {
    /// Readable pieces, each tagged with its starting offset
    pieces: Vec<(u64, Bytes)>,
    /// Unused tail of the current block
    spare: BytesMut,
    len: u64,
    capacity: u64,
    finished: bool,
    broken: bool,
}

/// One buffered, possibly still growing, run of audio bytes
#[derive(Debug)]
pub struct Segment {
    id: u64,
    policy: GrowthPolicy,
    store: Mutex<Store>,
    changed: Notify,
}

impl Segment {
    /// Create an empty segment, pre-allocating the initial block
    pub fn new(id: u64, policy: GrowthPolicy) -> Self {
        let spare = BytesMut::with_capacity(policy.initial_capacity);
        let capacity = spare.capacity() as u64;

        Self {
            id,
            policy,
            store: Mutex::new(Store {
                pieces: Vec::new(),
                spare,
                len: 0,
                capacity,
                finished: false,
                broken: false,
            }),
            changed: Notify::new(),
        }
    }

    fn store(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Segment identifier, unique within its chain
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Number of bytes readable so far
    pub fn len(&self) -> u64 {
        self.store().len
    }

    /// Whether no bytes have been appended yet
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total bytes allocated across all blocks
    pub fn capacity(&self) -> u64 {
        self.store().capacity
    }

    /// Whether the writer is done with this segment
    pub fn is_finished(&self) -> bool {
        self.store().finished
    }

    /// Whether the writer's transport failed before finishing
    pub fn is_broken(&self) -> bool {
        self.store().broken
    }

    /// Future resolving the next time the segment grows or changes state
    ///
    /// Create it before inspecting the segment: a `Notified` is registered
    /// from construction, so a change between the check and the await is
    /// not lost.
    pub fn changed(&self) -> Notified<'_> {
        self.changed.notified()
    }

    /// Append bytes at the end of the segment
    ///
    /// Fills the spare room of the current block first, then allocates new
    /// blocks of `increment` bytes (or exactly the remainder, whichever is
    /// larger). Existing blocks never move. The length is published only
    /// after the bytes are in place.
    pub fn append(&self, data: &[u8]) -> Result<(), SegmentError> {
        if data.is_empty() {
            return Ok(());
        }

        {
            let mut store = self.store();

            if store.finished {
                return Err(SegmentError::Finished { segment: self.id });
            }
            if store.len + data.len() as u64 > self.policy.max_size {
                return Err(SegmentError::CapacityExceeded {
                    segment: self.id,
                    limit: self.policy.max_size,
                });
            }

            let mut rest = data;
            while !rest.is_empty() {
                let room = store.spare.capacity() - store.spare.len();
                if room == 0 {
                    let block = self.policy.increment.max(rest.len());
                    store.spare = BytesMut::with_capacity(block);
                    store.capacity += store.spare.capacity() as u64;
                    tracing::trace!(
                        segment = self.id,
                        block = block,
                        capacity = store.capacity,
                        "Segment grew"
                    );
                    continue;
                }

                let n = rest.len().min(room);
                store.spare.extend_from_slice(&rest[..n]);
                let piece = store.spare.split().freeze();
                let start = store.len;
                store.pieces.push((start, piece));
                store.len += n as u64;
                rest = &rest[n..];
            }
        }

        self.changed.notify_waiters();
        Ok(())
    }

    /// Read up to `max` bytes starting at `offset`
    ///
    /// The returned `Bytes` shares the block allocation; no copy is made.
    /// A read never spans two pieces, so it may return fewer than `max`
    /// bytes even when more are buffered.
    pub fn read(&self, offset: u64, max: usize) -> SegmentRead {
        let store = self.store();

        if offset < store.len {
            let idx = store
                .pieces
                .partition_point(|(start, _)| *start <= offset)
                .saturating_sub(1);
            let (start, piece) = &store.pieces[idx];
            let from = (offset - start) as usize;
            let to = piece.len().min(from + max.max(1));
            return SegmentRead::Data(piece.slice(from..to));
        }

        if store.broken {
            SegmentRead::Broken
        } else if store.finished {
            SegmentRead::Finished
        } else {
            SegmentRead::Pending
        }
    }

    /// Mark the segment finished; its length is frozen from now on
    pub fn finish(&self) {
        {
            let mut store = self.store();
            if store.finished {
                return;
            }
            store.finished = true;
            store.broken = false;
        }
        self.changed.notify_waiters();
    }

    /// Flag a transport break without finishing the segment
    pub fn mark_broken(&self) {
        {
            let mut store = self.store();
            if store.finished {
                return;
            }
            store.broken = true;
        }
        self.changed.notify_waiters();
    }

    /// Claim the right to resume after a break
    ///
    /// Clears the broken flag and returns the offset to resume from. Only
    /// one caller observes `Some` per break.
    pub fn claim_resume(&self) -> Option<u64> {
        let mut store = self.store();
        if store.broken && !store.finished {
            store.broken = false;
            Some(store.len)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_policy() -> GrowthPolicy {
        GrowthPolicy::default()
            .initial_capacity(8)
            .increment(4)
            .max_size(64)
    }

    fn read_all(segment: &Segment) -> Vec<u8> {
        let mut out = Vec::new();
        let mut offset = 0;
        while let SegmentRead::Data(bytes) = segment.read(offset, 3) {
            offset += bytes.len() as u64;
            out.extend_from_slice(&bytes);
        }
        out
    }

    #[test]
    fn test_default_policy() {
        let policy = GrowthPolicy::default();
        assert_eq!(policy.initial_capacity, 6_000_000);
        assert_eq!(policy.increment, 1_500_000);
        assert_eq!(policy.max_size, DEFAULT_MAX_SIZE);
    }

    #[test]
    fn test_unlimited_policy() {
        let policy = GrowthPolicy::default().max_size(64).unlimited();
        assert_eq!(policy.max_size, u64::MAX);

        let segment = Segment::new(1, policy.initial_capacity(8).increment(4));
        segment.append(&[0; 100]).unwrap();
        assert_eq!(segment.len(), 100);
    }

    #[test]
    fn test_append_and_read_in_order() {
        let segment = Segment::new(1, small_policy());
        segment.append(b"hello ").unwrap();
        segment.append(b"relay").unwrap();

        assert_eq!(segment.len(), 11);
        assert_eq!(read_all(&segment), b"hello relay");
        assert_eq!(segment.read(11, 16), SegmentRead::Pending);
    }

    #[test]
    fn test_linear_growth() {
        let segment = Segment::new(1, small_policy());
        assert!(segment.capacity() >= 8);

        segment.append(&[1; 8]).unwrap();
        let before = segment.capacity();

        segment.append(&[2; 3]).unwrap();
        assert_eq!(segment.capacity(), before + 4);

        // Chunk larger than one increment gets a block of its own size
        segment.append(&[3; 10]).unwrap();
        assert_eq!(segment.len(), 21);
        assert!(segment.capacity() >= 21);
    }

    #[test]
    fn test_growth_keeps_earlier_views_valid() {
        let segment = Segment::new(1, small_policy());
        segment.append(b"abcdefgh").unwrap();

        let held = match segment.read(0, 8) {
            SegmentRead::Data(bytes) => bytes,
            other => panic!("unexpected read: {:?}", other),
        };

        for _ in 0..10 {
            segment.append(b"xyz").unwrap();
        }

        assert_eq!(&held[..], b"abcdefgh");
        assert_eq!(&read_all(&segment)[..8], b"abcdefgh");
    }

    #[test]
    fn test_read_is_bounded() {
        let segment = Segment::new(1, small_policy());
        segment.append(b"abcdef").unwrap();

        match segment.read(1, 2) {
            SegmentRead::Data(bytes) => assert_eq!(&bytes[..], b"bc"),
            other => panic!("unexpected read: {:?}", other),
        }
    }

    #[test]
    fn test_capacity_exceeded() {
        let segment = Segment::new(7, small_policy());
        segment.append(&[0; 60]).unwrap();

        let err = segment.append(&[0; 5]).unwrap_err();
        assert_eq!(
            err,
            SegmentError::CapacityExceeded {
                segment: 7,
                limit: 64
            }
        );
        assert_eq!(segment.len(), 60);
    }

    #[test]
    fn test_finished_is_immutable() {
        let segment = Segment::new(1, small_policy());
        segment.append(b"abc").unwrap();
        segment.finish();

        assert!(matches!(
            segment.append(b"d"),
            Err(SegmentError::Finished { segment: 1 })
        ));
        assert_eq!(segment.len(), 3);
        assert_eq!(segment.read(3, 4), SegmentRead::Finished);
    }

    #[test]
    fn test_broken_claimed_once() {
        let segment = Segment::new(1, small_policy());
        segment.append(&[9; 5]).unwrap();
        segment.mark_broken();

        assert_eq!(segment.read(5, 4), SegmentRead::Broken);
        // Data before the break is still served normally
        assert!(matches!(segment.read(0, 4), SegmentRead::Data(_)));

        assert_eq!(segment.claim_resume(), Some(5));
        assert_eq!(segment.claim_resume(), None);
        assert_eq!(segment.read(5, 4), SegmentRead::Pending);
    }

    #[test]
    fn test_finish_clears_broken() {
        let segment = Segment::new(1, small_policy());
        segment.mark_broken();
        segment.finish();

        assert!(!segment.is_broken());
        assert_eq!(segment.claim_resume(), None);
    }

    #[tokio::test]
    async fn test_append_wakes_waiter() {
        use std::sync::Arc;

        let segment = Arc::new(Segment::new(1, small_policy()));
        let reader = Arc::clone(&segment);

        let waiter = tokio::spawn(async move {
            loop {
                let changed = reader.changed();
                match reader.read(0, 16) {
                    SegmentRead::Data(bytes) => return bytes,
                    _ => changed.await,
                }
            }
        });

        tokio::task::yield_now().await;
        segment.append(b"wake").unwrap();

        let bytes = waiter.await.unwrap();
        assert_eq!(&bytes[..], b"wake");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_reader_follows_growth() {
        use std::sync::Arc;

        let policy = GrowthPolicy::default().initial_capacity(64).increment(32);
        let segment = Arc::new(Segment::new(1, policy));
        let expected: Vec<u8> = (0..700u32).map(|i| (i % 251) as u8).collect();

        let writer = {
            let segment = Arc::clone(&segment);
            let data = expected.clone();
            tokio::spawn(async move {
                for chunk in data.chunks(7) {
                    segment.append(chunk).unwrap();
                    tokio::task::yield_now().await;
                }
                segment.finish();
            })
        };

        let reader = {
            let segment = Arc::clone(&segment);
            tokio::spawn(async move {
                let mut out = Vec::new();
                loop {
                    let changed = segment.changed();
                    match segment.read(out.len() as u64, 16) {
                        SegmentRead::Data(bytes) => out.extend_from_slice(&bytes),
                        SegmentRead::Pending => changed.await,
                        SegmentRead::Finished => return out,
                        SegmentRead::Broken => panic!("segment broke"),
                    }
                }
            })
        };

        writer.await.unwrap();
        let out = reader.await.unwrap();

        assert_eq!(out, expected);
        assert!(segment.capacity() > 64);
        assert!(segment.is_finished());
    }

    #[test]
    fn test_pending_waiter_not_ready_until_change() {
        let segment = Segment::new(1, small_policy());
        let mut changed = tokio_test::task::spawn(segment.changed());

        tokio_test::assert_pending!(changed.poll());
        segment.append(b"x").unwrap();
        assert!(changed.is_woken());
        tokio_test::assert_ready!(changed.poll());
    }
}
