//! Channel entry and state types
//!
//! This module defines the per-channel state stored in the registry: the
//! stream chain, the listener count, fetcher bookkeeping and the status
//! watched by listeners.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tokio::sync::watch;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::error::{Error, Result};
use crate::stream::{GrowthPolicy, Segment, StreamChain};

use super::config::JoinMode;
use super::error::RegistryError;
use super::key::ChannelName;

/// Lifecycle status of a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    /// Created, no upstream byte received yet
    Starting,
    /// Upstream bytes are flowing
    Live,
    /// Origin has no more content; listeners drain what is buffered
    Exhausted,
    /// Channel could not be served
    Failed(String),
    /// Torn down after the last listener left
    Closed,
}

impl ChannelStatus {
    /// Whether the channel has been torn down
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChannelStatus::Failed(_) | ChannelStatus::Closed)
    }
}

#[derive(Debug)]
struct ChannelState {
    chain: StreamChain,
    /// Active downstream connections, including reservations not yet joined
    listeners: u32,
    closed: bool,
    /// A fetcher task currently owns the head segment
    fetching: bool,
}

/// A named relay endpoint owning one stream chain
pub struct Channel {
    name: ChannelName,
    state: Mutex<ChannelState>,
    status: watch::Sender<ChannelStatus>,
    cancel: CancellationToken,
    /// Bytes appended over the channel's lifetime
    received: AtomicU64,
    /// Consecutive resume attempts without progress
    resume_attempts: AtomicU32,
    created_at: Instant,
}

impl Channel {
    /// Create a channel with an empty chain and no listeners
    pub(super) fn new(name: ChannelName, growth: GrowthPolicy) -> Self {
        let (status, _) = watch::channel(ChannelStatus::Starting);

        Self {
            name,
            state: Mutex::new(ChannelState {
                chain: StreamChain::new(growth),
                listeners: 0,
                closed: false,
                fetching: false,
            }),
            status,
            cancel: CancellationToken::new(),
            received: AtomicU64::new(0),
            resume_attempts: AtomicU32::new(0),
            created_at: Instant::now(),
        }
    }

    fn state(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Channel name
    pub fn name(&self) -> &ChannelName {
        &self.name
    }

    /// When the channel was created
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Number of active downstream connections
    pub fn listener_count(&self) -> u32 {
        self.state().listeners
    }

    /// Number of retained segments
    pub fn segment_count(&self) -> usize {
        self.state().chain.len()
    }

    /// Whether the channel has been torn down
    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Whether a fetcher currently owns the head
    pub fn is_fetching(&self) -> bool {
        self.state().fetching
    }

    /// Total bytes received from upstream
    pub fn bytes_received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Current status
    pub fn status(&self) -> ChannelStatus {
        self.status.borrow().clone()
    }

    /// Watch status changes
    pub fn subscribe_status(&self) -> watch::Receiver<ChannelStatus> {
        self.status.subscribe()
    }

    /// Resolves when the channel is torn down
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// Token cancelled on teardown, for tasks that outlive a borrow
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Newest segment
    pub fn head(&self) -> Option<Arc<Segment>> {
        self.state().chain.head().cloned()
    }

    /// Wait until the channel has content or has failed
    pub async fn wait_ready(&self) -> std::result::Result<(), RegistryError> {
        let mut rx = self.subscribe_status();
        let status = match rx.wait_for(|s| *s != ChannelStatus::Starting).await {
            Ok(status) => status.clone(),
            Err(_) => ChannelStatus::Closed,
        };

        match status {
            ChannelStatus::Live | ChannelStatus::Exhausted => Ok(()),
            ChannelStatus::Failed(reason) => Err(RegistryError::UpstreamUnavailable {
                channel: self.name.clone(),
                reason,
            }),
            ChannelStatus::Starting | ChannelStatus::Closed => {
                Err(RegistryError::ChannelClosed(self.name.clone()))
            }
        }
    }

    /// Count one more listener unless the channel is being torn down
    pub(super) fn reserve(&self) -> bool {
        let mut state = self.state();
        if state.closed {
            return false;
        }
        state.listeners += 1;
        true
    }

    /// Place a reserved listener on its starting segment
    ///
    /// Returns the segment (with a reference taken) and the offset to
    /// start reading at.
    pub fn join(&self, mode: JoinMode) -> std::result::Result<(Arc<Segment>, u64), RegistryError> {
        let mut state = self.state();

        let segment = match mode {
            JoinMode::FullCatchUp => state.chain.oldest(),
            JoinMode::TrackStart | JoinMode::LiveEdge => state.chain.head(),
        }
        .cloned()
        .filter(|_| !state.closed)
        .ok_or_else(|| RegistryError::ChannelClosed(self.name.clone()))?;

        let offset = match mode {
            JoinMode::LiveEdge => segment.len(),
            JoinMode::FullCatchUp | JoinMode::TrackStart => 0,
        };
        state.chain.acquire(segment.id());

        Ok((segment, offset))
    }

    /// Move a listener from a finished segment to the next one
    ///
    /// Takes the reference on the next segment before dropping the one on
    /// `from`, so the target cannot be reclaimed in between. Returns `None`
    /// when the listener is already at the newest segment.
    pub fn advance(&self, from: &Segment) -> Option<Arc<Segment>> {
        let mut state = self.state();

        let next = state.chain.next_after(from.id()).cloned()?;
        state.chain.acquire(next.id());
        state.chain.release(from.id());

        tracing::debug!(
            channel = %self.name,
            from = from.id(),
            to = next.id(),
            "Listener advanced to next segment"
        );

        Some(next)
    }

    /// Drop a listener and its segment reference
    ///
    /// Returns the remaining listener count.
    pub(super) fn leave(&self, segment: Option<u64>) -> u32 {
        let mut state = self.state();
        if let Some(id) = segment {
            state.chain.release(id);
        }
        debug_assert!(state.listeners > 0, "channel {} left twice", self.name);
        state.listeners = state.listeners.saturating_sub(1);
        state.listeners
    }

    /// Append upstream bytes to the head segment
    pub fn append(&self, data: &[u8]) -> Result<()> {
        let head = self
            .head()
            .ok_or_else(|| RegistryError::ChannelClosed(self.name.clone()))?;
        head.append(data).map_err(Error::from)?;

        if !data.is_empty() {
            self.received.fetch_add(data.len() as u64, Ordering::Relaxed);
            self.resume_attempts.store(0, Ordering::Relaxed);
            self.status.send_if_modified(|status| {
                if *status == ChannelStatus::Starting {
                    *status = ChannelStatus::Live;
                    true
                } else {
                    false
                }
            });
        }
        Ok(())
    }

    /// Finish the head segment and start a new one (track boundary)
    pub fn start_new_segment(&self) -> Option<Arc<Segment>> {
        let mut state = self.state();
        if state.closed {
            return None;
        }
        let segment = state.chain.start_new_segment();

        tracing::debug!(
            channel = %self.name,
            segment = segment.id(),
            retained = state.chain.len(),
            "New segment started"
        );

        Some(segment)
    }

    /// Flag the head segment as broken by a transport failure
    pub fn mark_broken(&self) {
        if let Some(head) = self.head() {
            tracing::debug!(
                channel = %self.name,
                segment = head.id(),
                offset = head.len(),
                "Head segment marked broken"
            );
            head.mark_broken();
        }
    }

    /// Origin has nothing more: finish the head, let listeners drain
    pub fn finish(&self) {
        if let Some(head) = self.head() {
            head.finish();
        }
        self.status.send_if_modified(|status| {
            if status.is_terminal() {
                false
            } else {
                *status = ChannelStatus::Exhausted;
                true
            }
        });
    }

    /// Tear the channel down: drain the chain and stop the fetcher
    pub(super) fn teardown(&self) {
        let drained = {
            let mut state = self.state();
            if state.closed {
                return;
            }
            state.closed = true;
            state.chain.drain()
        };

        self.status.send_if_modified(|status| {
            if status.is_terminal() {
                false
            } else {
                *status = ChannelStatus::Closed;
                true
            }
        });
        self.cancel.cancel();

        tracing::debug!(channel = %self.name, segments = drained, "Channel torn down");
    }

    /// Mark the channel failed, then tear it down
    pub(super) fn fail(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.status.send_if_modified(|status| {
            if status.is_terminal() {
                false
            } else {
                *status = ChannelStatus::Failed(reason);
                true
            }
        });
        self.teardown();
    }

    /// Claim the single fetcher slot
    pub(crate) fn begin_fetch(&self) -> bool {
        let mut state = self.state();
        if state.closed || state.fetching {
            return false;
        }
        state.fetching = true;
        true
    }

    /// Release the fetcher slot
    pub(crate) fn end_fetch(&self) {
        self.state().fetching = false;
    }

    /// Count a resume attempt and return how many happened without progress
    pub(crate) fn next_resume_attempt(&self) -> u32 {
        self.resume_attempts.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Snapshot of the channel's state
    pub fn stats(&self) -> ChannelStats {
        let state = self.state();
        ChannelStats {
            listener_count: state.listeners,
            segment_count: state.chain.len(),
            buffered_bytes: state.chain.buffered_bytes(),
            head_len: state.chain.head().map(|h| h.len()).unwrap_or(0),
            bytes_received: self.bytes_received(),
            fetching: state.fetching,
            status: self.status(),
        }
    }

    #[cfg(test)]
    pub(crate) fn segment_listeners(&self) -> u32 {
        self.state().chain.listener_total()
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("status", &*self.status.borrow())
            .finish_non_exhaustive()
    }
}

/// Statistics for a channel
#[derive(Debug, Clone)]
pub struct ChannelStats {
    /// Number of active listeners
    pub listener_count: u32,
    /// Number of retained segments
    pub segment_count: usize,
    /// Bytes held across retained segments
    pub buffered_bytes: u64,
    /// Length of the newest segment
    pub head_len: u64,
    /// Total bytes received from upstream
    pub bytes_received: u64,
    /// Whether a fetcher is running
    pub fetching: bool,
    /// Current status
    pub status: ChannelStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> Channel {
        Channel::new(
            ChannelName::new("jazz").unwrap(),
            GrowthPolicy::default().initial_capacity(64).increment(64),
        )
    }

    #[test]
    fn test_append_goes_live() {
        let channel = channel();
        assert_eq!(channel.status(), ChannelStatus::Starting);

        channel.append(b"abc").unwrap();
        assert_eq!(channel.status(), ChannelStatus::Live);
        assert_eq!(channel.bytes_received(), 3);
        assert_eq!(channel.head().unwrap().len(), 3);
    }

    #[test]
    fn test_join_modes() {
        let channel = channel();
        channel.reserve();
        channel.append(&[1; 10]).unwrap();
        let (first, _) = channel.join(JoinMode::FullCatchUp).unwrap();
        channel.start_new_segment();
        channel.append(&[2; 4]).unwrap();

        let (seg, offset) = channel.join(JoinMode::FullCatchUp).unwrap();
        assert_eq!((seg.id(), offset), (first.id(), 0));

        let (seg, offset) = channel.join(JoinMode::TrackStart).unwrap();
        assert_eq!((seg.id(), offset), (1, 0));

        let (seg, offset) = channel.join(JoinMode::LiveEdge).unwrap();
        assert_eq!((seg.id(), offset), (1, 4));
    }

    #[test]
    fn test_advance_moves_reference() {
        let channel = channel();
        channel.reserve();
        let (first, _) = channel.join(JoinMode::FullCatchUp).unwrap();

        assert!(channel.advance(&first).is_none());

        channel.start_new_segment();
        let next = channel.advance(&first).unwrap();
        assert_eq!(next.id(), 1);
        // First segment was finished and unreferenced, so it is reclaimed
        assert_eq!(channel.segment_count(), 1);
        assert_eq!(channel.segment_listeners(), 1);
    }

    #[test]
    fn test_leave_counts_down() {
        let channel = channel();
        assert!(channel.reserve());
        assert!(channel.reserve());
        let (seg, _) = channel.join(JoinMode::FullCatchUp).unwrap();

        assert_eq!(channel.leave(Some(seg.id())), 1);
        assert_eq!(channel.leave(None), 0);
        assert_eq!(channel.segment_listeners(), 0);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "left twice")]
    fn test_double_leave_is_caught() {
        let channel = channel();
        channel.reserve();
        channel.leave(None);
        channel.leave(None);
    }

    #[test]
    fn test_teardown() {
        let channel = channel();
        channel.reserve();
        let (seg, _) = channel.join(JoinMode::FullCatchUp).unwrap();

        channel.teardown();
        assert!(channel.is_closed());
        assert_eq!(channel.status(), ChannelStatus::Closed);
        assert!(channel.cancel_token().is_cancelled());
        assert!(seg.is_finished());
        assert!(!channel.reserve());
        assert!(channel.join(JoinMode::FullCatchUp).is_err());
        assert!(channel.append(b"late").is_err());
    }

    #[test]
    fn test_fail_keeps_reason() {
        let channel = channel();
        channel.fail("connection refused");

        assert_eq!(
            channel.status(),
            ChannelStatus::Failed("connection refused".into())
        );
        assert!(channel.is_closed());
    }

    #[test]
    fn test_single_fetcher_slot() {
        let channel = channel();
        assert!(channel.begin_fetch());
        assert!(!channel.begin_fetch());
        channel.end_fetch();
        assert!(channel.begin_fetch());
    }

    #[test]
    fn test_resume_attempts_reset_on_progress() {
        let channel = channel();
        assert_eq!(channel.next_resume_attempt(), 1);
        assert_eq!(channel.next_resume_attempt(), 2);

        channel.append(b"x").unwrap();
        assert_eq!(channel.next_resume_attempt(), 1);
    }

    #[tokio::test]
    async fn test_wait_ready() {
        let channel = Arc::new(channel());
        let waiter = {
            let channel = Arc::clone(&channel);
            tokio::spawn(async move { channel.wait_ready().await })
        };

        channel.append(b"data").unwrap();
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_wait_ready_failed() {
        let channel = channel();
        channel.fail("404");

        let err = channel.wait_ready().await.unwrap_err();
        assert!(matches!(err, RegistryError::UpstreamUnavailable { .. }));
    }
}
