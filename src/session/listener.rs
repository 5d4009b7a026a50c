//! Listener session
//!
//! Drives one downstream connection over a channel's stream chain:
//! drain the current segment into the sink, wait when caught up, advance
//! across finished segments, and resume the upstream on a broken one.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::registry::{Channel, ChannelName, ChannelRegistry, ChannelStatus};
use crate::stats::SessionStats;
use crate::stream::{Segment, SegmentRead};
use crate::upstream::UpstreamSource;

use super::sink::ListenerSink;
use super::state::{CloseReason, ListenerPhase};

/// Default maximum bytes handed to the sink per write
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// Per-session configuration
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// Maximum bytes per sink write
    pub chunk_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl SessionConfig {
    /// Set the write chunk size
    pub fn chunk_size(mut self, bytes: usize) -> Self {
        self.chunk_size = bytes.max(1);
        self
    }
}

/// One downstream listener attached to a channel
pub struct ListenerSession<S: UpstreamSource, K: ListenerSink> {
    id: u64,
    registry: Arc<ChannelRegistry<S>>,
    channel: Arc<Channel>,
    /// Segment the session holds a reference on
    segment: Arc<Segment>,
    /// Next byte to deliver within `segment`
    offset: u64,
    sink: K,
    config: SessionConfig,
    phase: ListenerPhase,
    stats: SessionStats,
    started_at: Instant,
    released: bool,
}

impl<S: UpstreamSource, K: ListenerSink> ListenerSession<S, K> {
    /// Join `name`, creating the channel and starting its fetcher if needed
    ///
    /// This is the attaching step; the returned session is draining.
    pub async fn attach(
        id: u64,
        registry: &Arc<ChannelRegistry<S>>,
        name: ChannelName,
        sink: K,
        config: SessionConfig,
    ) -> Result<Self> {
        let (channel, created) = registry.find_or_create(&name).await;

        // Join before the fetcher starts: an unreferenced finished first
        // track would be trimmed
        let (segment, offset) = match channel.join(registry.config().join_mode) {
            Ok(position) => position,
            Err(e) => {
                registry.release(&channel, None).await;
                return Err(e.into());
            }
        };

        if created {
            registry.start_fetcher(&channel, None, Duration::ZERO);
        }

        tracing::info!(
            session_id = id,
            channel = %name,
            segment = segment.id(),
            offset = offset,
            created = created,
            "Listener attached"
        );

        Ok(Self {
            id,
            registry: Arc::clone(registry),
            channel,
            segment,
            offset,
            sink,
            config,
            phase: ListenerPhase::Draining,
            stats: SessionStats::new(),
            started_at: Instant::now(),
            released: false,
        })
    }

    /// Session ID
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Channel this session reads from
    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    /// Current phase
    pub fn phase(&self) -> ListenerPhase {
        self.phase
    }

    /// Current read position as (segment id, offset)
    pub fn position(&self) -> (u64, u64) {
        (self.segment.id(), self.offset)
    }

    /// Wait until the channel has content, or report why it never will
    pub async fn wait_ready(&self) -> Result<()> {
        self.channel.wait_ready().await?;
        Ok(())
    }

    /// Relay bytes until the listener goes away or the channel ends
    pub async fn run(mut self) -> SessionStats {
        let reason = self.drain().await;
        self.release(reason).await;
        self.stats.clone()
    }

    /// Detach without relaying
    pub async fn close(mut self) -> SessionStats {
        self.release(CloseReason::Disconnected).await;
        self.stats.clone()
    }

    async fn drain(&mut self) -> CloseReason {
        let cancel = self.channel.cancel_token();
        let mut status = self.channel.subscribe_status();

        loop {
            if status.borrow().is_terminal() {
                return CloseReason::ChannelClosed;
            }

            let segment = Arc::clone(&self.segment);
            // Registered before the read so a wakeup in between is kept
            let changed = segment.changed();

            match segment.read(self.offset, self.config.chunk_size) {
                SegmentRead::Data(bytes) => {
                    let n = bytes.len() as u64;
                    if let Err(e) = self.sink.write(bytes).await {
                        tracing::debug!(
                            session_id = self.id,
                            error = %e,
                            "Listener write failed"
                        );
                        return CloseReason::Disconnected;
                    }
                    self.offset += n;
                    self.stats.bytes_sent += n;
                    continue;
                }
                SegmentRead::Finished => {
                    self.phase = ListenerPhase::Advancing;
                    if let Some(next) = self.channel.advance(&segment) {
                        self.segment = next;
                        self.offset = 0;
                        self.stats.segments_crossed += 1;
                        self.phase = ListenerPhase::Draining;
                        continue;
                    }
                    self.phase = ListenerPhase::Draining;

                    if *status.borrow() == ChannelStatus::Exhausted {
                        return CloseReason::EndOfStream;
                    }
                }
                SegmentRead::Broken => {
                    if let Some(offset) = segment.claim_resume() {
                        self.phase = ListenerPhase::Resuming;
                        self.stats.resumes_triggered += 1;
                        tracing::debug!(
                            session_id = self.id,
                            channel = %self.channel.name(),
                            segment = segment.id(),
                            offset = offset,
                            "Listener triggering resume"
                        );
                        self.registry.resume(&self.channel, offset).await;
                        self.phase = ListenerPhase::Draining;
                        continue;
                    }
                    // Another listener claimed this break
                }
                SegmentRead::Pending => {}
            }

            let open = tokio::select! {
                _ = changed => true,
                result = status.changed() => result.is_ok(),
                _ = cancel.cancelled() => true,
            };
            if !open {
                return CloseReason::ChannelClosed;
            }
        }
    }

    async fn release(&mut self, reason: CloseReason) {
        if self.released {
            return;
        }
        self.released = true;
        self.phase = ListenerPhase::Closed;
        self.stats.duration = self.started_at.elapsed();

        self.registry
            .release(&self.channel, Some(self.segment.id()))
            .await;

        tracing::info!(
            session_id = self.id,
            channel = %self.channel.name(),
            reason = %reason,
            bytes_sent = self.stats.bytes_sent,
            segments_crossed = self.stats.segments_crossed,
            "Listener closed"
        );
    }
}

impl<S: UpstreamSource, K: ListenerSink> Drop for ListenerSession<S, K> {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        // Dropped mid-run (e.g. the serving task was aborted)
        let registry = Arc::clone(&self.registry);
        let channel = Arc::clone(&self.channel);
        let segment = self.segment.id();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    registry.release(&channel, Some(segment)).await;
                });
            }
            Err(_) => {
                tracing::warn!(
                    session_id = self.id,
                    channel = %self.channel.name(),
                    "Listener dropped outside runtime, references leaked"
                );
            }
        }
    }
}

impl<S: UpstreamSource, K: ListenerSink> std::fmt::Debug for ListenerSession<S, K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerSession")
            .field("id", &self.id)
            .field("channel", self.channel.name())
            .field("segment", &self.segment.id())
            .field("offset", &self.offset)
            .field("phase", &self.phase)
            .finish_non_exhaustive()
    }
}
