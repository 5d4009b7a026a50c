//! Per-channel upstream fetcher
//!
//! Pulls bytes from the origin into the channel's head segment.
//!
//! ```text
//!  Connecting ──► Streaming ──► Completed
//!      ▲              │    └──► Broken
//!      └── track end ─┘
//! ```
//!
//! A successful end of response is a track boundary: the head segment is
//! finished, a new one is started and the origin is asked again. A broken
//! transport leaves the head flagged broken; the fetcher does not retry on
//! its own, the next listener to reach the break starts a resumed fetcher.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;

use crate::error::Error;
use crate::registry::{Channel, ChannelRegistry};

use super::source::UpstreamSource;

/// Fetcher lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetcherState {
    /// Waiting for the origin to respond
    Connecting,
    /// Appending response bytes to the head segment
    Streaming,
    /// Stopped: channel closed, origin exhausted or channel failed
    Completed,
    /// Transport failed mid-stream; the head awaits a resume
    Broken,
}

/// Upstream fetch task for one channel
pub struct Fetcher<S: UpstreamSource> {
    registry: Arc<ChannelRegistry<S>>,
    channel: Arc<Channel>,
    resume_from: Option<u64>,
    state: FetcherState,
}

impl<S: UpstreamSource> Fetcher<S> {
    /// Create a fetcher; `resume_from` continues a broken transmission
    pub fn new(
        registry: Arc<ChannelRegistry<S>>,
        channel: Arc<Channel>,
        resume_from: Option<u64>,
    ) -> Self {
        Self {
            registry,
            channel,
            resume_from,
            state: FetcherState::Connecting,
        }
    }

    /// Run until the channel closes, the origin is exhausted or the
    /// transport breaks. Returns the final state.
    pub async fn run(mut self, delay: Duration) -> FetcherState {
        let cancel = self.channel.cancel_token();

        if !delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return self.complete(),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        loop {
            self.state = FetcherState::Connecting;
            tracing::debug!(
                channel = %self.channel.name(),
                resume_from = ?self.resume_from,
                "Connecting upstream"
            );

            let opened = tokio::select! {
                _ = cancel.cancelled() => None,
                result = self.registry.source().open(self.channel.name(), self.resume_from) => Some(result),
            };
            let mut body = match opened {
                None => return self.complete(),
                Some(Ok(body)) => body,
                Some(Err(Error::RangeNotSatisfiable(offset))) => {
                    // Nothing left past the break: the track had ended
                    tracing::debug!(
                        channel = %self.channel.name(),
                        offset = offset,
                        "Resume offset is past the end, starting next track"
                    );
                    self.next_track();
                    continue;
                }
                Some(Err(e)) => return self.on_failure(e).await,
            };

            self.state = FetcherState::Streaming;
            let mut appended: u64 = 0;

            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => None,
                    item = body.next() => Some(item),
                };
                match next {
                    None => return self.complete(),
                    Some(Some(Ok(chunk))) => {
                        if let Err(e) = self.channel.append(&chunk) {
                            return self.on_append_error(e).await;
                        }
                        appended += chunk.len() as u64;
                    }
                    Some(Some(Err(e))) => return self.on_failure(e).await,
                    Some(None) => break,
                }
            }

            if appended == 0 && self.resume_from.is_none() {
                tracing::info!(channel = %self.channel.name(), "Upstream exhausted");
                self.channel.finish();
                return self.complete();
            }

            tracing::debug!(
                channel = %self.channel.name(),
                bytes = appended,
                "Upstream transmission ended"
            );
            self.next_track();
        }
    }

    fn next_track(&mut self) {
        self.channel.start_new_segment();
        self.resume_from = None;
    }

    fn complete(&mut self) -> FetcherState {
        self.state = FetcherState::Completed;
        tracing::debug!(channel = %self.channel.name(), "Fetcher completed");
        self.state
    }

    async fn on_failure(&mut self, error: Error) -> FetcherState {
        if self.channel.bytes_received() == 0 {
            // Nothing was ever served: the channel cannot exist
            tracing::error!(
                channel = %self.channel.name(),
                error = %error,
                "Upstream unavailable"
            );
            self.registry
                .fail_channel(&self.channel, error.to_string())
                .await;
            return self.complete();
        }

        tracing::warn!(
            channel = %self.channel.name(),
            error = %error,
            offset = self.channel.head().map(|h| h.len()).unwrap_or(0),
            "Upstream broke"
        );
        self.state = FetcherState::Broken;
        self.state
    }

    async fn on_append_error(&mut self, error: Error) -> FetcherState {
        if !self.channel.is_closed() {
            tracing::error!(
                channel = %self.channel.name(),
                error = %error,
                "Segment append failed"
            );
            self.registry
                .fail_channel(&self.channel, error.to_string())
                .await;
        }
        self.complete()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::registry::{ChannelName, ChannelStatus, RegistryConfig};
    use crate::stream::GrowthPolicy;
    use crate::upstream::mock::{Reply, ScriptedUpstream};
    use crate::upstream::UpstreamConfig;

    async fn setup(
        source: ScriptedUpstream,
        growth: GrowthPolicy,
    ) -> (Arc<ChannelRegistry<ScriptedUpstream>>, Arc<Channel>) {
        let registry = Arc::new(ChannelRegistry::with_config(
            source,
            RegistryConfig::default().growth(growth),
            UpstreamConfig::default(),
        ));
        let (channel, _) = registry
            .find_or_create(&ChannelName::new("jazz").unwrap())
            .await;
        (registry, channel)
    }

    fn growth() -> GrowthPolicy {
        GrowthPolicy::default().initial_capacity(64).increment(64)
    }

    fn chunk(data: &'static [u8]) -> Bytes {
        Bytes::from_static(data)
    }

    #[tokio::test]
    async fn test_track_end_starts_new_segment() {
        let source = ScriptedUpstream::new();
        source.push(Reply::Chunks(vec![chunk(b"track-one")]));
        source.push(Reply::Chunks(vec![chunk(b"track-two")]));
        let (registry, channel) = setup(source, growth()).await;
        let (first, _) = channel.join(Default::default()).unwrap();

        let fetcher = Fetcher::new(Arc::clone(&registry), Arc::clone(&channel), None);
        let handle = tokio::spawn(fetcher.run(Duration::ZERO));

        // Third open gets no scripted reply and idles
        registry.source().wait_calls(3).await;

        assert!(first.is_finished());
        assert_eq!(first.len(), 9);
        let second = channel.advance(&first).unwrap();
        assert!(second.is_finished());
        assert_eq!(second.len(), 9);
        assert_eq!(channel.bytes_received(), 18);

        let calls = registry.source().calls();
        assert!(calls.iter().all(|(_, resume)| resume.is_none()));

        registry.fail_channel(&channel, "test over").await;
        assert_eq!(handle.await.unwrap(), FetcherState::Completed);
    }

    #[tokio::test]
    async fn test_break_reports_broken() {
        let source = ScriptedUpstream::new();
        source.push(Reply::Break(vec![chunk(b"0123")]));
        let (registry, channel) = setup(source, growth()).await;

        let fetcher = Fetcher::new(Arc::clone(&registry), Arc::clone(&channel), None);
        let state = fetcher.run(Duration::ZERO).await;

        assert_eq!(state, FetcherState::Broken);
        assert_eq!(channel.head().unwrap().len(), 4);
        assert!(!channel.is_closed());
    }

    #[tokio::test]
    async fn test_failure_before_any_byte_fails_channel() {
        let source = ScriptedUpstream::new();
        source.push(Reply::Break(vec![]));
        let (registry, channel) = setup(source, growth()).await;

        let fetcher = Fetcher::new(Arc::clone(&registry), Arc::clone(&channel), None);
        assert_eq!(fetcher.run(Duration::ZERO).await, FetcherState::Completed);

        assert!(matches!(channel.status(), ChannelStatus::Failed(_)));
        assert_eq!(registry.channel_count().await, 0);
    }

    #[tokio::test]
    async fn test_resume_appends_to_same_segment() {
        let source = ScriptedUpstream::new();
        source.push(Reply::Break(vec![chunk(b"abcd")]));
        source.push(Reply::Chunks(vec![chunk(b"efgh")]));
        let (registry, channel) = setup(source, growth()).await;
        let head = channel.head().unwrap();

        let fetcher = Fetcher::new(Arc::clone(&registry), Arc::clone(&channel), None);
        assert_eq!(fetcher.run(Duration::ZERO).await, FetcherState::Broken);
        channel.mark_broken();

        let offset = head.claim_resume().unwrap();
        assert_eq!(offset, 4);

        let fetcher = Fetcher::new(Arc::clone(&registry), Arc::clone(&channel), Some(offset));
        let handle = tokio::spawn(fetcher.run(Duration::ZERO));
        registry.source().wait_calls(3).await;

        assert_eq!(registry.source().calls()[1].1, Some(4));
        assert!(head.is_finished());
        assert_eq!(head.len(), 8);

        registry.fail_channel(&channel, "test over").await;
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_range_not_satisfiable_is_track_end() {
        let source = ScriptedUpstream::new();
        source.push(Reply::Unsatisfiable);
        let (registry, channel) = setup(source, growth()).await;
        channel.append(b"full track").unwrap();
        let head = channel.head().unwrap();

        let fetcher = Fetcher::new(Arc::clone(&registry), Arc::clone(&channel), Some(10));
        let handle = tokio::spawn(fetcher.run(Duration::ZERO));
        registry.source().wait_calls(2).await;

        assert!(head.is_finished());
        assert_eq!(registry.source().calls()[1].1, None);

        registry.fail_channel(&channel, "test over").await;
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_fresh_fetch_exhausts_channel() {
        let source = ScriptedUpstream::new();
        source.push(Reply::Chunks(vec![chunk(b"last")]));
        source.push(Reply::Chunks(vec![]));
        let (registry, channel) = setup(source, growth()).await;

        let fetcher = Fetcher::new(Arc::clone(&registry), Arc::clone(&channel), None);
        assert_eq!(fetcher.run(Duration::ZERO).await, FetcherState::Completed);

        assert_eq!(channel.status(), ChannelStatus::Exhausted);
        assert!(channel.head().unwrap().is_finished());
        assert!(!channel.is_closed());
    }

    #[tokio::test]
    async fn test_capacity_exceeded_fails_channel() {
        let source = ScriptedUpstream::new();
        source.push(Reply::Chunks(vec![chunk(b"0123456789"), chunk(b"0123456789")]));
        let (registry, channel) = setup(source, growth().max_size(15)).await;

        let fetcher = Fetcher::new(Arc::clone(&registry), Arc::clone(&channel), None);
        assert_eq!(fetcher.run(Duration::ZERO).await, FetcherState::Completed);

        assert!(matches!(channel.status(), ChannelStatus::Failed(_)));
        assert_eq!(registry.channel_count().await, 0);
    }

    #[tokio::test]
    async fn test_cancel_stops_streaming() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let source = ScriptedUpstream::new();
        source.push(Reply::Live(rx));
        let (registry, channel) = setup(source, growth()).await;

        let fetcher = Fetcher::new(Arc::clone(&registry), Arc::clone(&channel), None);
        let handle = tokio::spawn(fetcher.run(Duration::ZERO));

        tx.send(Ok(chunk(b"live"))).unwrap();
        channel.wait_ready().await.unwrap();

        registry.release(&channel, None).await;
        assert_eq!(handle.await.unwrap(), FetcherState::Completed);
        assert!(channel.is_closed());
    }
}
