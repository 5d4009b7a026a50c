//! Channel registry implementation
//!
//! The central registry that maps channel names to live channels, creates
//! channels on first request and tears them down when the last listener
//! leaves.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use crate::upstream::{Fetcher, FetcherState, UpstreamConfig, UpstreamSource};

use super::config::RegistryConfig;
use super::entry::{Channel, ChannelStats};
use super::key::ChannelName;

/// Central registry for all relayed channels
///
/// Thread-safe via `RwLock`: lookups of existing channels take the shared
/// lock, creation and removal take the exclusive one. Listener counts are
/// changed under the channel's own lock while one of the two is held, so a
/// channel found here is never mid-teardown.
pub struct ChannelRegistry<S: UpstreamSource> {
    /// Map of channel name to channel
    channels: RwLock<HashMap<ChannelName, Arc<Channel>>>,

    /// Configuration
    config: RegistryConfig,

    /// Upstream fetch configuration
    upstream: UpstreamConfig,

    /// Origin the fetchers pull from
    source: S,
}

impl<S: UpstreamSource> ChannelRegistry<S> {
    /// Create a new registry with default configuration
    pub fn new(source: S) -> Self {
        Self::with_config(source, RegistryConfig::default(), UpstreamConfig::default())
    }

    /// Create a new registry with custom configuration
    pub fn with_config(source: S, config: RegistryConfig, upstream: UpstreamConfig) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            config,
            upstream,
            source,
        }
    }

    /// Get the registry configuration
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Get the upstream configuration
    pub fn upstream_config(&self) -> &UpstreamConfig {
        &self.upstream
    }

    /// Get the upstream source
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Find a channel by name, creating it if unknown
    ///
    /// The returned channel already counts the caller as a listener; hand
    /// it back through [`release`](Self::release). `created` is true for
    /// exactly one caller per channel, which must start the fetcher.
    pub async fn find_or_create(&self, name: &ChannelName) -> (Arc<Channel>, bool) {
        {
            let channels = self.channels.read().await;
            if let Some(channel) = channels.get(name) {
                if channel.reserve() {
                    tracing::debug!(
                        channel = %name,
                        listeners = channel.listener_count(),
                        "Channel found"
                    );
                    return (Arc::clone(channel), false);
                }
            }
        }

        let mut channels = self.channels.write().await;

        // Someone may have created it between the two locks
        if let Some(channel) = channels.get(name) {
            if channel.reserve() {
                return (Arc::clone(channel), false);
            }
        }

        let channel = Arc::new(Channel::new(name.clone(), self.config.growth));
        channel.reserve();
        channels.insert(name.clone(), Arc::clone(&channel));

        tracing::info!(channel = %name, channels = channels.len(), "Channel created");

        (channel, true)
    }

    /// Detach one listener from a channel
    ///
    /// `segment` is the segment the listener was positioned on, if any.
    /// When the last listener leaves, the channel is removed, its chain is
    /// drained and its fetcher is told to stop.
    pub async fn release(&self, channel: &Arc<Channel>, segment: Option<u64>) {
        let mut channels = self.channels.write().await;

        let remaining = channel.leave(segment);
        tracing::debug!(
            channel = %channel.name(),
            listeners = remaining,
            "Listener released"
        );

        if remaining == 0 {
            Self::remove_locked(&mut channels, channel);
            channel.teardown();
            tracing::info!(channel = %channel.name(), "Channel removed, no listeners left");
        }
    }

    /// Remove a channel that cannot be served and disconnect its listeners
    pub async fn fail_channel(&self, channel: &Arc<Channel>, reason: impl Into<String>) {
        let reason = reason.into();
        let mut channels = self.channels.write().await;

        Self::remove_locked(&mut channels, channel);
        channel.fail(reason.clone());

        tracing::warn!(
            channel = %channel.name(),
            reason = %reason,
            listeners = channel.listener_count(),
            "Channel failed"
        );
    }

    fn remove_locked(channels: &mut HashMap<ChannelName, Arc<Channel>>, channel: &Arc<Channel>) {
        // The name may already belong to a newer channel
        let same = channels
            .get(channel.name())
            .is_some_and(|current| Arc::ptr_eq(current, channel));
        if same {
            channels.remove(channel.name());
        }
    }

    /// Look up a channel without joining it
    pub async fn get(&self, name: &ChannelName) -> Option<Arc<Channel>> {
        self.channels.read().await.get(name).cloned()
    }

    /// Check if a channel exists
    pub async fn channel_exists(&self, name: &ChannelName) -> bool {
        self.channels.read().await.contains_key(name)
    }

    /// Get channel statistics
    pub async fn channel_stats(&self, name: &ChannelName) -> Option<ChannelStats> {
        let channels = self.channels.read().await;
        channels.get(name).map(|channel| channel.stats())
    }

    /// Get total number of channels
    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }

    /// Names of all live channels
    pub async fn channel_names(&self) -> Vec<ChannelName> {
        let mut names: Vec<_> = self.channels.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Spawn the upstream fetcher for a channel
    ///
    /// Returns false if a fetcher is already running or the channel is
    /// closed; at most one fetcher writes a channel at any time.
    pub fn start_fetcher(
        self: &Arc<Self>,
        channel: &Arc<Channel>,
        resume_from: Option<u64>,
        delay: Duration,
    ) -> bool {
        if !channel.begin_fetch() {
            return false;
        }

        let fetcher = Fetcher::new(Arc::clone(self), Arc::clone(channel), resume_from);
        let channel = Arc::clone(channel);

        tokio::spawn(async move {
            let state = fetcher.run(delay).await;

            // Free the slot before flagging the break, so the listener that
            // claims the resume can start the next fetcher.
            channel.end_fetch();
            if state == FetcherState::Broken {
                channel.mark_broken();
            }
        });

        true
    }

    /// Restart the upstream fetch at `offset` after a transport break
    ///
    /// Applies the configured backoff and attempt cap. Returns true if a
    /// fetcher was started.
    pub async fn resume(self: &Arc<Self>, channel: &Arc<Channel>, offset: u64) -> bool {
        let attempt = channel.next_resume_attempt();

        if let Some(max) = self.upstream.max_resume_attempts {
            if attempt > max {
                self.fail_channel(channel, format!("gave up after {} resume attempts", max))
                    .await;
                return false;
            }
        }

        let delay = self.upstream.resume_delay(attempt);
        tracing::info!(
            channel = %channel.name(),
            offset = offset,
            attempt = attempt,
            delay_ms = delay.as_millis() as u64,
            "Resuming upstream"
        );

        self.start_fetcher(channel, Some(offset), delay)
    }
}
