//! Registry error types
//!
//! Error types for channel registry operations.

use super::key::ChannelName;

/// Error type for registry operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Channel was torn down while the caller was using it
    ChannelClosed(ChannelName),
    /// Request path does not name a channel
    InvalidChannelName(String),
    /// The origin could not serve the channel
    UpstreamUnavailable { channel: ChannelName, reason: String },
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::ChannelClosed(name) => write!(f, "Channel closed: {}", name),
            RegistryError::InvalidChannelName(path) => {
                write!(f, "Invalid channel name: {:?}", path)
            }
            RegistryError::UpstreamUnavailable { channel, reason } => {
                write!(f, "Upstream unavailable for {}: {}", channel, reason)
            }
        }
    }
}

impl std::error::Error for RegistryError {}
