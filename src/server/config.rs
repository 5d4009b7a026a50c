//! Server configuration

use std::net::SocketAddr;

use crate::session::SessionConfig;

/// Default listen port
pub const DEFAULT_PORT: u16 = 1337;

/// Default `Content-Type` of relayed responses
pub const DEFAULT_CONTENT_TYPE: &str = "audio/mpeg";

/// Server configuration options
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,

    /// Maximum concurrent listeners (0 = unlimited)
    pub max_listeners: usize,

    /// Chunks buffered between a session and its HTTP response body
    pub sink_capacity: usize,

    /// `Content-Type` sent with relayed streams
    pub content_type: String,

    /// Per-listener session settings
    pub session: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            max_listeners: 0, // Unlimited
            sink_capacity: 32,
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            session: SessionConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Create a new config with custom bind address
    pub fn with_addr(addr: SocketAddr) -> Self {
        Self {
            bind_addr: addr,
            ..Default::default()
        }
    }

    /// Set the bind address
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set maximum concurrent listeners
    pub fn max_listeners(mut self, max: usize) -> Self {
        self.max_listeners = max;
        self
    }

    /// Set the per-listener body buffer, in chunks
    pub fn sink_capacity(mut self, chunks: usize) -> Self {
        self.sink_capacity = chunks.max(1);
        self
    }

    /// Set the response content type
    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    /// Set the maximum bytes per write to a listener
    pub fn chunk_size(mut self, bytes: usize) -> Self {
        self.session = self.session.chunk_size(bytes);
        self
    }
}
