//! Live audio relay
//!
//! Fetches each channel from the origin once and fans it out to any number
//! of HTTP listeners. Channel history is buffered as a chain of track
//! segments so new listeners catch up from the oldest retained track, and
//! a broken upstream connection is resumed at the exact byte it stopped.
//!
//! # Example
//!
//! ```no_run
//! use audio_relay::{RegistryConfig, RelayServer, ServerConfig, UpstreamConfig};
//!
//! #[tokio::main]
//! async fn main() -> audio_relay::Result<()> {
//!     let server = RelayServer::with_upstream(
//!         ServerConfig::default(),
//!         RegistryConfig::default(),
//!         UpstreamConfig::with_origin("http://localhost:8000/"),
//!     )?;
//!     server.run().await
//! }
//! ```

pub mod error;
pub mod registry;
pub mod server;
pub mod session;
pub mod stats;
pub mod stream;
pub mod upstream;

pub use error::{Error, Result};
pub use registry::{
    Channel, ChannelName, ChannelRegistry, ChannelStats, ChannelStatus, JoinMode, RegistryConfig,
    RegistryError,
};
pub use server::{RelayServer, ServerConfig};
pub use session::{ChannelSink, ListenerSession, ListenerSink, SessionConfig, WriterSink};
pub use stats::{ServerStats, SessionStats};
pub use stream::{GrowthPolicy, Segment, SegmentRead};
pub use upstream::{HttpUpstream, UpstreamConfig, UpstreamSource};
