//! Channel registry for relay routing
//!
//! The registry maps channel names to live channels. Each channel owns a
//! stream chain that one upstream fetcher appends to and any number of
//! listener sessions read from.
//!
//! # Architecture
//!
//! ```text
//!                       Arc<ChannelRegistry>
//!                  ┌──────────────────────────┐
//!                  │ channels: HashMap<Name,  │
//!                  │   Channel {              │
//!                  │     chain: [S1, S2, S3], │
//!                  │     listeners,           │
//!                  │   }                      │
//!                  │ >                        │
//!                  └────────────┬─────────────┘
//!                               │
//!       ┌───────────────────────┼───────────────────────┐
//!       │                       │                       │
//!       ▼                       ▼                       ▼
//!   [Fetcher]              [Listener]              [Listener]
//!   append() → S3          read(S1, off)           read(S3, off)
//!       │                       │                       │
//!    origin ──► chain ──► sink.write() ──► HTTP response body
//! ```
//!
//! # Reference counting
//!
//! A segment carries one reference per listener positioned on it. Finished
//! segments whose count drops to zero are reclaimed from the old end of the
//! chain. A channel is removed when its listener count reaches zero.

pub mod config;
pub mod entry;
pub mod error;
pub mod key;
pub mod store;

pub use config::{JoinMode, RegistryConfig};
pub use entry::{Channel, ChannelStats, ChannelStatus};
pub use error::RegistryError;
pub use key::ChannelName;
pub use store::ChannelRegistry;
