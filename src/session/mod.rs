//! Listener sessions
//!
//! One session per downstream connection. A session walks the channel's
//! stream chain from its join point toward the head, writing every byte to
//! its sink, and triggers the upstream resume when it reaches a broken
//! segment.

pub mod listener;
pub mod sink;
pub mod state;

pub use listener::{ListenerSession, SessionConfig};
pub use sink::{ChannelSink, ListenerSink, WriterSink};
pub use state::{CloseReason, ListenerPhase};
