//! Segment buffering for relayed streams
//!
//! - `Segment`: append-only block storage for one track
//! - `StreamChain`: per-channel history of segments with listener counts

pub mod chain;
pub mod segment;

pub use chain::StreamChain;
pub use segment::{GrowthPolicy, Segment, SegmentError, SegmentRead};
