//! Upstream side of the relay
//!
//! - `UpstreamSource`: how channel bytes are obtained from the origin
//! - `HttpUpstream`: reqwest-based origin client with range resume
//! - `Fetcher`: per-channel task appending origin bytes to the chain

pub mod config;
pub mod fetcher;
#[cfg(test)]
pub(crate) mod mock;
pub mod source;

pub use config::UpstreamConfig;
pub use fetcher::{Fetcher, FetcherState};
pub use source::{HttpUpstream, UpstreamBody, UpstreamSource};
