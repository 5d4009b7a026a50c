//! HTTP relay server
//!
//! Accepts `GET /<channel>` requests and streams the channel to each
//! listener over a long-lived response.

pub mod config;
pub mod listener;

pub use config::ServerConfig;
pub use listener::RelayServer;
