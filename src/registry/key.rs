//! Channel naming
//!
//! A channel is identified by the request path with its leading `/`
//! stripped. The same name is appended to the origin base URL upstream.

use super::error::RegistryError;

/// Name of a relayed channel (e.g. `jazz` or `stations/jazz`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelName(String);

impl ChannelName {
    /// Create a channel name, rejecting empty names and dot segments
    pub fn new(name: impl Into<String>) -> Result<Self, RegistryError> {
        let name = name.into();
        let valid = !name.is_empty()
            && name
                .split('/')
                .all(|part| !part.is_empty() && part != "." && part != "..");
        if !valid {
            return Err(RegistryError::InvalidChannelName(name));
        }
        Ok(Self(name))
    }

    /// The name as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ChannelName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ChannelName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
