//! Registry configuration

use crate::stream::GrowthPolicy;

/// Where a newly attached listener starts reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JoinMode {
    /// Replay from the oldest retained segment, offset 0
    #[default]
    FullCatchUp,
    /// Start of the newest segment (current track from its beginning)
    TrackStart,
    /// Current end of the newest segment (live bytes only)
    LiveEdge,
}

/// Configuration for the channel registry
#[derive(Debug, Clone, Default)]
pub struct RegistryConfig {
    /// Allocation policy for every segment
    pub growth: GrowthPolicy,
    /// Catch-up behavior for new listeners
    pub join_mode: JoinMode,
}

impl RegistryConfig {
    /// Set the segment growth policy
    pub fn growth(mut self, growth: GrowthPolicy) -> Self {
        self.growth = growth;
        self
    }

    /// Set the join mode
    pub fn join_mode(mut self, mode: JoinMode) -> Self {
        self.join_mode = mode;
        self
    }
}
