//! Upstream configuration

use std::time::Duration;

/// Default origin base URL
pub const DEFAULT_ORIGIN: &str = "http://localhost:8000/";

/// Configuration for fetching channels from the origin
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Base URL; the channel name is appended to it
    pub origin: String,

    /// Timeout for establishing the upstream connection
    pub connect_timeout: Duration,

    /// Delay before the second resume attempt in a row
    pub resume_backoff_initial: Duration,

    /// Upper bound for the resume delay
    pub resume_backoff_max: Duration,

    /// Give up on a channel after this many resumes without progress
    /// (None = keep trying while listeners remain)
    pub max_resume_attempts: Option<u32>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            origin: DEFAULT_ORIGIN.to_string(),
            connect_timeout: Duration::from_secs(10),
            resume_backoff_initial: Duration::from_millis(250),
            resume_backoff_max: Duration::from_secs(10),
            max_resume_attempts: None,
        }
    }
}

impl UpstreamConfig {
    /// Create a config for the given origin
    pub fn with_origin(origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            ..Default::default()
        }
    }

    /// Set the origin base URL
    pub fn origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }

    /// Set connect timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set resume backoff bounds
    pub fn resume_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.resume_backoff_initial = initial;
        self.resume_backoff_max = max.max(initial);
        self
    }

    /// Cap consecutive resume attempts
    pub fn max_resume_attempts(mut self, attempts: u32) -> Self {
        self.max_resume_attempts = Some(attempts);
        self
    }

    /// Delay before resume attempt number `attempt` (1-based)
    ///
    /// The first attempt is immediate; later ones back off exponentially
    /// up to `resume_backoff_max`.
    pub fn resume_delay(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempt - 2).unwrap_or(u32::MAX);
        self.resume_backoff_initial
            .saturating_mul(factor)
            .min(self.resume_backoff_max)
    }
}
