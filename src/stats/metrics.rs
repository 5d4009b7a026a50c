//! Statistics for listener sessions and the server

use std::time::Duration;

/// Listener-level statistics
#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    /// Total bytes written to the listener
    pub bytes_sent: u64,
    /// Number of segment boundaries crossed
    pub segments_crossed: u64,
    /// Number of upstream resumes this listener triggered
    pub resumes_triggered: u64,
    /// Connection duration
    pub duration: Duration,
}

impl SessionStats {
    /// Create new stats tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Average delivery rate in bits per second
    pub fn bitrate(&self) -> u64 {
        let secs = self.duration.as_secs();
        if secs > 0 {
            (self.bytes_sent * 8) / secs
        } else {
            0
        }
    }
}

/// Server-wide statistics
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    /// Total listener connections ever accepted
    pub total_connections: u64,
    /// Currently connected listeners
    pub active_connections: u64,
    /// Connections refused because of the listener limit
    pub rejected_connections: u64,
    /// Channels currently relayed
    pub active_channels: u64,
    /// Uptime
    pub uptime: Duration,
}

impl ServerStats {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_stats_new() {
        let stats = SessionStats::new();
        assert_eq!(stats.bytes_sent, 0);
        assert_eq!(stats.segments_crossed, 0);
        assert_eq!(stats.resumes_triggered, 0);
        assert_eq!(stats.bitrate(), 0);
    }

    #[test]
    fn test_session_stats_bitrate() {
        let stats = SessionStats {
            bytes_sent: 1_000_000,
            duration: Duration::from_secs(10),
            ..Default::default()
        };

        // 1,000,000 bytes * 8 bits / 10 seconds = 800,000 bps
        assert_eq!(stats.bitrate(), 800_000);
    }

    #[test]
    fn test_server_stats_new() {
        let stats = ServerStats::new();
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.rejected_connections, 0);
        assert_eq!(stats.active_channels, 0);
    }
}
