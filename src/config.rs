//! Session configuration.

use std::time::Duration;

use crate::error::SessionError;
use crate::flow_control::DEFAULT_WINDOW_SIZE;

/// Tuning knobs for one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Seed for the local stream-id allocator. `None` uses the role default
    /// (1 for clients, 2 for servers); an explicit seed supports transports
    /// where earlier ids are already spoken for.
    pub initial_stream_id: Option<u32>,
    /// Maximum concurrently open locally-initiated streams. -1 = unbounded.
    /// Overwritten when the peer sends SETTINGS_MAX_CONCURRENT_STREAMS.
    pub max_local_streams: i32,
    /// Maximum concurrently open remotely-initiated streams. -1 = unbounded.
    pub max_remote_streams: i32,
    /// Idle timeout applied to each stream at creation.
    pub stream_idle_timeout: Duration,
    /// Bytes aggregated per endpoint write before the flusher flushes.
    pub write_threshold: usize,
    /// Initial session receive window advertised to the peer.
    pub initial_session_recv_window: i32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            initial_stream_id: None,
            max_local_streams: -1,
            max_remote_streams: -1,
            stream_idle_timeout: Duration::from_secs(30),
            write_threshold: 32 * 1024,
            initial_session_recv_window: DEFAULT_WINDOW_SIZE,
        }
    }
}

impl SessionConfig {
    /// Validate configuration values. Returns an error if any value is out
    /// of range.
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.write_threshold == 0 {
            return Err(SessionError::InvalidArgument(
                "write_threshold must be > 0",
            ));
        }
        if self.initial_session_recv_window < 0 {
            return Err(SessionError::InvalidArgument(
                "initial_session_recv_window must be >= 0",
            ));
        }
        Ok(())
    }
}
