//! Session configuration
//!
//! Everything the engine needs to know about the user and the server is
//! passed in here at construction. Protocol code never reads ambient state.

use crate::crypto::SymmetricKey;
use std::time::Duration;

/// How file chunk payloads travel on the wire
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ChunkPolicy {
    /// Raw bytes, integrity covered by the whole-file checksum only
    #[default]
    Raw,
    /// Each chunk sealed with the sender's own key (checksum still over raw bytes)
    Encrypted,
}

/// Timer durations for every per-concern timer the engine owns
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Timings {
    /// Time allowed between transport-open and handshake completion
    pub handshake_timeout: Duration,
    /// Ping cadence while READY
    pub heartbeat_interval: Duration,
    /// Time allowed for a pong after each ping
    pub pong_deadline: Duration,
    /// Quiet period before a batched key lookup is issued
    pub key_debounce: Duration,
    /// First reconnect delay, doubled per attempt
    pub retry_base_delay: Duration,
    /// Reconnect delay cap
    pub retry_max_delay: Duration,
    /// Automatic reconnects before giving up
    pub max_retries: u32,
    /// Pause between outbound file chunks
    pub chunk_interval: Duration,
    /// Chunk size in bytes
    pub chunk_size: usize,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            pong_deadline: Duration::from_secs(5),
            key_debounce: Duration::from_millis(100),
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(32),
            max_retries: crate::MAX_RETRIES,
            chunk_interval: Duration::from_millis(100),
            chunk_size: crate::CHUNK_SIZE,
        }
    }
}

impl Timings {
    /// Backoff before reconnect attempt number `attempt` (1-based)
    ///
    /// Exponential: base, 2×base, 4×base, ... capped at `retry_max_delay`.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let delay = self.retry_base_delay.saturating_mul(1u32 << shift);
        delay.min(self.retry_max_delay)
    }
}

/// Identity and connection parameters for one logical session
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub server_url: String,
    pub username: String,
    /// Room joined on the first handshake
    pub room: String,
    /// Key used to encrypt everything this user sends
    pub own_key: SymmetricKey,
    pub timings: Timings,
    pub chunk_policy: ChunkPolicy,
}

impl SessionConfig {
    pub fn new(username: impl Into<String>, own_key: SymmetricKey) -> Self {
        Self {
            server_url: crate::DEFAULT_SERVER_URL.to_string(),
            username: username.into(),
            room: crate::DEFAULT_ROOM.to_string(),
            own_key,
            timings: Timings::default(),
            chunk_policy: ChunkPolicy::default(),
        }
    }

    pub fn with_server_url(mut self, url: impl Into<String>) -> Self {
        self.server_url = url.into();
        self
    }

    pub fn with_room(mut self, room: impl Into<String>) -> Self {
        self.room = room.into();
        self
    }

    pub fn with_timings(mut self, timings: Timings) -> Self {
        self.timings = timings;
        self
    }

    pub fn with_chunk_policy(mut self, policy: ChunkPolicy) -> Self {
        self.chunk_policy = policy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay_doubles_and_caps() {
        let t = Timings::default();
        assert_eq!(t.retry_delay(1), Duration::from_secs(1));
        assert_eq!(t.retry_delay(2), Duration::from_secs(2));
        assert_eq!(t.retry_delay(3), Duration::from_secs(4));
        assert_eq!(t.retry_delay(6), Duration::from_secs(32));
        assert_eq!(t.retry_delay(40), Duration::from_secs(32));
    }

    #[test]
    fn test_config_defaults() {
        let cfg = SessionConfig::new("alice", SymmetricKey::from_passphrase("pw"));
        assert_eq!(cfg.room, "general");
        assert_eq!(cfg.timings.chunk_size, 16_384);
        assert_eq!(cfg.timings.max_retries, 5);
        assert_eq!(cfg.chunk_policy, ChunkPolicy::Raw);

        let cfg = cfg.with_room("random").with_server_url("ws://localhost:1");
        assert_eq!(cfg.room, "random");
        assert_eq!(cfg.server_url, "ws://localhost:1");
    }
}
