//! Realtime sync engine for the RatChat client.
//!
//! Keeps one logical chat session alive over an unreliable WebSocket:
//! connection lifecycle with heartbeat and bounded reconnects, a debounced
//! key cache for per-sender decryption, room switching with history replay,
//! and chunked file transfer with checksum verification.
//!
//! The protocol core (`connection`, `key_cache`, `session`, `transfer`,
//! `engine`) is sans-IO: it is driven by transport events and `tick(now)`
//! calls and talks to the outside world only through the [`Transport`] and
//! [`KeyDirectory`] seams. [`client`] wires it to tokio and real sockets.

/// Default server used by the terminal client
pub const DEFAULT_SERVER_URL: &str = "wss://rat-chat-server-production.up.railway.app";

/// Room every session starts in, and the one that can never be deleted
pub const DEFAULT_ROOM: &str = "general";

/// File chunk size on the wire (16KB)
pub const CHUNK_SIZE: usize = 16_384;

/// Automatic reconnects allowed before the connection is declared failed
pub const MAX_RETRIES: u32 = 5;

pub mod client;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod key_cache;
pub mod protocol;
pub mod session;
pub mod transfer;
pub mod types;

pub use client::{ResolveKeys, StaticKeys, SyncClient};
pub use config::{ChunkPolicy, SessionConfig, Timings};
pub use connection::{ConnectionId, ConnectionState, Transport};
pub use crypto::{Checksum, SymmetricKey};
pub use engine::{SyncEngine, SyncEvent};
pub use error::{Result, SyncError};
pub use key_cache::{BatchId, KeyDirectory};
pub use types::*;
