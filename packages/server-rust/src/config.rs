//! Server-level configuration for the broker engine.

use std::time::Duration;

use courier_core::codec::DEFAULT_CODEC;

/// Broker configuration with production defaults.
///
/// The address fields are bind strings consumed by whichever socket servers
/// are attached; the broker itself never opens sockets.
/// `max_bytes_per_file`, `sync_every`, `sync_timeout`, and `mem_queue_size`
/// are hints for storage backends; the in-memory backend ignores them.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP bind address.
    pub tcp_address: String,
    /// UDP bind address (stateless transport).
    pub udp_address: String,
    /// HTTP bind address.
    pub http_address: String,
    /// HTTPS bind address.
    pub https_address: String,
    /// Longest silence tolerated on a connection, and the handshake
    /// deadline for the first packet.
    pub max_heartbeat_interval: Duration,
    /// Upper bound on a single message payload in bytes.
    pub max_msg_size: u32,
    /// Storage hint: maximum size of one data file in bytes.
    pub max_bytes_per_file: u64,
    /// Storage hint: sync after this many messages.
    pub sync_every: u64,
    /// Storage hint: sync at least this often.
    pub sync_timeout: Duration,
    /// Storage hint: how many messages a memory queue may buffer.
    pub mem_queue_size: usize,
    /// Reserved for in-flight redelivery; not consumed by the current
    /// delivery loop.
    pub msg_timeout: Duration,
    /// Default tracing directive when `RUST_LOG` is unset.
    pub log_level: String,
    /// Name of the wire codec to register, resolved at broker construction.
    pub codec: String,
    /// Enables test-only affordances in attached servers.
    pub test_on: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tcp_address: "0.0.0.0:6666".to_string(),
            udp_address: "0.0.0.0:5555".to_string(),
            http_address: "0.0.0.0:4444".to_string(),
            https_address: "0.0.0.0:4433".to_string(),
            max_heartbeat_interval: Duration::from_secs(60),
            max_msg_size: 1024 * 1024,
            max_bytes_per_file: 100 * 1024 * 1024,
            sync_every: 2500,
            sync_timeout: Duration::from_secs(2),
            mem_queue_size: 10_000,
            msg_timeout: Duration::from_secs(60),
            log_level: "info".to_string(),
            codec: DEFAULT_CODEC.to_string(),
            test_on: false,
        }
    }
}
