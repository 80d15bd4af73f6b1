//! Server configuration.

use std::path::PathBuf;

/// Smallest accepted outbound queue; the handshake alone queues three frames.
pub const MIN_OUTBOUND_CAPACITY: usize = 4;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Frames buffered per connection before it counts as a failed recipient
    pub outbound_capacity: usize,
    /// WebSocket ping interval in seconds (0 disables)
    pub heartbeat_interval_secs: u64,
    /// RocksDB directory (None = in-memory stores)
    pub storage_path: Option<PathBuf>,
    /// Persist after every merged update, not only when a document goes idle
    pub persist_on_update: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            outbound_capacity: 256,
            heartbeat_interval_secs: 30,
            storage_path: None,
            persist_on_update: true,
        }
    }
}

impl ServerConfig {
    /// Ephemeral port, in-memory stores, no heartbeat.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            outbound_capacity: 64,
            heartbeat_interval_secs: 0,
            storage_path: None,
            persist_on_update: true,
        }
    }

    /// Outbound capacity with the floor applied.
    pub fn effective_outbound_capacity(&self) -> usize {
        self.outbound_capacity.max(MIN_OUTBOUND_CAPACITY)
    }
}
