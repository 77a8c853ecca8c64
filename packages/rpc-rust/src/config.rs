//! Configuration for connections, clients and servers.
//!
//! Plain structs with deployment defaults. The `relay-node` binary fills
//! them from command-line arguments and `RELAY_*` environment variables.

use std::time::Duration;

use relay_core::ContentType;

/// Default receive address of the worker side.
pub const DEFAULT_SERVER_ADDRESS: &str = "rpc_server";
/// Default receive address of the calling side.
pub const DEFAULT_CLIENT_ADDRESS: &str = "rpc_client";

/// Retry policy used when establishing a broker link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectConfig {
    /// Total connect attempts before giving up. Zero is treated as one.
    pub attempts: u32,
    /// Wait between consecutive attempts.
    pub wait: Duration,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            attempts: 10,
            wait: Duration::from_secs(2),
        }
    }
}

/// Settings for the calling side.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Receive address of the counterpart server.
    pub server_address: String,
    /// Receive address this client owns; replies are published here.
    pub client_address: String,
    /// Per-call timeout, also used as the reconnect grace period and the
    /// shutdown drain window.
    pub timeout: Duration,
    /// Codec used for request bodies.
    pub content_type: ContentType,
    pub connect: ConnectConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_address: DEFAULT_SERVER_ADDRESS.to_string(),
            client_address: DEFAULT_CLIENT_ADDRESS.to_string(),
            timeout: Duration::from_secs(2),
            content_type: ContentType::Json,
            connect: ConnectConfig::default(),
        }
    }
}

/// Settings for the worker side.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Receive address this server owns.
    pub address: String,
    /// Maximum number of handlers executing concurrently.
    pub workers: usize,
    /// How long `shutdown()` waits for in-flight handlers.
    pub shutdown_grace: Duration,
    pub connect: ConnectConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_SERVER_ADDRESS.to_string(),
            workers: 24,
            shutdown_grace: Duration::from_secs(5),
            connect: ConnectConfig::default(),
        }
    }
}
