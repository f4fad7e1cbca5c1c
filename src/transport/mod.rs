use crate::{Error, Result};
use async_trait::async_trait;
use std::{fmt, net::SocketAddr};

pub mod connection;
pub mod pool;
pub mod transport_layer;
pub mod udp;
pub use connection::{SipConnection, TransportEvent, TransportReceiver, TransportSender};
pub use pool::ConnectionPool;
pub use transport_layer::{Dispatcher, TransportLayer};
#[cfg(test)]
mod tests;

pub const TRANSPORT_UDP: &str = "udp";
pub const TRANSPORT_TCP: &str = "tcp";
pub const TRANSPORT_TLS: &str = "tls";
pub const TRANSPORT_WS: &str = "ws";

/// Largest UDP payload, used as the receive buffer size.
pub const TRANSPORT_BUFFER_SIZE: usize = 65535;
pub const DEFAULT_MTU: usize = 1500;
/// Bytes of the MTU kept free for IP/UDP headers and fragmentation slack.
pub const MTU_RESERVED: usize = 200;

/// Network specific transport
///
/// A transport owns sockets for one network protocol and hands out
/// connections able to reach a given peer. The transport layer keeps one
/// transport per lowercase network name.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Display {
    /// Lowercase network name, e.g. `"udp"`.
    fn network(&self) -> &str;

    /// Connection for `addr`, `None` when the transport has none to offer.
    async fn get_connection(&self, addr: &str) -> Result<Option<SipConnection>>;

    async fn close(&self) -> Result<()>;
}

/// Options shared by every socket a transport opens.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub mtu: usize,
    /// Log every datagram read and written at debug level.
    pub debug: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            mtu: DEFAULT_MTU,
            debug: false,
        }
    }
}

impl TransportConfig {
    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Largest serialized message a datagram may carry.
    pub fn max_message_size(&self) -> usize {
        self.mtu.saturating_sub(MTU_RESERVED)
    }
}

/// Fast path for the common spellings, ASCII lowercase otherwise.
pub fn network_to_lower(network: &str) -> String {
    match network {
        "UDP" => TRANSPORT_UDP.to_string(),
        "TCP" => TRANSPORT_TCP.to_string(),
        "TLS" => TRANSPORT_TLS.to_string(),
        "WS" => TRANSPORT_WS.to_string(),
        other => other.to_ascii_lowercase(),
    }
}

/// Resolve `host:port` to the first socket address it names.
pub async fn resolve_addr(addr: &str) -> Result<SocketAddr> {
    if let Ok(addr) = addr.parse() {
        return Ok(addr);
    }
    tokio::net::lookup_host(addr)
        .await
        .map_err(|e| Error::AddrResolve(format!("{}: {}", addr, e)))?
        .next()
        .ok_or_else(|| Error::AddrResolve(addr.to_string()))
}

#[cfg(test)]
mod config_tests {
    use super::*;

    #[test]
    fn test_network_to_lower() {
        assert_eq!(network_to_lower("UDP"), "udp");
        assert_eq!(network_to_lower("Tcp"), "tcp");
        assert_eq!(network_to_lower("wss"), "wss");
    }

    #[test]
    fn test_max_message_size() {
        assert_eq!(TransportConfig::default().max_message_size(), 1300);
        assert_eq!(TransportConfig::default().with_mtu(100).max_message_size(), 0);
    }

    #[tokio::test]
    async fn test_resolve_addr() {
        let addr = resolve_addr("127.0.0.1:5060").await.expect("resolve");
        assert_eq!(addr.port(), 5060);
        assert!(resolve_addr("not an address").await.is_err());
    }
}
