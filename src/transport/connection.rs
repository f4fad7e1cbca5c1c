use super::udp::UdpConnection;
use crate::{message::SipEnvelope, Result};
use std::{fmt, net::SocketAddr};
use tokio::sync::mpsc::{Receiver, Sender};

#[derive(Clone, Debug)]
pub enum TransportEvent {
    Incoming(SipEnvelope),
    /// A read loop ended; carries the key of the connection that went away.
    Closed(String),
}

pub type TransportReceiver = Receiver<TransportEvent>;
pub type TransportSender = Sender<TransportEvent>;

pub const KEEPALIVE_REQUEST: &[u8] = b"\r\n\r\n";
pub const KEEPALIVE_RESPONSE: &[u8] = b"\r\n";

/// One or two CRLF used to keep a NAT binding open.
pub fn is_keepalive(data: &[u8]) -> bool {
    data.len() <= KEEPALIVE_REQUEST.len() && data.iter().all(|b| *b == b'\r' || *b == b'\n')
}

/// Zero padding only, nothing to parse.
pub fn is_noise(data: &[u8]) -> bool {
    data.iter().all(|b| *b == 0)
}

#[derive(Clone, Debug, PartialEq)]
pub enum SipConnection {
    Udp(UdpConnection),
}

impl SipConnection {
    pub fn is_reliable(&self) -> bool {
        match self {
            SipConnection::Udp(_) => false,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        match self {
            SipConnection::Udp(connection) => connection.local_addr(),
        }
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        match self {
            SipConnection::Udp(connection) => connection.remote_addr(),
        }
    }

    /// Serialize `msg` and send it to `msg.destination`.
    pub async fn send(&self, msg: &SipEnvelope) -> Result<()> {
        match self {
            SipConnection::Udp(connection) => connection.send(msg).await,
        }
    }
}

impl fmt::Display for SipConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SipConnection::Udp(t) => write!(f, "UDP {}", t),
        }
    }
}

impl From<UdpConnection> for SipConnection {
    fn from(connection: UdpConnection) -> Self {
        SipConnection::Udp(connection)
    }
}
