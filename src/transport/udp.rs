use super::{
    connection::{is_keepalive, is_noise},
    resolve_addr, ConnectionPool, Dispatcher, SipConnection, Transport, TransportConfig,
    TRANSPORT_BUFFER_SIZE, TRANSPORT_UDP,
};
use crate::{message::SipEnvelope, Error, Result};
use async_trait::async_trait;
use std::{fmt, net::SocketAddr, sync::Arc};
use tokio::{net::UdpSocket, select, sync::RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

struct UdpConnectionInner {
    conn: UdpSocket,
    local: SocketAddr,
    remote: Option<SocketAddr>,
    max_message_size: usize,
    debug: bool,
}

/// A UDP socket able to send SIP messages
///
/// A listening connection is shared by every peer and reads with
/// `recv_from`. A connected connection talks to a single remote address.
#[derive(Clone)]
pub struct UdpConnection {
    inner: Arc<UdpConnectionInner>,
}

impl UdpConnection {
    pub async fn bind(local: SocketAddr, config: &TransportConfig) -> Result<Self> {
        let conn = UdpSocket::bind(local).await?;
        Self::from_socket(conn, config)
    }

    pub fn from_socket(conn: UdpSocket, config: &TransportConfig) -> Result<Self> {
        let local = conn.local_addr()?;
        let remote = conn.peer_addr().ok();
        let connection = UdpConnection {
            inner: Arc::new(UdpConnectionInner {
                conn,
                local,
                remote,
                max_message_size: config.max_message_size(),
                debug: config.debug,
            }),
        };
        info!("created UDP connection: {}", connection);
        Ok(connection)
    }

    /// Open a socket on an ephemeral port connected to `remote`.
    pub async fn connect(remote: SocketAddr, config: &TransportConfig) -> Result<Self> {
        let local: SocketAddr = if remote.is_ipv4() {
            "0.0.0.0:0".parse()?
        } else {
            "[::]:0".parse()?
        };
        let conn = UdpSocket::bind(local).await?;
        conn.connect(remote).await?;
        Self::from_socket(conn, config)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.remote
    }

    pub async fn recv_raw(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        let (len, addr) = match self.inner.remote {
            Some(remote) => (self.inner.conn.recv(buf).await?, remote),
            None => self.inner.conn.recv_from(buf).await?,
        };
        if self.inner.debug {
            debug!(
                "UDP read {} <- {}:\n{}",
                self.inner.local,
                addr,
                String::from_utf8_lossy(&buf[..len])
            );
        }
        Ok((len, addr))
    }

    pub async fn send_raw(&self, buf: &[u8], target: SocketAddr) -> std::io::Result<usize> {
        let written = match self.inner.remote {
            Some(_) => self.inner.conn.send(buf).await?,
            None => self.inner.conn.send_to(buf, target).await?,
        };
        if self.inner.debug {
            debug!(
                "UDP write {} -> {}:\n{}",
                self.inner.local,
                target,
                String::from_utf8_lossy(buf)
            );
        }
        Ok(written)
    }

    #[instrument(skip(self, msg), fields(addr = %self.inner.local, destination = %msg.destination))]
    pub async fn send(&self, msg: &SipEnvelope) -> Result<()> {
        let data = msg.to_bytes();
        if data.len() > self.inner.max_message_size {
            return Err(Error::MtuCongestion {
                size: data.len(),
                limit: self.inner.max_message_size,
            });
        }

        let target = resolve_addr(&msg.destination).await?;
        trace!("sending {} -> {}", data.len(), target);

        let written = self.send_raw(&data, target).await.map_err(|e| {
            Error::TransportLayerError(e.to_string(), self.inner.local.to_string())
        })?;
        if written == 0 || written != data.len() {
            return Err(Error::ShortWrite {
                written,
                expected: data.len(),
            });
        }
        Ok(())
    }
}

impl PartialEq for UdpConnection {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Display for UdpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.remote {
            Some(remote) => write!(f, "{} -> {}", self.inner.local, remote),
            None => write!(f, "{}", self.inner.local),
        }
    }
}

impl fmt::Debug for UdpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Turn one datagram into an envelope
///
/// Returns `None` for anything that must not reach the dispatch hook:
/// zero padding, CRLF keep-alives, text the codec rejects, a missing Via,
/// or a Via naming another network than `network`.
pub fn parse_datagram(
    data: &[u8],
    network: &str,
    source: SocketAddr,
    local: SocketAddr,
) -> Option<SipEnvelope> {
    if is_noise(data) {
        return None;
    }
    if is_keepalive(data) {
        trace!("keep alive CRLF received from {}", source);
        return None;
    }

    let undecoded = match std::str::from_utf8(data) {
        Ok(s) => s,
        Err(e) => {
            debug!("decoding text from: {} error: {}", source, e);
            return None;
        }
    };

    let envelope =
        match SipEnvelope::parse(undecoded, network, source.to_string(), local.to_string()) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!("failed to parse from: {} error: {}", source, e);
                return None;
            }
        };

    if envelope.via().is_none() {
        warn!("invalid SIP from {}: \"Via\" header field is mandatory", source);
        return None;
    }
    match envelope.via_transport() {
        Some(transport) if transport == network => Some(envelope),
        transport => {
            debug!("transport mismatch from {}: {:?}", source, transport);
            None
        }
    }
}

struct UdpTransportInner {
    config: TransportConfig,
    dispatcher: Dispatcher,
    pool: ConnectionPool,
    shared: RwLock<Option<UdpConnection>>,
    cancel_token: CancellationToken,
}

/// UDP transport
///
/// With a single listening socket every reply leaves through that socket.
/// Once more sockets are served the transport looks peers up in its pool
/// and opens a connected socket for a peer it has not talked to yet.
#[derive(Clone)]
pub struct UdpTransport {
    inner: Arc<UdpTransportInner>,
}

impl UdpTransport {
    pub fn new(
        config: TransportConfig,
        dispatcher: Dispatcher,
        cancel_token: CancellationToken,
    ) -> Self {
        UdpTransport {
            inner: Arc::new(UdpTransportInner {
                config,
                dispatcher,
                pool: ConnectionPool::new(),
                shared: RwLock::new(None),
                cancel_token,
            }),
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.inner.pool
    }

    /// Start reading from a listening connection.
    pub async fn serve(&self, connection: UdpConnection) {
        debug!("begin listening on {} {}", TRANSPORT_UDP, connection);
        let key = connection.local_addr().to_string();
        {
            let mut shared = self.inner.shared.write().await;
            if self.inner.pool.size().await == 0 {
                *shared = Some(connection.clone());
            } else {
                *shared = None;
            }
            self.inner
                .pool
                .add(key.clone(), connection.clone().into())
                .await;
        }
        self.spawn_serve_loop(connection, key);
    }

    fn spawn_serve_loop(&self, connection: UdpConnection, key: String) {
        let transport = self.clone();
        let token = self.inner.cancel_token.child_token();
        tokio::spawn(async move {
            select! {
                _ = token.cancelled() => {}
                r = transport.serve_loop(&connection) => {
                    if let Err(e) = r {
                        warn!("udp read error on {}: {}", connection, e);
                    }
                }
            }
            transport
                .inner
                .pool
                .remove_if_same(&key, &connection.clone().into())
                .await;
            {
                let mut shared = transport.inner.shared.write().await;
                if shared.as_ref() == Some(&connection) {
                    *shared = None;
                }
            }
            warn!("udp serve_loop exited: {}", connection);
            transport.inner.dispatcher.closed(key).await;
        });
    }

    async fn serve_loop(&self, connection: &UdpConnection) -> Result<()> {
        let mut buf = vec![0u8; TRANSPORT_BUFFER_SIZE];
        loop {
            let (len, addr) = connection.recv_raw(&mut buf).await?;
            let envelope =
                match parse_datagram(&buf[..len], TRANSPORT_UDP, addr, connection.local_addr()) {
                    Some(envelope) => envelope,
                    None => continue,
                };
            debug!("received {} {} -> {}", len, addr, connection.local_addr());
            self.inner.dispatcher.dispatch(envelope).await;
        }
    }

    async fn connect(&self, addr: &str) -> Result<SipConnection> {
        let remote = resolve_addr(addr).await?;
        let connection = UdpConnection::connect(remote, &self.inner.config).await?;
        let sip_connection: SipConnection = connection.clone().into();
        let pooled = self
            .inner
            .pool
            .add_if_absent(addr.to_string(), sip_connection.clone())
            .await;
        if pooled != sip_connection {
            // another caller connected to the same peer first
            debug!("dropping duplicate udp connection {}", connection);
            return Ok(pooled);
        }
        self.spawn_serve_loop(connection, addr.to_string());
        Ok(sip_connection)
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn network(&self) -> &str {
        TRANSPORT_UDP
    }

    async fn get_connection(&self, addr: &str) -> Result<Option<SipConnection>> {
        if let Some(shared) = self.inner.shared.read().await.as_ref() {
            return Ok(Some(shared.clone().into()));
        }
        if let Some(connection) = self.inner.pool.get(addr).await {
            return Ok(Some(connection));
        }
        self.connect(addr).await.map(Some)
    }

    async fn close(&self) -> Result<()> {
        self.inner.cancel_token.cancel();
        self.inner.shared.write().await.take();
        for (addr, _) in self.inner.pool.drain().await {
            debug!("closing udp connection {}", addr);
        }
        Ok(())
    }
}

impl fmt::Display for UdpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transport<UDP>")
    }
}

impl fmt::Debug for UdpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
