use super::{
    network_to_lower, resolve_addr,
    udp::{UdpConnection, UdpTransport},
    SipConnection, Transport, TransportConfig, TransportEvent, TransportSender, TRANSPORT_UDP,
};
use crate::{message::SipEnvelope, Error, Result};
use std::{
    collections::{BTreeSet, HashMap},
    net::SocketAddr,
    sync::Arc,
};
use tokio::{net::UdpSocket, sync::RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Inbound hook shared by the transport layer and every read loop
///
/// Each registered sender receives every accepted envelope, in registration
/// order. A read loop only waits for the hand-off, never for the handler.
#[derive(Clone, Default)]
pub struct Dispatcher {
    handlers: Arc<RwLock<Vec<TransportSender>>>,
}

impl Dispatcher {
    pub async fn append(&self, handler: TransportSender) {
        self.handlers.write().await.push(handler);
    }

    pub async fn dispatch(&self, msg: SipEnvelope) {
        self.send(TransportEvent::Incoming(msg)).await
    }

    pub async fn closed(&self, key: String) {
        self.send(TransportEvent::Closed(key)).await
    }

    async fn send(&self, event: TransportEvent) {
        for handler in self.handlers.read().await.iter() {
            if let Err(e) = handler.send(event.clone()).await {
                warn!("dispatch to handler failed: {}", e);
            }
        }
    }
}

pub struct TransportLayerInner {
    cancel_token: CancellationToken,
    config: TransportConfig,
    udp: UdpTransport,
    transports: RwLock<HashMap<String, Arc<dyn Transport>>>,
    listen_ports: RwLock<HashMap<String, BTreeSet<u16>>>,
    dispatcher: Dispatcher,
}

/// Protocol agnostic entry point for reading and writing SIP messages
///
/// The layer keeps one [`Transport`] per lowercase network name, binds
/// listeners, forwards every accepted envelope to the registered handlers
/// and routes outbound envelopes by `transport` and `destination`.
///
/// # Examples
///
/// ```rust,no_run
/// use minisip::transport::{TransportConfig, TransportLayer};
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example() -> minisip::Result<()> {
/// let transport_layer = TransportLayer::new(CancellationToken::new(), TransportConfig::default());
/// let (sender, mut receiver) = tokio::sync::mpsc::channel(128);
/// transport_layer.append_handler(sender).await;
/// let addr = transport_layer.listen("udp", "127.0.0.1:5060").await?;
/// println!("listening on {}", addr);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct TransportLayer {
    inner: Arc<TransportLayerInner>,
}

impl TransportLayer {
    pub fn new(cancel_token: CancellationToken, config: TransportConfig) -> Self {
        let dispatcher = Dispatcher::default();
        let udp = UdpTransport::new(
            config.clone(),
            dispatcher.clone(),
            cancel_token.child_token(),
        );
        let mut transports: HashMap<String, Arc<dyn Transport>> = HashMap::new();
        transports.insert(TRANSPORT_UDP.to_string(), Arc::new(udp.clone()));

        TransportLayer {
            inner: Arc::new(TransportLayerInner {
                cancel_token,
                config,
                udp,
                transports: RwLock::new(transports),
                listen_ports: RwLock::new(HashMap::new()),
                dispatcher,
            }),
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    pub fn udp(&self) -> &UdpTransport {
        &self.inner.udp
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.inner.cancel_token
    }

    /// Register `transport` under `name`, replacing any previous one.
    pub async fn register_transport(&self, name: &str, transport: Arc<dyn Transport>) {
        let name = network_to_lower(name);
        info!("register transport {}: {}", name, transport);
        self.inner.transports.write().await.insert(name, transport);
    }

    pub async fn append_handler(&self, handler: TransportSender) {
        self.inner.dispatcher.append(handler).await
    }

    pub async fn dispatch(&self, msg: SipEnvelope) {
        self.inner.dispatcher.dispatch(msg).await
    }

    /// Bind `addr` on `network` and start reading from it
    ///
    /// Only `"udp"` is served; every other network fails with
    /// [`Error::NetworkNotSupported`]. Returns the bound address, which
    /// tells the real port when `addr` asked for port 0.
    pub async fn listen(&self, network: &str, addr: &str) -> Result<SocketAddr> {
        let network = network_to_lower(network);
        match network.as_str() {
            TRANSPORT_UDP => {
                let local = resolve_addr(addr).await?;
                let connection = UdpConnection::bind(local, &self.inner.config).await?;
                self.serve_connection(connection).await
            }
            _ => Err(Error::NetworkNotSupported(network)),
        }
    }

    /// Serve an already bound UDP socket.
    pub async fn serve_udp(&self, socket: UdpSocket) -> Result<SocketAddr> {
        let connection = UdpConnection::from_socket(socket, &self.inner.config)?;
        self.serve_connection(connection).await
    }

    async fn serve_connection(&self, connection: UdpConnection) -> Result<SocketAddr> {
        let local = connection.local_addr();
        self.add_listen_port(TRANSPORT_UDP, local.port()).await;
        self.inner.udp.serve(connection).await;
        Ok(local)
    }

    pub(crate) async fn add_listen_port(&self, network: &str, port: u16) {
        self.inner
            .listen_ports
            .write()
            .await
            .entry(network.to_string())
            .or_default()
            .insert(port);
    }

    pub async fn listen_ports(&self, network: &str) -> Vec<u16> {
        self.inner
            .listen_ports
            .read()
            .await
            .get(&network_to_lower(network))
            .map(|ports| ports.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Send `msg` over `msg.transport` to `msg.destination`.
    pub async fn write(&self, msg: &SipEnvelope) -> Result<()> {
        self.write_to(msg, &msg.destination, &msg.transport).await
    }

    pub async fn write_to(&self, msg: &SipEnvelope, addr: &str, network: &str) -> Result<()> {
        let connection = self.get_connection(network, addr).await?;
        debug!("write {} via {}", msg, connection);
        connection.send(msg).await
    }

    /// Existing or newly created connection reaching `addr` over `network`.
    pub async fn get_connection(&self, network: &str, addr: &str) -> Result<SipConnection> {
        let network = network_to_lower(network);
        let transport = self
            .inner
            .transports
            .read()
            .await
            .get(&network)
            .cloned()
            .ok_or_else(|| Error::TransportNotSupported(network.clone()))?;

        transport
            .get_connection(addr)
            .await?
            .ok_or_else(|| Error::ConnectionNotExist(addr.to_string()))
    }

    /// Close every transport. The last failure, if any, is returned.
    pub async fn close(&self) -> Result<()> {
        let transports: Vec<_> = self
            .inner
            .transports
            .read()
            .await
            .values()
            .cloned()
            .collect();
        let mut result = Ok(());
        for transport in transports {
            if let Err(e) = transport.close().await {
                warn!("close {} failed: {}", transport, e);
                result = Err(e);
            }
        }
        self.inner.cancel_token.cancel();
        result
    }
}
