use super::{create_test_request, wait_for_event};
use crate::{
    message::SipEnvelope,
    transport::{SipConnection, Transport, TransportConfig, TransportEvent, TransportLayer},
    Error, Result,
};
use async_trait::async_trait;
use std::{fmt, sync::Arc, time::Duration};
use tokio::{net::UdpSocket, sync::mpsc, time::timeout};
use tokio_util::sync::CancellationToken;

/// A transport that never has a connection to offer.
struct NoRoute {
    name: &'static str,
    fail_close: bool,
}

#[async_trait]
impl Transport for NoRoute {
    fn network(&self) -> &str {
        self.name
    }

    async fn get_connection(&self, _addr: &str) -> Result<Option<SipConnection>> {
        Ok(None)
    }

    async fn close(&self) -> Result<()> {
        if self.fail_close {
            return Err(Error::Error(format!("{} refused to close", self.name)));
        }
        Ok(())
    }
}

impl fmt::Display for NoRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transport<{}>", self.name)
    }
}

fn outbound(transport: &str, destination: &str) -> Result<SipEnvelope> {
    let raw = create_test_request("OPTIONS", Some("SIP/2.0/UDP"), "outbound");
    Ok(SipEnvelope::new(
        rsip::SipMessage::try_from(raw.as_str())?,
        transport,
        "127.0.0.1:5060".to_string(),
        destination.to_string(),
    ))
}

#[tokio::test]
async fn test_listen_unsupported_network() -> Result<()> {
    let transport_layer = TransportLayer::new(CancellationToken::new(), TransportConfig::default());

    match transport_layer.listen("tcp", "127.0.0.1:0").await {
        Err(Error::NetworkNotSupported(network)) => assert_eq!(network, "tcp"),
        r => panic!("expected NetworkNotSupported, got {:?}", r),
    }
    match transport_layer.listen("SCTP", "127.0.0.1:0").await {
        Err(Error::NetworkNotSupported(network)) => assert_eq!(network, "sctp"),
        r => panic!("expected NetworkNotSupported, got {:?}", r),
    }
    assert!(transport_layer.listen_ports("tcp").await.is_empty());

    assert!(transport_layer.listen("udp", "not-an-address").await.is_err());
    assert!(transport_layer.listen_ports("udp").await.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_listen_port_bookkeeping() -> Result<()> {
    let transport_layer = TransportLayer::new(CancellationToken::new(), TransportConfig::default());
    let addr = transport_layer.listen("UDP", "127.0.0.1:0").await?;
    assert_eq!(transport_layer.listen_ports("udp").await, vec![addr.port()]);

    transport_layer.add_listen_port("udp", addr.port()).await;
    transport_layer.add_listen_port("udp", addr.port()).await;
    assert_eq!(transport_layer.listen_ports("udp").await, vec![addr.port()]);

    transport_layer.add_listen_port("udp", 1).await;
    assert_eq!(transport_layer.listen_ports("udp").await.len(), 2);
    transport_layer.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_write_routing_errors() -> Result<()> {
    let transport_layer = TransportLayer::new(CancellationToken::new(), TransportConfig::default());

    match transport_layer.write(&outbound("tcp", "127.0.0.1:5070")?).await {
        Err(Error::TransportNotSupported(network)) => assert_eq!(network, "tcp"),
        r => panic!("expected TransportNotSupported, got {:?}", r),
    }

    transport_layer
        .register_transport(
            "TCP",
            Arc::new(NoRoute {
                name: "tcp",
                fail_close: false,
            }),
        )
        .await;
    match transport_layer.write(&outbound("tcp", "127.0.0.1:5070")?).await {
        Err(Error::ConnectionNotExist(addr)) => assert_eq!(addr, "127.0.0.1:5070"),
        r => panic!("expected ConnectionNotExist, got {:?}", r),
    }
    Ok(())
}

#[tokio::test]
async fn test_register_transport_last_writer_wins() -> Result<()> {
    let transport_layer = TransportLayer::new(CancellationToken::new(), TransportConfig::default());
    let peer = UdpSocket::bind("127.0.0.1:0").await?;
    let peer_addr = peer.local_addr()?.to_string();

    transport_layer.listen("udp", "127.0.0.1:0").await?;
    transport_layer.write(&outbound("udp", &peer_addr)?).await?;
    let mut buf = [0u8; 2048];
    timeout(Duration::from_secs(1), peer.recv_from(&mut buf))
        .await
        .expect("datagram")?;

    transport_layer
        .register_transport(
            "udp",
            Arc::new(NoRoute {
                name: "udp",
                fail_close: false,
            }),
        )
        .await;
    match transport_layer.write(&outbound("udp", &peer_addr)?).await {
        Err(Error::ConnectionNotExist(_)) => {}
        r => panic!("expected ConnectionNotExist, got {:?}", r),
    }
    transport_layer.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_close_surfaces_failure() -> Result<()> {
    let transport_layer = TransportLayer::new(CancellationToken::new(), TransportConfig::default());
    transport_layer
        .register_transport(
            "ws",
            Arc::new(NoRoute {
                name: "ws",
                fail_close: true,
            }),
        )
        .await;
    assert!(transport_layer.close().await.is_err());
    assert!(transport_layer.cancel_token().is_cancelled());
    Ok(())
}

#[tokio::test]
async fn test_dispatch_reaches_every_handler() -> Result<()> {
    let transport_layer = TransportLayer::new(CancellationToken::new(), TransportConfig::default());
    let (first, mut first_rx) = mpsc::channel(4);
    let (second, mut second_rx) = mpsc::channel(4);
    transport_layer.append_handler(first).await;
    transport_layer.append_handler(second).await;

    transport_layer
        .dispatch(outbound("udp", "127.0.0.1:5070")?)
        .await;
    for receiver in [&mut first_rx, &mut second_rx] {
        match wait_for_event(receiver).await? {
            TransportEvent::Incoming(msg) => assert_eq!(msg.destination, "127.0.0.1:5070"),
            event => panic!("unexpected event: {:?}", event),
        }
    }
    Ok(())
}

#[tokio::test]
async fn test_close_ends_read_loops() -> Result<()> {
    let transport_layer = TransportLayer::new(CancellationToken::new(), TransportConfig::default());
    let (sender, mut receiver) = mpsc::channel(4);
    transport_layer.append_handler(sender).await;
    let addr = transport_layer.listen("udp", "127.0.0.1:0").await?;

    transport_layer.close().await?;
    match wait_for_event(&mut receiver).await? {
        TransportEvent::Closed(key) => assert_eq!(key, addr.to_string()),
        event => panic!("unexpected event: {:?}", event),
    }
    assert_eq!(transport_layer.udp().pool().size().await, 0);
    Ok(())
}
