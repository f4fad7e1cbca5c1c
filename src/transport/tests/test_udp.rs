use super::{assert_no_event, create_test_request, wait_for_event};
use crate::{
    message::{RequestMethod, SipEnvelope},
    transport::{
        connection::{KEEPALIVE_REQUEST, KEEPALIVE_RESPONSE},
        udp::{parse_datagram, UdpConnection},
        SipConnection, Transport, TransportConfig, TransportEvent, TransportLayer,
    },
    Error, Result,
};
use std::{collections::HashSet, net::SocketAddr, time::Duration};
use tokio::{net::UdpSocket, sync::mpsc, time::timeout};
use tokio_util::sync::CancellationToken;

async fn start_layer() -> Result<(TransportLayer, SocketAddr, crate::transport::TransportReceiver)> {
    let transport_layer = TransportLayer::new(CancellationToken::new(), TransportConfig::default());
    let (sender, receiver) = mpsc::channel(16);
    transport_layer.append_handler(sender).await;
    let addr = transport_layer.listen("udp", "127.0.0.1:0").await?;
    Ok((transport_layer, addr, receiver))
}

#[test]
fn test_parse_datagram_filters() {
    let source: SocketAddr = "127.0.0.1:5061".parse().unwrap();
    let local: SocketAddr = "127.0.0.1:5060".parse().unwrap();

    assert!(parse_datagram(&[0u8; 32], "udp", source, local).is_none());
    assert!(parse_datagram(KEEPALIVE_RESPONSE, "udp", source, local).is_none());
    assert!(parse_datagram(KEEPALIVE_REQUEST, "udp", source, local).is_none());
    assert!(parse_datagram(b"not a sip message", "udp", source, local).is_none());
    assert!(parse_datagram(&[0xff, 0xfe, 0xfd, 0xfc, 0xfb], "udp", source, local).is_none());

    let no_via = create_test_request("OPTIONS", None, "no-via");
    assert!(parse_datagram(no_via.as_bytes(), "udp", source, local).is_none());

    let tcp_via = create_test_request("OPTIONS", Some("SIP/2.0/TCP"), "tcp-via");
    assert!(parse_datagram(tcp_via.as_bytes(), "udp", source, local).is_none());

    let udp_via = create_test_request("OPTIONS", Some("SIP/2.0/UDP"), "udp-via");
    let msg = parse_datagram(udp_via.as_bytes(), "udp", source, local).expect("accepted");
    assert_eq!(msg.transport, "udp");
    assert_eq!(msg.source, "127.0.0.1:5061");
    assert_eq!(msg.destination, "127.0.0.1:5060");

    // methods outside the known set are kept, not dropped
    let foobar = create_test_request("FOOBAR", Some("SIP/2.0/UDP"), "foobar");
    let msg = parse_datagram(foobar.as_bytes(), "udp", source, local).expect("accepted");
    assert_eq!(msg.extension_method.as_deref(), Some("FOOBAR"));
    assert_eq!(
        msg.dispatch_method(),
        RequestMethod::Unknown("FOOBAR".to_string())
    );
}

#[tokio::test]
async fn test_udp_keepalive_absorbed() -> Result<()> {
    let (transport_layer, addr, mut receiver) = start_layer().await?;
    let peer = UdpSocket::bind("127.0.0.1:0").await?;

    peer.send_to(KEEPALIVE_RESPONSE, addr).await?;
    peer.send_to(KEEPALIVE_REQUEST, addr).await?;
    assert_no_event(&mut receiver, Duration::from_millis(200)).await;

    // no keep alive response either
    let mut buf = [0u8; 64];
    assert!(timeout(Duration::from_millis(100), peer.recv_from(&mut buf))
        .await
        .is_err());

    transport_layer.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_udp_recv_sip_message() -> Result<()> {
    let (transport_layer, addr, mut receiver) = start_layer().await?;
    let peer = UdpSocket::bind("127.0.0.1:0").await?;

    let msg = create_test_request("REGISTER", Some("SIP/2.0/UDP"), "recv-1");
    peer.send_to(msg.as_bytes(), addr).await?;

    match wait_for_event(&mut receiver).await? {
        TransportEvent::Incoming(msg) => {
            assert!(msg.is_request());
            assert_eq!(msg.transport, "udp");
            assert_eq!(msg.source, peer.local_addr()?.to_string());
            assert_eq!(msg.destination, addr.to_string());
            assert_eq!(msg.call_id().as_deref(), Some("recv-1"));
        }
        event => panic!("unexpected event: {:?}", event),
    }
    transport_layer.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_udp_drops_invalid_via() -> Result<()> {
    let (transport_layer, addr, mut receiver) = start_layer().await?;
    let peer = UdpSocket::bind("127.0.0.1:0").await?;

    let no_via = create_test_request("INVITE", None, "no-via");
    peer.send_to(no_via.as_bytes(), addr).await?;
    let tcp_via = create_test_request("INVITE", Some("SIP/2.0/TCP"), "tcp-via");
    peer.send_to(tcp_via.as_bytes(), addr).await?;
    assert_no_event(&mut receiver, Duration::from_millis(200)).await;

    // the loop keeps reading after dropping
    let valid = create_test_request("INVITE", Some("SIP/2.0/UDP"), "valid");
    peer.send_to(valid.as_bytes(), addr).await?;
    match wait_for_event(&mut receiver).await? {
        TransportEvent::Incoming(msg) => assert_eq!(msg.call_id().as_deref(), Some("valid")),
        event => panic!("unexpected event: {:?}", event),
    }

    let mut buf = [0u8; 2048];
    assert!(timeout(Duration::from_millis(100), peer.recv_from(&mut buf))
        .await
        .is_err());
    transport_layer.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_udp_mtu_congestion() -> Result<()> {
    let config = TransportConfig::default();
    let connection = UdpConnection::bind("127.0.0.1:0".parse()?, &config).await?;
    let peer = UdpSocket::bind("127.0.0.1:0").await?;

    let raw = create_test_request("MESSAGE", Some("SIP/2.0/UDP"), "mtu");
    let mut msg = SipEnvelope::new(
        rsip::SipMessage::try_from(raw.as_str())?,
        "udp",
        connection.local_addr().to_string(),
        peer.local_addr()?.to_string(),
    );
    msg.set_body(vec![b'a'; config.max_message_size()]);

    match connection.send(&msg).await {
        Err(Error::MtuCongestion { size, limit }) => {
            assert!(size > limit);
            assert_eq!(limit, 1300);
        }
        r => panic!("expected MTU congestion, got {:?}", r),
    }
    let mut buf = [0u8; 4096];
    assert!(timeout(Duration::from_millis(100), peer.recv_from(&mut buf))
        .await
        .is_err());

    // a message that fits goes out in one datagram
    msg.set_body(b"hello".to_vec());
    connection.send(&msg).await?;
    let (len, from) = timeout(Duration::from_secs(1), peer.recv_from(&mut buf))
        .await
        .expect("datagram")?;
    assert_eq!(from, connection.local_addr());
    assert_eq!(&buf[..len], msg.to_bytes().as_slice());
    Ok(())
}

#[tokio::test]
async fn test_udp_connected_mode() -> Result<()> {
    let transport_layer = TransportLayer::new(CancellationToken::new(), TransportConfig::default());
    let (sender, mut receiver) = mpsc::channel(16);
    transport_layer.append_handler(sender).await;
    transport_layer.listen("udp", "127.0.0.1:0").await?;
    transport_layer.listen("udp", "127.0.0.1:0").await?;
    assert_eq!(transport_layer.udp().pool().size().await, 2);

    let peer = UdpSocket::bind("127.0.0.1:0").await?;
    let peer_addr = peer.local_addr()?.to_string();

    // two listeners: no shared socket, a connected one is created lazily
    let connection = transport_layer
        .udp()
        .get_connection(&peer_addr)
        .await?
        .expect("connection");
    assert_eq!(connection.remote_addr(), Some(peer.local_addr()?));
    assert_eq!(transport_layer.udp().pool().size().await, 3);

    let again = transport_layer.get_connection("UDP", &peer_addr).await?;
    assert_eq!(again.local_addr(), connection.local_addr());

    // what the peer sends back is read by the connected socket
    let reply = create_test_request("NOTIFY", Some("SIP/2.0/UDP"), "connected");
    let target = SocketAddr::new(peer.local_addr()?.ip(), connection.local_addr().port());
    peer.send_to(reply.as_bytes(), target).await?;
    match wait_for_event(&mut receiver).await? {
        TransportEvent::Incoming(msg) => {
            assert_eq!(msg.source, peer_addr);
            assert_eq!(msg.call_id().as_deref(), Some("connected"));
        }
        event => panic!("unexpected event: {:?}", event),
    }

    transport_layer.close().await?;
    assert_eq!(transport_layer.udp().pool().size().await, 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_udp_concurrent_get_connection_shares_one_socket() -> Result<()> {
    let transport_layer = TransportLayer::new(CancellationToken::new(), TransportConfig::default());
    transport_layer.listen("udp", "127.0.0.1:0").await?;
    transport_layer.listen("udp", "127.0.0.1:0").await?;
    let udp = transport_layer.udp().clone();

    for _ in 0..20 {
        let peer = UdpSocket::bind("127.0.0.1:0").await?;
        let peer_addr = peer.local_addr()?.to_string();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let udp = udp.clone();
            let peer_addr = peer_addr.clone();
            tasks.push(tokio::spawn(async move {
                udp.get_connection(&peer_addr).await
            }));
        }
        let mut locals = HashSet::new();
        for task in tasks {
            let connection = task.await.expect("task")?.expect("connection");
            locals.insert(connection.local_addr());
        }
        assert_eq!(locals.len(), 1);
        assert_eq!(udp.pool().size().await, 3);

        // the one pooled socket is the one that was handed out
        let pooled = udp.pool().get(&peer_addr).await.expect("pooled");
        assert!(locals.contains(&pooled.local_addr()));
        udp.pool().remove(&peer_addr).await;
    }

    transport_layer.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_udp_read_error_closes_connected_socket() -> Result<()> {
    let transport_layer = TransportLayer::new(CancellationToken::new(), TransportConfig::default());
    let (sender, mut receiver) = mpsc::channel(16);
    transport_layer.append_handler(sender).await;
    transport_layer.listen("udp", "127.0.0.1:0").await?;
    transport_layer.listen("udp", "127.0.0.1:0").await?;
    assert_eq!(transport_layer.udp().pool().size().await, 2);

    // nothing listens here once the socket is dropped
    let closed = UdpSocket::bind("127.0.0.1:0").await?.local_addr()?;
    let connection = transport_layer
        .udp()
        .get_connection(&closed.to_string())
        .await?
        .expect("connection");
    assert_eq!(transport_layer.udp().pool().size().await, 3);

    let SipConnection::Udp(udp_connection) = &connection;
    udp_connection.send_raw(b"hello", closed).await?;

    // the refused datagram fails the next read and ends the loop
    match wait_for_event(&mut receiver).await? {
        TransportEvent::Closed(key) => assert_eq!(key, closed.to_string()),
        event => panic!("unexpected event: {:?}", event),
    }
    assert_eq!(transport_layer.udp().pool().size().await, 2);
    assert!(transport_layer
        .udp()
        .pool()
        .get(&closed.to_string())
        .await
        .is_none());

    transport_layer.close().await?;
    Ok(())
}
