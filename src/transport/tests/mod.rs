use crate::{
    transport::{TransportEvent, TransportReceiver},
    Result,
};
use std::time::Duration;
use tokio::time::timeout;

mod test_transport_layer;
mod test_udp;

pub(super) fn create_test_request(method: &str, via: Option<&str>, call_id: &str) -> String {
    let via = via
        .map(|v| format!("Via: {} 127.0.0.1:5061;branch=z9hG4bK-{}\r\n", v, call_id))
        .unwrap_or_default();
    format!(
        "{} sip:bob@127.0.0.1:5060 SIP/2.0\r\n\
         {}\
         From: <sip:alice@example.com>;tag=alice-tag\r\n\
         To: <sip:bob@example.com>\r\n\
         Call-ID: {}\r\n\
         CSeq: 1 {}\r\n\
         Max-Forwards: 70\r\n\
         Content-Length: 0\r\n\r\n",
        method, via, call_id, method
    )
}

/// Helper function to wait for transport events with timeout
pub(super) async fn wait_for_event(receiver: &mut TransportReceiver) -> Result<TransportEvent> {
    match timeout(Duration::from_secs(5), receiver.recv()).await {
        Ok(Some(event)) => Ok(event),
        Ok(None) => Err(crate::Error::Error("Channel closed".to_string())),
        Err(_) => Err(crate::Error::Error("Timeout waiting for event".to_string())),
    }
}

/// Nothing may arrive within `wait`.
pub(super) async fn assert_no_event(receiver: &mut TransportReceiver, wait: Duration) {
    if let Ok(event) = timeout(wait, receiver.recv()).await {
        panic!("unexpected event: {:?}", event);
    }
}
