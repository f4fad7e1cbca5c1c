use super::SipEnvelope;
use crate::{Error, Result};
use rsip::{SipMessage, StatusCode};

/// Build a reply envelope from a request
///
/// The request is cloned and turned into a response carrying `status` and
/// `phrase`. All headers and the payload are kept; callers that answer
/// without a body clear it with [`SipEnvelope::set_body`].
///
/// `source` and `destination` are swapped so the transport layer routes the
/// reply back to the sender of the request. When the request has no To tag
/// one is generated here; a tag that is already present is left alone.
///
/// # Examples
///
/// ```rust,no_run
/// # use minisip::message::{build_reply, SipEnvelope};
/// # fn example(request: &SipEnvelope) -> minisip::Result<()> {
/// let mut reply = build_reply(request, 200, "OK")?;
/// reply.set_body(vec![]);
/// assert_eq!(reply.destination, request.source);
/// # Ok(())
/// # }
/// ```
pub fn build_reply(req: &SipEnvelope, status: u16, phrase: &str) -> Result<SipEnvelope> {
    let request = match &req.msg {
        SipMessage::Request(request) => request,
        SipMessage::Response(_) => {
            return Err(Error::SipMessageError(
                "can not build a reply from a response".to_string(),
            ))
        }
    };

    let response = rsip::Response {
        status_code: status_code(status, phrase),
        version: request.version.clone(),
        headers: request.headers.clone(),
        body: request.body.clone(),
    };

    let mut reply = SipEnvelope {
        msg: response.into(),
        transport: req.transport.clone(),
        source: req.destination.clone(),
        destination: req.source.clone(),
        extension_method: None,
    };
    reply.ensure_to_tag()?;
    Ok(reply)
}

// Known codes print their variant name on the wire, so anything but a
// one-word phrase like "OK" goes out as `Other`.
fn status_code(status: u16, phrase: &str) -> StatusCode {
    let known = StatusCode::from(status);
    if known.to_string() == format!("{} {}", status, phrase) {
        known
    } else {
        StatusCode::Other(status, phrase.to_string())
    }
}
