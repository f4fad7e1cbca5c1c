use crate::{Error, Result};
use rand::{distr::Alphanumeric, Rng};
use rsip::{
    prelude::{HasHeaders, HeadersExt, ToTypedHeader, UntypedHeader},
    Header, SipMessage, StatusCode,
};
use std::fmt;

mod method;
mod response;
pub use method::RequestMethod;
pub use response::build_reply;

const TO_TAG_LEN: usize = 8;
const BRANCH_LEN: usize = 12;
const CALL_ID_LEN: usize = 22;
const DIALOG_ID_SEPARATOR: &str = "__";

/// Envelope around a parsed SIP message
///
/// `SipEnvelope` is the unit moved between the transports, the transport
/// layer and the server. Besides the message it records which transport it
/// belongs to and where it travels.
///
/// # Fields
///
/// * `msg` - parsed request or response
/// * `transport` - lowercase network name, e.g. `"udp"`
/// * `source` - `host:port` the message came from; for inbound messages this
///   is the address the datagram was received from, not a header value
/// * `destination` - `host:port` the message goes to; a reply built with
///   [`build_reply`] targets the source of the request
/// * `extension_method` - request method token the codec has no variant
///   for, e.g. `FOOBAR`; `msg` then carries a stand-in method and the token
///   is written back on serialization
#[derive(Debug, Clone)]
pub struct SipEnvelope {
    pub msg: SipMessage,
    pub transport: String,
    pub source: String,
    pub destination: String,
    pub extension_method: Option<String>,
}

impl SipEnvelope {
    pub fn new(msg: SipMessage, transport: &str, source: String, destination: String) -> Self {
        SipEnvelope {
            msg,
            transport: transport.to_ascii_lowercase(),
            source,
            destination,
            extension_method: None,
        }
    }

    /// Parse `text` into an envelope
    ///
    /// A request whose method token is well formed but unknown to the codec
    /// is still accepted: the rest of the message is parsed with a stand-in
    /// method and the token is kept in `extension_method`.
    pub fn parse(text: &str, transport: &str, source: String, destination: String) -> Result<Self> {
        let (msg, extension_method) = match SipMessage::try_from(text) {
            Ok(msg) => (msg, None),
            Err(e) => match split_extension_method(text) {
                Some((token, rest)) => {
                    let stand_in = format!("{} {}", rsip::Method::Options, rest);
                    match SipMessage::try_from(stand_in.as_str()) {
                        Ok(msg) => (msg, Some(token.to_string())),
                        Err(_) => return Err(e.into()),
                    }
                }
                None => return Err(e.into()),
            },
        };
        let mut envelope = SipEnvelope::new(msg, transport, source, destination);
        envelope.extension_method = extension_method;
        Ok(envelope)
    }

    pub fn headers(&self) -> &rsip::Headers {
        self.msg.headers()
    }

    pub fn headers_mut(&mut self) -> &mut rsip::Headers {
        self.msg.headers_mut()
    }

    pub fn is_request(&self) -> bool {
        matches!(self.msg, SipMessage::Request(_))
    }

    /// Request method, `None` for responses and extension methods.
    pub fn method(&self) -> Option<&rsip::Method> {
        match &self.msg {
            SipMessage::Request(_) if self.extension_method.is_some() => None,
            SipMessage::Request(req) => Some(&req.method),
            SipMessage::Response(_) => None,
        }
    }

    /// Status code, `None` for requests.
    pub fn status(&self) -> Option<u16> {
        match &self.msg {
            SipMessage::Request(_) => None,
            SipMessage::Response(resp) => Some(resp.status_code.code()),
        }
    }

    /// Reason phrase of a response.
    pub fn phrase(&self) -> Option<String> {
        match &self.msg {
            SipMessage::Request(_) => None,
            SipMessage::Response(resp) => Some(reason_phrase(&resp.status_code)),
        }
    }

    pub fn via(&self) -> Option<&rsip::headers::Via> {
        self.msg.via_header().ok()
    }

    /// Transport declared by the topmost Via, lowercased.
    pub fn via_transport(&self) -> Option<String> {
        let via = self.via()?.typed().ok()?;
        Some(via.transport.to_string().to_ascii_lowercase())
    }

    pub fn branch(&self) -> Option<String> {
        let via = self.via()?.typed().ok()?;
        via.branch().map(|branch| branch.to_string())
    }

    pub fn call_id(&self) -> Option<String> {
        let call_id = self.msg.call_id_header().ok()?;
        Some(call_id.value().trim().to_string())
    }

    pub fn to_tag(&self) -> Option<String> {
        let tag = self.msg.to_header().ok()?.tag().ok()??;
        Some(tag.to_string())
    }

    pub fn from_tag(&self) -> Option<String> {
        let tag = self.msg.from_header().ok()?.tag().ok()??;
        Some(tag.to_string())
    }

    pub fn cseq_method(&self) -> Option<rsip::Method> {
        self.msg.cseq_header().ok()?.method().ok()
    }

    /// Method token of the CSeq header as written, known to the codec or not.
    pub fn cseq_method_token(&self) -> Option<String> {
        let cseq = self.msg.cseq_header().ok()?;
        cseq.value().split_whitespace().nth(1).map(str::to_string)
    }

    /// Key used to pick a handler: the CSeq method for responses, the
    /// request method otherwise.
    pub fn dispatch_method(&self) -> RequestMethod {
        match &self.msg {
            SipMessage::Request(req) => match &self.extension_method {
                Some(token) => RequestMethod::Unknown(token.clone()),
                None => RequestMethod::from(&req.method),
            },
            SipMessage::Response(_) => match self.cseq_method_token() {
                Some(token) => RequestMethod::from(token.as_str()),
                None => RequestMethod::Unknown(String::new()),
            },
        }
    }

    /// Sets the To tag unless the header already carries one.
    pub fn ensure_to_tag(&mut self) -> Result<()> {
        if self.to_tag().is_some() {
            return Ok(());
        }
        self.msg.to_header_mut()?.mut_tag(make_tag())?;
        Ok(())
    }

    pub fn body(&self) -> &[u8] {
        match &self.msg {
            SipMessage::Request(req) => &req.body,
            SipMessage::Response(resp) => &resp.body,
        }
    }

    /// Replaces the payload and keeps Content-Length in sync.
    pub fn set_body(&mut self, body: Vec<u8>) {
        let len = body.len() as u32;
        match &mut self.msg {
            SipMessage::Request(req) => req.body = body,
            SipMessage::Response(resp) => resp.body = body,
        }
        let headers = self.headers_mut();
        headers.retain(|h| !matches!(h, Header::ContentLength(_)));
        headers.push(Header::ContentLength(len.into()));
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let text = self.msg.to_string();
        match (&self.msg, &self.extension_method) {
            (SipMessage::Request(_), Some(token)) => match text.split_once(' ') {
                Some((_, rest)) => format!("{} {}", token, rest).into_bytes(),
                None => text.into_bytes(),
            },
            _ => text.into_bytes(),
        }
    }

    pub fn dialog_id(&self) -> Result<DialogId> {
        DialogId::try_from(self)
    }
}

impl fmt::Display for SipEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.msg {
            SipMessage::Request(req) => match &self.extension_method {
                Some(token) => write!(
                    f,
                    "{} {} {} -> {}",
                    self.transport, token, self.source, self.destination
                ),
                None => write!(
                    f,
                    "{} {} {} -> {}",
                    self.transport, req.method, self.source, self.destination
                ),
            },
            SipMessage::Response(resp) => write!(
                f,
                "{} {} {} -> {}",
                self.transport, resp.status_code, self.source, self.destination
            ),
        }
    }
}

/// Dialog identity derived from Call-ID, To tag and From tag.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct DialogId {
    pub call_id: String,
    pub to_tag: String,
    pub from_tag: String,
}

impl DialogId {
    pub fn new(call_id: &str, to_tag: &str, from_tag: &str) -> Result<Self> {
        if call_id.is_empty() {
            return Err(Error::DialogIdError("missing Call-ID header".to_string()));
        }
        if to_tag.is_empty() {
            return Err(Error::DialogIdError(
                "missing tag param in To header".to_string(),
            ));
        }
        if from_tag.is_empty() {
            return Err(Error::DialogIdError(
                "missing tag param in From header".to_string(),
            ));
        }
        Ok(DialogId {
            call_id: call_id.to_string(),
            to_tag: to_tag.to_string(),
            from_tag: from_tag.to_string(),
        })
    }
}

impl TryFrom<&SipEnvelope> for DialogId {
    type Error = Error;

    fn try_from(msg: &SipEnvelope) -> Result<Self> {
        DialogId::new(
            &msg.call_id().unwrap_or_default(),
            &msg.to_tag().unwrap_or_default(),
            &msg.from_tag().unwrap_or_default(),
        )
    }
}

impl fmt::Display for DialogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            make_dialog_id(&self.call_id, &self.to_tag, &self.from_tag)
        )
    }
}

/// Reason phrase for `code`
///
/// Well known codes only carry their variant name, e.g. `BusyHere`, which is
/// turned back into words.
pub fn reason_phrase(code: &StatusCode) -> String {
    if let StatusCode::Other(_, phrase) = code {
        return phrase.clone();
    }
    let text = code.to_string();
    let name = text.split_once(' ').map(|(_, name)| name).unwrap_or_default();
    let mut phrase = String::with_capacity(name.len() + 4);
    let mut prev_lower = false;
    for c in name.chars() {
        if c.is_ascii_uppercase() && prev_lower {
            phrase.push(' ');
        }
        prev_lower = c.is_ascii_lowercase();
        phrase.push(c);
    }
    phrase
}

/// Splits off the method of a request line the codec has no variant for.
fn split_extension_method(text: &str) -> Option<(&str, &str)> {
    let (token, rest) = text.split_once(' ')?;
    let is_token = !token.is_empty()
        && token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-.!%*_+`'~".contains(c));
    if !is_token || token.parse::<rsip::Method>().is_ok() {
        return None;
    }
    let request_line = rest.lines().next()?;
    if !request_line.trim_end().ends_with("SIP/2.0") {
        return None;
    }
    Some((token, rest))
}

pub fn make_dialog_id(call_id: &str, to_tag: &str, from_tag: &str) -> String {
    [call_id, to_tag, from_tag].join(DIALOG_ID_SEPARATOR)
}

pub fn random_text(count: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(count)
        .map(char::from)
        .collect()
}

pub fn make_tag() -> rsip::param::Tag {
    random_text(TO_TAG_LEN).into()
}

pub fn make_via_branch() -> String {
    format!("z9hG4bK{}", random_text(BRANCH_LEN))
}

pub fn make_call_id() -> String {
    random_text(CALL_ID_LEN)
}
