use std::{fmt, str::FromStr};

/// Dispatch key of the server handler table.
///
/// Every method the server can route is a variant of its own; anything else
/// is kept verbatim in `Unknown` and always ends up in the fallback handler.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RequestMethod {
    Invite,
    Ack,
    Cancel,
    Bye,
    Register,
    Options,
    Subscribe,
    Notify,
    Refer,
    Info,
    Message,
    Prack,
    Update,
    Publish,
    Unknown(String),
}

impl RequestMethod {
    pub fn as_str(&self) -> &str {
        match self {
            RequestMethod::Invite => "INVITE",
            RequestMethod::Ack => "ACK",
            RequestMethod::Cancel => "CANCEL",
            RequestMethod::Bye => "BYE",
            RequestMethod::Register => "REGISTER",
            RequestMethod::Options => "OPTIONS",
            RequestMethod::Subscribe => "SUBSCRIBE",
            RequestMethod::Notify => "NOTIFY",
            RequestMethod::Refer => "REFER",
            RequestMethod::Info => "INFO",
            RequestMethod::Message => "MESSAGE",
            RequestMethod::Prack => "PRACK",
            RequestMethod::Update => "UPDATE",
            RequestMethod::Publish => "PUBLISH",
            RequestMethod::Unknown(method) => method,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, RequestMethod::Unknown(_))
    }
}

impl FromStr for RequestMethod {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let method = match s {
            "INVITE" => RequestMethod::Invite,
            "ACK" => RequestMethod::Ack,
            "CANCEL" => RequestMethod::Cancel,
            "BYE" => RequestMethod::Bye,
            "REGISTER" => RequestMethod::Register,
            "OPTIONS" => RequestMethod::Options,
            "SUBSCRIBE" => RequestMethod::Subscribe,
            "NOTIFY" => RequestMethod::Notify,
            "REFER" => RequestMethod::Refer,
            "INFO" => RequestMethod::Info,
            "MESSAGE" => RequestMethod::Message,
            "PRACK" => RequestMethod::Prack,
            "UPDATE" => RequestMethod::Update,
            "PUBLISH" => RequestMethod::Publish,
            other => RequestMethod::Unknown(other.to_string()),
        };
        Ok(method)
    }
}

impl From<&str> for RequestMethod {
    fn from(s: &str) -> Self {
        match s.parse() {
            Ok(method) => method,
            Err(never) => match never {},
        }
    }
}

impl From<&rsip::Method> for RequestMethod {
    fn from(method: &rsip::Method) -> Self {
        RequestMethod::from(method.to_string().as_str())
    }
}

impl fmt::Display for RequestMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
