use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SIP message error: {0}")]
    SipMessageError(String),

    #[error("network not supported: {0}")]
    NetworkNotSupported(String),

    #[error("transport {0} is not supported")]
    TransportNotSupported(String),

    #[error("connection does not exist: {0}")]
    ConnectionNotExist(String),

    #[error("size of packet larger than MTU: {size} > {limit}")]
    MtuCongestion { size: usize, limit: usize },

    #[error("fail to write full message: wrote {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    #[error("fail to resolve address: {0}")]
    AddrResolve(String),

    #[error("transport layer error: {0}: {1}")]
    TransportLayerError(String, String),

    #[error("dialog id error: {0}")]
    DialogIdError(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),

    #[error("{0}")]
    Error(String),
}

impl From<rsip::Error> for Error {
    fn from(e: rsip::Error) -> Self {
        Error::SipMessageError(e.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(e: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::Error(e.to_string())
    }
}
