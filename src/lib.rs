// A minimal SIP signaling endpoint in Rust

pub mod error;
pub mod message;
pub mod server;
pub mod transport;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;
