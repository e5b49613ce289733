//! Error types for Backhaul.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Frame decode error: {0}")]
    Decode(String),

    #[error("Frame encode error: {0}")]
    Encode(String),

    #[error("No agent available")]
    NoAgentAvailable,

    #[error("Gateway timeout")]
    GatewayTimeout,

    #[error("Bad gateway: {0}")]
    BadGateway(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Connection lost")]
    ConnectionLost,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// HTTP status the relay answers with when this error ends an exchange.
    pub fn status(&self) -> u16 {
        match self {
            Error::NoAgentAvailable => 503,
            Error::GatewayTimeout => 504,
            Error::Unauthorized => 401,
            Error::BadGateway(_) | Error::ConnectionLost => 502,
            Error::Decode(_) | Error::Encode(_) | Error::Io(_) => 500,
        }
    }
}
