//! Backhaul Shared Library
//!
//! Wire protocol, tunnel transport and body/WebSocket plumbing used by both
//! the relay and the agent.

pub mod bridge;
pub mod error;
pub mod headers;
pub mod protocol;
pub mod pump;
pub mod transport;

pub use error::{Error, Result};
pub use protocol::{
    AbortFrame, BodyFrame, Control, HeaderList, RequestFrame, RequestHeader, ResponseFrame,
    ResponseHeader, WireFrame,
};
pub use transport::{Disconnect, FrameHandler, TransportIo, TunnelTransport, WireMessage};
