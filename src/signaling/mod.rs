//! Signaling layer: a persistent bidirectional channel to the SFU.
//!
//! - [`transport`]: pluggable wire transport (WebSocket in production).
//! - [`protocol`]: typed request/ack/push envelope and payloads.
//! - [`channel`]: request/response correlation and event forwarding.

pub mod channel;
pub mod error;
pub mod protocol;
pub mod transport;

pub use channel::SignalingChannel;
pub use error::SignalError;
pub use protocol::ServerEvent;
pub use transport::{
    SignalTransport, SignalTransportFactory, TransportEvent, WebSocketTransportFactory,
};
