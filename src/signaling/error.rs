//! Signaling error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("signaling channel is not connected")]
    NotConnected,

    #[error("signaling request timed out")]
    Timeout,

    #[error("server rejected request: {0}")]
    Server(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("wire codec error: {0}")]
    Codec(String),

    #[error("internal channel closed unexpectedly")]
    ChannelClosed,
}
