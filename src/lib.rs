//! Client-side call orchestration for an SFU-based calling service.
//!
//! The crate owns call state, signaling and media negotiation; rendering,
//! the OS telephony UI, contact lookup and the media engine itself are
//! injected seams. Construct an [`RtcClient`] with the host's capability
//! implementations, `connect()` it, then drive calls through its operations
//! and observe state through the [`RtcEvent`] subscription.

pub mod calls;
pub mod client;
pub mod media;
pub mod platform;
pub mod signaling;
pub mod store;
pub mod types;

#[doc(hidden)]
pub mod test_utils;

pub use calls::{
    AcceptTrigger, CallCapabilities, CallError, CallManager, CallManagerConfig, CallPhase,
    CurrentCall, Participant, RemotePeer,
};
pub use client::RtcClient;
pub use media::{MediaEngine, MediaError, MediaStream, MediaTrack};
pub use signaling::{SignalError, WebSocketTransportFactory};
pub use store::{KeyValueStore, MemoryKeyValueStore, StoreError};
pub use types::call::{CallId, CallMediaType, MediaKind, MediaSource, UserId};
pub use types::events::{RtcEvent, RtcEventBus};
