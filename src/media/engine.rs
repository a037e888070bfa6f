//! Seam to the external media engine.
//!
//! Codec negotiation, ICE/DTLS and RTP are delegated entirely to an injected
//! engine (a mediasoup-style "device"). This module defines the traits that
//! engine must implement, the opaque parameter blobs ferried between it and
//! the SFU, and the composite stream handle the renderer consumes.

use crate::types::call::{
    CallMediaType, ConsumerId, MediaKind, ProducerId, TransportId, UserId,
};
use async_trait::async_trait;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("media device is not loaded")]
    DeviceNotLoaded,

    #[error("{0} transport already exists for this call")]
    TransportExists(&'static str),

    #[error("{0} transport does not exist")]
    TransportMissing(&'static str),

    #[error("failed to acquire local media: {0}")]
    Acquisition(String),

    #[error("media engine error: {0}")]
    Engine(String),

    #[error("signaling failure during negotiation: {0}")]
    Signal(#[from] crate::signaling::SignalError),
}

macro_rules! opaque_blob {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub serde_json::Value);

        impl $name {
            pub fn into_inner(self) -> serde_json::Value {
                self.0
            }
        }
    };
}

opaque_blob!(
    /// The SFU router's advertised codec/parameter set. Loaded into the
    /// device once per call; never interpreted here.
    RouterRtpCapabilities
);
opaque_blob!(
    /// The local device's receive capabilities, sent with `create-consumer`.
    RtpCapabilities
);
opaque_blob!(
    /// DTLS handshake parameters for the `connect-transport` round trip.
    DtlsParameters
);
opaque_blob!(
    /// Per-producer RTP parameters for the `create-producer` round trip.
    RtpParameters
);

/// Direction of a media transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    Send,
    Recv,
}

impl TransportDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportDirection::Send => "send",
            TransportDirection::Recv => "recv",
        }
    }
}

/// Server-assigned transport parameters from `create-transport`. Only the id
/// is read here; the rest is handed to the engine verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportOptions {
    pub id: TransportId,
    #[serde(flatten)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

/// Server-assigned consumer parameters from `create-consumer`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerOptions {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    #[serde(flatten)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

/// A single audio or video track owned by the engine.
///
/// `stop` must be idempotent: the registry and the stream assembler both
/// release tracks on teardown paths that can overlap.
pub trait MediaTrack: Send + Sync {
    fn id(&self) -> &str;
    fn kind(&self) -> MediaKind;
    fn stop(&self);
}

impl fmt::Debug for dyn MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MediaTrack({}, {})", self.id(), self.kind())
    }
}

/// Locally acquired microphone/camera tracks.
#[derive(Clone)]
pub struct LocalMedia {
    pub audio: Arc<dyn MediaTrack>,
    pub video: Option<Arc<dyn MediaTrack>>,
}

impl LocalMedia {
    pub fn tracks(&self) -> Vec<Arc<dyn MediaTrack>> {
        let mut tracks = vec![self.audio.clone()];
        if let Some(video) = &self.video {
            tracks.push(video.clone());
        }
        tracks
    }

    pub fn stop_all(&self) {
        for track in self.tracks() {
            track.stop();
        }
    }
}

/// Per-participant composite stream handle.
///
/// A handle is immutable once constructed; the assembler builds a brand-new
/// one whenever the track set changes, because handle identity change is the
/// only refresh signal the downstream renderer understands.
pub struct MediaStream {
    id: String,
    tracks: Vec<Arc<dyn MediaTrack>>,
}

impl MediaStream {
    pub fn new(tracks: Vec<Arc<dyn MediaTrack>>) -> Self {
        let mut bytes = [0u8; 8];
        rand::rng().fill_bytes(&mut bytes);
        Self {
            id: hex::encode(bytes),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[Arc<dyn MediaTrack>] {
        &self.tracks
    }

    pub fn track_of_kind(&self, kind: MediaKind) -> Option<&Arc<dyn MediaTrack>> {
        self.tracks.iter().find(|t| t.kind() == kind)
    }

    pub fn has_track(&self, track_id: &str) -> bool {
        self.tracks.iter().any(|t| t.id() == track_id)
    }

    pub fn stop_tracks(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

impl fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaStream")
            .field("id", &self.id)
            .field("tracks", &self.tracks.len())
            .finish()
    }
}

/// A locally originated track registered with the SFU.
#[async_trait]
pub trait MediaProducer: Send + Sync {
    fn id(&self) -> ProducerId;
    fn kind(&self) -> MediaKind;
    fn track(&self) -> Arc<dyn MediaTrack>;
    fn is_paused(&self) -> bool;
    async fn pause(&self);
    async fn resume(&self);
    async fn close(&self);
}

/// A local handle receiving one remote participant's forwarded track.
#[async_trait]
pub trait MediaConsumer: Send + Sync {
    fn id(&self) -> ConsumerId;
    fn kind(&self) -> MediaKind;
    fn track(&self) -> Arc<dyn MediaTrack>;
    async fn resume(&self);
    async fn close(&self);
}

/// A negotiated send or receive path between client and SFU.
///
/// The source's callback-driven connect/produce handshakes are flattened into
/// sequential awaits: the negotiation engine reads `dtls_parameters` and
/// performs the `connect-transport` round trip itself, then asks the engine
/// for per-track RTP parameters before the `create-producer` round trip and
/// binds the server-assigned id afterwards.
#[async_trait]
pub trait MediaTransport: Send + Sync {
    fn id(&self) -> TransportId;
    fn direction(&self) -> TransportDirection;
    fn dtls_parameters(&self) -> DtlsParameters;

    /// RTP parameters the engine would use to send this track.
    async fn prepare_producer(
        &self,
        track: Arc<dyn MediaTrack>,
    ) -> Result<RtpParameters, MediaError>;

    /// Bind a server-assigned producer id to a prepared track.
    async fn create_producer(
        &self,
        producer_id: ProducerId,
        track: Arc<dyn MediaTrack>,
    ) -> Result<Arc<dyn MediaProducer>, MediaError>;

    /// Instantiate a consumer from server-assigned parameters.
    async fn create_consumer(
        &self,
        options: &ConsumerOptions,
    ) -> Result<Arc<dyn MediaConsumer>, MediaError>;

    async fn close(&self);
}

/// The media "device": loads router capabilities once and mints transports.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn load(&self, capabilities: &RouterRtpCapabilities) -> Result<(), MediaError>;
    fn is_loaded(&self) -> bool;

    /// The device's receive capabilities. Requires a loaded device.
    fn rtp_capabilities(&self) -> Result<RtpCapabilities, MediaError>;

    async fn create_transport(
        &self,
        direction: TransportDirection,
        options: &TransportOptions,
    ) -> Result<Arc<dyn MediaTransport>, MediaError>;

    /// Acquire microphone (and camera for video calls) tracks.
    async fn acquire_local_media(
        &self,
        call_type: CallMediaType,
    ) -> Result<LocalMedia, MediaError>;
}

/// Remote screen share currently occupying the single per-call slot.
#[derive(Debug, Clone)]
pub struct ActiveScreenShare {
    pub owner: UserId,
    pub producer_id: ProducerId,
    pub stream: Arc<MediaStream>,
}
