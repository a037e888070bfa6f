//! Media layer: the injected engine seam and the negotiation bookkeeping.

pub mod engine;
pub mod negotiation;

pub use engine::{
    ActiveScreenShare, ConsumerOptions, DtlsParameters, LocalMedia, MediaConsumer, MediaEngine,
    MediaError, MediaProducer, MediaStream, MediaTrack, MediaTransport, RouterRtpCapabilities,
    RtpCapabilities, RtpParameters, TransportDirection, TransportOptions,
};
pub use negotiation::{ConsumedMedia, ConsumerEntry, MediaNegotiationEngine};
