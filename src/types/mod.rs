pub mod call;
pub mod events;

pub use call::{
    CallDirection, CallEndReason, CallId, CallMediaType, ConsumerId, MediaKind, MediaSource,
    ParticipantInfo, ProducerId, TransportId, UserId,
};
pub use events::{RtcEvent, RtcEventBus};
