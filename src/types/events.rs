//! UI-facing event bus.
//!
//! The out-of-scope renderer and screens subscribe here; the orchestrator is
//! the only emitter. Events carry identifiers and versions, not stream
//! handles — subscribers fetch current state through the manager's accessors.

use crate::calls::state::CallPhase;
use crate::types::call::{CallEndReason, CallId, CallMediaType, MediaKind, UserId};
use tokio::sync::broadcast;

/// Events surfaced to the application layer.
#[derive(Debug, Clone)]
pub enum RtcEvent {
    /// An incoming call is ringing; the UI should present the call screen.
    IncomingCall {
        call_id: CallId,
        caller_id: UserId,
        caller_name: String,
        call_type: CallMediaType,
    },
    /// The call phase changed.
    PhaseChanged { phase: CallPhase },
    /// The participant set changed (join/invite/no-answer/leave or topology
    /// upgrade/downgrade).
    ParticipantsChanged,
    /// A single participant's state changed (status or name).
    ParticipantUpdated { user_id: UserId },
    /// A participant's composite stream handle was replaced. The version is
    /// the registry's monotonic stream counter for that participant.
    RemoteStreamChanged { user_id: UserId, version: u64 },
    /// The 1:1 remote-peer view changed (set, updated or dissolved).
    RemotePeerChanged,
    /// The single-slot active screen share was set or cleared.
    ScreenShareChanged,
    /// A participant's mute flag changed (local or remote).
    MuteChanged {
        user_id: UserId,
        kind: MediaKind,
        muted: bool,
    },
    /// The call ended.
    CallEnded { reason: CallEndReason },
}

/// Broadcast bus for [`RtcEvent`]s.
#[derive(Debug)]
pub struct RtcEventBus {
    sender: broadcast::Sender<RtcEvent>,
}

impl RtcEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RtcEvent> {
        self.sender.subscribe()
    }

    /// Emit an event. Lagging or absent subscribers are not an error.
    pub fn emit(&self, event: RtcEvent) {
        let _ = self.sender.send(event);
    }
}
