//! Call phase machine.
//!
//! `Idle` is the absence of a [`CurrentCall`]; exactly one non-idle call may
//! exist per client instance. `Initiating` covers the in-flight start-call
//! setup window, `AcceptInProgress` the accept window.

use crate::types::call::{CallDirection, CallEndReason, CallId, CallMediaType, UserId};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Phase of the current call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CallPhase {
    Idle,
    Initiating,
    OutgoingRinging,
    IncomingRinging,
    AcceptInProgress,
    Active,
    Ended,
}

/// State transitions for the current call.
#[derive(Debug, Clone)]
pub enum CallTransition {
    /// Outgoing setup finished; invites are ringing remotely.
    InviteSent,
    /// A callee accepted / joined an outgoing ringing call.
    RemoteAccepted,
    /// The local accept sequence started.
    AcceptStarted,
    /// The accept sequence failed; the call is ringing again so a retry is
    /// possible.
    AcceptFailed,
    /// The accept sequence completed.
    AcceptSucceeded,
    /// The call ended for the given reason.
    Terminated { reason: CallEndReason },
}

/// Aggregate state of the one current call.
#[derive(Debug, Clone, Serialize)]
pub struct CurrentCall {
    pub call_id: CallId,
    pub call_type: CallMediaType,
    pub direction: CallDirection,
    /// Originating caller, for incoming calls.
    pub caller: Option<UserId>,
    pub phase: CallPhase,
    pub created_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
    pub end_reason: Option<CallEndReason>,
}

impl CurrentCall {
    pub fn new_outgoing(call_id: CallId, call_type: CallMediaType) -> Self {
        Self {
            call_id,
            call_type,
            direction: CallDirection::Outgoing,
            caller: None,
            phase: CallPhase::Initiating,
            created_at: Utc::now(),
            connected_at: None,
            end_reason: None,
        }
    }

    pub fn new_incoming(call_id: CallId, caller: UserId, call_type: CallMediaType) -> Self {
        Self {
            call_id,
            call_type,
            direction: CallDirection::Incoming,
            caller: Some(caller),
            phase: CallPhase::IncomingRinging,
            created_at: Utc::now(),
            connected_at: None,
            end_reason: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.phase == CallPhase::Active
    }

    pub fn is_ringing(&self) -> bool {
        matches!(
            self.phase,
            CallPhase::OutgoingRinging | CallPhase::IncomingRinging
        )
    }

    pub fn can_accept(&self) -> bool {
        self.phase == CallPhase::IncomingRinging
    }

    /// Apply a phase transition. Returns an error if the transition is not
    /// valid from the current phase.
    pub fn apply_transition(&mut self, transition: CallTransition) -> Result<(), InvalidTransition> {
        let new_phase = match (self.phase, &transition) {
            (CallPhase::Initiating, CallTransition::InviteSent) => CallPhase::OutgoingRinging,
            (CallPhase::OutgoingRinging, CallTransition::RemoteAccepted) => {
                self.connected_at = Some(Utc::now());
                CallPhase::Active
            }
            (CallPhase::IncomingRinging, CallTransition::AcceptStarted) => {
                CallPhase::AcceptInProgress
            }
            (CallPhase::AcceptInProgress, CallTransition::AcceptFailed) => {
                CallPhase::IncomingRinging
            }
            (CallPhase::AcceptInProgress, CallTransition::AcceptSucceeded) => {
                self.connected_at = Some(Utc::now());
                CallPhase::Active
            }
            (
                CallPhase::Initiating
                | CallPhase::OutgoingRinging
                | CallPhase::IncomingRinging
                | CallPhase::AcceptInProgress
                | CallPhase::Active,
                CallTransition::Terminated { reason },
            ) => {
                self.end_reason = Some(*reason);
                CallPhase::Ended
            }
            (current, attempted) => {
                return Err(InvalidTransition {
                    current_phase: format!("{current:?}"),
                    attempted: format!("{attempted:?}"),
                });
            }
        };
        self.phase = new_phase;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct InvalidTransition {
    pub current_phase: String,
    pub attempted: String,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid transition {} in phase {}",
            self.attempted, self.current_phase
        )
    }
}

impl std::error::Error for InvalidTransition {}

#[cfg(test)]
mod tests {
    use super::*;

    fn outgoing() -> CurrentCall {
        CurrentCall::new_outgoing(CallId::new("c1"), CallMediaType::Video)
    }

    fn incoming() -> CurrentCall {
        CurrentCall::new_incoming(CallId::new("c2"), UserId::new("u9"), CallMediaType::Audio)
    }

    /// Flow: Initiating → OutgoingRinging → Active → Ended
    #[test]
    fn test_outgoing_call_flow() {
        let mut call = outgoing();
        assert_eq!(call.phase, CallPhase::Initiating);

        call.apply_transition(CallTransition::InviteSent).unwrap();
        assert!(call.is_ringing());

        call.apply_transition(CallTransition::RemoteAccepted)
            .unwrap();
        assert!(call.is_active());
        assert!(call.connected_at.is_some());

        call.apply_transition(CallTransition::Terminated {
            reason: CallEndReason::UserEnded,
        })
        .unwrap();
        assert_eq!(call.phase, CallPhase::Ended);
        assert_eq!(call.end_reason, Some(CallEndReason::UserEnded));
    }

    /// Flow: IncomingRinging → AcceptInProgress → Active
    #[test]
    fn test_incoming_accept_flow() {
        let mut call = incoming();
        assert!(call.can_accept());

        call.apply_transition(CallTransition::AcceptStarted).unwrap();
        assert_eq!(call.phase, CallPhase::AcceptInProgress);
        assert!(!call.can_accept());

        call.apply_transition(CallTransition::AcceptSucceeded)
            .unwrap();
        assert!(call.is_active());
    }

    /// A failed accept restores IncomingRinging so a retry is possible.
    #[test]
    fn test_accept_failure_restores_ringing() {
        let mut call = incoming();
        call.apply_transition(CallTransition::AcceptStarted).unwrap();
        call.apply_transition(CallTransition::AcceptFailed).unwrap();
        assert!(call.can_accept());
    }

    #[test]
    fn test_decline_from_ringing() {
        let mut call = incoming();
        call.apply_transition(CallTransition::Terminated {
            reason: CallEndReason::UserEnded,
        })
        .unwrap();
        assert_eq!(call.phase, CallPhase::Ended);
    }

    #[test]
    fn test_invalid_transitions_are_rejected() {
        let mut call = outgoing();
        assert!(call.apply_transition(CallTransition::RemoteAccepted).is_err());
        assert!(call.apply_transition(CallTransition::AcceptStarted).is_err());

        let mut ended = incoming();
        ended
            .apply_transition(CallTransition::Terminated {
                reason: CallEndReason::Expired,
            })
            .unwrap();
        assert!(
            ended
                .apply_transition(CallTransition::Terminated {
                    reason: CallEndReason::UserEnded,
                })
                .is_err()
        );
    }
}
