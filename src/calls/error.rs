//! Call-related error types.

use crate::media::MediaError;
use crate::signaling::SignalError;
use crate::store::StoreError;
use crate::types::call::{MediaKind, UserId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("a call is already in progress")]
    CallInProgress,

    #[error("no active call")]
    NoActiveCall,

    #[error("no pending incoming call could be resolved")]
    NoPendingCall,

    #[error("an accept is already in progress")]
    AcceptInProgress,

    #[error("too many participants: {requested} exceeds the limit of {limit}")]
    TooManyParticipants { requested: usize, limit: usize },

    #[error("no participants were given")]
    NoParticipants,

    #[error("someone else is sharing their screen: {owner}")]
    ScreenShareBusy { owner: UserId },

    #[error("no active {0} producer")]
    ProducerMissing(MediaKind),

    #[error("invalid call state transition: {0}")]
    InvalidTransition(#[from] super::state::InvalidTransition),

    #[error("signaling error: {0}")]
    Signal(#[from] SignalError),

    #[error("media error: {0}")]
    Media(#[from] MediaError),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}
