//! Capability seams for the host platform.
//!
//! The call core consumes these, it never implements them: the OS telephony
//! UI (native incoming-call screen), the contact directory, audible cues and
//! the foreground/background signal all live outside this crate and are
//! injected at construction.

use crate::types::call::UserId;
use async_trait::async_trait;

/// OS-level telephony UI: the native incoming-call screen and its
/// answer/end affordances.
#[async_trait]
pub trait TelephonyUi: Send + Sync {
    /// Present the native incoming-call screen.
    async fn display_incoming_call(
        &self,
        uuid: &str,
        caller_id: &UserId,
        caller_name: &str,
        has_video: bool,
    );

    /// Mark the native call as answered so the OS call screen releases.
    async fn answer_incoming_call(&self, uuid: &str);

    /// End the native call with the given uuid.
    async fn end_call(&self, uuid: &str);

    /// End every native call this app owns. Used when no uuid is resolvable.
    async fn end_all_calls(&self);
}

/// Contact-name resolution, delegated to the host application.
#[async_trait]
pub trait ContactDirectory: Send + Sync {
    /// Display name for a user, or None when the directory does not know them.
    async fn display_name(&self, user_id: &UserId) -> Option<String>;
}

/// Audible cue kinds the orchestrator triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallCue {
    ParticipantJoined,
    ParticipantLeft,
}

/// Fire-and-forget audible-cue trigger. Stateless pass-through.
pub trait NotificationSink: Send + Sync {
    fn play(&self, cue: CallCue);
}

/// Host application foreground/background state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppLifecycle {
    Foreground,
    Background,
}

/// Telephony that does nothing. Default for headless hosts and tests.
#[derive(Debug, Default)]
pub struct NullTelephonyUi;

#[async_trait]
impl TelephonyUi for NullTelephonyUi {
    async fn display_incoming_call(
        &self,
        _uuid: &str,
        _caller_id: &UserId,
        _caller_name: &str,
        _has_video: bool,
    ) {
    }

    async fn answer_incoming_call(&self, _uuid: &str) {}

    async fn end_call(&self, _uuid: &str) {}

    async fn end_all_calls(&self) {}
}

/// Directory that resolves nobody.
#[derive(Debug, Default)]
pub struct EmptyDirectory;

#[async_trait]
impl ContactDirectory for EmptyDirectory {
    async fn display_name(&self, _user_id: &UserId) -> Option<String> {
        None
    }
}

/// Sink that swallows every cue.
#[derive(Debug, Default)]
pub struct SilentNotificationSink;

impl NotificationSink for SilentNotificationSink {
    fn play(&self, _cue: CallCue) {}
}
