//! Identifier and call metadata types.
//!
//! Every identifier crossing the signaling boundary is normalized exactly once
//! into one of the newtypes below; the rest of the crate never keys a map on a
//! raw string.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl AsRef<str>) -> Self {
                Self(id.as_ref().trim().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::new(value)
            }
        }
    };
}

string_id!(
    /// Opaque stable user identifier, string-normalized at the signaling boundary.
    UserId
);
string_id!(
    /// Server-assigned call identifier.
    CallId
);
string_id!(
    /// Server-assigned producer identifier.
    ProducerId
);
string_id!(
    /// Server-assigned consumer identifier.
    ConsumerId
);
string_id!(
    /// Media transport identifier as assigned by the SFU.
    TransportId
);

/// Whether a call carries audio only or audio + video.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallMediaType {
    Audio,
    Video,
}

impl CallMediaType {
    pub fn is_video(&self) -> bool {
        matches!(self, Self::Video)
    }
}

/// Direction of the current call from the local client's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

/// Kind of a single media track or producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Origin of a produced track. Screen-share video never merges into the
/// camera composite stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaSource {
    Mic,
    Camera,
    Screen,
}

impl MediaSource {
    /// Default source for an announcement that carries no explicit source tag.
    pub fn default_for(kind: MediaKind) -> Self {
        match kind {
            MediaKind::Audio => MediaSource::Mic,
            MediaKind::Video => MediaSource::Camera,
        }
    }
}

/// Why a call reached the Ended phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CallEndReason {
    /// The local user hung up or declined.
    UserEnded,
    /// The server pushed `call-ended`.
    RemoteEnded,
    /// The callee-side invite timed out (`call-expired`).
    Expired,
    /// Setup or acceptance failed.
    Failed,
}

/// Directory info the server attaches to room participants.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantInfo {
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

impl ParticipantInfo {
    /// Best display name this record can produce, if any.
    pub fn display_name(&self) -> Option<String> {
        match (&self.first_name, &self.last_name) {
            (Some(first), Some(last)) => Some(format!("{first} {last}")),
            (Some(first), None) => Some(first.clone()),
            (None, Some(last)) => Some(last.clone()),
            (None, None) => self.username.clone(),
        }
    }
}
