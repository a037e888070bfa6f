//! Participant registry: the canonical set of call participants.
//!
//! Owned by the orchestrator; no network knowledge. All lookups key on the
//! normalized [`UserId`]. Display names come from the injected directory and
//! default to "Unknown", never a raw identifier.

use crate::media::MediaStream;
use crate::platform::ContactDirectory;
use crate::types::call::{MediaKind, UserId};
use chrono::{DateTime, Utc};
use log::debug;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

const UNKNOWN_NAME: &str = "Unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantStatus {
    /// Invited and still ringing.
    Invited,
    /// Joined the call room.
    Joined,
}

#[derive(Debug, Clone)]
pub struct Participant {
    pub user_id: UserId,
    pub name: String,
    pub is_local: bool,
    pub mic_muted: bool,
    pub video_muted: bool,
    pub stream: Option<Arc<MediaStream>>,
    /// Bumped on every track-set change; downstream refresh signal.
    pub stream_version: u64,
    pub status: ParticipantStatus,
    pub joined_at: DateTime<Utc>,
}

impl Participant {
    fn new(user_id: UserId, name: String, is_local: bool, status: ParticipantStatus) -> Self {
        Self {
            user_id,
            name,
            is_local,
            mic_muted: false,
            video_muted: false,
            stream: None,
            stream_version: 0,
            status,
            joined_at: Utc::now(),
        }
    }
}

/// Seed data for [`ParticipantRegistry::add`].
#[derive(Debug, Clone, Default)]
pub struct ParticipantSeed {
    /// Pre-resolved display name; when absent the directory is consulted.
    pub name: Option<String>,
    pub status: Option<ParticipantStatus>,
    pub stream: Option<Arc<MediaStream>>,
}

#[derive(Default)]
struct Inner {
    order: Vec<UserId>,
    entries: HashMap<UserId, Participant>,
}

pub struct ParticipantRegistry {
    local_id: UserId,
    local_name: String,
    directory: Arc<dyn ContactDirectory>,
    inner: RwLock<Inner>,
}

impl ParticipantRegistry {
    pub fn new(local_id: UserId, local_name: String, directory: Arc<dyn ContactDirectory>) -> Self {
        Self {
            local_id,
            local_name,
            directory,
            inner: RwLock::new(Inner::default()),
        }
    }

    pub fn local_id(&self) -> &UserId {
        &self.local_id
    }

    async fn resolve_name(&self, user_id: &UserId, seed: Option<String>) -> String {
        if let Some(name) = seed {
            return name;
        }
        self.directory
            .display_name(user_id)
            .await
            .unwrap_or_else(|| UNKNOWN_NAME.to_string())
    }

    /// Replaces the entire registry content: one participant per deduplicated
    /// id, plus the local participant when requested. All start as Invited.
    pub async fn initialize(
        &self,
        ids: &[UserId],
        local_stream: Option<Arc<MediaStream>>,
        include_local: bool,
    ) -> Vec<Participant> {
        let mut inner = Inner::default();

        if include_local {
            let mut local = Participant::new(
                self.local_id.clone(),
                self.local_name.clone(),
                true,
                ParticipantStatus::Joined,
            );
            if let Some(stream) = local_stream {
                local.stream = Some(stream);
                local.stream_version = 1;
            }
            inner.order.push(self.local_id.clone());
            inner.entries.insert(self.local_id.clone(), local);
        }

        for id in ids {
            if *id == self.local_id || inner.entries.contains_key(id) {
                continue;
            }
            let name = self.resolve_name(id, None).await;
            inner.order.push(id.clone());
            inner.entries.insert(
                id.clone(),
                Participant::new(id.clone(), name, false, ParticipantStatus::Invited),
            );
        }

        let participants: Vec<Participant> = inner
            .order
            .iter()
            .filter_map(|id| inner.entries.get(id).cloned())
            .collect();

        *self.inner.write().await = inner;
        debug!(target: "Rtc/Participants", "Registry initialized with {} participants", participants.len());
        participants
    }

    /// Adds a participant. Returns None without touching state when the id is
    /// already present — the at-most-once-add invariant.
    pub async fn add(&self, user_id: &UserId, seed: ParticipantSeed) -> Option<Participant> {
        // Name resolution happens before taking the lock; re-check presence after.
        let name = self.resolve_name(user_id, seed.name.clone()).await;

        let mut inner = self.inner.write().await;
        if inner.entries.contains_key(user_id) {
            return None;
        }
        let mut participant = Participant::new(
            user_id.clone(),
            name,
            *user_id == self.local_id,
            seed.status.unwrap_or(ParticipantStatus::Invited),
        );
        if let Some(stream) = seed.stream {
            participant.stream = Some(stream);
            participant.stream_version = 1;
        }
        inner.order.push(user_id.clone());
        inner.entries.insert(user_id.clone(), participant.clone());
        Some(participant)
    }

    /// Removes a participant, stopping any tracks its stream owns.
    pub async fn remove(&self, user_id: &UserId) -> bool {
        let mut inner = self.inner.write().await;
        match inner.entries.remove(user_id) {
            Some(participant) => {
                inner.order.retain(|id| id != user_id);
                if let Some(stream) = participant.stream {
                    stream.stop_tracks();
                }
                true
            }
            None => false,
        }
    }

    /// No-op returning false when the id is absent.
    pub async fn update_mute(&self, user_id: &UserId, kind: MediaKind, muted: bool) -> bool {
        let mut inner = self.inner.write().await;
        match inner.entries.get_mut(user_id) {
            Some(participant) => {
                match kind {
                    MediaKind::Audio => participant.mic_muted = muted,
                    MediaKind::Video => participant.video_muted = muted,
                }
                true
            }
            None => false,
        }
    }

    /// Replaces the participant's stream handle and bumps its version.
    /// Returns the new version, or None when the id is absent.
    pub async fn set_stream(&self, user_id: &UserId, stream: Arc<MediaStream>) -> Option<u64> {
        let mut inner = self.inner.write().await;
        let participant = inner.entries.get_mut(user_id)?;
        participant.stream = Some(stream);
        participant.stream_version += 1;
        Some(participant.stream_version)
    }

    /// Overrides the display name, for server-provided info that outranks
    /// the directory fallback.
    pub async fn set_name(&self, user_id: &UserId, name: String) -> bool {
        let mut inner = self.inner.write().await;
        match inner.entries.get_mut(user_id) {
            Some(participant) => {
                participant.name = name;
                true
            }
            None => false,
        }
    }

    pub async fn set_status(&self, user_id: &UserId, status: ParticipantStatus) -> bool {
        let mut inner = self.inner.write().await;
        match inner.entries.get_mut(user_id) {
            Some(participant) => {
                participant.status = status;
                true
            }
            None => false,
        }
    }

    pub async fn get(&self, user_id: &UserId) -> Option<Participant> {
        self.inner.read().await.entries.get(user_id).cloned()
    }

    pub async fn contains(&self, user_id: &UserId) -> bool {
        self.inner.read().await.entries.contains_key(user_id)
    }

    /// Participants in insertion order.
    pub async fn list(&self) -> Vec<Participant> {
        let inner = self.inner.read().await;
        inner
            .order
            .iter()
            .filter_map(|id| inner.entries.get(id).cloned())
            .collect()
    }

    pub async fn count(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    /// Distinct non-local participants. Group mode iff this is >= 2.
    pub async fn others_count(&self) -> usize {
        self.inner
            .read()
            .await
            .entries
            .values()
            .filter(|p| !p.is_local)
            .count()
    }

    /// The single non-local participant, when exactly one exists.
    pub async fn sole_remote(&self) -> Option<Participant> {
        let inner = self.inner.read().await;
        let mut others = inner.entries.values().filter(|p| !p.is_local);
        let first = others.next()?.clone();
        match others.next() {
            None => Some(first),
            Some(_) => None,
        }
    }

    /// Empties the registry, stopping all tracks for all participants.
    pub async fn clear(&self) {
        let mut inner = self.inner.write().await;
        for participant in inner.entries.values() {
            if let Some(stream) = &participant.stream {
                stream.stop_tracks();
            }
        }
        inner.entries.clear();
        inner.order.clear();
    }
}
