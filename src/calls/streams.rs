//! Per-participant composite stream assembly.
//!
//! Tracks arrive asynchronously; the assembler merges them into one handle
//! per participant. A handle is never mutated: when the track set changes a
//! brand-new [`MediaStream`] is constructed, because the downstream renderer
//! detects "new media" only by handle identity change.

use crate::media::{MediaStream, MediaTrack};
use crate::types::call::{ProducerId, UserId};
use log::debug;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Default)]
pub struct StreamAssembler {
    streams: Mutex<HashMap<UserId, Arc<MediaStream>>>,
    producer_owners: Mutex<HashMap<ProducerId, UserId>>,
}

impl StreamAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges a track into a participant's composite stream.
    ///
    /// Identical track identity returns the existing handle unchanged.
    /// Otherwise any same-kind track is dropped (when `replace_same_kind`),
    /// the new track is appended, and a new handle wraps the result.
    pub fn add_track(
        &self,
        participant: &UserId,
        track: Arc<dyn MediaTrack>,
        replace_same_kind: bool,
    ) -> Arc<MediaStream> {
        let mut streams = self.streams.lock().expect("stream map poisoned");

        if let Some(existing) = streams.get(participant)
            && existing.has_track(track.id())
        {
            return existing.clone();
        }

        let mut tracks: Vec<Arc<dyn MediaTrack>> = match streams.get(participant) {
            Some(existing) => existing
                .tracks()
                .iter()
                .filter(|t| !(replace_same_kind && t.kind() == track.kind()))
                .cloned()
                .collect(),
            None => Vec::new(),
        };
        tracks.push(track);

        let stream = Arc::new(MediaStream::new(tracks));
        debug!(
            target: "Rtc/Streams",
            "New composite stream {} for {participant} ({} tracks)",
            stream.id(),
            stream.tracks().len()
        );
        streams.insert(participant.clone(), stream.clone());
        stream
    }

    pub fn get_stream(&self, participant: &UserId) -> Option<Arc<MediaStream>> {
        self.streams
            .lock()
            .expect("stream map poisoned")
            .get(participant)
            .cloned()
    }

    pub fn map_producer(&self, producer_id: ProducerId, participant: UserId) {
        self.producer_owners
            .lock()
            .expect("producer map poisoned")
            .insert(producer_id, participant);
    }

    pub fn participant_for(&self, producer_id: &ProducerId) -> Option<UserId> {
        self.producer_owners
            .lock()
            .expect("producer map poisoned")
            .get(producer_id)
            .cloned()
    }

    pub fn unmap_producer(&self, producer_id: &ProducerId) {
        self.producer_owners
            .lock()
            .expect("producer map poisoned")
            .remove(producer_id);
    }

    /// Stops the participant's tracks, drops the handle and purges every
    /// producer mapping pointing at them.
    pub fn remove(&self, participant: &UserId) {
        if let Some(stream) = self
            .streams
            .lock()
            .expect("stream map poisoned")
            .remove(participant)
        {
            stream.stop_tracks();
        }
        self.producer_owners
            .lock()
            .expect("producer map poisoned")
            .retain(|_, owner| owner != participant);
    }

    /// Stops every track across every participant and empties both maps.
    pub fn clear(&self) {
        let mut streams = self.streams.lock().expect("stream map poisoned");
        for stream in streams.values() {
            stream.stop_tracks();
        }
        streams.clear();
        self.producer_owners
            .lock()
            .expect("producer map poisoned")
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockTrack;
    use crate::types::call::MediaKind;

    #[test]
    fn test_same_track_identity_returns_same_handle() {
        let assembler = StreamAssembler::new();
        let participant = UserId::new("u2");
        let track = MockTrack::audio("a1");

        let first = assembler.add_track(&participant, track.clone(), true);
        let second = assembler.add_track(&participant, track, true);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.tracks().len(), 1);
    }

    #[test]
    fn test_same_kind_replacement_yields_new_handle_with_only_replacement() {
        let assembler = StreamAssembler::new();
        let participant = UserId::new("u2");
        let video_a = MockTrack::video("va");
        let video_b = MockTrack::video("vb");

        let first = assembler.add_track(&participant, video_a, true);
        let second = assembler.add_track(&participant, video_b, true);

        assert!(!Arc::ptr_eq(&first, &second));
        assert_ne!(first.id(), second.id());
        let video_tracks: Vec<_> = second
            .tracks()
            .iter()
            .filter(|t| t.kind() == MediaKind::Video)
            .collect();
        assert_eq!(video_tracks.len(), 1);
        assert_eq!(video_tracks[0].id(), "vb");
    }

    #[test]
    fn test_mixed_kinds_accumulate_in_arrival_order() {
        let assembler = StreamAssembler::new();
        let participant = UserId::new("u2");

        assembler.add_track(&participant, MockTrack::audio("a"), true);
        let stream = assembler.add_track(&participant, MockTrack::video("v"), true);
        assert_eq!(stream.tracks().len(), 2);
        assert_eq!(stream.tracks()[0].id(), "a");
        assert_eq!(stream.tracks()[1].id(), "v");
    }

    #[test]
    fn test_remove_stops_tracks_and_purges_mappings() {
        let assembler = StreamAssembler::new();
        let participant = UserId::new("u2");
        let track = MockTrack::audio("a");

        assembler.add_track(&participant, track.clone(), true);
        assembler.map_producer(ProducerId::new("p1"), participant.clone());
        assembler.map_producer(ProducerId::new("p2"), UserId::new("u3"));

        assembler.remove(&participant);
        assert!(track.is_stopped());
        assert!(assembler.get_stream(&participant).is_none());
        assert!(assembler.participant_for(&ProducerId::new("p1")).is_none());
        assert_eq!(
            assembler.participant_for(&ProducerId::new("p2")).unwrap(),
            UserId::new("u3")
        );
    }

    #[test]
    fn test_clear_empties_both_maps() {
        let assembler = StreamAssembler::new();
        let track = MockTrack::audio("a");
        assembler.add_track(&UserId::new("u2"), track.clone(), true);
        assembler.map_producer(ProducerId::new("p1"), UserId::new("u2"));

        assembler.clear();
        assert!(track.is_stopped());
        assert!(assembler.get_stream(&UserId::new("u2")).is_none());
        assert!(assembler.participant_for(&ProducerId::new("p1")).is_none());
    }
}
