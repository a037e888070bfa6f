//! Server-pushed event handling.
//!
//! The signaling channel decodes pushes into [`ServerEvent`] values; this
//! module folds them into call state. Every handler is written to tolerate
//! duplicates and stale events — the server may redeliver, and events for a
//! call that already ended must not disturb a newer one.

use super::manager::CallManager;
use super::participants::{ParticipantSeed, ParticipantStatus};
use super::state::{CallPhase, CallTransition};
use crate::platform::CallCue;
use crate::signaling::protocol::{
    CallAcceptedEvent, CallIdEvent, IncomingCallEvent, ParticipantEvent, ProducerAnnouncement,
    ProducerClosedEvent, ServerEvent,
};
use crate::types::call::{CallEndReason, MediaKind, MediaSource, UserId};
use crate::types::events::RtcEvent;
use log::{debug, info, warn};

impl CallManager {
    /// Entry point for the event pump.
    pub async fn handle_server_event(&self, event: ServerEvent) {
        match event {
            ServerEvent::IncomingCall(ev) => self.handle_incoming_call(ev).await,
            ServerEvent::CallAccepted(ev) => self.handle_call_accepted(ev).await,
            ServerEvent::NewProducer(announcement) => {
                self.handle_new_producer(announcement).await
            }
            ServerEvent::ProducerClosed(ev) => self.handle_producer_closed(ev).await,
            ServerEvent::ParticipantJoined(ev) => self.handle_participant_joined(ev).await,
            ServerEvent::ParticipantInvited(ev) => self.handle_participant_invited(ev).await,
            ServerEvent::ParticipantNoAnswer(ev) => self.handle_participant_no_answer(ev).await,
            ServerEvent::ParticipantLeft(ev) => self.handle_participant_left(ev).await,
            ServerEvent::CallExpired(ev) => self.handle_call_expired(ev).await,
            ServerEvent::CallEnded(ev) => self.handle_call_ended(ev).await,
            ServerEvent::RemoteMute {
                user_id,
                kind,
                muted,
            } => self.handle_remote_mute(user_id, kind, muted).await,
        }
    }

    async fn handle_incoming_call(&self, ev: IncomingCallEvent) {
        let caller_name = self.compose_caller_name(&ev).await;

        // Redelivery for the call we are already ringing (or setting up):
        // refresh display info only.
        let known = self.incoming_call_id().await.as_ref() == Some(&ev.call_id)
            || self
                .current
                .read()
                .await
                .as_ref()
                .is_some_and(|c| c.call_id == ev.call_id);
        if known {
            debug!(target: "Rtc/Calls", "Re-sighting of incoming call {}", ev.call_id);
            self.refresh_incoming_name(&ev.call_id, &caller_name).await;
            self.events.emit(RtcEvent::IncomingCall {
                call_id: ev.call_id,
                caller_id: ev.caller_id,
                caller_name,
                call_type: ev.call_type,
            });
            return;
        }
        if self.current.read().await.is_some() {
            // Busy with a different call; one non-idle call per client.
            info!(
                target: "Rtc/Calls",
                "Ignoring incoming call {} while another call is active", ev.call_id
            );
            return;
        }

        info!(
            target: "Rtc/Calls",
            "Incoming {:?} call {} from {} ({caller_name})",
            ev.call_type, ev.call_id, ev.caller_id
        );
        let uuid = self.record_incoming(&ev, caller_name.clone()).await;
        *self.current.write().await = Some(super::state::CurrentCall::new_incoming(
            ev.call_id.clone(),
            ev.caller_id.clone(),
            ev.call_type,
        ));

        self.telephony()
            .display_incoming_call(&uuid, &ev.caller_id, &caller_name, ev.call_type.is_video())
            .await;
        self.events.emit(RtcEvent::IncomingCall {
            call_id: ev.call_id,
            caller_id: ev.caller_id,
            caller_name,
            call_type: ev.call_type,
        });
        self.events.emit(RtcEvent::PhaseChanged {
            phase: CallPhase::IncomingRinging,
        });
    }

    async fn handle_call_accepted(&self, ev: CallAcceptedEvent) {
        {
            let mut current = self.current.write().await;
            let Some(call) = current.as_mut() else {
                return;
            };
            if let Some(call_id) = &ev.call_id
                && *call_id != call.call_id
            {
                return;
            }
            if call.phase != CallPhase::OutgoingRinging {
                return;
            }
            if let Err(e) = call.apply_transition(CallTransition::RemoteAccepted) {
                warn!(target: "Rtc/Calls", "call-accepted out of order: {e}");
                return;
            }
        }
        if let Some(user_id) = &ev.user_id {
            self.registry.set_status(user_id, ParticipantStatus::Joined).await;
            self.events.emit(RtcEvent::ParticipantUpdated {
                user_id: user_id.clone(),
            });
        }
        self.events.emit(RtcEvent::PhaseChanged {
            phase: CallPhase::Active,
        });
    }

    /// A producer appeared in the room. Consumed immediately when the recv
    /// transport exists; buffered in arrival order otherwise, for the join
    /// sequence to drain.
    async fn handle_new_producer(&self, announcement: ProducerAnnouncement) {
        let Some(call_id) = self.current.read().await.as_ref().map(|c| c.call_id.clone())
        else {
            debug!(
                target: "Rtc/Calls",
                "Dropping producer announcement {} with no call", announcement.producer_id
            );
            return;
        };
        if announcement.user_id == *self.local_user_id() {
            return;
        }
        if self.negotiation.is_consumed(&announcement.producer_id) {
            return;
        }
        if !self.negotiation.has_recv_transport().await {
            let mut queue = self
                .pending_producers
                .lock()
                .expect("pending queue poisoned");
            if !queue
                .iter()
                .any(|a| a.producer_id == announcement.producer_id)
            {
                debug!(
                    target: "Rtc/Calls",
                    "Buffering producer {} until the recv transport exists",
                    announcement.producer_id
                );
                queue.push_back(announcement);
            }
            return;
        }
        if let Err(e) = self.consume_announcement(&call_id, &announcement).await {
            warn!(
                target: "Rtc/Calls",
                "Failed to consume announced producer {}: {e}", announcement.producer_id
            );
        }
    }

    async fn handle_producer_closed(&self, ev: ProducerClosedEvent) {
        let Some(entry) = self.negotiation.close_consumer(&ev.producer_id).await else {
            // Duplicate close, or a producer we never consumed.
            return;
        };
        self.assembler.unmap_producer(&ev.producer_id);

        if entry.source == MediaSource::Screen {
            self.events.emit(RtcEvent::ScreenShareChanged);
            return;
        }
        if self.refresh_remote_peer().await {
            self.events.emit(RtcEvent::RemotePeerChanged);
        }
        self.events.emit(RtcEvent::ParticipantUpdated {
            user_id: entry.participant,
        });
    }

    async fn handle_participant_joined(&self, ev: ParticipantEvent) {
        if ev.user_id == *self.local_user_id() {
            return;
        }
        if !self
            .registry
            .set_status(&ev.user_id, ParticipantStatus::Joined)
            .await
        {
            // A party we were never told about; fold it in.
            self.registry
                .add(
                    &ev.user_id,
                    ParticipantSeed {
                        status: Some(ParticipantStatus::Joined),
                        ..Default::default()
                    },
                )
                .await;
        }
        self.notifications.play(CallCue::ParticipantJoined);

        // First join answers an outgoing ringing call.
        let now_active = {
            let mut current = self.current.write().await;
            match current.as_mut() {
                Some(call) if call.phase == CallPhase::OutgoingRinging => {
                    call.apply_transition(CallTransition::RemoteAccepted).is_ok()
                }
                _ => false,
            }
        };
        if now_active {
            self.events.emit(RtcEvent::PhaseChanged {
                phase: CallPhase::Active,
            });
        }
        if self.refresh_remote_peer().await {
            self.events.emit(RtcEvent::RemotePeerChanged);
        }
        self.events.emit(RtcEvent::ParticipantsChanged);
    }

    async fn handle_participant_invited(&self, ev: ParticipantEvent) {
        if ev.user_id == *self.local_user_id() {
            return;
        }
        if self
            .registry
            .add(
                &ev.user_id,
                ParticipantSeed {
                    status: Some(ParticipantStatus::Invited),
                    ..Default::default()
                },
            )
            .await
            .is_none()
        {
            return;
        }
        // Another party inviting a third dissolves our 1:1 view too.
        if self.refresh_remote_peer().await {
            self.events.emit(RtcEvent::RemotePeerChanged);
        }
        self.events.emit(RtcEvent::ParticipantsChanged);
    }

    async fn handle_participant_no_answer(&self, ev: ParticipantEvent) {
        let invited = self
            .registry
            .get(&ev.user_id)
            .await
            .is_some_and(|p| p.status == ParticipantStatus::Invited);
        if !invited {
            return;
        }
        self.registry.remove(&ev.user_id).await;
        if self.refresh_remote_peer().await {
            self.events.emit(RtcEvent::RemotePeerChanged);
        }
        self.events.emit(RtcEvent::ParticipantsChanged);

        if self.registry.others_count().await == 0 {
            info!(target: "Rtc/Calls", "Nobody answered; ending call");
            self.teardown(true, CallEndReason::Expired).await;
        }
    }

    async fn handle_participant_left(&self, ev: ParticipantEvent) {
        if ev.user_id == *self.local_user_id() {
            return;
        }
        let closed = self.negotiation.close_consumers_for(&ev.user_id).await;
        for producer_id in &closed {
            self.assembler.unmap_producer(producer_id);
        }
        self.assembler.remove(&ev.user_id);
        if let Some(share) = self.negotiation.active_screen_share()
            && share.owner == ev.user_id
        {
            self.negotiation.clear_screen_share_if(&share.producer_id);
            self.events.emit(RtcEvent::ScreenShareChanged);
        }
        if !self.registry.remove(&ev.user_id).await {
            return;
        }
        self.notifications.play(CallCue::ParticipantLeft);
        info!(target: "Rtc/Calls", "Participant {} left", ev.user_id);

        let others = self.registry.others_count().await;
        if others == 0 {
            // Last remote party gone; the room is over.
            self.teardown(false, CallEndReason::RemoteEnded).await;
            return;
        }
        if self.refresh_remote_peer().await {
            // Group shrank back to 1:1; the survivor's established stream
            // handle carries over into the single slot untouched.
            self.events.emit(RtcEvent::RemotePeerChanged);
        }
        self.events.emit(RtcEvent::ParticipantsChanged);
    }

    /// Expiry races the accept: by the time the server's expiry timer fires
    /// the local accept may already be under way. The event only clears
    /// state when the call demonstrably did not progress.
    async fn handle_call_expired(&self, ev: CallIdEvent) {
        let accepted = self
            .accepted_call
            .lock()
            .expect("accept marker poisoned")
            .as_ref()
            == Some(&ev.call_id);
        if accepted {
            debug!(target: "Rtc/Calls", "Ignoring expiry of accepted call {}", ev.call_id);
            return;
        }
        if self.negotiation.has_recv_transport().await
            || self.negotiation.has_send_transport().await
        {
            debug!(
                target: "Rtc/Calls",
                "Ignoring expiry of call {} with live transports", ev.call_id
            );
            return;
        }
        let matches = self.incoming_call_id().await.as_ref() == Some(&ev.call_id)
            || self
                .current
                .read()
                .await
                .as_ref()
                .is_some_and(|c| c.call_id == ev.call_id);
        if !matches {
            return;
        }
        info!(target: "Rtc/Calls", "Call {} expired unanswered", ev.call_id);
        self.teardown(false, CallEndReason::Expired).await;
    }

    async fn handle_call_ended(&self, ev: CallIdEvent) {
        let matches = self
            .current
            .read()
            .await
            .as_ref()
            .is_some_and(|c| c.call_id == ev.call_id)
            || self.incoming_call_id().await.as_ref() == Some(&ev.call_id);
        if !matches {
            return;
        }
        self.teardown(false, CallEndReason::RemoteEnded).await;
    }

    /// Group mode routes to the registry entry; 1:1 mode updates the single
    /// slot, guarded against stale events from a previous topology.
    async fn handle_remote_mute(&self, user_id: UserId, kind: MediaKind, muted: bool) {
        if self.registry.others_count().await >= 2 {
            if self.registry.update_mute(&user_id, kind, muted).await {
                self.events.emit(RtcEvent::MuteChanged {
                    user_id,
                    kind,
                    muted,
                });
            }
            return;
        }

        let displayed = self
            .remote_peer()
            .await
            .is_some_and(|peer| peer.user_id == user_id);
        if !displayed {
            debug!(
                target: "Rtc/Calls",
                "Dropping mute event for {user_id}: not the displayed remote party"
            );
            return;
        }
        self.registry.update_mute(&user_id, kind, muted).await;
        if self.refresh_remote_peer().await {
            self.events.emit(RtcEvent::RemotePeerChanged);
        }
        self.events.emit(RtcEvent::MuteChanged {
            user_id,
            kind,
            muted,
        });
    }
}
