//! Call manager: the orchestrating state machine.
//!
//! One explicitly-constructed instance per client; no ambient singletons.
//! All call state lives here behind short-lived locks — no lock is held
//! across a suspension point. Critical sections that span signaling round
//! trips are delimited by explicit guard flags (`accept_in_progress`,
//! `setup_in_progress`, the accepted-call marker), each cleared on every
//! exit path.

use super::error::CallError;
use super::participants::{ParticipantRegistry, ParticipantSeed, ParticipantStatus};
use super::state::{CallPhase, CallTransition, CurrentCall};
use super::streams::StreamAssembler;
use crate::media::engine::{
    ActiveScreenShare, LocalMedia, MediaEngine, MediaStream, MediaTrack, RouterRtpCapabilities,
};
use crate::media::negotiation::{ConsumedMedia, MediaNegotiationEngine};
use crate::platform::{AppLifecycle, ContactDirectory, NotificationSink, TelephonyUi};
use crate::signaling::SignalingChannel;
use crate::signaling::protocol::{
    AcceptCallRequest, AcceptCallResponse, AddParticipantsRequest, CloseProducerNotify,
    GetProducersRequest, GetProducersResponse, JoinCallRequest, JoinCallResponse, LeaveCallNotify,
    MuteNotify, ProducerAnnouncement, StartCallRequest, StartCallResponse,
};
use crate::store::{KeyValueStore, PendingCallRecord, PendingCallStore};
use crate::types::call::{
    CallEndReason, CallId, CallMediaType, MediaKind, MediaSource, ParticipantInfo, UserId,
};
use crate::types::events::{RtcEvent, RtcEventBus};
use log::{debug, info, warn};
use rand::RngCore;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::RwLock;

/// Configuration for the call manager.
#[derive(Debug, Clone)]
pub struct CallManagerConfig {
    /// Maximum total participants per call, local included.
    pub max_participants: usize,
    /// Timeout applied to every signaling round trip.
    pub request_timeout: Duration,
    /// Capacity of the UI event broadcast channel.
    pub event_channel_capacity: usize,
}

impl Default for CallManagerConfig {
    fn default() -> Self {
        Self {
            max_participants: 10,
            request_timeout: Duration::from_secs(15),
            event_channel_capacity: 100,
        }
    }
}

/// Which path invoked the accept: the in-app UI tap or the OS telephony
/// answer callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptTrigger {
    Ui,
    Telephony,
}

/// The single-slot 1:1 view of the one remote party.
#[derive(Debug, Clone)]
pub struct RemotePeer {
    pub user_id: UserId,
    pub name: String,
    pub mic_muted: bool,
    pub video_muted: bool,
    pub stream: Option<Arc<MediaStream>>,
    pub stream_version: u64,
}

/// Last-seen incoming-call context, the middle link of the accept fallback
/// chain (in-memory call → this snapshot → durable record).
#[derive(Debug, Clone)]
struct IncomingSnapshot {
    call_id: CallId,
    caller_id: UserId,
    call_type: CallMediaType,
    caller_name: String,
    uuid: String,
    participants: Vec<UserId>,
    rtp_capabilities: Option<RouterRtpCapabilities>,
    participants_info: HashMap<UserId, ParticipantInfo>,
}

/// Resolved context for one accept attempt.
struct AcceptContext {
    call_id: CallId,
    caller_id: UserId,
    call_type: CallMediaType,
    uuid: String,
    caller_name: String,
    participants: Vec<UserId>,
    participants_info: HashMap<UserId, ParticipantInfo>,
}

/// Injected platform and engine capabilities.
pub struct CallCapabilities {
    pub media_engine: Arc<dyn MediaEngine>,
    pub telephony: Arc<dyn TelephonyUi>,
    pub directory: Arc<dyn ContactDirectory>,
    pub notifications: Arc<dyn NotificationSink>,
    pub store: Arc<dyn KeyValueStore>,
}

pub struct CallManager {
    local_id: UserId,
    config: CallManagerConfig,
    channel: Arc<SignalingChannel>,
    pub(crate) negotiation: MediaNegotiationEngine,
    engine: Arc<dyn MediaEngine>,
    pub(crate) registry: ParticipantRegistry,
    pub(crate) assembler: StreamAssembler,
    telephony: Arc<dyn TelephonyUi>,
    directory: Arc<dyn ContactDirectory>,
    pub(crate) notifications: Arc<dyn NotificationSink>,
    pending_store: PendingCallStore,
    pub(crate) events: RtcEventBus,

    pub(crate) current: RwLock<Option<CurrentCall>>,
    local_media: RwLock<Option<LocalMedia>>,
    remote_peer: RwLock<Option<RemotePeer>>,
    incoming: RwLock<Option<IncomingSnapshot>>,
    /// Producer announcements that arrived before the recv transport existed,
    /// in arrival order.
    pub(crate) pending_producers: StdMutex<VecDeque<ProducerAnnouncement>>,
    accept_in_progress: AtomicBool,
    setup_in_progress: AtomicBool,
    /// Call id whose accept already completed; duplicate accepts no-op.
    pub(crate) accepted_call: StdMutex<Option<CallId>>,
    mic_mute_requested: AtomicBool,
    video_mute_requested: AtomicBool,
    /// Synthetic backgrounding pause, distinct from a user-requested mute.
    video_auto_paused: AtomicBool,
}

impl CallManager {
    pub fn new(
        local_id: UserId,
        local_name: String,
        channel: Arc<SignalingChannel>,
        capabilities: CallCapabilities,
        config: CallManagerConfig,
    ) -> Arc<Self> {
        let events = RtcEventBus::new(config.event_channel_capacity);
        Arc::new(Self {
            registry: ParticipantRegistry::new(
                local_id.clone(),
                local_name,
                capabilities.directory.clone(),
            ),
            assembler: StreamAssembler::new(),
            negotiation: MediaNegotiationEngine::new(
                capabilities.media_engine.clone(),
                channel.clone(),
            ),
            engine: capabilities.media_engine,
            telephony: capabilities.telephony,
            directory: capabilities.directory,
            notifications: capabilities.notifications,
            pending_store: PendingCallStore::new(capabilities.store),
            events,
            local_id,
            config,
            channel,
            current: RwLock::new(None),
            local_media: RwLock::new(None),
            remote_peer: RwLock::new(None),
            incoming: RwLock::new(None),
            pending_producers: StdMutex::new(VecDeque::new()),
            accept_in_progress: AtomicBool::new(false),
            setup_in_progress: AtomicBool::new(false),
            accepted_call: StdMutex::new(None),
            mic_mute_requested: AtomicBool::new(false),
            video_mute_requested: AtomicBool::new(false),
            video_auto_paused: AtomicBool::new(false),
        })
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn local_user_id(&self) -> &UserId {
        &self.local_id
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<RtcEvent> {
        self.events.subscribe()
    }

    pub async fn current_call(&self) -> Option<CurrentCall> {
        self.current.read().await.clone()
    }

    pub async fn phase(&self) -> CallPhase {
        self.current
            .read()
            .await
            .as_ref()
            .map(|c| c.phase)
            .unwrap_or(CallPhase::Idle)
    }

    pub async fn participants(&self) -> Vec<super::participants::Participant> {
        self.registry.list().await
    }

    pub async fn remote_peer(&self) -> Option<RemotePeer> {
        self.remote_peer.read().await.clone()
    }

    pub fn active_screen_share(&self) -> Option<ActiveScreenShare> {
        self.negotiation.active_screen_share()
    }

    /// Group iff the distinct-other-participant count is >= 2. Invited
    /// placeholders count, so a mid-upgrade call presents as group
    /// optimistically.
    pub async fn is_group(&self) -> bool {
        self.registry.others_count().await >= 2
    }

    async fn current_call_id(&self) -> Option<CallId> {
        self.current.read().await.as_ref().map(|c| c.call_id.clone())
    }

    // -----------------------------------------------------------------------
    // start_call
    // -----------------------------------------------------------------------

    /// Starts an outgoing call to the given participants.
    pub async fn start_call(
        &self,
        participant_ids: Vec<UserId>,
        call_type: CallMediaType,
    ) -> Result<CallId, CallError> {
        if self.current.read().await.is_some() {
            return Err(CallError::CallInProgress);
        }
        if self.setup_in_progress.swap(true, Ordering::SeqCst) {
            return Err(CallError::CallInProgress);
        }
        let _guard = scopeguard::guard((), |_| {
            self.setup_in_progress.store(false, Ordering::Relaxed);
        });

        let mut ids: Vec<UserId> = Vec::new();
        for id in participant_ids {
            if id != self.local_id && !ids.contains(&id) {
                ids.push(id);
            }
        }
        if ids.is_empty() {
            return Err(CallError::NoParticipants);
        }
        if ids.len() + 1 > self.config.max_participants {
            return Err(CallError::TooManyParticipants {
                requested: ids.len() + 1,
                limit: self.config.max_participants,
            });
        }

        // Media acquisition comes first: failure here aborts with no call
        // state created at all.
        let media = self.engine.acquire_local_media(call_type).await?;
        *self.local_media.write().await = Some(media.clone());

        match self.run_start(&ids, call_type, &media).await {
            Ok(call_id) => Ok(call_id),
            Err(e) => {
                warn!(target: "Rtc/Calls", "start_call failed: {e}");
                self.teardown(false, CallEndReason::Failed).await;
                Err(e)
            }
        }
    }

    async fn run_start(
        &self,
        ids: &[UserId],
        call_type: CallMediaType,
        media: &LocalMedia,
    ) -> Result<CallId, CallError> {
        let resp: StartCallResponse = self
            .channel
            .request(
                "start-call",
                &StartCallRequest {
                    to_user_ids: ids,
                    call_type,
                },
            )
            .await?;
        let call_id = resp.call_id.clone();
        info!(target: "Rtc/Calls", "Starting {call_type:?} call {call_id} to {} peers", ids.len());

        *self.current.write().await = Some(CurrentCall::new_outgoing(call_id.clone(), call_type));
        self.events.emit(RtcEvent::PhaseChanged {
            phase: CallPhase::Initiating,
        });

        self.negotiation.load_device(&resp.router_capabilities).await?;

        let join: JoinCallResponse = self
            .channel
            .request("join-call", &JoinCallRequest { call_id: &call_id })
            .await?;

        // Recv before send: a producer announcement must never find the
        // room joined but the recv transport absent for longer than needed.
        self.negotiation.create_recv_transport(&call_id).await?;
        self.negotiation.create_send_transport(&call_id).await?;

        // Registry before producing, so consume-driven participant creation
        // cannot race ahead of the canonical list.
        let local_stream = Arc::new(MediaStream::new(media.tracks()));
        self.registry
            .initialize(ids, Some(local_stream), true)
            .await;
        self.apply_room_roster(&join).await;
        self.refresh_remote_peer().await;
        self.events.emit(RtcEvent::ParticipantsChanged);

        self.negotiation.produce(&call_id, media, call_type).await?;

        self.drain_pending_producers(&call_id).await;
        self.consume_room_producers(&call_id).await?;

        {
            let mut current = self.current.write().await;
            if let Some(call) = current.as_mut() {
                call.apply_transition(CallTransition::InviteSent)?;
            }
        }
        self.events.emit(RtcEvent::PhaseChanged {
            phase: CallPhase::OutgoingRinging,
        });
        Ok(call_id)
    }

    /// Folds a join-call roster into the registry: unseen participants are
    /// added, server-reported joined ids get Joined status, server-provided
    /// names override directory fallbacks.
    async fn apply_room_roster(&self, join: &JoinCallResponse) {
        for id in &join.participants {
            if *id == self.local_id {
                continue;
            }
            self.registry.add(id, ParticipantSeed::default()).await;
        }
        for id in &join.already_joined {
            self.registry.set_status(id, ParticipantStatus::Joined).await;
        }
        for (id, info) in &join.participants_info {
            if let Some(name) = info.display_name() {
                self.registry.set_name(id, name).await;
            }
        }
    }

    // -----------------------------------------------------------------------
    // process_accept
    // -----------------------------------------------------------------------

    /// Accepts the pending incoming call. Safe to invoke from the in-app UI
    /// and from the OS telephony answer callback concurrently: side effects
    /// execute exactly once.
    pub async fn process_accept(&self, trigger: AcceptTrigger) -> Result<(), CallError> {
        let ctx = self.resolve_accept_context().await?;

        if self.accepted_call.lock().expect("accept marker poisoned").as_ref()
            == Some(&ctx.call_id)
        {
            debug!(target: "Rtc/Calls", "Call {} already accepted, no-op", ctx.call_id);
            return Ok(());
        }
        if self.accept_in_progress.swap(true, Ordering::SeqCst) {
            return Err(CallError::AcceptInProgress);
        }
        let _guard = scopeguard::guard((), |_| {
            self.accept_in_progress.store(false, Ordering::Relaxed);
        });
        // Re-check after winning the flag; a racing duplicate may have
        // completed between our first check and the swap.
        if self.accepted_call.lock().expect("accept marker poisoned").as_ref()
            == Some(&ctx.call_id)
        {
            return Ok(());
        }

        // Cold start via push wake: no in-memory call yet.
        {
            let mut current = self.current.write().await;
            match current.as_mut() {
                Some(call) if call.can_accept() => {
                    call.apply_transition(CallTransition::AcceptStarted)?;
                }
                Some(_) => {}
                None => {
                    let mut call = CurrentCall::new_incoming(
                        ctx.call_id.clone(),
                        ctx.caller_id.clone(),
                        ctx.call_type,
                    );
                    call.apply_transition(CallTransition::AcceptStarted)?;
                    *current = Some(call);
                }
            }
        }
        self.events.emit(RtcEvent::PhaseChanged {
            phase: CallPhase::AcceptInProgress,
        });

        // Answer the OS call screen only for the UI path; the telephony path
        // already answered itself.
        if trigger == AcceptTrigger::Ui && !ctx.uuid.is_empty() {
            self.telephony.answer_incoming_call(&ctx.uuid).await;
        }

        match self.run_accept(&ctx).await {
            Ok(()) => {
                *self.accepted_call.lock().expect("accept marker poisoned") =
                    Some(ctx.call_id.clone());
                {
                    let mut current = self.current.write().await;
                    if let Some(call) = current.as_mut() {
                        call.apply_transition(CallTransition::AcceptSucceeded)?;
                    }
                }
                if let Err(e) = self.pending_store.clear().await {
                    warn!(target: "Rtc/Calls", "Failed to clear pending-call record: {e}");
                }
                self.events.emit(RtcEvent::PhaseChanged {
                    phase: CallPhase::Active,
                });
                info!(target: "Rtc/Calls", "Call {} is active", ctx.call_id);
                Ok(())
            }
            Err(e) => {
                warn!(target: "Rtc/Calls", "Accept of call {} failed: {e}", ctx.call_id);
                let mut current = self.current.write().await;
                if let Some(call) = current.as_mut()
                    && call.phase == CallPhase::AcceptInProgress
                {
                    let _ = call.apply_transition(CallTransition::AcceptFailed);
                    self.events.emit(RtcEvent::PhaseChanged {
                        phase: CallPhase::IncomingRinging,
                    });
                }
                Err(e)
            }
        }
    }

    /// Fallback chain: in-memory current call, then the last-seen incoming
    /// snapshot, then the durable record. When nothing resolves the
    /// telephony UI is released so the OS call screen does not stay stuck.
    async fn resolve_accept_context(&self) -> Result<AcceptContext, CallError> {
        let snapshot = self.incoming.read().await.clone();

        if let Some(call) = self.current.read().await.as_ref()
            && call.direction == crate::types::call::CallDirection::Incoming
            && let Some(caller) = call.caller.clone()
        {
            let (uuid, caller_name, participants, participants_info) = match &snapshot {
                Some(snap) if snap.call_id == call.call_id => (
                    snap.uuid.clone(),
                    snap.caller_name.clone(),
                    snap.participants.clone(),
                    snap.participants_info.clone(),
                ),
                _ => (String::new(), String::new(), Vec::new(), HashMap::new()),
            };
            return Ok(AcceptContext {
                call_id: call.call_id.clone(),
                caller_id: caller,
                call_type: call.call_type,
                uuid,
                caller_name,
                participants,
                participants_info,
            });
        }

        if let Some(snap) = snapshot {
            return Ok(AcceptContext {
                call_id: snap.call_id,
                caller_id: snap.caller_id,
                call_type: snap.call_type,
                uuid: snap.uuid,
                caller_name: snap.caller_name,
                participants: snap.participants,
                participants_info: snap.participants_info,
            });
        }

        match self.pending_store.load().await? {
            Some(record) => {
                let snap = IncomingSnapshot {
                    call_id: record.call_id.clone(),
                    caller_id: record.caller_id.clone(),
                    call_type: record.call_type,
                    caller_name: record.caller_name.clone(),
                    uuid: record.uuid.clone(),
                    participants: record.participants.clone(),
                    rtp_capabilities: record
                        .rtp_capabilities
                        .clone()
                        .map(RouterRtpCapabilities),
                    participants_info: record.participants_info.clone(),
                };
                *self.incoming.write().await = Some(snap.clone());
                Ok(AcceptContext {
                    call_id: snap.call_id,
                    caller_id: snap.caller_id,
                    call_type: snap.call_type,
                    uuid: snap.uuid,
                    caller_name: snap.caller_name,
                    participants: snap.participants,
                    participants_info: snap.participants_info,
                })
            }
            None => {
                self.telephony.end_all_calls().await;
                Err(CallError::NoPendingCall)
            }
        }
    }

    async fn run_accept(&self, ctx: &AcceptContext) -> Result<(), CallError> {
        let call_id = &ctx.call_id;
        let resp: AcceptCallResponse = self
            .channel
            .request(
                "accept-call",
                &AcceptCallRequest {
                    call_id,
                    from_user_id: &ctx.caller_id,
                },
            )
            .await?;

        // A partial earlier attempt may have left transports behind.
        self.negotiation.reset_transports().await;
        self.negotiation.load_device(&resp.rtp_capabilities).await?;

        let join: JoinCallResponse = self
            .channel
            .request("join-call", &JoinCallRequest { call_id })
            .await?;

        self.negotiation.create_recv_transport(call_id).await?;
        self.negotiation.create_send_transport(call_id).await?;

        let media = self.ensure_local_media(ctx.call_type).await?;

        // Topology: room participants unioned with the originating caller,
        // excluding the local id.
        let mut others: Vec<UserId> = Vec::new();
        for id in join
            .participants
            .iter()
            .chain(ctx.participants.iter())
            .chain(std::iter::once(&ctx.caller_id))
        {
            if *id != self.local_id && !others.contains(id) {
                others.push(id.clone());
            }
        }

        let local_stream = Arc::new(MediaStream::new(media.tracks()));
        self.registry
            .initialize(&others, Some(local_stream), true)
            .await;
        for id in &join.already_joined {
            self.registry.set_status(id, ParticipantStatus::Joined).await;
        }
        // The caller is in the room by definition.
        self.registry
            .set_status(&ctx.caller_id, ParticipantStatus::Joined)
            .await;
        for (id, info) in join.participants_info.iter().chain(ctx.participants_info.iter()) {
            if let Some(name) = info.display_name() {
                self.registry.set_name(id, name).await;
            }
        }
        if !ctx.caller_name.is_empty() {
            self.registry
                .set_name(&ctx.caller_id, ctx.caller_name.clone())
                .await;
        }
        self.refresh_remote_peer().await;
        self.events.emit(RtcEvent::ParticipantsChanged);

        // No producer is duplicated here: produce of an existing
        // (kind, source) pair is a no-op returning the existing id.
        self.negotiation.produce(call_id, &media, ctx.call_type).await?;

        self.drain_pending_producers(call_id).await;
        self.consume_room_producers(call_id).await?;
        Ok(())
    }

    /// Reuses the held local media when it matches the call type, otherwise
    /// acquires (or upgrades to) the required track set.
    async fn ensure_local_media(
        &self,
        call_type: CallMediaType,
    ) -> Result<LocalMedia, CallError> {
        {
            let held = self.local_media.read().await;
            if let Some(media) = held.as_ref()
                && (!call_type.is_video() || media.video.is_some())
            {
                return Ok(media.clone());
            }
        }
        let media = self.engine.acquire_local_media(call_type).await?;
        if let Some(previous) = self.local_media.write().await.replace(media.clone()) {
            previous.stop_all();
        }
        Ok(media)
    }

    // -----------------------------------------------------------------------
    // decline / end
    // -----------------------------------------------------------------------

    /// Declines the pending incoming call.
    pub async fn decline_call(&self) -> Result<(), CallError> {
        let ringing = self
            .current
            .read()
            .await
            .as_ref()
            .is_some_and(|c| c.can_accept());
        if !ringing {
            return Err(CallError::NoActiveCall);
        }
        self.teardown(true, CallEndReason::UserEnded).await;
        Ok(())
    }

    /// Ends the current call. Idempotent: a second call is a no-op.
    pub async fn end_call(&self, emit_to_server: bool) {
        self.teardown(emit_to_server, CallEndReason::UserEnded).await;
    }

    /// Full teardown: stop all media, close producers/consumers/transports,
    /// clear registry and assembler, reset every guard flag, release the
    /// durable record and the telephony UI.
    pub(crate) async fn teardown(&self, notify_server: bool, reason: CallEndReason) {
        let current = self.current.write().await.take();
        let snapshot = self.incoming.write().await.take();

        if notify_server
            && let Some(call) = &current
            && let Err(e) = self
                .channel
                .notify("leave-call", &LeaveCallNotify { call_id: &call.call_id })
                .await
        {
            debug!(target: "Rtc/Calls", "leave-call notify failed: {e}");
        }

        self.negotiation.close_all().await;
        if let Some(media) = self.local_media.write().await.take() {
            media.stop_all();
        }
        self.registry.clear().await;
        self.assembler.clear();
        *self.remote_peer.write().await = None;
        self.pending_producers
            .lock()
            .expect("pending queue poisoned")
            .clear();
        *self.accepted_call.lock().expect("accept marker poisoned") = None;
        self.mic_mute_requested.store(false, Ordering::Relaxed);
        self.video_mute_requested.store(false, Ordering::Relaxed);
        self.video_auto_paused.store(false, Ordering::Relaxed);

        if let Err(e) = self.pending_store.clear().await {
            warn!(target: "Rtc/Calls", "Failed to clear pending-call record: {e}");
        }
        // Only incoming calls ever put up a native call screen.
        match &snapshot {
            Some(snap) if !snap.uuid.is_empty() => self.telephony.end_call(&snap.uuid).await,
            Some(_) => self.telephony.end_all_calls().await,
            None => {}
        }

        if let Some(mut call) = current {
            info!(target: "Rtc/Calls", "Call {} ended: {reason:?}", call.call_id);
            let _ = call.apply_transition(CallTransition::Terminated { reason });
            self.events.emit(RtcEvent::CallEnded { reason });
            self.events.emit(RtcEvent::PhaseChanged {
                phase: CallPhase::Idle,
            });
        }
    }

    // -----------------------------------------------------------------------
    // add_participants
    // -----------------------------------------------------------------------

    /// Invites more participants to the current call, upgrading a 1:1 call
    /// to group optimistically. Server events reconcile the placeholder
    /// state afterwards.
    pub async fn add_participants(&self, participant_ids: Vec<UserId>) -> Result<(), CallError> {
        let call_id = self.current_call_id().await.ok_or(CallError::NoActiveCall)?;

        let mut new_ids: Vec<UserId> = Vec::new();
        for id in participant_ids {
            if id != self.local_id && !new_ids.contains(&id) && !self.registry.contains(&id).await
            {
                new_ids.push(id);
            }
        }
        if new_ids.is_empty() {
            // Everyone requested is already part of the call.
            return Ok(());
        }
        let total = self.registry.count().await + new_ids.len();
        if total > self.config.max_participants {
            return Err(CallError::TooManyParticipants {
                requested: total,
                limit: self.config.max_participants,
            });
        }

        let was_one_to_one = self.registry.others_count().await == 1;
        let mut added: Vec<UserId> = Vec::new();
        for id in &new_ids {
            if self
                .registry
                .add(
                    id,
                    ParticipantSeed {
                        status: Some(ParticipantStatus::Invited),
                        ..Default::default()
                    },
                )
                .await
                .is_some()
            {
                added.push(id.clone());
            }
        }

        if was_one_to_one {
            // Upgrade: the existing remote's registry entry already carries
            // its established stream, so its tile does not go dark; only the
            // single-slot view dissolves.
            if self.refresh_remote_peer().await {
                self.events.emit(RtcEvent::RemotePeerChanged);
            }
        }
        self.events.emit(RtcEvent::ParticipantsChanged);

        match self
            .channel
            .request_ack(
                "add-participants",
                &AddParticipantsRequest {
                    call_id: &call_id,
                    participant_ids: &added,
                },
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => {
                // Roll the optimistic placeholders back.
                for id in &added {
                    self.registry.remove(id).await;
                }
                if self.refresh_remote_peer().await {
                    self.events.emit(RtcEvent::RemotePeerChanged);
                }
                self.events.emit(RtcEvent::ParticipantsChanged);
                Err(e.into())
            }
        }
    }

    // -----------------------------------------------------------------------
    // mute / screen share / backgrounding
    // -----------------------------------------------------------------------

    /// Toggles the local producer of the given kind. The producer itself is
    /// paused — the remote side must observe the pause, which a merely
    /// disabled-but-still-producing track would not deliver. Returns the new
    /// muted state.
    pub async fn toggle_mute(&self, kind: MediaKind) -> Result<bool, CallError> {
        let call_id = self.current_call_id().await.ok_or(CallError::NoActiveCall)?;

        let requested = match kind {
            MediaKind::Audio => &self.mic_mute_requested,
            MediaKind::Video => &self.video_mute_requested,
        };
        let muted = !requested.load(Ordering::SeqCst);

        let producer_id = self
            .negotiation
            .set_producer_paused(kind, muted)
            .await
            .ok_or(CallError::ProducerMissing(kind))?;
        requested.store(muted, Ordering::SeqCst);
        if kind == MediaKind::Video && !muted {
            // A manual unmute also cancels any pending auto-resume.
            self.video_auto_paused.store(false, Ordering::SeqCst);
        }

        self.notify_mute(&call_id, kind, &producer_id, muted).await;

        if self.is_group().await {
            self.registry.update_mute(&self.local_id, kind, muted).await;
        }
        self.events.emit(RtcEvent::MuteChanged {
            user_id: self.local_id.clone(),
            kind,
            muted,
        });
        Ok(muted)
    }

    async fn notify_mute(
        &self,
        call_id: &CallId,
        kind: MediaKind,
        producer_id: &crate::types::call::ProducerId,
        muted: bool,
    ) {
        let op = match kind {
            MediaKind::Audio => "mute-audio",
            MediaKind::Video => "mute-video",
        };
        if let Err(e) = self
            .channel
            .notify(
                op,
                &MuteNotify {
                    call_id,
                    producer_id,
                    muted,
                },
            )
            .await
        {
            warn!(target: "Rtc/Calls", "{op} notify failed: {e}");
        }
    }

    /// Starts sharing the given screen track. Rejected while another party's
    /// share occupies the single slot.
    pub async fn start_screen_share(
        &self,
        track: Arc<dyn MediaTrack>,
    ) -> Result<(), CallError> {
        let call_id = self.current_call_id().await.ok_or(CallError::NoActiveCall)?;
        if let Some(share) = self.negotiation.active_screen_share()
            && share.owner != self.local_id
        {
            return Err(CallError::ScreenShareBusy { owner: share.owner });
        }

        let producer_id = self
            .negotiation
            .produce_track(&call_id, track.clone(), MediaSource::Screen)
            .await?;
        self.negotiation.set_screen_share(Some(ActiveScreenShare {
            owner: self.local_id.clone(),
            producer_id,
            stream: Arc::new(MediaStream::new(vec![track])),
        }));
        self.events.emit(RtcEvent::ScreenShareChanged);
        Ok(())
    }

    /// Stops the local screen share. No-op when none is active.
    pub async fn stop_screen_share(&self) -> Result<(), CallError> {
        let Some(call_id) = self.current_call_id().await else {
            return Ok(());
        };
        let Some(producer_id) = self
            .negotiation
            .close_producer(MediaKind::Video, MediaSource::Screen)
            .await
        else {
            return Ok(());
        };
        if let Err(e) = self
            .channel
            .notify(
                "close-producer",
                &CloseProducerNotify {
                    call_id: &call_id,
                    producer_id: &producer_id,
                },
            )
            .await
        {
            warn!(target: "Rtc/Calls", "close-producer notify failed: {e}");
        }
        self.negotiation.clear_screen_share_if(&producer_id);
        self.events.emit(RtcEvent::ScreenShareChanged);
        Ok(())
    }

    /// Backgrounding: during an active video call with an unpaused video
    /// producer, leaving the foreground pauses it and notifies peers of a
    /// synthetic mute; returning auto-resumes only when the user did not
    /// also mute manually.
    pub async fn on_app_state_change(&self, state: AppLifecycle) {
        match state {
            AppLifecycle::Background => {
                let video_call_active = self
                    .current
                    .read()
                    .await
                    .as_ref()
                    .is_some_and(|c| c.is_active() && c.call_type.is_video());
                if !video_call_active {
                    return;
                }
                if self.negotiation.is_producer_paused(MediaKind::Video).await != Some(false) {
                    return;
                }
                let Some(call_id) = self.current_call_id().await else {
                    return;
                };
                if let Some(producer_id) = self
                    .negotiation
                    .set_producer_paused(MediaKind::Video, true)
                    .await
                {
                    self.video_auto_paused.store(true, Ordering::SeqCst);
                    self.notify_mute(&call_id, MediaKind::Video, &producer_id, true)
                        .await;
                    debug!(target: "Rtc/Calls", "Backgrounded: video producer auto-paused");
                }
            }
            AppLifecycle::Foreground => {
                if !self.video_auto_paused.swap(false, Ordering::SeqCst) {
                    return;
                }
                if self.video_mute_requested.load(Ordering::SeqCst) {
                    return;
                }
                let Some(call_id) = self.current_call_id().await else {
                    return;
                };
                if let Some(producer_id) = self
                    .negotiation
                    .set_producer_paused(MediaKind::Video, false)
                    .await
                {
                    self.notify_mute(&call_id, MediaKind::Video, &producer_id, false)
                        .await;
                    debug!(target: "Rtc/Calls", "Foregrounded: video producer auto-resumed");
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Shared consume plumbing (also driven by the event handlers)
    // -----------------------------------------------------------------------

    /// Fetches the room's current producers and consumes each; one bad
    /// producer must not block the rest of the call from connecting.
    pub(crate) async fn consume_room_producers(&self, call_id: &CallId) -> Result<(), CallError> {
        let resp: GetProducersResponse = self
            .channel
            .request("get-producers", &GetProducersRequest { call_id })
            .await?;
        for announcement in resp.producers {
            if announcement.user_id == self.local_id {
                continue;
            }
            if let Err(e) = self.consume_announcement(call_id, &announcement).await {
                warn!(
                    target: "Rtc/Calls",
                    "Failed to consume producer {}: {e}",
                    announcement.producer_id
                );
            }
        }
        Ok(())
    }

    /// Drains announcements buffered before the recv transport existed, in
    /// arrival order.
    pub(crate) async fn drain_pending_producers(&self, call_id: &CallId) {
        loop {
            let announcement = self
                .pending_producers
                .lock()
                .expect("pending queue poisoned")
                .pop_front();
            let Some(announcement) = announcement else {
                break;
            };
            debug!(
                target: "Rtc/Calls",
                "Draining queued producer {}",
                announcement.producer_id
            );
            if let Err(e) = self.consume_announcement(call_id, &announcement).await {
                warn!(
                    target: "Rtc/Calls",
                    "Failed to consume queued producer {}: {e}",
                    announcement.producer_id
                );
            }
        }
    }

    pub(crate) async fn consume_announcement(
        &self,
        call_id: &CallId,
        announcement: &ProducerAnnouncement,
    ) -> Result<(), CallError> {
        let source = announcement.source_or_default();
        let consumed = self
            .negotiation
            .consume(
                call_id,
                &announcement.producer_id,
                &announcement.user_id,
                announcement.kind,
                source,
            )
            .await?;
        if let Some(consumed) = consumed {
            self.attach_consumed(consumed).await;
        }
        Ok(())
    }

    async fn attach_consumed(&self, consumed: ConsumedMedia) {
        if consumed.source == MediaSource::Screen {
            self.events.emit(RtcEvent::ScreenShareChanged);
            return;
        }

        if !self.registry.contains(&consumed.participant).await {
            // First knowledge of this party arrived as media.
            self.registry
                .add(
                    &consumed.participant,
                    ParticipantSeed {
                        status: Some(ParticipantStatus::Joined),
                        ..Default::default()
                    },
                )
                .await;
            self.events.emit(RtcEvent::ParticipantsChanged);
        }

        let stream = self
            .assembler
            .add_track(&consumed.participant, consumed.track.clone(), true);
        self.assembler
            .map_producer(consumed.producer_id.clone(), consumed.participant.clone());
        let version = self
            .registry
            .set_stream(&consumed.participant, stream)
            .await
            .unwrap_or(0);

        if self.refresh_remote_peer().await {
            self.events.emit(RtcEvent::RemotePeerChanged);
        }
        self.events.emit(RtcEvent::RemoteStreamChanged {
            user_id: consumed.participant,
            version,
        });
    }

    /// Rebuilds the 1:1 single-slot view from the registry. Returns whether
    /// it changed. On a group→1:1 downgrade the surviving participant's
    /// existing stream handle carries over as-is — no recreation, no black
    /// flash.
    pub(crate) async fn refresh_remote_peer(&self) -> bool {
        let candidate = if self.registry.others_count().await == 1 {
            self.registry.sole_remote().await.map(|p| RemotePeer {
                user_id: p.user_id,
                name: p.name,
                mic_muted: p.mic_muted,
                video_muted: p.video_muted,
                stream: p.stream,
                stream_version: p.stream_version,
            })
        } else {
            None
        };

        let mut slot = self.remote_peer.write().await;
        let changed = match (slot.as_ref(), candidate.as_ref()) {
            (None, None) => false,
            (Some(a), Some(b)) => {
                a.user_id != b.user_id
                    || a.stream_version != b.stream_version
                    || a.mic_muted != b.mic_muted
                    || a.video_muted != b.video_muted
                    || a.name != b.name
            }
            _ => true,
        };
        if changed {
            *slot = candidate;
        }
        changed
    }

    // -----------------------------------------------------------------------
    // Incoming-call bookkeeping (driven by the event handlers)
    // -----------------------------------------------------------------------

    pub(crate) async fn incoming_call_id(&self) -> Option<CallId> {
        self.incoming.read().await.as_ref().map(|s| s.call_id.clone())
    }

    pub(crate) async fn record_incoming(
        &self,
        event: &crate::signaling::protocol::IncomingCallEvent,
        caller_name: String,
    ) -> String {
        // Reuse the telephony uuid across re-sightings of the same call id.
        let uuid = match self.pending_store.load().await {
            Ok(Some(record)) if record.call_id == event.call_id => record.uuid,
            _ => {
                let mut bytes = [0u8; 16];
                rand::rng().fill_bytes(&mut bytes);
                hex::encode(bytes)
            }
        };

        let record = PendingCallRecord {
            call_id: event.call_id.clone(),
            uuid: uuid.clone(),
            caller_id: event.caller_id.clone(),
            call_type: event.call_type,
            caller_name: caller_name.clone(),
            participants: event.participants.clone(),
            rtp_capabilities: event.rtp_capabilities.clone().map(|c| c.0),
            participants_info: event.participants_info.clone(),
        };
        if let Err(e) = self.pending_store.save(&record).await {
            warn!(target: "Rtc/Calls", "Failed to persist pending-call record: {e}");
        }

        *self.incoming.write().await = Some(IncomingSnapshot {
            call_id: event.call_id.clone(),
            caller_id: event.caller_id.clone(),
            call_type: event.call_type,
            caller_name,
            uuid: uuid.clone(),
            participants: event.participants.clone(),
            rtp_capabilities: event.rtp_capabilities.clone(),
            participants_info: event.participants_info.clone(),
        });
        uuid
    }

    pub(crate) async fn refresh_incoming_name(&self, call_id: &CallId, caller_name: &str) {
        let mut snapshot = self.incoming.write().await;
        if let Some(snap) = snapshot.as_mut()
            && snap.call_id == *call_id
        {
            snap.caller_name = caller_name.to_string();
        }
    }

    /// Display-name chain for an incoming call: push-provided name, then
    /// multi-party composition, then directory lookup, then the raw id.
    pub(crate) async fn compose_caller_name(
        &self,
        event: &crate::signaling::protocol::IncomingCallEvent,
    ) -> String {
        if let Some(name) = &event.caller_name {
            return name.clone();
        }

        let resolve = |id: &UserId| {
            let info_name = event
                .participants_info
                .get(id)
                .and_then(|info| info.display_name());
            let id = id.clone();
            async move {
                if let Some(name) = info_name {
                    return Some(name);
                }
                self.directory.display_name(&id).await
            }
        };

        let other_parties: Vec<&UserId> = event
            .participants
            .iter()
            .filter(|id| **id != self.local_id && **id != event.caller_id)
            .collect();
        if !other_parties.is_empty() {
            let mut names = Vec::with_capacity(other_parties.len() + 1);
            names.push(
                resolve(&event.caller_id)
                    .await
                    .unwrap_or_else(|| event.caller_id.to_string()),
            );
            for id in other_parties {
                names.push(resolve(id).await.unwrap_or_else(|| id.to_string()));
            }
            return names.join(", ");
        }

        resolve(&event.caller_id)
            .await
            .unwrap_or_else(|| event.caller_id.to_string())
    }

    pub(crate) fn telephony(&self) -> &Arc<dyn TelephonyUi> {
        &self.telephony
    }
}
