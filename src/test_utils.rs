//! Scripted doubles for the injected seams: signaling transport, media
//! engine, telephony, directory and cue sink, plus a wired-up client harness
//! for the integration tests.

use crate::calls::manager::{CallCapabilities, CallManagerConfig};
use crate::client::RtcClient;
use crate::media::engine::{
    ConsumerOptions, DtlsParameters, LocalMedia, MediaConsumer, MediaEngine, MediaError,
    MediaProducer, MediaTrack, MediaTransport, RouterRtpCapabilities, RtpCapabilities,
    RtpParameters, TransportDirection, TransportOptions,
};
use crate::platform::{CallCue, ContactDirectory, NotificationSink, TelephonyUi};
use crate::signaling::SignalingChannel;
use crate::signaling::transport::{SignalTransport, SignalTransportFactory, TransportEvent};
use crate::store::MemoryKeyValueStore;
use crate::types::call::{CallMediaType, ConsumerId, MediaKind, ProducerId, TransportId, UserId};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc;

/// Lets spawned handlers and pumps finish before asserting.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

// ---------------------------------------------------------------------------
// Tracks
// ---------------------------------------------------------------------------

pub struct MockTrack {
    id: String,
    kind: MediaKind,
    stopped: AtomicBool,
}

impl MockTrack {
    pub fn new(id: impl Into<String>, kind: MediaKind) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            kind,
            stopped: AtomicBool::new(false),
        })
    }

    pub fn audio(id: impl Into<String>) -> Arc<Self> {
        Self::new(id, MediaKind::Audio)
    }

    pub fn video(id: impl Into<String>) -> Arc<Self> {
        Self::new(id, MediaKind::Video)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl MediaTrack for MockTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Media engine
// ---------------------------------------------------------------------------

#[derive(Default)]
struct EngineState {
    loaded: AtomicBool,
    counter: AtomicU64,
    fail_acquire: AtomicBool,
    producers_created: StdMutex<Vec<ProducerId>>,
    consumers_created: StdMutex<Vec<ConsumerId>>,
    local_tracks: StdMutex<Vec<Arc<MockTrack>>>,
    consumer_tracks: StdMutex<Vec<Arc<MockTrack>>>,
}

impl EngineState {
    fn next(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }
}

pub struct MockMediaEngine {
    state: Arc<EngineState>,
}

impl MockMediaEngine {
    pub fn new() -> Self {
        Self {
            state: Arc::new(EngineState::default()),
        }
    }

    pub fn created_producer_count(&self) -> usize {
        self.state
            .producers_created
            .lock()
            .expect("engine state poisoned")
            .len()
    }

    pub fn created_consumer_count(&self) -> usize {
        self.state
            .consumers_created
            .lock()
            .expect("engine state poisoned")
            .len()
    }

    /// Every local track this engine has handed out, for stop assertions.
    pub fn acquired_tracks(&self) -> Vec<Arc<MockTrack>> {
        self.state
            .local_tracks
            .lock()
            .expect("engine state poisoned")
            .clone()
    }

    /// Every remote track minted by a consumer, for stop assertions.
    pub fn consumer_tracks(&self) -> Vec<Arc<MockTrack>> {
        self.state
            .consumer_tracks
            .lock()
            .expect("engine state poisoned")
            .clone()
    }

    pub fn set_fail_acquire(&self, fail: bool) {
        self.state.fail_acquire.store(fail, Ordering::SeqCst);
    }
}

impl Default for MockMediaEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaEngine for MockMediaEngine {
    async fn load(&self, _capabilities: &RouterRtpCapabilities) -> Result<(), MediaError> {
        self.state.loaded.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_loaded(&self) -> bool {
        self.state.loaded.load(Ordering::SeqCst)
    }

    fn rtp_capabilities(&self) -> Result<RtpCapabilities, MediaError> {
        if !self.is_loaded() {
            return Err(MediaError::DeviceNotLoaded);
        }
        Ok(RtpCapabilities(json!({"mock": true})))
    }

    async fn create_transport(
        &self,
        direction: TransportDirection,
        options: &TransportOptions,
    ) -> Result<Arc<dyn MediaTransport>, MediaError> {
        Ok(Arc::new(MockTransport {
            id: options.id.clone(),
            direction,
            state: self.state.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn acquire_local_media(
        &self,
        call_type: CallMediaType,
    ) -> Result<LocalMedia, MediaError> {
        if self.state.fail_acquire.load(Ordering::SeqCst) {
            return Err(MediaError::Acquisition("mock acquisition refused".into()));
        }
        let n = self.state.next();
        let audio = MockTrack::audio(format!("local-audio-{n}"));
        let video = call_type
            .is_video()
            .then(|| MockTrack::video(format!("local-video-{n}")));
        {
            let mut tracks = self
                .state
                .local_tracks
                .lock()
                .expect("engine state poisoned");
            tracks.push(audio.clone());
            if let Some(v) = &video {
                tracks.push(v.clone());
            }
        }
        Ok(LocalMedia {
            audio,
            video: video.map(|v| v as Arc<dyn MediaTrack>),
        })
    }
}

struct MockTransport {
    id: TransportId,
    direction: TransportDirection,
    state: Arc<EngineState>,
    closed: AtomicBool,
}

#[async_trait]
impl MediaTransport for MockTransport {
    fn id(&self) -> TransportId {
        self.id.clone()
    }

    fn direction(&self) -> TransportDirection {
        self.direction
    }

    fn dtls_parameters(&self) -> DtlsParameters {
        DtlsParameters(json!({"fingerprint": "mock"}))
    }

    async fn prepare_producer(
        &self,
        track: Arc<dyn MediaTrack>,
    ) -> Result<RtpParameters, MediaError> {
        Ok(RtpParameters(json!({"track": track.id()})))
    }

    async fn create_producer(
        &self,
        producer_id: ProducerId,
        track: Arc<dyn MediaTrack>,
    ) -> Result<Arc<dyn MediaProducer>, MediaError> {
        self.state
            .producers_created
            .lock()
            .expect("engine state poisoned")
            .push(producer_id.clone());
        Ok(Arc::new(MockProducer {
            id: producer_id,
            kind: track.kind(),
            track,
            paused: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }))
    }

    async fn create_consumer(
        &self,
        options: &ConsumerOptions,
    ) -> Result<Arc<dyn MediaConsumer>, MediaError> {
        self.state
            .consumers_created
            .lock()
            .expect("engine state poisoned")
            .push(options.id.clone());
        let track = MockTrack::new(format!("remote-{}", options.producer_id), options.kind);
        self.state
            .consumer_tracks
            .lock()
            .expect("engine state poisoned")
            .push(track.clone());
        Ok(Arc::new(MockConsumer {
            id: options.id.clone(),
            kind: options.kind,
            track,
            resumed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct MockProducer {
    id: ProducerId,
    kind: MediaKind,
    track: Arc<dyn MediaTrack>,
    paused: AtomicBool,
    closed: AtomicBool,
}

#[async_trait]
impl MediaProducer for MockProducer {
    fn id(&self) -> ProducerId {
        self.id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn track(&self) -> Arc<dyn MediaTrack> {
        self.track.clone()
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    async fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    async fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct MockConsumer {
    id: ConsumerId,
    kind: MediaKind,
    track: Arc<MockTrack>,
    resumed: AtomicBool,
    closed: AtomicBool,
}

#[async_trait]
impl MediaConsumer for MockConsumer {
    fn id(&self) -> ConsumerId {
        self.id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn track(&self) -> Arc<dyn MediaTrack> {
        self.track.clone()
    }

    async fn resume(&self) {
        self.resumed.store(true, Ordering::SeqCst);
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Signaling transport
// ---------------------------------------------------------------------------

type ScriptedAck = Result<Value, String>;

/// In-memory signaling endpoint. Every request is recorded and acked from
/// the script table, falling back to a sensible default per op; pushes are
/// injected with [`MockSignalTransport::inject_event`].
pub struct MockSignalTransport {
    channel: Weak<SignalingChannel>,
    event_tx: mpsc::Sender<TransportEvent>,
    counter: AtomicU64,
    scripted: StdMutex<HashMap<String, VecDeque<ScriptedAck>>>,
    sent: StdMutex<Vec<(String, Value)>>,
}

impl MockSignalTransport {
    pub fn new(channel: Arc<SignalingChannel>) -> (Arc<Self>, mpsc::Receiver<TransportEvent>) {
        let (event_tx, event_rx) = mpsc::channel(64);
        let transport = Arc::new(Self {
            channel: Arc::downgrade(&channel),
            event_tx,
            counter: AtomicU64::new(0),
            scripted: StdMutex::new(HashMap::new()),
            sent: StdMutex::new(Vec::new()),
        });
        (transport, event_rx)
    }

    /// Queues one scripted ack for the next request with this op, overriding
    /// the default.
    pub fn script(&self, op: &str, ack: ScriptedAck) {
        self.scripted
            .lock()
            .expect("script table poisoned")
            .entry(op.to_string())
            .or_default()
            .push_back(ack);
    }

    /// Pushes a server event through the channel, as if the wire delivered it.
    pub async fn inject_event(&self, event: &str, data: Value) {
        let Some(channel) = self.channel.upgrade() else {
            return;
        };
        let frame =
            serde_json::to_vec(&json!({"event": event, "data": data})).expect("frame encodes");
        channel.handle_frame(&frame).await;
    }

    /// Every op sent so far, requests and notifies alike, in order.
    pub fn sent_ops(&self) -> Vec<String> {
        self.sent
            .lock()
            .expect("sent log poisoned")
            .iter()
            .map(|(op, _)| op.clone())
            .collect()
    }

    pub fn count_op(&self, op: &str) -> usize {
        self.sent
            .lock()
            .expect("sent log poisoned")
            .iter()
            .filter(|(sent_op, _)| sent_op == op)
            .count()
    }

    /// The data payloads sent for one op, in order.
    pub fn payloads_for(&self, op: &str) -> Vec<Value> {
        self.sent
            .lock()
            .expect("sent log poisoned")
            .iter()
            .filter(|(sent_op, _)| sent_op == op)
            .map(|(_, data)| data.clone())
            .collect()
    }

    /// Defaults keep the happy path scriptless. `create-consumer` defaults
    /// to an audio consumer; script it explicitly for video or screen.
    fn default_ack(&self, op: &str, data: &Value) -> Value {
        match op {
            "register" => json!({"success": true}),
            "start-call" => json!({"callId": "call-1", "routerCapabilities": {}}),
            "join-call" => json!({
                "participants": [],
                "creatorId": "creator",
                "alreadyJoined": [],
            }),
            "create-transport" => {
                let direction = data
                    .get("direction")
                    .and_then(|d| d.as_str())
                    .unwrap_or("unknown");
                json!({"transportOptions": {"id": format!("t-{direction}")}})
            }
            "create-producer" => {
                let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
                json!({"producerId": format!("prod-{n}")})
            }
            "create-consumer" => {
                let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
                json!({
                    "id": format!("cons-{n}"),
                    "producerId": data.get("producerId").cloned().unwrap_or(Value::Null),
                    "kind": "audio",
                })
            }
            "accept-call" => json!({"rtpCapabilities": {}}),
            "get-producers" => json!({"producers": []}),
            _ => json!({}),
        }
    }
}

#[async_trait]
impl SignalTransport for MockSignalTransport {
    async fn send_frame(&self, frame: &[u8]) -> Result<(), anyhow::Error> {
        let sent: Value = serde_json::from_slice(frame)?;
        let op = sent
            .get("op")
            .and_then(|o| o.as_str())
            .unwrap_or("")
            .to_string();
        let data = sent.get("data").cloned().unwrap_or(Value::Null);
        self.sent
            .lock()
            .expect("sent log poisoned")
            .push((op.clone(), data.clone()));

        let Some(id) = sent.get("id").and_then(|i| i.as_u64()) else {
            return Ok(()); // notify, no ack
        };

        let scripted = self
            .scripted
            .lock()
            .expect("script table poisoned")
            .get_mut(&op)
            .and_then(|queue| queue.pop_front());
        let ack = match scripted.unwrap_or_else(|| Ok(self.default_ack(&op, &data))) {
            Ok(value) => json!({"ack": id, "data": value}),
            Err(message) => json!({"ack": id, "error": message}),
        };

        if let Some(channel) = self.channel.upgrade() {
            let bytes = serde_json::to_vec(&ack)?;
            tokio::spawn(async move { channel.handle_frame(&bytes).await });
        }
        Ok(())
    }

    async fn disconnect(&self) {
        let _ = self.event_tx.send(TransportEvent::Disconnected).await;
    }
}

/// Factory handing out one pre-installed mock transport.
#[derive(Default)]
pub struct MockSignalTransportFactory {
    slot: StdMutex<Option<(Arc<dyn SignalTransport>, mpsc::Receiver<TransportEvent>)>>,
}

impl MockSignalTransportFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn install(
        &self,
        transport: Arc<dyn SignalTransport>,
        events: mpsc::Receiver<TransportEvent>,
    ) {
        *self.slot.lock().expect("factory slot poisoned") = Some((transport, events));
    }
}

#[async_trait]
impl SignalTransportFactory for MockSignalTransportFactory {
    async fn create_transport(
        &self,
    ) -> Result<(Arc<dyn SignalTransport>, mpsc::Receiver<TransportEvent>), anyhow::Error> {
        self.slot
            .lock()
            .expect("factory slot poisoned")
            .take()
            .ok_or_else(|| anyhow::anyhow!("no mock transport installed"))
    }
}

// ---------------------------------------------------------------------------
// Platform doubles
// ---------------------------------------------------------------------------

/// Fixed name table.
pub struct StaticDirectory {
    names: HashMap<String, String>,
}

impl StaticDirectory {
    pub fn new(entries: &[(&str, &str)]) -> Self {
        Self {
            names: entries
                .iter()
                .map(|(id, name)| (id.to_string(), name.to_string()))
                .collect(),
        }
    }
}

#[async_trait]
impl ContactDirectory for StaticDirectory {
    async fn display_name(&self, user_id: &UserId) -> Option<String> {
        self.names.get(user_id.as_str()).cloned()
    }
}

/// Telephony double recording every interaction.
#[derive(Default)]
pub struct RecordingTelephony {
    displayed: StdMutex<Vec<(String, UserId, String, bool)>>,
    answered: StdMutex<Vec<String>>,
    ended: StdMutex<Vec<String>>,
    end_all: AtomicUsize,
}

impl RecordingTelephony {
    pub fn displayed(&self) -> Vec<(String, UserId, String, bool)> {
        self.displayed.lock().expect("telephony log poisoned").clone()
    }

    pub fn answered(&self) -> Vec<String> {
        self.answered.lock().expect("telephony log poisoned").clone()
    }

    pub fn ended(&self) -> Vec<String> {
        self.ended.lock().expect("telephony log poisoned").clone()
    }

    pub fn end_all_count(&self) -> usize {
        self.end_all.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TelephonyUi for RecordingTelephony {
    async fn display_incoming_call(
        &self,
        uuid: &str,
        caller_id: &UserId,
        caller_name: &str,
        has_video: bool,
    ) {
        self.displayed.lock().expect("telephony log poisoned").push((
            uuid.to_string(),
            caller_id.clone(),
            caller_name.to_string(),
            has_video,
        ));
    }

    async fn answer_incoming_call(&self, uuid: &str) {
        self.answered
            .lock()
            .expect("telephony log poisoned")
            .push(uuid.to_string());
    }

    async fn end_call(&self, uuid: &str) {
        self.ended
            .lock()
            .expect("telephony log poisoned")
            .push(uuid.to_string());
    }

    async fn end_all_calls(&self) {
        self.end_all.fetch_add(1, Ordering::SeqCst);
    }
}

/// Cue sink recording every played cue.
#[derive(Default)]
pub struct RecordingSink {
    cues: StdMutex<Vec<CallCue>>,
}

impl RecordingSink {
    pub fn cues(&self) -> Vec<CallCue> {
        self.cues.lock().expect("cue log poisoned").clone()
    }
}

impl NotificationSink for RecordingSink {
    fn play(&self, cue: CallCue) {
        self.cues.lock().expect("cue log poisoned").push(cue);
    }
}

// ---------------------------------------------------------------------------
// Wired-up client harness
// ---------------------------------------------------------------------------

pub struct TestHarness {
    pub client: Arc<RtcClient>,
    pub transport: Arc<MockSignalTransport>,
    pub engine: Arc<MockMediaEngine>,
    pub telephony: Arc<RecordingTelephony>,
    pub sink: Arc<RecordingSink>,
    pub store: Arc<MemoryKeyValueStore>,
}

/// Builds and connects a client against mocks, with a contact directory
/// seeded from `directory` entries.
pub async fn connect_harness(
    local_id: &str,
    local_name: &str,
    directory: &[(&str, &str)],
) -> TestHarness {
    let factory = MockSignalTransportFactory::new();
    let engine = Arc::new(MockMediaEngine::new());
    let telephony = Arc::new(RecordingTelephony::default());
    let sink = Arc::new(RecordingSink::default());
    let store = Arc::new(MemoryKeyValueStore::new());

    let client = RtcClient::new(
        UserId::new(local_id),
        local_name.to_string(),
        factory.clone(),
        CallCapabilities {
            media_engine: engine.clone(),
            telephony: telephony.clone(),
            directory: Arc::new(StaticDirectory::new(directory)),
            notifications: sink.clone(),
            store: store.clone(),
        },
        CallManagerConfig {
            request_timeout: Duration::from_secs(1),
            ..CallManagerConfig::default()
        },
    );

    let (transport, transport_events) = MockSignalTransport::new(client.signaling());
    factory.install(transport.clone(), transport_events);
    client.connect().await.expect("mock connect succeeds");

    TestHarness {
        client,
        transport,
        engine,
        telephony,
        sink,
        store,
    }
}
