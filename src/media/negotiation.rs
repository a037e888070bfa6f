//! Transport, producer and consumer bookkeeping against the SFU.
//!
//! Owns the per-call transport pair and the producer/consumer tables. All
//! mutation happens through the operations below; guard sets make the
//! critical sections that span signaling round trips explicit.

use crate::media::engine::{
    ActiveScreenShare, LocalMedia, MediaEngine, MediaError, MediaProducer, MediaStream,
    MediaTrack, MediaTransport, RouterRtpCapabilities, TransportDirection,
};
use crate::signaling::SignalingChannel;
use crate::signaling::protocol::{
    ConnectTransportRequest, CreateConsumerRequest, CreateConsumerResponse,
    CreateProducerRequest, CreateProducerResponse, CreateTransportRequest,
    CreateTransportResponse, ResumeConsumerRequest,
};
use crate::types::call::{
    CallId, CallMediaType, ConsumerId, MediaKind, MediaSource, ProducerId, UserId,
};
use dashmap::DashMap;
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::RwLock;

/// Bookkeeping for one active consumer.
#[derive(Clone)]
pub struct ConsumerEntry {
    pub consumer: Arc<dyn crate::media::engine::MediaConsumer>,
    pub participant: UserId,
    pub kind: MediaKind,
    pub source: MediaSource,
}

/// A remote track that was just consumed, for the orchestrator to route.
pub struct ConsumedMedia {
    pub producer_id: ProducerId,
    pub participant: UserId,
    pub kind: MediaKind,
    pub source: MediaSource,
    pub track: Arc<dyn MediaTrack>,
    pub consumer_id: ConsumerId,
}

pub struct MediaNegotiationEngine {
    engine: Arc<dyn MediaEngine>,
    channel: Arc<SignalingChannel>,
    send_transport: RwLock<Option<Arc<dyn MediaTransport>>>,
    recv_transport: RwLock<Option<Arc<dyn MediaTransport>>>,
    producers: RwLock<HashMap<(MediaKind, MediaSource), Arc<dyn MediaProducer>>>,
    consumers: DashMap<ProducerId, ConsumerEntry>,
    /// Producer ids with a consume currently in flight. Entry/exit points of
    /// the consume critical section; cleared on every exit path.
    consuming: StdMutex<HashSet<ProducerId>>,
    active_screen_share: StdMutex<Option<ActiveScreenShare>>,
}

impl MediaNegotiationEngine {
    pub fn new(engine: Arc<dyn MediaEngine>, channel: Arc<SignalingChannel>) -> Self {
        Self {
            engine,
            channel,
            send_transport: RwLock::new(None),
            recv_transport: RwLock::new(None),
            producers: RwLock::new(HashMap::new()),
            consumers: DashMap::new(),
            consuming: StdMutex::new(HashSet::new()),
            active_screen_share: StdMutex::new(None),
        }
    }

    /// Loads router capabilities into the device. A second call with the
    /// device already loaded is a no-op.
    pub async fn load_device(
        &self,
        capabilities: &RouterRtpCapabilities,
    ) -> Result<(), MediaError> {
        if self.engine.is_loaded() {
            debug!(target: "Rtc/Media", "Device already loaded, skipping");
            return Ok(());
        }
        self.engine.load(capabilities).await
    }

    pub async fn create_recv_transport(&self, call_id: &CallId) -> Result<(), MediaError> {
        self.create_transport(call_id, TransportDirection::Recv)
            .await
    }

    pub async fn create_send_transport(&self, call_id: &CallId) -> Result<(), MediaError> {
        self.create_transport(call_id, TransportDirection::Send)
            .await
    }

    async fn create_transport(
        &self,
        call_id: &CallId,
        direction: TransportDirection,
    ) -> Result<(), MediaError> {
        if !self.engine.is_loaded() {
            return Err(MediaError::DeviceNotLoaded);
        }
        let slot = match direction {
            TransportDirection::Send => &self.send_transport,
            TransportDirection::Recv => &self.recv_transport,
        };
        if slot.read().await.is_some() {
            return Err(MediaError::TransportExists(direction.as_str()));
        }

        let resp: CreateTransportResponse = self
            .channel
            .request(
                "create-transport",
                &CreateTransportRequest { call_id, direction },
            )
            .await?;

        let transport = self
            .engine
            .create_transport(direction, &resp.transport_options)
            .await?;

        // Connect handshake resolves only after the server ack.
        self.channel
            .request_ack(
                "connect-transport",
                &ConnectTransportRequest {
                    call_id,
                    transport_id: &transport.id(),
                    dtls_parameters: &transport.dtls_parameters(),
                },
            )
            .await?;

        info!(
            target: "Rtc/Media",
            "{} transport {} connected for call {call_id}",
            direction.as_str(),
            transport.id()
        );
        *slot.write().await = Some(transport);
        Ok(())
    }

    pub async fn has_recv_transport(&self) -> bool {
        self.recv_transport.read().await.is_some()
    }

    pub async fn has_send_transport(&self) -> bool {
        self.send_transport.read().await.is_some()
    }

    /// Produces local media: an audio producer always, a video producer
    /// additionally for video calls.
    pub async fn produce(
        &self,
        call_id: &CallId,
        media: &LocalMedia,
        call_type: CallMediaType,
    ) -> Result<(), MediaError> {
        self.produce_track(call_id, media.audio.clone(), MediaSource::Mic)
            .await?;
        if call_type.is_video()
            && let Some(video) = &media.video
        {
            self.produce_track(call_id, video.clone(), MediaSource::Camera)
                .await?;
        }
        Ok(())
    }

    /// Produce handshake for one track: local RTP parameters, then the
    /// `create-producer` round trip, then the server-assigned id is bound
    /// locally. Re-producing an existing (kind, source) pair is a no-op
    /// returning the existing id, which keeps accept retries safe.
    pub async fn produce_track(
        &self,
        call_id: &CallId,
        track: Arc<dyn MediaTrack>,
        source: MediaSource,
    ) -> Result<ProducerId, MediaError> {
        let kind = track.kind();
        if let Some(existing) = self.producers.read().await.get(&(kind, source)) {
            debug!(
                target: "Rtc/Media",
                "Producer for ({kind}, {source:?}) already exists: {}",
                existing.id()
            );
            return Ok(existing.id());
        }

        let transport = self
            .send_transport
            .read()
            .await
            .clone()
            .ok_or(MediaError::TransportMissing("send"))?;

        let rtp_parameters = transport.prepare_producer(track.clone()).await?;
        let resp: CreateProducerResponse = self
            .channel
            .request(
                "create-producer",
                &CreateProducerRequest {
                    call_id,
                    transport_id: &transport.id(),
                    kind,
                    rtp_parameters: &rtp_parameters,
                    app_data: Some(serde_json::json!({ "source": source })),
                },
            )
            .await?;

        let producer = transport
            .create_producer(resp.producer_id.clone(), track)
            .await?;
        let producer_id = producer.id();
        self.producers
            .write()
            .await
            .insert((kind, source), producer);

        info!(target: "Rtc/Media", "Producing {kind} ({source:?}) as {producer_id}");
        Ok(producer_id)
    }

    /// Consumes one remote producer.
    ///
    /// Returns `Ok(None)` when the consume is an expected no-op: the recv
    /// transport does not exist yet, or this producer id is already consumed
    /// or currently being consumed by a racing call.
    pub async fn consume(
        &self,
        call_id: &CallId,
        producer_id: &ProducerId,
        participant: &UserId,
        kind: MediaKind,
        source: MediaSource,
    ) -> Result<Option<ConsumedMedia>, MediaError> {
        let Some(transport) = self.recv_transport.read().await.clone() else {
            return Ok(None);
        };
        if self.consumers.contains_key(producer_id) {
            debug!(target: "Rtc/Media", "Producer {producer_id} already consumed, skipping");
            return Ok(None);
        }
        {
            let mut in_flight = self.consuming.lock().expect("consuming guard poisoned");
            if !in_flight.insert(producer_id.clone()) {
                debug!(target: "Rtc/Media", "Consume of {producer_id} already in flight, skipping");
                return Ok(None);
            }
        }
        let _guard = scopeguard::guard(producer_id.clone(), |id| {
            self.consuming
                .lock()
                .expect("consuming guard poisoned")
                .remove(&id);
        });

        let rtp_capabilities = self.engine.rtp_capabilities()?;
        let options: CreateConsumerResponse = self
            .channel
            .request(
                "create-consumer",
                &CreateConsumerRequest {
                    call_id,
                    producer_id,
                    rtp_capabilities: &rtp_capabilities,
                },
            )
            .await?;

        let consumer = transport.create_consumer(&options).await?;
        let consumer_id = consumer.id();
        let track = consumer.track();

        // Teardown may have interleaved with the round trip above; a consumer
        // installed now would outlive the call it belongs to.
        let transport_live = self
            .recv_transport
            .read()
            .await
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, &transport));
        if !transport_live {
            debug!(
                target: "Rtc/Media",
                "Recv transport gone mid-consume of {producer_id}, discarding"
            );
            consumer.close().await;
            track.stop();
            return Ok(None);
        }

        self.consumers.insert(
            producer_id.clone(),
            ConsumerEntry {
                consumer: consumer.clone(),
                participant: participant.clone(),
                kind,
                source,
            },
        );

        self.channel
            .request_ack(
                "resume-consumer",
                &ResumeConsumerRequest {
                    call_id,
                    consumer_id: &consumer_id,
                },
            )
            .await?;
        if !self.consumers.contains_key(producer_id) {
            // close_all raced the resume ack and already closed the entry.
            return Ok(None);
        }
        consumer.resume().await;

        // Screen-share video fills the single slot instead of the camera
        // composite. Competing remote shares resolve last-writer-wins.
        if source == MediaSource::Screen {
            let share = ActiveScreenShare {
                owner: participant.clone(),
                producer_id: producer_id.clone(),
                stream: Arc::new(MediaStream::new(vec![track.clone()])),
            };
            *self
                .active_screen_share
                .lock()
                .expect("screen share slot poisoned") = Some(share);
        }

        info!(
            target: "Rtc/Media",
            "Consuming {kind} producer {producer_id} from {participant} via consumer {consumer_id}"
        );
        Ok(Some(ConsumedMedia {
            producer_id: producer_id.clone(),
            participant: participant.clone(),
            kind,
            source,
            track,
            consumer_id,
        }))
    }

    /// Closes and forgets the consumer for a producer id. Clears the screen
    /// slot if that consumer owned it.
    pub async fn close_consumer(&self, producer_id: &ProducerId) -> Option<ConsumerEntry> {
        let (_, entry) = self.consumers.remove(producer_id)?;
        entry.consumer.close().await;
        entry.consumer.track().stop();
        self.clear_screen_share_if(producer_id);
        Some(entry)
    }

    /// Closes every consumer mapped to a participant; returns the producer
    /// ids that were closed.
    pub async fn close_consumers_for(&self, participant: &UserId) -> Vec<ProducerId> {
        let ids: Vec<ProducerId> = self
            .consumers
            .iter()
            .filter(|entry| entry.value().participant == *participant)
            .map(|entry| entry.key().clone())
            .collect();
        for id in &ids {
            self.close_consumer(id).await;
        }
        ids
    }

    pub fn is_consumed(&self, producer_id: &ProducerId) -> bool {
        self.consumers.contains_key(producer_id)
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    /// Pauses or resumes the camera/mic producer of the given kind. Returns
    /// the producer id, or None when no such producer exists.
    pub async fn set_producer_paused(
        &self,
        kind: MediaKind,
        paused: bool,
    ) -> Option<ProducerId> {
        let source = MediaSource::default_for(kind);
        let producer = self.producers.read().await.get(&(kind, source)).cloned()?;
        if paused {
            producer.pause().await;
        } else {
            producer.resume().await;
        }
        Some(producer.id())
    }

    pub async fn producer_id(&self, kind: MediaKind, source: MediaSource) -> Option<ProducerId> {
        self.producers
            .read()
            .await
            .get(&(kind, source))
            .map(|p| p.id())
    }

    pub async fn is_producer_paused(&self, kind: MediaKind) -> Option<bool> {
        let source = MediaSource::default_for(kind);
        self.producers
            .read()
            .await
            .get(&(kind, source))
            .map(|p| p.is_paused())
    }

    /// Closes one producer (screen share teardown) and returns its id.
    pub async fn close_producer(
        &self,
        kind: MediaKind,
        source: MediaSource,
    ) -> Option<ProducerId> {
        let producer = self.producers.write().await.remove(&(kind, source))?;
        let id = producer.id();
        producer.close().await;
        Some(id)
    }

    pub fn active_screen_share(&self) -> Option<ActiveScreenShare> {
        self.active_screen_share
            .lock()
            .expect("screen share slot poisoned")
            .clone()
    }

    pub fn set_screen_share(&self, share: Option<ActiveScreenShare>) {
        *self
            .active_screen_share
            .lock()
            .expect("screen share slot poisoned") = share;
    }

    /// Clears the screen slot when owned by this producer id.
    pub fn clear_screen_share_if(&self, producer_id: &ProducerId) -> bool {
        let mut slot = self
            .active_screen_share
            .lock()
            .expect("screen share slot poisoned");
        if slot.as_ref().is_some_and(|s| s.producer_id == *producer_id) {
            if let Some(share) = slot.take() {
                share.stream.stop_tracks();
            }
            return true;
        }
        false
    }

    /// Safety reset before re-accept, and the teardown path of `end_call`:
    /// closes every producer and consumer and both transports. The device
    /// stays loaded.
    pub async fn close_all(&self) {
        let producers: Vec<_> = self.producers.write().await.drain().collect();
        for (_, producer) in producers {
            producer.close().await;
        }

        let consumed: Vec<ProducerId> =
            self.consumers.iter().map(|e| e.key().clone()).collect();
        for id in consumed {
            if let Some((_, entry)) = self.consumers.remove(&id) {
                entry.consumer.close().await;
                entry.consumer.track().stop();
            }
        }

        if let Some(transport) = self.send_transport.write().await.take() {
            transport.close().await;
        }
        if let Some(transport) = self.recv_transport.write().await.take() {
            transport.close().await;
        }

        self.consuming
            .lock()
            .expect("consuming guard poisoned")
            .clear();
        if let Some(share) = self
            .active_screen_share
            .lock()
            .expect("screen share slot poisoned")
            .take()
        {
            share.stream.stop_tracks();
        }
        debug!(target: "Rtc/Media", "Media state reset");
    }

    /// Alias used by the accept path; stale transports from a partial
    /// earlier attempt must not leak into the new sequence.
    pub async fn reset_transports(&self) {
        if self.has_send_transport().await || self.has_recv_transport().await {
            warn!(target: "Rtc/Media", "Resetting stale transports before re-accept");
        }
        self.close_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockMediaEngine, MockSignalTransport};
    use std::time::Duration;

    async fn harness() -> (
        Arc<MediaNegotiationEngine>,
        Arc<MockMediaEngine>,
        Arc<MockSignalTransport>,
    ) {
        let _ = env_logger::builder().is_test(true).try_init();
        let (channel, _events) = SignalingChannel::new(Duration::from_secs(1), 16);
        let (transport, _transport_events) = MockSignalTransport::new(channel.clone());
        channel.attach(transport.clone()).await;
        let engine = Arc::new(MockMediaEngine::new());
        let negotiation = Arc::new(MediaNegotiationEngine::new(engine.clone(), channel));
        negotiation
            .load_device(&RouterRtpCapabilities(serde_json::json!({})))
            .await
            .unwrap();
        (negotiation, engine, transport)
    }

    #[tokio::test]
    async fn test_consume_without_recv_transport_is_a_noop() {
        let (negotiation, _engine, _transport) = harness().await;
        let result = negotiation
            .consume(
                &CallId::new("c1"),
                &ProducerId::new("p1"),
                &UserId::new("u2"),
                MediaKind::Audio,
                MediaSource::Mic,
            )
            .await
            .unwrap();
        assert!(result.is_none());
        assert_eq!(negotiation.consumer_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_transport_creation_is_rejected() {
        let (negotiation, _engine, _transport) = harness().await;
        let call_id = CallId::new("c1");
        negotiation.create_recv_transport(&call_id).await.unwrap();
        let second = negotiation.create_recv_transport(&call_id).await;
        assert!(matches!(second, Err(MediaError::TransportExists("recv"))));
    }

    #[tokio::test]
    async fn test_concurrent_consume_creates_exactly_one_consumer() {
        let (negotiation, _engine, _transport) = harness().await;
        let call_id = CallId::new("c1");
        negotiation.create_recv_transport(&call_id).await.unwrap();

        let producer_id = ProducerId::new("p1");
        let participant = UserId::new("u2");
        let (a, b) = tokio::join!(
            negotiation.consume(
                &call_id,
                &producer_id,
                &participant,
                MediaKind::Audio,
                MediaSource::Mic,
            ),
            negotiation.consume(
                &call_id,
                &producer_id,
                &participant,
                MediaKind::Audio,
                MediaSource::Mic,
            ),
        );
        let consumed = [a.unwrap(), b.unwrap()];
        assert_eq!(consumed.iter().filter(|c| c.is_some()).count(), 1);
        assert_eq!(negotiation.consumer_count(), 1);
    }

    #[tokio::test]
    async fn test_consume_racing_teardown_installs_nothing() {
        let (negotiation, engine, _transport) = harness().await;
        let call_id = CallId::new("c1");
        negotiation.create_recv_transport(&call_id).await.unwrap();

        // The consume suspends in the create-consumer round trip; the
        // teardown interleaves there and takes both transports down before
        // the consume resumes.
        let producer_id = ProducerId::new("p1");
        let user_id = UserId::new("u2");
        let (consumed, ()) = tokio::join!(
            negotiation.consume(
                &call_id,
                &producer_id,
                &user_id,
                MediaKind::Audio,
                MediaSource::Mic,
            ),
            negotiation.close_all(),
        );

        assert!(consumed.unwrap().is_none());
        assert_eq!(negotiation.consumer_count(), 0);
        for track in engine.consumer_tracks() {
            assert!(track.is_stopped(), "track {} outlived the call", track.id());
        }
    }

    #[tokio::test]
    async fn test_reproduce_returns_existing_id() {
        let (negotiation, engine, _transport) = harness().await;
        let call_id = CallId::new("c1");
        negotiation.create_send_transport(&call_id).await.unwrap();

        let media = engine
            .acquire_local_media(CallMediaType::Audio)
            .await
            .unwrap();
        let first = negotiation
            .produce_track(&call_id, media.audio.clone(), MediaSource::Mic)
            .await
            .unwrap();
        let second = negotiation
            .produce_track(&call_id, media.audio.clone(), MediaSource::Mic)
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(engine.created_producer_count(), 1);
    }

    #[tokio::test]
    async fn test_screen_consume_fills_single_slot() {
        let (negotiation, _engine, _transport) = harness().await;
        let call_id = CallId::new("c1");
        negotiation.create_recv_transport(&call_id).await.unwrap();

        let producer_id = ProducerId::new("p-screen");
        let consumed = negotiation
            .consume(
                &call_id,
                &producer_id,
                &UserId::new("u2"),
                MediaKind::Video,
                MediaSource::Screen,
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(consumed.source, MediaSource::Screen);

        let share = negotiation.active_screen_share().unwrap();
        assert_eq!(share.owner, UserId::new("u2"));
        assert_eq!(share.producer_id, producer_id);

        assert!(negotiation.clear_screen_share_if(&producer_id));
        assert!(negotiation.active_screen_share().is_none());
    }
}
