//! Client composition root.
//!
//! Wires the signaling channel, the call manager and the injected platform
//! capabilities together, owns the pump tasks, and exposes the public call
//! operations.

use crate::calls::manager::{CallCapabilities, CallManager, CallManagerConfig};
use crate::calls::{AcceptTrigger, CallError, CallPhase, CurrentCall, Participant, RemotePeer};
use crate::media::engine::{ActiveScreenShare, MediaTrack};
use crate::platform::AppLifecycle;
use crate::signaling::protocol::{RegisterRequest, RegisterResponse, ServerEvent};
use crate::signaling::transport::{SignalTransport, SignalTransportFactory, TransportEvent};
use crate::signaling::SignalingChannel;
use crate::types::call::{CallId, CallMediaType, MediaKind, UserId};
use crate::types::events::RtcEvent;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

pub struct RtcClient {
    channel: Arc<SignalingChannel>,
    manager: Arc<CallManager>,
    transport_factory: Arc<dyn SignalTransportFactory>,
    local_id: UserId,
    transport: Mutex<Option<Arc<dyn SignalTransport>>>,
    /// Receiver side of the decoded server-event stream, handed to the event
    /// pump on connect.
    server_events: StdMutex<Option<mpsc::Receiver<ServerEvent>>>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
    is_connecting: AtomicBool,
    is_connected: AtomicBool,
}

impl RtcClient {
    pub fn new(
        local_id: UserId,
        local_name: String,
        transport_factory: Arc<dyn SignalTransportFactory>,
        capabilities: CallCapabilities,
        config: CallManagerConfig,
    ) -> Arc<Self> {
        let (channel, server_events) =
            SignalingChannel::new(config.request_timeout, config.event_channel_capacity);
        let manager = CallManager::new(
            local_id.clone(),
            local_name,
            channel.clone(),
            capabilities,
            config,
        );
        Arc::new(Self {
            channel,
            manager,
            transport_factory,
            local_id,
            transport: Mutex::new(None),
            server_events: StdMutex::new(Some(server_events)),
            tasks: StdMutex::new(Vec::new()),
            is_connecting: AtomicBool::new(false),
            is_connected: AtomicBool::new(false),
        })
    }

    /// Dials the signaling endpoint, starts the pumps and registers this
    /// user so the server can route call events here.
    pub async fn connect(self: &Arc<Self>) -> Result<(), anyhow::Error> {
        if self.is_connected.load(Ordering::SeqCst) {
            return Ok(());
        }
        if self.is_connecting.swap(true, Ordering::SeqCst) {
            anyhow::bail!("connect already in progress");
        }
        let guard = scopeguard::guard((), |_| {
            self.is_connecting.store(false, Ordering::Relaxed);
        });

        let (transport, transport_events) = self.transport_factory.create_transport().await?;
        self.channel.attach(transport.clone()).await;
        *self.transport.lock().await = Some(transport);

        self.spawn_transport_pump(transport_events);
        if let Some(server_events) = self.server_events.lock().expect("pump slot poisoned").take()
        {
            self.spawn_event_pump(server_events);
        }

        let resp: RegisterResponse = self
            .channel
            .request(
                "register",
                &RegisterRequest {
                    user_id: &self.local_id,
                },
            )
            .await?;
        if !resp.success {
            anyhow::bail!("server rejected registration for {}", self.local_id);
        }

        self.is_connected.store(true, Ordering::SeqCst);
        info!(target: "Rtc/Client", "Connected and registered as {}", self.local_id);
        drop(guard);
        Ok(())
    }

    fn spawn_transport_pump(self: &Arc<Self>, mut events: mpsc::Receiver<TransportEvent>) {
        let client = self.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    TransportEvent::Connected => {
                        debug!(target: "Rtc/Client", "Transport reports connected");
                    }
                    TransportEvent::FrameReceived(frame) => {
                        client.channel.handle_frame(&frame).await;
                    }
                    TransportEvent::Disconnected => {
                        warn!(target: "Rtc/Client", "Transport disconnected");
                        client.is_connected.store(false, Ordering::SeqCst);
                        client.channel.detach().await;
                        break;
                    }
                }
            }
        });
        self.tasks.lock().expect("task list poisoned").push(handle);
    }

    fn spawn_event_pump(self: &Arc<Self>, mut events: mpsc::Receiver<ServerEvent>) {
        let manager = self.manager.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                manager.handle_server_event(event).await;
            }
            debug!(target: "Rtc/Client", "Event pump finished");
        });
        self.tasks.lock().expect("task list poisoned").push(handle);
    }

    /// Ends any current call, closes the transport and stops the pumps.
    pub async fn shutdown(&self) {
        if self.manager.current_call().await.is_some() {
            self.manager.end_call(true).await;
        }
        if let Some(transport) = self.transport.lock().await.take() {
            transport.disconnect().await;
        }
        self.channel.detach().await;
        self.is_connected.store(false, Ordering::SeqCst);
        for handle in self.tasks.lock().expect("task list poisoned").drain(..) {
            handle.abort();
        }
        info!(target: "Rtc/Client", "Client shut down");
    }

    pub fn is_connected(&self) -> bool {
        self.is_connected.load(Ordering::SeqCst)
    }

    pub fn signaling(&self) -> Arc<SignalingChannel> {
        self.channel.clone()
    }

    pub fn manager(&self) -> Arc<CallManager> {
        self.manager.clone()
    }

    // -----------------------------------------------------------------------
    // Call operations, delegated to the manager
    // -----------------------------------------------------------------------

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<RtcEvent> {
        self.manager.subscribe()
    }

    pub async fn start_call(
        &self,
        participant_ids: Vec<UserId>,
        call_type: CallMediaType,
    ) -> Result<CallId, CallError> {
        self.manager.start_call(participant_ids, call_type).await
    }

    pub async fn accept_call(&self, trigger: AcceptTrigger) -> Result<(), CallError> {
        self.manager.process_accept(trigger).await
    }

    pub async fn decline_call(&self) -> Result<(), CallError> {
        self.manager.decline_call().await
    }

    pub async fn end_call(&self) {
        self.manager.end_call(true).await;
    }

    pub async fn add_participants(&self, participant_ids: Vec<UserId>) -> Result<(), CallError> {
        self.manager.add_participants(participant_ids).await
    }

    pub async fn toggle_mute(&self, kind: MediaKind) -> Result<bool, CallError> {
        self.manager.toggle_mute(kind).await
    }

    pub async fn start_screen_share(&self, track: Arc<dyn MediaTrack>) -> Result<(), CallError> {
        self.manager.start_screen_share(track).await
    }

    pub async fn stop_screen_share(&self) -> Result<(), CallError> {
        self.manager.stop_screen_share().await
    }

    pub async fn on_app_state_change(&self, state: AppLifecycle) {
        self.manager.on_app_state_change(state).await;
    }

    pub async fn current_call(&self) -> Option<CurrentCall> {
        self.manager.current_call().await
    }

    pub async fn phase(&self) -> CallPhase {
        self.manager.phase().await
    }

    pub async fn participants(&self) -> Vec<Participant> {
        self.manager.participants().await
    }

    pub async fn remote_peer(&self) -> Option<RemotePeer> {
        self.manager.remote_peer().await
    }

    pub fn active_screen_share(&self) -> Option<ActiveScreenShare> {
        self.manager.active_screen_share()
    }
}
