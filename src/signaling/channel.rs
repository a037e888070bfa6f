//! Request/response correlation over the signaling transport.
//!
//! Mirrors the classic call/ack pattern: each outbound request gets a
//! monotonically increasing id and a oneshot waiter; the read loop routes
//! acks back to waiters and forwards pushed events to the orchestrator's
//! pump. Error-string acks surface as [`SignalError::Server`].

use crate::signaling::error::SignalError;
use crate::signaling::protocol::{NotifyFrame, RequestFrame, ServerEvent, ServerFrame};
use crate::signaling::transport::SignalTransport;
use log::{debug, warn};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::time::timeout;

type AckResult = Result<serde_json::Value, String>;

pub struct SignalingChannel {
    transport: Mutex<Option<Arc<dyn SignalTransport>>>,
    response_waiters: Mutex<HashMap<u64, oneshot::Sender<AckResult>>>,
    id_counter: AtomicU64,
    request_timeout: Duration,
    event_tx: mpsc::Sender<ServerEvent>,
}

impl SignalingChannel {
    /// Creates the channel plus the receiver the event pump drains.
    pub fn new(
        request_timeout: Duration,
        event_capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<ServerEvent>) {
        let (event_tx, event_rx) = mpsc::channel(event_capacity);
        let channel = Arc::new(Self {
            transport: Mutex::new(None),
            response_waiters: Mutex::new(HashMap::new()),
            id_counter: AtomicU64::new(0),
            request_timeout,
            event_tx,
        });
        (channel, event_rx)
    }

    pub async fn attach(&self, transport: Arc<dyn SignalTransport>) {
        *self.transport.lock().await = Some(transport);
    }

    /// Drops the transport. Outstanding waiters resolve as `ChannelClosed`.
    pub async fn detach(&self) {
        *self.transport.lock().await = None;
        self.response_waiters.lock().await.clear();
    }

    pub async fn is_connected(&self) -> bool {
        self.transport.lock().await.is_some()
    }

    /// Sends a request and decodes the ack payload.
    pub async fn request<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        op: &str,
        data: &Req,
    ) -> Result<Resp, SignalError> {
        let value = self.round_trip(op, to_value(data)?).await?;
        serde_json::from_value(value)
            .map_err(|e| SignalError::Codec(format!("bad '{op}' ack payload: {e}")))
    }

    /// Sends a request, discarding the ack payload.
    pub async fn request_ack<Req: Serialize>(
        &self,
        op: &str,
        data: &Req,
    ) -> Result<(), SignalError> {
        self.round_trip(op, to_value(data)?).await.map(|_| ())
    }

    /// Fire-and-forget notify: no id, no waiter, no ack.
    pub async fn notify<Req: Serialize>(&self, op: &str, data: &Req) -> Result<(), SignalError> {
        let transport = self.current_transport().await?;
        let frame = serde_json::to_vec(&NotifyFrame {
            op,
            data: to_value(data)?,
        })
        .map_err(|e| SignalError::Codec(e.to_string()))?;
        transport
            .send_frame(&frame)
            .await
            .map_err(|e| SignalError::Transport(e.to_string()))
    }

    async fn round_trip(
        &self,
        op: &str,
        data: serde_json::Value,
    ) -> Result<serde_json::Value, SignalError> {
        let transport = self.current_transport().await?;
        let id = self.id_counter.fetch_add(1, Ordering::SeqCst) + 1;

        let (tx, rx) = oneshot::channel();
        self.response_waiters.lock().await.insert(id, tx);

        let frame = serde_json::to_vec(&RequestFrame { id, op, data })
            .map_err(|e| SignalError::Codec(e.to_string()))?;

        if let Err(e) = transport.send_frame(&frame).await {
            self.response_waiters.lock().await.remove(&id);
            return Err(SignalError::Transport(e.to_string()));
        }

        match timeout(self.request_timeout, rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(message))) => Err(SignalError::Server(message)),
            Ok(Err(_)) => Err(SignalError::ChannelClosed),
            Err(_) => {
                self.response_waiters.lock().await.remove(&id);
                warn!(target: "Rtc/Signaling", "Request '{op}' (id {id}) timed out");
                Err(SignalError::Timeout)
            }
        }
    }

    async fn current_transport(&self) -> Result<Arc<dyn SignalTransport>, SignalError> {
        self.transport
            .lock()
            .await
            .clone()
            .ok_or(SignalError::NotConnected)
    }

    /// Decodes one inbound frame: acks complete their waiter, pushes are
    /// forwarded to the event pump. Malformed frames are logged and dropped.
    pub async fn handle_frame(&self, frame: &[u8]) {
        match serde_json::from_slice::<ServerFrame>(frame) {
            Ok(ServerFrame::Ack(ack)) => {
                let waiter = self.response_waiters.lock().await.remove(&ack.ack);
                match waiter {
                    Some(tx) => {
                        let result = match ack.error {
                            Some(message) => Err(message),
                            None => Ok(ack.data.unwrap_or(serde_json::Value::Null)),
                        };
                        if tx.send(result).is_err() {
                            debug!(target: "Rtc/Signaling", "Waiter for ack {} was dropped", ack.ack);
                        }
                    }
                    None => {
                        warn!(target: "Rtc/Signaling", "Ack {} has no waiter", ack.ack);
                    }
                }
            }
            Ok(ServerFrame::Push(push)) => match ServerEvent::decode(push) {
                Ok(event) => {
                    if self.event_tx.send(event).await.is_err() {
                        warn!(target: "Rtc/Signaling", "Event pump is gone, dropping server event");
                    }
                }
                Err(e) => {
                    warn!(target: "Rtc/Signaling", "Dropping undecodable push: {e}");
                }
            },
            Err(e) => {
                warn!(target: "Rtc/Signaling", "Dropping malformed frame: {e}");
            }
        }
    }
}

fn to_value<Req: Serialize>(data: &Req) -> Result<serde_json::Value, SignalError> {
    serde_json::to_value(data).map_err(|e| SignalError::Codec(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    /// Transport that acks every request with a canned payload.
    struct EchoTransport {
        channel: std::sync::Weak<SignalingChannel>,
        ack_data: serde_json::Value,
        fail_with: Option<String>,
    }

    #[async_trait]
    impl SignalTransport for EchoTransport {
        async fn send_frame(&self, frame: &[u8]) -> Result<(), anyhow::Error> {
            let sent: serde_json::Value = serde_json::from_slice(frame)?;
            let Some(id) = sent.get("id").and_then(|v| v.as_u64()) else {
                return Ok(()); // notify, nothing to ack
            };
            let ack = match &self.fail_with {
                Some(message) => json!({"ack": id, "error": message}),
                None => json!({"ack": id, "data": self.ack_data}),
            };
            if let Some(channel) = self.channel.upgrade() {
                let bytes = serde_json::to_vec(&ack)?;
                tokio::spawn(async move { channel.handle_frame(&bytes).await });
            }
            Ok(())
        }

        async fn disconnect(&self) {}
    }

    #[tokio::test]
    async fn test_request_resolves_with_ack_data() {
        let (channel, _rx) = SignalingChannel::new(Duration::from_secs(1), 8);
        channel
            .attach(Arc::new(EchoTransport {
                channel: Arc::downgrade(&channel),
                ack_data: json!({"success": true}),
                fail_with: None,
            }))
            .await;

        #[derive(Deserialize)]
        struct Resp {
            success: bool,
        }
        use serde::Deserialize;

        let resp: Resp = channel.request("register", &json!({})).await.unwrap();
        assert!(resp.success);
    }

    #[tokio::test]
    async fn test_error_ack_surfaces_as_server_error() {
        let (channel, _rx) = SignalingChannel::new(Duration::from_secs(1), 8);
        channel
            .attach(Arc::new(EchoTransport {
                channel: Arc::downgrade(&channel),
                ack_data: json!({}),
                fail_with: Some("call not found".into()),
            }))
            .await;

        let result = channel.request_ack("join-call", &json!({})).await;
        match result {
            Err(SignalError::Server(message)) => assert_eq!(message, "call not found"),
            other => panic!("expected server error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_request_without_transport_fails_fast() {
        let (channel, _rx) = SignalingChannel::new(Duration::from_secs(1), 8);
        let result = channel.request_ack("register", &json!({})).await;
        assert!(matches!(result, Err(SignalError::NotConnected)));
    }

    #[tokio::test]
    async fn test_push_frames_reach_event_receiver() {
        let (channel, mut rx) = SignalingChannel::new(Duration::from_secs(1), 8);
        channel
            .handle_frame(br#"{"event": "call-ended", "data": {"callId": "c1"}}"#)
            .await;
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, ServerEvent::CallEnded(_)));
    }
}
