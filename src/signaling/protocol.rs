//! Typed wire protocol for the SFU signaling endpoint.
//!
//! Envelope (JSON):
//! - request: `{"id": n, "op": "<name>", "data": {...}}`
//! - ack:     `{"ack": n, "data": {...}}` or `{"ack": n, "error": "<string>"}`
//! - push:    `{"event": "<name>", "data": {...}}`
//!
//! Op and event names are kebab-case; payload fields are camelCase. Every
//! loosely-shaped server payload is decoded here into a tagged variant, so
//! the orchestrator's handlers only ever see strongly-typed structures.

use crate::media::engine::{
    ConsumerOptions, DtlsParameters, RouterRtpCapabilities, RtpCapabilities, RtpParameters,
    TransportDirection, TransportOptions,
};
use crate::signaling::error::SignalError;
use crate::types::call::{
    CallId, CallMediaType, ConsumerId, MediaKind, MediaSource, ParticipantInfo, ProducerId,
    TransportId, UserId,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ---------------------------------------------------------------------------
// Envelope framing
// ---------------------------------------------------------------------------

/// Outbound request/response frame.
#[derive(Debug, Serialize)]
pub struct RequestFrame<'a> {
    pub id: u64,
    pub op: &'a str,
    pub data: serde_json::Value,
}

/// Outbound fire-and-forget frame (no ack expected).
#[derive(Debug, Serialize)]
pub struct NotifyFrame<'a> {
    pub op: &'a str,
    pub data: serde_json::Value,
}

/// Inbound response to a request.
#[derive(Debug, Deserialize)]
pub struct AckFrame {
    pub ack: u64,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Inbound server-pushed event before payload decoding.
#[derive(Debug, Deserialize)]
pub struct PushFrame {
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Any frame the server can send.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ServerFrame {
    Ack(AckFrame),
    Push(PushFrame),
}

// ---------------------------------------------------------------------------
// Request/response payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest<'a> {
    pub user_id: &'a UserId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    #[serde(default)]
    pub success: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartCallRequest<'a> {
    pub to_user_ids: &'a [UserId],
    pub call_type: CallMediaType,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartCallResponse {
    pub call_id: CallId,
    pub router_capabilities: RouterRtpCapabilities,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinCallRequest<'a> {
    pub call_id: &'a CallId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinCallResponse {
    #[serde(default)]
    pub participants: Vec<UserId>,
    pub creator_id: UserId,
    #[serde(default)]
    pub already_joined: Vec<UserId>,
    #[serde(default)]
    pub participants_info: HashMap<UserId, ParticipantInfo>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTransportRequest<'a> {
    pub call_id: &'a CallId,
    pub direction: TransportDirection,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTransportResponse {
    pub transport_options: TransportOptions,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectTransportRequest<'a> {
    pub call_id: &'a CallId,
    pub transport_id: &'a TransportId,
    pub dtls_parameters: &'a DtlsParameters,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateProducerRequest<'a> {
    pub call_id: &'a CallId,
    pub transport_id: &'a TransportId,
    pub kind: MediaKind,
    pub rtp_parameters: &'a RtpParameters,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_data: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateProducerResponse {
    pub producer_id: ProducerId,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateConsumerRequest<'a> {
    pub call_id: &'a CallId,
    pub producer_id: &'a ProducerId,
    pub rtp_capabilities: &'a RtpCapabilities,
}

/// `create-consumer` acks with the full [`ConsumerOptions`] set.
pub type CreateConsumerResponse = ConsumerOptions;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeConsumerRequest<'a> {
    pub call_id: &'a CallId,
    pub consumer_id: &'a ConsumerId,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GetProducersRequest<'a> {
    pub call_id: &'a CallId,
}

/// One producer present in the room, as announced by the server either in a
/// `get-producers` ack or a `new-producer` push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerAnnouncement {
    pub producer_id: ProducerId,
    pub user_id: UserId,
    pub kind: MediaKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<MediaSource>,
}

impl ProducerAnnouncement {
    /// Source tag, defaulted per kind when the server omits it.
    pub fn source_or_default(&self) -> MediaSource {
        self.source.unwrap_or(MediaSource::default_for(self.kind))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetProducersResponse {
    #[serde(default)]
    pub producers: Vec<ProducerAnnouncement>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddParticipantsRequest<'a> {
    pub call_id: &'a CallId,
    pub participant_ids: &'a [UserId],
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptCallRequest<'a> {
    pub call_id: &'a CallId,
    pub from_user_id: &'a UserId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptCallResponse {
    pub rtp_capabilities: RouterRtpCapabilities,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MuteNotify<'a> {
    pub call_id: &'a CallId,
    pub producer_id: &'a ProducerId,
    pub muted: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseProducerNotify<'a> {
    pub call_id: &'a CallId,
    pub producer_id: &'a ProducerId,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveCallNotify<'a> {
    pub call_id: &'a CallId,
}

// ---------------------------------------------------------------------------
// Server-pushed events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingCallEvent {
    pub call_id: CallId,
    pub caller_id: UserId,
    pub call_type: CallMediaType,
    #[serde(default)]
    pub caller_name: Option<String>,
    #[serde(default)]
    pub participants: Vec<UserId>,
    #[serde(default)]
    pub rtp_capabilities: Option<RouterRtpCapabilities>,
    #[serde(default)]
    pub participants_info: HashMap<UserId, ParticipantInfo>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallAcceptedEvent {
    #[serde(default)]
    pub call_id: Option<CallId>,
    #[serde(default)]
    pub user_id: Option<UserId>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerClosedEvent {
    pub producer_id: ProducerId,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantEvent {
    pub user_id: UserId,
    #[serde(default)]
    pub call_id: Option<CallId>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallIdEvent {
    pub call_id: CallId,
}

/// Every event the server can push, decoded at the channel boundary.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// `incoming-call` and `call-invitation` (a callee added to an ongoing
    /// group call) carry the same payload and route through the same path.
    IncomingCall(IncomingCallEvent),
    CallAccepted(CallAcceptedEvent),
    NewProducer(ProducerAnnouncement),
    ProducerClosed(ProducerClosedEvent),
    ParticipantJoined(ParticipantEvent),
    ParticipantInvited(ParticipantEvent),
    ParticipantNoAnswer(ParticipantEvent),
    ParticipantLeft(ParticipantEvent),
    CallExpired(CallIdEvent),
    CallEnded(CallIdEvent),
    /// The four `remote-user-(video-)muted/unmuted` names collapse into one
    /// variant carrying the kind and the new flag.
    RemoteMute {
        user_id: UserId,
        kind: MediaKind,
        muted: bool,
    },
}

impl ServerEvent {
    pub fn decode(frame: PushFrame) -> Result<Self, SignalError> {
        fn payload<T: serde::de::DeserializeOwned>(
            event: &str,
            data: serde_json::Value,
        ) -> Result<T, SignalError> {
            serde_json::from_value(data)
                .map_err(|e| SignalError::Codec(format!("bad '{event}' payload: {e}")))
        }

        let PushFrame { event, data } = frame;
        let decoded = match event.as_str() {
            "incoming-call" | "call-invitation" => {
                ServerEvent::IncomingCall(payload(&event, data)?)
            }
            "call-accepted" => ServerEvent::CallAccepted(payload(&event, data)?),
            "new-producer" => ServerEvent::NewProducer(payload(&event, data)?),
            "producer-closed" => ServerEvent::ProducerClosed(payload(&event, data)?),
            "participant-joined" => ServerEvent::ParticipantJoined(payload(&event, data)?),
            "participant-invited" => ServerEvent::ParticipantInvited(payload(&event, data)?),
            "participant-no-answer" => ServerEvent::ParticipantNoAnswer(payload(&event, data)?),
            "participant-left" => ServerEvent::ParticipantLeft(payload(&event, data)?),
            "call-expired" => ServerEvent::CallExpired(payload(&event, data)?),
            "call-ended" => ServerEvent::CallEnded(payload(&event, data)?),
            "remote-user-muted" | "remote-user-unmuted" | "remote-user-video-muted"
            | "remote-user-video-unmuted" => {
                let p: ParticipantEvent = payload(&event, data)?;
                let kind = if event.contains("video") {
                    MediaKind::Video
                } else {
                    MediaKind::Audio
                };
                ServerEvent::RemoteMute {
                    user_id: p.user_id,
                    kind,
                    muted: !event.ends_with("-unmuted"),
                }
            }
            other => {
                return Err(SignalError::Codec(format!("unknown event '{other}'")));
            }
        };
        Ok(decoded)
    }
}
