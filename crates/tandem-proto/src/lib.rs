//! Wire contract for the call signaling channel.
//! Shared by the call engine and the relay so both sides agree on envelope
//! shape without pulling in any runtime code.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Discriminates every envelope exchanged over the signaling channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnvelopeType {
    Join,
    JoinAck,
    Offer,
    Answer,
    IceCandidate,
    RtcConnected,
    Heartbeat,
    End,
    Error,
}

impl EnvelopeType {
    pub fn as_str(self) -> &'static str {
        match self {
            EnvelopeType::Join => "JOIN",
            EnvelopeType::JoinAck => "JOIN_ACK",
            EnvelopeType::Offer => "OFFER",
            EnvelopeType::Answer => "ANSWER",
            EnvelopeType::IceCandidate => "ICE_CANDIDATE",
            EnvelopeType::RtcConnected => "RTC_CONNECTED",
            EnvelopeType::Heartbeat => "HEARTBEAT",
            EnvelopeType::End => "END",
            EnvelopeType::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for EnvelopeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The only message shape carried by the signaling channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeType,
    pub session_id: String,
    pub reservation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
    /// Send time in milliseconds since the unix epoch. Informational.
    #[serde(default)]
    pub ts: i64,
    #[serde(default)]
    pub trace_id: String,
}

impl Envelope {
    pub fn to_json(&self) -> Result<String, ProtoError> {
        serde_json::to_string(self).map_err(ProtoError::Encode)
    }

    pub fn from_json(text: &str) -> Result<Self, ProtoError> {
        serde_json::from_str(text).map_err(ProtoError::Decode)
    }

    /// Typed view of `kind` + `payload`.
    pub fn signal(&self) -> Result<Signal, ProtoError> {
        Signal::from_parts(self.kind, &self.payload)
    }
}

/// Payload of `JOIN_ACK`. The relay sets `initiator` for the first
/// participant present in the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinAck {
    pub initiator: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A trickled network candidate, shaped like the browser's `RTCIceCandidateInit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayError {
    pub message: String,
}

/// Typed view of an envelope's `(type, payload)` pair.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    Join,
    JoinAck(JoinAck),
    Offer(SessionDescription),
    Answer(SessionDescription),
    IceCandidate(IceCandidate),
    RtcConnected,
    Heartbeat,
    End,
    Error(RelayError),
}

impl Signal {
    pub fn kind(&self) -> EnvelopeType {
        match self {
            Signal::Join => EnvelopeType::Join,
            Signal::JoinAck(_) => EnvelopeType::JoinAck,
            Signal::Offer(_) => EnvelopeType::Offer,
            Signal::Answer(_) => EnvelopeType::Answer,
            Signal::IceCandidate(_) => EnvelopeType::IceCandidate,
            Signal::RtcConnected => EnvelopeType::RtcConnected,
            Signal::Heartbeat => EnvelopeType::Heartbeat,
            Signal::End => EnvelopeType::End,
            Signal::Error(_) => EnvelopeType::Error,
        }
    }

    pub fn from_parts(kind: EnvelopeType, payload: &Value) -> Result<Self, ProtoError> {
        let signal = match kind {
            EnvelopeType::Join => Signal::Join,
            EnvelopeType::JoinAck => Signal::JoinAck(decode_payload(kind, payload)?),
            EnvelopeType::Offer => Signal::Offer(decode_payload(kind, payload)?),
            EnvelopeType::Answer => Signal::Answer(decode_payload(kind, payload)?),
            EnvelopeType::IceCandidate => Signal::IceCandidate(decode_payload(kind, payload)?),
            EnvelopeType::RtcConnected => Signal::RtcConnected,
            EnvelopeType::Heartbeat => Signal::Heartbeat,
            EnvelopeType::End => Signal::End,
            EnvelopeType::Error => Signal::Error(decode_payload(kind, payload)?),
        };
        Ok(signal)
    }

    /// Splits the signal back into its wire `type` and `payload`.
    pub fn into_parts(self) -> Result<(EnvelopeType, Value), ProtoError> {
        let kind = self.kind();
        let payload = match self {
            Signal::Join
            | Signal::RtcConnected
            | Signal::Heartbeat
            | Signal::End => Value::Null,
            Signal::JoinAck(ack) => encode_payload(&ack)?,
            Signal::Offer(desc) | Signal::Answer(desc) => encode_payload(&desc)?,
            Signal::IceCandidate(candidate) => encode_payload(&candidate)?,
            Signal::Error(err) => encode_payload(&err)?,
        };
        Ok((kind, payload))
    }
}

fn decode_payload<T: serde::de::DeserializeOwned>(
    kind: EnvelopeType,
    payload: &Value,
) -> Result<T, ProtoError> {
    if payload.is_null() {
        return Err(ProtoError::MissingPayload(kind));
    }
    serde_json::from_value(payload.clone()).map_err(|source| ProtoError::Payload { kind, source })
}

fn encode_payload<T: Serialize>(value: &T) -> Result<Value, ProtoError> {
    serde_json::to_value(value).map_err(ProtoError::Encode)
}

/// One ICE server descriptor as served by the provisioning endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    #[serde(deserialize_with = "one_or_many")]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServerList {
    #[serde(default)]
    pub ice_servers: Vec<IceServer>,
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(url) => vec![url],
        OneOrMany::Many(urls) => urls,
    })
}

/// Fresh per-message correlation id.
pub fn new_trace_id() -> String {
    Uuid::new_v4().to_string()
}

#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode envelope: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("{0} envelope is missing its payload")]
    MissingPayload(EnvelopeType),
    #[error("{kind} payload is malformed: {source}")]
    Payload {
        kind: EnvelopeType,
        #[source]
        source: serde_json::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_uses_camel_case_wire_names() {
        let envelope = Envelope {
            kind: EnvelopeType::JoinAck,
            session_id: "S1".into(),
            reservation_id: "R9".into(),
            from: None,
            to: Some("alice".into()),
            payload: json!({ "initiator": true }),
            ts: 42,
            trace_id: "t-1".into(),
        };
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["type"], "JOIN_ACK");
        assert_eq!(value["sessionId"], "S1");
        assert_eq!(value["reservationId"], "R9");
        assert_eq!(value["traceId"], "t-1");
        assert!(value.get("from").is_none());
        assert_eq!(
            envelope.signal().unwrap(),
            Signal::JoinAck(JoinAck { initiator: true })
        );
    }

    #[test]
    fn empty_signals_omit_payload() {
        let (kind, payload) = Signal::Heartbeat.into_parts().unwrap();
        assert_eq!(kind, EnvelopeType::Heartbeat);
        assert!(payload.is_null());

        let envelope = Envelope {
            kind,
            session_id: "S1".into(),
            reservation_id: "R1".into(),
            from: Some("bob".into()),
            to: None,
            payload,
            ts: 0,
            trace_id: new_trace_id(),
        };
        let text = envelope.to_json().unwrap();
        assert!(!text.contains("payload"));
    }

    #[test]
    fn candidate_payload_matches_browser_shape() {
        let raw = json!({
            "type": "ICE_CANDIDATE",
            "sessionId": "S1",
            "reservationId": "R1",
            "from": "bob",
            "payload": {
                "candidate": "candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host",
                "sdpMid": "0",
                "sdpMLineIndex": 0
            },
            "ts": 1,
            "traceId": "x"
        });
        let envelope: Envelope = serde_json::from_value(raw).unwrap();
        match envelope.signal().unwrap() {
            Signal::IceCandidate(candidate) => {
                assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
                assert_eq!(candidate.sdp_m_line_index, Some(0));
                assert!(candidate.username_fragment.is_none());
            }
            other => panic!("unexpected signal {other:?}"),
        }
    }

    #[test]
    fn mismatched_payload_is_a_decode_error() {
        let err = Signal::from_parts(EnvelopeType::Offer, &json!({ "initiator": true }))
            .expect_err("offer without sdp must not decode");
        assert!(matches!(err, ProtoError::Payload { kind: EnvelopeType::Offer, .. }));

        let err = Signal::from_parts(EnvelopeType::JoinAck, &Value::Null).unwrap_err();
        assert!(matches!(err, ProtoError::MissingPayload(EnvelopeType::JoinAck)));
    }

    #[test]
    fn ice_server_urls_accept_string_or_list() {
        let list: IceServerList = serde_json::from_value(json!({
            "iceServers": [
                { "urls": "stun:stun.example.org:3478" },
                { "urls": ["turn:turn.example.org:3478"], "username": "u", "credential": "p" }
            ]
        }))
        .unwrap();
        assert_eq!(list.ice_servers[0].urls, vec!["stun:stun.example.org:3478"]);
        assert_eq!(list.ice_servers[1].username.as_deref(), Some("u"));
    }
}
