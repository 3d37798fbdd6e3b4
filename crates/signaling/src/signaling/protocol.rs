//! HTTP signaling wire format
//!
//! Requests are flat JSON objects discriminated by `type`:
//!
//! ```json
//! {"type": "offer", "sessionId": "optional", "sdp": "v=0..."}
//! {"type": "ice-candidate", "sessionId": "s1", "candidate": "candidate:...", "sdpMid": "0", "sdpMLineIndex": 0}
//! {"type": "poll", "sessionId": "s1"}
//! {"type": "close", "sessionId": "s1"}
//! ```
//!
//! Responses carry `type` in `answer`, `ok`, `error` or `processing`.
//!
//! Bodies are parsed once into a [`serde_json::Value`] tree and then read
//! through typed accessors that fail on missing fields or type mismatches
//! instead of guessing.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::engine::IceCandidate;
use crate::session::SessionId;
use crate::{Error, Result};

/// Inbound signaling request
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingMessage {
    /// SDP offer; starts negotiation for a new session
    Offer {
        session_id: Option<SessionId>,
        sdp: String,
    },

    /// Trickled remote ICE candidate
    IceCandidate {
        session_id: Option<SessionId>,
        candidate: IceCandidate,
    },

    /// Ask for an answer that was not ready when the offer returned
    Poll { session_id: Option<SessionId> },

    /// Tear the session down
    Close { session_id: Option<SessionId> },
}

impl SignalingMessage {
    /// Parse a raw request body
    pub fn parse(body: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| Error::MalformedMessage(format!("invalid JSON: {}", e)))?;
        Self::from_value(&value)
    }

    /// Parse a request from a JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        Self::parse(json.as_bytes())
    }

    fn from_value(value: &Value) -> Result<Self> {
        let fields = Fields::new(value)?;
        let session_id = fields
            .optional_str("sessionId")?
            .filter(|id| !id.is_empty())
            .map(SessionId::from);

        match fields.required_str("type")? {
            "offer" => Ok(SignalingMessage::Offer {
                session_id,
                sdp: fields.required_str("sdp")?.to_string(),
            }),
            "ice-candidate" => Ok(SignalingMessage::IceCandidate {
                session_id,
                candidate: IceCandidate {
                    candidate: fields.required_str("candidate")?.to_string(),
                    sdp_mid: fields.optional_str("sdpMid")?.map(str::to_string),
                    sdp_mline_index: fields.optional_index("sdpMLineIndex")?,
                },
            }),
            "poll" => Ok(SignalingMessage::Poll { session_id }),
            "close" => Ok(SignalingMessage::Close { session_id }),
            other => Err(Error::MalformedMessage(format!(
                "unknown message type: {}",
                other
            ))),
        }
    }

    /// Serialize into the request wire format
    pub fn to_json(&self) -> Result<String> {
        let mut fields = Map::new();
        fields.insert("type".into(), Value::from(self.type_name()));
        if let Some(id) = self.session_id() {
            fields.insert("sessionId".into(), Value::from(id.as_str()));
        }
        match self {
            SignalingMessage::Offer { sdp, .. } => {
                fields.insert("sdp".into(), Value::from(sdp.as_str()));
            }
            SignalingMessage::IceCandidate { candidate, .. } => {
                fields.insert("candidate".into(), Value::from(candidate.candidate.as_str()));
                if let Some(mid) = &candidate.sdp_mid {
                    fields.insert("sdpMid".into(), Value::from(mid.as_str()));
                }
                if let Some(index) = candidate.sdp_mline_index {
                    fields.insert("sdpMLineIndex".into(), Value::from(index));
                }
            }
            SignalingMessage::Poll { .. } | SignalingMessage::Close { .. } => {}
        }
        Ok(serde_json::to_string(&Value::Object(fields))?)
    }

    /// Session id carried by the request, if any
    pub fn session_id(&self) -> Option<&SessionId> {
        match self {
            SignalingMessage::Offer { session_id, .. }
            | SignalingMessage::IceCandidate { session_id, .. }
            | SignalingMessage::Poll { session_id }
            | SignalingMessage::Close { session_id } => session_id.as_ref(),
        }
    }

    /// Wire name of the message type
    pub fn type_name(&self) -> &'static str {
        match self {
            SignalingMessage::Offer { .. } => "offer",
            SignalingMessage::IceCandidate { .. } => "ice-candidate",
            SignalingMessage::Poll { .. } => "poll",
            SignalingMessage::Close { .. } => "close",
        }
    }
}

/// Best-effort session id from a body that failed to parse, so error
/// responses can still echo it.
pub fn peek_session_id(body: &[u8]) -> Option<SessionId> {
    let value: Value = serde_json::from_slice(body).ok()?;
    match value.get("sessionId")? {
        Value::String(id) if !id.is_empty() => Some(SessionId::from(id.as_str())),
        _ => None,
    }
}

/// Outbound signaling response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ResponseMessage {
    /// Negotiated SDP answer
    Answer {
        sdp: String,
        #[serde(rename = "sessionId")]
        session_id: SessionId,
    },

    /// Request accepted
    #[serde(rename = "ok")]
    Ack {
        #[serde(rename = "sessionId")]
        session_id: SessionId,
    },

    /// Request failed
    Error {
        message: String,
        #[serde(rename = "sessionId", default, skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
    },

    /// Answer not ready yet; poll again with the same session id
    Processing {
        message: String,
        #[serde(rename = "sessionId")]
        session_id: SessionId,
    },
}

impl ResponseMessage {
    pub fn answer(session_id: SessionId, sdp: impl Into<String>) -> Self {
        ResponseMessage::Answer {
            sdp: sdp.into(),
            session_id,
        }
    }

    pub fn ack(session_id: SessionId) -> Self {
        ResponseMessage::Ack { session_id }
    }

    pub fn processing(session_id: SessionId) -> Self {
        ResponseMessage::Processing {
            message: "answer not ready yet, poll again".to_string(),
            session_id,
        }
    }

    /// Error response for a failed request
    pub fn from_error(session_id: Option<SessionId>, err: &Error) -> Self {
        ResponseMessage::Error {
            message: err.to_string(),
            session_id,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ResponseMessage::Error { .. })
    }

    pub fn session_id(&self) -> Option<&SessionId> {
        match self {
            ResponseMessage::Answer { session_id, .. }
            | ResponseMessage::Ack { session_id }
            | ResponseMessage::Processing { session_id, .. } => Some(session_id),
            ResponseMessage::Error { session_id, .. } => session_id.as_ref(),
        }
    }

    /// Serialize to JSON string
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize from JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Typed view over a flat request object
struct Fields<'a> {
    map: &'a Map<String, Value>,
}

impl<'a> Fields<'a> {
    fn new(value: &'a Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self { map }),
            _ => Err(Error::MalformedMessage(
                "message body must be a JSON object".to_string(),
            )),
        }
    }

    fn required_str(&self, key: &str) -> Result<&'a str> {
        self.optional_str(key)?.ok_or_else(|| {
            Error::MalformedMessage(format!("missing required field `{}`", key))
        })
    }

    /// `null` counts as absent
    fn optional_str(&self, key: &str) -> Result<Option<&'a str>> {
        match self.map.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.as_str())),
            Some(_) => Err(Error::MalformedMessage(format!(
                "field `{}` must be a string",
                key
            ))),
        }
    }

    /// Media line index, accepted as a JSON number or a numeric string
    fn optional_index(&self, key: &str) -> Result<Option<u16>> {
        let number = match self.map.get(key) {
            None | Some(Value::Null) => return Ok(None),
            Some(Value::Number(n)) => n.as_f64(),
            Some(Value::String(s)) => parse_number(s),
            Some(_) => None,
        };
        match number {
            Some(n) if n >= 0.0 && n.fract() == 0.0 && n <= f64::from(u16::MAX) => {
                Ok(Some(n as u16))
            }
            _ => Err(Error::MalformedMessage(format!(
                "field `{}` must be a non-negative integer",
                key
            ))),
        }
    }
}

/// Parse the numeric prefix of `text`: optional sign, digits, at most one
/// decimal point. Trailing garbage is ignored; no digits yields `None`.
pub fn parse_number(text: &str) -> Option<f64> {
    let text = text.trim_start();
    let bytes = text.as_bytes();
    let mut end = 0;
    if matches!(bytes.first(), Some(b'+') | Some(b'-')) {
        end = 1;
    }
    let mut seen_digit = false;
    let mut seen_point = false;
    while let Some(&b) = bytes.get(end) {
        match b {
            b'0'..=b'9' => seen_digit = true,
            b'.' if !seen_point => seen_point = true,
            _ => break,
        }
        end += 1;
    }
    if !seen_digit {
        return None;
    }
    text[..end].parse().ok()
}
