//! Boundary to the real-time transport engine
//!
//! The coordinator never touches ICE, DTLS or SDP internals. It drives an
//! [`RtcEngine`] that hands out one [`EngineConnection`] per session and
//! reports negotiation progress through one-shot [`Completion`] callbacks.
//! Completions run on engine-owned threads or tasks at an unspecified later
//! time and may carry an [`EngineFailure`] instead of a value.

#[cfg(any(test, feature = "test-util"))]
pub mod mock;
#[cfg(feature = "webrtc-engine")]
pub mod webrtc;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::session::SessionId;
use crate::Result;

/// Outcome of an engine operation
pub type EngineResult<T> = std::result::Result<T, EngineFailure>;

/// One-shot completion invoked by the engine when an operation finishes
pub type Completion<T> = Box<dyn FnOnce(EngineResult<T>) + Send + 'static>;

/// ICE candidate as exchanged over signaling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate attribute line (`candidate:...`)
    pub candidate: String,

    /// Media stream identification tag
    #[serde(rename = "sdpMid")]
    pub sdp_mid: Option<String>,

    /// Media line index
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
}

/// Negotiation step that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineOperation {
    SetRemoteDescription,
    CreateAnswer,
    SetLocalDescription,
}

impl fmt::Display for EngineOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineOperation::SetRemoteDescription => "set remote description",
            EngineOperation::CreateAnswer => "create answer",
            EngineOperation::SetLocalDescription => "set local description",
        };
        f.write_str(name)
    }
}

/// Structured failure reported through a [`Completion`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineFailure {
    pub operation: EngineOperation,
    pub message: String,
}

impl EngineFailure {
    pub fn new(operation: EngineOperation, message: impl Into<String>) -> Self {
        Self {
            operation,
            message: message.into(),
        }
    }
}

impl fmt::Display for EngineFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.operation, self.message)
    }
}

/// Peer link state as reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Observational callbacks for one engine connection.
///
/// The coordinator logs these but does not drive negotiation from them.
pub trait ConnectionObserver: Send + Sync {
    /// Peer link state changed
    fn on_peer_state_change(&self, state: PeerState);

    /// Engine gathered a local ICE candidate
    fn on_local_candidate(&self, candidate: &IceCandidate);
}

/// Factory for engine connections
#[async_trait]
pub trait RtcEngine: Send + Sync + 'static {
    /// Create the engine connection backing `session_id`
    async fn create_connection(
        &self,
        session_id: &SessionId,
        observer: Arc<dyn ConnectionObserver>,
    ) -> Result<Arc<dyn EngineConnection>>;
}

/// Handle to one engine peer connection
pub trait EngineConnection: Send + Sync {
    /// Apply the client's offer
    fn set_remote_description(&self, sdp: String, on_done: Completion<()>);

    /// Produce an answer SDP for the applied offer
    fn create_answer(&self, on_done: Completion<String>);

    /// Apply the answer locally; completes with the SDP to hand to the client
    fn set_local_description(&self, sdp: String, on_done: Completion<String>);

    /// Add a remote candidate. Candidates must be applied in call order.
    fn add_ice_candidate(&self, candidate: &IceCandidate) -> bool;

    /// Release the connection. Pending completions may still fire.
    fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_failure_display() {
        let failure = EngineFailure::new(EngineOperation::SetRemoteDescription, "bad sdp");
        assert_eq!(failure.to_string(), "set remote description failed: bad sdp");
    }

    #[test]
    fn test_ice_candidate_serde_names() {
        let candidate = IceCandidate {
            candidate: "candidate:1".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        };
        let json = serde_json::to_value(&candidate).unwrap();
        assert_eq!(json["sdpMid"], "0");
        assert_eq!(json["sdpMLineIndex"], 0);
    }
}
