//! Signaling session coordinator for WebRTC streaming
//!
//! This crate terminates the signaling side of a one-way video stream. HTTP
//! clients post offers, ICE candidates and close requests; the coordinator
//! drives a callback-based WebRTC engine through offer/answer negotiation and
//! returns the answer on the same request, or on a later poll.
//!
//! # Features
//!
//! - **Per-session state machine**: Idle → OfferReceived → AnsweringInProgress → AnswerReady
//! - **Async/callback bridge**: engine completions resolve bounded answer waits
//! - **Ordered ICE buffering**: candidates received before the offer is applied are flushed in order
//! - **Answer re-delivery**: a retrying client gets the same answer again
//! - **Idle reaping**: sessions without signaling activity or a live peer link are released
//! - **Shared video source**: one frame producer fans out to every session
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  HTTP client (POST /signaling)                           │
//! │  ↓                                                       │
//! │  Coordinator                                             │
//! │  ├─ Dispatcher (parse → route → ResponseMessage)         │
//! │  ├─ SessionRegistry (id → ConnectionContext)             │
//! │  │   └─ ConnectionContext (state machine, ICE buffer)    │
//! │  │       └─ CompletionSlot (answer bridge)               │
//! │  ├─ Idle reaper / stats tasks                            │
//! │  └─ VideoSource (shared frames)                          │
//! │     ↓                                                    │
//! │  RtcEngine / EngineConnection (webrtc-rs or mock)        │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use streamcast_signaling::{SignalingConfig, SignalingMessage};
//!
//! let config = SignalingConfig::default().with_max_sessions(16);
//! assert!(config.validate().is_ok());
//!
//! let message = SignalingMessage::from_json(
//!     r#"{"type":"close","sessionId":"abc"}"#,
//! ).unwrap();
//! assert_eq!(message.type_name(), "close");
//! ```

#![warn(clippy::all)]

// Public modules
pub mod bridge;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod media;
pub mod session;
pub mod signaling;

// Re-exports for public API
pub use config::{SignalingConfig, TurnServerConfig, VideoSourceConfig};
pub use coordinator::{Coordinator, CoordinatorStats};
pub use engine::{ConnectionObserver, EngineConnection, IceCandidate, PeerState, RtcEngine};
pub use error::{Error, Result};
pub use media::{FrameSink, TestPatternSource, VideoFrame, VideoSource};
pub use session::{ConnectionContext, NegotiationState, SessionId, SessionRegistry};
pub use signaling::{Dispatcher, ResponseMessage, SignalingMessage};

#[cfg(feature = "webrtc-engine")]
pub use engine::webrtc::WebRtcEngine;

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
