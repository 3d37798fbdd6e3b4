//! Routes parsed signaling messages to sessions
//!
//! Every request, including malformed ones, produces a well-formed
//! [`ResponseMessage`]. An offer request suspends only at the answer wait,
//! which is bounded by the configured timeout.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use super::protocol::{peek_session_id, ResponseMessage, SignalingMessage};
use crate::bridge::{SlotWaiter, WaitOutcome};
use crate::engine::{IceCandidate, RtcEngine};
use crate::session::{
    ConnectionContext, IceDisposition, NegotiationState, OfferDisposition, SessionId,
    SessionRegistry,
};
use crate::Error;

/// Top-level signaling entry point
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use std::time::Duration;
/// use streamcast_signaling::engine::mock::MockEngine;
/// use streamcast_signaling::{Dispatcher, SessionRegistry};
///
/// # tokio_test::block_on(async {
/// let dispatcher = Dispatcher::new(
///     Arc::new(SessionRegistry::new(8, 32)),
///     Arc::new(MockEngine::new()),
///     Duration::from_secs(1),
/// );
///
/// let response = dispatcher
///     .handle_body(br#"{"type":"close","sessionId":"nobody"}"#)
///     .await;
/// assert!(response.is_error());
/// # });
/// ```
pub struct Dispatcher {
    registry: Arc<SessionRegistry>,
    engine: Arc<dyn RtcEngine>,
    answer_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<SessionRegistry>,
        engine: Arc<dyn RtcEngine>,
        answer_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            engine,
            answer_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Parse and dispatch a raw request body
    pub async fn handle_body(&self, body: &[u8]) -> ResponseMessage {
        match SignalingMessage::parse(body) {
            Ok(message) => self.dispatch(message).await,
            Err(err) => {
                let session_id = peek_session_id(body);
                warn!(error = %err, "Rejected signaling message");
                ResponseMessage::from_error(session_id, &err)
            }
        }
    }

    /// Dispatch a parsed message
    #[instrument(skip(self, message), fields(kind = message.type_name()))]
    pub async fn dispatch(&self, message: SignalingMessage) -> ResponseMessage {
        match message {
            SignalingMessage::Offer { session_id, sdp } => {
                let session_id = session_id.unwrap_or_else(|| {
                    let generated = SessionId::generate();
                    debug!(session_id = %generated, "Generated session id for offer");
                    generated
                });
                self.handle_offer(session_id, sdp).await
            }
            SignalingMessage::IceCandidate {
                session_id,
                candidate,
            } => match session_id {
                Some(session_id) => self.handle_ice_candidate(session_id, candidate).await,
                None => missing_session_id("ice-candidate"),
            },
            SignalingMessage::Poll { session_id } => match session_id {
                Some(session_id) => self.handle_poll(session_id).await,
                None => missing_session_id("poll"),
            },
            SignalingMessage::Close { session_id } => match session_id {
                Some(session_id) => self.handle_close(session_id),
                None => missing_session_id("close"),
            },
        }
    }

    async fn handle_offer(&self, session_id: SessionId, sdp: String) -> ResponseMessage {
        let (context, created) = match self.registry.get_or_create(&session_id) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(session_id = %session_id, error = %err, "Offer rejected");
                return ResponseMessage::from_error(Some(session_id), &err);
            }
        };

        let waiter = context.answer_waiter();
        match context.submit_offer(sdp, self.engine.as_ref()).await {
            Ok(OfferDisposition::Started) => {
                info!(session_id = %session_id, "Offer accepted, negotiating");
            }
            Ok(OfferDisposition::AlreadyNegotiating) => {
                debug!(session_id = %session_id, "Repeated offer handled as poll");
            }
            Err(err) => {
                if created {
                    self.registry.discard(&session_id);
                }
                warn!(session_id = %session_id, error = %err, "Offer failed");
                return ResponseMessage::from_error(Some(session_id), &err);
            }
        }

        self.await_answer(&context, waiter).await
    }

    async fn handle_poll(&self, session_id: SessionId) -> ResponseMessage {
        let Some(context) = self.registry.find(&session_id) else {
            return unknown_session(session_id);
        };
        context.touch();

        if context.state() == NegotiationState::Idle {
            let err = Error::NegotiationFailure("no offer in progress".to_string());
            return ResponseMessage::from_error(Some(session_id), &err);
        }
        let waiter = context.answer_waiter();
        self.await_answer(&context, waiter).await
    }

    async fn handle_ice_candidate(
        &self,
        session_id: SessionId,
        candidate: IceCandidate,
    ) -> ResponseMessage {
        let Some(context) = self.registry.find(&session_id) else {
            debug!(session_id = %session_id, "ICE candidate for unknown session");
            return unknown_session(session_id);
        };

        match context.add_ice_candidate(candidate).await {
            Ok(disposition) => {
                if disposition == IceDisposition::Rejected {
                    debug!(session_id = %session_id, "Acknowledging candidate the engine rejected");
                }
                ResponseMessage::ack(session_id)
            }
            Err(Error::SessionClosed(_)) => unknown_session(session_id),
            Err(err) => ResponseMessage::from_error(Some(session_id), &err),
        }
    }

    fn handle_close(&self, session_id: SessionId) -> ResponseMessage {
        match self.registry.remove(&session_id) {
            Some(_) => {
                info!(session_id = %session_id, active = self.registry.len(), "Session removed");
                ResponseMessage::ack(session_id)
            }
            None => unknown_session(session_id),
        }
    }

    async fn await_answer(
        &self,
        context: &Arc<ConnectionContext>,
        waiter: SlotWaiter<String>,
    ) -> ResponseMessage {
        let session_id = context.session_id().clone();
        match waiter.wait(self.answer_timeout).await {
            WaitOutcome::Ready(sdp) => {
                context.mark_answer_delivered();
                ResponseMessage::answer(session_id, sdp)
            }
            WaitOutcome::TimedOut => {
                info!(
                    session_id = %session_id,
                    timeout_ms = self.answer_timeout.as_millis() as u64,
                    "Answer not ready in time, client must poll"
                );
                ResponseMessage::processing(session_id)
            }
            WaitOutcome::Failed(reason) => {
                ResponseMessage::from_error(Some(session_id), &Error::NegotiationFailure(reason))
            }
            WaitOutcome::Closed => {
                let err = Error::SessionClosed(session_id.to_string());
                ResponseMessage::from_error(Some(session_id), &err)
            }
        }
    }
}

fn unknown_session(session_id: SessionId) -> ResponseMessage {
    let err = Error::UnknownSession(session_id.to_string());
    ResponseMessage::from_error(Some(session_id), &err)
}

fn missing_session_id(kind: &str) -> ResponseMessage {
    let err = Error::MalformedMessage(format!("{} requires sessionId", kind));
    ResponseMessage::from_error(None, &err)
}
