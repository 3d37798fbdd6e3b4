//! Per-session negotiation state machine
//!
//! ```text
//! Idle ──offer──> OfferReceived ──remote set──> AnsweringInProgress
//!                                                      │ local set
//!                                                      v
//!                   Connected <──answer delivered── AnswerReady
//!
//! any ──engine failure──> Failed        any ──close──> Closed (absorbing)
//! ```
//!
//! Two locks guard a context. `ops` is an async FIFO lock that serializes
//! client operations in arrival order, including the engine connection
//! setup. `state` is a short synchronous lock shared with engine
//! completions, which arrive on engine threads. Engine calls that take a
//! completion are always made with `state` released.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::SessionId;
use crate::bridge::{CompletionSlot, SlotWaiter};
use crate::engine::{
    ConnectionObserver, EngineConnection, EngineFailure, EngineOperation, EngineResult,
    IceCandidate, PeerState, RtcEngine,
};
use crate::{Error, Result};

/// Negotiation state of one session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationState {
    Idle,
    OfferReceived,
    AnsweringInProgress,
    AnswerReady,
    Connected,
    Failed,
    Closed,
}

impl NegotiationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NegotiationState::Idle => "idle",
            NegotiationState::OfferReceived => "offer_received",
            NegotiationState::AnsweringInProgress => "answering_in_progress",
            NegotiationState::AnswerReady => "answer_ready",
            NegotiationState::Connected => "connected",
            NegotiationState::Failed => "failed",
            NegotiationState::Closed => "closed",
        }
    }

    /// Failed and Closed accept nothing but Close
    pub fn is_terminal(&self) -> bool {
        matches!(self, NegotiationState::Failed | NegotiationState::Closed)
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pending-answer slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnswerSlot {
    Empty,
    /// Answer produced, not yet handed to the client
    Unconsumed(String),
    /// Answer handed out at least once; kept for client retries
    Consumed(String),
}

impl AnswerSlot {
    pub fn sdp(&self) -> Option<&str> {
        match self {
            AnswerSlot::Empty => None,
            AnswerSlot::Unconsumed(sdp) | AnswerSlot::Consumed(sdp) => Some(sdp),
        }
    }
}

/// What happened to a submitted offer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferDisposition {
    /// Negotiation started
    Started,
    /// Negotiation was already under way or done; the offer acts as a poll
    AlreadyNegotiating,
}

/// What happened to a submitted ICE candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceDisposition {
    /// Handed to the engine immediately
    Forwarded,
    /// Queued until the remote description is set
    Buffered,
    /// Engine refused the candidate
    Rejected,
    /// Empty candidate marking the end of the client's gathering
    EndOfCandidates,
}

struct ContextState {
    negotiation: NegotiationState,
    connection: Option<Arc<dyn EngineConnection>>,
    offer_sdp: Option<String>,
    remote_description_set: bool,
    pending_candidates: VecDeque<IceCandidate>,
    answer: AnswerSlot,
    failure: Option<String>,
    last_activity: Instant,
}

/// Engine observer owned by the context. Logs and records peer state.
pub(crate) struct SessionObserver {
    session_id: SessionId,
    peer_state: Mutex<Option<PeerState>>,
    local_candidates: Mutex<usize>,
}

impl ConnectionObserver for SessionObserver {
    fn on_peer_state_change(&self, state: PeerState) {
        info!(session_id = %self.session_id, peer_state = ?state, "Peer connection state changed");
        *self.peer_state.lock() = Some(state);
    }

    fn on_local_candidate(&self, candidate: &IceCandidate) {
        debug!(
            session_id = %self.session_id,
            candidate = %candidate.candidate,
            "Gathered local ICE candidate"
        );
        *self.local_candidates.lock() += 1;
    }
}

/// State for one live session
pub struct ConnectionContext {
    session_id: SessionId,
    created_at: Instant,
    max_buffered_candidates: usize,
    ops: tokio::sync::Mutex<()>,
    // Owns the engine handle. Declared before `observer` so the handle is
    // released first on drop.
    state: Mutex<ContextState>,
    answer: CompletionSlot<String>,
    observer: Arc<SessionObserver>,
}

impl ConnectionContext {
    pub fn new(session_id: SessionId, max_buffered_candidates: usize) -> Self {
        let now = Instant::now();
        Self {
            observer: Arc::new(SessionObserver {
                session_id: session_id.clone(),
                peer_state: Mutex::new(None),
                local_candidates: Mutex::new(0),
            }),
            session_id,
            created_at: now,
            max_buffered_candidates,
            ops: tokio::sync::Mutex::new(()),
            state: Mutex::new(ContextState {
                negotiation: NegotiationState::Idle,
                connection: None,
                offer_sdp: None,
                remote_description_set: false,
                pending_candidates: VecDeque::new(),
                answer: AnswerSlot::Empty,
                failure: None,
                last_activity: now,
            }),
            answer: CompletionSlot::new(),
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn state(&self) -> NegotiationState {
        self.state.lock().negotiation
    }

    pub fn answer_slot(&self) -> AnswerSlot {
        self.state.lock().answer.clone()
    }

    /// Reason recorded when negotiation failed
    pub fn failure(&self) -> Option<String> {
        self.state.lock().failure.clone()
    }

    /// Last peer state reported by the engine
    pub fn peer_state(&self) -> Option<PeerState> {
        *self.observer.peer_state.lock()
    }

    pub fn local_candidate_count(&self) -> usize {
        *self.observer.local_candidates.lock()
    }

    pub fn pending_candidate_count(&self) -> usize {
        self.state.lock().pending_candidates.len()
    }

    pub fn has_connection(&self) -> bool {
        self.state.lock().connection.is_some()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Time since the last client request touched this session
    pub fn idle_for(&self) -> Duration {
        self.state.lock().last_activity.elapsed()
    }

    pub fn touch(&self) {
        self.state.lock().last_activity = Instant::now();
    }

    pub(crate) fn observer(&self) -> Arc<dyn ConnectionObserver> {
        self.observer.clone()
    }

    /// Idle past `timeout` and not holding a live peer link
    pub fn is_reapable(&self, timeout: Duration) -> bool {
        let idle = self.idle_for() >= timeout;
        idle && self.peer_state() != Some(PeerState::Connected)
    }

    /// Subscribe to the answer. Call before triggering negotiation.
    pub fn answer_waiter(&self) -> SlotWaiter<String> {
        self.answer.waiter()
    }

    /// Feed a client offer into the state machine.
    ///
    /// Creates the engine connection on first use. Only the per-session
    /// `ops` lock is held while the engine sets it up.
    #[instrument(skip(self, sdp, engine), fields(session_id = %self.session_id))]
    pub async fn submit_offer(
        self: &Arc<Self>,
        sdp: String,
        engine: &dyn RtcEngine,
    ) -> Result<OfferDisposition> {
        let _ops = self.ops.lock().await;

        {
            let mut state = self.state.lock();
            state.last_activity = Instant::now();
            match state.negotiation {
                NegotiationState::Idle => {}
                NegotiationState::Closed => {
                    return Err(Error::SessionClosed(self.session_id.to_string()))
                }
                NegotiationState::Failed => {
                    return Err(Error::NegotiationFailure(
                        state
                            .failure
                            .clone()
                            .unwrap_or_else(|| "negotiation failed".to_string()),
                    ))
                }
                current => {
                    if state.offer_sdp.as_deref() != Some(sdp.as_str()) {
                        warn!(
                            state = %current,
                            "Ignoring different offer for a session that is already negotiating"
                        );
                    }
                    return Ok(OfferDisposition::AlreadyNegotiating);
                }
            }
        }

        if sdp.trim().is_empty() {
            return Err(Error::MalformedMessage("offer sdp is empty".to_string()));
        }

        let existing = self.state.lock().connection.clone();
        let connection = match existing {
            Some(connection) => connection,
            None => self.open_connection(engine).await?,
        };

        {
            let mut state = self.state.lock();
            if state.negotiation != NegotiationState::Idle {
                return Err(Error::SessionClosed(self.session_id.to_string()));
            }
            state.offer_sdp = Some(sdp.clone());
            self.transition(&mut state, NegotiationState::OfferReceived);
        }

        let weak = Arc::downgrade(self);
        connection.set_remote_description(
            sdp,
            Box::new(move |result: EngineResult<()>| {
                if let Some(context) = weak.upgrade() {
                    context.on_remote_description_set(result);
                }
            }),
        );

        Ok(OfferDisposition::Started)
    }

    async fn open_connection(&self, engine: &dyn RtcEngine) -> Result<Arc<dyn EngineConnection>> {
        let connection = engine
            .create_connection(&self.session_id, self.observer())
            .await?;
        debug!(session_id = %self.session_id, "Engine connection created");

        let mut state = self.state.lock();
        if state.negotiation == NegotiationState::Closed {
            drop(state);
            connection.close();
            return Err(Error::SessionClosed(self.session_id.to_string()));
        }
        state.connection = Some(Arc::clone(&connection));
        Ok(connection)
    }

    /// Feed a remote ICE candidate into the state machine
    pub async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<IceDisposition> {
        let _ops = self.ops.lock().await;
        let mut state = self.state.lock();
        state.last_activity = Instant::now();

        match state.negotiation {
            NegotiationState::Closed => {
                return Err(Error::SessionClosed(self.session_id.to_string()))
            }
            NegotiationState::Failed => {
                return Err(Error::NegotiationFailure(
                    state
                        .failure
                        .clone()
                        .unwrap_or_else(|| "negotiation failed".to_string()),
                ))
            }
            _ => {}
        }

        if candidate.candidate.trim().is_empty() {
            debug!(session_id = %self.session_id, "Client finished ICE gathering");
            return Ok(IceDisposition::EndOfCandidates);
        }

        if state.remote_description_set {
            let Some(connection) = state.connection.clone() else {
                return Err(Error::InternalError(
                    "remote description set without an engine connection".to_string(),
                ));
            };
            if connection.add_ice_candidate(&candidate) {
                Ok(IceDisposition::Forwarded)
            } else {
                warn!(session_id = %self.session_id, candidate = %candidate.candidate, "Engine rejected ICE candidate");
                Ok(IceDisposition::Rejected)
            }
        } else {
            if state.pending_candidates.len() >= self.max_buffered_candidates {
                return Err(Error::IceCandidateError(format!(
                    "candidate buffer full ({} pending)",
                    self.max_buffered_candidates
                )));
            }
            state.pending_candidates.push_back(candidate);
            debug!(
                session_id = %self.session_id,
                pending = state.pending_candidates.len(),
                "Buffered ICE candidate until remote description is set"
            );
            Ok(IceDisposition::Buffered)
        }
    }

    /// Record that the client received the answer
    pub fn mark_answer_delivered(&self) {
        let mut state = self.state.lock();
        state.last_activity = Instant::now();
        if let AnswerSlot::Unconsumed(sdp) = &state.answer {
            state.answer = AnswerSlot::Consumed(sdp.clone());
        }
        if state.negotiation == NegotiationState::AnswerReady {
            self.transition(&mut state, NegotiationState::Connected);
        }
    }

    /// Move to Closed, wake waiters and release the engine handle.
    ///
    /// Returns false if the context was already closed.
    pub fn close(&self) -> bool {
        let connection = {
            let mut state = self.state.lock();
            if state.negotiation == NegotiationState::Closed {
                return false;
            }
            self.transition(&mut state, NegotiationState::Closed);
            state.pending_candidates.clear();
            state.connection.take()
        };

        self.answer.cancel();
        if let Some(connection) = connection {
            connection.close();
        }
        info!(session_id = %self.session_id, "Session closed");
        true
    }

    fn on_remote_description_set(self: &Arc<Self>, result: EngineResult<()>) {
        if let Err(failure) = result {
            self.fail(failure);
            return;
        }

        let connection = {
            let mut state = self.state.lock();
            if state.negotiation != NegotiationState::OfferReceived {
                debug!(session_id = %self.session_id, state = %state.negotiation, "Dropping late remote description completion");
                return;
            }
            let Some(connection) = state.connection.clone() else {
                return;
            };
            state.remote_description_set = true;

            let flushed = state.pending_candidates.len();
            while let Some(candidate) = state.pending_candidates.pop_front() {
                if !connection.add_ice_candidate(&candidate) {
                    warn!(session_id = %self.session_id, candidate = %candidate.candidate, "Engine rejected buffered ICE candidate");
                }
            }
            if flushed > 0 {
                debug!(session_id = %self.session_id, count = flushed, "Flushed buffered ICE candidates");
            }

            self.transition(&mut state, NegotiationState::AnsweringInProgress);
            connection
        };

        let weak = Arc::downgrade(self);
        connection.create_answer(Box::new(move |result: EngineResult<String>| {
            if let Some(context) = weak.upgrade() {
                context.on_answer_created(result);
            }
        }));
    }

    fn on_answer_created(self: &Arc<Self>, result: EngineResult<String>) {
        let sdp = match result {
            Ok(sdp) => sdp,
            Err(failure) => return self.fail(failure),
        };

        let connection = {
            let state = self.state.lock();
            if state.negotiation != NegotiationState::AnsweringInProgress {
                return;
            }
            match state.connection.clone() {
                Some(connection) => connection,
                None => return,
            }
        };

        let weak: Weak<Self> = Arc::downgrade(self);
        connection.set_local_description(
            sdp,
            Box::new(move |result: EngineResult<String>| {
                if let Some(context) = weak.upgrade() {
                    context.on_local_description_set(result);
                }
            }),
        );
    }

    fn on_local_description_set(&self, result: EngineResult<String>) {
        let sdp = match result {
            Ok(sdp) if !sdp.trim().is_empty() => sdp,
            Ok(_) => {
                return self.fail(EngineFailure::new(
                    EngineOperation::SetLocalDescription,
                    "engine produced an empty answer",
                ))
            }
            Err(failure) => return self.fail(failure),
        };

        {
            let mut state = self.state.lock();
            if state.negotiation != NegotiationState::AnsweringInProgress {
                return;
            }
            state.answer = AnswerSlot::Unconsumed(sdp.clone());
            self.transition(&mut state, NegotiationState::AnswerReady);
        }

        self.answer.complete(sdp);
        info!(session_id = %self.session_id, "Answer ready");
    }

    fn fail(&self, failure: EngineFailure) {
        let reason = failure.to_string();
        {
            let mut state = self.state.lock();
            if state.negotiation.is_terminal() {
                return;
            }
            state.failure = Some(reason.clone());
            self.transition(&mut state, NegotiationState::Failed);
        }
        warn!(session_id = %self.session_id, error = %reason, "Negotiation failed");
        self.answer.fail(reason);
    }

    fn transition(&self, state: &mut ContextState, next: NegotiationState) {
        debug!(
            session_id = %self.session_id,
            from = %state.negotiation,
            to = %next,
            "Negotiation state transition"
        );
        state.negotiation = next;
    }
}

impl fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("session_id", &self.session_id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::WaitOutcome;
    use crate::engine::mock::{MockBehavior, MockEngine, MockGate};

    const WAIT: Duration = Duration::from_secs(5);

    fn candidate(n: usize) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{} 1 udp 2122260223 10.0.0.{} 5000 typ host", n, n),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        }
    }

    fn context(id: &str) -> Arc<ConnectionContext> {
        Arc::new(ConnectionContext::new(SessionId::from(id), 8))
    }

    #[tokio::test]
    async fn test_offer_reaches_answer_ready() {
        let engine = MockEngine::new();
        let ctx = context("s1");
        let waiter = ctx.answer_waiter();

        let disposition = ctx.submit_offer("v=0 offer".to_string(), &engine).await.unwrap();
        assert_eq!(disposition, OfferDisposition::Started);

        let sdp = match waiter.wait(WAIT).await {
            WaitOutcome::Ready(sdp) => sdp,
            other => panic!("expected answer, got {:?}", other),
        };
        assert!(sdp.contains("a=session:s1"));
        assert_eq!(ctx.state(), NegotiationState::AnswerReady);
        assert_eq!(ctx.answer_slot(), AnswerSlot::Unconsumed(sdp.clone()));

        ctx.mark_answer_delivered();
        assert_eq!(ctx.state(), NegotiationState::Connected);
        assert_eq!(ctx.answer_slot(), AnswerSlot::Consumed(sdp));
    }

    #[tokio::test]
    async fn test_empty_offer_stays_idle() {
        let engine = MockEngine::new();
        let ctx = context("s1");

        let result = ctx.submit_offer("  ".to_string(), &engine).await;
        assert!(matches!(result, Err(Error::MalformedMessage(_))));
        assert_eq!(ctx.state(), NegotiationState::Idle);
        assert_eq!(engine.connections_created(), 0);
    }

    #[tokio::test]
    async fn test_candidates_buffered_then_flushed_in_order() {
        let engine = MockEngine::new();
        let gate = MockGate::new();
        engine.set_behavior("s1", MockBehavior::default().with_remote_gate(gate.clone()));

        let ctx = context("s1");
        let waiter = ctx.answer_waiter();
        ctx.submit_offer("offer".to_string(), &engine).await.unwrap();
        assert_eq!(ctx.state(), NegotiationState::OfferReceived);

        for n in 1..=4 {
            let disposition = ctx.add_ice_candidate(candidate(n)).await.unwrap();
            assert_eq!(disposition, IceDisposition::Buffered);
        }
        assert_eq!(ctx.pending_candidate_count(), 4);
        assert!(engine.candidates_for(ctx.session_id()).is_empty());

        gate.open();
        assert!(matches!(waiter.wait(WAIT).await, WaitOutcome::Ready(_)));

        let forwarded = engine.candidates_for(ctx.session_id());
        let expected: Vec<String> = (1..=4).map(|n| candidate(n).candidate).collect();
        assert_eq!(forwarded, expected);
        assert_eq!(ctx.pending_candidate_count(), 0);

        assert_eq!(
            ctx.add_ice_candidate(candidate(5)).await.unwrap(),
            IceDisposition::Forwarded
        );
        assert_eq!(engine.candidates_for(ctx.session_id()).len(), 5);
    }

    #[tokio::test]
    async fn test_end_of_candidates_is_accepted() {
        let engine = MockEngine::new();
        let ctx = context("s1");
        ctx.submit_offer("offer".to_string(), &engine).await.unwrap();

        let end = IceCandidate {
            candidate: String::new(),
            sdp_mid: None,
            sdp_mline_index: None,
        };
        assert_eq!(
            ctx.add_ice_candidate(end).await.unwrap(),
            IceDisposition::EndOfCandidates
        );
    }

    #[tokio::test]
    async fn test_buffer_capacity_enforced() {
        let engine = MockEngine::new();
        let gate = MockGate::new();
        engine.set_behavior("s1", MockBehavior::default().with_remote_gate(gate.clone()));

        let ctx = Arc::new(ConnectionContext::new(SessionId::from("s1"), 2));
        ctx.submit_offer("offer".to_string(), &engine).await.unwrap();
        ctx.add_ice_candidate(candidate(1)).await.unwrap();
        ctx.add_ice_candidate(candidate(2)).await.unwrap();
        assert!(matches!(
            ctx.add_ice_candidate(candidate(3)).await,
            Err(Error::IceCandidateError(_))
        ));
        gate.open();
    }

    #[tokio::test]
    async fn test_repeated_offer_reuses_connection() {
        let engine = MockEngine::new();
        let gate = MockGate::new();
        engine.set_behavior("s1", MockBehavior::default().with_remote_gate(gate.clone()));

        let ctx = context("s1");
        ctx.submit_offer("offer".to_string(), &engine).await.unwrap();
        let second = ctx.submit_offer("offer".to_string(), &engine).await.unwrap();
        assert_eq!(second, OfferDisposition::AlreadyNegotiating);
        assert_eq!(engine.connections_created(), 1);
        gate.open();
    }

    #[tokio::test]
    async fn test_engine_failure_moves_to_failed() {
        let engine = MockEngine::new();
        engine.set_behavior("s1", MockBehavior::default().failing_remote("bad sdp"));

        let ctx = context("s1");
        let waiter = ctx.answer_waiter();
        ctx.submit_offer("offer".to_string(), &engine).await.unwrap();

        match waiter.wait(WAIT).await {
            WaitOutcome::Failed(reason) => assert!(reason.contains("bad sdp")),
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(ctx.state(), NegotiationState::Failed);
        assert!(ctx.failure().is_some());

        assert!(matches!(
            ctx.add_ice_candidate(candidate(1)).await,
            Err(Error::NegotiationFailure(_))
        ));
        assert!(matches!(
            ctx.submit_offer("offer".to_string(), &engine).await,
            Err(Error::NegotiationFailure(_))
        ));

        assert!(ctx.close());
        assert_eq!(ctx.state(), NegotiationState::Closed);
    }

    #[tokio::test]
    async fn test_answer_and_local_failures() {
        for behavior in [
            MockBehavior::default().failing_answer("no codecs"),
            MockBehavior::default().failing_local("dtls"),
        ] {
            let engine = MockEngine::new();
            engine.set_behavior("s1", behavior);
            let ctx = context("s1");
            let waiter = ctx.answer_waiter();
            ctx.submit_offer("offer".to_string(), &engine).await.unwrap();
            assert!(matches!(waiter.wait(WAIT).await, WaitOutcome::Failed(_)));
            assert_eq!(ctx.state(), NegotiationState::Failed);
        }
    }

    #[tokio::test]
    async fn test_close_wakes_waiter_and_releases_handle() {
        let engine = MockEngine::new();
        let gate = MockGate::new();
        engine.set_behavior("s1", MockBehavior::default().with_remote_gate(gate.clone()));

        let ctx = context("s1");
        let waiter = ctx.answer_waiter();
        ctx.submit_offer("offer".to_string(), &engine).await.unwrap();

        let closer = Arc::clone(&ctx);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            closer.close();
        });

        let started = Instant::now();
        assert_eq!(waiter.wait(Duration::from_secs(30)).await, WaitOutcome::Closed);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(engine.is_closed(ctx.session_id()));
        assert!(!ctx.has_connection());

        // Late completion after close must not resurrect the session
        gate.open();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ctx.state(), NegotiationState::Closed);
        assert_eq!(ctx.answer_slot(), AnswerSlot::Empty);
    }

    #[tokio::test]
    async fn test_close_is_absorbing() {
        let engine = MockEngine::new();
        let ctx = context("s1");
        assert!(ctx.close());
        assert!(!ctx.close());

        assert!(matches!(
            ctx.submit_offer("offer".to_string(), &engine).await,
            Err(Error::SessionClosed(_))
        ));
        assert!(matches!(
            ctx.add_ice_candidate(candidate(1)).await,
            Err(Error::SessionClosed(_))
        ));
        assert_eq!(engine.connections_created(), 0);
    }

    #[tokio::test]
    async fn test_close_during_connection_setup() {
        let engine = MockEngine::new();
        engine.set_behavior(
            "s1",
            MockBehavior::default().with_create_delay(Duration::from_millis(100)),
        );

        let ctx = context("s1");
        let offering = {
            let ctx = Arc::clone(&ctx);
            let engine = engine.clone();
            tokio::spawn(async move { ctx.submit_offer("offer".to_string(), &engine).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(ctx.close());

        let result = offering.await.unwrap();
        assert!(matches!(result, Err(Error::SessionClosed(_))));
        assert!(engine.is_closed(ctx.session_id()));
    }

    #[tokio::test]
    async fn test_observer_tracks_peer_state() {
        let engine = MockEngine::new();
        let ctx = context("s1");
        ctx.submit_offer("offer".to_string(), &engine).await.unwrap();

        let observer = engine.observer_for(ctx.session_id()).unwrap();
        observer.on_peer_state_change(PeerState::Connected);
        observer.on_local_candidate(&candidate(1));

        assert_eq!(ctx.peer_state(), Some(PeerState::Connected));
        assert_eq!(ctx.local_candidate_count(), 1);
        assert!(!ctx.is_reapable(Duration::ZERO));

        observer.on_peer_state_change(PeerState::Disconnected);
        assert!(ctx.is_reapable(Duration::ZERO));
    }
}
