//! Scriptable in-process engine for tests
//!
//! Completions run on freshly spawned OS threads, like a native engine's
//! signaling thread, after an optional per-session delay. Gates hold a
//! completion until the test opens them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Condvar, Mutex};

use super::{
    Completion, ConnectionObserver, EngineConnection, EngineFailure, EngineOperation,
    EngineResult, IceCandidate, RtcEngine,
};
use crate::session::SessionId;
use crate::{Error, Result};

/// Latch that blocks engine threads until opened
#[derive(Debug, Clone, Default)]
pub struct MockGate {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl MockGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self) {
        let (open, cv) = &*self.inner;
        *open.lock() = true;
        cv.notify_all();
    }

    fn wait(&self) {
        let (open, cv) = &*self.inner;
        let mut open = open.lock();
        while !*open {
            cv.wait(&mut open);
        }
    }
}

/// Per-session script
#[derive(Debug, Clone, Default)]
pub struct MockBehavior {
    /// Delay before every completion fires
    pub callback_delay: Duration,
    /// Delay inside `create_connection`
    pub create_delay: Duration,
    pub fail_create: Option<String>,
    pub fail_remote: Option<String>,
    pub fail_answer: Option<String>,
    pub fail_local: Option<String>,
    pub reject_candidates: bool,
    /// Holds the set-remote-description completion
    pub remote_gate: Option<MockGate>,
    /// Holds the set-local-description completion
    pub local_gate: Option<MockGate>,
}

impl MockBehavior {
    pub fn with_callback_delay(mut self, delay: Duration) -> Self {
        self.callback_delay = delay;
        self
    }

    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = delay;
        self
    }

    pub fn failing_create(mut self, message: impl Into<String>) -> Self {
        self.fail_create = Some(message.into());
        self
    }

    pub fn failing_remote(mut self, message: impl Into<String>) -> Self {
        self.fail_remote = Some(message.into());
        self
    }

    pub fn failing_answer(mut self, message: impl Into<String>) -> Self {
        self.fail_answer = Some(message.into());
        self
    }

    pub fn failing_local(mut self, message: impl Into<String>) -> Self {
        self.fail_local = Some(message.into());
        self
    }

    pub fn rejecting_candidates(mut self) -> Self {
        self.reject_candidates = true;
        self
    }

    pub fn with_remote_gate(mut self, gate: MockGate) -> Self {
        self.remote_gate = Some(gate);
        self
    }

    pub fn with_local_gate(mut self, gate: MockGate) -> Self {
        self.local_gate = Some(gate);
        self
    }
}

#[derive(Default)]
struct Records {
    default_behavior: MockBehavior,
    behaviors: HashMap<SessionId, MockBehavior>,
    created: HashMap<SessionId, usize>,
    candidates: HashMap<SessionId, Vec<String>>,
    observers: HashMap<SessionId, Arc<dyn ConnectionObserver>>,
    closed: Vec<SessionId>,
}

/// Engine double recording everything the coordinator asks of it
#[derive(Clone, Default)]
pub struct MockEngine {
    records: Arc<Mutex<Records>>,
    total_created: Arc<AtomicUsize>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Behavior for sessions without a specific script
    pub fn set_default_behavior(&self, behavior: MockBehavior) {
        self.records.lock().default_behavior = behavior;
    }

    pub fn set_behavior(&self, session_id: impl Into<SessionId>, behavior: MockBehavior) {
        self.records
            .lock()
            .behaviors
            .insert(session_id.into(), behavior);
    }

    /// Connections created across all sessions
    pub fn connections_created(&self) -> usize {
        self.total_created.load(Ordering::SeqCst)
    }

    pub fn connections_for(&self, session_id: &SessionId) -> usize {
        self.records
            .lock()
            .created
            .get(session_id)
            .copied()
            .unwrap_or(0)
    }

    /// Candidates forwarded to the session's connection, in arrival order
    pub fn candidates_for(&self, session_id: &SessionId) -> Vec<String> {
        self.records
            .lock()
            .candidates
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn closed_sessions(&self) -> Vec<SessionId> {
        self.records.lock().closed.clone()
    }

    pub fn is_closed(&self, session_id: &SessionId) -> bool {
        self.records.lock().closed.contains(session_id)
    }

    /// Observer registered for the session, for driving peer-state events
    pub fn observer_for(&self, session_id: &SessionId) -> Option<Arc<dyn ConnectionObserver>> {
        self.records.lock().observers.get(session_id).cloned()
    }

    fn behavior_for(&self, session_id: &SessionId) -> MockBehavior {
        let records = self.records.lock();
        records
            .behaviors
            .get(session_id)
            .cloned()
            .unwrap_or_else(|| records.default_behavior.clone())
    }
}

#[async_trait]
impl RtcEngine for MockEngine {
    async fn create_connection(
        &self,
        session_id: &SessionId,
        observer: Arc<dyn ConnectionObserver>,
    ) -> Result<Arc<dyn EngineConnection>> {
        let behavior = self.behavior_for(session_id);
        if !behavior.create_delay.is_zero() {
            tokio::time::sleep(behavior.create_delay).await;
        }
        if let Some(message) = &behavior.fail_create {
            return Err(Error::EngineError(message.clone()));
        }

        self.total_created.fetch_add(1, Ordering::SeqCst);
        {
            let mut records = self.records.lock();
            *records.created.entry(session_id.clone()).or_default() += 1;
            records.observers.insert(session_id.clone(), observer);
        }

        Ok(Arc::new(MockConnection {
            session_id: session_id.clone(),
            behavior,
            records: Arc::clone(&self.records),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MockConnection {
    session_id: SessionId,
    behavior: MockBehavior,
    records: Arc<Mutex<Records>>,
    closed: AtomicBool,
}

impl MockConnection {
    fn complete_later<T: Send + 'static>(
        &self,
        gate: Option<MockGate>,
        outcome: EngineResult<T>,
        on_done: Completion<T>,
    ) {
        let delay = self.behavior.callback_delay;
        std::thread::spawn(move || {
            if !delay.is_zero() {
                std::thread::sleep(delay);
            }
            if let Some(gate) = gate {
                gate.wait();
            }
            on_done(outcome);
        });
    }

    fn outcome<T>(
        operation: EngineOperation,
        failure: &Option<String>,
        value: T,
    ) -> EngineResult<T> {
        match failure {
            Some(message) => Err(EngineFailure::new(operation, message.clone())),
            None => Ok(value),
        }
    }
}

impl EngineConnection for MockConnection {
    fn set_remote_description(&self, _sdp: String, on_done: Completion<()>) {
        let outcome = Self::outcome(
            EngineOperation::SetRemoteDescription,
            &self.behavior.fail_remote,
            (),
        );
        self.complete_later(self.behavior.remote_gate.clone(), outcome, on_done);
    }

    fn create_answer(&self, on_done: Completion<String>) {
        let answer = format!(
            "v=0\r\no=- 0 2 IN IP4 127.0.0.1\r\ns=mock-answer\r\nt=0 0\r\na=session:{}\r\n",
            self.session_id
        );
        let outcome = Self::outcome(EngineOperation::CreateAnswer, &self.behavior.fail_answer, answer);
        self.complete_later(None, outcome, on_done);
    }

    fn set_local_description(&self, sdp: String, on_done: Completion<String>) {
        let outcome = Self::outcome(
            EngineOperation::SetLocalDescription,
            &self.behavior.fail_local,
            sdp,
        );
        self.complete_later(self.behavior.local_gate.clone(), outcome, on_done);
    }

    fn add_ice_candidate(&self, candidate: &IceCandidate) -> bool {
        if self.behavior.reject_candidates || self.closed.load(Ordering::SeqCst) {
            return false;
        }
        self.records
            .lock()
            .candidates
            .entry(self.session_id.clone())
            .or_default()
            .push(candidate.candidate.clone());
        true
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.records.lock().closed.push(self.session_id.clone());
        }
    }
}
