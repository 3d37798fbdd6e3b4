//! Session registry
//!
//! The registry lock guards map membership only. It is never held across
//! an `.await` or an engine call; per-session work happens under each
//! context's own locks. Closed ids are remembered for a while so late
//! messages for them keep resolving to `UnknownSession` instead of
//! silently starting a new negotiation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info};

use super::context::{ConnectionContext, NegotiationState};
use super::SessionId;
use crate::config::SignalingConfig;
use crate::engine::PeerState;
use crate::{Error, Result};

/// How long a closed id stays retired
pub const DEFAULT_RETIRED_TTL: Duration = Duration::from_secs(600);

/// Upper bound on remembered closed ids
const MAX_RETIRED: usize = 4096;

/// Point-in-time view of one session
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub state: NegotiationState,
    pub peer_state: Option<PeerState>,
    pub age_ms: u64,
    pub idle_ms: u64,
    pub buffered_candidates: usize,
}

#[derive(Default)]
struct Sessions {
    live: HashMap<SessionId, Arc<ConnectionContext>>,
    retired: HashMap<SessionId, Instant>,
}

impl Sessions {
    fn retire(&mut self, id: SessionId) {
        if self.retired.len() >= MAX_RETIRED {
            let oldest = self
                .retired
                .iter()
                .min_by_key(|(_, at)| **at)
                .map(|(id, _)| id.clone());
            if let Some(oldest) = oldest {
                self.retired.remove(&oldest);
            }
        }
        self.retired.insert(id, Instant::now());
    }
}

/// Concurrent map from session id to its connection context
pub struct SessionRegistry {
    sessions: RwLock<Sessions>,
    max_sessions: usize,
    max_buffered_candidates: usize,
    retired_ttl: Duration,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize, max_buffered_candidates: usize) -> Self {
        Self {
            sessions: RwLock::new(Sessions::default()),
            max_sessions,
            max_buffered_candidates,
            retired_ttl: DEFAULT_RETIRED_TTL,
        }
    }

    pub fn from_config(config: &SignalingConfig) -> Self {
        Self::new(config.max_sessions, config.max_buffered_candidates)
    }

    /// Override how long closed ids stay retired
    pub fn with_retired_ttl(mut self, ttl: Duration) -> Self {
        self.retired_ttl = ttl;
        self
    }

    /// Return the context for `id`, creating it if absent.
    ///
    /// The boolean is true when this call created the context. Creation
    /// only allocates the context; the engine connection is set up later
    /// under the context's own lock.
    pub fn get_or_create(&self, id: &SessionId) -> Result<(Arc<ConnectionContext>, bool)> {
        if let Some(context) = self.sessions.read().live.get(id) {
            return Ok((Arc::clone(context), false));
        }

        let mut sessions = self.sessions.write();
        if let Some(context) = sessions.live.get(id) {
            return Ok((Arc::clone(context), false));
        }
        if sessions.retired.contains_key(id) {
            return Err(Error::UnknownSession(id.to_string()));
        }
        if sessions.live.len() >= self.max_sessions {
            return Err(Error::SessionLimitExceeded(format!(
                "{} sessions active",
                sessions.live.len()
            )));
        }

        let context = Arc::new(ConnectionContext::new(
            id.clone(),
            self.max_buffered_candidates,
        ));
        sessions.live.insert(id.clone(), Arc::clone(&context));
        debug!(session_id = %id, active = sessions.live.len(), "Session created");
        Ok((context, true))
    }

    pub fn find(&self, id: &SessionId) -> Option<Arc<ConnectionContext>> {
        self.sessions.read().live.get(id).cloned()
    }

    /// Remove the session and release its engine handle
    pub fn remove(&self, id: &SessionId) -> Option<Arc<ConnectionContext>> {
        let removed = {
            let mut sessions = self.sessions.write();
            let removed = sessions.live.remove(id);
            if removed.is_some() {
                sessions.retire(id.clone());
            }
            removed
        };

        if let Some(context) = &removed {
            context.close();
        }
        removed
    }

    /// Drop a session that never got past setup, without retiring its id
    pub(crate) fn discard(&self, id: &SessionId) {
        let removed = self.sessions.write().live.remove(id);
        if let Some(context) = removed {
            context.close();
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.read().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.read().live.keys().cloned().collect()
    }

    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        let contexts: Vec<Arc<ConnectionContext>> =
            self.sessions.read().live.values().cloned().collect();
        contexts
            .iter()
            .map(|context| SessionSnapshot {
                session_id: context.session_id().clone(),
                state: context.state(),
                peer_state: context.peer_state(),
                age_ms: context.age().as_millis() as u64,
                idle_ms: context.idle_for().as_millis() as u64,
                buffered_candidates: context.pending_candidate_count(),
            })
            .collect()
    }

    /// Number of live sessions per negotiation state
    pub fn state_counts(&self) -> HashMap<NegotiationState, usize> {
        let contexts: Vec<Arc<ConnectionContext>> =
            self.sessions.read().live.values().cloned().collect();
        let mut counts = HashMap::new();
        for context in contexts {
            *counts.entry(context.state()).or_insert(0) += 1;
        }
        counts
    }

    /// Remove sessions idle for at least `idle_timeout` whose peer link is
    /// not connected. Also forgets expired retired ids.
    pub fn remove_idle(&self, idle_timeout: Duration) -> Vec<SessionId> {
        let expired: Vec<Arc<ConnectionContext>> = {
            let mut sessions = self.sessions.write();
            let ttl = self.retired_ttl;
            sessions.retired.retain(|_, at| at.elapsed() < ttl);

            let ids: Vec<SessionId> = sessions
                .live
                .iter()
                .filter(|(_, context)| context.is_reapable(idle_timeout))
                .map(|(id, _)| id.clone())
                .collect();
            let mut expired = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(context) = sessions.live.remove(&id) {
                    sessions.retire(id);
                    expired.push(context);
                }
            }
            expired
        };

        for context in &expired {
            info!(
                session_id = %context.session_id(),
                state = %context.state(),
                idle_secs = context.idle_for().as_secs(),
                "Reaping idle session"
            );
            context.close();
        }
        expired
            .iter()
            .map(|context| context.session_id().clone())
            .collect()
    }

    /// Close every session. Used at shutdown.
    pub fn close_all(&self) -> usize {
        let drained: Vec<(SessionId, Arc<ConnectionContext>)> = {
            let mut sessions = self.sessions.write();
            let drained: Vec<_> = sessions.live.drain().collect();
            for (id, _) in &drained {
                sessions.retire(id.clone());
            }
            drained
        };
        for (_, context) in &drained {
            context.close();
        }
        drained.len()
    }
}
