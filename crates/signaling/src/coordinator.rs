//! Process-level coordinator
//!
//! Owns the session registry, the dispatcher and the shared video source,
//! and runs the background maintenance tasks (idle reaper, periodic stats).

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{SignalingConfig, VideoSourceConfig};
use crate::engine::RtcEngine;
use crate::media::VideoSource;
use crate::session::{SessionId, SessionRegistry};
use crate::signaling::{Dispatcher, ResponseMessage};
use crate::Result;

/// Coordinator statistics
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStats {
    pub uptime_secs: u64,
    pub active_sessions: usize,
    pub sessions_by_state: BTreeMap<String, usize>,
    pub frames_generated: u64,
    pub video: VideoSourceConfig,
    /// Expected per-client bitrate in Mbps
    pub expected_bitrate_mbps: f64,
}

/// Signaling coordinator
pub struct Coordinator {
    config: SignalingConfig,
    registry: Arc<SessionRegistry>,
    dispatcher: Dispatcher,
    video_source: Option<Arc<dyn VideoSource>>,
    started_at: Instant,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Coordinator {
    pub fn new(
        config: SignalingConfig,
        engine: Arc<dyn RtcEngine>,
        video_source: Option<Arc<dyn VideoSource>>,
    ) -> Result<Self> {
        config.validate()?;

        let registry = Arc::new(SessionRegistry::from_config(&config));
        let dispatcher = Dispatcher::new(Arc::clone(&registry), engine, config.answer_timeout());
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            registry,
            dispatcher,
            video_source,
            started_at: Instant::now(),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Start the video source and the background tasks. Must be called
    /// from within a tokio runtime.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if let Some(source) = &self.video_source {
            source.start()?;
        }

        let mut tasks = self.tasks.lock();
        if let Some(idle_timeout) = self.config.session_idle_timeout() {
            info!(
                idle_timeout_secs = idle_timeout.as_secs(),
                interval_secs = self.config.reap_interval().as_secs(),
                "Idle session reaper enabled"
            );
            tasks.push(self.spawn_periodic(self.config.reap_interval(), |coordinator| {
                coordinator.reap_idle_sessions();
            }));
        }
        if let Some(interval) = self.config.stats_interval() {
            tasks.push(self.spawn_periodic(interval, |coordinator| {
                coordinator.log_stats();
            }));
        }

        info!(
            max_sessions = self.config.max_sessions,
            answer_timeout_ms = self.config.answer_timeout_ms,
            "Signaling coordinator started"
        );
        Ok(())
    }

    fn spawn_periodic<F>(self: &Arc<Self>, period: std::time::Duration, tick: F) -> JoinHandle<()>
    where
        F: Fn(&Coordinator) + Send + 'static,
    {
        let coordinator: Weak<Coordinator> = Arc::downgrade(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // First tick completes immediately
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let Some(coordinator) = coordinator.upgrade() else { break };
                        tick(&coordinator);
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        })
    }

    /// Handle one raw signaling request body
    pub async fn handle_request(&self, body: &[u8]) -> ResponseMessage {
        self.dispatcher.handle_body(body).await
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &SignalingConfig {
        &self.config
    }

    pub fn stats(&self) -> CoordinatorStats {
        let video = self
            .video_source
            .as_ref()
            .map(|source| source.format())
            .unwrap_or(self.config.video);
        let sessions_by_state = self
            .registry
            .state_counts()
            .into_iter()
            .map(|(state, count)| (state.as_str().to_string(), count))
            .collect();

        CoordinatorStats {
            uptime_secs: self.started_at.elapsed().as_secs(),
            active_sessions: self.registry.len(),
            sessions_by_state,
            frames_generated: self
                .video_source
                .as_ref()
                .map_or(0, |source| source.frames_generated()),
            video,
            expected_bitrate_mbps: video.expected_bitrate_mbps(),
        }
    }

    /// Remove sessions idle past the configured timeout
    pub fn reap_idle_sessions(&self) -> Vec<SessionId> {
        let Some(idle_timeout) = self.config.session_idle_timeout() else {
            return Vec::new();
        };
        let reaped = self.registry.remove_idle(idle_timeout);
        if !reaped.is_empty() {
            info!(
                reaped = reaped.len(),
                active = self.registry.len(),
                "Reaped idle sessions"
            );
        }
        reaped
    }

    fn log_stats(&self) {
        if self.registry.is_empty() {
            return;
        }
        let stats = self.stats();
        info!(
            active_sessions = stats.active_sessions,
            frames = stats.frames_generated,
            expected_bitrate_mbps = stats.expected_bitrate_mbps,
            states = ?stats.sessions_by_state,
            "Coordinator stats"
        );
    }

    /// Stop background tasks, close every session and stop the source
    pub async fn shutdown(&self) {
        info!("Shutting down signaling coordinator");
        let _ = self.shutdown_tx.send(());

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!("Background task ended abnormally: {}", e);
                }
            }
        }

        let closed = self.registry.close_all();
        debug!(closed, "Closed sessions");

        if let Some(source) = &self.video_source {
            let source = Arc::clone(source);
            // Joining the frame thread blocks
            let stopped = tokio::task::spawn_blocking(move || {
                source.stop();
                source.frames_generated()
            })
            .await;
            match stopped {
                Ok(frames) => info!(total_frames = frames, "Video source stopped"),
                Err(e) => warn!("Failed to stop video source: {}", e),
            }
        }
        info!(sessions_closed = closed, "Signaling coordinator stopped");
    }
}
