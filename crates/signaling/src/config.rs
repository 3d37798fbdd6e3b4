//! Configuration types for the signaling coordinator

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Default public STUN servers
pub const DEFAULT_STUN_SERVERS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// Main configuration for the signaling coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// HTTP bind address (default: 0.0.0.0:9090)
    pub bind_address: String,

    /// STUN server URLs handed to every engine connection
    pub stun_servers: Vec<String>,

    /// TURN server configurations (optional)
    pub turn_servers: Vec<TurnServerConfig>,

    /// How long an offer request waits for its answer before
    /// replying `processing` (default: 2000ms, range: 10-60000ms)
    pub answer_timeout_ms: u64,

    /// Maximum concurrently registered sessions (default: 64, range: 1-4096)
    pub max_sessions: usize,

    /// ICE candidates buffered per session before the remote
    /// description is set (default: 128)
    pub max_buffered_candidates: usize,

    /// Sessions without signaling activity for this long are reaped,
    /// unless their peer link is connected (default: 300s, 0 disables)
    pub session_idle_timeout_secs: u64,

    /// Reaper sweep interval (default: 30s)
    pub reap_interval_secs: u64,

    /// Periodic stats log interval (default: 5s, 0 disables)
    pub stats_interval_secs: u64,

    /// Hold the answer until ICE gathering completes so the SDP carries
    /// server candidates (default: true)
    pub wait_for_ice_gathering: bool,

    /// Upper bound on the ICE gathering wait (default: 2000ms)
    pub ice_gathering_timeout_ms: u64,

    /// Shared video source parameters
    pub video: VideoSourceConfig,
}

/// TURN server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnServerConfig {
    /// TURN server URL (turn: or turns:)
    pub url: String,

    /// Username for TURN authentication
    pub username: String,

    /// Credential for TURN authentication
    pub credential: String,
}

/// Video source parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoSourceConfig {
    /// Frame width in pixels (default: 1280, must be even)
    pub width: u32,

    /// Frame height in pixels (default: 720, must be even)
    pub height: u32,

    /// Frames per second (default: 30, range: 1-120)
    pub fps: u32,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:9090".to_string(),
            stun_servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            turn_servers: Vec::new(),
            answer_timeout_ms: 2000,
            max_sessions: 64,
            max_buffered_candidates: 128,
            session_idle_timeout_secs: 300,
            reap_interval_secs: 30,
            stats_interval_secs: 5,
            wait_for_ice_gathering: true,
            ice_gathering_timeout_ms: 2000,
            video: VideoSourceConfig::default(),
        }
    }
}

impl Default for VideoSourceConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            fps: 30,
        }
    }
}

impl VideoSourceConfig {
    /// Expected per-client bitrate in Mbps, assuming ~0.1 bits per pixel
    pub fn expected_bitrate_mbps(&self) -> f64 {
        f64::from(self.width) * f64::from(self.height) * f64::from(self.fps) * 0.1 / 1_000_000.0
    }

    /// Interval between two frames
    pub fn frame_interval(&self) -> Duration {
        Duration::from_micros(1_000_000 / u64::from(self.fps.max(1)))
    }
}

impl SignalingConfig {
    /// Load a configuration from a JSON file.
    ///
    /// Missing fields take their defaults. The result is validated.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let config: SignalingConfig = serde_json::from_str(&contents).map_err(|e| {
            Error::InvalidConfig(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `bind_address` is not a socket address
    /// - `stun_servers` is empty or contains a non-STUN URL
    /// - a TURN URL is not `turn:`/`turns:`
    /// - `answer_timeout_ms` is not in range 10-60000
    /// - `max_sessions` is not in range 1-4096
    /// - the video format has zero or odd dimensions, or fps outside 1-120
    pub fn validate(&self) -> Result<()> {
        if self.bind_address.parse::<std::net::SocketAddr>().is_err() {
            return Err(Error::InvalidConfig(format!(
                "bind_address must be a socket address, got {}",
                self.bind_address
            )));
        }

        if self.stun_servers.is_empty() {
            return Err(Error::InvalidConfig(
                "At least one STUN server is required".to_string(),
            ));
        }
        if let Some(bad) = self
            .stun_servers
            .iter()
            .find(|url| !url.starts_with("stun:") && !url.starts_with("stuns:"))
        {
            return Err(Error::InvalidConfig(format!(
                "STUN server must start with stun: or stuns:, got {}",
                bad
            )));
        }
        if let Some(bad) = self
            .turn_servers
            .iter()
            .find(|turn| !turn.url.starts_with("turn:") && !turn.url.starts_with("turns:"))
        {
            return Err(Error::InvalidConfig(format!(
                "TURN server must start with turn: or turns:, got {}",
                bad.url
            )));
        }

        if !(10..=60_000).contains(&self.answer_timeout_ms) {
            return Err(Error::InvalidConfig(format!(
                "answer_timeout_ms must be in range 10-60000, got {}",
                self.answer_timeout_ms
            )));
        }

        if self.max_sessions == 0 || self.max_sessions > 4096 {
            return Err(Error::InvalidConfig(format!(
                "max_sessions must be in range 1-4096, got {}",
                self.max_sessions
            )));
        }

        if self.max_buffered_candidates == 0 {
            return Err(Error::InvalidConfig(
                "max_buffered_candidates must be at least 1".to_string(),
            ));
        }

        if self.session_idle_timeout_secs > 0 && self.reap_interval_secs == 0 {
            return Err(Error::InvalidConfig(
                "reap_interval_secs must be non-zero when idle reaping is enabled".to_string(),
            ));
        }

        let video = &self.video;
        if video.width == 0 || video.height == 0 || video.width % 2 != 0 || video.height % 2 != 0 {
            return Err(Error::InvalidConfig(format!(
                "video dimensions must be even and non-zero, got {}x{}",
                video.width, video.height
            )));
        }
        if video.fps == 0 || video.fps > 120 {
            return Err(Error::InvalidConfig(format!(
                "video fps must be in range 1-120, got {}",
                video.fps
            )));
        }

        Ok(())
    }

    /// Answer wait deadline
    pub fn answer_timeout(&self) -> Duration {
        Duration::from_millis(self.answer_timeout_ms)
    }

    /// Idle timeout, `None` when reaping is disabled
    pub fn session_idle_timeout(&self) -> Option<Duration> {
        (self.session_idle_timeout_secs > 0)
            .then(|| Duration::from_secs(self.session_idle_timeout_secs))
    }

    /// Stats interval, `None` when periodic stats are disabled
    pub fn stats_interval(&self) -> Option<Duration> {
        (self.stats_interval_secs > 0).then(|| Duration::from_secs(self.stats_interval_secs))
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs.max(1))
    }

    pub fn ice_gathering_timeout(&self) -> Duration {
        Duration::from_millis(self.ice_gathering_timeout_ms)
    }

    /// Set the HTTP bind address
    pub fn with_bind_address(mut self, bind_address: impl Into<String>) -> Self {
        self.bind_address = bind_address.into();
        self
    }

    /// Replace the STUN server list
    pub fn with_stun_servers(mut self, stun_servers: Vec<String>) -> Self {
        self.stun_servers = stun_servers;
        self
    }

    /// Add TURN servers to this configuration
    pub fn with_turn_servers(mut self, turn_servers: Vec<TurnServerConfig>) -> Self {
        self.turn_servers = turn_servers;
        self
    }

    /// Set the answer wait deadline
    pub fn with_answer_timeout(mut self, timeout: Duration) -> Self {
        self.answer_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the registry capacity
    pub fn with_max_sessions(mut self, max_sessions: usize) -> Self {
        self.max_sessions = max_sessions;
        self
    }

    /// Set the per-session ICE buffer capacity
    pub fn with_max_buffered_candidates(mut self, max: usize) -> Self {
        self.max_buffered_candidates = max;
        self
    }

    /// Set the idle timeout in seconds (0 disables reaping)
    pub fn with_session_idle_timeout_secs(mut self, secs: u64) -> Self {
        self.session_idle_timeout_secs = secs;
        self
    }

    /// Set the video format
    pub fn with_video(mut self, width: u32, height: u32, fps: u32) -> Self {
        self.video = VideoSourceConfig { width, height, fps };
        self
    }
}
