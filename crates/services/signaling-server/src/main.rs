//! Signaling server binary entry point
//!
//! Serves the browser viewer and the HTTP signaling endpoint, and streams a
//! synthetic test pattern to every connected peer over WebRTC.
//!
//! # Usage
//!
//! ```bash
//! # Defaults: 0.0.0.0:9090, 1280x720 @ 30 fps
//! cargo run -p streamcast-server
//!
//! # Custom video format and port
//! cargo run -p streamcast-server -- --width 1920 --height 1080 --fps 60 \
//!   --bind-address 0.0.0.0:8080
//!
//! # Start from a JSON config file, override one field
//! STREAMCAST_ANSWER_TIMEOUT_MS=5000 cargo run -p streamcast-server -- \
//!   --config ./signaling.json
//! ```

mod server;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use streamcast_signaling::{
    Coordinator, SignalingConfig, TestPatternSource, VideoSource, WebRtcEngine,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Streamcast Signaling Server
///
/// Negotiates WebRTC sessions over HTTP and streams a test pattern to each
/// connected viewer.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON configuration file; flags below override its fields
    #[arg(long, env = "STREAMCAST_CONFIG")]
    config: Option<PathBuf>,

    /// HTTP bind address
    #[arg(long, env = "STREAMCAST_BIND_ADDRESS")]
    bind_address: Option<String>,

    /// Video width in pixels
    #[arg(long, env = "STREAMCAST_WIDTH")]
    width: Option<u32>,

    /// Video height in pixels
    #[arg(long, env = "STREAMCAST_HEIGHT")]
    height: Option<u32>,

    /// Video frames per second
    #[arg(long, env = "STREAMCAST_FPS")]
    fps: Option<u32>,

    /// STUN servers (comma-separated)
    #[arg(long, value_delimiter = ',', env = "STREAMCAST_STUN_SERVERS")]
    stun_servers: Option<Vec<String>>,

    /// How long an offer request waits for the answer before returning `processing`
    #[arg(long, env = "STREAMCAST_ANSWER_TIMEOUT_MS")]
    answer_timeout_ms: Option<u64>,

    /// Maximum concurrent sessions
    #[arg(long, env = "STREAMCAST_MAX_SESSIONS")]
    max_sessions: Option<usize>,

    /// Seconds without signaling activity before an unconnected session is reaped (0 disables)
    #[arg(long, env = "STREAMCAST_SESSION_IDLE_TIMEOUT_SECS")]
    session_idle_timeout_secs: Option<u64>,

    /// Seconds between periodic stats log lines (0 disables)
    #[arg(long, env = "STREAMCAST_STATS_INTERVAL_SECS")]
    stats_interval_secs: Option<u64>,

    /// Emit logs as JSON
    #[arg(long, default_value_t = false, env = "STREAMCAST_JSON_LOGS")]
    json_logs: bool,
}

impl Args {
    fn into_config(self) -> anyhow::Result<SignalingConfig> {
        let mut config = match &self.config {
            Some(path) => SignalingConfig::from_json_file(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => SignalingConfig::default(),
        };

        if let Some(bind_address) = self.bind_address {
            config.bind_address = bind_address;
        }
        if let Some(width) = self.width {
            config.video.width = width;
        }
        if let Some(height) = self.height {
            config.video.height = height;
        }
        if let Some(fps) = self.fps {
            config.video.fps = fps;
        }
        if let Some(stun_servers) = self.stun_servers {
            config.stun_servers = stun_servers;
        }
        if let Some(answer_timeout_ms) = self.answer_timeout_ms {
            config.answer_timeout_ms = answer_timeout_ms;
        }
        if let Some(max_sessions) = self.max_sessions {
            config.max_sessions = max_sessions;
        }
        if let Some(secs) = self.session_idle_timeout_secs {
            config.session_idle_timeout_secs = secs;
        }
        if let Some(secs) = self.stats_interval_secs {
            config.stats_interval_secs = secs;
        }

        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    // Set up Ctrl+C handler at the very start
    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let shutdown_flag_handler = Arc::clone(&shutdown_flag);
    ctrlc::set_handler(move || {
        if shutdown_flag_handler.swap(true, Ordering::SeqCst) {
            eprintln!("Shutdown already in progress, forcing exit");
            std::process::exit(1);
        }
        eprintln!("\nCtrl+C received, shutting down...");
    })
    .context("Failed to set Ctrl+C handler")?;

    let config = args.into_config()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get())
        .thread_name("signaling-worker")
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(async_main(config, shutdown_flag))
}

async fn async_main(config: SignalingConfig, shutdown_flag: Arc<AtomicBool>) -> anyhow::Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        bind_address = %config.bind_address,
        width = config.video.width,
        height = config.video.height,
        fps = config.video.fps,
        expected_bitrate_mbps = config.video.expected_bitrate_mbps(),
        "Streamcast signaling server starting"
    );

    let addr: std::net::SocketAddr = config
        .bind_address
        .parse()
        .with_context(|| format!("Invalid bind address {}", config.bind_address))?;

    let source: Arc<dyn VideoSource> = Arc::new(TestPatternSource::new(config.video));
    let engine = WebRtcEngine::new(&config, Some(Arc::clone(&source)))
        .context("Failed to initialize WebRTC engine")?;
    let coordinator = Arc::new(Coordinator::new(config, Arc::new(engine), Some(source))?);
    coordinator.start()?;

    info!("Open http://{} in a browser to view the stream", addr);

    let shutdown_future = async move {
        while !shutdown_flag.load(Ordering::SeqCst) {
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
        }
        info!("Shutdown signal received, stopping HTTP server...");
    };

    let served = server::serve(Arc::clone(&coordinator), addr, shutdown_future).await;

    coordinator.shutdown().await;
    served?;
    info!("Signaling server shut down gracefully");
    Ok(())
}

fn init_tracing(json: bool) {
    // RUST_LOG wins; default to info
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init();
    }
}
