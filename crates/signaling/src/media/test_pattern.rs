//! Synthetic gradient source
//!
//! Renders a single I420 gradient frame up front and re-broadcasts it at the
//! configured rate from a dedicated thread.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::{FrameFormat, FrameSink, SinkId, VideoFrame, VideoSource};
use crate::config::VideoSourceConfig;
use crate::{Error, Result};

struct Shared {
    running: AtomicBool,
    frames: AtomicU64,
    next_sink_id: AtomicU64,
    sinks: RwLock<Vec<(SinkId, Arc<dyn FrameSink>)>>,
}

/// Gradient test pattern (`Y = (x + y) % 256`, neutral chroma)
pub struct TestPatternSource {
    config: VideoSourceConfig,
    frame: Bytes,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TestPatternSource {
    pub fn new(config: VideoSourceConfig) -> Self {
        Self {
            frame: render_gradient(config.width, config.height),
            config,
            shared: Arc::new(Shared {
                running: AtomicBool::new(false),
                frames: AtomicU64::new(0),
                next_sink_id: AtomicU64::new(1),
                sinks: RwLock::new(Vec::new()),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Size of one I420 frame in bytes
    pub fn frame_size(&self) -> usize {
        self.frame.len()
    }
}

/// Render a full I420 frame: luma gradient, chroma planes at 128
pub fn render_gradient(width: u32, height: u32) -> Bytes {
    let (w, h) = (width as usize, height as usize);
    let chroma = (w / 2) * (h / 2);
    let mut buf = Vec::with_capacity(w * h + 2 * chroma);
    for y in 0..h {
        buf.extend((0..w).map(|x| ((x + y) % 256) as u8));
    }
    buf.resize(w * h + 2 * chroma, 128);
    Bytes::from(buf)
}

impl VideoSource for TestPatternSource {
    fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock();
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let shared = Arc::clone(&self.shared);
        let frame = self.frame.clone();
        let config = self.config;
        let handle = std::thread::Builder::new()
            .name("frame-source".to_string())
            .spawn(move || run_frame_loop(shared, frame, config))
            .map_err(|e| {
                self.shared.running.store(false, Ordering::SeqCst);
                Error::VideoSourceError(format!("Failed to spawn frame thread: {}", e))
            })?;
        *worker = Some(handle);

        info!(
            width = self.config.width,
            height = self.config.height,
            fps = self.config.fps,
            "Test pattern source started"
        );
        Ok(())
    }

    fn stop(&self) {
        let handle = {
            let mut worker = self.worker.lock();
            self.shared.running.store(false, Ordering::SeqCst);
            worker.take()
        };
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("Frame thread panicked");
            }
            info!(
                frames = self.frames_generated(),
                "Test pattern source stopped"
            );
        }
    }

    fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    fn add_sink(&self, sink: Arc<dyn FrameSink>) -> SinkId {
        let id = self.shared.next_sink_id.fetch_add(1, Ordering::Relaxed);
        self.shared.sinks.write().push((id, sink));
        debug!(sink_id = id, "Frame sink added");
        id
    }

    fn remove_sink(&self, id: SinkId) -> bool {
        let mut sinks = self.shared.sinks.write();
        let before = sinks.len();
        sinks.retain(|(sink_id, _)| *sink_id != id);
        before != sinks.len()
    }

    fn sink_count(&self) -> usize {
        self.shared.sinks.read().len()
    }

    fn frames_generated(&self) -> u64 {
        self.shared.frames.load(Ordering::Relaxed)
    }

    fn format(&self) -> VideoSourceConfig {
        self.config
    }
}

impl Drop for TestPatternSource {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_frame_loop(shared: Arc<Shared>, frame: Bytes, config: VideoSourceConfig) {
    let interval = config.frame_interval();
    let started = Instant::now();
    let mut next_deadline = started;
    let mut sequence = 0u64;

    while shared.running.load(Ordering::SeqCst) {
        let video_frame = VideoFrame {
            data: frame.clone(),
            format: FrameFormat::I420,
            width: config.width,
            height: config.height,
            sequence,
            timestamp: started.elapsed(),
            duration: interval,
            keyframe: true,
        };

        // Snapshot so sinks can (de)register from inside on_frame
        let sinks: Vec<Arc<dyn FrameSink>> = shared
            .sinks
            .read()
            .iter()
            .map(|(_, sink)| Arc::clone(sink))
            .collect();
        for sink in &sinks {
            sink.on_frame(&video_frame);
        }

        sequence += 1;
        shared.frames.fetch_add(1, Ordering::Relaxed);

        next_deadline += interval;
        let now = Instant::now();
        if next_deadline > now {
            std::thread::sleep(next_deadline - now);
        } else {
            // Fell behind; don't burst to catch up
            next_deadline = now;
        }
    }
}
