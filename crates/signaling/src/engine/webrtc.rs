//! webrtc-rs backed engine
//!
//! Each session gets one `RTCPeerConnection` with a single outbound VP8
//! track fed from the shared video source. Completions are delivered from
//! tokio tasks. Remote candidates go through a per-connection queue drained
//! by one task, so they reach the peer connection in submission order.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use super::{
    Completion, ConnectionObserver, EngineConnection, EngineFailure, EngineOperation,
    IceCandidate, PeerState, RtcEngine,
};
use crate::config::SignalingConfig;
use crate::media::{FrameFormat, FrameSink, SinkId, VideoFrame, VideoSource};
use crate::session::SessionId;
use crate::{Error, Result};

/// Frames queued per connection before the sink starts dropping
const FRAME_QUEUE_DEPTH: usize = 8;

/// Engine producing webrtc-rs peer connections
pub struct WebRtcEngine {
    api: API,
    ice_servers: Vec<RTCIceServer>,
    video_source: Option<Arc<dyn VideoSource>>,
    runtime: Handle,
    wait_for_ice_gathering: bool,
    ice_gathering_timeout: Duration,
}

impl WebRtcEngine {
    /// Build the engine. Must be called from within a tokio runtime.
    pub fn new(config: &SignalingConfig, video_source: Option<Arc<dyn VideoSource>>) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::EngineError(format!("Failed to register codecs: {}", e)))?;

        let interceptor_registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| Error::EngineError(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        let ice_servers = config
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .chain(config.turn_servers.iter().map(|turn| RTCIceServer {
                urls: vec![turn.url.clone()],
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            }))
            .collect();

        let runtime = Handle::try_current()
            .map_err(|e| Error::EngineError(format!("No tokio runtime available: {}", e)))?;

        Ok(Self {
            api,
            ice_servers,
            video_source,
            runtime,
            wait_for_ice_gathering: config.wait_for_ice_gathering,
            ice_gathering_timeout: config.ice_gathering_timeout(),
        })
    }
}

#[async_trait]
impl RtcEngine for WebRtcEngine {
    #[instrument(skip_all, fields(session_id = %session_id))]
    async fn create_connection(
        &self,
        session_id: &SessionId,
        observer: Arc<dyn ConnectionObserver>,
    ) -> Result<Arc<dyn EngineConnection>> {
        let rtc_config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        let peer_connection = Arc::new(
            self.api
                .new_peer_connection(rtc_config)
                .await
                .map_err(|e| Error::EngineError(format!("Failed to create peer connection: {}", e)))?,
        );

        let state_observer = Arc::clone(&observer);
        peer_connection.on_peer_connection_state_change(Box::new(
            move |s: RTCPeerConnectionState| {
                let observer = Arc::clone(&state_observer);
                Box::pin(async move {
                    if let Some(state) = peer_state(s) {
                        observer.on_peer_state_change(state);
                    }
                })
            },
        ));

        let candidate_observer = Arc::clone(&observer);
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let observer = Arc::clone(&candidate_observer);
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => observer.on_local_candidate(&IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                    }),
                    Err(e) => debug!("Failed to serialize local candidate: {}", e),
                }
            })
        }));

        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
            "video".to_owned(),
            "streamcast".to_owned(),
        ));
        let rtp_sender = peer_connection
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| Error::EngineError(format!("Failed to add video track: {}", e)))?;

        // RTCP must be read for interceptors (NACK, reports) to run
        self.runtime.spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while rtp_sender.read(&mut rtcp_buf).await.is_ok() {}
        });

        let throughput = Arc::new(Throughput::default());
        let sink = self.video_source.as_ref().map(|source| {
            let (frame_tx, frame_rx) = mpsc::channel(FRAME_QUEUE_DEPTH);
            self.runtime
                .spawn(pump_frames(session_id.clone(), Arc::clone(&track), frame_rx));
            let sink_id = source.add_sink(Arc::new(TrackSink {
                frames: frame_tx,
                throughput: Arc::clone(&throughput),
            }));
            (Arc::clone(source), sink_id)
        });

        let (candidate_tx, candidate_rx) = mpsc::unbounded_channel();
        self.runtime.spawn(apply_candidates(
            session_id.clone(),
            Arc::clone(&peer_connection),
            candidate_rx,
        ));

        info!("Peer connection created");
        Ok(Arc::new(WebRtcConnection {
            session_id: session_id.clone(),
            peer_connection,
            runtime: self.runtime.clone(),
            candidates: candidate_tx,
            sink,
            throughput,
            wait_for_ice_gathering: self.wait_for_ice_gathering,
            ice_gathering_timeout: self.ice_gathering_timeout,
            closed: AtomicBool::new(false),
        }))
    }
}

fn peer_state(state: RTCPeerConnectionState) -> Option<PeerState> {
    match state {
        RTCPeerConnectionState::New => Some(PeerState::New),
        RTCPeerConnectionState::Connecting => Some(PeerState::Connecting),
        RTCPeerConnectionState::Connected => Some(PeerState::Connected),
        RTCPeerConnectionState::Disconnected => Some(PeerState::Disconnected),
        RTCPeerConnectionState::Failed => Some(PeerState::Failed),
        RTCPeerConnectionState::Closed => Some(PeerState::Closed),
        _ => None,
    }
}

#[derive(Default)]
struct Throughput {
    frames: AtomicU64,
    bytes: AtomicU64,
    dropped: AtomicU64,
}

/// Bridges the source thread into the async track writer
struct TrackSink {
    frames: mpsc::Sender<VideoFrame>,
    throughput: Arc<Throughput>,
}

impl FrameSink for TrackSink {
    fn on_frame(&self, frame: &VideoFrame) {
        self.throughput.frames.fetch_add(1, Ordering::Relaxed);
        self.throughput
            .bytes
            .fetch_add(frame.data.len() as u64, Ordering::Relaxed);

        // Only encoded frames can be packetized; raw frames are just counted
        if frame.format != FrameFormat::Vp8 {
            return;
        }
        if self.frames.try_send(frame.clone()).is_err() {
            self.throughput.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

async fn pump_frames(
    session_id: SessionId,
    track: Arc<TrackLocalStaticSample>,
    mut frames: mpsc::Receiver<VideoFrame>,
) {
    while let Some(frame) = frames.recv().await {
        let sample = Sample {
            data: frame.data,
            duration: frame.duration,
            ..Default::default()
        };
        if let Err(e) = track.write_sample(&sample).await {
            debug!(session_id = %session_id, "Failed to write video sample: {}", e);
        }
    }
}

async fn apply_candidates(
    session_id: SessionId,
    peer_connection: Arc<RTCPeerConnection>,
    mut candidates: mpsc::UnboundedReceiver<RTCIceCandidateInit>,
) {
    while let Some(candidate) = candidates.recv().await {
        if let Err(e) = peer_connection.add_ice_candidate(candidate).await {
            warn!(session_id = %session_id, "Failed to add ICE candidate: {}", e);
        }
    }
}

/// One webrtc-rs peer connection
struct WebRtcConnection {
    session_id: SessionId,
    peer_connection: Arc<RTCPeerConnection>,
    runtime: Handle,
    candidates: mpsc::UnboundedSender<RTCIceCandidateInit>,
    sink: Option<(Arc<dyn VideoSource>, SinkId)>,
    throughput: Arc<Throughput>,
    wait_for_ice_gathering: bool,
    ice_gathering_timeout: Duration,
    closed: AtomicBool,
}

impl EngineConnection for WebRtcConnection {
    fn set_remote_description(&self, sdp: String, on_done: Completion<()>) {
        let peer_connection = Arc::clone(&self.peer_connection);
        self.runtime.spawn(async move {
            let result = match RTCSessionDescription::offer(sdp) {
                Ok(offer) => peer_connection
                    .set_remote_description(offer)
                    .await
                    .map_err(|e| e.to_string()),
                Err(e) => Err(format!("invalid offer: {}", e)),
            };
            on_done(result.map_err(|message| {
                EngineFailure::new(EngineOperation::SetRemoteDescription, message)
            }));
        });
    }

    fn create_answer(&self, on_done: Completion<String>) {
        let peer_connection = Arc::clone(&self.peer_connection);
        self.runtime.spawn(async move {
            let result = peer_connection
                .create_answer(None)
                .await
                .map(|answer| answer.sdp)
                .map_err(|e| EngineFailure::new(EngineOperation::CreateAnswer, e.to_string()));
            on_done(result);
        });
    }

    fn set_local_description(&self, sdp: String, on_done: Completion<String>) {
        let peer_connection = Arc::clone(&self.peer_connection);
        let wait_for_gathering = self.wait_for_ice_gathering;
        let gathering_timeout = self.ice_gathering_timeout;
        let session_id = self.session_id.clone();

        self.runtime.spawn(async move {
            let failure =
                |message: String| EngineFailure::new(EngineOperation::SetLocalDescription, message);

            let answer = match RTCSessionDescription::answer(sdp) {
                Ok(answer) => answer,
                Err(e) => return on_done(Err(failure(format!("invalid answer: {}", e)))),
            };

            let mut gathering_complete = peer_connection.gathering_complete_promise().await;
            if let Err(e) = peer_connection.set_local_description(answer).await {
                return on_done(Err(failure(e.to_string())));
            }

            if wait_for_gathering {
                let started = Instant::now();
                if tokio::time::timeout(gathering_timeout, gathering_complete.recv())
                    .await
                    .is_err()
                {
                    debug!(session_id = %session_id, "ICE gathering still running, answering with partial candidates");
                } else {
                    debug!(
                        session_id = %session_id,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "ICE gathering complete"
                    );
                }
            }

            let result = match peer_connection.local_description().await {
                Some(local) => Ok(local.sdp),
                None => Err(failure("local description missing after set".to_string())),
            };
            on_done(result);
        });
    }

    fn add_ice_candidate(&self, candidate: &IceCandidate) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        self.candidates.send(init).is_ok()
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some((source, sink_id)) = &self.sink {
            source.remove_sink(*sink_id);
        }

        info!(
            session_id = %self.session_id,
            frames = self.throughput.frames.load(Ordering::Relaxed),
            bytes = self.throughput.bytes.load(Ordering::Relaxed),
            dropped = self.throughput.dropped.load(Ordering::Relaxed),
            "Closing peer connection"
        );

        let peer_connection = Arc::clone(&self.peer_connection);
        let session_id = self.session_id.clone();
        self.runtime.spawn(async move {
            if let Err(e) = peer_connection.close().await {
                warn!(session_id = %session_id, "Error closing peer connection: {}", e);
            }
        });
    }
}

impl Drop for WebRtcConnection {
    fn drop(&mut self) {
        self.close();
    }
}
