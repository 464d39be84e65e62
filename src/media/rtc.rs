//! WebRTC Media Engine
//!
//! `MediaEngine`-Implementierung auf Basis von webrtc-rs. Pro Anruf wird
//! eine eigene Peer Connection gebaut; ihre Callbacks landen als
//! `MediaEvent` im Channel der Session.

use super::capture::{AudioCapture, SAMPLE_RATE};
use super::engine::*;
use crate::call::CallId;
use crate::config::TurnServer;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine as RtcMediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

// ============================================================================
// ICE SERVER CONFIGURATION
// ============================================================================

/// Standard STUN Server
pub fn default_ice_servers() -> Vec<RTCIceServer> {
    vec![RTCIceServer {
        urls: vec![
            "stun:stun.l.google.com:19302".to_string(),
            "stun:stun1.l.google.com:19302".to_string(),
            "stun:stun2.l.google.com:19302".to_string(),
        ],
        ..Default::default()
    }]
}

// ============================================================================
// FACTORY
// ============================================================================

/// Baut pro Anruf eine `WebRtcMediaEngine`
#[derive(Debug, Clone)]
pub struct WebRtcEngineFactory {
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcEngineFactory {
    pub fn new() -> Self {
        Self {
            ice_servers: default_ice_servers(),
        }
    }

    /// Ergänzt einen TURN-Server für Verbindungen hinter symmetrischem NAT
    pub fn with_turn_server(mut self, turn: &TurnServer) -> Self {
        self.ice_servers.push(RTCIceServer {
            urls: vec![turn.url.clone()],
            username: turn.username.clone(),
            credential: turn.credential.clone(),
            ..Default::default()
        });
        self
    }

    async fn create_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, MediaError> {
        let mut media_engine = RtcMediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| MediaError::Engine(e.to_string()))?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| MediaError::Engine(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let pc = api
            .new_peer_connection(config)
            .await
            .map_err(|e| MediaError::Engine(e.to_string()))?;

        Ok(Arc::new(pc))
    }
}

impl Default for WebRtcEngineFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaEngineFactory for WebRtcEngineFactory {
    async fn connect(&self, call_id: CallId) -> Result<MediaConnection, MediaError> {
        let pc = self.create_peer_connection().await?;
        let (event_tx, events) = mpsc::unbounded_channel();
        register_handlers(&pc, event_tx, call_id);

        tracing::debug!("Peer connection created for call {}", call_id);
        Ok(MediaConnection {
            engine: Arc::new(WebRtcMediaEngine {
                call_id,
                pc,
                closed: AtomicBool::new(false),
            }),
            events,
        })
    }
}

/// Leitet die Callbacks der Peer Connection in den Event-Channel
fn register_handlers(
    pc: &Arc<RTCPeerConnection>,
    event_tx: mpsc::UnboundedSender<MediaEvent>,
    call_id: CallId,
) {
    let tx = event_tx.clone();
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        tracing::info!("Call {}: peer connection state {:?}", call_id, s);
        let mapped = match s {
            RTCPeerConnectionState::New => Some(ConnectionState::New),
            RTCPeerConnectionState::Connecting => Some(ConnectionState::Connecting),
            RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
            RTCPeerConnectionState::Disconnected => Some(ConnectionState::Disconnected),
            RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
            RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
            _ => None,
        };
        if let Some(state) = mapped {
            let _ = tx.send(MediaEvent::ConnectionState(state));
        }
        Box::pin(async {})
    }));

    let tx = event_tx.clone();
    pc.on_ice_candidate(Box::new(move |candidate| {
        if let Some(c) = candidate {
            match c.to_json().map(|init| serde_json::to_string(&init)) {
                Ok(Ok(json)) => {
                    let _ = tx.send(MediaEvent::IceCandidate(json));
                }
                Ok(Err(e)) => tracing::warn!("Failed to serialize ICE candidate: {}", e),
                Err(e) => tracing::warn!("Failed to convert ICE candidate: {}", e),
            }
        }
        Box::pin(async {})
    }));

    let tx = event_tx;
    pc.on_track(Box::new(move |track, _, _| {
        let kind = match track.kind() {
            RTPCodecType::Video => TrackKind::Video,
            _ => TrackKind::Audio,
        };
        let remote = RemoteTrack {
            id: track.id(),
            kind,
        };
        tracing::info!("Call {}: received remote {:?} track", call_id, kind);
        let _ = tx.send(MediaEvent::RemoteTrack(remote));
        Box::pin(async {})
    }));
}

// ============================================================================
// ENGINE
// ============================================================================

/// Peer Connection eines Anrufs
pub struct WebRtcMediaEngine {
    call_id: CallId,
    pc: Arc<RTCPeerConnection>,
    closed: AtomicBool,
}

impl WebRtcMediaEngine {
    async fn add_track(&self, kind: TrackKind) -> Result<(), MediaError> {
        let capability = match kind {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: SAMPLE_RATE,
                channels: 1,
                ..Default::default()
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: 90000,
                ..Default::default()
            },
        };
        let track_id = match kind {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        };

        let track = Arc::new(TrackLocalStaticRTP::new(
            capability,
            track_id.to_string(),
            format!("call-{}", self.call_id),
        ));

        self.pc
            .add_track(track as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| MediaError::Engine(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl MediaEngine for WebRtcMediaEngine {
    async fn acquire_local_media(&self, config: &MediaConfig) -> Result<MediaHandle, MediaError> {
        let capture = if config.audio {
            let capture = AudioCapture::start()
                .map_err(|e| MediaError::AcquisitionFailed(e.to_string()))?;
            Some(capture)
        } else {
            None
        };

        let mut tracks = Vec::new();
        if config.audio {
            tracks.push(TrackKind::Audio);
        }
        // Kamera-Frames liefert die App-Schicht; hier wird nur der Track verhandelt
        if config.video {
            tracks.push(TrackKind::Video);
        }

        for kind in &tracks {
            if let Err(e) = self.add_track(*kind).await {
                if let Some(c) = &capture {
                    c.stop();
                }
                return Err(e);
            }
        }

        Ok(Arc::new(WebRtcLocalMedia {
            id: format!("local-{}", self.call_id),
            tracks,
            capture,
            muted: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }))
    }

    async fn create_offer(&self) -> Result<String, MediaError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| MediaError::Engine(e.to_string()))?;

        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(|e| MediaError::Engine(e.to_string()))?;

        Ok(offer.sdp)
    }

    async fn create_answer(&self, remote_sdp: &str) -> Result<String, MediaError> {
        let offer = RTCSessionDescription::offer(remote_sdp.to_string())
            .map_err(|e| MediaError::InvalidSdp(e.to_string()))?;

        self.pc
            .set_remote_description(offer)
            .await
            .map_err(|e| MediaError::InvalidSdp(e.to_string()))?;

        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| MediaError::Engine(e.to_string()))?;

        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(|e| MediaError::Engine(e.to_string()))?;

        Ok(answer.sdp)
    }

    async fn set_remote_description(&self, sdp: &str) -> Result<(), MediaError> {
        let answer = RTCSessionDescription::answer(sdp.to_string())
            .map_err(|e| MediaError::InvalidSdp(e.to_string()))?;

        self.pc
            .set_remote_description(answer)
            .await
            .map_err(|e| MediaError::InvalidSdp(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: &str) -> Result<(), MediaError> {
        let candidate: RTCIceCandidateInit = serde_json::from_str(candidate)
            .map_err(|e| MediaError::InvalidCandidate(e.to_string()))?;

        self.pc
            .add_ice_candidate(candidate)
            .await
            .map_err(|e| MediaError::Engine(e.to_string()))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.pc.close().await {
            tracing::warn!("Call {}: failed to close peer connection: {}", self.call_id, e);
        }
    }
}

// ============================================================================
// LOCAL MEDIA
// ============================================================================

/// Lokale Medien einer WebRTC-Verbindung
struct WebRtcLocalMedia {
    id: String,
    tracks: Vec<TrackKind>,
    capture: Option<AudioCapture>,
    muted: AtomicBool,
    stopped: AtomicBool,
}

impl LocalMedia for WebRtcLocalMedia {
    fn id(&self) -> &str {
        &self.id
    }

    fn tracks(&self) -> Vec<TrackKind> {
        self.tracks.clone()
    }

    fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::SeqCst);
        if let Some(capture) = &self.capture {
            capture.set_muted(muted);
        }
    }

    fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(capture) = &self.capture {
            capture.stop();
        }
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for WebRtcLocalMedia {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcLocalMedia")
            .field("id", &self.id)
            .field("tracks", &self.tracks)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
