//! Media Module - Anbindung der Media Engine
//!
//! Dieses Modul verwaltet:
//! - Die Schnittstelle zur Media Engine (`MediaEngine`, `MediaEvent`)
//! - Die WebRTC-Implementierung (webrtc-rs Peer Connections)
//! - Mikrofon-Capture über cpal

mod capture;
mod engine;
mod rtc;

pub use capture::{AudioCapture, AudioError, SAMPLE_RATE};
pub use engine::{
    ConnectionState, LocalMedia, MediaConfig, MediaConnection, MediaEngine, MediaEngineFactory,
    MediaError, MediaEvent, MediaHandle, RemoteTrack, TrackKind,
};
pub use rtc::{default_ice_servers, WebRtcEngineFactory, WebRtcMediaEngine};
