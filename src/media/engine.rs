//! Media Engine Schnittstelle
//!
//! Die CallSession behandelt die Media Engine als Black Box: lokale
//! Medien holen, SDP erzeugen/anwenden, ICE Candidates einspeisen.
//! Rückmeldungen der Engine (entdeckte Candidates, Verbindungsstatus,
//! Remote-Tracks) kommen als `MediaEvent` über einen Channel.

use crate::call::CallId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// Kamera/Mikrofon nicht verfügbar oder verweigert
    #[error("Local media acquisition failed: {0}")]
    AcquisitionFailed(String),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    #[error("Invalid ICE candidate: {0}")]
    InvalidCandidate(String),

    #[error("Peer connection closed")]
    Closed,
}

// ============================================================================
// TYPES
// ============================================================================

/// Verbindungsstatus wie von der Engine gemeldet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackKind {
    Audio,
    Video,
}

/// Welche lokalen Medien ein Anruf braucht
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConfig {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }
}

/// Lokaler Medienstream (Mikrofon, ggf. Kamera)
///
/// `stop()` muss idempotent sein.
pub trait LocalMedia: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;
    fn tracks(&self) -> Vec<TrackKind>;
    fn set_muted(&self, muted: bool);
    fn is_muted(&self) -> bool;
    fn stop(&self);
    fn is_stopped(&self) -> bool;
}

/// Geteilter Handle auf die lokalen Medien
pub type MediaHandle = Arc<dyn LocalMedia>;

/// Vom Peer empfangener Track
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
}

/// Asynchrone Rückmeldungen der Engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEvent {
    /// Lokal entdeckter Candidate, serialisiert für das Signaling
    IceCandidate(String),
    ConnectionState(ConnectionState),
    RemoteTrack(RemoteTrack),
}

// ============================================================================
// ENGINE TRAITS
// ============================================================================

/// Eine Peer Connection für genau einen Anruf
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Holt lokale Medien und hängt sie an die Verbindung
    async fn acquire_local_media(&self, config: &MediaConfig) -> Result<MediaHandle, MediaError>;

    /// Erzeugt das Offer und setzt es als Local Description
    async fn create_offer(&self) -> Result<String, MediaError>;

    /// Setzt das Remote-Offer, erzeugt das Answer und setzt es lokal
    async fn create_answer(&self, remote_sdp: &str) -> Result<String, MediaError>;

    /// Setzt das Remote-Answer
    async fn set_remote_description(&self, sdp: &str) -> Result<(), MediaError>;

    async fn add_ice_candidate(&self, candidate: &str) -> Result<(), MediaError>;

    /// Schließt die Verbindung; mehrfacher Aufruf ist erlaubt
    async fn close(&self);
}

/// Engine zusammen mit ihrem Event-Channel
pub struct MediaConnection {
    pub engine: Arc<dyn MediaEngine>,
    pub events: mpsc::UnboundedReceiver<MediaEvent>,
}

impl fmt::Debug for MediaConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaConnection").finish_non_exhaustive()
    }
}

/// Erzeugt pro Anruf eine neue Peer Connection
#[async_trait]
pub trait MediaEngineFactory: Send + Sync {
    async fn connect(&self, call_id: CallId) -> Result<MediaConnection, MediaError>;
}
