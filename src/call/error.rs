//! Fehlertypen der Call-Schicht

use crate::database::DatabaseError;
use crate::media::MediaError;
use crate::signaling::SignalingError;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Fehler-Taxonomie für Anrufe
///
/// Setup-Fehler werden synchron an `place_call` zurückgegeben, Fehler
/// während eines laufenden Anrufs kommen als `CallEvent::Error`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// Kamera/Mikrofon nicht verfügbar oder keine Berechtigung
    #[error("Media acquisition failed: {0}")]
    MediaAcquisitionFailed(String),

    #[error("Already in a call")]
    AlreadyInCall,

    /// Offer wurde publiziert, aber der Peer hat nie geantwortet
    #[error("Signaling peer unreachable")]
    SignalingUnreachable,

    #[error("Connection lost")]
    ConnectionLost,

    #[error("Stale envelope for call {0}")]
    StaleEnvelope(String),

    #[error("Media engine error: {0}")]
    Media(String),

    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("Call record store error: {0}")]
    Store(String),

    /// Session wurde beendet bevor die Operation abgeschlossen war
    #[error("Call session closed")]
    SessionClosed,
}

impl From<MediaError> for CallError {
    fn from(e: MediaError) -> Self {
        match e {
            MediaError::AcquisitionFailed(msg) => CallError::MediaAcquisitionFailed(msg),
            other => CallError::Media(other.to_string()),
        }
    }
}

impl From<SignalingError> for CallError {
    fn from(e: SignalingError) -> Self {
        CallError::Signaling(e.to_string())
    }
}

impl From<DatabaseError> for CallError {
    fn from(e: DatabaseError) -> Self {
        CallError::Store(e.to_string())
    }
}
