//! Grundtypen für Anrufe
//!
//! IDs, Rollen und Zustände, die von Session, Manager, Signaling
//! und Datenbank gemeinsam verwendet werden.

use crate::call::CallError;
use crate::media::{MediaHandle, RemoteTrack};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// IDENTIFIERS
// ============================================================================

/// Eindeutige ID eines Anrufversuchs
///
/// Wird vom Anrufer beim Start erzeugt und dient als Routing-Key für
/// das Signaling und als Primary Key des Call Records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(Uuid);

impl CallId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for CallId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Benutzer-ID aus dem Backend (opak)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

// ============================================================================
// ROLE & STATE
// ============================================================================

/// Wer das Offer sendet und wer antwortet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Caller,
    Callee,
}

/// Wie ein Anruf geendet hat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalReason {
    /// Normal aufgelegt nachdem der Anruf aktiv war
    Ended,
    /// Abgebrochen durch Fehler oder Verbindungsverlust
    Failed,
    /// Beendet bevor der Anruf jemals aktiv war
    Missed,
}

/// Lebenszyklus einer CallSession
///
/// `Idle` existiert nicht als Wert: eine Session wird erst beim
/// Start bzw. beim ersten Offer erzeugt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum SessionState {
    /// Offer/Answer wird ausgehandelt
    Negotiating,
    /// Remote Description gesetzt, ICE läuft
    Connecting,
    /// Medienverbindung steht
    Active,
    /// Aufräumen läuft
    Ending,
    /// Endzustand, wird nie wieder verlassen
    Terminated(TerminalReason),
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Terminated(_))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Negotiating => "negotiating",
            SessionState::Connecting => "connecting",
            SessionState::Active => "active",
            SessionState::Ending => "ending",
            SessionState::Terminated(TerminalReason::Ended) => "ended",
            SessionState::Terminated(TerminalReason::Failed) => "failed",
            SessionState::Terminated(TerminalReason::Missed) => "missed",
        }
    }
}

// ============================================================================
// EVENTS
// ============================================================================

/// Events für die UI-Schicht, alle nach CallId adressiert
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// Neuer eingehender Anruf, Callee-Session wurde angelegt
    Incoming { call_id: CallId, from: UserId },
    StateChanged { call_id: CallId, state: SessionState },
    /// Lokale Medien sind verfügbar
    LocalMedia { call_id: CallId, media: MediaHandle },
    /// Remote-Track ist angekommen
    RemoteMedia { call_id: CallId, track: RemoteTrack },
    Error { call_id: CallId, error: CallError },
}

impl CallEvent {
    pub fn call_id(&self) -> CallId {
        match self {
            CallEvent::Incoming { call_id, .. }
            | CallEvent::StateChanged { call_id, .. }
            | CallEvent::LocalMedia { call_id, .. }
            | CallEvent::RemoteMedia { call_id, .. }
            | CallEvent::Error { call_id, .. } => *call_id,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_id_roundtrips_through_string() {
        let id = CallId::new();
        let parsed: CallId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_terminal_states() {
        assert!(!SessionState::Active.is_terminal());
        assert!(!SessionState::Ending.is_terminal());
        assert!(SessionState::Terminated(TerminalReason::Missed).is_terminal());
        assert_eq!(
            SessionState::Terminated(TerminalReason::Failed).as_str(),
            "failed"
        );
    }
}
