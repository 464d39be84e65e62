//! SignalBus - Transport-Abstraktion für Signaling
//!
//! Reiner Pub/Sub-Transport nach Topic. Keine Garantie für Reihenfolge
//! oder exactly-once; die CallSession kommt mit beidem klar.

use super::messages::{SignalEnvelope, Topic};
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum SignalingError {
    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to signaling server")]
    NotConnected,

    #[error("Failed to send message: {0}")]
    SendFailed(String),

    #[error("Server error: {code} - {message}")]
    ServerError { code: i32, message: String },
}

/// Empfangsseite eines Abos
pub type EnvelopeSink = mpsc::UnboundedSender<SignalEnvelope>;

// ============================================================================
// SIGNAL BUS
// ============================================================================

#[async_trait]
pub trait SignalBus: Send + Sync {
    /// Leitet alle Envelopes auf `topic` in `sink` weiter
    ///
    /// Ein erneutes Abo desselben Topics ersetzt das vorherige.
    async fn subscribe(&self, topic: Topic, sink: EnvelopeSink) -> Result<(), SignalingError>;

    /// Veröffentlicht den Envelope auf `envelope.topic()`
    ///
    /// Darf nicht fehlschlagen, nur weil niemand zuhört.
    async fn publish(&self, envelope: &SignalEnvelope) -> Result<(), SignalingError>;

    /// Beendet das Abo; unbekannte Topics sind ein No-op
    async fn unsubscribe(&self, topic: &Topic) -> Result<(), SignalingError>;
}
