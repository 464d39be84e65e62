//! Message Types für das Signaling
//!
//! `SignalEnvelope` ist die Einheit, die zwischen den beiden Geräten eines
//! Anrufs ausgetauscht wird. Die Frames darunter sind das Protokoll zum
//! WebSocket-Relay, das die Envelopes nach Topic verteilt.

use crate::call::{CallId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// SIGNAL ENVELOPE
// ============================================================================

/// Art des Envelopes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
    EndCall,
}

/// Signaling-Nachricht zwischen zwei Teilnehmern
///
/// `payload` ist für den Transport opak: SDP bei Offer/Answer, der
/// serialisierte Candidate bei IceCandidate, leer bei EndCall.
/// Zustellung ist at-least-once, Empfänger müssen Duplikate tolerieren.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalEnvelope {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    pub from_user_id: UserId,
    pub to_user_id: UserId,
    pub call_id: CallId,
    #[serde(default)]
    pub payload: String,
    pub created_at: DateTime<Utc>,
}

impl SignalEnvelope {
    pub fn new(
        kind: SignalKind,
        call_id: CallId,
        from_user_id: UserId,
        to_user_id: UserId,
        payload: String,
    ) -> Self {
        Self {
            kind,
            from_user_id,
            to_user_id,
            call_id,
            payload,
            created_at: Utc::now(),
        }
    }

    pub fn offer(call_id: CallId, from: UserId, to: UserId, sdp: String) -> Self {
        Self::new(SignalKind::Offer, call_id, from, to, sdp)
    }

    pub fn answer(call_id: CallId, from: UserId, to: UserId, sdp: String) -> Self {
        Self::new(SignalKind::Answer, call_id, from, to, sdp)
    }

    pub fn ice_candidate(call_id: CallId, from: UserId, to: UserId, candidate: String) -> Self {
        Self::new(SignalKind::IceCandidate, call_id, from, to, candidate)
    }

    pub fn end_call(call_id: CallId, from: UserId, to: UserId) -> Self {
        Self::new(SignalKind::EndCall, call_id, from, to, String::new())
    }

    /// Topic, auf dem dieser Envelope publiziert wird
    ///
    /// Offers gehen an die Inbox des Empfängers, da dieser den Call-Topic
    /// erst nach dem Offer abonniert. Alles andere läuft über den Call-Topic.
    pub fn topic(&self) -> Topic {
        match self.kind {
            SignalKind::Offer => Topic::User(self.to_user_id.clone()),
            _ => Topic::Call(self.call_id),
        }
    }
}

// ============================================================================
// TOPICS
// ============================================================================

/// Adresse im Pub/Sub-Kanal
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Topic {
    /// Alle Envelopes eines Anrufs
    Call(CallId),
    /// Inbox eines Benutzers (eingehende Offers)
    User(UserId),
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Call(id) => write!(f, "call:{}", id),
            Topic::User(id) => write!(f, "user:{}", id),
        }
    }
}

impl From<Topic> for String {
    fn from(topic: Topic) -> Self {
        topic.to_string()
    }
}

impl TryFrom<String> for Topic {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.split_once(':') {
            Some(("call", id)) => id
                .parse()
                .map(Topic::Call)
                .map_err(|e| format!("invalid call topic '{}': {}", value, e)),
            Some(("user", id)) if !id.is_empty() => Ok(Topic::User(UserId::new(id))),
            _ => Err(format!("invalid topic '{}'", value)),
        }
    }
}

// ============================================================================
// CLIENT → RELAY MESSAGES
// ============================================================================

/// Topic abonnieren
#[derive(Debug, Clone, Serialize)]
pub struct SubscribePayload {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    #[serde(rename = "peerId")]
    pub peer_id: String,
    pub topic: Topic,
}

impl SubscribePayload {
    pub fn new(peer_id: String, topic: Topic) -> Self {
        Self {
            msg_type: "subscribe",
            peer_id,
            topic,
        }
    }
}

/// Abo beenden
#[derive(Debug, Clone, Serialize)]
pub struct UnsubscribePayload {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    #[serde(rename = "peerId")]
    pub peer_id: String,
    pub topic: Topic,
}

impl UnsubscribePayload {
    pub fn new(peer_id: String, topic: Topic) -> Self {
        Self {
            msg_type: "unsubscribe",
            peer_id,
            topic,
        }
    }
}

/// Envelope auf einem Topic veröffentlichen
#[derive(Debug, Clone, Serialize)]
pub struct PublishPayload {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    #[serde(rename = "peerId")]
    pub peer_id: String,
    pub topic: Topic,
    pub envelope: SignalEnvelope,
}

impl PublishPayload {
    pub fn new(peer_id: String, envelope: SignalEnvelope) -> Self {
        Self {
            msg_type: "publish",
            peer_id,
            topic: envelope.topic(),
            envelope,
        }
    }
}

/// Heartbeat
#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatPayload {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    #[serde(rename = "peerId")]
    pub peer_id: String,
}

impl HeartbeatPayload {
    pub fn new(peer_id: String) -> Self {
        Self {
            msg_type: "heartbeat",
            peer_id,
        }
    }
}

// ============================================================================
// RELAY → CLIENT MESSAGES
// ============================================================================

/// Alle möglichen Relay-Nachrichten
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Abo bestätigt
    Subscribed { topic: Topic, timestamp: i64 },

    /// Envelope auf einem abonnierten Topic
    Deliver {
        topic: Topic,
        envelope: SignalEnvelope,
        timestamp: i64,
    },

    /// Fehler
    Error {
        code: i32,
        message: String,
        timestamp: i64,
    },

    /// Heartbeat Antwort
    Pong { timestamp: i64 },
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offer_goes_to_recipient_inbox() {
        let call_id = CallId::new();
        let offer = SignalEnvelope::offer(call_id, "alice".into(), "bob".into(), "v=0".into());
        assert_eq!(offer.topic(), Topic::User("bob".into()));

        let end = SignalEnvelope::end_call(call_id, "bob".into(), "alice".into());
        assert_eq!(end.topic(), Topic::Call(call_id));
        assert!(end.payload.is_empty());
    }

    #[test]
    fn test_envelope_json_shape() {
        let call_id = CallId::new();
        let envelope =
            SignalEnvelope::ice_candidate(call_id, "alice".into(), "bob".into(), "cand".into());
        let json = serde_json::to_value(&envelope).unwrap();

        assert_eq!(json["type"], "ice_candidate");
        assert_eq!(json["fromUserId"], "alice");
        assert_eq!(json["toUserId"], "bob");
        assert_eq!(json["callId"], call_id.to_string());

        let back: SignalEnvelope = serde_json::from_value(json).unwrap();
        assert_eq!(back, envelope);
    }

    #[test]
    fn test_topic_parsing() {
        let call_id = CallId::new();
        let topic = Topic::try_from(format!("call:{}", call_id)).unwrap();
        assert_eq!(topic, Topic::Call(call_id));
        assert_eq!(
            Topic::try_from("user:bob".to_string()).unwrap(),
            Topic::User("bob".into())
        );
        assert!(Topic::try_from("call:not-a-uuid".to_string()).is_err());
        assert!(Topic::try_from("room:1".to_string()).is_err());
    }

    #[test]
    fn test_deliver_message_parsing() {
        let call_id = CallId::new();
        let envelope = SignalEnvelope::answer(call_id, "bob".into(), "alice".into(), "sdp".into());
        let raw = serde_json::json!({
            "type": "deliver",
            "topic": format!("call:{}", call_id),
            "envelope": envelope,
            "timestamp": 1
        });

        match serde_json::from_value::<ServerMessage>(raw).unwrap() {
            ServerMessage::Deliver { topic, envelope: e, .. } => {
                assert_eq!(topic, Topic::Call(call_id));
                assert_eq!(e, envelope);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }
}
