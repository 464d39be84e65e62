//! In-Process SignalBus
//!
//! Ein `LocalSignalHub` verbindet beliebig viele `LocalSignalBus`-Handles
//! (eines pro Gerät) im selben Prozess. Wird für Tests und für lokale
//! Demos ohne Relay verwendet.

use super::bus::{EnvelopeSink, SignalBus, SignalingError};
use super::messages::{SignalEnvelope, Topic};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct HubState {
    /// topic → (subscriber id → sink)
    topics: HashMap<Topic, HashMap<u64, EnvelopeSink>>,
}

/// Gemeinsamer Verteiler für alle lokalen Busse
#[derive(Clone, Default)]
pub struct LocalSignalHub {
    state: Arc<Mutex<HubState>>,
    next_id: Arc<AtomicU64>,
}

impl LocalSignalHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Erstellt einen Bus-Handle für ein Gerät
    pub fn connect(&self) -> LocalSignalBus {
        LocalSignalBus {
            hub: self.clone(),
            subscriber_id: self.next_id.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Anzahl aktiver Abos auf einem Topic
    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.state
            .lock()
            .topics
            .get(topic)
            .map(|subs| subs.len())
            .unwrap_or(0)
    }
}

/// Bus-Handle eines Geräts am `LocalSignalHub`
pub struct LocalSignalBus {
    hub: LocalSignalHub,
    subscriber_id: u64,
}

#[async_trait]
impl SignalBus for LocalSignalBus {
    async fn subscribe(&self, topic: Topic, sink: EnvelopeSink) -> Result<(), SignalingError> {
        tracing::debug!("Local bus {}: subscribe {}", self.subscriber_id, topic);
        self.hub
            .state
            .lock()
            .topics
            .entry(topic)
            .or_default()
            .insert(self.subscriber_id, sink);
        Ok(())
    }

    async fn publish(&self, envelope: &SignalEnvelope) -> Result<(), SignalingError> {
        let topic = envelope.topic();
        let mut state = self.hub.state.lock();

        let Some(subscribers) = state.topics.get_mut(&topic) else {
            tracing::debug!("No subscribers on {}, dropping {:?}", topic, envelope.kind);
            return Ok(());
        };

        // Geschlossene Empfänger gleich mit aufräumen
        subscribers.retain(|_, sink| sink.send(envelope.clone()).is_ok());
        if subscribers.is_empty() {
            state.topics.remove(&topic);
        }
        Ok(())
    }

    async fn unsubscribe(&self, topic: &Topic) -> Result<(), SignalingError> {
        tracing::debug!("Local bus {}: unsubscribe {}", self.subscriber_id, topic);
        let mut state = self.hub.state.lock();
        if let Some(subscribers) = state.topics.get_mut(topic) {
            subscribers.remove(&self.subscriber_id);
            if subscribers.is_empty() {
                state.topics.remove(topic);
            }
        }
        Ok(())
    }
}

impl Drop for LocalSignalBus {
    fn drop(&mut self) {
        let mut state = self.hub.state.lock();
        for subscribers in state.topics.values_mut() {
            subscribers.remove(&self.subscriber_id);
        }
        state.topics.retain(|_, subs| !subs.is_empty());
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::CallId;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let hub = LocalSignalHub::new();
        let bus = hub.connect();
        let envelope = SignalEnvelope::end_call(CallId::new(), "alice".into(), "bob".into());
        assert!(bus.publish(&envelope).await.is_ok());
    }

    #[tokio::test]
    async fn test_delivers_to_every_device_on_topic() {
        let hub = LocalSignalHub::new();
        let alice = hub.connect();
        let bob = hub.connect();
        let call_id = CallId::new();

        let (alice_tx, mut alice_rx) = mpsc::unbounded_channel();
        let (bob_tx, mut bob_rx) = mpsc::unbounded_channel();
        alice.subscribe(Topic::Call(call_id), alice_tx).await.unwrap();
        bob.subscribe(Topic::Call(call_id), bob_tx).await.unwrap();

        let envelope = SignalEnvelope::answer(call_id, "bob".into(), "alice".into(), "sdp".into());
        bob.publish(&envelope).await.unwrap();

        assert_eq!(alice_rx.recv().await.unwrap(), envelope);
        assert_eq!(bob_rx.recv().await.unwrap(), envelope);
    }

    #[tokio::test]
    async fn test_unsubscribe_only_affects_own_device() {
        let hub = LocalSignalHub::new();
        let alice = hub.connect();
        let bob = hub.connect();
        let topic = Topic::Call(CallId::new());

        let (tx, _rx) = mpsc::unbounded_channel();
        alice.subscribe(topic.clone(), tx.clone()).await.unwrap();
        bob.subscribe(topic.clone(), tx).await.unwrap();
        assert_eq!(hub.subscriber_count(&topic), 2);

        alice.unsubscribe(&topic).await.unwrap();
        assert_eq!(hub.subscriber_count(&topic), 1);

        drop(bob);
        assert_eq!(hub.subscriber_count(&topic), 0);
    }
}
