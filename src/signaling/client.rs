//! WebSocket SignalBus
//!
//! Verbindet sich mit dem Signaling-Relay und implementiert darüber
//! den `SignalBus`:
//! - Subscribe/Unsubscribe/Publish als signierte Frames
//! - Heartbeat gegen Idle-Timeouts
//! - Eingehende `deliver`-Frames werden an das passende Abo verteilt

use super::bus::{EnvelopeSink, SignalBus, SignalingError};
use super::messages::*;
use crate::crypto::DeviceKey;
use async_trait::async_trait;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

/// Intervall für Heartbeats (Relay hat ein Idle-Timeout)
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);

// ============================================================================
// CLIENT STATE
// ============================================================================

#[derive(Debug, Clone, Default)]
struct ClientState {
    is_connected: bool,
}

type Subscriptions = Arc<RwLock<HashMap<Topic, EnvelopeSink>>>;

// ============================================================================
// WEBSOCKET SIGNAL BUS
// ============================================================================

/// SignalBus über das WebSocket-Relay
pub struct WebSocketSignalBus {
    server_url: String,
    peer_id: String,
    key: Arc<DeviceKey>,
    state: Arc<RwLock<ClientState>>,
    subscriptions: Subscriptions,
    tx: mpsc::Sender<String>,
}

impl WebSocketSignalBus {
    /// Verbindet mit dem Relay
    ///
    /// `peer_id` ist die Benutzer-ID dieses Geräts und steht in jedem Frame.
    pub async fn connect(
        server_url: &str,
        peer_id: String,
        key: Arc<DeviceKey>,
    ) -> Result<Self, SignalingError> {
        let ws_url = websocket_url(server_url)?;
        tracing::info!("Connecting to signaling relay: {}", ws_url);

        let (ws_stream, _) = connect_async(ws_url.as_str())
            .await
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();
        let (tx, mut rx) = mpsc::channel::<String>(100);

        let state = Arc::new(RwLock::new(ClientState { is_connected: true }));
        let subscriptions: Subscriptions = Arc::new(RwLock::new(HashMap::new()));

        // Read-Task
        let state_clone = Arc::clone(&state);
        let subs_clone = Arc::clone(&subscriptions);
        tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(server_msg) => Self::handle_server_message(server_msg, &subs_clone),
                        Err(e) => tracing::warn!("Unparseable relay message: {}", e),
                    },
                    Ok(Message::Close(_)) => {
                        tracing::info!("WebSocket closed by relay");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            state_clone.write().is_connected = false;
            tracing::info!("Disconnected from signaling relay");
        });

        // Write-Task
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = write.send(Message::Text(msg)).await {
                    tracing::error!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
        });

        let bus = Self {
            server_url: server_url.to_string(),
            peer_id,
            key,
            state,
            subscriptions,
            tx,
        };
        bus.start_heartbeat();

        Ok(bus)
    }

    /// Prüft ob verbunden
    pub fn is_connected(&self) -> bool {
        self.state.read().is_connected
    }

    fn handle_server_message(msg: ServerMessage, subscriptions: &Subscriptions) {
        match msg {
            ServerMessage::Deliver {
                topic, envelope, ..
            } => {
                let sink = subscriptions.read().get(&topic).cloned();
                match sink {
                    Some(sink) => {
                        if sink.send(envelope).is_err() {
                            // Empfänger ist weg
                            subscriptions.write().remove(&topic);
                        }
                    }
                    None => tracing::debug!("Delivery on unsubscribed topic {}", topic),
                }
            }

            ServerMessage::Subscribed { topic, .. } => {
                tracing::debug!("Relay confirmed subscription to {}", topic);
            }

            ServerMessage::Error { code, message, .. } => {
                tracing::error!("Relay error {}: {}", code, message);
            }

            ServerMessage::Pong { .. } => {}
        }
    }

    /// Startet den Heartbeat-Task, endet mit der Verbindung
    fn start_heartbeat(&self) {
        let state = Arc::clone(&self.state);
        let key = Arc::clone(&self.key);
        let tx = self.tx.clone();
        let peer_id = self.peer_id.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                if !state.read().is_connected {
                    tracing::info!("Heartbeat: relay disconnected, stopping heartbeat task");
                    break;
                }
                let frame = match signed_frame(&key, HeartbeatPayload::new(peer_id.clone())) {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::warn!("Failed to build heartbeat: {}", e);
                        continue;
                    }
                };
                // try_send: Heartbeats dürfen verloren gehen
                let _ = tx.try_send(frame);
            }
        });
    }

    async fn send_signed<T: serde::Serialize>(&self, payload: T) -> Result<(), SignalingError> {
        if !self.is_connected() {
            return Err(SignalingError::NotConnected);
        }
        let frame = signed_frame(&self.key, payload)?;
        self.tx
            .send(frame)
            .await
            .map_err(|e| SignalingError::SendFailed(e.to_string()))
    }
}

#[async_trait]
impl SignalBus for WebSocketSignalBus {
    async fn subscribe(&self, topic: Topic, sink: EnvelopeSink) -> Result<(), SignalingError> {
        self.subscriptions.write().insert(topic.clone(), sink);
        self.send_signed(SubscribePayload::new(self.peer_id.clone(), topic))
            .await
    }

    async fn publish(&self, envelope: &SignalEnvelope) -> Result<(), SignalingError> {
        tracing::debug!(
            "Publishing {:?} for call {} on {}",
            envelope.kind,
            envelope.call_id,
            envelope.topic()
        );
        self.send_signed(PublishPayload::new(self.peer_id.clone(), envelope.clone()))
            .await
    }

    async fn unsubscribe(&self, topic: &Topic) -> Result<(), SignalingError> {
        if self.subscriptions.write().remove(topic).is_none() {
            return Ok(());
        }
        self.send_signed(UnsubscribePayload::new(self.peer_id.clone(), topic.clone()))
            .await
    }
}

impl Drop for WebSocketSignalBus {
    fn drop(&mut self) {
        // Beendet den Heartbeat-Task beim nächsten Tick
        self.state.write().is_connected = false;
        self.subscriptions.write().clear();
    }
}

impl std::fmt::Debug for WebSocketSignalBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketSignalBus")
            .field("server_url", &self.server_url)
            .field("peer_id", &self.peer_id)
            .field("state", &*self.state.read())
            .finish()
    }
}

// ============================================================================
// HELPERS
// ============================================================================

/// `http(s)://host/base` → `ws(s)://host/base/ws`
fn websocket_url(server_url: &str) -> Result<Url, SignalingError> {
    let mut url =
        Url::parse(server_url).map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(SignalingError::ConnectionFailed(format!(
                "unsupported scheme '{}'",
                other
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| SignalingError::ConnectionFailed("cannot set scheme".to_string()))?;

    let path = format!("{}/ws", url.path().trim_end_matches('/'));
    url.set_path(&path);
    Ok(url)
}

/// Fügt `timestamp` und `signature` hinzu und serialisiert
fn signed_frame<T: serde::Serialize>(key: &DeviceKey, payload: T) -> Result<String, SignalingError> {
    let mut frame =
        serde_json::to_value(&payload).map_err(|e| SignalingError::SendFailed(e.to_string()))?;

    let obj = frame
        .as_object_mut()
        .ok_or_else(|| SignalingError::SendFailed("payload is not an object".to_string()))?;
    obj.insert(
        "timestamp".to_string(),
        serde_json::Value::Number(Utc::now().timestamp_millis().into()),
    );

    let signature = key.sign_frame(&frame);
    if let Some(obj) = frame.as_object_mut() {
        obj.insert(
            "signature".to_string(),
            serde_json::Value::String(signature),
        );
    }

    serde_json::to_string(&frame).map_err(|e| SignalingError::SendFailed(e.to_string()))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::CallId;
    use tokio::net::TcpListener;

    #[test]
    fn test_websocket_url() {
        assert_eq!(
            websocket_url("https://relay.example.com").unwrap().as_str(),
            "wss://relay.example.com/ws"
        );
        assert_eq!(
            websocket_url("http://127.0.0.1:8787/signal/").unwrap().as_str(),
            "ws://127.0.0.1:8787/signal/ws"
        );
        assert!(websocket_url("ftp://relay.example.com").is_err());
    }

    /// Minimales Relay: prüft Signaturen und spiegelt Publishes an
    /// abonnierte Topics derselben Verbindung zurück
    async fn spawn_echo_relay(public_key: String) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let mut topics = Vec::<String>::new();

            while let Some(Ok(msg)) = ws.next().await {
                let Message::Text(text) = msg else { continue };
                let frame: serde_json::Value = serde_json::from_str(&text).unwrap();
                let signature = frame["signature"].as_str().unwrap().to_string();
                assert!(DeviceKey::verify_frame(&public_key, &frame, &signature).unwrap());

                match frame["type"].as_str().unwrap() {
                    "subscribe" => {
                        topics.push(frame["topic"].as_str().unwrap().to_string());
                    }
                    "publish" => {
                        let topic = frame["topic"].as_str().unwrap().to_string();
                        if topics.contains(&topic) {
                            let deliver = serde_json::json!({
                                "type": "deliver",
                                "topic": topic,
                                "envelope": frame["envelope"],
                                "timestamp": 0
                            });
                            ws.send(Message::Text(deliver.to_string())).await.unwrap();
                        }
                    }
                    _ => {}
                }
            }
        });

        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_subscribe_publish_roundtrip_through_relay() {
        let key = Arc::new(DeviceKey::generate());
        let url = spawn_echo_relay(key.public_key_base64()).await;

        let bus = WebSocketSignalBus::connect(&url, "alice".to_string(), key)
            .await
            .unwrap();
        assert!(bus.is_connected());

        let call_id = CallId::new();
        let (sink, mut rx) = mpsc::unbounded_channel();
        bus.subscribe(Topic::Call(call_id), sink).await.unwrap();

        let envelope =
            SignalEnvelope::ice_candidate(call_id, "bob".into(), "alice".into(), "cand".into());
        bus.publish(&envelope).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, envelope);
    }

    #[tokio::test]
    async fn test_unsubscribe_unknown_topic_is_noop() {
        let key = Arc::new(DeviceKey::generate());
        let url = spawn_echo_relay(key.public_key_base64()).await;
        let bus = WebSocketSignalBus::connect(&url, "alice".to_string(), key)
            .await
            .unwrap();

        assert!(bus
            .unsubscribe(&Topic::User("nobody".into()))
            .await
            .is_ok());
    }
}
