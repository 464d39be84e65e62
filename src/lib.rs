//! Pulse Calls - P2P Anrufe zwischen zwei Geräten
//!
//! Orchestrierung von Eins-zu-eins Audio/Video-Anrufen mit:
//! - Signaling über ein WebSocket-Relay (Pub/Sub nach Topic)
//! - WebRTC für die P2P Medienverbindung
//! - Ed25519 Geräteschlüssel für signierte Relay-Frames
//! - SQLite für den Anrufverlauf

pub mod call;
pub mod config;
pub mod crypto;
pub mod database;
pub mod media;
pub mod signaling;

#[cfg(test)]
mod testing;

use anyhow::Context;
use call::{CallSessionManager, UserId};
use config::AppConfig;
use crypto::DeviceKey;
use database::{CallRecord, CallRecordsDatabase, DatabaseError};
use media::WebRtcEngineFactory;
use signaling::WebSocketSignalBus;
use std::sync::Arc;

/// Default-Filter, wenn `RUST_LOG` nicht gesetzt ist
const DEFAULT_LOG_FILTER: &str = "pulse_calls=debug,webrtc=warn";

/// Initialisiert das Logging; weitere Aufrufe sind No-ops
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER));

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

// ============================================================================
// CALL SERVICE
// ============================================================================

/// Alles, was ein Gerät für Anrufe braucht, fertig verdrahtet
pub struct CallService {
    key: Arc<DeviceKey>,
    store: Arc<CallRecordsDatabase>,
    bus: Arc<WebSocketSignalBus>,
    manager: CallSessionManager,
}

impl CallService {
    /// Lädt Schlüssel und Datenbank, verbindet mit dem Relay und
    /// startet den Manager für `user_id`
    pub async fn start(config: AppConfig, user_id: UserId) -> anyhow::Result<Self> {
        tracing::info!("Initializing call service for {}...", user_id);

        let key = DeviceKey::load_or_create(config.key_path.as_deref())
            .context("Failed to load device key")?;
        tracing::info!("Loaded device key: {:?}", key);
        let key = Arc::new(key);

        let store = CallRecordsDatabase::open(config.database_path.as_deref())
            .context("Failed to open call database")?;
        // Kein Anruf überlebt einen Neustart
        store.fail_stale_calls()?;
        let store = Arc::new(store);

        let bus = WebSocketSignalBus::connect(
            &config.signaling_url,
            user_id.to_string(),
            Arc::clone(&key),
        )
        .await
        .context("Failed to connect to signaling relay")?;
        let bus = Arc::new(bus);

        let mut media = WebRtcEngineFactory::new();
        if let Some(turn) = &config.turn {
            tracing::info!("Using TURN server {}", turn.url);
            media = media.with_turn_server(turn);
        }

        let manager = CallSessionManager::start(
            user_id,
            bus.clone(),
            Arc::new(media),
            store.clone(),
            config.session.clone(),
        )
        .await?;

        Ok(Self {
            key,
            store,
            bus,
            manager,
        })
    }

    pub fn manager(&self) -> &CallSessionManager {
        &self.manager
    }

    pub fn public_key(&self) -> String {
        self.key.public_key_base64()
    }

    pub fn is_connected(&self) -> bool {
        self.bus.is_connected()
    }

    /// Letzte Anrufe, neueste zuerst
    pub fn call_history(&self, limit: usize) -> Result<Vec<CallRecord>, DatabaseError> {
        use database::CallRecordStore;
        self.store.recent(limit)
    }

    pub async fn shutdown(&self) {
        self.manager.shutdown().await;
    }
}

impl std::fmt::Debug for CallService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallService")
            .field("user", self.manager.local_user())
            .field("connected", &self.is_connected())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
