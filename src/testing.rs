//! Test-Hilfen: Mock Media Engine, protokollierender Record Store und
//! ein "roher" Signaling-Teilnehmer ohne eigenen Manager.

use crate::call::{CallId, UserId};
use crate::config::SessionConfig;
use crate::database::{CallRecord, CallRecordStore, CallRecordsDatabase, CallStatus, DatabaseError};
use crate::media::{
    ConnectionState, LocalMedia, MediaConfig, MediaConnection, MediaEngine, MediaEngineFactory,
    MediaError, MediaEvent, MediaHandle, RemoteTrack, TrackKind,
};
use crate::signaling::{
    EnvelopeSink, LocalSignalBus, LocalSignalHub, SignalBus, SignalEnvelope, Topic,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub fn test_config() -> SessionConfig {
    SessionConfig {
        reconnect_grace: Duration::from_secs(10),
        setup_timeout: Duration::from_secs(45),
        media: MediaConfig::default(),
    }
}

// ============================================================================
// MOCK MEDIA ENGINE
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct MockOptions {
    pub fail_acquisition: bool,
    pub acquisition_delay: Duration,
    /// Verzögert create_offer/create_answer
    pub negotiation_delay: Duration,
    /// Werden nach create_offer/create_answer als lokale Candidates gemeldet
    pub local_candidates: Vec<String>,
}

#[derive(Default)]
pub struct MockMediaFactory {
    options: MockOptions,
    engines: Mutex<HashMap<CallId, Arc<MockEngine>>>,
}

impl MockMediaFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_options(options: MockOptions) -> Arc<Self> {
        Arc::new(Self {
            options,
            engines: Mutex::new(HashMap::new()),
        })
    }

    pub fn engine(&self, call_id: &CallId) -> Option<Arc<MockEngine>> {
        self.engines.lock().get(call_id).cloned()
    }

    pub async fn wait_engine(&self, call_id: &CallId) -> Arc<MockEngine> {
        for _ in 0..1000 {
            if let Some(engine) = self.engine(call_id) {
                return engine;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("no engine created for call {}", call_id);
    }
}

#[async_trait]
impl MediaEngineFactory for MockMediaFactory {
    async fn connect(&self, call_id: CallId) -> Result<MediaConnection, MediaError> {
        let (events_tx, events) = mpsc::unbounded_channel();
        let engine = Arc::new(MockEngine {
            call_id,
            options: self.options.clone(),
            events: events_tx,
            state: Mutex::new(MockEngineState::default()),
            close_count: AtomicUsize::new(0),
        });
        self.engines.lock().insert(call_id, Arc::clone(&engine));
        Ok(MediaConnection { engine, events })
    }
}

#[derive(Default)]
struct MockEngineState {
    remote_descriptions: Vec<String>,
    candidates: Vec<String>,
    media: Option<Arc<MockLocalMedia>>,
}

pub struct MockEngine {
    pub call_id: CallId,
    options: MockOptions,
    events: mpsc::UnboundedSender<MediaEvent>,
    state: Mutex<MockEngineState>,
    close_count: AtomicUsize,
}

impl MockEngine {
    pub fn emit_state(&self, state: ConnectionState) {
        let _ = self.events.send(MediaEvent::ConnectionState(state));
    }

    pub fn emit_track(&self, kind: TrackKind) {
        let _ = self.events.send(MediaEvent::RemoteTrack(RemoteTrack {
            id: format!("remote-{:?}", kind),
            kind,
        }));
    }

    pub fn remote_descriptions(&self) -> Vec<String> {
        self.state.lock().remote_descriptions.clone()
    }

    pub fn applied_candidates(&self) -> Vec<String> {
        self.state.lock().candidates.clone()
    }

    pub fn media(&self) -> Option<Arc<MockLocalMedia>> {
        self.state.lock().media.clone()
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    async fn negotiate(&self) {
        if !self.options.negotiation_delay.is_zero() {
            tokio::time::sleep(self.options.negotiation_delay).await;
        }
    }

    fn emit_local_candidates(&self) {
        for candidate in &self.options.local_candidates {
            let _ = self.events.send(MediaEvent::IceCandidate(candidate.clone()));
        }
    }
}

#[async_trait]
impl MediaEngine for MockEngine {
    async fn acquire_local_media(&self, _config: &MediaConfig) -> Result<MediaHandle, MediaError> {
        if !self.options.acquisition_delay.is_zero() {
            tokio::time::sleep(self.options.acquisition_delay).await;
        }
        if self.options.fail_acquisition {
            return Err(MediaError::AcquisitionFailed(
                "microphone permission denied".to_string(),
            ));
        }

        let media = Arc::new(MockLocalMedia {
            id: format!("mock-{}", self.call_id),
            muted: AtomicBool::new(false),
            stop_count: AtomicUsize::new(0),
        });
        self.state.lock().media = Some(Arc::clone(&media));
        Ok(media)
    }

    async fn create_offer(&self) -> Result<String, MediaError> {
        self.negotiate().await;
        self.emit_local_candidates();
        Ok(format!("offer:{}", self.call_id))
    }

    async fn create_answer(&self, remote_sdp: &str) -> Result<String, MediaError> {
        self.negotiate().await;
        self.state
            .lock()
            .remote_descriptions
            .push(remote_sdp.to_string());
        self.emit_local_candidates();
        Ok(format!("answer:{}", self.call_id))
    }

    async fn set_remote_description(&self, sdp: &str) -> Result<(), MediaError> {
        self.state.lock().remote_descriptions.push(sdp.to_string());
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &str) -> Result<(), MediaError> {
        let mut state = self.state.lock();
        if state.remote_descriptions.is_empty() {
            return Err(MediaError::InvalidCandidate(
                "remote description not set".to_string(),
            ));
        }
        state.candidates.push(candidate.to_string());
        Ok(())
    }

    async fn close(&self) {
        self.close_count.fetch_add(1, Ordering::SeqCst);
    }
}

/// Zählt `stop()`-Aufrufe, damit Tests doppeltes Aufräumen erkennen
#[derive(Debug)]
pub struct MockLocalMedia {
    id: String,
    muted: AtomicBool,
    stop_count: AtomicUsize,
}

impl MockLocalMedia {
    pub fn stop_count(&self) -> usize {
        self.stop_count.load(Ordering::SeqCst)
    }
}

impl LocalMedia for MockLocalMedia {
    fn id(&self) -> &str {
        &self.id
    }

    fn tracks(&self) -> Vec<TrackKind> {
        vec![TrackKind::Audio]
    }

    fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::SeqCst);
    }

    fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.stop_count.fetch_add(1, Ordering::SeqCst);
    }

    fn is_stopped(&self) -> bool {
        self.stop_count() > 0
    }
}

// ============================================================================
// RECORDING STORE
// ============================================================================

/// In-Memory SQLite plus Protokoll aller Endstatus-Schreibvorgänge
pub struct RecordingStore {
    db: CallRecordsDatabase,
    finishes: Mutex<Vec<(CallId, CallStatus)>>,
}

impl RecordingStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            db: CallRecordsDatabase::open_in_memory().expect("in-memory database"),
            finishes: Mutex::new(Vec::new()),
        })
    }

    pub fn terminal_writes(&self, id: &CallId) -> Vec<CallStatus> {
        self.finishes
            .lock()
            .iter()
            .filter(|(call_id, _)| call_id == id)
            .map(|(_, status)| *status)
            .collect()
    }

    pub fn record(&self, id: &CallId) -> Option<CallRecord> {
        self.db.get(id).ok()
    }

    pub fn is_empty(&self) -> bool {
        self.db.recent(1).map(|r| r.is_empty()).unwrap_or(true)
    }
}

impl CallRecordStore for RecordingStore {
    fn create(&self, record: &CallRecord) -> Result<(), DatabaseError> {
        self.db.create(record)
    }

    fn mark_active(&self, id: &CallId, answered_at: DateTime<Utc>) -> Result<(), DatabaseError> {
        self.db.mark_active(id, answered_at)
    }

    fn finish(
        &self,
        id: &CallId,
        status: CallStatus,
        ended_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.finishes.lock().push((*id, status));
        self.db.finish(id, status, ended_at)
    }

    fn get(&self, id: &CallId) -> Result<CallRecord, DatabaseError> {
        self.db.get(id)
    }

    fn recent(&self, limit: usize) -> Result<Vec<CallRecord>, DatabaseError> {
        self.db.recent(limit)
    }
}

// ============================================================================
// RAW PEER
// ============================================================================

/// Teilnehmer am Hub, der Envelopes von Hand liest und schreibt
pub struct RawPeer {
    pub user: UserId,
    bus: LocalSignalBus,
    sink: EnvelopeSink,
    inbox: mpsc::UnboundedReceiver<SignalEnvelope>,
}

impl RawPeer {
    pub async fn join(hub: &LocalSignalHub, user: &str) -> Self {
        let user = UserId::new(user);
        let bus = hub.connect();
        let (sink, inbox) = mpsc::unbounded_channel();
        bus.subscribe(Topic::User(user.clone()), sink.clone())
            .await
            .expect("subscribe inbox");
        Self {
            user,
            bus,
            sink,
            inbox,
        }
    }

    pub async fn watch_call(&self, call_id: CallId) {
        self.bus
            .subscribe(Topic::Call(call_id), self.sink.clone())
            .await
            .expect("subscribe call topic");
    }

    pub async fn publish(&self, envelope: SignalEnvelope) {
        self.bus.publish(&envelope).await.expect("publish");
    }

    /// Nächster an diesen Teilnehmer adressierter Envelope
    pub async fn next(&mut self) -> SignalEnvelope {
        let user = self.user.clone();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match self.inbox.recv().await {
                    Some(env) if env.to_user_id == user => return env,
                    Some(_) => continue,
                    None => panic!("raw peer inbox closed"),
                }
            }
        })
        .await
        .expect("timed out waiting for envelope")
    }

    pub fn try_next(&mut self) -> Option<SignalEnvelope> {
        while let Ok(env) = self.inbox.try_recv() {
            if env.to_user_id == self.user {
                return Some(env);
            }
        }
        None
    }
}
