//! CallSession - Zustandsmaschine eines einzelnen Anrufs
//!
//! Jede Session läuft als eigener Task. Alle Eingänge (Envelopes vom
//! Signaling, Events der Media Engine, Auflegen durch den Benutzer,
//! Timer) landen in diesem einen Task und werden nacheinander
//! abgearbeitet. Nach außen gibt es nur den `CallSessionHandle`.
//!
//! ```text
//! Negotiating ──► Connecting ──► Active
//!      │               │            │
//!      └───────────────┴────────────┴──► Ending ──► Terminated(Ended|Failed|Missed)
//! ```

use super::error::CallError;
use super::registry::SessionRegistry;
use super::types::{CallEvent, CallId, Role, SessionState, TerminalReason, UserId};
use crate::config::SessionConfig;
use crate::database::{CallRecord, CallRecordStore, CallStatus, DatabaseError};
use crate::media::{
    ConnectionState, MediaConfig, MediaConnection, MediaEngine, MediaEngineFactory, MediaEvent,
    MediaHandle, RemoteTrack,
};
use crate::signaling::{EnvelopeSink, SignalBus, SignalEnvelope, SignalKind, Topic};
use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;

// ============================================================================
// CONTEXT
// ============================================================================

/// Abhängigkeiten, die jede Session vom Manager bekommt
#[derive(Clone)]
pub(crate) struct SessionContext {
    pub local_user: UserId,
    pub bus: Arc<dyn SignalBus>,
    pub media: Arc<dyn MediaEngineFactory>,
    pub store: Arc<dyn CallRecordStore>,
    pub registry: SessionRegistry,
    pub events: broadcast::Sender<CallEvent>,
    /// Eingang des Manager-Routers, für das Abo des Call-Topics
    pub inbound: EnvelopeSink,
    pub config: SessionConfig,
}

// ============================================================================
// HANDLE
// ============================================================================

enum SessionCommand {
    Envelope(SignalEnvelope),
    SetMuted(bool),
}

#[derive(Debug, Clone, Copy)]
enum EndRequest {
    Local,
    Remote,
}

/// Zugriff auf eine laufende Session
///
/// Alle Methoden sind nicht-blockierend. Auflegen läuft über einen
/// eigenen Kanal, der vor allen anderen Eingängen bedient wird.
#[derive(Clone)]
pub struct CallSessionHandle {
    call_id: CallId,
    role: Role,
    remote_user: UserId,
    commands: mpsc::UnboundedSender<SessionCommand>,
    end_tx: mpsc::UnboundedSender<EndRequest>,
    state: watch::Receiver<SessionState>,
}

impl CallSessionHandle {
    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn remote_user(&self) -> &UserId {
        &self.remote_user
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn is_terminated(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Wartet bis die Session ihren Endzustand erreicht hat
    pub async fn wait_terminated(&self) -> TerminalReason {
        let mut rx = self.state.clone();
        let reached = rx.wait_for(|s| s.is_terminal()).await.map(|s| *s);
        let state = match reached {
            Ok(state) => state,
            Err(_) => *self.state.borrow(),
        };

        match state {
            SessionState::Terminated(reason) => reason,
            // Task ist weg, ohne Endzustand zu setzen
            _ => TerminalReason::Failed,
        }
    }

    /// Legt auf; in jedem Zustand erlaubt, mehrfacher Aufruf ist harmlos
    pub fn end(&self) {
        let _ = self.end_tx.send(EndRequest::Local);
    }

    /// Stellt einen Envelope dieses Anrufs zu
    pub fn deliver(&self, envelope: SignalEnvelope) -> Result<(), CallError> {
        if envelope.from_user_id != self.remote_user {
            tracing::debug!(
                "Call {}: ignoring {:?} from unexpected sender {}",
                self.call_id,
                envelope.kind,
                envelope.from_user_id
            );
            return Ok(());
        }

        let sent = match envelope.kind {
            SignalKind::EndCall => self.end_tx.send(EndRequest::Remote).is_ok(),
            _ => self
                .commands
                .send(SessionCommand::Envelope(envelope))
                .is_ok(),
        };

        if sent {
            Ok(())
        } else {
            Err(CallError::SessionClosed)
        }
    }

    pub fn set_muted(&self, muted: bool) -> Result<(), CallError> {
        self.commands
            .send(SessionCommand::SetMuted(muted))
            .map_err(|_| CallError::SessionClosed)
    }

    /// Handle ohne laufenden Task, Zustand wird über den Sender gesteuert
    #[cfg(test)]
    pub(crate) fn stub(
        call_id: CallId,
        role: Role,
        remote_user: UserId,
    ) -> (Self, watch::Sender<SessionState>) {
        let (commands, _) = mpsc::unbounded_channel();
        let (end_tx, _) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(SessionState::Negotiating);
        let handle = Self {
            call_id,
            role,
            remote_user,
            commands,
            end_tx,
            state,
        };
        (handle, state_tx)
    }
}

impl std::fmt::Debug for CallSessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSessionHandle")
            .field("call_id", &self.call_id)
            .field("role", &self.role)
            .field("remote_user", &self.remote_user)
            .field("state", &self.state())
            .finish()
    }
}

// ============================================================================
// SETUP STEPS
// ============================================================================

/// Ergebnis eines abgeschlossenen Setup-Schritts
enum SetupStep {
    MediaReady(MediaConnection, MediaHandle),
    OfferPublished,
    AnswerPublished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SetupStage {
    Acquiring,
    Negotiating,
}

/// Laufender Setup-Schritt; wird beim Auflegen abgebrochen
struct SetupTask {
    stage: SetupStage,
    future: BoxFuture<'static, Result<SetupStep, CallError>>,
}

async fn acquire_media(
    factory: Arc<dyn MediaEngineFactory>,
    call_id: CallId,
    config: MediaConfig,
) -> Result<SetupStep, CallError> {
    let connection = factory.connect(call_id).await?;
    match connection.engine.acquire_local_media(&config).await {
        Ok(media) => Ok(SetupStep::MediaReady(connection, media)),
        Err(e) => {
            connection.engine.close().await;
            Err(e.into())
        }
    }
}

async fn publish_offer(
    engine: Arc<dyn MediaEngine>,
    bus: Arc<dyn SignalBus>,
    call_id: CallId,
    from: UserId,
    to: UserId,
) -> Result<SetupStep, CallError> {
    let sdp = engine.create_offer().await?;
    bus.publish(&SignalEnvelope::offer(call_id, from, to, sdp))
        .await?;
    Ok(SetupStep::OfferPublished)
}

async fn publish_answer(
    engine: Arc<dyn MediaEngine>,
    bus: Arc<dyn SignalBus>,
    call_id: CallId,
    from: UserId,
    to: UserId,
    offer_sdp: String,
) -> Result<SetupStep, CallError> {
    let sdp = engine.create_answer(&offer_sdp).await?;
    bus.publish(&SignalEnvelope::answer(call_id, from, to, sdp))
        .await?;
    Ok(SetupStep::AnswerPublished)
}

// ============================================================================
// SESSION ACTOR
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct Termination {
    reason: TerminalReason,
    /// EndCall kam vom Peer und muss nicht zurückgeschickt werden
    remote_ended: bool,
}

impl Termination {
    fn local(reason: TerminalReason) -> Self {
        Self {
            reason,
            remote_ended: false,
        }
    }
}

pub(crate) struct CallSession {
    ctx: SessionContext,
    call_id: CallId,
    role: Role,
    remote_user: UserId,

    state_tx: watch::Sender<SessionState>,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    end_rx: mpsc::UnboundedReceiver<EndRequest>,
    /// Meldet `place_call`, ob die lokalen Medien bereitstehen
    ready: Option<oneshot::Sender<Result<(), CallError>>>,

    setup: Option<SetupTask>,
    engine: Option<Arc<dyn MediaEngine>>,
    media_events: Option<mpsc::UnboundedReceiver<MediaEvent>>,
    local_media: Option<MediaHandle>,
    remote_tracks: Vec<RemoteTrack>,
    muted: bool,

    /// SDP des eingehenden Offers (nur Callee)
    remote_offer: Option<String>,
    /// Answer, das vor dem eigenen Offer-Publish ankam
    early_answer: Option<String>,
    offer_published: bool,
    remote_applied: bool,
    /// Remote-Candidates vor gesetzter Remote Description, in Ankunftsreihenfolge
    pending_candidates: Vec<String>,
    seen_candidates: HashSet<String>,
    /// Lokale Candidates, bis der Peer auf dem Call-Topic zuhört
    held_candidates: Vec<String>,
    peer_listening: bool,
    /// Der Peer kennt diesen Anruf und braucht ein EndCall
    peer_aware: bool,
    reached_active: bool,

    grace_deadline: Option<Instant>,
    setup_deadline: Option<Instant>,
}

impl CallSession {
    /// Ausgehender Anruf
    pub(crate) fn caller(
        ctx: SessionContext,
        call_id: CallId,
        callee: UserId,
    ) -> (
        Self,
        CallSessionHandle,
        oneshot::Receiver<Result<(), CallError>>,
    ) {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (mut session, handle) = Self::new(ctx, call_id, Role::Caller, callee);
        session.ready = Some(ready_tx);
        (session, handle, ready_rx)
    }

    /// Eingehender Anruf aus dem ersten Offer
    pub(crate) fn callee(ctx: SessionContext, offer: SignalEnvelope) -> (Self, CallSessionHandle) {
        let (mut session, handle) =
            Self::new(ctx, offer.call_id, Role::Callee, offer.from_user_id);
        session.remote_offer = Some(offer.payload);
        session.peer_aware = true;
        (session, handle)
    }

    fn new(
        ctx: SessionContext,
        call_id: CallId,
        role: Role,
        remote_user: UserId,
    ) -> (Self, CallSessionHandle) {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (end_tx, end_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Negotiating);

        let handle = CallSessionHandle {
            call_id,
            role,
            remote_user: remote_user.clone(),
            commands: commands_tx,
            end_tx,
            state: state_rx,
        };

        let session = Self {
            ctx,
            call_id,
            role,
            remote_user,
            state_tx,
            commands,
            end_rx,
            ready: None,
            setup: None,
            engine: None,
            media_events: None,
            local_media: None,
            remote_tracks: Vec::new(),
            muted: false,
            remote_offer: None,
            early_answer: None,
            offer_published: false,
            remote_applied: false,
            pending_candidates: Vec::new(),
            seen_candidates: HashSet::new(),
            held_candidates: Vec::new(),
            peer_listening: false,
            peer_aware: false,
            reached_active: false,
            grace_deadline: None,
            setup_deadline: None,
        };

        (session, handle)
    }

    /// Treibt die Session bis `Terminated`
    pub(crate) async fn run(mut self) {
        tracing::info!(
            "Call {}: session started as {:?} with {}",
            self.call_id,
            self.role,
            self.remote_user
        );
        self.emit(CallEvent::StateChanged {
            call_id: self.call_id,
            state: SessionState::Negotiating,
        });

        let termination = match self.begin().await {
            Ok(()) => self.event_loop().await,
            Err(termination) => termination,
        };

        self.finalize(termination).await;
    }

    async fn begin(&mut self) -> Result<(), Termination> {
        if self.role == Role::Caller {
            let record = CallRecord::ringing(
                self.call_id,
                self.ctx.local_user.clone(),
                self.remote_user.clone(),
            );
            self.write_record(move |store| store.create(&record)).await;
        }

        let topic = Topic::Call(self.call_id);
        if let Err(e) = self.ctx.bus.subscribe(topic, self.ctx.inbound.clone()).await {
            return Err(self.fail(e.into()));
        }

        self.setup_deadline = Some(Instant::now() + self.ctx.config.setup_timeout);
        self.setup = Some(SetupTask {
            stage: SetupStage::Acquiring,
            future: acquire_media(
                Arc::clone(&self.ctx.media),
                self.call_id,
                self.ctx.config.media,
            )
            .boxed(),
        });
        Ok(())
    }

    async fn event_loop(&mut self) -> Termination {
        loop {
            let outcome = tokio::select! {
                biased;

                request = self.end_rx.recv() => {
                    Some(self.hang_up(matches!(request, Some(EndRequest::Remote))))
                }
                step = poll_setup(&mut self.setup) => {
                    self.setup = None;
                    self.on_setup_step(step).await
                }
                event = recv_media(&mut self.media_events) => match event {
                    Some(event) => self.on_media_event(event).await,
                    None => {
                        self.media_events = None;
                        None
                    }
                },
                Some(command) = self.commands.recv() => self.on_command(command).await,
                _ = sleep_until_opt(self.grace_deadline) => self.on_grace_expired(),
                _ = sleep_until_opt(self.setup_deadline) => self.on_setup_timeout(),
            };

            if let Some(termination) = outcome {
                return termination;
            }
        }
    }

    // ------------------------------------------------------------------------
    // Setup
    // ------------------------------------------------------------------------

    async fn on_setup_step(&mut self, step: Result<SetupStep, CallError>) -> Option<Termination> {
        match step {
            Err(error) => Some(self.fail(error)),

            Ok(SetupStep::MediaReady(connection, media)) => {
                tracing::info!("Call {}: local media acquired ({})", self.call_id, media.id());
                media.set_muted(self.muted);
                self.engine = Some(connection.engine);
                self.media_events = Some(connection.events);
                self.local_media = Some(Arc::clone(&media));
                self.emit(CallEvent::LocalMedia {
                    call_id: self.call_id,
                    media,
                });
                if let Some(ready) = self.ready.take() {
                    let _ = ready.send(Ok(()));
                }
                self.start_negotiation();
                None
            }

            Ok(SetupStep::OfferPublished) => {
                tracing::debug!("Call {}: offer sent to {}", self.call_id, self.remote_user);
                self.offer_published = true;
                match self.early_answer.take() {
                    Some(sdp) => self.apply_answer(sdp).await,
                    None => None,
                }
            }

            Ok(SetupStep::AnswerPublished) => {
                tracing::debug!("Call {}: answer sent to {}", self.call_id, self.remote_user);
                self.remote_applied = true;
                self.set_state(SessionState::Connecting);
                self.flush_pending_candidates().await;
                self.peer_listening = true;
                self.flush_held_candidates().await;
                None
            }
        }
    }

    fn start_negotiation(&mut self) {
        let Some(engine) = self.engine.clone() else {
            return;
        };
        let bus = Arc::clone(&self.ctx.bus);
        let from = self.ctx.local_user.clone();
        let to = self.remote_user.clone();

        let future = match self.role {
            Role::Caller => {
                self.peer_aware = true;
                publish_offer(engine, bus, self.call_id, from, to).boxed()
            }
            Role::Callee => {
                let offer_sdp = self.remote_offer.take().unwrap_or_default();
                publish_answer(engine, bus, self.call_id, from, to, offer_sdp).boxed()
            }
        };

        self.setup = Some(SetupTask {
            stage: SetupStage::Negotiating,
            future,
        });
    }

    // ------------------------------------------------------------------------
    // Signaling
    // ------------------------------------------------------------------------

    async fn on_command(&mut self, command: SessionCommand) -> Option<Termination> {
        match command {
            SessionCommand::SetMuted(muted) => {
                self.muted = muted;
                if let Some(media) = &self.local_media {
                    media.set_muted(muted);
                }
                None
            }
            SessionCommand::Envelope(envelope) => self.on_envelope(envelope).await,
        }
    }

    async fn on_envelope(&mut self, envelope: SignalEnvelope) -> Option<Termination> {
        match (envelope.kind, self.role) {
            (SignalKind::Answer, Role::Caller) => {
                if self.remote_applied || self.early_answer.is_some() {
                    tracing::debug!("Call {}: duplicate answer ignored", self.call_id);
                    return None;
                }
                self.apply_answer(envelope.payload).await
            }
            (SignalKind::IceCandidate, _) => {
                self.on_remote_candidate(envelope.payload).await;
                None
            }
            (SignalKind::EndCall, _) => Some(self.hang_up(true)),
            (kind, role) => {
                tracing::debug!(
                    "Call {}: ignoring {:?} as {:?}",
                    self.call_id,
                    kind,
                    role
                );
                None
            }
        }
    }

    async fn apply_answer(&mut self, sdp: String) -> Option<Termination> {
        let engine = match &self.engine {
            Some(engine) if self.offer_published => Arc::clone(engine),
            _ => {
                self.early_answer = Some(sdp);
                return None;
            }
        };

        if let Err(e) = engine.set_remote_description(&sdp).await {
            return Some(self.fail(e.into()));
        }

        tracing::info!("Call {}: answer applied", self.call_id);
        self.remote_applied = true;
        self.set_state(SessionState::Connecting);
        self.flush_pending_candidates().await;
        self.peer_listening = true;
        self.flush_held_candidates().await;
        None
    }

    async fn on_remote_candidate(&mut self, candidate: String) {
        if !self.seen_candidates.insert(candidate.clone()) {
            tracing::debug!("Call {}: duplicate ICE candidate ignored", self.call_id);
            return;
        }

        if self.remote_applied {
            self.apply_candidate(&candidate).await;
        } else {
            tracing::debug!(
                "Call {}: buffering ICE candidate until remote description is set",
                self.call_id
            );
            self.pending_candidates.push(candidate);
        }
    }

    async fn apply_candidate(&mut self, candidate: &str) {
        let Some(engine) = self.engine.clone() else {
            return;
        };
        if let Err(e) = engine.add_ice_candidate(candidate).await {
            tracing::warn!("Call {}: failed to add ICE candidate: {}", self.call_id, e);
        }
    }

    async fn flush_pending_candidates(&mut self) {
        let pending = std::mem::take(&mut self.pending_candidates);
        if !pending.is_empty() {
            tracing::debug!(
                "Call {}: applying {} buffered ICE candidate(s)",
                self.call_id,
                pending.len()
            );
        }
        for candidate in pending {
            self.apply_candidate(&candidate).await;
        }
    }

    async fn send_candidate(&mut self, candidate: String) {
        let envelope = SignalEnvelope::ice_candidate(
            self.call_id,
            self.ctx.local_user.clone(),
            self.remote_user.clone(),
            candidate,
        );
        if let Err(e) = self.ctx.bus.publish(&envelope).await {
            tracing::warn!("Call {}: failed to send ICE candidate: {}", self.call_id, e);
        }
    }

    async fn flush_held_candidates(&mut self) {
        for candidate in std::mem::take(&mut self.held_candidates) {
            self.send_candidate(candidate).await;
        }
    }

    // ------------------------------------------------------------------------
    // Media Engine
    // ------------------------------------------------------------------------

    async fn on_media_event(&mut self, event: MediaEvent) -> Option<Termination> {
        match event {
            MediaEvent::IceCandidate(candidate) => {
                if self.peer_listening {
                    self.send_candidate(candidate).await;
                } else {
                    self.held_candidates.push(candidate);
                }
                None
            }
            MediaEvent::RemoteTrack(track) => {
                tracing::info!("Call {}: remote {:?} track", self.call_id, track.kind);
                self.remote_tracks.push(track.clone());
                self.emit(CallEvent::RemoteMedia {
                    call_id: self.call_id,
                    track,
                });
                None
            }
            MediaEvent::ConnectionState(state) => self.on_connection_state(state).await,
        }
    }

    async fn on_connection_state(&mut self, state: ConnectionState) -> Option<Termination> {
        let current = self.state();
        match state {
            ConnectionState::Connected => {
                if self.grace_deadline.take().is_some() {
                    tracing::info!("Call {}: connection recovered", self.call_id);
                }
                if matches!(
                    current,
                    SessionState::Negotiating | SessionState::Connecting
                ) {
                    self.activate().await;
                }
                None
            }
            ConnectionState::Disconnected => {
                if current == SessionState::Active && self.grace_deadline.is_none() {
                    tracing::warn!(
                        "Call {}: connection interrupted, waiting {:?} for recovery",
                        self.call_id,
                        self.ctx.config.reconnect_grace
                    );
                    self.grace_deadline = Some(Instant::now() + self.ctx.config.reconnect_grace);
                } else {
                    tracing::debug!("Call {}: disconnected while {}", self.call_id, current.as_str());
                }
                None
            }
            ConnectionState::Failed | ConnectionState::Closed => {
                let error = if self.reached_active {
                    CallError::ConnectionLost
                } else {
                    CallError::Media(format!("peer connection {:?}", state))
                };
                Some(self.fail(error))
            }
            ConnectionState::New | ConnectionState::Connecting => {
                tracing::debug!("Call {}: connection {:?}", self.call_id, state);
                None
            }
        }
    }

    async fn activate(&mut self) {
        self.reached_active = true;
        self.setup_deadline = None;
        self.set_state(SessionState::Active);

        if self.role == Role::Caller {
            let call_id = self.call_id;
            let answered_at = Utc::now();
            self.write_record(move |store| store.mark_active(&call_id, answered_at))
                .await;
        }
    }

    // ------------------------------------------------------------------------
    // Timer
    // ------------------------------------------------------------------------

    fn on_grace_expired(&mut self) -> Option<Termination> {
        self.grace_deadline = None;
        tracing::warn!("Call {}: connection did not recover", self.call_id);
        Some(self.fail(CallError::ConnectionLost))
    }

    fn on_setup_timeout(&mut self) -> Option<Termination> {
        self.setup_deadline = None;
        match self.state() {
            SessionState::Negotiating => {
                tracing::warn!("Call {}: no answer from {}", self.call_id, self.remote_user);
                self.emit(CallEvent::Error {
                    call_id: self.call_id,
                    error: CallError::SignalingUnreachable,
                });
                Some(Termination::local(TerminalReason::Missed))
            }
            _ => Some(self.fail(CallError::ConnectionLost)),
        }
    }

    // ------------------------------------------------------------------------
    // Ende
    // ------------------------------------------------------------------------

    fn hang_up(&mut self, remote: bool) -> Termination {
        tracing::info!(
            "Call {}: hung up by {}",
            self.call_id,
            if remote { "peer" } else { "local user" }
        );
        let reason = if self.reached_active {
            TerminalReason::Ended
        } else {
            TerminalReason::Missed
        };
        Termination {
            reason,
            remote_ended: remote,
        }
    }

    fn fail(&mut self, error: CallError) -> Termination {
        tracing::error!("Call {}: {}", self.call_id, error);
        if let Some(ready) = self.ready.take() {
            let _ = ready.send(Err(error.clone()));
        }
        self.emit(CallEvent::Error {
            call_id: self.call_id,
            error,
        });
        Termination::local(TerminalReason::Failed)
    }

    /// Einziger Weg nach `Terminated`, läuft genau einmal pro Session
    async fn finalize(&mut self, termination: Termination) {
        self.set_state(SessionState::Ending);
        self.grace_deadline = None;
        self.setup_deadline = None;

        if let Some(task) = self.setup.take() {
            self.release_setup(task);
        }

        if let Some(media) = self.local_media.take() {
            media.stop();
        }
        self.remote_tracks.clear();
        self.media_events = None;
        if let Some(engine) = self.engine.take() {
            engine.close().await;
        }

        if !termination.remote_ended && self.peer_aware {
            let envelope = SignalEnvelope::end_call(
                self.call_id,
                self.ctx.local_user.clone(),
                self.remote_user.clone(),
            );
            if let Err(e) = self.ctx.bus.publish(&envelope).await {
                tracing::warn!("Call {}: failed to send end call: {}", self.call_id, e);
            }
        }

        if let Err(e) = self.ctx.bus.unsubscribe(&Topic::Call(self.call_id)).await {
            tracing::warn!("Call {}: failed to unsubscribe: {}", self.call_id, e);
        }

        if self.role == Role::Caller {
            let status = match termination.reason {
                TerminalReason::Ended => CallStatus::Ended,
                TerminalReason::Failed => CallStatus::Failed,
                TerminalReason::Missed => CallStatus::Missed,
            };
            let call_id = self.call_id;
            let ended_at = Utc::now();
            self.write_record(move |store| store.finish(&call_id, status, ended_at))
                .await;
        }

        if let Some(ready) = self.ready.take() {
            let _ = ready.send(Err(CallError::SessionClosed));
        }

        self.set_state(SessionState::Terminated(termination.reason));
        self.ctx.registry.remove(&self.call_id);
    }

    /// Bricht den laufenden Setup-Schritt ab
    ///
    /// Eine laufende Medienbeschaffung wird zu Ende geführt und ihr
    /// Ergebnis sofort freigegeben, damit kein Mikrofon offen bleibt.
    fn release_setup(&self, task: SetupTask) {
        match task.stage {
            SetupStage::Acquiring => {
                let call_id = self.call_id;
                tokio::spawn(async move {
                    if let Ok(SetupStep::MediaReady(connection, media)) = task.future.await {
                        tracing::debug!(
                            "Call {}: releasing media acquired after hang-up",
                            call_id
                        );
                        media.stop();
                        connection.engine.close().await;
                    }
                });
            }
            SetupStage::Negotiating => drop(task),
        }
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    fn set_state(&mut self, state: SessionState) {
        let previous = self.state_tx.send_replace(state);
        if previous == state {
            return;
        }
        tracing::info!(
            "Call {}: {} -> {}",
            self.call_id,
            previous.as_str(),
            state.as_str()
        );
        self.emit(CallEvent::StateChanged {
            call_id: self.call_id,
            state,
        });
    }

    fn emit(&self, event: CallEvent) {
        // Fehler heißt nur: gerade kein Empfänger
        let _ = self.ctx.events.send(event);
    }

    /// Schreibt in den Record Store, ohne den Runtime-Thread zu blockieren
    ///
    /// Fehler brechen den Anruf nicht ab, sie werden nur gemeldet.
    async fn write_record<F>(&mut self, write: F)
    where
        F: FnOnce(&dyn CallRecordStore) -> Result<(), DatabaseError> + Send + 'static,
    {
        let store = Arc::clone(&self.ctx.store);
        let result = tokio::task::spawn_blocking(move || write(&*store))
            .await
            .unwrap_or_else(|e| Err(DatabaseError::WriteTask(e.to_string())));
        if let Err(e) = result {
            self.report_store_error(e);
        }
    }

    fn report_store_error(&self, error: DatabaseError) {
        tracing::warn!("Call {}: call record write failed: {}", self.call_id, error);
        self.emit(CallEvent::Error {
            call_id: self.call_id,
            error: error.into(),
        });
    }
}

async fn poll_setup(setup: &mut Option<SetupTask>) -> Result<SetupStep, CallError> {
    match setup {
        Some(task) => (&mut task.future).await,
        None => std::future::pending().await,
    }
}

async fn recv_media(events: &mut Option<mpsc::UnboundedReceiver<MediaEvent>>) -> Option<MediaEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

// ============================================================================
// TESTS
// ============================================================================
