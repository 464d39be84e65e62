//! CallSessionManager - Registry und Router für Anrufe
//!
//! Eine Instanz pro Gerät und angemeldetem Benutzer. Abonniert die
//! eigene Inbox auf dem SignalBus, verteilt eingehende Envelopes nach
//! CallId auf die Sessions und legt für neue Offers Callee-Sessions an.

use super::error::CallError;
use super::registry::SessionRegistry;
use super::session::{CallSession, CallSessionHandle, SessionContext};
use super::types::{CallEvent, CallId, UserId};
use crate::config::SessionConfig;
use crate::database::CallRecordStore;
use crate::media::MediaEngineFactory;
use crate::signaling::{SignalBus, SignalEnvelope, SignalKind, Topic};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Puffergröße für UI-Events
const EVENT_CHANNEL_CAPACITY: usize = 100;

pub struct CallSessionManager {
    ctx: SessionContext,
    router: Mutex<Option<JoinHandle<()>>>,
}

impl CallSessionManager {
    /// Abonniert die Inbox von `local_user` und startet den Router
    pub async fn start(
        local_user: UserId,
        bus: Arc<dyn SignalBus>,
        media: Arc<dyn MediaEngineFactory>,
        store: Arc<dyn CallRecordStore>,
        config: SessionConfig,
    ) -> Result<Self, CallError> {
        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let ctx = SessionContext {
            local_user: local_user.clone(),
            bus: Arc::clone(&bus),
            media,
            store,
            registry: SessionRegistry::new(),
            events,
            inbound: inbound_tx.clone(),
            config,
        };

        bus.subscribe(Topic::User(local_user.clone()), inbound_tx)
            .await?;

        let router_ctx = ctx.clone();
        let router = tokio::spawn(async move {
            while let Some(envelope) = inbound_rx.recv().await {
                route_envelope(&router_ctx, envelope).await;
            }
            tracing::debug!("Envelope router stopped");
        });

        tracing::info!("Call manager started for {}", local_user);
        Ok(Self {
            ctx,
            router: Mutex::new(Some(router)),
        })
    }

    pub fn local_user(&self) -> &UserId {
        &self.ctx.local_user
    }

    /// Empfänger für alle Lifecycle-Events
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.ctx.events.subscribe()
    }

    /// Startet einen ausgehenden Anruf
    ///
    /// Kehrt zurück, sobald die lokalen Medien bereitstehen. Offer und
    /// alles Weitere laufen asynchron in der Session.
    pub async fn place_call(&self, to: UserId) -> Result<CallId, CallError> {
        let call_id = CallId::new();
        let (session, handle, ready) = CallSession::caller(self.ctx.clone(), call_id, to.clone());

        self.ctx.registry.insert_if_idle(handle).map_err(|e| {
            tracing::warn!("Rejecting call to {}: {}", to, e);
            e
        })?;

        tracing::info!("Placing call {} to {}", call_id, to);
        tokio::spawn(session.run());

        match ready.await {
            Ok(Ok(())) => Ok(call_id),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(CallError::SessionClosed),
        }
    }

    /// Verarbeitet einen Envelope wie der Router
    pub async fn on_incoming_envelope(&self, envelope: SignalEnvelope) {
        route_envelope(&self.ctx, envelope).await;
    }

    /// Legt den laufenden Anruf auf; ohne Anruf ein No-op
    pub fn end_current_call(&self) -> Option<CallId> {
        let session = self.ctx.registry.current()?;
        session.end();
        Some(session.call_id())
    }

    pub fn session(&self, call_id: &CallId) -> Option<CallSessionHandle> {
        self.ctx.registry.get(call_id)
    }

    pub fn current_call(&self) -> Option<CallSessionHandle> {
        self.ctx.registry.current()
    }

    /// Beendet alle Sessions und stoppt den Router
    pub async fn shutdown(&self) {
        let sessions = self.ctx.registry.all();
        for session in &sessions {
            session.end();
        }
        for session in &sessions {
            session.wait_terminated().await;
        }

        let topic = Topic::User(self.ctx.local_user.clone());
        if let Err(e) = self.ctx.bus.unsubscribe(&topic).await {
            tracing::warn!("Failed to unsubscribe {}: {}", topic, e);
        }

        if let Some(router) = self.router.lock().take() {
            router.abort();
        }
        tracing::info!("Call manager for {} shut down", self.ctx.local_user);
    }
}

impl Drop for CallSessionManager {
    fn drop(&mut self) {
        if let Some(router) = self.router.lock().take() {
            router.abort();
        }
    }
}

impl std::fmt::Debug for CallSessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSessionManager")
            .field("local_user", &self.ctx.local_user)
            .field("registry", &self.ctx.registry)
            .finish()
    }
}

/// Stellt einen Envelope der passenden Session zu
async fn route_envelope(ctx: &SessionContext, envelope: SignalEnvelope) {
    // Eigene Envelopes kommen über den geteilten Call-Topic zurück
    if envelope.to_user_id != ctx.local_user {
        tracing::trace!(
            "Skipping {:?} addressed to {}",
            envelope.kind,
            envelope.to_user_id
        );
        return;
    }

    // Wiederholte Zustellung nach Anrufende, auch ein erneutes Offer
    if ctx.registry.is_finished(&envelope.call_id) {
        let stale = CallError::StaleEnvelope(envelope.call_id.to_string());
        tracing::debug!("Dropping {:?}: {}", envelope.kind, stale);
        return;
    }

    if let Some(session) = ctx.registry.get(&envelope.call_id) {
        tracing::debug!(
            "Call {}: {:?} from {}",
            envelope.call_id,
            envelope.kind,
            envelope.from_user_id
        );
        if session.deliver(envelope).is_err() {
            tracing::debug!("Call {}: session already finished", session.call_id());
        }
        return;
    }

    match envelope.kind {
        SignalKind::Offer => accept_offer(ctx, envelope).await,
        kind => {
            let stale = CallError::StaleEnvelope(envelope.call_id.to_string());
            tracing::debug!("Dropping {:?}: {}", kind, stale);
        }
    }
}

async fn accept_offer(ctx: &SessionContext, offer: SignalEnvelope) {
    let call_id = offer.call_id;
    let caller = offer.from_user_id.clone();
    let (session, handle) = CallSession::callee(ctx.clone(), offer);

    if ctx.registry.insert_if_idle(handle).is_err() {
        tracing::info!("Busy, rejecting call {} from {}", call_id, caller);
        let busy = SignalEnvelope::end_call(call_id, ctx.local_user.clone(), caller);
        if let Err(e) = ctx.bus.publish(&busy).await {
            tracing::warn!("Call {}: failed to reject: {}", call_id, e);
        }
        return;
    }

    tracing::info!("Incoming call {} from {}", call_id, caller);
    let _ = ctx.events.send(CallEvent::Incoming {
        call_id,
        from: caller,
    });
    tokio::spawn(session.run());
}

// ============================================================================
// TESTS
// ============================================================================
