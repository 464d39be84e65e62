//! Session Registry
//!
//! Einziger geteilter Zustand über Anrufe hinweg. Wird nur beim Anlegen
//! und beim Beenden einer Session verändert.

use super::error::CallError;
use super::session::CallSessionHandle;
use super::types::CallId;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Wie viele beendete CallIds gemerkt werden
const FINISHED_CALLS_CAPACITY: usize = 256;

#[derive(Default)]
struct Sessions {
    live: HashMap<CallId, CallSessionHandle>,
    /// Zuletzt beendete Anrufe, älteste vorne
    finished: VecDeque<CallId>,
}

#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<Sessions>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registriert die Session, sofern das Gerät frei ist
    ///
    /// Prüfen und Einfügen passieren unter demselben Lock, zwei
    /// gleichzeitige Anrufe können also nicht beide durchkommen.
    pub fn insert_if_idle(&self, handle: CallSessionHandle) -> Result<(), CallError> {
        let mut sessions = self.sessions.lock();

        if sessions.live.contains_key(&handle.call_id())
            || sessions.finished.contains(&handle.call_id())
            || sessions.live.values().any(|s| !s.is_terminated())
        {
            return Err(CallError::AlreadyInCall);
        }

        sessions.live.insert(handle.call_id(), handle);
        Ok(())
    }

    pub fn get(&self, call_id: &CallId) -> Option<CallSessionHandle> {
        self.sessions.lock().live.get(call_id).cloned()
    }

    /// Entfernt die Session und merkt sich ihre ID als beendet
    ///
    /// Unbekannte IDs sind ein No-op.
    pub fn remove(&self, call_id: &CallId) -> Option<CallSessionHandle> {
        let mut sessions = self.sessions.lock();
        let removed = sessions.live.remove(call_id);
        if removed.is_some() {
            if sessions.finished.len() == FINISHED_CALLS_CAPACITY {
                sessions.finished.pop_front();
            }
            sessions.finished.push_back(*call_id);
            tracing::debug!("Session {} deregistered", call_id);
        }
        removed
    }

    /// Ob der Anruf hier schon gelaufen und beendet ist
    pub fn is_finished(&self, call_id: &CallId) -> bool {
        self.sessions.lock().finished.contains(call_id)
    }

    /// Die nicht beendete Session dieses Geräts, falls vorhanden
    pub fn current(&self) -> Option<CallSessionHandle> {
        self.sessions
            .lock()
            .live
            .values()
            .find(|s| !s.is_terminated())
            .cloned()
    }

    pub fn all(&self) -> Vec<CallSessionHandle> {
        self.sessions.lock().live.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().live.is_empty()
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.len())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
