//! Call Module - Anruf-Lebenszyklus
//!
//! Dieses Modul verwaltet:
//! - Die Zustandsmaschine eines Anrufs (`CallSession` als eigener Task)
//! - Die Registry aller Sessions eines Geräts
//! - Den Manager, der Envelopes vom SignalBus auf Sessions verteilt
//!

mod error;
mod manager;
mod registry;
mod session;
mod types;

pub use error::CallError;
pub use manager::CallSessionManager;
pub use registry::SessionRegistry;
pub use session::CallSessionHandle;
pub use types::{CallEvent, CallId, Role, SessionState, TerminalReason, UserId};
