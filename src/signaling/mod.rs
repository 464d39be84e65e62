//! Signaling Module - Envelope-Transport zwischen zwei Geräten
//!
//! Dieses Modul verwaltet:
//! - Die Envelope-Typen (Offer, Answer, ICE Candidate, EndCall)
//! - Den `SignalBus` Trait (Pub/Sub nach Topic)
//! - Eine In-Process-Implementierung und den WebSocket-Client zum Relay
//!

mod bus;
mod client;
mod local;
mod messages;

pub use bus::{EnvelopeSink, SignalBus, SignalingError};
pub use client::WebSocketSignalBus;
pub use local::{LocalSignalBus, LocalSignalHub};
pub use messages::*;
