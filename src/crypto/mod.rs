//! Crypto Module - Ed25519 Geräteschlüssel
//!
//! Dieses Modul verwaltet die kryptographische Identität des Geräts:
//! - Generierung eines Ed25519 Schlüssels beim ersten Start
//! - Persistente Speicherung des Private Keys
//! - Signierung der Frames an das Signaling-Relay
//!

mod keypair;

pub use keypair::{DeviceKey, KeyError};
