//! Geräteschlüssel für das Signaling
//!
//! Jedes Gerät besitzt einen Ed25519-Schlüssel. Alle Frames an das
//! Signaling-Relay werden damit signiert, damit das Relay Publish und
//! Subscribe einem Gerät zuordnen kann.
//!
//! ## Verwendung
//! ```no_run
//! use pulse_calls::crypto::DeviceKey;
//! let key = DeviceKey::load_or_create(None)?;
//! let frame = serde_json::json!({ "type": "heartbeat", "timestamp": 1 });
//! let signature = key.sign_frame(&frame);
//! # Ok::<(), pulse_calls::crypto::KeyError>(())
//! ```

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Key file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to decode key: {0}")]
    Base64Decode(#[from] base64::DecodeError),

    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("Invalid public key")]
    InvalidPublicKey,
}

// ============================================================================
// DEVICE KEY
// ============================================================================

/// Ed25519-Schlüssel eines Geräts
#[derive(Clone)]
pub struct DeviceKey {
    signing_key: SigningKey,
}

impl DeviceKey {
    /// Lädt den Schlüssel oder erstellt einen neuen
    ///
    /// Ohne expliziten Pfad liegt er im App-Datenverzeichnis unter
    /// `keys/device.key`.
    pub fn load_or_create(path: Option<&Path>) -> Result<Self, KeyError> {
        let key_path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_key_path()?,
        };

        if key_path.exists() {
            tracing::info!("Loading device key from {:?}", key_path);
            Self::load_from_file(&key_path)
        } else {
            tracing::info!("Creating new device key at {:?}", key_path);
            let key = Self::generate();
            key.save_to_file(&key_path)?;
            Ok(key)
        }
    }

    /// Erzeugt einen neuen zufälligen Schlüssel
    pub fn generate() -> Self {
        let mut csprng = OsRng;
        Self {
            signing_key: SigningKey::generate(&mut csprng),
        }
    }

    fn load_from_file(path: &Path) -> Result<Self, KeyError> {
        let encoded = fs::read_to_string(path)?;
        let bytes = BASE64.decode(encoded.trim())?;
        let key_bytes: [u8; 32] =
            bytes
                .as_slice()
                .try_into()
                .map_err(|_| KeyError::InvalidLength {
                    expected: 32,
                    actual: bytes.len(),
                })?;

        Ok(Self {
            signing_key: SigningKey::from_bytes(&key_bytes),
        })
    }

    fn save_to_file(&self, path: &Path) -> Result<(), KeyError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, BASE64.encode(self.signing_key.to_bytes()))?;

        // Nur Owner darf lesen/schreiben
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        }

        Ok(())
    }

    fn default_key_path() -> Result<PathBuf, KeyError> {
        let proj_dirs =
            directories::ProjectDirs::from("com", "kaufm", "call-app").ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "Could not determine app data directory",
                )
            })?;

        Ok(proj_dirs.data_dir().join("keys").join("device.key"))
    }

    /// Public Key als Base64 (44 Zeichen)
    pub fn public_key_base64(&self) -> String {
        BASE64.encode(self.signing_key.verifying_key().to_bytes())
    }

    /// Signiert einen Frame
    ///
    /// Signiert wird der JSON-String aller Felder außer `signature`,
    /// rekursiv alphabetisch sortiert. Ergebnis ist Base64.
    pub fn sign_frame(&self, frame: &serde_json::Value) -> String {
        let canonical = canonical_json(frame);
        let signature: Signature = self.signing_key.sign(canonical.as_bytes());
        BASE64.encode(signature.to_bytes())
    }

    /// Prüft die Signatur eines Frames gegen einen Base64 Public Key
    pub fn verify_frame(
        public_key_base64: &str,
        frame: &serde_json::Value,
        signature_base64: &str,
    ) -> Result<bool, KeyError> {
        let key_bytes = BASE64.decode(public_key_base64)?;
        let key_bytes: [u8; 32] =
            key_bytes
                .as_slice()
                .try_into()
                .map_err(|_| KeyError::InvalidLength {
                    expected: 32,
                    actual: key_bytes.len(),
                })?;
        let verifying_key =
            VerifyingKey::from_bytes(&key_bytes).map_err(|_| KeyError::InvalidPublicKey)?;

        let sig_bytes = BASE64.decode(signature_base64)?;
        let signature = match Signature::from_slice(&sig_bytes) {
            Ok(s) => s,
            Err(_) => return Ok(false),
        };

        Ok(verifying_key
            .verify(canonical_json(frame).as_bytes(), &signature)
            .is_ok())
    }
}

impl std::fmt::Debug for DeviceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceKey")
            .field("public_key", &self.public_key_base64())
            .finish()
    }
}

/// Sortiert rekursiv nach Keys und entfernt `signature`
fn canonical_json(value: &serde_json::Value) -> String {
    fn sorted(value: &serde_json::Value) -> serde_json::Value {
        match value {
            serde_json::Value::Object(map) => {
                let mut keys: Vec<_> = map.keys().filter(|k| *k != "signature").collect();
                keys.sort();
                let mut out = serde_json::Map::new();
                for key in keys {
                    out.insert(key.clone(), sorted(&map[key]));
                }
                serde_json::Value::Object(out)
            }
            serde_json::Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(sorted).collect())
            }
            other => other.clone(),
        }
    }

    serde_json::to_string(&sorted(value)).unwrap_or_default()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_key_length() {
        let key = DeviceKey::generate();
        // 32 bytes = 44 Zeichen Base64
        assert_eq!(key.public_key_base64().len(), 44);
    }

    #[test]
    fn test_sign_and_verify_frame() {
        let key = DeviceKey::generate();
        let frame = serde_json::json!({
            "type": "publish",
            "peerId": "alice",
            "timestamp": 1234567890
        });

        let signature = key.sign_frame(&frame);
        assert_eq!(signature.len(), 88);
        assert!(DeviceKey::verify_frame(&key.public_key_base64(), &frame, &signature).unwrap());
    }

    #[test]
    fn test_signature_ignores_key_order_and_signature_field() {
        let key = DeviceKey::generate();
        let a = serde_json::json!({ "b": 2, "a": { "y": 1, "x": 0 } });
        let signature = key.sign_frame(&a);

        let mut b = serde_json::json!({ "a": { "x": 0, "y": 1 }, "b": 2 });
        b["signature"] = serde_json::Value::String(signature.clone());
        assert!(DeviceKey::verify_frame(&key.public_key_base64(), &b, &signature).unwrap());
    }

    #[test]
    fn test_tampered_frame_fails_verification() {
        let key = DeviceKey::generate();
        let frame = serde_json::json!({ "type": "subscribe", "topic": "user:alice" });
        let signature = key.sign_frame(&frame);

        let tampered = serde_json::json!({ "type": "subscribe", "topic": "user:bob" });
        assert!(!DeviceKey::verify_frame(&key.public_key_base64(), &tampered, &signature).unwrap());
    }

    #[test]
    fn test_load_or_create_persists_key() {
        let dir = std::env::temp_dir().join(format!("pulse-key-{}", uuid::Uuid::new_v4()));
        let path = dir.join("device.key");

        let created = DeviceKey::load_or_create(Some(&path)).unwrap();
        let loaded = DeviceKey::load_or_create(Some(&path)).unwrap();
        assert_eq!(created.public_key_base64(), loaded.public_key_base64());

        let _ = fs::remove_dir_all(dir);
    }
}
