//! Konfiguration
//!
//! Alle Werte kommen aus Umgebungsvariablen und haben Defaults, damit
//! die App ohne Setup startet.

use crate::media::MediaConfig;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Default Signaling-Relay
pub const DEFAULT_SIGNALING_URL: &str = "https://call-app-signaling.questxen.workers.dev";

/// Wartezeit nach `Disconnected` bevor ein aktiver Anruf als gescheitert gilt
pub const DEFAULT_RECONNECT_GRACE: Duration = Duration::from_secs(10);

/// Maximale Zeit bis ein Anruf `Active` erreicht
pub const DEFAULT_SETUP_TIMEOUT: Duration = Duration::from_secs(45);

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid signaling URL '{url}': {reason}")]
    InvalidSignalingUrl { url: String, reason: String },

    #[error("Invalid value for {key}: '{value}'")]
    InvalidValue { key: &'static str, value: String },

    #[error("{0} is set but TURN_URL is missing")]
    IncompleteTurn(&'static str),
}

// ============================================================================
// CONFIG STRUCTS
// ============================================================================

/// Zeitlimits und Medien pro Anruf
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub reconnect_grace: Duration,
    pub setup_timeout: Duration,
    pub media: MediaConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reconnect_grace: DEFAULT_RECONNECT_GRACE,
            setup_timeout: DEFAULT_SETUP_TIMEOUT,
            media: MediaConfig::default(),
        }
    }
}

/// TURN-Server für Verbindungen hinter symmetrischem NAT
#[derive(Clone, PartialEq, Eq)]
pub struct TurnServer {
    pub url: String,
    pub username: String,
    pub credential: String,
}

impl std::fmt::Debug for TurnServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnServer")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("credential", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub signaling_url: String,
    /// `None` = App-Datenverzeichnis
    pub database_path: Option<PathBuf>,
    /// `None` = App-Datenverzeichnis
    pub key_path: Option<PathBuf>,
    pub session: SessionConfig,
    pub turn: Option<TurnServer>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            database_path: None,
            key_path: None,
            session: SessionConfig::default(),
            turn: None,
        }
    }
}

impl AppConfig {
    /// Liest die Konfiguration aus den Umgebungsvariablen
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `SIGNALING_URL` | Pulse-Relay |
    /// | `CALL_RECONNECT_GRACE_SECS` | 10 |
    /// | `CALL_SETUP_TIMEOUT_SECS` | 45 |
    /// | `CALL_VIDEO` | `false` |
    /// | `CALL_DB_PATH` | App-Datenverzeichnis |
    /// | `CALL_KEY_PATH` | App-Datenverzeichnis |
    /// | `TURN_URL`, `TURN_USERNAME`, `TURN_CREDENTIAL` | kein TURN |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = AppConfig::default();

        if let Some(url) = lookup("SIGNALING_URL") {
            config.signaling_url = url;
        }
        validate_signaling_url(&config.signaling_url)?;

        if let Some(value) = lookup("CALL_RECONNECT_GRACE_SECS") {
            config.session.reconnect_grace = parse_secs("CALL_RECONNECT_GRACE_SECS", &value)?;
        }
        if let Some(value) = lookup("CALL_SETUP_TIMEOUT_SECS") {
            config.session.setup_timeout = parse_secs("CALL_SETUP_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = lookup("CALL_VIDEO") {
            config.session.media.video = parse_bool("CALL_VIDEO", &value)?;
        }

        config.database_path = lookup("CALL_DB_PATH").map(PathBuf::from);
        config.key_path = lookup("CALL_KEY_PATH").map(PathBuf::from);

        config.turn = match lookup("TURN_URL") {
            Some(url) => Some(TurnServer {
                url,
                username: lookup("TURN_USERNAME").unwrap_or_default(),
                credential: lookup("TURN_CREDENTIAL").unwrap_or_default(),
            }),
            None if lookup("TURN_USERNAME").is_some() => {
                return Err(ConfigError::IncompleteTurn("TURN_USERNAME"))
            }
            None if lookup("TURN_CREDENTIAL").is_some() => {
                return Err(ConfigError::IncompleteTurn("TURN_CREDENTIAL"))
            }
            None => None,
        };

        Ok(config)
    }
}

fn validate_signaling_url(raw: &str) -> Result<(), ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidSignalingUrl {
        url: raw.to_string(),
        reason,
    };

    let parsed = url::Url::parse(raw).map_err(|e| invalid(e.to_string()))?;
    match parsed.scheme() {
        "http" | "https" | "ws" | "wss" => Ok(()),
        other => Err(invalid(format!("unsupported scheme '{}'", other))),
    }
}

fn parse_secs(key: &'static str, value: &str) -> Result<Duration, ConfigError> {
    match value.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Ok(Duration::from_secs(secs)),
        _ => Err(ConfigError::InvalidValue {
            key,
            value: value.to_string(),
        }),
    }
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            value: value.to_string(),
        }),
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults_without_env() {
        let config = load(&[]).unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.session.reconnect_grace, Duration::from_secs(10));
        assert!(config.session.media.audio);
        assert!(!config.session.media.video);
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("SIGNALING_URL", "wss://relay.example.org"),
            ("CALL_RECONNECT_GRACE_SECS", "3"),
            ("CALL_SETUP_TIMEOUT_SECS", "20"),
            ("CALL_VIDEO", "true"),
            ("CALL_DB_PATH", "/tmp/calls.db"),
        ])
        .unwrap();

        assert_eq!(config.signaling_url, "wss://relay.example.org");
        assert_eq!(config.session.reconnect_grace, Duration::from_secs(3));
        assert_eq!(config.session.setup_timeout, Duration::from_secs(20));
        assert!(config.session.media.video);
        assert_eq!(config.database_path, Some(PathBuf::from("/tmp/calls.db")));
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(matches!(
            load(&[("SIGNALING_URL", "not a url")]),
            Err(ConfigError::InvalidSignalingUrl { .. })
        ));
        assert!(matches!(
            load(&[("SIGNALING_URL", "ftp://relay.example.org")]),
            Err(ConfigError::InvalidSignalingUrl { .. })
        ));
        assert!(matches!(
            load(&[("CALL_RECONNECT_GRACE_SECS", "0")]),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            load(&[("CALL_VIDEO", "maybe")]),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_turn_server() {
        let config = load(&[
            ("TURN_URL", "turn:turn.example.org:3478"),
            ("TURN_USERNAME", "pulse"),
            ("TURN_CREDENTIAL", "secret"),
        ])
        .unwrap();
        let turn = config.turn.unwrap();
        assert_eq!(turn.username, "pulse");
        assert!(!format!("{:?}", turn).contains("secret"));

        assert!(matches!(
            load(&[("TURN_USERNAME", "pulse")]),
            Err(ConfigError::IncompleteTurn("TURN_USERNAME"))
        ));
    }
}
