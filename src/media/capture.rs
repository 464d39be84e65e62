//! Mikrofon-Capture
//!
//! Öffnet das Standard-Eingabegerät über cpal. Das Öffnen ist der Punkt,
//! an dem fehlende Berechtigungen oder Hardware auffallen.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig, SupportedStreamConfigRange};
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Sample Rate (48kHz, passend zu Opus)
pub const SAMPLE_RATE: u32 = 48000;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum AudioError {
    #[error("No audio input device found")]
    NoInputDevice,

    #[error("Unsupported audio configuration: {0}")]
    UnsupportedConfig(String),

    #[error("Failed to build audio stream: {0}")]
    StreamBuildError(String),

    #[error("Failed to start audio stream: {0}")]
    StreamPlayError(String),
}

// ============================================================================
// AUDIO CAPTURE
// ============================================================================

/// Laufende Mikrofon-Aufnahme
pub struct AudioCapture {
    stream: Mutex<Option<Stream>>,
    is_muted: Arc<Mutex<bool>>,
    /// RMS-Pegel (0.0 - 1.0) für die UI
    input_level: Arc<Mutex<f32>>,
}

// cpal::Stream ist nicht Send; der Stream wird nur hinter dem Mutex
// angefasst und beim Stoppen gedroppt
unsafe impl Send for AudioCapture {}
unsafe impl Sync for AudioCapture {}

impl AudioCapture {
    /// Öffnet das Standard-Mikrofon und startet die Aufnahme
    pub fn start() -> Result<Self, AudioError> {
        let host = cpal::default_host();
        let device = host.default_input_device().ok_or(AudioError::NoInputDevice)?;
        let config = Self::find_best_input_config(&device)?;

        tracing::info!(
            "Starting audio capture: {} Hz, {} channels",
            config.sample_rate.0,
            config.channels
        );

        let is_muted = Arc::new(Mutex::new(false));
        let input_level = Arc::new(Mutex::new(0.0f32));

        let muted_clone = Arc::clone(&is_muted);
        let level_clone = Arc::clone(&input_level);
        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let level = if *muted_clone.lock() { 0.0 } else { rms(data) };
                    *level_clone.lock() = level;
                },
                |err| {
                    tracing::error!("Audio capture error: {}", err);
                },
                None,
            )
            .map_err(|e| AudioError::StreamBuildError(e.to_string()))?;

        stream
            .play()
            .map_err(|e| AudioError::StreamPlayError(e.to_string()))?;

        Ok(Self {
            stream: Mutex::new(Some(stream)),
            is_muted,
            input_level,
        })
    }

    /// Stoppt die Aufnahme (idempotent)
    pub fn stop(&self) {
        if self.stream.lock().take().is_some() {
            *self.input_level.lock() = 0.0;
            tracing::info!("Audio capture stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.stream.lock().is_some()
    }

    pub fn set_muted(&self, muted: bool) {
        *self.is_muted.lock() = muted;
        tracing::debug!("Audio muted: {}", muted);
    }

    pub fn is_muted(&self) -> bool {
        *self.is_muted.lock()
    }

    /// Aktueller Eingangspegel
    pub fn level(&self) -> f32 {
        *self.input_level.lock()
    }

    fn find_best_input_config(device: &Device) -> Result<StreamConfig, AudioError> {
        let configs = device
            .supported_input_configs()
            .map_err(|e| AudioError::UnsupportedConfig(e.to_string()))?;

        select_best_config(configs.collect())
    }
}

impl std::fmt::Debug for AudioCapture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioCapture")
            .field("running", &self.is_running())
            .field("muted", &self.is_muted())
            .finish()
    }
}

/// Wählt eine F32-Konfiguration, bevorzugt mit 48kHz
fn select_best_config(configs: Vec<SupportedStreamConfigRange>) -> Result<StreamConfig, AudioError> {
    let target_rate = cpal::SampleRate(SAMPLE_RATE);
    let float_configs: Vec<_> = configs
        .into_iter()
        .filter(|c| c.sample_format() == SampleFormat::F32)
        .collect();

    if let Some(config) = float_configs
        .iter()
        .find(|c| c.min_sample_rate() <= target_rate && c.max_sample_rate() >= target_rate)
    {
        return Ok(config.clone().with_sample_rate(target_rate).into());
    }

    float_configs
        .into_iter()
        .next()
        .map(|c| c.with_max_sample_rate().into())
        .ok_or_else(|| {
            AudioError::UnsupportedConfig("No f32 input configuration found".to_string())
        })
}

fn rms(data: &[f32]) -> f32 {
    if data.is_empty() {
        return 0.0;
    }
    let mean_square = data.iter().map(|s| s * s).sum::<f32>() / data.len() as f32;
    mean_square.sqrt().min(1.0)
}

// ============================================================================
// TESTS
// ============================================================================
