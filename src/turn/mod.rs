//! # Turn Taking
//!
//! Everything that decides when a user has finished speaking:
//!
//! ## Key Components:
//! - **Turn Buffer** (`buffer`): size-bounded accumulator of audio fragments
//! - **Silence Timer** (`detector`): single-slot debounce that flushes after a quiet window
//! - **Turn Guard** (`guard`): single-flight gate over the conversation pipeline
//!
//! `TurnState` bundles the parts that must change together under one lock:
//! the listening flag, the live buffer and the pending timer.

pub mod buffer;
pub mod detector;
pub mod guard;

pub use buffer::{FlushedTurn, TurnBuffer};
pub use detector::{SilenceTimer, TimerTicket};
pub use guard::TurnGuard;

use crate::audio::AudioFormat;
use crate::config::TurnConfig;
use std::time::Duration;

/// Turn-taking parameters, resolved from configuration once at startup.
#[derive(Debug, Clone)]
pub struct TurnSettings {
    /// Quiet time after the last fragment before the turn is flushed
    pub silence_window: Duration,
    /// Shortest audio a silence-triggered flush will forward
    pub min_turn_duration: Duration,
    /// Memory ceiling for one turn buffer
    pub max_buffer_bytes: usize,
    /// Transcripts below this confidence are treated as noise
    pub min_confidence: f32,
    pub format: AudioFormat,
}

impl Default for TurnSettings {
    fn default() -> Self {
        Self::from(&TurnConfig::default())
    }
}

impl From<&TurnConfig> for TurnSettings {
    fn from(config: &TurnConfig) -> Self {
        Self {
            silence_window: Duration::from_millis(config.silence_window_ms),
            min_turn_duration: Duration::from_millis(config.min_turn_duration_ms),
            max_buffer_bytes: config.max_buffer_bytes,
            min_confidence: config.min_confidence,
            format: config.audio_format(),
        }
    }
}

/// Per-session processing state, minus the busy flag (see `TurnGuard`).
#[derive(Debug)]
pub struct TurnState {
    pub listening: bool,
    pub buffer: TurnBuffer,
    pub timer: SilenceTimer,
}

impl TurnState {
    pub fn new(settings: &TurnSettings) -> Self {
        Self {
            listening: false,
            buffer: TurnBuffer::new(settings.max_buffer_bytes, settings.format),
            timer: SilenceTimer::new(),
        }
    }

    /// Cancel the pending flush and drop any partial turn.
    pub fn reset(&mut self) {
        self.timer.cancel();
        self.buffer.discard();
        self.listening = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_from_default_config() {
        let settings = TurnSettings::default();
        assert_eq!(settings.silence_window, Duration::from_millis(2000));
        assert_eq!(settings.min_turn_duration, Duration::from_millis(500));
        assert_eq!(settings.max_buffer_bytes, 10 * 1024 * 1024);
        assert_eq!(settings.min_confidence, 0.5);
        assert_eq!(settings.format, AudioFormat::default());
    }

    #[tokio::test]
    async fn test_reset_clears_everything() {
        let settings = TurnSettings::default();
        let mut state = TurnState::new(&settings);
        state.listening = true;
        state.buffer.append(vec![0; 64]);
        state.timer.schedule(settings.silence_window, |_| {});

        state.reset();
        assert!(!state.listening);
        assert!(state.buffer.is_empty());
        assert!(!state.timer.is_pending());
    }
}
