//! # Configuration Management
//!
//! Loads application configuration from multiple sources:
//! - TOML configuration file (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Deployment overrides (HOST, PORT, OPENAI_API_KEY)
//! 2. Environment variables (APP_SERVER__PORT, APP_TURN__SILENCE_WINDOW_MS, ...)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! Nested keys are separated by a double underscore so that field names which
//! themselves contain underscores survive the mapping.

use crate::audio::AudioFormat;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;

/// Main application configuration that contains all settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub turn: TurnConfig,
    pub sessions: SessionsConfig,
    pub providers: ProvidersConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Turn-taking and audio accumulation settings.
///
/// ## Tuning guidelines:
/// - Shorter silence window: snappier replies, but users get cut off mid-sentence
/// - Higher min confidence: fewer phantom turns from background noise
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnConfig {
    /// Quiet time after the last fragment before a turn is flushed
    pub silence_window_ms: u64,
    /// Silence-triggered flushes shorter than this are discarded
    pub min_turn_duration_ms: u64,
    /// Per-session ceiling on buffered audio
    pub max_buffer_bytes: usize,
    /// Transcripts below this confidence never reach the language model
    pub min_confidence: f32,
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_depth: u16,
}

impl TurnConfig {
    pub fn audio_format(&self) -> AudioFormat {
        AudioFormat::new(self.sample_rate, self.channels, self.bit_depth)
    }
}

/// Session lifecycle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    /// Sessions with no activity for this long are destroyed by the sweep
    pub idle_timeout_secs: u64,
    /// How often the idle sweep runs
    pub sweep_interval_secs: u64,
    pub max_concurrent_sessions: usize,
    /// WebSocket ping interval
    pub heartbeat_interval_secs: u64,
    /// Close a socket that has been silent for this long
    pub client_timeout_secs: u64,
}

/// Which backend serves each capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// OpenAI-compatible HTTP API
    OpenAi,
    /// Offline backends for development and tests
    Loopback,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::OpenAi => write!(f, "openai"),
            ProviderKind::Loopback => write!(f, "loopback"),
        }
    }
}

/// Provider selection plus the settings each backend needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    pub stt: ProviderKind,
    pub llm: ProviderKind,
    pub tts: ProviderKind,
    pub openai: OpenAiConfig,
}

impl ProvidersConfig {
    pub fn uses(&self, kind: ProviderKind) -> bool {
        self.stt == kind || self.llm == kind || self.tts == kind
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct OpenAiConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub stt_model: String,
    pub llm_model: String,
    pub tts_model: String,
    pub voice: String,
    pub system_prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub request_timeout_secs: u64,
}

// Keep the key out of logs.
impl fmt::Debug for OpenAiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAiConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .field("stt_model", &self.stt_model)
            .field("llm_model", &self.llm_model)
            .field("tts_model", &self.tts_model)
            .field("voice", &self.voice)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

/// Default configuration values.
///
/// The application starts with no config file at all: loopback providers,
/// a 2 second silence window and a 30 minute idle timeout.
impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            turn: TurnConfig::default(),
            sessions: SessionsConfig {
                idle_timeout_secs: 30 * 60,
                sweep_interval_secs: 60,
                max_concurrent_sessions: 100,
                heartbeat_interval_secs: 30,
                client_timeout_secs: 60,
            },
            providers: ProvidersConfig {
                stt: ProviderKind::Loopback,
                llm: ProviderKind::Loopback,
                tts: ProviderKind::Loopback,
                openai: OpenAiConfig {
                    api_key: None,
                    base_url: "https://api.openai.com/v1".to_string(),
                    stt_model: "whisper-1".to_string(),
                    llm_model: "gpt-4o-mini".to_string(),
                    tts_model: "tts-1".to_string(),
                    voice: "alloy".to_string(),
                    system_prompt: "You are a helpful voice assistant. Keep answers short and conversational."
                        .to_string(),
                    temperature: 0.7,
                    max_tokens: 300,
                    request_timeout_secs: 30,
                },
            },
        }
    }
}

impl Default for TurnConfig {
    fn default() -> Self {
        let format = AudioFormat::default();
        Self {
            silence_window_ms: 2000,
            min_turn_duration_ms: 500,
            max_buffer_bytes: 10 * 1024 * 1024, // 10 MiB
            min_confidence: 0.5,
            sample_rate: format.sample_rate,
            channels: format.channels,
            bit_depth: format.bit_depth,
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__HOST=0.0.0.0`: Override server host
    /// - `APP_TURN__SILENCE_WINDOW_MS=1500`: Shorter silence window
    /// - `APP_PROVIDERS__STT=openai`: Use the HTTP transcriber
    /// - `HOST`, `PORT`, `OPENAI_API_KEY`: Special cases for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        if let Ok(key) = env::var("OPENAI_API_KEY") {
            settings = settings.set_override("providers.openai.api_key", key)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## Why validate:
    /// A missing API key or a zero-length silence window is a configuration
    /// error. The server refuses to start instead of failing on the first turn.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.turn.silence_window_ms == 0 {
            return Err(anyhow::anyhow!("Silence window must be greater than 0"));
        }

        if self.turn.max_buffer_bytes == 0 {
            return Err(anyhow::anyhow!("Turn buffer ceiling must be greater than 0"));
        }

        if !(0.0..=1.0).contains(&self.turn.min_confidence) {
            return Err(anyhow::anyhow!(
                "Minimum confidence must be within [0, 1], got {}",
                self.turn.min_confidence
            ));
        }

        if self.turn.sample_rate == 0 || self.turn.channels == 0 {
            return Err(anyhow::anyhow!("Sample rate and channel count must be greater than 0"));
        }

        if self.turn.bit_depth != 16 {
            return Err(anyhow::anyhow!(
                "Only 16-bit PCM is supported, got {}-bit",
                self.turn.bit_depth
            ));
        }

        if self.sessions.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.sessions.idle_timeout_secs == 0 || self.sessions.sweep_interval_secs == 0 {
            return Err(anyhow::anyhow!("Idle timeout and sweep interval must be greater than 0"));
        }

        if self.sessions.heartbeat_interval_secs == 0
            || self.sessions.client_timeout_secs <= self.sessions.heartbeat_interval_secs
        {
            return Err(anyhow::anyhow!(
                "Client timeout must be longer than a non-zero heartbeat interval"
            ));
        }

        if self.providers.uses(ProviderKind::OpenAi) {
            let has_key = self
                .providers
                .openai
                .api_key
                .as_deref()
                .is_some_and(|key| !key.trim().is_empty());
            if !has_key {
                return Err(anyhow::anyhow!(
                    "OpenAI provider selected but no API key configured (set OPENAI_API_KEY)"
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.sessions.idle_timeout_secs, 1800);
        assert_eq!(config.sessions.sweep_interval_secs, 60);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.turn.min_confidence = 1.5;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.turn.bit_depth = 24;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_openai_requires_api_key() {
        let mut config = AppConfig::default();
        config.providers.llm = ProviderKind::OpenAi;
        assert!(config.validate().is_err());

        config.providers.openai.api_key = Some("   ".to_string());
        assert!(config.validate().is_err());

        config.providers.openai.api_key = Some("sk-test".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_debug_redacts_api_key() {
        let mut config = AppConfig::default();
        config.providers.openai.api_key = Some("sk-secret".to_string());
        let printed = format!("{:?}", config);
        assert!(!printed.contains("sk-secret"));
        assert!(printed.contains("<redacted>"));
    }

    #[test]
    fn test_provider_kind_names() {
        assert_eq!(ProviderKind::OpenAi.to_string(), "openai");
        let parsed: ProviderKind = serde_json::from_str("\"loopback\"").unwrap();
        assert_eq!(parsed, ProviderKind::Loopback);
        let parsed: ProviderKind = serde_json::from_str("\"openai\"").unwrap();
        assert_eq!(parsed, ProviderKind::OpenAi);
    }
}
