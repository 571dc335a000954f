//! # Conversation Providers
//!
//! The three external collaborators of the conversation pipeline, each a
//! stateless request/response capability:
//!
//! - **SpeechToText**: `transcribe(audio) -> Transcript`
//! - **LanguageModel**: `complete(history) -> Completion`
//! - **TextToSpeech**: `synthesize(text) -> SpeechAudio`
//!
//! Backends are picked per capability from configuration when the server
//! starts (`Providers::from_config`). Retries, if any, belong to the backend.

pub mod loopback;
pub mod openai;

use crate::audio::AudioFormat;
use crate::config::{ProviderKind, ProvidersConfig};
use crate::session::Role;
use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Result of transcribing one turn of audio.
#[derive(Debug, Clone, PartialEq)]
pub struct Transcript {
    pub text: String,
    /// 0.0 to 1.0
    pub confidence: f32,
    pub is_final: bool,
}

/// One entry of the history sent to the language model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub usage: Option<TokenUsage>,
}

/// Synthesized reply audio.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeechAudio {
    pub audio: Vec<u8>,
    pub duration: Duration,
}

#[async_trait]
pub trait SpeechToText: Send + Sync {
    async fn transcribe(&self, audio: &[u8]) -> Result<Transcript>;

    /// Label used in logs and session metadata.
    fn name(&self) -> String;
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// `history` is the full conversation, oldest first.
    async fn complete(&self, history: &[ChatMessage]) -> Result<Completion>;

    fn name(&self) -> String;
}

#[async_trait]
pub trait TextToSpeech: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<SpeechAudio>;

    fn name(&self) -> String;
}

/// The backends one server instance talks to.
#[derive(Clone)]
pub struct Providers {
    pub stt: Arc<dyn SpeechToText>,
    pub llm: Arc<dyn LanguageModel>,
    pub tts: Arc<dyn TextToSpeech>,
}

impl std::fmt::Debug for Providers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Providers")
            .field("stt", &self.stt.name())
            .field("llm", &self.llm.name())
            .field("tts", &self.tts.name())
            .finish()
    }
}

/// Immutable record of which backends served a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderSnapshot {
    pub stt: String,
    pub llm: String,
    pub tts: String,
}

impl Providers {
    pub fn new(
        stt: Arc<dyn SpeechToText>,
        llm: Arc<dyn LanguageModel>,
        tts: Arc<dyn TextToSpeech>,
    ) -> Self {
        Self { stt, llm, tts }
    }

    /// Build every backend named in the configuration.
    ///
    /// Fails when a selected backend cannot be constructed (missing API key,
    /// unusable HTTP client). This is a startup error.
    pub fn from_config(config: &ProvidersConfig, format: AudioFormat) -> Result<Self> {
        let openai = if config.uses(ProviderKind::OpenAi) {
            Some(openai::OpenAiClient::from_config(&config.openai)?)
        } else {
            None
        };
        let openai_client = || {
            openai
                .clone()
                .ok_or_else(|| anyhow::anyhow!("OpenAI client was not initialized"))
        };

        let stt: Arc<dyn SpeechToText> = match config.stt {
            ProviderKind::OpenAi => Arc::new(openai::OpenAiTranscriber::new(
                openai_client()?,
                config.openai.stt_model.clone(),
                format,
            )),
            ProviderKind::Loopback => Arc::new(loopback::EnergyTranscriber::new(format)),
        };

        let llm: Arc<dyn LanguageModel> = match config.llm {
            ProviderKind::OpenAi => Arc::new(openai::OpenAiChat::new(
                openai_client()?,
                &config.openai,
            )),
            ProviderKind::Loopback => Arc::new(loopback::EchoModel::new()),
        };

        let tts: Arc<dyn TextToSpeech> = match config.tts {
            ProviderKind::OpenAi => Arc::new(openai::OpenAiSpeech::new(
                openai_client()?,
                config.openai.tts_model.clone(),
                config.openai.voice.clone(),
            )),
            ProviderKind::Loopback => Arc::new(loopback::ToneSynthesizer::new(format)),
        };

        Ok(Self::new(stt, llm, tts))
    }

    pub fn snapshot(&self) -> ProviderSnapshot {
        ProviderSnapshot {
            stt: self.stt.name(),
            llm: self.llm.name(),
            tts: self.tts.name(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    #[test]
    fn test_loopback_providers_from_default_config() {
        let config = AppConfig::default();
        let providers = Providers::from_config(&config.providers, AudioFormat::default()).unwrap();
        let snapshot = providers.snapshot();
        assert_eq!(snapshot.stt, "loopback-energy");
        assert_eq!(snapshot.llm, "loopback-echo");
        assert_eq!(snapshot.tts, "loopback-tone");
    }

    #[test]
    fn test_openai_without_key_is_a_startup_error() {
        let mut config = AppConfig::default();
        config.providers.stt = ProviderKind::OpenAi;
        assert!(Providers::from_config(&config.providers, AudioFormat::default()).is_err());
    }

    #[test]
    fn test_mixed_backends() {
        let mut config = AppConfig::default();
        config.providers.llm = ProviderKind::OpenAi;
        config.providers.openai.api_key = Some("sk-test".to_string());

        let providers = Providers::from_config(&config.providers, AudioFormat::default()).unwrap();
        let snapshot = providers.snapshot();
        assert_eq!(snapshot.stt, "loopback-energy");
        assert_eq!(snapshot.llm, "openai:gpt-4o-mini");
    }
}
