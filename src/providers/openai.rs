//! OpenAI-compatible HTTP backends.
//!
//! Works against api.openai.com or any server exposing the same
//! `/audio/transcriptions`, `/chat/completions` and `/audio/speech` routes.

use super::{
    ChatMessage, Completion, LanguageModel, SpeechAudio, SpeechToText, TextToSpeech, TokenUsage,
    Transcript,
};
use crate::audio::{format::encode_wav, AudioFormat};
use crate::config::OpenAiConfig;
use crate::session::Role;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// `/audio/speech` with `response_format = "pcm"` returns 24kHz 16-bit mono.
const SPEECH_PCM_FORMAT: AudioFormat = AudioFormat {
    sample_rate: 24000,
    channels: 1,
    bit_depth: 16,
};

/// Shared HTTP client and credentials.
#[derive(Clone)]
pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl OpenAiClient {
    pub fn from_config(config: &OpenAiConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .context("OpenAI API key is required")?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    /// Turn a non-2xx response into an error carrying the body text.
    async fn check(response: reqwest::Response, what: &str) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!("{} request failed with {}: {}", what, status, body.trim())
    }
}

// ── Speech to text ───────────────────────────────────────────────

pub struct OpenAiTranscriber {
    client: OpenAiClient,
    model: String,
    format: AudioFormat,
}

impl OpenAiTranscriber {
    pub fn new(client: OpenAiClient, model: String, format: AudioFormat) -> Self {
        Self {
            client,
            model,
            format,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
    #[serde(default)]
    segments: Vec<TranscriptionSegment>,
}

#[derive(Debug, Deserialize)]
struct TranscriptionSegment {
    avg_logprob: f32,
    no_speech_prob: f32,
}

/// Average per-segment probability of the decoded tokens, discounted by the
/// model's own estimate that the segment held no speech.
fn segment_confidence(response: &TranscriptionResponse) -> f32 {
    if response.segments.is_empty() {
        return if response.text.trim().is_empty() { 0.0 } else { 1.0 };
    }
    let total: f32 = response
        .segments
        .iter()
        .map(|s| s.avg_logprob.exp().clamp(0.0, 1.0) * (1.0 - s.no_speech_prob.clamp(0.0, 1.0)))
        .sum();
    total / response.segments.len() as f32
}

#[async_trait]
impl SpeechToText for OpenAiTranscriber {
    async fn transcribe(&self, audio: &[u8]) -> Result<Transcript> {
        let wav = encode_wav(self.format, audio)?;
        let file = reqwest::multipart::Part::bytes(wav)
            .file_name("turn.wav")
            .mime_str("audio/wav")?;
        let form = reqwest::multipart::Form::new()
            .part("file", file)
            .text("model", self.model.clone())
            .text("response_format", "verbose_json");

        tracing::debug!(
            model = %self.model,
            bytes = audio.len(),
            "Sending audio for transcription"
        );

        let response = self
            .client
            .http
            .post(self.client.url("audio/transcriptions"))
            .bearer_auth(&self.client.api_key)
            .multipart(form)
            .send()
            .await
            .context("Transcription request failed")?;
        let response = OpenAiClient::check(response, "Transcription").await?;
        let body: TranscriptionResponse = response
            .json()
            .await
            .context("Invalid transcription response")?;

        Ok(Transcript {
            confidence: segment_confidence(&body),
            text: body.text.trim().to_string(),
            is_final: true,
        })
    }

    fn name(&self) -> String {
        format!("openai:{}", self.model)
    }
}

// ── Chat completion ──────────────────────────────────────────────

pub struct OpenAiChat {
    client: OpenAiClient,
    model: String,
    system_prompt: String,
    temperature: f32,
    max_tokens: u32,
}

impl OpenAiChat {
    pub fn new(client: OpenAiClient, config: &OpenAiConfig) -> Self {
        Self {
            client,
            model: config.llm_model.clone(),
            system_prompt: config.system_prompt.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        }
    }

    fn request_messages<'a>(&'a self, history: &'a [ChatMessage]) -> Vec<ChatRequestMessage<'a>> {
        let mut messages = Vec::with_capacity(history.len() + 1);
        if !self.system_prompt.trim().is_empty() {
            messages.push(ChatRequestMessage {
                role: "system",
                content: &self.system_prompt,
            });
        }
        messages.extend(history.iter().map(|m| ChatRequestMessage {
            role: match m.role {
                Role::User => "user",
                Role::Assistant => "assistant",
            },
            content: &m.content,
        }));
        messages
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatRequestMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatRequestMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

#[async_trait]
impl LanguageModel for OpenAiChat {
    async fn complete(&self, history: &[ChatMessage]) -> Result<Completion> {
        let request = ChatRequest {
            model: &self.model,
            messages: self.request_messages(history),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        let response = self
            .client
            .http
            .post(self.client.url("chat/completions"))
            .bearer_auth(&self.client.api_key)
            .json(&request)
            .send()
            .await
            .context("Chat completion request failed")?;
        let response = OpenAiClient::check(response, "Chat completion").await?;
        let body: ChatResponse = response
            .json()
            .await
            .context("Invalid chat completion response")?;

        let text = body
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|content| content.trim().to_string())
            .filter(|content| !content.is_empty())
            .context("Chat completion returned no content")?;

        Ok(Completion {
            text,
            usage: body.usage.map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            }),
        })
    }

    fn name(&self) -> String {
        format!("openai:{}", self.model)
    }
}

// ── Text to speech ───────────────────────────────────────────────

pub struct OpenAiSpeech {
    client: OpenAiClient,
    model: String,
    voice: String,
}

impl OpenAiSpeech {
    pub fn new(client: OpenAiClient, model: String, voice: String) -> Self {
        Self {
            client,
            model,
            voice,
        }
    }
}

#[derive(Debug, Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    voice: &'a str,
    input: &'a str,
    response_format: &'static str,
}

#[async_trait]
impl TextToSpeech for OpenAiSpeech {
    async fn synthesize(&self, text: &str) -> Result<SpeechAudio> {
        let request = SpeechRequest {
            model: &self.model,
            voice: &self.voice,
            input: text,
            response_format: "pcm",
        };

        let response = self
            .client
            .http
            .post(self.client.url("audio/speech"))
            .bearer_auth(&self.client.api_key)
            .json(&request)
            .send()
            .await
            .context("Speech request failed")?;
        let response = OpenAiClient::check(response, "Speech").await?;
        let audio = response.bytes().await.context("Failed to read speech audio")?.to_vec();

        Ok(SpeechAudio {
            duration: SPEECH_PCM_FORMAT.duration_of(audio.len()),
            audio,
        })
    }

    fn name(&self) -> String {
        format!("openai:{}:{}", self.model, self.voice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    fn client() -> OpenAiClient {
        let mut config = AppConfig::default().providers.openai;
        config.api_key = Some("sk-test".to_string());
        config.base_url = "http://localhost:9999/v1/".to_string();
        OpenAiClient::from_config(&config).unwrap()
    }

    #[test]
    fn test_url_joins_without_double_slash() {
        assert_eq!(
            client().url("chat/completions"),
            "http://localhost:9999/v1/chat/completions"
        );
    }

    #[test]
    fn test_missing_key_is_rejected() {
        let config = AppConfig::default().providers.openai;
        assert!(OpenAiClient::from_config(&config).is_err());
    }

    #[test]
    fn test_segment_confidence() {
        let confident: TranscriptionResponse = serde_json::from_str(
            r#"{"text":"hello there","segments":[{"avg_logprob":0.0,"no_speech_prob":0.0}]}"#,
        )
        .unwrap();
        assert!((segment_confidence(&confident) - 1.0).abs() < 1e-6);

        let noise: TranscriptionResponse = serde_json::from_str(
            r#"{"text":"uh","segments":[{"avg_logprob":-2.0,"no_speech_prob":0.9}]}"#,
        )
        .unwrap();
        assert!(segment_confidence(&noise) < 0.05);

        let plain: TranscriptionResponse = serde_json::from_str(r#"{"text":"  "}"#).unwrap();
        assert_eq!(segment_confidence(&plain), 0.0);
    }

    #[test]
    fn test_chat_messages_include_system_prompt() {
        let mut config = AppConfig::default().providers.openai;
        config.system_prompt = "Be brief.".to_string();
        let chat = OpenAiChat::new(client(), &config);

        let history = vec![
            ChatMessage { role: Role::User, content: "hi".to_string() },
            ChatMessage { role: Role::Assistant, content: "hello".to_string() },
        ];
        let request = ChatRequest {
            model: &chat.model,
            messages: chat.request_messages(&history),
            temperature: chat.temperature,
            max_tokens: chat.max_tokens,
        };
        let json = serde_json::to_value(&request).unwrap();
        let roles: Vec<_> = json["messages"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["role"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(roles, vec!["system", "user", "assistant"]);
        assert_eq!(json["messages"][0]["content"], "Be brief.");
    }

    #[test]
    fn test_speech_duration_uses_24khz_pcm() {
        assert_eq!(SPEECH_PCM_FORMAT.duration_of(48_000), Duration::from_secs(1));
    }
}
