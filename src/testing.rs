//! Scripted collaborators for tests.
//!
//! Each double returns a fixed result, can be slowed down or made to fail,
//! and counts its calls.

use crate::audio::format::encode_pcm16;
use crate::audio::AudioFormat;
use crate::providers::{
    ChatMessage, Completion, LanguageModel, Providers, SpeechAudio, SpeechToText, TextToSpeech,
    Transcript,
};
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Loud square-wave PCM of the given length in the default format.
pub fn speech(duration: Duration) -> Vec<u8> {
    let format = AudioFormat::default();
    let samples = format.bytes_for(duration) / 2;
    let pcm: Vec<i16> = (0..samples)
        .map(|i| if (i / 20) % 2 == 0 { 8_000 } else { -8_000 })
        .collect();
    encode_pcm16(&pcm)
}

pub fn scripted_providers(
    stt: Arc<ScriptedStt>,
    llm: Arc<ScriptedLlm>,
    tts: Arc<ScriptedTts>,
) -> Providers {
    Providers::new(stt, llm, tts)
}

async fn delay(latency: Duration) {
    if !latency.is_zero() {
        tokio::time::sleep(latency).await;
    }
}

pub struct ScriptedStt {
    text: String,
    confidence: f32,
    latency: Duration,
    fail: bool,
    calls: AtomicUsize,
}

impl ScriptedStt {
    pub fn new(text: &str, confidence: f32) -> Self {
        Self {
            text: text.to_string(),
            confidence,
            latency: Duration::ZERO,
            fail: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SpeechToText for ScriptedStt {
    async fn transcribe(&self, _audio: &[u8]) -> Result<Transcript> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        delay(self.latency).await;
        if self.fail {
            anyhow::bail!("scripted transcription failure");
        }
        Ok(Transcript {
            text: self.text.clone(),
            confidence: self.confidence,
            is_final: true,
        })
    }

    fn name(&self) -> String {
        "scripted-stt".to_string()
    }
}

pub struct ScriptedLlm {
    reply: String,
    latency: Duration,
    fail: bool,
    calls: AtomicUsize,
    last_history: Mutex<Vec<ChatMessage>>,
}

impl ScriptedLlm {
    pub fn new(reply: &str) -> Self {
        Self {
            reply: reply.to_string(),
            latency: Duration::ZERO,
            fail: false,
            calls: AtomicUsize::new(0),
            last_history: Mutex::new(Vec::new()),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// History passed to the most recent call.
    pub fn last_history(&self) -> Vec<ChatMessage> {
        self.last_history.lock().clone()
    }
}

#[async_trait]
impl LanguageModel for ScriptedLlm {
    async fn complete(&self, history: &[ChatMessage]) -> Result<Completion> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_history.lock() = history.to_vec();
        delay(self.latency).await;
        if self.fail {
            anyhow::bail!("scripted completion failure");
        }
        Ok(Completion {
            text: self.reply.clone(),
            usage: None,
        })
    }

    fn name(&self) -> String {
        "scripted-llm".to_string()
    }
}

pub struct ScriptedTts {
    fail: bool,
    calls: AtomicUsize,
}

impl ScriptedTts {
    pub fn new() -> Self {
        Self {
            fail: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TextToSpeech for ScriptedTts {
    async fn synthesize(&self, text: &str) -> Result<SpeechAudio> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            anyhow::bail!("scripted synthesis failure");
        }
        Ok(SpeechAudio {
            audio: text.as_bytes().to_vec(),
            duration: Duration::from_millis(100),
        })
    }

    fn name(&self) -> String {
        "scripted-tts".to_string()
    }
}
