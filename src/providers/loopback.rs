//! Offline backends.
//!
//! They need no network and no credentials, so the server runs end to end on
//! a laptop: loud audio "transcribes" to a description of itself, the model
//! echoes the user, and replies are rendered as a short tone.

use super::{
    ChatMessage, Completion, LanguageModel, SpeechAudio, SpeechToText, TextToSpeech, Transcript,
};
use crate::audio::format::{decode_pcm16, encode_pcm16, rms_level};
use crate::audio::AudioFormat;
use crate::session::Role;
use anyhow::Result;
use async_trait::async_trait;
use std::f32::consts::PI;
use std::time::Duration;

/// RMS level treated as clearly audible speech (about -34 dBFS).
const SPEECH_RMS: f32 = 0.02;

/// Transcriber whose confidence tracks signal energy.
///
/// Silence yields confidence near zero, so the pipeline's confidence gate
/// behaves as it would with a real recognizer.
pub struct EnergyTranscriber {
    format: AudioFormat,
}

impl EnergyTranscriber {
    pub fn new(format: AudioFormat) -> Self {
        Self { format }
    }
}

#[async_trait]
impl SpeechToText for EnergyTranscriber {
    async fn transcribe(&self, audio: &[u8]) -> Result<Transcript> {
        let level = rms_level(&decode_pcm16(audio));
        let seconds = self.format.duration_of(audio.len()).as_secs_f32();

        Ok(Transcript {
            text: format!("[{:.1}s of speech]", seconds),
            confidence: (level / SPEECH_RMS).min(1.0),
            is_final: true,
        })
    }

    fn name(&self) -> String {
        "loopback-energy".to_string()
    }
}

/// Repeats the latest user message.
#[derive(Default)]
pub struct EchoModel;

impl EchoModel {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl LanguageModel for EchoModel {
    async fn complete(&self, history: &[ChatMessage]) -> Result<Completion> {
        let last = history
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("nothing");

        Ok(Completion {
            text: format!("You said: {}", last),
            usage: None,
        })
    }

    fn name(&self) -> String {
        "loopback-echo".to_string()
    }
}

/// Renders text as a 440 Hz tone, roughly as long as reading it aloud.
pub struct ToneSynthesizer {
    format: AudioFormat,
}

impl ToneSynthesizer {
    const FREQUENCY_HZ: f32 = 440.0;
    const AMPLITUDE: f32 = 0.2;
    const PER_WORD: Duration = Duration::from_millis(300);
    const MIN_DURATION: Duration = Duration::from_millis(200);

    pub fn new(format: AudioFormat) -> Self {
        Self { format }
    }

    fn duration_for(text: &str) -> Duration {
        let words = text.split_whitespace().count() as u32;
        (Self::PER_WORD * words).max(Self::MIN_DURATION)
    }
}

#[async_trait]
impl TextToSpeech for ToneSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<SpeechAudio> {
        let duration = Self::duration_for(text);
        let channels = self.format.channels as usize;
        let frames = self.format.bytes_for(duration) / self.format.frame_bytes().max(1);
        let rate = self.format.sample_rate as f32;

        let mut samples = Vec::with_capacity(frames * channels);
        for n in 0..frames {
            let value = (2.0 * PI * Self::FREQUENCY_HZ * n as f32 / rate).sin() * Self::AMPLITUDE;
            let sample = (value * i16::MAX as f32) as i16;
            samples.extend(std::iter::repeat(sample).take(channels));
        }

        let audio = encode_pcm16(&samples);
        Ok(SpeechAudio {
            duration: self.format.duration_of(audio.len()),
            audio,
        })
    }

    fn name(&self) -> String {
        "loopback-tone".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(amplitude: i16, samples: usize) -> Vec<u8> {
        let pcm: Vec<i16> = (0..samples)
            .map(|i| if i % 2 == 0 { amplitude } else { -amplitude })
            .collect();
        encode_pcm16(&pcm)
    }

    #[tokio::test]
    async fn test_silence_has_low_confidence() {
        let stt = EnergyTranscriber::new(AudioFormat::default());
        let result = stt.transcribe(&vec![0; 32_000]).await.unwrap();
        assert_eq!(result.confidence, 0.0);
        assert_eq!(result.text, "[1.0s of speech]");
    }

    #[tokio::test]
    async fn test_loud_audio_is_confident() {
        let stt = EnergyTranscriber::new(AudioFormat::default());
        let result = stt.transcribe(&tone(8_000, 16_000)).await.unwrap();
        assert_eq!(result.confidence, 1.0);
        assert!(result.is_final);
    }

    #[tokio::test]
    async fn test_echo_repeats_last_user_message() {
        let llm = EchoModel::new();
        let history = vec![
            ChatMessage { role: Role::User, content: "first".to_string() },
            ChatMessage { role: Role::Assistant, content: "You said: first".to_string() },
            ChatMessage { role: Role::User, content: "second".to_string() },
        ];
        let reply = llm.complete(&history).await.unwrap();
        assert_eq!(reply.text, "You said: second");
    }

    #[tokio::test]
    async fn test_tone_length_follows_word_count() {
        let tts = ToneSynthesizer::new(AudioFormat::default());

        let short = tts.synthesize("").await.unwrap();
        assert_eq!(short.duration, Duration::from_millis(200));
        assert_eq!(short.audio.len(), 6_400);

        let long = tts.synthesize("one two three four five").await.unwrap();
        assert_eq!(long.duration, Duration::from_millis(1500));
    }
}
