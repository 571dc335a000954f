//! # PCM Audio Format Helpers
//!
//! The relay never decodes compressed audio: clients stream raw little-endian
//! PCM and every component that needs to reason about "how much speech" works
//! from the byte count and the configured format.
//!
//! ## Key Functions:
//! - **Duration math**: bytes <-> playback time for a given format
//! - **Sample decoding**: raw bytes to 16-bit samples (byteorder)
//! - **Energy**: normalized RMS level used by the loopback transcriber
//! - **WAV wrapping**: raw PCM to a WAV container for HTTP speech-to-text APIs

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::time::Duration;

/// Format of the raw PCM stream sent by clients.
///
/// ## Defaults:
/// 16kHz, mono, 16-bit. That is 32,000 bytes for every second of audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_depth: u16,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            channels: 1,
            bit_depth: 16,
        }
    }
}

impl AudioFormat {
    pub fn new(sample_rate: u32, channels: u16, bit_depth: u16) -> Self {
        Self {
            sample_rate,
            channels,
            bit_depth,
        }
    }

    /// Size of one frame (one sample for every channel) in bytes.
    pub fn frame_bytes(&self) -> usize {
        self.channels as usize * (self.bit_depth as usize / 8)
    }

    pub fn bytes_per_second(&self) -> u64 {
        self.sample_rate as u64 * self.frame_bytes() as u64
    }

    /// Playback duration of `bytes` of audio in this format.
    ///
    /// ## Example:
    /// 48,000 bytes at 16kHz/16-bit/mono = 48,000 / 32,000 = 1.5 seconds
    pub fn duration_of(&self, bytes: usize) -> Duration {
        let per_second = self.bytes_per_second();
        if per_second == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(bytes as u64 * 1_000_000 / per_second)
    }

    /// Number of bytes needed to hold `duration` of audio, rounded down to a whole frame.
    pub fn bytes_for(&self, duration: Duration) -> usize {
        let raw = (self.bytes_per_second() as u128 * duration.as_micros() / 1_000_000) as usize;
        let frame = self.frame_bytes().max(1);
        raw - raw % frame
    }
}

/// Decode little-endian 16-bit PCM. A trailing odd byte is ignored.
pub fn decode_pcm16(data: &[u8]) -> Vec<i16> {
    let mut cursor = Cursor::new(data);
    let mut samples = Vec::with_capacity(data.len() / 2);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample);
    }
    samples
}

/// Encode samples as little-endian 16-bit PCM.
pub fn encode_pcm16(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        // Writing into a Vec cannot fail.
        let _ = out.write_i16::<LittleEndian>(sample);
    }
    out
}

/// Root-mean-square level of the samples, scaled to [0.0, 1.0].
pub fn rms_level(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f64 = samples
        .iter()
        .map(|&s| {
            let normalized = s as f64 / 32768.0;
            normalized * normalized
        })
        .sum();
    (sum_squares / samples.len() as f64).sqrt() as f32
}

/// Wrap raw 16-bit PCM in a WAV container.
///
/// HTTP transcription APIs want a file, not a bare sample stream.
pub fn encode_wav(format: AudioFormat, pcm: &[u8]) -> anyhow::Result<Vec<u8>> {
    if format.bit_depth != 16 {
        anyhow::bail!("WAV encoding supports 16-bit PCM only, got {}-bit", format.bit_depth);
    }
    let header = wav::Header::new(
        wav::WAV_FORMAT_PCM,
        format.channels,
        format.sample_rate,
        format.bit_depth,
    );
    let track = wav::BitDepth::Sixteen(decode_pcm16(pcm));
    let mut out = Cursor::new(Vec::with_capacity(pcm.len() + 44));
    wav::write(header, &track, &mut out)?;
    Ok(out.into_inner())
}
