//! # Audio Module
//!
//! Raw PCM handling shared by the turn buffer and the provider backends.
//!
//! ## Audio Format Requirements:
//! - **Sample Rate**: 16kHz by default (configurable)
//! - **Bit Depth**: 16-bit PCM
//! - **Channels**: Mono by default
//! - **Encoding**: Little-endian signed integers

pub mod format;

pub use format::AudioFormat;
