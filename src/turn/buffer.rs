//! # Turn Buffer
//!
//! Accumulates the raw audio fragments of one turn of user speech until the
//! silence detector (or an explicit end-of-utterance) flushes it.
//!
//! ## Key Features:
//! - **FIFO eviction**: memory is capped at `max_bytes`; the oldest fragments go first
//! - **Never emptied by eviction**: the newest fragment always survives
//! - **Detach on flush**: `flush()` swaps in a fresh buffer, so the audio handed
//!   to the pipeline is a snapshot nothing else can touch

use crate::audio::AudioFormat;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// What an append had to throw away to respect the memory ceiling.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AppendOutcome {
    /// Whole fragments dropped from the front of the buffer
    pub evicted_fragments: usize,
    /// Total bytes dropped, including any truncation of the new fragment
    pub evicted_bytes: usize,
    /// The new fragment alone exceeded the ceiling and lost its oldest bytes
    pub truncated: bool,
}

impl AppendOutcome {
    pub fn evicted_anything(&self) -> bool {
        self.evicted_bytes > 0
    }
}

/// The combined audio of one finished turn, detached from the live buffer.
#[derive(Debug, Clone)]
pub struct FlushedTurn {
    /// Identifier used to reference this audio from the conversation history
    pub id: String,
    /// Concatenated fragment bytes, oldest first
    pub audio: Vec<u8>,
    pub fragment_count: usize,
    /// Wall-clock time from the first fragment to the flush
    pub elapsed: Duration,
    /// Playback duration of `audio` in the session's PCM format
    pub audio_duration: Duration,
}

impl FlushedTurn {
    /// Wrap audio that did not come through a buffer (direct submissions).
    pub fn from_audio(audio: Vec<u8>, format: AudioFormat) -> Self {
        let audio_duration = format.duration_of(audio.len());
        Self {
            id: new_turn_id(),
            fragment_count: usize::from(!audio.is_empty()),
            audio,
            elapsed: Duration::ZERO,
            audio_duration,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.audio.is_empty()
    }
}

fn new_turn_id() -> String {
    format!("turn-{}", Uuid::new_v4())
}

/// Per-session accumulator of audio fragments with a hard byte ceiling.
///
/// ## Memory Management:
/// `total_bytes` is a running sum kept equal to the sum of the stored fragment
/// lengths and never above `max_bytes` once `append` returns.
#[derive(Debug)]
pub struct TurnBuffer {
    fragments: VecDeque<Vec<u8>>,
    total_bytes: usize,
    max_bytes: usize,
    format: AudioFormat,
    turn_started_at: Option<Instant>,
    last_fragment_at: Option<Instant>,
}

impl TurnBuffer {
    pub fn new(max_bytes: usize, format: AudioFormat) -> Self {
        Self {
            fragments: VecDeque::new(),
            total_bytes: 0,
            max_bytes: max_bytes.max(1),
            format,
            turn_started_at: None,
            last_fragment_at: None,
        }
    }

    /// Append one fragment, evicting the oldest fragments if the ceiling would be exceeded.
    ///
    /// ## Eviction Rules:
    /// 1. A fragment larger than the whole ceiling keeps only its newest `max_bytes` bytes
    /// 2. Older fragments are dropped front-first until the new one fits
    /// 3. The new fragment is never dropped, so the buffer is never emptied by eviction
    ///
    /// Empty fragments are ignored and do not move `last_fragment_at`.
    pub fn append(&mut self, mut fragment: Vec<u8>) -> AppendOutcome {
        let mut outcome = AppendOutcome::default();
        if fragment.is_empty() {
            return outcome;
        }

        if fragment.len() > self.max_bytes {
            let excess = fragment.len() - self.max_bytes;
            fragment.drain(..excess);
            outcome.truncated = true;
            outcome.evicted_bytes += excess;
        }

        while self.total_bytes + fragment.len() > self.max_bytes {
            match self.fragments.pop_front() {
                Some(oldest) => {
                    self.total_bytes -= oldest.len();
                    outcome.evicted_fragments += 1;
                    outcome.evicted_bytes += oldest.len();
                }
                None => break,
            }
        }

        let now = Instant::now();
        self.turn_started_at.get_or_insert(now);
        self.last_fragment_at = Some(now);
        self.total_bytes += fragment.len();
        self.fragments.push_back(fragment);

        outcome
    }

    /// Drain the buffer into a single detached turn.
    ///
    /// The buffer is replaced by a fresh empty one. Flushing an empty buffer
    /// returns `None` and changes nothing.
    pub fn flush(&mut self) -> Option<FlushedTurn> {
        if self.fragments.is_empty() {
            return None;
        }

        let detached = std::mem::replace(self, TurnBuffer::new(self.max_bytes, self.format));
        Some(detached.into_turn(Instant::now()))
    }

    /// Drop everything buffered without producing a turn.
    pub fn discard(&mut self) -> usize {
        let dropped = self.total_bytes;
        *self = TurnBuffer::new(self.max_bytes, self.format);
        dropped
    }

    fn into_turn(self, now: Instant) -> FlushedTurn {
        let elapsed = self
            .turn_started_at
            .map(|started| now.saturating_duration_since(started))
            .unwrap_or_default();
        let audio_duration = self.format.duration_of(self.total_bytes);
        let fragment_count = self.fragments.len();

        let mut audio = Vec::with_capacity(self.total_bytes);
        for fragment in self.fragments {
            audio.extend_from_slice(&fragment);
        }

        FlushedTurn {
            id: new_turn_id(),
            audio,
            fragment_count,
            elapsed,
            audio_duration,
        }
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn fragment_count(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    /// Playback duration of the buffered audio.
    pub fn audio_duration(&self) -> Duration {
        self.format.duration_of(self.total_bytes)
    }

    pub fn turn_started_at(&self) -> Option<Instant> {
        self.turn_started_at
    }

    pub fn last_fragment_at(&self) -> Option<Instant> {
        self.last_fragment_at
    }
}
