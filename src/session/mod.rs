//! # Conversation Sessions
//!
//! A session is one conversation: its ordered message history, its turn-taking
//! state and the channel its events are delivered through.
//!
//! ## Session Lifecycle:
//! 1. **Created**: first `join` for an id (or a generated UUID)
//! 2. **Active**: every join, fragment and completed turn refreshes `last_activity`
//! 3. **Detached**: the socket went away; history survives and the client may rejoin
//! 4. **Destroyed**: idle sweep or explicit destroy; timers cancelled, late results discarded
//!
//! ## Thread Safety:
//! A `Session` is shared as `Arc<Session>` between the socket actor, timer
//! tasks and pipeline tasks. Each field that changes has its own
//! `parking_lot` lock, and no method holds two of them at once.

pub mod registry;

pub use registry::SessionRegistry;

use crate::pipeline::PipelineStage;
use crate::providers::{ChatMessage, ProviderSnapshot};
use crate::turn::{TurnBuffer, TurnGuard, TurnSettings, TurnState};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize, Serializer};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One entry in a conversation. Never modified after it is appended.
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub id: Uuid,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Id of the flushed turn the user spoke, when the message came from audio
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_reference: Option<String>,
}

impl Message {
    pub fn user(content: impl Into<String>, audio_reference: Option<String>) -> Self {
        Self::new(Role::User, content.into(), audio_reference)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content.into(), None)
    }

    fn new(role: Role, content: String, audio_reference: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            content,
            timestamp: Utc::now(),
            audio_reference,
        }
    }
}

/// Everything the relay tells a client.
///
/// Serialized as JSON text frames tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum SessionEvent {
    #[serde(rename = "joined")]
    Joined {
        session_id: String,
        message_count: usize,
    },

    #[serde(rename = "listening_state")]
    ListeningState { session_id: String, listening: bool },

    /// A flushed turn got past the single-flight guard
    #[serde(rename = "turn_accepted")]
    TurnAccepted {
        session_id: String,
        turn_id: String,
        audio_bytes: usize,
        duration_ms: u64,
    },

    #[serde(rename = "transcription")]
    Transcription {
        session_id: String,
        text: String,
        confidence: f32,
        is_final: bool,
    },

    #[serde(rename = "completion")]
    Completion { session_id: String, text: String },

    /// Synthesized reply, base64 encoded PCM
    #[serde(rename = "audio")]
    Audio {
        session_id: String,
        #[serde(serialize_with = "as_base64")]
        data: Vec<u8>,
        duration_ms: u64,
    },

    #[serde(rename = "error")]
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        code: String,
        message: String,
    },

    #[serde(rename = "session_timeout")]
    SessionTimeout { session_id: String },

    #[serde(rename = "session_closed")]
    SessionClosed { session_id: String },
}

impl SessionEvent {
    /// The session is gone after this event; the client should forget it.
    pub fn ends_session(&self) -> bool {
        matches!(
            self,
            SessionEvent::SessionTimeout { .. } | SessionEvent::SessionClosed { .. }
        )
    }
}

fn as_base64<T: AsRef<[u8]>, S: Serializer>(data: &T, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&BASE64.encode(data.as_ref()))
}

/// Where a session's events go. Owned by the connected socket.
pub type EventSink = mpsc::UnboundedSender<SessionEvent>;

#[derive(Debug, Clone, Copy)]
struct Activity {
    at: Instant,
    wall: DateTime<Utc>,
}

impl Activity {
    fn now() -> Self {
        Self {
            at: Instant::now(),
            wall: Utc::now(),
        }
    }
}

/// Admin view of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub message_count: usize,
    pub listening: bool,
    pub busy: bool,
    pub stage: PipelineStage,
    pub connected: bool,
    pub buffered: BufferedTurn,
}

/// The turn currently being accumulated.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BufferedTurn {
    pub bytes: usize,
    pub fragments: usize,
    pub audio_ms: u64,
    /// Since the first fragment of the turn
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age_ms: Option<u64>,
    /// Since the newest fragment; the silence timer flushes once this
    /// reaches the silence window
    #[serde(skip_serializing_if = "Option::is_none")]
    pub silent_for_ms: Option<u64>,
}

impl BufferedTurn {
    fn of(buffer: &TurnBuffer, now: Instant) -> Self {
        let since = |at: Instant| now.saturating_duration_since(at).as_millis() as u64;
        Self {
            bytes: buffer.total_bytes(),
            fragments: buffer.fragment_count(),
            audio_ms: buffer.audio_duration().as_millis() as u64,
            age_ms: buffer.turn_started_at().map(since),
            silent_for_ms: buffer.last_fragment_at().map(since),
        }
    }
}

/// Summary plus the full history and backend snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct SessionDetail {
    #[serde(flatten)]
    pub summary: SessionSummary,
    pub provider_config: ProviderSnapshot,
    pub history: Vec<Message>,
}

/// Conversation state for one session id.
pub struct Session {
    pub id: String,
    pub created_at: DateTime<Utc>,
    /// Which backends this session talks to, fixed at creation
    pub provider_config: ProviderSnapshot,
    activity: Mutex<Activity>,
    history: RwLock<Vec<Message>>,
    turn: Mutex<TurnState>,
    guard: TurnGuard,
    stage: Mutex<PipelineStage>,
    sink: Mutex<Option<EventSink>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .field("message_count", &self.message_count())
            .field("busy", &self.is_busy())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Session {
    pub fn new(id: String, settings: &TurnSettings, provider_config: ProviderSnapshot) -> Self {
        let activity = Activity::now();
        Self {
            id,
            created_at: activity.wall,
            provider_config,
            activity: Mutex::new(activity),
            history: RwLock::new(Vec::new()),
            turn: Mutex::new(TurnState::new(settings)),
            guard: TurnGuard::new(),
            stage: Mutex::new(PipelineStage::Idle),
            sink: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    // ── Activity ─────────────────────────────────────────────────

    pub fn touch(&self) {
        *self.activity.lock() = Activity::now();
    }

    /// Time since the last interaction, measured against `now`.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.activity.lock().at)
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.activity.lock().wall
    }

    // ── History ──────────────────────────────────────────────────

    pub fn append_message(&self, message: Message) {
        self.history.write().push(message);
    }

    pub fn history(&self) -> Vec<Message> {
        self.history.read().clone()
    }

    pub fn message_count(&self) -> usize {
        self.history.read().len()
    }

    /// History in the shape the language model takes.
    pub fn chat_history(&self) -> Vec<ChatMessage> {
        self.history
            .read()
            .iter()
            .map(|m| ChatMessage {
                role: m.role,
                content: m.content.clone(),
            })
            .collect()
    }

    // ── Turn taking ──────────────────────────────────────────────

    /// Lock the listening flag, buffer and timer together.
    pub fn turn(&self) -> MutexGuard<'_, TurnState> {
        self.turn.lock()
    }

    pub fn guard(&self) -> &TurnGuard {
        &self.guard
    }

    pub fn is_busy(&self) -> bool {
        self.guard.is_busy()
    }

    pub fn stage(&self) -> PipelineStage {
        *self.stage.lock()
    }

    pub fn set_stage(&self, stage: PipelineStage) {
        *self.stage.lock() = stage;
    }

    // ── Event delivery ───────────────────────────────────────────

    /// Route events to a new socket. Returns the sink it replaced.
    pub fn attach_sink(&self, sink: EventSink) -> Option<EventSink> {
        self.sink.lock().replace(sink)
    }

    /// Detach `sink` if it is still the current one.
    ///
    /// Returns false when another socket has since taken over the session.
    pub fn detach_sink(&self, sink: &EventSink) -> bool {
        let mut current = self.sink.lock();
        match current.as_ref() {
            Some(existing) if existing.same_channel(sink) => {
                *current = None;
                true
            }
            _ => false,
        }
    }

    pub fn has_sink(&self) -> bool {
        self.sink.lock().is_some()
    }

    /// Deliver an event to the connected client, if there is one.
    ///
    /// Returns whether it was handed to a live sink. A sink whose receiver has
    /// gone away is dropped.
    pub fn emit(&self, event: SessionEvent) -> bool {
        let mut sink = self.sink.lock();
        let Some(tx) = sink.as_ref() else {
            tracing::trace!(session_id = %self.id, "No client attached, event dropped");
            return false;
        };
        if tx.send(event).is_err() {
            *sink = None;
            return false;
        }
        true
    }

    // ── Teardown ─────────────────────────────────────────────────

    /// Mark the session destroyed: cancel the silence timer and drop the
    /// partial turn. Pipeline results arriving afterwards are discarded.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.turn.lock().reset();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn summary(&self) -> SessionSummary {
        let (listening, buffered) = {
            let turn = self.turn();
            (turn.listening, BufferedTurn::of(&turn.buffer, Instant::now()))
        };
        SessionSummary {
            session_id: self.id.clone(),
            created_at: self.created_at,
            last_activity: self.last_activity(),
            message_count: self.message_count(),
            listening,
            busy: self.is_busy(),
            stage: self.stage(),
            connected: self.has_sink(),
            buffered,
        }
    }

    pub fn detail(&self) -> SessionDetail {
        SessionDetail {
            summary: self.summary(),
            provider_config: self.provider_config.clone(),
            history: self.history(),
        }
    }
}
