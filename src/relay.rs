//! # Voice Relay
//!
//! The entry points the transport calls, and the glue between the turn
//! buffer, the silence timer, the single-flight guard and the pipeline.
//!
//! ## Control Flow:
//! ```text
//! fragment --> TurnBuffer.append --> SilenceTimer.schedule
//!                                          |
//!        is_final / stop / end_audio ------+--> flush --> TurnGuard --> pipeline task
//! ```
//!
//! ## Mutual Exclusion:
//! Every trigger (silence timer, explicit end of utterance, direct submit)
//! funnels into `submit_turn`, which only proceeds if it wins the session's
//! `TurnGuard`. The permit moves into the pipeline task and clears the busy
//! flag when the task ends, whether it succeeded, failed or panicked.

use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::pipeline::{ConversationPipeline, TurnOutcome};
use crate::providers::Providers;
use crate::session::{EventSink, Session, SessionEvent, SessionRegistry};
use crate::turn::{FlushedTurn, TimerTicket, TurnSettings};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, Instrument};

/// Result of handing a flushed turn to the guard.
#[derive(Debug)]
pub enum SubmitOutcome {
    /// Pipeline started; the handle resolves when it finishes
    Accepted(JoinHandle<()>),
    /// Another turn is in flight; this one was dropped
    Busy,
    /// Nothing to process
    Empty,
    /// The session no longer exists
    UnknownSession,
}

/// Turn-level counters exposed on the metrics endpoint.
#[derive(Debug, Default)]
pub struct RelayCounters {
    turns_accepted: AtomicU64,
    turns_completed: AtomicU64,
    turns_dropped_busy: AtomicU64,
    turns_too_short: AtomicU64,
    turns_ignored: AtomicU64,
    pipeline_failures: AtomicU64,
    fragments_evicted: AtomicU64,
    sessions_expired: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub turns_accepted: u64,
    pub turns_completed: u64,
    pub turns_dropped_busy: u64,
    pub turns_too_short: u64,
    pub turns_ignored: u64,
    pub pipeline_failures: u64,
    pub fragments_evicted: u64,
    pub sessions_expired: u64,
}

impl RelayCounters {
    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            turns_accepted: self.turns_accepted.load(Ordering::Relaxed),
            turns_completed: self.turns_completed.load(Ordering::Relaxed),
            turns_dropped_busy: self.turns_dropped_busy.load(Ordering::Relaxed),
            turns_too_short: self.turns_too_short.load(Ordering::Relaxed),
            turns_ignored: self.turns_ignored.load(Ordering::Relaxed),
            pipeline_failures: self.pipeline_failures.load(Ordering::Relaxed),
            fragments_evicted: self.fragments_evicted.load(Ordering::Relaxed),
            sessions_expired: self.sessions_expired.load(Ordering::Relaxed),
        }
    }
}

struct RelayInner {
    registry: Arc<SessionRegistry>,
    pipeline: ConversationPipeline,
    settings: TurnSettings,
    counters: RelayCounters,
}

/// Cheap to clone; all clones share the same registry and pipeline.
#[derive(Clone)]
pub struct VoiceRelay {
    inner: Arc<RelayInner>,
}

impl VoiceRelay {
    pub fn new(
        registry: Arc<SessionRegistry>,
        pipeline: ConversationPipeline,
        settings: TurnSettings,
    ) -> Self {
        Self {
            inner: Arc::new(RelayInner {
                registry,
                pipeline,
                settings,
                counters: RelayCounters::default(),
            }),
        }
    }

    /// Wire up the registry and pipeline from configuration.
    pub fn from_config(config: &AppConfig, providers: Providers) -> Self {
        let settings = TurnSettings::from(&config.turn);
        let registry = Arc::new(SessionRegistry::new(
            settings.clone(),
            providers.snapshot(),
            config.sessions.max_concurrent_sessions,
            Duration::from_secs(config.sessions.idle_timeout_secs),
        ));
        let pipeline = ConversationPipeline::new(providers, settings.min_confidence);
        Self::new(registry, pipeline, settings)
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    pub fn providers(&self) -> &Providers {
        self.inner.pipeline.providers()
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.inner.counters.snapshot()
    }

    fn session(&self, session_id: &str) -> AppResult<Arc<Session>> {
        self.inner
            .registry
            .get(session_id)
            .ok_or_else(|| AppError::NotFound(format!("Session '{}' not found", session_id)))
    }

    // ── Transport events ─────────────────────────────────────────

    /// Get or create a session and route its events to `sink`.
    pub fn join(
        &self,
        session_id: Option<String>,
        sink: Option<EventSink>,
    ) -> AppResult<Arc<Session>> {
        let (session, created) = self.inner.registry.get_or_create(session_id)?;
        if let Some(sink) = sink {
            session.attach_sink(sink);
        }
        session.touch();
        session.emit(SessionEvent::Joined {
            session_id: session.id.clone(),
            message_count: session.message_count(),
        });

        info!(session_id = %session.id, created, "Client joined session");
        Ok(session)
    }

    pub fn start_listening(&self, session_id: &str) -> AppResult<()> {
        let session = self.session(session_id)?;
        session.turn().listening = true;
        session.touch();
        session.emit(SessionEvent::ListeningState {
            session_id: session.id.clone(),
            listening: true,
        });
        debug!(session_id = %session_id, "Listening started");
        Ok(())
    }

    /// Stop accepting audio and flush whatever has been buffered.
    pub fn stop_listening(&self, session_id: &str) -> AppResult<SubmitOutcome> {
        let session = self.session(session_id)?;
        let flushed = {
            let mut turn = session.turn();
            turn.listening = false;
            turn.timer.cancel();
            turn.buffer.flush()
        };
        session.touch();
        session.emit(SessionEvent::ListeningState {
            session_id: session.id.clone(),
            listening: false,
        });

        Ok(match flushed {
            Some(turn) => self.submit_turn(&session, turn),
            None => SubmitOutcome::Empty,
        })
    }

    /// Buffer one fragment of audio.
    ///
    /// Fragments are only accepted while the session is listening; anything
    /// else is dropped. With `is_final` the turn is flushed immediately,
    /// otherwise the silence timer is (re)scheduled. Returns the submission
    /// result for final fragments and `None` for buffered or dropped ones.
    pub fn push_fragment(
        &self,
        session_id: &str,
        data: Vec<u8>,
        is_final: bool,
    ) -> AppResult<Option<SubmitOutcome>> {
        let session = self.session(session_id)?;
        session.touch();

        let mut turn = session.turn();
        if !turn.listening {
            debug!(
                session_id = %session_id,
                bytes = data.len(),
                "Not listening, fragment dropped"
            );
            return Ok(None);
        }

        let outcome = turn.buffer.append(data);
        if outcome.evicted_anything() {
            RelayCounters::bump(
                &self.inner.counters.fragments_evicted,
                outcome.evicted_fragments as u64,
            );
            debug!(
                session_id = %session_id,
                evicted_fragments = outcome.evicted_fragments,
                evicted_bytes = outcome.evicted_bytes,
                truncated = outcome.truncated,
                "Turn buffer over ceiling, oldest audio dropped"
            );
        }

        if is_final {
            turn.timer.cancel();
            let flushed = turn.buffer.flush();
            drop(turn);
            return Ok(Some(match flushed {
                Some(flushed) => self.submit_turn(&session, flushed),
                None => SubmitOutcome::Empty,
            }));
        }

        if !turn.buffer.is_empty() {
            let weak = Arc::downgrade(&session);
            let relay = self.clone();
            let window = self.inner.settings.silence_window;
            turn.timer.schedule(window, move |ticket| relay.on_silence(&weak, ticket));
        }

        Ok(None)
    }

    /// Explicit end of utterance: flush now, whatever the duration.
    pub fn end_audio(&self, session_id: &str) -> AppResult<SubmitOutcome> {
        let session = self.session(session_id)?;
        session.touch();
        let flushed = {
            let mut turn = session.turn();
            turn.timer.cancel();
            turn.buffer.flush()
        };

        Ok(match flushed {
            Some(turn) => self.submit_turn(&session, turn),
            None => SubmitOutcome::Empty,
        })
    }

    /// Silence window elapsed with no newer fragment.
    ///
    /// Runs on the timer task. Does nothing unless `ticket` is still the
    /// session's live schedule.
    fn on_silence(&self, session: &Weak<Session>, ticket: TimerTicket) {
        let Some(session) = session.upgrade() else {
            return;
        };
        if session.is_closed() {
            return;
        }

        let flushed = {
            let mut turn = session.turn();
            if !turn.timer.claim(ticket) {
                return;
            }
            if !turn.listening {
                turn.buffer.discard();
                return;
            }

            let buffered = turn.buffer.audio_duration();
            if buffered < self.inner.settings.min_turn_duration {
                let dropped = turn.buffer.discard();
                RelayCounters::bump(&self.inner.counters.turns_too_short, 1);
                debug!(
                    session_id = %session.id,
                    buffered_ms = buffered.as_millis() as u64,
                    dropped_bytes = dropped,
                    "Turn too short, discarded"
                );
                return;
            }
            turn.buffer.flush()
        };

        if let Some(turn) = flushed {
            debug!(session_id = %session.id, turn_id = %turn.id, "Silence detected, flushing turn");
            self.submit_turn(&session, turn);
        }
    }

    /// Submit raw audio as a complete turn, bypassing the buffer.
    pub fn submit(&self, session_id: &str, audio: Vec<u8>) -> AppResult<SubmitOutcome> {
        let session = match self.inner.registry.get(session_id) {
            Some(session) => session,
            None => return Ok(SubmitOutcome::UnknownSession),
        };
        let turn = FlushedTurn::from_audio(audio, self.inner.settings.format);
        Ok(self.submit_turn(&session, turn))
    }

    /// The single-flight gate.
    pub fn submit_turn(&self, session: &Arc<Session>, turn: FlushedTurn) -> SubmitOutcome {
        if turn.is_empty() {
            return SubmitOutcome::Empty;
        }
        if session.is_closed() {
            return SubmitOutcome::UnknownSession;
        }

        let Some(permit) = session.guard().try_acquire() else {
            RelayCounters::bump(&self.inner.counters.turns_dropped_busy, 1);
            debug!(session_id = %session.id, turn_id = %turn.id, "Pipeline busy, turn dropped");
            return SubmitOutcome::Busy;
        };

        RelayCounters::bump(&self.inner.counters.turns_accepted, 1);
        session.touch();
        session.emit(SessionEvent::TurnAccepted {
            session_id: session.id.clone(),
            turn_id: turn.id.clone(),
            audio_bytes: turn.audio.len(),
            duration_ms: turn.audio_duration.as_millis() as u64,
        });
        info!(
            session_id = %session.id,
            turn_id = %turn.id,
            audio_bytes = turn.audio.len(),
            fragments = turn.fragment_count,
            elapsed_ms = turn.elapsed.as_millis() as u64,
            "Turn accepted"
        );

        let span = info_span!("turn", session_id = %session.id, turn_id = %turn.id);
        let relay = self.clone();
        let session = Arc::clone(session);
        let handle = tokio::spawn(
            async move {
                let _permit = permit;
                relay.run_turn(&session, turn).await;
            }
            .instrument(span),
        );

        SubmitOutcome::Accepted(handle)
    }

    async fn run_turn(&self, session: &Session, turn: FlushedTurn) {
        let counters = &self.inner.counters;
        match self.inner.pipeline.run(session, turn).await {
            Ok(TurnOutcome::Completed { audio_bytes, .. }) => {
                RelayCounters::bump(&counters.turns_completed, 1);
                info!(audio_bytes, "Turn completed");
            }
            Ok(TurnOutcome::Ignored(reason)) => {
                RelayCounters::bump(&counters.turns_ignored, 1);
                debug!(?reason, "Turn ignored");
            }
            Ok(TurnOutcome::Discarded) => {
                debug!("Session closed mid-turn, result discarded");
            }
            Err(err) if session.is_closed() => {
                debug!(
                    stage = ?err.stage(),
                    error = %err,
                    "Session closed mid-turn, failure discarded"
                );
            }
            Err(err) => {
                RelayCounters::bump(&counters.pipeline_failures, 1);
                error!(stage = ?err.stage(), error = %err, "Pipeline failed");
                session.emit(SessionEvent::Error {
                    session_id: Some(session.id.clone()),
                    code: "pipeline_error".to_string(),
                    message: err.to_string(),
                });
            }
        }
    }

    /// The socket owning `sink` went away.
    ///
    /// Cancels the timer and drops the partial turn, but keeps the session
    /// and its history for a later rejoin. Nothing happens if another socket
    /// has taken the session over.
    pub fn disconnect(&self, session_id: &str, sink: &EventSink) {
        let Some(session) = self.inner.registry.get(session_id) else {
            return;
        };
        if session.detach_sink(sink) {
            session.turn().reset();
            info!(session_id = %session_id, "Client detached from session");
        }
    }

    /// Force-destroy a session. Returns whether it existed.
    pub fn destroy(&self, session_id: &str) -> bool {
        match self.inner.registry.remove(session_id) {
            Some(session) => {
                session.emit(SessionEvent::SessionClosed {
                    session_id: session.id.clone(),
                });
                info!(session_id = %session_id, "Session destroyed");
                true
            }
            None => false,
        }
    }

    // ── Idle sweep ───────────────────────────────────────────────

    pub fn sweep_idle(&self) -> Vec<String> {
        let expired = self.inner.registry.sweep_idle(Instant::now());
        if !expired.is_empty() {
            RelayCounters::bump(&self.inner.counters.sessions_expired, expired.len() as u64);
            info!(
                expired = expired.len(),
                remaining = self.inner.registry.len(),
                "Idle sweep destroyed sessions"
            );
        }
        expired
    }

    /// Run `sweep_idle` every `every` until the returned task is aborted.
    pub fn spawn_idle_sweeper(&self, every: Duration) -> JoinHandle<()> {
        let relay = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + every, every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                relay.sweep_idle();
            }
        })
    }
}
