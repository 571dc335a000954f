//! # Conversation Pipeline
//!
//! Runs one flushed turn through the three collaborators, strictly in order:
//!
//! ```text
//! Idle -> Transcribing -> (empty / low confidence: Idle)
//!                      -> Completing -> Synthesizing -> Idle
//! ```
//!
//! ## Failure Semantics:
//! A collaborator error aborts the remaining stages and is returned as a
//! `PipelineError`. Messages already appended to the history stay there: a
//! turn that was answered but could not be spoken still counts.
//!
//! The single-flight guard is NOT taken here; callers hold a `BusyPermit`
//! for the lifetime of `run`.

use crate::providers::Providers;
use crate::session::{Message, Session, SessionEvent};
use crate::turn::FlushedTurn;
use serde::Serialize;
use std::fmt;
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    #[default]
    Idle,
    Transcribing,
    Completing,
    Synthesizing,
}

/// Why a transcript never became a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum IgnoreReason {
    EmptyTranscript,
    LowConfidence(f32),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    /// Transcribed, answered and spoken
    Completed {
        transcript: String,
        reply: String,
        audio_bytes: usize,
    },
    /// Noise or silence; nothing recorded
    Ignored(IgnoreReason),
    /// The session was destroyed while a collaborator call was in flight
    Discarded,
}

/// A collaborator failure, tagged with the stage it happened in.
#[derive(Debug)]
pub enum PipelineError {
    Transcription(anyhow::Error),
    Completion(anyhow::Error),
    Synthesis(anyhow::Error),
}

impl PipelineError {
    pub fn stage(&self) -> PipelineStage {
        match self {
            PipelineError::Transcription(_) => PipelineStage::Transcribing,
            PipelineError::Completion(_) => PipelineStage::Completing,
            PipelineError::Synthesis(_) => PipelineStage::Synthesizing,
        }
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::Transcription(err) => write!(f, "Transcription failed: {}", err),
            PipelineError::Completion(err) => write!(f, "Completion failed: {}", err),
            PipelineError::Synthesis(err) => write!(f, "Speech synthesis failed: {}", err),
        }
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PipelineError::Transcription(err)
            | PipelineError::Completion(err)
            | PipelineError::Synthesis(err) => Some(err.as_ref()),
        }
    }
}

/// Puts the session back to `Idle` however `run` exits.
struct StageReset<'a>(&'a Session);

impl Drop for StageReset<'_> {
    fn drop(&mut self) {
        self.0.set_stage(PipelineStage::Idle);
    }
}

pub struct ConversationPipeline {
    providers: Providers,
    min_confidence: f32,
}

impl ConversationPipeline {
    pub fn new(providers: Providers, min_confidence: f32) -> Self {
        Self {
            providers,
            min_confidence,
        }
    }

    pub fn providers(&self) -> &Providers {
        &self.providers
    }

    /// Process one turn for `session`.
    pub async fn run(
        &self,
        session: &Session,
        turn: FlushedTurn,
    ) -> Result<TurnOutcome, PipelineError> {
        let _reset = StageReset(session);

        session.set_stage(PipelineStage::Transcribing);
        let transcript = self
            .providers
            .stt
            .transcribe(&turn.audio)
            .await
            .map_err(PipelineError::Transcription)?;
        if session.is_closed() {
            return Ok(TurnOutcome::Discarded);
        }

        let text = transcript.text.trim();
        if text.is_empty() {
            debug!(session_id = %session.id, turn_id = %turn.id, "Empty transcript, turn ignored");
            return Ok(TurnOutcome::Ignored(IgnoreReason::EmptyTranscript));
        }
        if transcript.confidence < self.min_confidence {
            debug!(
                session_id = %session.id,
                turn_id = %turn.id,
                confidence = transcript.confidence,
                "Low-confidence transcript, turn ignored"
            );
            return Ok(TurnOutcome::Ignored(IgnoreReason::LowConfidence(
                transcript.confidence,
            )));
        }

        session.emit(SessionEvent::Transcription {
            session_id: session.id.clone(),
            text: text.to_string(),
            confidence: transcript.confidence,
            is_final: transcript.is_final,
        });
        session.append_message(Message::user(text, Some(turn.id.clone())));

        session.set_stage(PipelineStage::Completing);
        let completion = self
            .providers
            .llm
            .complete(&session.chat_history())
            .await
            .map_err(PipelineError::Completion)?;
        if session.is_closed() {
            return Ok(TurnOutcome::Discarded);
        }

        if let Some(usage) = completion.usage {
            debug!(
                session_id = %session.id,
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                "Completion received"
            );
        }
        session.append_message(Message::assistant(completion.text.clone()));
        session.emit(SessionEvent::Completion {
            session_id: session.id.clone(),
            text: completion.text.clone(),
        });
        session.touch();

        session.set_stage(PipelineStage::Synthesizing);
        let speech = self
            .providers
            .tts
            .synthesize(&completion.text)
            .await
            .map_err(PipelineError::Synthesis)?;
        if session.is_closed() {
            return Ok(TurnOutcome::Discarded);
        }

        let audio_bytes = speech.audio.len();
        session.emit(SessionEvent::Audio {
            session_id: session.id.clone(),
            data: speech.audio,
            duration_ms: speech.duration.as_millis() as u64,
        });
        session.touch();

        Ok(TurnOutcome::Completed {
            transcript: text.to_string(),
            reply: completion.text,
            audio_bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioFormat;
    use crate::session::Role;
    use crate::testing::{scripted_providers, speech, ScriptedLlm, ScriptedStt, ScriptedTts};
    use crate::turn::TurnSettings;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn session() -> Session {
        Session::new(
            "s1".to_string(),
            &TurnSettings::default(),
            crate::providers::ProviderSnapshot {
                stt: "scripted".to_string(),
                llm: "scripted".to_string(),
                tts: "scripted".to_string(),
            },
        )
    }

    fn turn() -> FlushedTurn {
        FlushedTurn::from_audio(speech(Duration::from_secs(1)), AudioFormat::default())
    }

    #[tokio::test]
    async fn test_completed_turn_records_both_messages() {
        let stt = Arc::new(ScriptedStt::new("what time is it", 0.9));
        let llm = Arc::new(ScriptedLlm::new("noon"));
        let tts = Arc::new(ScriptedTts::new());
        let pipeline = ConversationPipeline::new(
            scripted_providers(stt.clone(), llm.clone(), tts.clone()),
            0.5,
        );
        let session = session();
        let (tx, mut rx) = mpsc::unbounded_channel();
        session.attach_sink(tx);

        let turn = turn();
        let turn_id = turn.id.clone();
        let outcome = pipeline.run(&session, turn).await.unwrap();

        assert!(matches!(outcome, TurnOutcome::Completed { ref reply, .. } if reply == "noon"));
        let history = session.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[0].content, "what time is it");
        assert_eq!(history[0].audio_reference.as_deref(), Some(turn_id.as_str()));
        assert_eq!(history[1].content, "noon");
        assert_eq!(session.stage(), PipelineStage::Idle);

        let kinds: Vec<&'static str> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|event| match event {
                SessionEvent::Transcription { .. } => "transcription",
                SessionEvent::Completion { .. } => "completion",
                SessionEvent::Audio { .. } => "audio",
                _ => "other",
            })
            .collect();
        assert_eq!(kinds, vec!["transcription", "completion", "audio"]);
        assert_eq!(tts.calls(), 1);
    }

    #[tokio::test]
    async fn test_low_confidence_stops_before_completion() {
        let stt = Arc::new(ScriptedStt::new("hmm", 0.2));
        let llm = Arc::new(ScriptedLlm::new("unused"));
        let pipeline = ConversationPipeline::new(
            scripted_providers(stt.clone(), llm.clone(), Arc::new(ScriptedTts::new())),
            0.5,
        );
        let session = session();

        let outcome = pipeline.run(&session, turn()).await.unwrap();
        assert_eq!(outcome, TurnOutcome::Ignored(IgnoreReason::LowConfidence(0.2)));
        assert_eq!(stt.calls(), 1);
        assert_eq!(llm.calls(), 0);
        assert_eq!(session.message_count(), 0);
    }

    #[tokio::test]
    async fn test_blank_transcript_is_ignored() {
        let llm = Arc::new(ScriptedLlm::new("unused"));
        let pipeline = ConversationPipeline::new(
            scripted_providers(
                Arc::new(ScriptedStt::new("   ", 0.99)),
                llm.clone(),
                Arc::new(ScriptedTts::new()),
            ),
            0.5,
        );
        let session = session();

        let outcome = pipeline.run(&session, turn()).await.unwrap();
        assert_eq!(outcome, TurnOutcome::Ignored(IgnoreReason::EmptyTranscript));
        assert_eq!(llm.calls(), 0);
        assert_eq!(session.message_count(), 0);
    }

    #[tokio::test]
    async fn test_synthesis_failure_keeps_history() {
        let pipeline = ConversationPipeline::new(
            scripted_providers(
                Arc::new(ScriptedStt::new("hello", 0.9)),
                Arc::new(ScriptedLlm::new("hi there")),
                Arc::new(ScriptedTts::new().failing()),
            ),
            0.5,
        );
        let session = session();

        let err = pipeline.run(&session, turn()).await.unwrap_err();
        assert_eq!(err.stage(), PipelineStage::Synthesizing);
        assert!(err.to_string().starts_with("Speech synthesis failed"));
        assert_eq!(session.message_count(), 2);
        assert_eq!(session.stage(), PipelineStage::Idle);
    }

    #[tokio::test]
    async fn test_completion_failure_keeps_user_message() {
        let pipeline = ConversationPipeline::new(
            scripted_providers(
                Arc::new(ScriptedStt::new("hello", 0.9)),
                Arc::new(ScriptedLlm::new("unused").failing()),
                Arc::new(ScriptedTts::new()),
            ),
            0.5,
        );
        let session = session();

        let err = pipeline.run(&session, turn()).await.unwrap_err();
        assert!(matches!(err, PipelineError::Completion(_)));
        assert_eq!(session.message_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_result_discarded_when_session_closes_mid_call() {
        let llm = Arc::new(ScriptedLlm::new("late").with_latency(Duration::from_secs(5)));
        let pipeline = Arc::new(ConversationPipeline::new(
            scripted_providers(
                Arc::new(ScriptedStt::new("hello", 0.9)),
                llm.clone(),
                Arc::new(ScriptedTts::new()),
            ),
            0.5,
        ));
        let session = Arc::new(session());

        let task = {
            let pipeline = Arc::clone(&pipeline);
            let session = Arc::clone(&session);
            tokio::spawn(async move { pipeline.run(&session, turn()).await })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        session.close();

        let outcome = task.await.unwrap().unwrap();
        assert_eq!(outcome, TurnOutcome::Discarded);
        assert_eq!(llm.calls(), 1);
        assert_eq!(session.message_count(), 1);
    }
}
