//! # WebSocket Voice Transport
//!
//! Clients connect to `/ws/voice` and talk to the relay with JSON text frames
//! tagged by `type`. Raw PCM may also be sent as binary frames once joined.
//!
//! ## Session flow:
//! 1. **Join**: `join { session_id? }` attaches this socket to a session
//! 2. **Listen**: `start_listening`, then audio as `audio_fragment` or binary frames
//! 3. **Turn**: the silence window (or `end_audio` / `stop_listening` /
//!    `is_final`) flushes the turn into the pipeline
//! 4. **Reply**: `turn_accepted`, `transcription`, `completion` and `audio` events
//!
//! Closing the socket keeps the session and its history; rejoin with the
//! same id to continue the conversation.

use crate::error::{AppError, AppResult};
use crate::relay::{SubmitOutcome, VoiceRelay};
use crate::session::{EventSink, SessionEvent};
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};

/// Messages a client may send.
///
/// `session_id` may be omitted on everything but `join` once the socket has
/// joined a session.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Join {
        #[serde(default)]
        session_id: Option<String>,
    },
    StartListening {
        #[serde(default)]
        session_id: Option<String>,
    },
    StopListening {
        #[serde(default)]
        session_id: Option<String>,
    },
    AudioFragment {
        #[serde(default)]
        session_id: Option<String>,
        /// Base64 encoded PCM
        data: String,
        #[serde(default)]
        is_final: bool,
    },
    EndAudio {
        #[serde(default)]
        session_id: Option<String>,
    },
    /// Destroy the session
    Leave {
        #[serde(default)]
        session_id: Option<String>,
    },
    Ping {
        timestamp: i64,
    },
    Pong {
        timestamp: i64,
    },
}

/// Connection-level frames the server sends outside of session events.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Heartbeat {
    Ping { timestamp: i64 },
    Pong { timestamp: i64 },
}

fn decode_audio(data: &str) -> AppResult<Vec<u8>> {
    BASE64
        .decode(data.trim())
        .map_err(|e| AppError::BadRequest(format!("Audio fragment is not valid base64: {}", e)))
}

/// One actor per connected client.
pub struct VoiceWebSocket {
    state: web::Data<AppState>,

    /// Session this socket has joined, if any
    session_id: Option<String>,

    /// Handed to the session so relay events reach this socket
    sink: EventSink,
    events: Option<mpsc::UnboundedReceiver<SessionEvent>>,

    last_heartbeat: Instant,
    heartbeat_interval: Duration,
    client_timeout: Duration,
}

impl VoiceWebSocket {
    pub fn new(state: web::Data<AppState>) -> Self {
        let (sink, events) = mpsc::unbounded_channel();
        let sessions = &state.config().sessions;
        let heartbeat_interval = Duration::from_secs(sessions.heartbeat_interval_secs);
        let client_timeout = Duration::from_secs(sessions.client_timeout_secs);

        Self {
            state,
            session_id: None,
            sink,
            events: Some(events),
            last_heartbeat: Instant::now(),
            heartbeat_interval,
            client_timeout,
        }
    }

    fn relay(&self) -> &VoiceRelay {
        &self.state.relay
    }

    fn resolve(&self, session_id: Option<String>) -> AppResult<String> {
        session_id
            .filter(|id| !id.trim().is_empty())
            .or_else(|| self.session_id.clone())
            .ok_or_else(|| AppError::BadRequest("Join a session first".to_string()))
    }

    fn handle_client_message(
        &mut self,
        msg: ClientMessage,
        ctx: &mut ws::WebsocketContext<Self>,
    ) -> AppResult<()> {
        match msg {
            ClientMessage::Join { session_id } => self.join(session_id)?,
            ClientMessage::StartListening { session_id } => {
                let id = self.resolve(session_id)?;
                self.relay().start_listening(&id)?;
            }
            ClientMessage::StopListening { session_id } => {
                let id = self.resolve(session_id)?;
                let outcome = self.relay().stop_listening(&id)?;
                log_outcome(&id, &outcome);
            }
            ClientMessage::AudioFragment {
                session_id,
                data,
                is_final,
            } => {
                let id = self.resolve(session_id)?;
                let audio = decode_audio(&data)?;
                if let Some(outcome) = self.relay().push_fragment(&id, audio, is_final)? {
                    log_outcome(&id, &outcome);
                }
            }
            ClientMessage::EndAudio { session_id } => {
                let id = self.resolve(session_id)?;
                let outcome = self.relay().end_audio(&id)?;
                log_outcome(&id, &outcome);
            }
            ClientMessage::Leave { session_id } => {
                let id = self.resolve(session_id)?;
                if !self.relay().destroy(&id) {
                    return Err(AppError::NotFound(format!("Session '{}' not found", id)));
                }
            }
            ClientMessage::Ping { timestamp } => {
                send_json(ctx, &Heartbeat::Pong { timestamp });
            }
            ClientMessage::Pong { .. } => {}
        }
        Ok(())
    }

    fn join(&mut self, session_id: Option<String>) -> AppResult<()> {
        let requested = session_id.filter(|id| !id.trim().is_empty());

        // Switching sessions releases the previous one.
        if let Some(current) = self.session_id.take() {
            if requested.as_deref() != Some(current.as_str()) {
                self.relay().disconnect(&current, &self.sink);
            }
        }

        let session = self.relay().join(requested, Some(self.sink.clone()))?;
        self.session_id = Some(session.id.clone());
        Ok(())
    }

    fn handle_binary(&mut self, data: Vec<u8>) -> AppResult<()> {
        let id = self.resolve(None)?;
        if let Some(outcome) = self.relay().push_fragment(&id, data, false)? {
            log_outcome(&id, &outcome);
        }
        Ok(())
    }

    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, err: &AppError) {
        warn!(
            session_id = ?self.session_id,
            code = err.code(),
            "WebSocket request rejected: {}",
            err
        );
        send_json(
            ctx,
            &SessionEvent::Error {
                session_id: self.session_id.clone(),
                code: err.code().to_string(),
                message: err.message().to_string(),
            },
        );
    }
}

fn log_outcome(session_id: &str, outcome: &SubmitOutcome) {
    match outcome {
        SubmitOutcome::Accepted(_) => debug!(session_id = %session_id, "Turn submitted"),
        SubmitOutcome::Busy => debug!(session_id = %session_id, "Turn dropped, pipeline busy"),
        SubmitOutcome::Empty => debug!(session_id = %session_id, "Nothing buffered to flush"),
        SubmitOutcome::UnknownSession => {
            debug!(session_id = %session_id, "Turn for unknown session ignored")
        }
    }
}

fn send_json<T: Serialize>(ctx: &mut ws::WebsocketContext<VoiceWebSocket>, msg: &T) {
    match serde_json::to_string(msg) {
        Ok(json) => ctx.text(json),
        Err(err) => error!("Failed to serialize WebSocket frame: {}", err),
    }
}

impl Actor for VoiceWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!("WebSocket connection started");
        self.state.websocket_connected();

        if let Some(events) = self.events.take() {
            ctx.add_stream(UnboundedReceiverStream::new(events));
        }

        ctx.run_interval(self.heartbeat_interval, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > act.client_timeout {
                warn!(
                    session_id = ?act.session_id,
                    "WebSocket heartbeat timeout, closing connection"
                );
                ctx.stop();
                return;
            }
            send_json(
                ctx,
                &Heartbeat::Ping {
                    timestamp: chrono::Utc::now().timestamp_millis(),
                },
            );
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        if let Some(id) = self.session_id.take() {
            self.state.relay.disconnect(&id, &self.sink);
        }
        self.state.websocket_disconnected();
        info!("WebSocket connection stopped");
    }
}

/// Frames from the client.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for VoiceWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        self.last_heartbeat = Instant::now();

        match msg {
            Ok(ws::Message::Text(text)) => {
                let result = serde_json::from_str::<ClientMessage>(&text)
                    .map_err(AppError::from)
                    .and_then(|msg| self.handle_client_message(msg, ctx));
                if let Err(err) = result {
                    self.send_error(ctx, &err);
                }
            }
            Ok(ws::Message::Binary(data)) => {
                if let Err(err) = self.handle_binary(data.to_vec()) {
                    self.send_error(ctx, &err);
                }
            }
            Ok(ws::Message::Ping(data)) => ctx.pong(&data),
            Ok(ws::Message::Pong(_)) => {}
            Ok(ws::Message::Close(reason)) => {
                info!("WebSocket closed: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!("WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

/// Events from the relay for the joined session.
impl StreamHandler<SessionEvent> for VoiceWebSocket {
    fn handle(&mut self, event: SessionEvent, ctx: &mut Self::Context) {
        if event.ends_session() {
            self.session_id = None;
        }
        send_json(ctx, &event);
    }

    // The socket owns a sender, so this only runs while shutting down.
    fn finished(&mut self, _ctx: &mut Self::Context) {}
}

/// `GET /ws/voice`: upgrade to the voice protocol.
pub async fn voice_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!("New WebSocket connection request from: {:?}", req.connection_info().peer_addr());
    ws::start(VoiceWebSocket::new(state), &req, stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_client_messages() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"join"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Join { session_id: None });

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"start_listening","session_id":"abc"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::StartListening {
                session_id: Some("abc".to_string())
            }
        );

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"audio_fragment","session_id":"abc","data":"AAEC"}"#)
                .unwrap();
        match msg {
            ClientMessage::AudioFragment { data, is_final, .. } => {
                assert_eq!(decode_audio(&data).unwrap(), vec![0, 1, 2]);
                assert!(!is_final);
            }
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let err = serde_json::from_str::<ClientMessage>(r#"{"type":"config"}"#).unwrap_err();
        let err = AppError::from(err);
        assert_eq!(err.code(), "bad_request");
    }

    #[test]
    fn test_invalid_base64_is_bad_request() {
        let err = decode_audio("not base64!!").unwrap_err();
        assert_eq!(err.code(), "bad_request");
    }

    #[test]
    fn test_heartbeat_wire_format() {
        let json = serde_json::to_value(Heartbeat::Ping { timestamp: 42 }).unwrap();
        assert_eq!(json, serde_json::json!({"type": "ping", "timestamp": 42}));

        let json = serde_json::to_value(Heartbeat::Pong { timestamp: 7 }).unwrap();
        assert_eq!(json["type"], "pong");
    }
}
