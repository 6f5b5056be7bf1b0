//! Maps transport traffic onto caller-facing state and audio actions.

use crate::audio::engine::AudioEngine;
use crate::session::events::{AgentState, EventEmitter, SessionEvent};
use crate::session::run_blocking;
use crate::transport::client::{METHOD_SESSION_ENDED, Transport, TransportEvent};
use crate::transport::protocol::ControlMessage;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

pub const METHOD_PAUSE: &str = "pause";
pub const METHOD_UNPAUSE: &str = "unpause";
pub const METHOD_CLEAR: &str = "clear";
pub const METHOD_START_ANSWERING: &str = "start_answering";
pub const METHOD_THINKING: &str = "thinking";
pub const METHOD_READY: &str = "onready";
pub const METHOD_TRANSCRIPT: &str = "ontranscript";
pub const METHOD_RESPONSE_TEXT: &str = "onresponsetext";

/// Consumes transport events for one session.
///
/// Inbound audio is enqueued for playback whatever the agent state; the
/// paused flag only changes what `AudioInfo::is_audible` reports.
pub struct SessionOrchestrator {
    engine: Arc<AudioEngine>,
    transport: Transport,
    events: EventEmitter,
    agent_state: Arc<Mutex<AgentState>>,
}

impl SessionOrchestrator {
    pub fn new(engine: Arc<AudioEngine>, transport: Transport, events: EventEmitter) -> Self {
        Self {
            engine,
            transport,
            events,
            agent_state: Arc::new(Mutex::new(AgentState::Idle)),
        }
    }

    /// Shared view of the current agent state.
    pub fn agent_state_handle(&self) -> Arc<Mutex<AgentState>> {
        Arc::clone(&self.agent_state)
    }

    pub fn agent_state(&self) -> AgentState {
        *self
            .agent_state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Process events until the connection reaches a terminal state.
    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<TransportEvent>) {
        while let Some(event) = rx.recv().await {
            let terminal = matches!(
                &event,
                TransportEvent::StateChanged { state, .. } if state.is_terminal()
            );
            self.handle(event).await;
            if terminal {
                break;
            }
        }
        tracing::debug!("session orchestrator exited");
    }

    pub async fn handle(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::StateChanged { state, reason } => {
                self.events
                    .emit(SessionEvent::ConnectionState { state, reason });
                if state.is_terminal() {
                    self.set_agent_state(AgentState::Idle);
                    self.stop_audio().await;
                }
            }
            TransportEvent::Audio(bytes) => self.engine.enqueue_for_playback(&bytes),
            TransportEvent::Control(message) => self.handle_control(message).await,
            TransportEvent::Error {
                code,
                message,
                is_fatal,
            } => self.events.emit(SessionEvent::Error {
                code,
                message,
                is_fatal,
            }),
        }
    }

    async fn handle_control(&mut self, message: ControlMessage) {
        tracing::debug!(method = %message.method, "control message");
        match message.method.as_str() {
            METHOD_PAUSE => {
                self.engine.set_playback_paused(true);
                self.set_agent_state(AgentState::Paused);
            }
            METHOD_UNPAUSE => {
                self.engine.set_playback_paused(false);
                self.set_agent_state(AgentState::Speaking);
            }
            METHOD_CLEAR => {
                self.engine.set_playback_paused(false);
                self.engine.clear_playback_buffer();
                self.set_agent_state(AgentState::Listening);
            }
            METHOD_START_ANSWERING => self.set_agent_state(AgentState::Speaking),
            METHOD_THINKING => self.set_agent_state(AgentState::Thinking),
            METHOD_READY => {
                self.set_agent_state(AgentState::Listening);
                self.events.emit(SessionEvent::SessionReady {
                    session_id: message.str_field("session_id").map(str::to_string),
                });
            }
            METHOD_TRANSCRIPT => self.emit_transcript(&message, true),
            METHOD_RESPONSE_TEXT => self.emit_transcript(&message, false),
            METHOD_SESSION_ENDED => {
                let reason = message.str_field("reason").map(str::to_string);
                let duration_seconds = message.field("duration").and_then(|d| d.as_f64());
                tracing::info!(?reason, ?duration_seconds, "session ended by server");
                self.events.emit(SessionEvent::SessionEnded {
                    reason,
                    duration_seconds,
                });
                self.transport.disconnect().await;
                self.stop_audio().await;
            }
            _ => self.events.emit(SessionEvent::Custom {
                method: message.method,
                data: message.data,
            }),
        }
    }

    /// User transcripts default to final; agent response text is always final.
    fn emit_transcript(&self, message: &ControlMessage, is_user: bool) {
        let Some(text) = message.str_field("text") else {
            tracing::warn!(method = %message.method, "transcript without text, dropping");
            return;
        };
        let is_final = if is_user {
            message.bool_field("is_final").unwrap_or(true)
        } else {
            true
        };
        self.events.emit(SessionEvent::Transcript {
            text: text.to_string(),
            is_user,
            is_final,
            timestamp: chrono::Utc::now(),
        });
    }

    fn set_agent_state(&self, state: AgentState) {
        {
            let mut current = self
                .agent_state
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if *current == state {
                return;
            }
            *current = state;
        }
        self.events.emit(SessionEvent::AgentState { state });
    }

    async fn stop_audio(&self) {
        if let Err(e) = run_blocking(&self.engine, |engine| engine.stop()).await {
            tracing::warn!(error = %e, "failed to stop audio engine");
        }
    }
}
