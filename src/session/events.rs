//! Caller-facing state enums and the single event stream.

use crate::audio::device::AecStatus;
use crate::error::VoicelinkError;
use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use serde::Serialize;
use serde_json::Value;

/// Connection lifecycle as seen by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl ConnectionState {
    /// Terminal states end a connect cycle.
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Failed)
    }
}

/// Server-driven conversational state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Idle,
    Listening,
    Speaking,
    Paused,
    Thinking,
}

/// Every event the core reports to its caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    ConnectionState {
        state: ConnectionState,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    AgentState {
        state: AgentState,
    },
    Transcript {
        text: String,
        is_user: bool,
        is_final: bool,
        timestamp: DateTime<Utc>,
    },
    Error {
        code: String,
        message: String,
        is_fatal: bool,
    },
    SessionReady {
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    SessionEnded {
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        duration_seconds: Option<f64>,
    },
    AudioLevel {
        level: f32,
        is_input: bool,
    },
    AecStatus(AecStatus),
    /// Control message with a method this crate does not interpret.
    Custom {
        method: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
}

impl SessionEvent {
    /// Build an error event from a crate error.
    pub fn from_error(error: &VoicelinkError, is_fatal: bool) -> Self {
        SessionEvent::Error {
            code: error.code().to_string(),
            message: error.to_string(),
            is_fatal,
        }
    }
}

/// Cloneable, non-blocking sender for [`SessionEvent`]s.
///
/// Emitting never blocks the audio threads: when the caller falls behind
/// the event is dropped. Level meter updates may only occupy the lower half
/// of the queue, so a stalled reader never loses state, transcript or error
/// events to them. Level updates are dropped silently, anything else is
/// logged.
#[derive(Debug, Clone)]
pub struct EventEmitter {
    tx: Sender<SessionEvent>,
    level_limit: usize,
}

impl EventEmitter {
    /// Create an emitter and the receiving end handed to the caller.
    pub fn channel(capacity: usize) -> (Self, Receiver<SessionEvent>) {
        let capacity = capacity.max(1);
        let (tx, rx) = bounded(capacity);
        let emitter = Self {
            tx,
            level_limit: capacity / 2,
        };
        (emitter, rx)
    }

    pub fn emit(&self, event: SessionEvent) {
        if matches!(event, SessionEvent::AudioLevel { .. }) && self.tx.len() >= self.level_limit {
            return;
        }
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(SessionEvent::AudioLevel { .. })) => {}
            Err(TrySendError::Full(event)) => {
                tracing::warn!(?event, "event queue full, dropping event");
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// Shorthand for reporting a crate error.
    pub fn error(&self, error: &VoicelinkError, is_fatal: bool) {
        self.emit(SessionEvent::from_error(error, is_fatal));
    }
}
