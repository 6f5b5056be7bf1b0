//! Terminal rendering of session events.
//! Used by `voicelink connect`.

use crate::session::events::{AgentState, ConnectionState, SessionEvent};
use std::io::{self, Write};

const DIM: &str = "\x1b[2m";
const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const RED: &str = "\x1b[31m";
const CYAN: &str = "\x1b[36m";
const RESET: &str = "\x1b[0m";

const LEVEL_BAR_WIDTH: usize = 30;

/// Clear the current terminal line (replaces level bar etc.)
pub fn clear_line() {
    eprint!("\r\x1b[2K");
}

/// Render a 0.0–1.0 level as a fixed-width bar.
pub fn format_level_bar(level: f32) -> String {
    let level = if level.is_finite() {
        level.clamp(0.0, 1.0)
    } else {
        0.0
    };
    let filled = (level * LEVEL_BAR_WIDTH as f32).round() as usize;
    format!(
        "[{}{}]",
        "#".repeat(filled),
        " ".repeat(LEVEL_BAR_WIDTH - filled)
    )
}

fn connection_color(state: ConnectionState) -> &'static str {
    match state {
        ConnectionState::Connected => GREEN,
        ConnectionState::Connecting | ConnectionState::Reconnecting => YELLOW,
        ConnectionState::Failed => RED,
        ConnectionState::Disconnected => DIM,
    }
}

fn agent_label(state: AgentState) -> &'static str {
    match state {
        AgentState::Idle => "idle",
        AgentState::Listening => "listening",
        AgentState::Speaking => "speaking",
        AgentState::Paused => "paused",
        AgentState::Thinking => "thinking",
    }
}

fn connection_label(state: ConnectionState) -> &'static str {
    match state {
        ConnectionState::Disconnected => "disconnected",
        ConnectionState::Connecting => "connecting",
        ConnectionState::Connected => "connected",
        ConnectionState::Reconnecting => "reconnecting",
        ConnectionState::Failed => "failed",
    }
}

/// Event rendering options.
#[derive(Debug, Clone, Copy, Default)]
pub struct RenderOptions {
    /// Show the input level meter.
    pub show_levels: bool,
}

/// Render a session event to stderr.
pub fn render_event(event: &SessionEvent, options: RenderOptions) {
    match event {
        SessionEvent::AudioLevel { level, is_input } => {
            if !options.show_levels || !*is_input {
                return;
            }
            eprint!("\r\x1b[2Kmic {}", format_level_bar(*level));
            io::stderr().flush().ok();
        }
        SessionEvent::ConnectionState { state, reason } => {
            clear_line();
            let color = connection_color(*state);
            let label = connection_label(*state);
            match reason {
                Some(reason) => eprintln!("{color}{label}{RESET} {DIM}({reason}){RESET}"),
                None => eprintln!("{color}{label}{RESET}"),
            }
        }
        SessionEvent::AgentState { state } => {
            clear_line();
            eprintln!("{DIM}agent {}{RESET}", agent_label(*state));
        }
        SessionEvent::Transcript {
            text,
            is_user,
            is_final,
            ..
        } => {
            clear_line();
            let who = if *is_user { "you" } else { "agent" };
            if *is_final {
                eprintln!("{CYAN}{who}:{RESET} {text}");
            } else {
                eprintln!("{DIM}{who}: {text}…{RESET}");
            }
        }
        SessionEvent::Error {
            code,
            message,
            is_fatal,
        } => {
            clear_line();
            let color = if *is_fatal { RED } else { YELLOW };
            eprintln!("{color}error [{code}]{RESET} {message}");
        }
        SessionEvent::SessionReady { session_id } => {
            clear_line();
            match session_id {
                Some(id) => eprintln!("{GREEN}Session ready{RESET} {DIM}({id}){RESET}"),
                None => eprintln!("{GREEN}Session ready{RESET}"),
            }
        }
        SessionEvent::SessionEnded {
            reason,
            duration_seconds,
        } => {
            clear_line();
            let reason = reason.as_deref().unwrap_or("ended");
            match duration_seconds {
                Some(secs) => eprintln!("Session ended: {reason} {DIM}({secs:.0}s){RESET}"),
                None => eprintln!("Session ended: {reason}"),
            }
        }
        SessionEvent::AecStatus(aec) => {
            clear_line();
            let state = match (aec.is_supported, aec.is_enabled) {
                (true, true) => "enabled",
                (true, false) => "available, disabled",
                _ => "unavailable",
            };
            match &aec.kind {
                Some(kind) => eprintln!("{DIM}echo cancellation: {state} ({kind}){RESET}"),
                None => eprintln!("{DIM}echo cancellation: {state}{RESET}"),
            }
        }
        SessionEvent::Custom { method, data } => {
            clear_line();
            match data {
                Some(data) => eprintln!("{DIM}[{method}] {data}{RESET}"),
                None => eprintln!("{DIM}[{method}]{RESET}"),
            }
        }
    }
}
