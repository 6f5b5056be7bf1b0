//! voicelink - Full-duplex voice streaming to remote voice agents
//!
//! Captures microphone audio, streams it over a WebSocket and plays the
//! agent's audio back, reporting everything through one event stream.

// Enforce error handling discipline
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::let_underscore_must_use)]

pub mod audio;
#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod defaults;
pub mod error;
pub mod output;
pub mod session;
pub mod transport;

// Control surface
pub use session::VoiceSession;
pub use session::events::{AgentState, ConnectionState, EventEmitter, SessionEvent};

// Audio
pub use audio::device::{
    AecStatus, AudioBackend, AudioSessionConfig, CaptureDevice, MockAudioBackend,
    MockCaptureDevice, MockRenderDevice, RenderDevice,
};
pub use audio::engine::{AudioEngine, AudioInfo};

// Transport
pub use transport::{Transport, TransportConfig, TransportEvent, TransportStats};

// Error handling
pub use error::{Result, VoicelinkError};

// Config
pub use config::{Config, ConnectRequest};

/// Build version string with optional git commit hash.
///
/// Returns `"0.1.0+abc1234"` when git hash is available, `"0.1.0"` otherwise.
pub fn version_string() -> String {
    let version = env!("CARGO_PKG_VERSION");
    match option_env!("GIT_HASH") {
        Some(hash) if !hash.is_empty() => format!("{}+{}", version, hash),
        _ => version.to_string(),
    }
}
