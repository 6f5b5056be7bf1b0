//! The caller-facing control surface.
//!
//! A [`VoiceSession`] owns at most one active connection: an audio engine,
//! a transport and the orchestrator task tying them together. Everything it
//! reports goes through one event stream; failures are also returned as
//! `Err` so async callers can `?` them.

pub mod events;
pub mod orchestrator;

use crate::audio::device::AudioBackend;
use crate::audio::engine::{AudioEngine, AudioInfo};
use crate::config::ConnectRequest;
use crate::defaults;
use crate::error::{Result, VoicelinkError};
use crate::session::events::{AgentState, ConnectionState, EventEmitter, SessionEvent};
use crate::session::orchestrator::SessionOrchestrator;
use crate::transport::client::{Transport, TransportStats};
use crossbeam_channel::Receiver;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Run a blocking engine call off the async runtime.
pub(crate) async fn run_blocking<T, F>(engine: &Arc<AudioEngine>, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&AudioEngine) -> T + Send + 'static,
{
    let engine = Arc::clone(engine);
    tokio::task::spawn_blocking(move || f(&engine))
        .await
        .map_err(|e| VoicelinkError::Other(format!("audio task failed: {}", e)))
}

struct ActiveSession {
    engine: Arc<AudioEngine>,
    transport: Transport,
    orchestrator: JoinHandle<()>,
    agent_state: Arc<Mutex<AgentState>>,
    join_timeout: Duration,
}

/// Full-duplex voice session with a remote agent.
pub struct VoiceSession {
    backend: Arc<dyn AudioBackend>,
    events: EventEmitter,
    receiver: Receiver<SessionEvent>,
    active: Mutex<Option<ActiveSession>>,
}

impl VoiceSession {
    pub fn new(backend: Arc<dyn AudioBackend>) -> Self {
        Self::with_event_queue(backend, defaults::EVENT_QUEUE_SIZE)
    }

    /// Create a session whose event stream holds up to `queue_size` events.
    pub fn with_event_queue(backend: Arc<dyn AudioBackend>, queue_size: usize) -> Self {
        let (events, receiver) = EventEmitter::channel(queue_size);
        Self {
            backend,
            events,
            receiver,
            active: Mutex::new(None),
        }
    }

    /// The event stream. Every clone receives from the same queue.
    pub fn events(&self) -> Receiver<SessionEvent> {
        self.receiver.clone()
    }

    /// Validate `request`, open the audio devices and start connecting.
    ///
    /// Returns once audio is running; the connection itself progresses in
    /// the background and is reported through `ConnectionState` events. Any
    /// previous session is torn down first.
    pub async fn connect(&self, request: ConnectRequest) -> Result<()> {
        if let Err(e) = request.validate() {
            tracing::warn!(error = %e, "rejected connect request");
            self.events.error(&e, true);
            return Err(e);
        }
        self.disconnect().await;

        let engine = Arc::new(
            AudioEngine::new(Arc::clone(&self.backend), self.events.clone())
                .with_join_timeout(Duration::from_millis(request.join_timeout_ms)),
        );
        let audio_config = request.audio_session_config();
        run_blocking(&engine, move |engine| engine.initialize(audio_config)).await??;

        let (transport, transport_rx) =
            Transport::connect(request.pending_connection(), request.transport_config());
        engine.set_frame_sink(Arc::new(transport.clone()));

        let orchestrator =
            SessionOrchestrator::new(Arc::clone(&engine), transport.clone(), self.events.clone());
        let agent_state = orchestrator.agent_state_handle();
        let orchestrator = tokio::spawn(orchestrator.run(transport_rx));

        if let Err(e) = run_blocking(&engine, |engine| engine.start()).await.and_then(|r| r) {
            tracing::error!(error = %e, "failed to start audio");
            transport.disconnect().await;
            if let Err(e) = run_blocking(&engine, |engine| engine.dispose()).await {
                tracing::warn!(error = %e, "failed to dispose audio engine");
            }
            orchestrator.abort();
            return Err(e);
        }

        *self.lock_active() = Some(ActiveSession {
            engine,
            transport,
            orchestrator,
            agent_state,
            join_timeout: Duration::from_millis(request.join_timeout_ms),
        });
        Ok(())
    }

    /// Close the connection, stop reconnecting and release the audio devices.
    ///
    /// A no-op when nothing is connected.
    pub async fn disconnect(&self) {
        let Some(active) = self.lock_active().take() else {
            return;
        };
        tracing::info!("disconnecting");

        active.transport.disconnect().await;
        if let Err(e) = run_blocking(&active.engine, |engine| engine.dispose()).await {
            tracing::warn!(error = %e, "failed to dispose audio engine");
        }

        // The orchestrator exits after reporting the terminal state.
        let mut orchestrator = active.orchestrator;
        if tokio::time::timeout(active.join_timeout, &mut orchestrator).await.is_err() {
            tracing::warn!("session orchestrator did not exit in time, aborting");
            orchestrator.abort();
        }
    }

    pub fn set_microphone_muted(&self, muted: bool) {
        if let Some(active) = self.lock_active().as_ref() {
            active.engine.set_microphone_muted(muted);
        }
    }

    pub fn set_speaker_muted(&self, muted: bool) {
        if let Some(active) = self.lock_active().as_ref() {
            active.engine.set_speaker_muted(muted);
        }
    }

    pub fn clear_playback_buffer(&self) {
        if let Some(active) = self.lock_active().as_ref() {
            active.engine.clear_playback_buffer();
        }
    }

    /// Send a custom `{"method": event_type, "data"?: data}` message.
    ///
    /// Failures are reported as non-fatal error events and not retried.
    pub fn send_event(&self, event_type: &str, data: Option<Value>) -> Result<()> {
        let result = match self.lock_active().as_ref() {
            Some(active) => active.transport.send_event(event_type, data),
            None => Err(VoicelinkError::NotConnected),
        };
        if let Err(e) = &result {
            tracing::debug!(error = %e, event_type, "custom event not sent");
            self.events.error(e, false);
        }
        result
    }

    /// Snapshot of the audio engine, with transport frame counts.
    pub fn get_audio_info(&self) -> AudioInfo {
        match self.lock_active().as_ref() {
            Some(active) => AudioInfo {
                frames_sent: active.transport.stats().frames_sent,
                ..active.engine.info()
            },
            None => AudioInfo::default(),
        }
    }

    /// Whether echo cancellation is available for the current (or next) session.
    pub fn check_aec_availability(&self) -> bool {
        match self.lock_active().as_ref() {
            Some(active) => active.engine.check_aec_availability(),
            None => self.backend.aec_available(),
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.lock_active()
            .as_ref()
            .map_or(ConnectionState::Disconnected, |active| {
                active.transport.state()
            })
    }

    pub fn agent_state(&self) -> AgentState {
        self.lock_active()
            .as_ref()
            .map_or(AgentState::Idle, |active| {
                *active
                    .agent_state
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
            })
    }

    pub fn transport_stats(&self) -> TransportStats {
        self.lock_active()
            .as_ref()
            .map(|active| active.transport.stats())
            .unwrap_or_default()
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<ActiveSession>> {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for VoiceSession {
    fn drop(&mut self) {
        if let Some(active) = self.lock_active().take() {
            active.transport.shutdown();
            active.orchestrator.abort();
            active.engine.dispose();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::device::MockAudioBackend;

    fn session(backend: MockAudioBackend) -> VoiceSession {
        VoiceSession::new(Arc::new(backend))
    }

    #[tokio::test]
    async fn test_invalid_request_rejected_before_allocation() {
        let backend = Arc::new(MockAudioBackend::new());
        let session = VoiceSession::new(backend.clone());
        let events = session.events();

        let result = session
            .connect(ConnectRequest::new("http://nope", "agent", "key"))
            .await;
        assert!(matches!(
            result,
            Err(VoicelinkError::ConfigInvalidValue { .. })
        ));
        assert_eq!(backend.open_count(), 0);
        match events.try_recv() {
            Ok(SessionEvent::Error { code, is_fatal, .. }) => {
                assert_eq!(code, "invalid_config");
                assert!(is_fatal);
            }
            other => panic!("Expected config error event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_device_failure_is_fatal_and_leaves_session_idle() {
        let session = session(MockAudioBackend::new().with_open_failure());
        let events = session.events();
        let result = session
            .connect(ConnectRequest::new("ws://127.0.0.1:1", "agent", "key"))
            .await;
        assert!(result.is_err());
        assert_eq!(session.connection_state(), ConnectionState::Disconnected);
        assert!(events.try_iter().any(|e| matches!(
            e,
            SessionEvent::Error { ref code, is_fatal: true, .. } if code == "audio_device_unavailable"
        )));
    }

    #[tokio::test]
    async fn test_idle_control_surface() {
        let session = session(MockAudioBackend::new());
        session.set_microphone_muted(true);
        session.set_speaker_muted(true);
        session.clear_playback_buffer();
        assert!(session.check_aec_availability());
        assert_eq!(session.agent_state(), AgentState::Idle);
        assert_eq!(session.get_audio_info(), AudioInfo::default());
        assert_eq!(session.transport_stats(), TransportStats::default());
        assert!(matches!(
            session.send_event("custom", None),
            Err(VoicelinkError::NotConnected)
        ));
        session.disconnect().await;
    }

    #[tokio::test]
    async fn test_connect_starts_audio_and_disconnect_releases_it() {
        // A listener that never completes the handshake keeps the transport
        // in `connecting`, so nothing tears the audio down behind our back.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("ws://{}", listener.local_addr().unwrap());
        let backend = Arc::new(MockAudioBackend::new());
        let session = VoiceSession::new(backend.clone());
        let mut request = ConnectRequest::new(&endpoint, "agent", "key");
        request.auto_reconnect = false;

        session.connect(request).await.unwrap();
        let info = session.get_audio_info();
        assert!(info.initialized);
        assert!(info.running);
        assert!(backend.render().is_started());

        session.set_microphone_muted(true);
        assert!(session.get_audio_info().microphone_muted);

        session.disconnect().await;
        assert!(!backend.render().is_started());
        assert_eq!(session.connection_state(), ConnectionState::Disconnected);
        assert!(!session.get_audio_info().initialized);
        drop(listener);
    }
}
