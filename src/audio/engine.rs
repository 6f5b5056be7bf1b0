//! Audio engine: owns the playback ring, both real-time loops and the
//! device pair opened for the current session.

use crate::audio::capture_loop::{AudioStats, CaptureLoop, FrameSink, NullSink};
use crate::audio::device::{AecStatus, AudioBackend, AudioSessionConfig, CaptureDevice, RenderDevice};
use crate::audio::playback_loop::PlaybackLoop;
use crate::audio::realtime::join_with_timeout;
use crate::audio::ring_buffer::RingBuffer;
use crate::defaults;
use crate::error::{Result, VoicelinkError};
use crate::session::events::{EventEmitter, SessionEvent};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Point-in-time view of the engine, returned by `get_audio_info`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AudioInfo {
    pub initialized: bool,
    pub running: bool,
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_ms: u32,
    pub frame_samples: usize,
    pub microphone_muted: bool,
    pub speaker_muted: bool,
    pub playback_paused: bool,
    /// False while paused or speaker-muted, even though audio keeps buffering.
    pub is_audible: bool,
    pub buffered_bytes: usize,
    pub buffer_capacity_bytes: usize,
    pub session_id: Option<String>,
    pub aec: AecStatus,
    pub frames_captured: u64,
    /// Filled in by the session from transport statistics.
    pub frames_sent: u64,
    pub frames_played: u64,
    pub underruns: u64,
}

#[derive(Default)]
struct EngineState {
    config: Option<AudioSessionConfig>,
    session_id: Option<String>,
    aec: AecStatus,
    capture: Option<Box<dyn CaptureDevice>>,
    render: Option<Box<dyn RenderDevice>>,
    /// Present while started; a fresh flag per start so a detached thread
    /// from an earlier run never resumes.
    running: Option<Arc<AtomicBool>>,
    /// Bumped by `initialize` and `dispose`. A `stop` that joined its threads
    /// under an older generation must not hand devices back.
    generation: u64,
    capture_thread: Option<JoinHandle<Box<dyn CaptureDevice>>>,
    playback_thread: Option<JoinHandle<Box<dyn RenderDevice>>>,
}

/// Full-duplex audio engine for one session.
///
/// Every method takes `&self`; the engine is shared between the control
/// surface, the orchestrator task and the transport's inbound audio path.
pub struct AudioEngine {
    backend: Arc<dyn AudioBackend>,
    events: EventEmitter,
    join_timeout: Duration,
    state: Mutex<EngineState>,
    playback: RwLock<Option<Arc<RingBuffer>>>,
    mic_muted: Arc<AtomicBool>,
    speaker_muted: Arc<AtomicBool>,
    paused: AtomicBool,
    stats: Arc<AudioStats>,
    sink: Mutex<Arc<dyn FrameSink>>,
}

impl AudioEngine {
    pub fn new(backend: Arc<dyn AudioBackend>, events: EventEmitter) -> Self {
        Self {
            backend,
            events,
            join_timeout: Duration::from_millis(defaults::JOIN_TIMEOUT_MS),
            state: Mutex::new(EngineState::default()),
            playback: RwLock::new(None),
            mic_muted: Arc::new(AtomicBool::new(false)),
            speaker_muted: Arc::new(AtomicBool::new(false)),
            paused: AtomicBool::new(false),
            stats: Arc::new(AudioStats::default()),
            sink: Mutex::new(Arc::new(NullSink)),
        }
    }

    /// Bound on how long `stop` waits for each loop thread.
    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    /// Name of the backend devices are opened from.
    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Open devices for a new session and allocate the playback ring.
    ///
    /// Any previous session is disposed first. Device failures are reported
    /// as a fatal error event and leave the engine disposed.
    pub fn initialize(&self, config: AudioSessionConfig) -> Result<()> {
        self.dispose();

        let devices = match self.backend.open(&config) {
            Ok(devices) => devices,
            Err(e) => {
                tracing::error!(backend = self.backend.name(), error = %e, "failed to open audio devices");
                self.events.error(&e, true);
                return Err(e);
            }
        };

        self.mic_muted.store(config.microphone_muted, Ordering::Release);
        self.speaker_muted.store(config.speaker_muted, Ordering::Release);
        self.paused.store(false, Ordering::Release);
        self.stats.frames_captured.store(0, Ordering::Relaxed);
        self.stats.frames_played.store(0, Ordering::Relaxed);
        self.stats.underruns.store(0, Ordering::Relaxed);

        let ring = Arc::new(RingBuffer::new(config.playback_buffer_bytes()));
        *self
            .playback
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(ring);

        tracing::info!(
            backend = self.backend.name(),
            session_id = %devices.session_id,
            sample_rate = config.sample_rate,
            frame_ms = config.frame_ms,
            aec_enabled = devices.aec.is_enabled,
            "audio engine initialized"
        );

        let aec = devices.aec.clone();
        {
            let mut state = self.lock_state();
            state.capture = Some(devices.capture);
            state.render = Some(devices.render);
            state.session_id = Some(devices.session_id);
            state.aec = devices.aec;
            state.config = Some(config);
            state.generation += 1;
        }
        self.events.emit(SessionEvent::AecStatus(aec));
        Ok(())
    }

    /// Route captured frames to `sink`. Takes effect on the next `start`.
    pub fn set_frame_sink(&self, sink: Arc<dyn FrameSink>) {
        *self.sink.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = sink;
    }

    /// Start both loops. Calling it while running is a no-op.
    pub fn start(&self) -> Result<()> {
        let mut state = self.lock_state();
        if state.running.is_some() {
            return Ok(());
        }
        let config = state
            .config
            .clone()
            .ok_or(VoicelinkError::AudioNotInitialized)?;
        let ring = self.ring().ok_or(VoicelinkError::AudioNotInitialized)?;

        // A loop thread that missed its join deadline keeps its device.
        if state.capture.is_none() || state.render.is_none() {
            tracing::debug!("reopening audio devices after detached loop thread");
            let devices = self.backend.open(&config).inspect_err(|e| {
                self.events.error(e, true);
            })?;
            state.capture = Some(devices.capture);
            state.render = Some(devices.render);
        }
        let (Some(mut capture), Some(mut render)) = (state.capture.take(), state.render.take())
        else {
            return Err(VoicelinkError::AudioNotInitialized);
        };

        if let Err(e) = capture.start() {
            state.capture = Some(capture);
            state.render = Some(render);
            self.events.error(&e, true);
            return Err(e);
        }
        if let Err(e) = render.start() {
            if let Err(stop_err) = capture.stop() {
                tracing::warn!(error = %stop_err, "failed to stop capture device");
            }
            state.capture = Some(capture);
            state.render = Some(render);
            self.events.error(&e, true);
            return Err(e);
        }

        let running = Arc::new(AtomicBool::new(true));
        let frame_duration = Duration::from_millis(u64::from(config.frame_ms.max(1)));
        let sink = self
            .sink
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();

        let capture_loop = CaptureLoop::new(
            config.frame_samples(),
            frame_duration,
            running.clone(),
            self.mic_muted.clone(),
            sink,
            self.events.clone(),
            self.stats.clone(),
        );
        let playback_loop = PlaybackLoop::new(
            config.frame_samples(),
            frame_duration,
            running.clone(),
            self.speaker_muted.clone(),
            ring,
            self.events.clone(),
            self.stats.clone(),
        );

        let capture_thread = thread::Builder::new()
            .name("voicelink-capture".to_string())
            .spawn(move || capture_loop.run(capture))?;
        state.running = Some(running);
        state.capture_thread = Some(capture_thread);
        match thread::Builder::new()
            .name("voicelink-playback".to_string())
            .spawn(move || playback_loop.run(render))
        {
            Ok(handle) => state.playback_thread = Some(handle),
            Err(e) => {
                drop(state);
                self.stop();
                return Err(e.into());
            }
        }

        tracing::info!(frame_ms = config.frame_ms, "audio engine started");
        Ok(())
    }

    /// Stop both loops and the devices. Calling it while stopped is a no-op.
    ///
    /// Each loop thread gets `join_timeout` to exit; a thread that misses
    /// the deadline is detached and teardown continues without it.
    pub fn stop(&self) {
        let (generation, capture_thread, playback_thread) = {
            let mut state = self.lock_state();
            let Some(running) = state.running.take() else {
                return;
            };
            running.store(false, Ordering::Release);
            (
                state.generation,
                state.capture_thread.take(),
                state.playback_thread.take(),
            )
        };

        let capture = capture_thread.and_then(|h| join_with_timeout(h, self.join_timeout, "capture"));
        let render =
            playback_thread.and_then(|h| join_with_timeout(h, self.join_timeout, "playback"));

        self.release_devices(generation, capture, render);
        tracing::info!("audio engine stopped");
    }

    /// Stop devices returned by the loop threads and keep them for the next
    /// `start`, unless the session they belong to was disposed meanwhile.
    fn release_devices(
        &self,
        generation: u64,
        capture: Option<Box<dyn CaptureDevice>>,
        render: Option<Box<dyn RenderDevice>>,
    ) {
        let mut state = self.lock_state();
        let current = state.generation == generation && state.config.is_some();
        if let Some(mut capture) = capture {
            if let Err(e) = capture.stop() {
                tracing::warn!(error = %e, "failed to stop capture device");
            }
            if current {
                state.capture = Some(capture);
            }
        }
        if let Some(mut render) = render {
            if let Err(e) = render.stop() {
                tracing::warn!(error = %e, "failed to stop render device");
            }
            if current {
                state.render = Some(render);
            }
        }
        if !current {
            tracing::debug!("released devices of a disposed session");
        }
    }

    /// Stop and release everything owned by the session.
    ///
    /// Safe to call repeatedly and after a failed `initialize`.
    pub fn dispose(&self) {
        self.stop();
        let had_session = {
            let mut state = self.lock_state();
            let had_session = state.config.is_some();
            state.capture = None;
            state.render = None;
            state.config = None;
            state.session_id = None;
            state.aec = AecStatus::default();
            state.generation += 1;
            had_session
        };
        *self
            .playback
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
        self.paused.store(false, Ordering::Release);
        if had_session {
            tracing::debug!("audio engine disposed");
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock_state().running.is_some()
    }

    pub fn set_microphone_muted(&self, muted: bool) {
        self.mic_muted.store(muted, Ordering::Release);
        tracing::debug!(muted, "microphone mute changed");
    }

    pub fn set_speaker_muted(&self, muted: bool) {
        self.speaker_muted.store(muted, Ordering::Release);
        tracing::debug!(muted, "speaker mute changed");
    }

    pub fn is_microphone_muted(&self) -> bool {
        self.mic_muted.load(Ordering::Acquire)
    }

    pub fn is_speaker_muted(&self) -> bool {
        self.speaker_muted.load(Ordering::Acquire)
    }

    /// Agent-side pause. Playback keeps buffering; only `is_audible` changes.
    pub fn set_playback_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
    }

    pub fn is_playback_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Append PCM16 bytes to the playback ring. Dropped when not initialized.
    ///
    /// A chunk with an odd byte count is not PCM16 and is dropped whole, so
    /// the ring always stays aligned on sample boundaries.
    pub fn enqueue_for_playback(&self, bytes: &[u8]) {
        if bytes.len() % 2 != 0 {
            tracing::warn!(len = bytes.len(), "dropping odd-length playback chunk");
            return;
        }
        if let Some(ring) = self.ring() {
            ring.write(bytes);
        }
    }

    /// Discard all buffered playback audio.
    pub fn clear_playback_buffer(&self) {
        if let Some(ring) = self.ring() {
            ring.clear();
            tracing::debug!("playback buffer cleared");
        }
    }

    /// Echo cancellation for the open session, or platform support when idle.
    pub fn check_aec_availability(&self) -> bool {
        let state = self.lock_state();
        if state.config.is_some() {
            state.aec.is_supported
        } else {
            self.backend.aec_available()
        }
    }

    pub fn info(&self) -> AudioInfo {
        let ring = self.ring();
        let state = self.lock_state();
        let config = state.config.as_ref();
        let microphone_muted = self.is_microphone_muted();
        let speaker_muted = self.is_speaker_muted();
        let playback_paused = self.is_playback_paused();

        AudioInfo {
            initialized: config.is_some(),
            running: state.running.is_some(),
            sample_rate: config.map_or(0, |c| c.sample_rate),
            channels: config.map_or(0, |c| c.channels),
            frame_ms: config.map_or(0, |c| c.frame_ms),
            frame_samples: config.map_or(0, |c| c.frame_samples()),
            microphone_muted,
            speaker_muted,
            playback_paused,
            is_audible: !playback_paused && !speaker_muted,
            buffered_bytes: ring.as_ref().map_or(0, |r| r.available_bytes()),
            buffer_capacity_bytes: ring.as_ref().map_or(0, |r| r.capacity()),
            session_id: state.session_id.clone(),
            aec: state.aec.clone(),
            frames_captured: self.stats.frames_captured.load(Ordering::Relaxed),
            frames_sent: 0,
            frames_played: self.stats.frames_played.load(Ordering::Relaxed),
            underruns: self.stats.underruns.load(Ordering::Relaxed),
        }
    }

    fn ring(&self) -> Option<Arc<RingBuffer>> {
        self.playback
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn lock_state(&self) -> MutexGuard<'_, EngineState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for AudioEngine {
    fn drop(&mut self) {
        self.dispose();
    }
}
