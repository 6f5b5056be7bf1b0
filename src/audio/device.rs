//! Audio device abstraction.
//!
//! Platform audio plumbing is reduced to three capabilities: a capture
//! device, a render device and the session correlation id that binds the two
//! for the echo canceller. Everything above this module is platform-neutral.

use crate::defaults;
use crate::error::{Result, VoicelinkError};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Trait for capture devices (microphone, file replay, mock).
pub trait CaptureDevice: Send {
    /// Start delivering samples.
    fn start(&mut self) -> Result<()>;

    /// Stop delivering samples.
    fn stop(&mut self) -> Result<()>;

    /// Drain samples captured since the last call.
    ///
    /// Returns an empty vector when nothing new is available. Must not block.
    fn read_samples(&mut self) -> Result<Vec<i16>>;
}

/// Trait for render devices (speaker, mock).
pub trait RenderDevice: Send {
    /// Start the output stream.
    fn start(&mut self) -> Result<()>;

    /// Stop the output stream.
    fn stop(&mut self) -> Result<()>;

    /// Hand one frame of mono samples to the device. Must not block.
    fn write_samples(&mut self, samples: &[i16]) -> Result<()>;
}

/// Echo-cancellation availability as reported by the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
pub struct AecStatus {
    pub is_enabled: bool,
    pub is_supported: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

/// Per-session audio parameters. Immutable once the engine is initialized.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioSessionConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_ms: u32,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    pub microphone_muted: bool,
    pub speaker_muted: bool,
    pub playback_buffer_ms: u32,
    /// Correlates capture and render devices for echo cancellation.
    pub session_id: String,
}

impl Default for AudioSessionConfig {
    fn default() -> Self {
        Self {
            sample_rate: defaults::SAMPLE_RATE,
            channels: defaults::CHANNELS,
            frame_ms: defaults::FRAME_MS,
            noise_suppression: true,
            auto_gain_control: true,
            microphone_muted: false,
            speaker_muted: false,
            playback_buffer_ms: defaults::PLAYBACK_BUFFER_MS,
            session_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

impl AudioSessionConfig {
    /// Samples per frame.
    pub fn frame_samples(&self) -> usize {
        defaults::frame_samples(self.sample_rate, self.frame_ms)
    }

    /// Bytes per frame of PCM16 mono.
    pub fn frame_bytes(&self) -> usize {
        defaults::frame_bytes(self.sample_rate, self.frame_ms)
    }

    /// Playback ring capacity in bytes.
    pub fn playback_buffer_bytes(&self) -> usize {
        defaults::frame_bytes(self.sample_rate, self.playback_buffer_ms)
    }
}

/// Devices opened for one session, bound to the same correlation id.
pub struct AudioDevices {
    pub capture: Box<dyn CaptureDevice>,
    pub render: Box<dyn RenderDevice>,
    pub session_id: String,
    pub aec: AecStatus,
}

/// Platform audio backend.
pub trait AudioBackend: Send + Sync {
    /// Human-readable backend name.
    fn name(&self) -> &str;

    /// Allocate capture and render devices for a session.
    fn open(&self, config: &AudioSessionConfig) -> Result<AudioDevices>;

    /// Whether this platform offers hardware/OS echo cancellation.
    fn aec_available(&self) -> bool;
}

/// Observable state shared between a mock capture device and the test.
#[derive(Debug, Default)]
pub struct MockCaptureStats {
    pub reads: AtomicU64,
    pub started: AtomicBool,
}

/// Mock capture device that returns the same frame on every read.
#[derive(Debug, Clone)]
pub struct MockCaptureDevice {
    samples: Vec<i16>,
    should_fail_start: bool,
    should_fail_read: bool,
    error_message: String,
    stats: Arc<MockCaptureStats>,
}

impl MockCaptureDevice {
    /// Create a mock that yields 320 zero samples per read.
    pub fn new() -> Self {
        Self {
            samples: vec![0i16; 320],
            should_fail_start: false,
            should_fail_read: false,
            error_message: "mock audio error".to_string(),
            stats: Arc::new(MockCaptureStats::default()),
        }
    }

    /// Configure the samples returned by each read.
    pub fn with_samples(mut self, samples: Vec<i16>) -> Self {
        self.samples = samples;
        self
    }

    /// Configure the mock to fail on start.
    pub fn with_start_failure(mut self) -> Self {
        self.should_fail_start = true;
        self
    }

    /// Configure the mock to fail on every read.
    pub fn with_read_failure(mut self) -> Self {
        self.should_fail_read = true;
        self
    }

    /// Configure the error message for failures.
    pub fn with_error_message(mut self, message: &str) -> Self {
        self.error_message = message.to_string();
        self
    }

    /// Shared counters for assertions.
    pub fn stats(&self) -> Arc<MockCaptureStats> {
        Arc::clone(&self.stats)
    }
}

impl Default for MockCaptureDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureDevice for MockCaptureDevice {
    fn start(&mut self) -> Result<()> {
        if self.should_fail_start {
            return Err(VoicelinkError::AudioCapture {
                message: self.error_message.clone(),
            });
        }
        self.stats.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.stats.started.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn read_samples(&mut self) -> Result<Vec<i16>> {
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        if self.should_fail_read {
            return Err(VoicelinkError::AudioCapture {
                message: self.error_message.clone(),
            });
        }
        Ok(self.samples.clone())
    }
}

/// Mock render device that records every frame it receives.
#[derive(Debug, Clone, Default)]
pub struct MockRenderDevice {
    frames: Arc<Mutex<VecDeque<Vec<i16>>>>,
    started: Arc<AtomicBool>,
}

impl MockRenderDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all frames written so far.
    pub fn frames(&self) -> Vec<Vec<i16>> {
        self.frames
            .lock()
            .map(|f| f.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether the render stream is currently started.
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

impl RenderDevice for MockRenderDevice {
    fn start(&mut self) -> Result<()> {
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.started.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn write_samples(&mut self, samples: &[i16]) -> Result<()> {
        let mut frames = self.frames.lock().map_err(|e| VoicelinkError::AudioRender {
            message: format!("Failed to lock mock frames: {}", e),
        })?;
        frames.push_back(samples.to_vec());
        Ok(())
    }
}

/// Backend producing mock devices, for tests and headless use.
pub struct MockAudioBackend {
    capture: MockCaptureDevice,
    render: MockRenderDevice,
    aec: AecStatus,
    fail_open: bool,
    opens: AtomicU64,
}

impl MockAudioBackend {
    pub fn new() -> Self {
        Self {
            capture: MockCaptureDevice::new(),
            render: MockRenderDevice::new(),
            aec: AecStatus {
                is_enabled: true,
                is_supported: true,
                kind: Some("mock".to_string()),
            },
            fail_open: false,
            opens: AtomicU64::new(0),
        }
    }

    /// Use this capture device template for every opened session.
    pub fn with_capture(mut self, capture: MockCaptureDevice) -> Self {
        self.capture = capture;
        self
    }

    /// Report this echo-cancellation status.
    pub fn with_aec(mut self, aec: AecStatus) -> Self {
        self.aec = aec;
        self
    }

    /// Fail every `open` call as if the device were unavailable.
    pub fn with_open_failure(mut self) -> Self {
        self.fail_open = true;
        self
    }

    /// Render device shared by every opened session.
    pub fn render(&self) -> MockRenderDevice {
        self.render.clone()
    }

    /// Capture counters shared by every opened session.
    pub fn capture_stats(&self) -> Arc<MockCaptureStats> {
        self.capture.stats()
    }

    /// Number of successful `open` calls.
    pub fn open_count(&self) -> u64 {
        self.opens.load(Ordering::SeqCst)
    }
}

impl Default for MockAudioBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioBackend for MockAudioBackend {
    fn name(&self) -> &str {
        "mock"
    }

    fn open(&self, config: &AudioSessionConfig) -> Result<AudioDevices> {
        if self.fail_open {
            return Err(VoicelinkError::AudioDeviceNotFound {
                device: "mock".to_string(),
            });
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(AudioDevices {
            capture: Box::new(self.capture.clone()),
            render: Box::new(self.render.clone()),
            session_id: config.session_id.clone(),
            aec: self.aec.clone(),
        })
    }

    fn aec_available(&self) -> bool {
        self.aec.is_supported
    }
}
