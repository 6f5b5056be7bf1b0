//! Real audio devices using CPAL (Cross-Platform Audio Library).

use crate::audio::device::{
    AecStatus, AudioBackend, AudioDevices, AudioSessionConfig, CaptureDevice, RenderDevice,
};
use crate::audio::wav::{WavFileSource, resample};
use crate::error::{Result, VoicelinkError};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Run a closure with stderr temporarily redirected to /dev/null.
///
/// CPAL probing makes ALSA/JACK/PipeWire print harmless but confusing
/// messages. Not safe if another thread is manipulating fd 2 concurrently.
fn with_suppressed_stderr<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    // SAFETY: dup/dup2/close on fd 2 and a freshly opened /dev/null fd; the
    // saved descriptor is restored before returning.
    unsafe {
        let saved_fd = libc::dup(2);
        let devnull = libc::open(c"/dev/null".as_ptr(), libc::O_WRONLY);
        if saved_fd >= 0 && devnull >= 0 {
            libc::dup2(devnull, 2);
            libc::close(devnull);
        }

        let result = f();

        if saved_fd >= 0 {
            libc::dup2(saved_fd, 2);
            libc::close(saved_fd);
        }

        result
    }
}

/// Keep JACK and PipeWire quiet while CPAL probes backends.
///
/// Must be called before any threads are spawned.
pub fn suppress_audio_warnings() {
    // SAFETY: called at startup before the runtime or any audio thread exists.
    unsafe {
        std::env::set_var("JACK_NO_START_SERVER", "1");
        std::env::set_var("JACK_NO_AUDIO_RESERVATION", "1");
        std::env::set_var("PIPEWIRE_DEBUG", "0");
        std::env::set_var("ALSA_DEBUG", "0");
        std::env::set_var("PW_LOG", "0");
    }
}

/// Preferred device names for PipeWire/PulseAudio desktops.
const PREFERRED_DEVICES: &[&str] = &["pipewire", "pulse", "PulseAudio"];

/// Device name patterns not useful for a voice call.
const FILTERED_PATTERNS: &[&str] = &[
    "surround",
    "front:",
    "rear:",
    "center:",
    "side:",
    "Digital Output",
    "HDMI",
    "S/PDIF",
];

fn should_filter_device(name: &str) -> bool {
    let lower = name.to_lowercase();
    FILTERED_PATTERNS
        .iter()
        .any(|pattern| lower.contains(&pattern.to_lowercase()))
}

fn is_preferred_device(name: &str) -> bool {
    let lower = name.to_lowercase();
    PREFERRED_DEVICES
        .iter()
        .any(|pref| lower.contains(&pref.to_lowercase()))
}

/// Which side of the duplex pair a device belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

impl Direction {
    fn label(self) -> &'static str {
        match self {
            Direction::Input => "input",
            Direction::Output => "output",
        }
    }
}

fn enumerate(host: &cpal::Host, direction: Direction) -> Result<Vec<cpal::Device>> {
    let devices: Vec<cpal::Device> = match direction {
        Direction::Input => host.input_devices().map(|d| d.collect()),
        Direction::Output => host.output_devices().map(|d| d.collect()),
    }
    .map_err(|e| VoicelinkError::AudioDeviceNotFound {
        device: format!("failed to enumerate {} devices: {}", direction.label(), e),
    })?;
    Ok(devices)
}

/// List usable devices, marking preferred ones with "\[recommended\]".
pub fn list_devices(direction: Direction) -> Result<Vec<String>> {
    let devices = with_suppressed_stderr(|| {
        let host = cpal::default_host();
        enumerate(&host, direction)
    })?;

    Ok(devices
        .iter()
        .filter_map(|device| device.name().ok())
        .filter(|name| !should_filter_device(name))
        .map(|name| {
            if is_preferred_device(&name) {
                format!("{} [recommended]", name)
            } else {
                name
            }
        })
        .collect())
}

/// Find a device by exact name, or the best default for `direction`.
fn find_device(name: Option<&str>, direction: Direction) -> Result<cpal::Device> {
    with_suppressed_stderr(|| {
        let host = cpal::default_host();
        let devices = enumerate(&host, direction)?;

        if let Some(name) = name {
            return devices
                .into_iter()
                .find(|dev| dev.name().is_ok_and(|n| n == name))
                .ok_or_else(|| VoicelinkError::AudioDeviceNotFound {
                    device: name.to_string(),
                });
        }

        if let Some(device) = devices
            .into_iter()
            .find(|dev| dev.name().is_ok_and(|n| is_preferred_device(&n)))
        {
            return Ok(device);
        }

        let default = match direction {
            Direction::Input => host.default_input_device(),
            Direction::Output => host.default_output_device(),
        };
        default.ok_or_else(|| VoicelinkError::AudioDeviceNotFound {
            device: format!("default {}", direction.label()),
        })
    })
}

/// Wrapper making `cpal::Stream` movable into the loop threads.
///
/// SAFETY: the stream is owned by exactly one device, which is only touched
/// by one thread at a time (the engine, or the loop thread that owns it).
struct SendableStream(cpal::Stream);

unsafe impl Send for SendableStream {}

fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

fn i16_to_f32(sample: i16) -> f32 {
    sample as f32 / i16::MAX as f32
}

/// Mix interleaved audio to mono and resample to `target_rate`.
fn convert_to_mono(samples: &[i16], channels: usize, source_rate: u32, target_rate: u32) -> Vec<i16> {
    let mono: Vec<i16> = if channels <= 1 {
        samples.to_vec()
    } else {
        samples
            .chunks_exact(channels)
            .map(|frame| {
                let sum: i32 = frame.iter().map(|&s| s as i32).sum();
                (sum / channels as i32) as i16
            })
            .collect()
    };
    resample(&mono, source_rate, target_rate)
}

/// Append to the capture buffer, dropping the oldest samples past `cap`.
fn push_capped(buffer: &Mutex<Vec<i16>>, samples: &[i16], cap: usize) {
    if let Ok(mut buf) = buffer.lock() {
        buf.extend_from_slice(samples);
        if buf.len() > cap {
            let excess = buf.len() - cap;
            buf.drain(..excess);
        }
    }
}

fn stream_error(err: cpal::StreamError) {
    tracing::warn!(error = %err, "audio stream error");
}

/// Microphone capture through CPAL.
///
/// Tries i16 mono at the session rate first, then f32, then the device's
/// native configuration with software mixing and resampling.
pub struct CpalCapture {
    device: cpal::Device,
    stream: Option<SendableStream>,
    buffer: Arc<Mutex<Vec<i16>>>,
    callback_count: Arc<AtomicU64>,
    sample_rate: u32,
}

impl CpalCapture {
    pub fn new(device_name: Option<&str>, sample_rate: u32) -> Result<Self> {
        let device = find_device(device_name, Direction::Input)?;
        Ok(Self {
            device,
            stream: None,
            buffer: Arc::new(Mutex::new(Vec::new())),
            callback_count: Arc::new(AtomicU64::new(0)),
            sample_rate,
        })
    }

    /// About one second; the capture loop drains every frame period.
    fn buffer_cap(&self) -> usize {
        self.sample_rate as usize
    }

    fn build_stream(&self) -> Result<cpal::Stream> {
        let preferred_config = cpal::StreamConfig {
            channels: 1,
            sample_rate: cpal::SampleRate(self.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };
        let cap = self.buffer_cap();

        let buffer = Arc::clone(&self.buffer);
        let counter = Arc::clone(&self.callback_count);
        if let Ok(stream) = self.device.build_input_stream(
            &preferred_config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                counter.fetch_add(1, Ordering::Relaxed);
                push_capped(&buffer, data, cap);
            },
            stream_error,
            None,
        ) {
            return Ok(stream);
        }

        let buffer = Arc::clone(&self.buffer);
        let counter = Arc::clone(&self.callback_count);
        if let Ok(stream) = self.device.build_input_stream(
            &preferred_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                counter.fetch_add(1, Ordering::Relaxed);
                let converted: Vec<i16> = data.iter().map(|&s| f32_to_i16(s)).collect();
                push_capped(&buffer, &converted, cap);
            },
            stream_error,
            None,
        ) {
            return Ok(stream);
        }

        self.build_stream_native()
    }

    /// Capture at the device's own rate/channels and convert in software.
    ///
    /// Some PipeWire-ALSA setups accept non-native configs but never fire
    /// the data callback; this path always works.
    fn build_stream_native(&self) -> Result<cpal::Stream> {
        use cpal::SampleFormat;

        let default_config =
            self.device
                .default_input_config()
                .map_err(|e| VoicelinkError::AudioCapture {
                    message: format!("Failed to query default input config: {}", e),
                })?;

        let native_rate = default_config.sample_rate().0;
        let native_channels = default_config.channels() as usize;
        let target_rate = self.sample_rate;
        let stream_config: cpal::StreamConfig = default_config.clone().into();
        let cap = self.buffer_cap();

        tracing::info!(
            channels = native_channels,
            rate = native_rate,
            format = ?default_config.sample_format(),
            "using native capture format, converting in software"
        );

        let buffer = Arc::clone(&self.buffer);
        let counter = Arc::clone(&self.callback_count);

        match default_config.sample_format() {
            SampleFormat::I16 => self
                .device
                .build_input_stream(
                    &stream_config,
                    move |data: &[i16], _: &cpal::InputCallbackInfo| {
                        counter.fetch_add(1, Ordering::Relaxed);
                        let converted =
                            convert_to_mono(data, native_channels, native_rate, target_rate);
                        push_capped(&buffer, &converted, cap);
                    },
                    stream_error,
                    None,
                )
                .map_err(|e| VoicelinkError::AudioCapture {
                    message: format!("Failed to build native i16 input stream: {}", e),
                }),
            SampleFormat::F32 => self
                .device
                .build_input_stream(
                    &stream_config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        counter.fetch_add(1, Ordering::Relaxed);
                        let i16_data: Vec<i16> = data.iter().map(|&s| f32_to_i16(s)).collect();
                        let converted =
                            convert_to_mono(&i16_data, native_channels, native_rate, target_rate);
                        push_capped(&buffer, &converted, cap);
                    },
                    stream_error,
                    None,
                )
                .map_err(|e| VoicelinkError::AudioCapture {
                    message: format!("Failed to build native f32 input stream: {}", e),
                }),
            fmt => Err(VoicelinkError::AudioCapture {
                message: format!(
                    "Unsupported native sample format: {:?}. Try another input device.",
                    fmt
                ),
            }),
        }
    }
}

impl CaptureDevice for CpalCapture {
    fn start(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        self.callback_count.store(0, Ordering::Relaxed);

        let stream = self.build_stream()?;
        stream.play().map_err(|e| VoicelinkError::AudioCapture {
            message: format!("Failed to start input stream: {}", e),
        })?;

        // Preferred configs may be accepted yet never deliver data.
        std::thread::sleep(Duration::from_millis(200));
        let stream = if self.callback_count.load(Ordering::Relaxed) == 0 {
            drop(stream);
            if let Ok(mut buf) = self.buffer.lock() {
                buf.clear();
            }
            let native = self.build_stream_native()?;
            native.play().map_err(|e| VoicelinkError::AudioCapture {
                message: format!("Failed to start native input stream: {}", e),
            })?;
            native
        } else {
            stream
        };

        self.stream = Some(SendableStream(stream));
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.take() {
            stream.0.pause().map_err(|e| VoicelinkError::AudioCapture {
                message: format!("Failed to stop input stream: {}", e),
            })?;
        }
        Ok(())
    }

    fn read_samples(&mut self) -> Result<Vec<i16>> {
        let mut buffer = self.buffer.lock().map_err(|e| VoicelinkError::AudioCapture {
            message: format!("Failed to lock capture buffer: {}", e),
        })?;
        Ok(std::mem::take(&mut *buffer))
    }
}

/// Samples queued between the playback loop and the output callback.
///
/// Bounded to a few frames so device clock drift cannot build latency.
struct RenderQueue {
    samples: Mutex<VecDeque<i16>>,
    cap: usize,
}

impl RenderQueue {
    fn push(&self, samples: &[i16]) {
        if let Ok(mut queue) = self.samples.lock() {
            queue.extend(samples.iter().copied());
            while queue.len() > self.cap {
                queue.pop_front();
            }
        }
    }

    /// Fill `out` with queued samples, silence for any shortfall.
    fn pop_into<T>(&self, out: &mut [T], convert: impl Fn(i16) -> T) {
        let mut queue = self.samples.lock().ok();
        for slot in out.iter_mut() {
            let sample = queue.as_mut().and_then(|q| q.pop_front()).unwrap_or(0);
            *slot = convert(sample);
        }
    }

    fn clear(&self) {
        if let Ok(mut queue) = self.samples.lock() {
            queue.clear();
        }
    }
}

/// Speaker output through CPAL.
pub struct CpalRender {
    device: cpal::Device,
    stream: Option<SendableStream>,
    queue: Arc<RenderQueue>,
    sample_rate: u32,
}

impl CpalRender {
    pub fn new(device_name: Option<&str>, sample_rate: u32) -> Result<Self> {
        let device = find_device(device_name, Direction::Output)?;
        Ok(Self {
            device,
            stream: None,
            queue: Arc::new(RenderQueue {
                samples: Mutex::new(VecDeque::new()),
                // ~200 ms
                cap: (sample_rate / 5).max(1) as usize,
            }),
            sample_rate,
        })
    }

    fn build_stream(&self) -> Result<cpal::Stream> {
        let preferred_config = cpal::StreamConfig {
            channels: 1,
            sample_rate: cpal::SampleRate(self.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let queue = Arc::clone(&self.queue);
        if let Ok(stream) = self.device.build_output_stream(
            &preferred_config,
            move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                queue.pop_into(data, |s| s);
            },
            stream_error,
            None,
        ) {
            return Ok(stream);
        }

        let queue = Arc::clone(&self.queue);
        if let Ok(stream) = self.device.build_output_stream(
            &preferred_config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                queue.pop_into(data, i16_to_f32);
            },
            stream_error,
            None,
        ) {
            return Ok(stream);
        }

        self.build_stream_native()
    }

    /// Render at the device's own rate/channels: each mono sample is held
    /// for `native_rate / session_rate` output frames and copied to every
    /// channel.
    fn build_stream_native(&self) -> Result<cpal::Stream> {
        use cpal::SampleFormat;

        let default_config =
            self.device
                .default_output_config()
                .map_err(|e| VoicelinkError::AudioRender {
                    message: format!("Failed to query default output config: {}", e),
                })?;

        let native_rate = default_config.sample_rate().0;
        let channels = (default_config.channels() as usize).max(1);
        let step = self.sample_rate as f64 / native_rate.max(1) as f64;
        let stream_config: cpal::StreamConfig = default_config.clone().into();

        tracing::info!(
            channels,
            rate = native_rate,
            format = ?default_config.sample_format(),
            "using native render format, converting in software"
        );

        let queue = Arc::clone(&self.queue);
        let mut phase = 1.0f64;
        let mut current = 0i16;
        let mut next_sample = move |queue: &RenderQueue| -> i16 {
            phase += step;
            while phase >= 1.0 {
                let mut one = [0i16];
                queue.pop_into(&mut one, |s| s);
                current = one[0];
                phase -= 1.0;
            }
            current
        };

        match default_config.sample_format() {
            SampleFormat::I16 => self
                .device
                .build_output_stream(
                    &stream_config,
                    move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                        for frame in data.chunks_mut(channels) {
                            frame.fill(next_sample(queue.as_ref()));
                        }
                    },
                    stream_error,
                    None,
                )
                .map_err(|e| VoicelinkError::AudioRender {
                    message: format!("Failed to build native i16 output stream: {}", e),
                }),
            SampleFormat::F32 => self
                .device
                .build_output_stream(
                    &stream_config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        for frame in data.chunks_mut(channels) {
                            frame.fill(i16_to_f32(next_sample(queue.as_ref())));
                        }
                    },
                    stream_error,
                    None,
                )
                .map_err(|e| VoicelinkError::AudioRender {
                    message: format!("Failed to build native f32 output stream: {}", e),
                }),
            fmt => Err(VoicelinkError::AudioRender {
                message: format!(
                    "Unsupported native sample format: {:?}. Try another output device.",
                    fmt
                ),
            }),
        }
    }
}

impl RenderDevice for CpalRender {
    fn start(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        self.queue.clear();
        let stream = self.build_stream()?;
        stream.play().map_err(|e| VoicelinkError::AudioRender {
            message: format!("Failed to start output stream: {}", e),
        })?;
        self.stream = Some(SendableStream(stream));
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.take() {
            stream.0.pause().map_err(|e| VoicelinkError::AudioRender {
                message: format!("Failed to stop output stream: {}", e),
            })?;
        }
        self.queue.clear();
        Ok(())
    }

    fn write_samples(&mut self, samples: &[i16]) -> Result<()> {
        self.queue.push(samples);
        Ok(())
    }
}

/// Backend opening the default (or named) CPAL input and output devices.
///
/// CPAL exposes no echo-cancellation control, so AEC is reported as
/// unsupported; the capture path still runs at the session cadence.
#[derive(Debug, Clone, Default)]
pub struct CpalBackend {
    pub input_device: Option<String>,
    pub output_device: Option<String>,
    /// Replay this WAV file instead of opening a microphone.
    pub input_wav: Option<PathBuf>,
}

impl CpalBackend {
    pub fn new(input_device: Option<String>, output_device: Option<String>) -> Self {
        Self {
            input_device,
            output_device,
            input_wav: None,
        }
    }

    /// Use a WAV file as the capture source.
    pub fn with_input_wav(mut self, path: impl Into<PathBuf>) -> Self {
        self.input_wav = Some(path.into());
        self
    }
}

impl AudioBackend for CpalBackend {
    fn name(&self) -> &str {
        if self.input_wav.is_some() { "cpal+wav" } else { "cpal" }
    }

    fn open(&self, config: &AudioSessionConfig) -> Result<AudioDevices> {
        let capture: Box<dyn CaptureDevice> = match &self.input_wav {
            Some(path) => Box::new(WavFileSource::open(path, config.sample_rate)?),
            None => Box::new(CpalCapture::new(
                self.input_device.as_deref(),
                config.sample_rate,
            )?),
        };
        let render = CpalRender::new(self.output_device.as_deref(), config.sample_rate)?;
        tracing::debug!(
            session_id = %config.session_id,
            noise_suppression = config.noise_suppression,
            auto_gain_control = config.auto_gain_control,
            "opened cpal devices"
        );
        Ok(AudioDevices {
            capture,
            render: Box::new(render),
            session_id: config.session_id.clone(),
            aec: AecStatus {
                is_enabled: false,
                is_supported: false,
                kind: None,
            },
        })
    }

    fn aec_available(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_filter_device() {
        assert!(should_filter_device("surround51"));
        assert!(should_filter_device("front:CARD=PCH"));
        assert!(should_filter_device("HDMI Output"));
        assert!(!should_filter_device("pipewire"));
        assert!(!should_filter_device("Built-in Audio"));
    }

    #[test]
    fn test_is_preferred_device() {
        assert!(is_preferred_device("PipeWire"));
        assert!(is_preferred_device("pulse"));
        assert!(!is_preferred_device("hw:0,0"));
    }

    #[test]
    fn test_convert_to_mono_downmixes_and_resamples() {
        let stereo = [100i16, 300, 100, 300, 100, 300, 100, 300];
        assert_eq!(convert_to_mono(&stereo, 2, 16000, 16000), vec![200; 4]);
        assert_eq!(convert_to_mono(&stereo, 2, 32000, 16000).len(), 2);
    }

    #[test]
    fn test_push_capped_drops_oldest() {
        let buffer = Mutex::new(Vec::new());
        push_capped(&buffer, &[1, 2, 3], 4);
        push_capped(&buffer, &[4, 5], 4);
        assert_eq!(*buffer.lock().unwrap(), vec![2, 3, 4, 5]);
    }

    #[test]
    fn test_render_queue_pads_with_silence() {
        let queue = RenderQueue {
            samples: Mutex::new(VecDeque::new()),
            cap: 4,
        };
        queue.push(&[1, 2, 3, 4, 5, 6]);
        let mut out = [9i16; 6];
        queue.pop_into(&mut out, |s| s);
        assert_eq!(out, [3, 4, 5, 6, 0, 0]);
    }

    #[test]
    fn test_sample_conversion_bounds() {
        assert_eq!(f32_to_i16(2.0), i16::MAX);
        assert_eq!(f32_to_i16(0.0), 0);
        assert!((i16_to_f32(i16::MAX) - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_invalid_device_name_is_not_found() {
        match CpalCapture::new(Some("NonExistentDevice12345"), 16000) {
            Err(VoicelinkError::AudioDeviceNotFound { .. }) => {}
            Err(other) => panic!("Expected AudioDeviceNotFound, got {:?}", other),
            Ok(_) => panic!("Expected AudioDeviceNotFound, got a device"),
        }
    }

    #[test]
    #[ignore] // Requires audio hardware
    fn test_list_devices_returns_devices() {
        let inputs = list_devices(Direction::Input).unwrap();
        assert!(!inputs.is_empty(), "Expected at least one input device");
        assert!(inputs.iter().all(|d| !d.to_lowercase().contains("hdmi")));
    }

    #[test]
    #[ignore] // Requires audio hardware
    fn test_open_start_and_stop_devices() {
        let backend = CpalBackend::default();
        let mut devices = backend.open(&AudioSessionConfig::default()).unwrap();
        devices.capture.start().unwrap();
        devices.render.start().unwrap();
        devices.render.write_samples(&[0; 320]).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        assert!(devices.capture.read_samples().is_ok());
        devices.capture.stop().unwrap();
        devices.render.stop().unwrap();
    }
}
