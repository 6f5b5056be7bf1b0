//! Default configuration constants for voicelink.
//!
//! Shared by the config file, the connect request and the engine/transport
//! configs so every entry point agrees on the same policy values.

/// Default audio sample rate in Hz.
///
/// 16kHz mono PCM16 is what voice-agent servers expect on the wire.
pub const SAMPLE_RATE: u32 = 16000;

/// Channel count. Only mono is supported.
pub const CHANNELS: u16 = 1;

/// Duration of one audio frame (one hardware callback interval) in milliseconds.
pub const FRAME_MS: u32 = 20;

/// Playback ring buffer size in milliseconds of audio.
///
/// Bounds playback latency: anything older is overwritten.
pub const PLAYBACK_BUFFER_MS: u32 = 5000;

/// Maximum reconnect attempts after a connection drops or fails to open.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 3;

/// Fixed delay between reconnect attempts in milliseconds.
pub const RECONNECT_DELAY_MS: u64 = 1000;

/// A `ping` control message is sent after this many outbound audio frames.
pub const PING_INTERVAL_FRAMES: u64 = 1000;

/// Outbound queue depth in messages between the capture thread and the socket writer.
pub const OUTBOUND_QUEUE_FRAMES: usize = 64;

/// Timeout for a single connection-open attempt in milliseconds.
pub const CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Bounded join timeout for audio worker threads in milliseconds.
pub const JOIN_TIMEOUT_MS: u64 = 500;

/// Capacity of the caller-facing event queue.
pub const EVENT_QUEUE_SIZE: usize = 256;

/// Consecutive capture read failures tolerated before the capture loop gives up.
pub const MAX_CONSECUTIVE_CAPTURE_ERRORS: u32 = 10;

/// Number of bytes in one frame of mono PCM16 audio.
pub fn frame_bytes(sample_rate: u32, frame_ms: u32) -> usize {
    frame_samples(sample_rate, frame_ms) * 2
}

/// Number of samples in one frame of mono audio.
pub fn frame_samples(sample_rate: u32, frame_ms: u32) -> usize {
    (sample_rate as usize * frame_ms as usize) / 1000
}
