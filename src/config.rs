use crate::audio::device::AudioSessionConfig;
use crate::defaults;
use crate::error::{Result, VoicelinkError};
use crate::transport::client::TransportConfig;
use crate::transport::protocol::PendingConnection;
use crate::transport::reconnect::ReconnectPolicy;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub connection: ConnectionConfig,
    pub audio: AudioConfig,
    pub reconnect: ReconnectConfig,
    pub transport: TransportSettings,
    pub events: EventsConfig,
}

/// Voice server and agent to talk to
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectionConfig {
    pub endpoint: String,
    pub agent_id: String,
    pub public_key: String,
    pub include_metadata_in_prompt: bool,
    /// Sent in the `initiate` message when non-empty.
    pub metadata: Map<String, Value>,
}

/// Audio session configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub frame_ms: u32,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    pub playback_buffer_ms: u32,
    pub input_device: Option<String>,
    pub output_device: Option<String>,
}

/// Reconnection policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconnectConfig {
    pub enabled: bool,
    pub max_attempts: u32,
    pub delay_ms: u64,
}

/// Transport tuning
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransportSettings {
    pub ping_interval_frames: u64,
    pub outbound_queue_frames: usize,
    pub connect_timeout_ms: u64,
    pub join_timeout_ms: u64,
}

/// Caller-facing event stream
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EventsConfig {
    pub queue_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            agent_id: String::new(),
            public_key: String::new(),
            include_metadata_in_prompt: true,
            metadata: Map::new(),
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: defaults::SAMPLE_RATE,
            frame_ms: defaults::FRAME_MS,
            noise_suppression: true,
            auto_gain_control: true,
            playback_buffer_ms: defaults::PLAYBACK_BUFFER_MS,
            input_device: None,
            output_device: None,
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: defaults::MAX_RECONNECT_ATTEMPTS,
            delay_ms: defaults::RECONNECT_DELAY_MS,
        }
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            ping_interval_frames: defaults::PING_INTERVAL_FRAMES,
            outbound_queue_frames: defaults::OUTBOUND_QUEUE_FRAMES,
            connect_timeout_ms: defaults::CONNECT_TIMEOUT_MS,
            join_timeout_ms: defaults::JOIN_TIMEOUT_MS,
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            queue_size: defaults::EVENT_QUEUE_SIZE,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Missing fields use default values.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                VoicelinkError::ConfigFileNotFound {
                    path: path.display().to_string(),
                }
            } else {
                VoicelinkError::Io(e)
            }
        })?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from a file or return defaults if it doesn't exist
    ///
    /// Invalid TOML is still an error.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        match Self::load(path) {
            Ok(config) => Ok(config),
            Err(VoicelinkError::ConfigFileNotFound { .. }) => Ok(Self::default()),
            Err(e) => Err(e),
        }
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - VOICELINK_ENDPOINT → connection.endpoint
    /// - VOICELINK_AGENT_ID → connection.agent_id
    /// - VOICELINK_PUBLIC_KEY → connection.public_key
    /// - VOICELINK_INPUT_DEVICE → audio.input_device
    /// - VOICELINK_OUTPUT_DEVICE → audio.output_device
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(endpoint) = non_empty_env("VOICELINK_ENDPOINT") {
            self.connection.endpoint = endpoint;
        }
        if let Some(agent_id) = non_empty_env("VOICELINK_AGENT_ID") {
            self.connection.agent_id = agent_id;
        }
        if let Some(public_key) = non_empty_env("VOICELINK_PUBLIC_KEY") {
            self.connection.public_key = public_key;
        }
        if let Some(device) = non_empty_env("VOICELINK_INPUT_DEVICE") {
            self.audio.input_device = Some(device);
        }
        if let Some(device) = non_empty_env("VOICELINK_OUTPUT_DEVICE") {
            self.audio.output_device = Some(device);
        }
        self
    }

    /// Get the default configuration file path
    ///
    /// Returns ~/.config/voicelink/config.toml on Linux
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("voicelink")
            .join("config.toml")
    }

    /// Build a connect request from this configuration.
    pub fn connect_request(&self) -> ConnectRequest {
        ConnectRequest {
            endpoint: self.connection.endpoint.clone(),
            agent_id: self.connection.agent_id.clone(),
            public_key: self.connection.public_key.clone(),
            metadata: (!self.connection.metadata.is_empty())
                .then(|| self.connection.metadata.clone()),
            include_metadata_in_prompt: self.connection.include_metadata_in_prompt,
            sample_rate: self.audio.sample_rate,
            frame_ms: self.audio.frame_ms,
            enable_noise_suppression: self.audio.noise_suppression,
            enable_auto_gain_control: self.audio.auto_gain_control,
            playback_buffer_ms: self.audio.playback_buffer_ms,
            microphone_muted: false,
            speaker_muted: false,
            auto_reconnect: self.reconnect.enabled,
            max_reconnect_attempts: self.reconnect.max_attempts,
            reconnect_delay_ms: self.reconnect.delay_ms,
            ping_interval_frames: self.transport.ping_interval_frames,
            outbound_queue_frames: self.transport.outbound_queue_frames,
            connect_timeout_ms: self.transport.connect_timeout_ms,
            join_timeout_ms: self.transport.join_timeout_ms,
        }
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

/// Everything needed to start one session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectRequest {
    pub endpoint: String,
    pub agent_id: String,
    pub public_key: String,
    pub metadata: Option<Map<String, Value>>,
    pub include_metadata_in_prompt: bool,
    pub sample_rate: u32,
    pub frame_ms: u32,
    pub enable_noise_suppression: bool,
    pub enable_auto_gain_control: bool,
    pub playback_buffer_ms: u32,
    pub microphone_muted: bool,
    pub speaker_muted: bool,
    pub auto_reconnect: bool,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
    pub ping_interval_frames: u64,
    pub outbound_queue_frames: usize,
    pub connect_timeout_ms: u64,
    pub join_timeout_ms: u64,
}

impl Default for ConnectRequest {
    fn default() -> Self {
        Config::default().connect_request()
    }
}

impl ConnectRequest {
    pub fn new(endpoint: &str, agent_id: &str, public_key: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            agent_id: agent_id.to_string(),
            public_key: public_key.to_string(),
            ..Self::default()
        }
    }

    /// Reject bad arguments before any device or socket is touched.
    pub fn validate(&self) -> Result<()> {
        let invalid = |key: &str, message: String| VoicelinkError::ConfigInvalidValue {
            key: key.to_string(),
            message,
        };

        let host = self
            .endpoint
            .strip_prefix("wss://")
            .or_else(|| self.endpoint.strip_prefix("ws://"));
        match host {
            None => {
                return Err(invalid(
                    "endpoint",
                    format!("'{}' is not a ws:// or wss:// URL", self.endpoint),
                ));
            }
            Some(rest) if rest.is_empty() || rest.starts_with('/') => {
                return Err(invalid(
                    "endpoint",
                    format!("'{}' has no host", self.endpoint),
                ));
            }
            Some(_) => {}
        }
        if self.agent_id.trim().is_empty() {
            return Err(invalid("agent_id", "must not be empty".to_string()));
        }
        if !(8_000..=48_000).contains(&self.sample_rate) {
            return Err(invalid(
                "sample_rate",
                format!("{} Hz is outside 8000..=48000", self.sample_rate),
            ));
        }
        if self.frame_ms == 0 {
            return Err(invalid("frame_ms", "must be at least 1 ms".to_string()));
        }
        if self.playback_buffer_ms < self.frame_ms {
            return Err(invalid(
                "playback_buffer_ms",
                format!("must hold at least one {} ms frame", self.frame_ms),
            ));
        }
        if self.max_reconnect_attempts > 100 {
            return Err(invalid(
                "max_reconnect_attempts",
                format!("{} exceeds the limit of 100", self.max_reconnect_attempts),
            ));
        }
        Ok(())
    }

    /// Connection parameters replayed on every reconnect.
    pub fn pending_connection(&self) -> PendingConnection {
        PendingConnection {
            endpoint: self.endpoint.clone(),
            agent_id: self.agent_id.clone(),
            public_key: self.public_key.clone(),
            metadata: self.metadata.clone(),
            include_metadata_in_prompt: self.include_metadata_in_prompt,
        }
    }

    /// Audio parameters, with a fresh session correlation id.
    pub fn audio_session_config(&self) -> AudioSessionConfig {
        AudioSessionConfig {
            sample_rate: self.sample_rate,
            channels: defaults::CHANNELS,
            frame_ms: self.frame_ms,
            noise_suppression: self.enable_noise_suppression,
            auto_gain_control: self.enable_auto_gain_control,
            microphone_muted: self.microphone_muted,
            speaker_muted: self.speaker_muted,
            playback_buffer_ms: self.playback_buffer_ms,
            ..AudioSessionConfig::default()
        }
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            reconnect: ReconnectPolicy {
                enabled: self.auto_reconnect,
                max_attempts: self.max_reconnect_attempts,
                delay: Duration::from_millis(self.reconnect_delay_ms),
            },
            ping_interval_frames: self.ping_interval_frames,
            outbound_queue_frames: self.outbound_queue_frames,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            join_timeout: Duration::from_millis(self.join_timeout_ms),
        }
    }
}
