//! Error types for voicelink.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum VoicelinkError {
    // Configuration errors
    #[error("Configuration file not found at {path}")]
    ConfigFileNotFound { path: String },

    #[error("Invalid configuration value for {key}: {message}")]
    ConfigInvalidValue { key: String, message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    // Audio device errors
    #[error("Audio device not found: {device}")]
    AudioDeviceNotFound { device: String },

    #[error("Audio capture failed: {message}")]
    AudioCapture { message: String },

    #[error("Audio render failed: {message}")]
    AudioRender { message: String },

    #[error("Audio engine is not initialized")]
    AudioNotInitialized,

    // Transport errors
    #[error("Connection to {endpoint} failed: {message}")]
    ConnectionFailed { endpoint: String, message: String },

    #[error("Not connected to the voice server")]
    NotConnected,

    #[error("Failed to send message: {message}")]
    SendFailed { message: String },

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    // General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Generic error for cases not covered above
    #[error("{0}")]
    Other(String),
}

impl VoicelinkError {
    /// Stable machine-readable code, reported as `SessionEvent::Error::code`.
    pub fn code(&self) -> &'static str {
        match self {
            VoicelinkError::ConfigFileNotFound { .. }
            | VoicelinkError::ConfigInvalidValue { .. }
            | VoicelinkError::Config(_) => "invalid_config",
            VoicelinkError::AudioDeviceNotFound { .. } => "audio_device_unavailable",
            VoicelinkError::AudioCapture { .. } => "audio_capture",
            VoicelinkError::AudioRender { .. } => "audio_render",
            VoicelinkError::AudioNotInitialized => "audio_not_initialized",
            VoicelinkError::ConnectionFailed { .. } => "connection_failed",
            VoicelinkError::NotConnected => "not_connected",
            VoicelinkError::SendFailed { .. } => "send_failed",
            VoicelinkError::Protocol { .. } | VoicelinkError::Json(_) => "protocol",
            VoicelinkError::Io(_) => "io",
            VoicelinkError::Other(_) => "internal",
        }
    }
}

// Type alias for convenience
pub type Result<T> = std::result::Result<T, VoicelinkError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_config_invalid_value_display() {
        let error = VoicelinkError::ConfigInvalidValue {
            key: "endpoint".to_string(),
            message: "must start with ws:// or wss://".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Invalid configuration value for endpoint: must start with ws:// or wss://"
        );
        assert_eq!(error.code(), "invalid_config");
    }

    #[test]
    fn test_audio_device_not_found_display() {
        let error = VoicelinkError::AudioDeviceNotFound {
            device: "default".to_string(),
        };
        assert_eq!(error.to_string(), "Audio device not found: default");
        assert_eq!(error.code(), "audio_device_unavailable");
    }

    #[test]
    fn test_connection_failed_display() {
        let error = VoicelinkError::ConnectionFailed {
            endpoint: "ws://localhost:1".to_string(),
            message: "connection refused".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Connection to ws://localhost:1 failed: connection refused"
        );
        assert_eq!(error.code(), "connection_failed");
    }

    #[test]
    fn test_not_connected_display() {
        assert_eq!(
            VoicelinkError::NotConnected.to_string(),
            "Not connected to the voice server"
        );
        assert_eq!(VoicelinkError::NotConnected.code(), "not_connected");
    }

    #[test]
    fn test_from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let error: VoicelinkError = io_error.into();
        assert!(error.to_string().contains("file not found"));
        assert_eq!(error.code(), "io");
    }

    #[test]
    fn test_from_toml_error() {
        let toml_error = toml::from_str::<toml::Value>("invalid = toml = syntax").unwrap_err();
        let error: VoicelinkError = toml_error.into();
        assert!(error.to_string().contains("Configuration error"));
    }

    #[test]
    fn test_from_json_error_is_protocol() {
        let json_error = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let error: VoicelinkError = json_error.into();
        assert_eq!(error.code(), "protocol");
    }

    #[test]
    fn test_error_source_chain_io() {
        let io_error = io::Error::new(io::ErrorKind::PermissionDenied, "access denied");
        let error: VoicelinkError = io_error.into();
        let error_trait: &dyn std::error::Error = &error;
        assert!(error_trait.source().is_some());
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<VoicelinkError>();
        assert_sync::<VoicelinkError>();
    }
}
