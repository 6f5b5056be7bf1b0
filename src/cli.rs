//! Command-line interface for voicelink
//!
//! Provides argument parsing using clap derive macros.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Full-duplex voice streaming to a remote voice agent
#[derive(Parser, Debug)]
#[command(
    name = "voicelink",
    version,
    about = "Full-duplex voice streaming to a remote voice agent"
)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Path to configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Suppress event output (quiet mode)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Verbose output (-v: info logs + level meter, -vv: debug logs)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Connect to a voice agent and stream audio until the session ends
    Connect {
        /// WebSocket endpoint (ws:// or wss://)
        #[arg(long, value_name = "URL")]
        endpoint: Option<String>,

        /// Agent identifier
        #[arg(long, value_name = "ID")]
        agent_id: Option<String>,

        /// Public key sent in the initiate message
        #[arg(long, value_name = "KEY")]
        public_key: Option<String>,

        /// Extra metadata sent to the agent (repeatable)
        #[arg(long = "metadata", value_name = "KEY=VALUE", value_parser = parse_metadata)]
        metadata: Vec<(String, String)>,

        /// Stream a WAV file instead of the microphone
        #[arg(long, value_name = "FILE")]
        wav: Option<PathBuf>,

        /// Audio input device
        #[arg(long, value_name = "DEVICE")]
        input_device: Option<String>,

        /// Audio output device
        #[arg(long, value_name = "DEVICE")]
        output_device: Option<String>,

        /// Start with the microphone muted
        #[arg(long)]
        mute_mic: bool,

        /// Start with the speaker muted
        #[arg(long)]
        mute_speaker: bool,

        /// Do not reconnect when the connection drops
        #[arg(long)]
        no_reconnect: bool,
    },

    /// List available audio input and output devices
    Devices,

    /// Report whether echo cancellation is available
    CheckAec,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Configuration management actions
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the effective configuration as TOML
    Dump,
    /// Print the default configuration file path
    Path,
}

fn parse_metadata(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got '{}'", s)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_connect_minimal() {
        let cli = Cli::try_parse_from(["voicelink", "connect"]).unwrap();
        match cli.command {
            Commands::Connect {
                endpoint,
                metadata,
                wav,
                mute_mic,
                mute_speaker,
                no_reconnect,
                ..
            } => {
                assert!(endpoint.is_none());
                assert!(metadata.is_empty());
                assert!(wav.is_none());
                assert!(!mute_mic);
                assert!(!mute_speaker);
                assert!(!no_reconnect);
            }
            _ => panic!("Expected Connect command"),
        }
    }

    #[test]
    fn test_parse_connect_with_options() {
        let cli = Cli::try_parse_from([
            "voicelink",
            "connect",
            "--endpoint",
            "wss://voice.example.com/ws",
            "--agent-id",
            "agent-1",
            "--public-key",
            "pk",
            "--metadata",
            "user_id=u1",
            "--metadata",
            "lang=en",
            "--wav",
            "/tmp/hello.wav",
            "--mute-speaker",
        ])
        .unwrap();

        match cli.command {
            Commands::Connect {
                endpoint,
                agent_id,
                public_key,
                metadata,
                wav,
                mute_speaker,
                ..
            } => {
                assert_eq!(endpoint.as_deref(), Some("wss://voice.example.com/ws"));
                assert_eq!(agent_id.as_deref(), Some("agent-1"));
                assert_eq!(public_key.as_deref(), Some("pk"));
                assert_eq!(
                    metadata,
                    vec![
                        ("user_id".to_string(), "u1".to_string()),
                        ("lang".to_string(), "en".to_string())
                    ]
                );
                assert_eq!(wav, Some(PathBuf::from("/tmp/hello.wav")));
                assert!(mute_speaker);
            }
            _ => panic!("Expected Connect command"),
        }
    }

    #[test]
    fn test_metadata_requires_key_value() {
        let result = Cli::try_parse_from(["voicelink", "connect", "--metadata", "novalue"]);
        assert!(result.is_err());
        let result = Cli::try_parse_from(["voicelink", "connect", "--metadata", "=x"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_metadata_value_may_contain_equals() {
        assert_eq!(
            parse_metadata("token=a=b").unwrap(),
            ("token".to_string(), "a=b".to_string())
        );
    }

    #[test]
    fn test_parse_devices() {
        let cli = Cli::try_parse_from(["voicelink", "devices"]).unwrap();
        assert!(matches!(cli.command, Commands::Devices));
    }

    #[test]
    fn test_parse_check_aec() {
        let cli = Cli::try_parse_from(["voicelink", "check-aec"]).unwrap();
        assert!(matches!(cli.command, Commands::CheckAec));
    }

    #[test]
    fn test_parse_config_dump() {
        let cli = Cli::try_parse_from(["voicelink", "config", "dump"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Config {
                action: ConfigAction::Dump
            }
        ));
    }

    #[test]
    fn test_parse_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "voicelink",
            "devices",
            "--config",
            "/path/to/config.toml",
            "-q",
            "-vv",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/path/to/config.toml")));
        assert!(cli.quiet);
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn test_missing_subcommand_is_error() {
        assert!(Cli::try_parse_from(["voicelink"]).is_err());
    }

    #[test]
    fn test_invalid_command_returns_error() {
        let err = Cli::try_parse_from(["voicelink", "invalid"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::InvalidSubcommand);
    }
}
