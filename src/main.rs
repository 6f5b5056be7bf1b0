use anyhow::{Context, Result};
use clap::Parser;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use voicelink::audio::cpal_backend::{CpalBackend, Direction, list_devices, suppress_audio_warnings};
use voicelink::audio::device::AudioBackend;
use voicelink::cli::{Cli, Commands, ConfigAction};
use voicelink::config::Config;
use voicelink::output::{RenderOptions, render_event};
use voicelink::session::VoiceSession;
use voicelink::session::events::{ConnectionState, SessionEvent};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    tracing::debug!(version = %voicelink::version_string(), "starting");

    match cli.command {
        Commands::Connect {
            endpoint,
            agent_id,
            public_key,
            metadata,
            wav,
            input_device,
            output_device,
            mute_mic,
            mute_speaker,
            no_reconnect,
        } => {
            let config = load_config(cli.config.as_deref())?;
            let args = ConnectArgs {
                endpoint,
                agent_id,
                public_key,
                metadata,
                wav,
                input_device,
                output_device,
                mute_mic,
                mute_speaker,
                no_reconnect,
            };
            run_connect(config, args, cli.quiet, cli.verbose).await?;
        }
        Commands::Devices => {
            list_audio_devices()?;
        }
        Commands::CheckAec => {
            suppress_audio_warnings();
            let config = load_config(cli.config.as_deref())?;
            let backend = CpalBackend::new(config.audio.input_device, config.audio.output_device);
            if backend.aec_available() {
                println!("Echo cancellation: available ({})", backend.name());
            } else {
                println!("Echo cancellation: unavailable ({})", backend.name());
            }
        }
        Commands::Config { action } => {
            handle_config_command(action, cli.config.as_deref())?;
        }
    }

    Ok(())
}

/// Install the stderr log subscriber. `RUST_LOG` wins over `-v`.
fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Load configuration from file or use defaults.
///
/// Priority order:
/// 1. Custom config path from CLI (--config), which must exist
/// 2. Default config path (~/.config/voicelink/config.toml)
/// 3. Built-in defaults with environment variable overrides
fn load_config(custom_path: Option<&Path>) -> Result<Config> {
    let config = match custom_path {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default(&Config::default_path())?,
    };
    Ok(config.with_env_overrides())
}

struct ConnectArgs {
    endpoint: Option<String>,
    agent_id: Option<String>,
    public_key: Option<String>,
    metadata: Vec<(String, String)>,
    wav: Option<PathBuf>,
    input_device: Option<String>,
    output_device: Option<String>,
    mute_mic: bool,
    mute_speaker: bool,
    no_reconnect: bool,
}

/// Stream audio until the session ends, fails, or the user interrupts.
async fn run_connect(config: Config, args: ConnectArgs, quiet: bool, verbose: u8) -> Result<()> {
    suppress_audio_warnings();

    let mut request = config.connect_request();
    if let Some(endpoint) = args.endpoint {
        request.endpoint = endpoint;
    }
    if let Some(agent_id) = args.agent_id {
        request.agent_id = agent_id;
    }
    if let Some(public_key) = args.public_key {
        request.public_key = public_key;
    }
    if !args.metadata.is_empty() {
        let metadata = request.metadata.get_or_insert_with(Map::new);
        for (key, value) in args.metadata {
            metadata.insert(key, Value::String(value));
        }
    }
    request.microphone_muted = args.mute_mic;
    request.speaker_muted = args.mute_speaker;
    if args.no_reconnect {
        request.auto_reconnect = false;
    }

    let mut backend = CpalBackend::new(
        args.input_device.or(config.audio.input_device),
        args.output_device.or(config.audio.output_device),
    );
    if let Some(path) = args.wav {
        backend = backend.with_input_wav(path);
    }

    let session = VoiceSession::with_event_queue(Arc::new(backend), config.events.queue_size);
    let events = session.events();
    let (ended_tx, mut ended_rx) = tokio::sync::mpsc::unbounded_channel();
    let options = RenderOptions {
        show_levels: verbose > 0,
    };
    std::thread::Builder::new()
        .name("voicelink-events".to_string())
        .spawn(move || {
            for event in events.iter() {
                if !quiet {
                    render_event(&event, options);
                }
                if let SessionEvent::ConnectionState { state, .. } = &event
                    && state.is_terminal()
                {
                    ended_tx.send(*state).ok();
                }
            }
        })
        .context("Failed to spawn event thread")?;

    session
        .connect(request)
        .await
        .context("Failed to start session")?;

    let mut final_state = None;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            if !quiet {
                eprintln!("\nReceived SIGINT, shutting down...");
            }
        }
        res = wait_for_sigterm() => {
            if let Err(e) = res {
                eprintln!("Error setting up signal handler: {}", e);
            }
            if !quiet {
                eprintln!("\nReceived SIGTERM, shutting down...");
            }
        }
        state = ended_rx.recv() => {
            final_state = state;
        }
    }

    let info = session.get_audio_info();
    let stats = session.transport_stats();
    session.disconnect().await;
    tracing::info!(
        frames_captured = info.frames_captured,
        frames_sent = stats.frames_sent,
        frames_dropped = stats.frames_dropped,
        frames_played = info.frames_played,
        underruns = info.underruns,
        "session closed"
    );

    if final_state == Some(ConnectionState::Failed) {
        anyhow::bail!("Could not connect to the voice server");
    }
    Ok(())
}

/// Wait for SIGTERM signal.
#[cfg(unix)]
async fn wait_for_sigterm() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    sigterm.recv().await;
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_sigterm() -> Result<()> {
    // On non-Unix, just wait forever (Ctrl+C will still work)
    std::future::pending::<Result<()>>().await
}

/// List available audio input and output devices.
fn list_audio_devices() -> Result<()> {
    suppress_audio_warnings();
    let inputs = list_devices(Direction::Input)?;
    let outputs = list_devices(Direction::Output)?;

    if inputs.is_empty() && outputs.is_empty() {
        eprintln!("No audio devices found");
        std::process::exit(1);
    }

    println!("Input devices:");
    for (idx, device) in inputs.iter().enumerate() {
        println!("  [{}] {}", idx, device);
    }
    println!("Output devices:");
    for (idx, device) in outputs.iter().enumerate() {
        println!("  [{}] {}", idx, device);
    }

    Ok(())
}

/// Handle configuration commands.
fn handle_config_command(action: ConfigAction, custom_path: Option<&Path>) -> Result<()> {
    match action {
        ConfigAction::Dump => {
            let config = load_config(custom_path)?;
            let toml = toml::to_string_pretty(&config).context("Failed to render config")?;
            print!("{}", toml);
        }
        ConfigAction::Path => {
            let path = custom_path
                .map(Path::to_path_buf)
                .unwrap_or_else(Config::default_path);
            println!("{}", path.display());
        }
    }
    Ok(())
}
