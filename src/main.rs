use std::net::{IpAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueHint};
use log::{debug, error, info, warn, LevelFilter};
use tokio::sync::broadcast::error::RecvError;

use castctl::cast::{CastController, ConnectionState, LocalIntent};
use castctl::config::{default_config_path, load_or_create, Config};
use castctl::discovery::{discover_receivers, find_by_name};
use castctl::protocol::{CastEvent, ReceiverTarget, DEFAULT_RECEIVER_PORT};
use castctl::stream_server::StreamServer;

const ARGS_GROUP_LOGGING: &str = "logging";
const READY_TIMEOUT: Duration = Duration::from_secs(20);

/// Plays a local media file on a cast receiver.
#[derive(Clone, Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Media file to play
    #[arg(value_name = "FILE", value_hint = ValueHint::FilePath)]
    file: PathBuf,

    /// Receiver address; skips discovery
    #[arg(long, value_hint = ValueHint::Hostname)]
    host: Option<String>,

    /// Receiver control port
    #[arg(long, default_value_t = DEFAULT_RECEIVER_PORT)]
    port: u16,

    /// Friendly name of the receiver to pick from discovery
    ///
    /// [default: first receiver found]
    #[arg(short, long)]
    name: Option<String>,

    /// How long to browse for receivers, in milliseconds
    #[arg(long, value_name = "MS", default_value_t = 3000)]
    discover_timeout: u64,

    /// Configuration file
    ///
    /// [default: <config dir>/castctl/config.toml]
    #[arg(short, long, value_name = "FILE", value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Receiver volume to set once playback starts (0.0 - 1.0)
    #[arg(long)]
    volume: Option<f32>,

    /// Suppresses all output except warnings and errors.
    #[arg(short, long, default_value_t = false, group = ARGS_GROUP_LOGGING)]
    quiet: bool,

    /// Enable verbose logging
    ///
    /// Specify twice for trace logging.
    #[arg(short, long, action = clap::ArgAction::Count, group = ARGS_GROUP_LOGGING)]
    verbose: u8,
}

/// Command line flags win over the configured level.
fn init_logger(args: &Args, config: &Config) {
    let level = if args.quiet {
        LevelFilter::Warn
    } else {
        match args.verbose {
            0 => config.logging.level.to_filter(),
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };
    let mut clog = colog::default_builder();
    clog.filter(None, level);
    clog.init();

    std::panic::set_hook(Box::new(|panic_info| {
        let current_thread = std::thread::current();
        let thread_name = current_thread.name().unwrap_or("unnamed");
        log::error!("panic in thread '{}': {}", thread_name, panic_info);
    }));
}

fn resolve_target(args: &Args) -> Result<ReceiverTarget, Box<dyn std::error::Error>> {
    if let Some(host) = &args.host {
        let address = match host.parse::<IpAddr>() {
            Ok(address) => address,
            Err(_) => (host.as_str(), args.port)
                .to_socket_addrs()?
                .map(|addr| addr.ip())
                .next()
                .ok_or_else(|| format!("cannot resolve receiver host '{host}'"))?,
        };
        let mut target = ReceiverTarget::from_address(address, args.port);
        target.host = host.clone();
        return Ok(target);
    }

    info!("Browsing for receivers for {} ms", args.discover_timeout);
    let targets = discover_receivers(Duration::from_millis(args.discover_timeout));
    for target in &targets {
        debug!("Found {} [{}]", target, target.model);
    }
    let target = match &args.name {
        Some(name) => find_by_name(&targets, name)
            .ok_or_else(|| format!("no receiver named '{name}' found"))?,
        None => targets.first().ok_or("no receivers found")?,
    };
    Ok(target.clone())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config_path = match &args.config {
        Some(path) => path.clone(),
        None => default_config_path()?,
    };
    let (config, created) = load_or_create(&config_path)?;
    init_logger(&args, &config);
    if created {
        info!("Wrote default configuration to {}", config_path.display());
    } else {
        debug!("Using configuration at {}", config_path.display());
    }

    if !args.file.is_file() {
        return Err(format!("'{}' is not a readable file", args.file.display()).into());
    }
    let target = resolve_target(&args)?;
    if target.capabilities.is_audio_only() {
        info!("{} is an audio-only receiver", target);
    }

    let server = StreamServer::start()?;
    let media = server.media_for_file(&args.file, target.address)?;
    info!("Serving '{}' at {}", args.file.display(), media.content_url);

    let controller = CastController::new(config.cast.clone());
    let mut events = controller.subscribe();
    controller.set_media(media);
    controller.connect(target.clone())?;

    match controller.wait_until_ready(Some(READY_TIMEOUT)) {
        ConnectionState::AppStarted => info!("Receiver application ready on {}", target),
        state => {
            controller.disconnect();
            return Err(format!("receiver {target} not ready ({state})").into());
        }
    }
    controller.on_local_state_changed(LocalIntent::Play);
    if let Some(volume) = args.volume {
        controller.set_volume(volume);
    }

    let result = loop {
        match events.blocking_recv() {
            Ok(event) => {
                if let Some(done) = session_end(&event) {
                    break done;
                }
            }
            Err(RecvError::Lagged(skipped)) => warn!("Event bus lagged by {} events", skipped),
            Err(RecvError::Closed) => break Ok(()),
        }
    };

    controller.on_local_state_changed(LocalIntent::End);
    controller.disconnect();
    result.map_err(|reason| {
        error!("{} on {}", reason, target);
        Box::<dyn std::error::Error>::from(reason)
    })
}

/// Logs `event` and decides whether the playback session is over.
fn session_end(event: &CastEvent) -> Option<Result<(), String>> {
    match event {
        CastEvent::PlaybackFinished { reason } => {
            info!(
                "Playback finished ({})",
                reason.as_deref().unwrap_or("no reason")
            );
            Some(Ok(()))
        }
        CastEvent::ConnectionStateChanged(ConnectionState::ConnectionDead) => {
            Some(Err("connection to receiver lost".to_string()))
        }
        CastEvent::LoadFailed { reason } => {
            Some(Err(format!("receiver rejected the media: {reason}")))
        }
        CastEvent::LaunchFailed { reason } => Some(Err(reason.clone())),
        CastEvent::ReceiverStateChanged(state) => {
            info!("Receiver is {:?}", state);
            None
        }
        CastEvent::VolumeChanged { level, muted } => {
            info!("Volume {:.0}%{}", level * 100.0, if *muted { " (muted)" } else { "" });
            None
        }
        CastEvent::Failure(reason) => {
            warn!("{}", reason);
            None
        }
        event => {
            debug!("Event: {:?}", event);
            None
        }
    }
}
