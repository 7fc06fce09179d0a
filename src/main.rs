use anyhow::Context;
use clap::{Parser, Subcommand};
use sc_host::core::config::{AudioCodec, ConnectionMode, MirrorConfig, VideoCodec};
use sc_host::core::error::MirrorError;
use sc_host::{log_error, log_info};

#[derive(Parser, Debug)]
#[command(author, version, about = "SC-Host: scrcpy-protocol Android mirroring host")]
struct Args {
    /// Device serial; defaults to the only attached device.
    #[arg(short, long, default_value = "")]
    serial: String,

    #[arg(short, long, default_value_t = 27183)]
    port: u16,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Enable debug logging (stream statistics)
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Mirror {
        /// Load the full session configuration from a JSON file instead
        /// of the flags below.
        #[arg(long)]
        config: Option<String>,

        #[arg(long, default_value_t = 8_000_000)]
        bitrate: u32,

        #[arg(long, default_value_t = 0)]
        max_size: u32,

        #[arg(long, default_value_t = 60)]
        max_fps: u32,

        /// reverse = host listens, forward = host dials
        #[arg(long, default_value = "reverse")]
        mode: String,

        /// h264 or h265
        #[arg(long, default_value = "h264")]
        video_codec: String,

        /// opus, aac, or raw
        #[arg(long, default_value = "opus")]
        audio_codec: String,

        /// Enable audio streaming (Android 11+ required)
        #[arg(long, default_value_t = true)]
        audio: bool,

        /// Disable audio streaming
        #[arg(long)]
        no_audio: bool,

        /// Keep the device awake while mirroring
        #[arg(long)]
        stay_awake: bool,

        /// Show touches on the device screen
        #[arg(long)]
        show_touches: bool,

        /// Turn the device screen off while mirroring
        #[arg(long)]
        turn_screen_off: bool,

        /// Jitter buffer target in milliseconds
        #[arg(long, default_value_t = 50)]
        audio_buffer: u32,

        /// Path to the agent artifact
        #[arg(long, default_value = "scrcpy-server.jar")]
        agent: String,
    },
    /// List attached devices
    Devices,
}

impl Commands {
    fn default_mirror() -> Self {
        Commands::Mirror {
            config: None,
            bitrate: 8_000_000,
            max_size: 0,
            max_fps: 60,
            mode: "reverse".to_string(),
            video_codec: "h264".to_string(),
            audio_codec: "opus".to_string(),
            audio: true,
            no_audio: false,
            stay_awake: false,
            show_touches: false,
            turn_screen_off: false,
            audio_buffer: 50,
            agent: "scrcpy-server.jar".to_string(),
        }
    }
}

fn main() {
    let args = Args::parse();

    // --debug implies the per-event level as well.
    sc_host::core::VERBOSE.store(args.verbose || args.debug, std::sync::atomic::Ordering::SeqCst);
    sc_host::core::DEBUG.store(args.debug, std::sync::atomic::Ordering::SeqCst);

    // -v opens the debug level (stream events), --debug the trace level
    // (periodic statistics); RUST_LOG still overrides both.
    let default_filter = if args.debug {
        "trace"
    } else if args.verbose {
        "debug"
    } else {
        "info"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let code = match dispatch(args) {
        Ok(()) => 0,
        Err(err) => {
            log_error!("MAIN", "{:#}", err);
            err.downcast_ref::<MirrorError>()
                .map(MirrorError::exit_code)
                .unwrap_or(1)
        }
    };
    std::process::exit(code);
}

fn dispatch(mut args: Args) -> anyhow::Result<()> {
    let command = args.command.take().unwrap_or_else(Commands::default_mirror);
    match command {
        Commands::Devices => list_devices(),
        Commands::Mirror {
            config,
            bitrate,
            max_size,
            max_fps,
            mode,
            video_codec,
            audio_codec,
            audio,
            no_audio,
            stay_awake,
            show_touches,
            turn_screen_off,
            audio_buffer,
            agent,
        } => {
            let config = if let Some(path) = config {
                let text = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading config file {}", path))?;
                serde_json::from_str(&text).with_context(|| format!("parsing {}", path))?
            } else {
                let connection_mode = match mode.as_str() {
                    "reverse" => ConnectionMode::Reverse,
                    "forward" => ConnectionMode::Forward,
                    other => anyhow::bail!("unknown connection mode: {}", other),
                };
                let video_codec = match video_codec.as_str() {
                    "h264" => VideoCodec::H264,
                    "h265" => VideoCodec::H265,
                    other => anyhow::bail!("unknown video codec: {}", other),
                };
                let audio_codec = match audio_codec.as_str() {
                    "opus" => AudioCodec::Opus,
                    "aac" => AudioCodec::Aac,
                    "raw" => AudioCodec::Raw,
                    other => anyhow::bail!("unknown audio codec: {}", other),
                };
                MirrorConfig {
                    serial: args.serial.clone(),
                    port: args.port,
                    connection_mode,
                    max_size,
                    bitrate_bps: bitrate,
                    max_fps,
                    show_touches,
                    turn_screen_off,
                    stay_awake,
                    audio_enabled: audio && !no_audio,
                    video_codec,
                    audio_codec,
                    target_buffering_ms: audio_buffer,
                    agent_path: agent,
                    ..MirrorConfig::default()
                }
            };
            run_mirror(config)
        }
    }
}

fn list_devices() -> anyhow::Result<()> {
    use sc_host::adb::{AdbService, ExecAdbService};
    let adb = ExecAdbService::new("adb");
    let devices = adb.devices()?;
    if devices.is_empty() {
        println!("No devices attached");
        return Ok(());
    }
    for device in devices {
        println!("{}\t{}\t{}", device.serial, device.state, device.model);
    }
    Ok(())
}

#[cfg(feature = "openh264")]
fn run_mirror(mut config: MirrorConfig) -> anyhow::Result<()> {
    use sc_host::adb::{AdbService, ExecAdbService};
    use sc_host::core::session::{ScrcpySession, SessionState};
    use sc_host::video::ChannelScheduler;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    if config.serial.is_empty() {
        // Default to the single attached device, like the launcher does.
        let adb = ExecAdbService::new(config.adb_binary().to_string());
        let devices = adb.devices()?;
        let ready: Vec<_> = devices.iter().filter(|d| d.is_ready()).collect();
        match ready.as_slice() {
            [only] => config.serial = only.serial.clone(),
            [] => return Err(MirrorError::DeviceNotReady("no device attached".into()).into()),
            _ => {
                return Err(MirrorError::DeviceNotReady(
                    "multiple devices attached, pass --serial".into(),
                )
                .into())
            }
        }
    }

    let (scheduler, tasks) = ChannelScheduler::new();
    let session = ScrcpySession::new(config, scheduler);

    let frame_count = Arc::new(AtomicU64::new(0));
    let frame_count_clone = frame_count.clone();
    session.set_frame_handler(Box::new(move |frame| {
        let n = frame_count_clone.fetch_add(1, Ordering::Relaxed) + 1;
        if n == 1 {
            log_info!("MAIN", "First frame: {}x{}", frame.width, frame.height);
        }
    }));

    #[cfg(feature = "playback")]
    let _audio_out = {
        use sc_host::audio::decoder::AudioFormat;
        use sc_host::audio::sink::CpalSink;
        match CpalSink::start(
            session.regulator(),
            AudioFormat {
                sample_rate: 48_000,
                channels: 2,
            },
        ) {
            Ok(sink) => Some(sink),
            Err(e) => {
                log_error!("MAIN", "Audio output unavailable: {}", e);
                None
            }
        }
    };

    session.connect()?;
    session.start_capture()?;
    log_info!("MAIN", "Capturing; press Ctrl-C to stop");

    let mut last_stats = Instant::now();
    let mut last_frames = 0u64;
    loop {
        ChannelScheduler::drain(&tasks);
        match session.state() {
            SessionState::Disconnected => {
                log_info!("MAIN", "Stream ended");
                break;
            }
            SessionState::Error => {
                let error = session
                    .take_last_error()
                    .unwrap_or(MirrorError::CaptureStartFailed("unknown".into()));
                session.disconnect();
                return Err(error.into());
            }
            _ => {}
        }

        if last_stats.elapsed().as_secs() >= 10 {
            let frames = frame_count.load(Ordering::Relaxed);
            let fps = (frames - last_frames) / 10;
            log_info!(
                "MAIN",
                "Stats: {} fps, frames={}, skipped={}",
                fps,
                frames,
                session.pipeline().skipped_count()
            );
            last_frames = frames;
            last_stats = Instant::now();
        }
        std::thread::sleep(Duration::from_millis(5));
    }

    session.disconnect();
    Ok(())
}

#[cfg(not(feature = "openh264"))]
fn run_mirror(_config: MirrorConfig) -> anyhow::Result<()> {
    anyhow::bail!("this build has no video decoder; rebuild with the openh264 feature")
}
