use anyhow::{Context, Result, bail};
use chrono::Local;
use clap::{Parser, Subcommand};
use crossbeam_channel::RecvTimeoutError;
use evdev::EventSummary;
use replaykit::backend::{self, Backend, BackendMode, DryRunBackend};
use replaykit::config::{Config, DEFAULT_CONFIG_FILE};
use replaykit::frame::{FrameSource, PacedFrameSource};
use replaykit::key::KeyIdentifier;
use replaykit::recorder::{self, DeviceKind, Recorder, RecorderNotice};
use replaykit::replay::{ReplayOptions, ReplayState, Replayer, StopSignal};
use replaykit::sampler::frame_aligned;
use replaykit::storage::{
    self, DirectorySink, InputStats, Session, SessionMetadata, SessionSink,
};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "replaykit", version, about = "Input recorder and timed replayer for Linux")]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Record a session, toggled by the hotkey
    Record {
        /// Session directory name [default: session_<date>_<time>]
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        output_dir: Option<PathBuf>,
        #[arg(long)]
        fps: Option<u32>,
    },
    /// Replay a session directory or inputs.json
    Replay {
        path: PathBuf,
        #[arg(long)]
        speed: Option<f64>,
        /// Seconds to wait before the first event
        #[arg(long)]
        delay: Option<f64>,
        #[arg(long, value_enum)]
        mode: Option<BackendMode>,
        /// Log what would be injected instead of injecting it
        #[arg(long)]
        dry_run: bool,
        /// Start again after finishing until stopped
        #[arg(long = "loop")]
        loop_forever: bool,
    },
    /// Show totals for a recorded session
    Info { path: PathBuf },
    /// List recorded sessions
    List {
        #[arg(long)]
        root: Option<PathBuf>,
    },
    /// Rewrite the frame-aligned input sequence of a session
    Align {
        dir: PathBuf,
        #[arg(long)]
        fps: Option<u32>,
    },
    /// List available input devices
    ListDevices,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load_or_default(&cli.config)
        .with_context(|| format!("loading config {}", cli.config.display()))?;

    match cli.command {
        Command::Record {
            name,
            output_dir,
            fps,
        } => {
            let output_dir = output_dir.unwrap_or_else(|| config.recording.output_dir.clone());
            let fps = fps.unwrap_or(config.recording.fps);
            record_session(&config, &output_dir, name, fps)
        }
        Command::Replay {
            path,
            speed,
            delay,
            mode,
            dry_run,
            loop_forever,
        } => {
            let mut options = ReplayOptions::from_config(&config.replay)?;
            if speed.is_some() || delay.is_some() {
                let progress_every = options.progress_every;
                options = ReplayOptions::new(
                    speed.unwrap_or(options.speed),
                    delay.unwrap_or(options.start_delay.as_secs_f64()),
                )?;
                options.progress_every = progress_every;
            }
            let mode = mode.unwrap_or(config.replay.mode);
            play_session(&config, &path, options, mode, dry_run, loop_forever)
        }
        Command::Info { path } => show_info(&path),
        Command::List { root } => {
            let root = root.unwrap_or_else(|| config.recording.output_dir.clone());
            list_sessions(&root)
        }
        Command::Align { dir, fps } => align_session(&dir, fps.unwrap_or(config.recording.fps)),
        Command::ListDevices => list_devices(),
    }
}

fn list_devices() -> Result<()> {
    println!("Available input devices:\n");

    let devices = recorder::list_devices().context("reading /dev/input")?;
    for device in devices {
        match device.kind {
            Some(kind) => println!("  {} - {} ({})", device.path.display(), device.name, kind),
            None => println!("  {} - {}", device.path.display(), device.name),
        }
    }

    Ok(())
}

fn record_session(
    config: &Config,
    output_dir: &Path,
    name: Option<String>,
    fps: u32,
) -> Result<()> {
    println!("Replaykit Recorder");
    println!("==================\n");

    println!("Auto-detecting keyboards and mice...\n");

    let toggle_key = config.recording.toggle_key;
    let mut recorder = Recorder::new(Some(toggle_key));

    for (info, device) in recorder::discover_devices().context("reading /dev/input")? {
        let kind = info.kind.map(|k| k.to_string()).unwrap_or_default();
        println!("  {} - {} ({})", info.path.display(), info.name, kind);
        if let Err(e) = recorder.attach(device) {
            eprintln!("    Warning: Could not add device: {}", e);
        }
    }

    if recorder.device_count() == 0 {
        eprintln!("\nError: No keyboard or mouse devices found!");
        eprintln!("Make sure you're running with sudo or have appropriate permissions.");
        return Ok(());
    }

    println!("\nFound {} input device(s)", recorder.device_count());

    let hotkey = toggle_key.short_name();
    println!("\n=== HOTKEY CONTROLS ===");
    println!("Press {} to START recording", hotkey);
    println!("Press {} again to STOP recording", hotkey);
    println!("========================\n");
    println!("Waiting for {} to start...", hotkey);

    let interval = Duration::from_secs_f64(config.recording.status_interval_secs.max(0.1));
    let mut frames = PacedFrameSource::clock(f64::from(fps), config.recording.frame_queue_capacity);
    let mut started_at = None;
    loop {
        match recorder.notices().recv_timeout(interval) {
            Ok(RecorderNotice::Started) => {
                started_at = Some(Local::now());
                if let Err(e) = frames.start() {
                    warn!(error = %e, "frame clock did not start");
                }
                println!("\n>>> Recording started! Perform your actions...");
            }
            Ok(RecorderNotice::Stopped { events }) => {
                frames.stop();
                println!(">>> Recording stopped! {} events", events);
                break;
            }
            Err(RecvTimeoutError::Timeout) => {
                // Frames are only counted, keep the queue from filling up
                frames.drain();
                if recorder.is_recording() {
                    let status = recorder.status();
                    println!(
                        "  {:.1}s, {} events, holding {} key(s)",
                        status.duration,
                        status.total_events,
                        status.pressed_keys.len()
                    );
                }
            }
            Err(RecvTimeoutError::Disconnected) => bail!("recorder stopped unexpectedly"),
        }
    }

    let log = recorder.finish();
    let session = Session::new(log, fps, started_at.unwrap_or_else(Local::now));
    let dir = output_dir.join(name.unwrap_or_else(|| session.default_name()));

    println!("\nSaving {} events to {}...", session.log().len(), dir.display());
    let mut sink = DirectorySink::create(&dir)?;
    let metadata = SessionMetadata::new(
        &session,
        config.recording.resolution,
        &config.recording.video_codec,
    )
    .with_screen_stats(frames.stats());
    storage::save_session(&mut sink, &session, &metadata)
        .with_context(|| format!("saving session to {}", dir.display()))?;
    println!("Session saved successfully!");

    Ok(())
}

fn print_stats(stats: &InputStats) {
    println!("Events:   {}", stats.total_events);
    println!("Duration: {:.2}s", stats.duration);
    for (kind, count) in &stats.event_counts {
        println!("  {:<14} {}", kind, count);
    }
}

fn show_info(path: &Path) -> Result<()> {
    let log = storage::load_event_log(path)
        .with_context(|| format!("loading session {}", path.display()))?;
    print_stats(&InputStats::of(&log));
    if path.is_dir() {
        if let Ok(metadata) = storage::load_metadata(path) {
            println!("Started:  {}", metadata.session_start);
            println!("FPS:      {}", metadata.fps);
        }
    }
    Ok(())
}

fn list_sessions(root: &Path) -> Result<()> {
    let sessions = storage::list_sessions(root)
        .with_context(|| format!("listing sessions in {}", root.display()))?;
    if sessions.is_empty() {
        println!("No sessions in {}", root.display());
        return Ok(());
    }
    for session in sessions {
        match session.metadata {
            Some(metadata) => println!(
                "  {}  {:>6} events  {:>8.2}s",
                session.name, metadata.input_stats.total_events, metadata.duration
            ),
            None => println!("  {}", session.name),
        }
    }
    Ok(())
}

fn align_session(dir: &Path, fps: u32) -> Result<()> {
    let log = storage::load_event_log(dir)
        .with_context(|| format!("loading session {}", dir.display()))?;
    let entries = frame_aligned(&log, f64::from(fps));
    let mut sink = DirectorySink::create(dir)?;
    sink.write_frame_aligned(&entries)
        .with_context(|| format!("writing frame-aligned inputs to {}", dir.display()))?;
    println!("Wrote {} frames at {} fps", entries.len(), fps);
    Ok(())
}

/// Stop the replay when `stop_key` is pressed on any physical keyboard
fn watch_stop_key(stop_key: KeyIdentifier, stop: StopSignal) -> Result<usize> {
    let Some(code) = stop_key.key_code() else {
        bail!("stop key {} has no key code", stop_key);
    };
    let mut watching = 0;
    for (info, mut device) in recorder::discover_devices().context("reading /dev/input")? {
        if info.kind == Some(DeviceKind::Mouse) {
            continue;
        }
        let stop = stop.clone();
        let spawned = thread::Builder::new()
            .name("stop-key".into())
            .spawn(move || {
                loop {
                    let events = match device.fetch_events() {
                        Ok(events) => events,
                        Err(e) => {
                            debug!(device = %info.name, error = %e, "stop key watcher detached");
                            return;
                        }
                    };
                    for event in events {
                        if let EventSummary::Key(_, pressed, 1) = event.destructure() {
                            if pressed == code {
                                stop.stop();
                                return;
                            }
                        }
                    }
                }
            });
        match spawned {
            Ok(_) => watching += 1,
            Err(e) => warn!(error = %e, "could not watch keyboard for stop key"),
        }
    }
    Ok(watching)
}

fn play_session(
    config: &Config,
    path: &Path,
    options: ReplayOptions,
    mode: BackendMode,
    dry_run: bool,
    loop_forever: bool,
) -> Result<()> {
    println!("Replaykit Player");
    println!("================\n");

    println!("Loading session from {}...", path.display());
    let log = storage::load_event_log(path)
        .with_context(|| format!("loading session {}", path.display()))?;
    print_stats(&InputStats::of(&log));

    // Watch keyboards before the virtual devices exist so they are not picked up
    let stop = StopSignal::new();
    let stop_key = config.replay.stop_key;
    match watch_stop_key(stop_key, stop.clone()) {
        Ok(0) | Err(_) => eprintln!("Warning: no keyboard to watch, the stop key is disabled"),
        Ok(_) => println!("Press {} to stop", stop_key.short_name()),
    }

    let mut backend: Box<dyn Backend> = if dry_run {
        Box::new(DryRunBackend::new().verbose())
    } else {
        backend::open_backend(mode, config)?
    };
    println!("Backend: {}", backend.name());

    if !options.start_delay.is_zero() {
        println!(
            "\nStarting playback in {:.0} seconds...",
            options.start_delay.as_secs_f64()
        );
    }

    let mut replayer = Replayer::new(options).with_stop_signal(stop);
    loop {
        let report = replayer.run(&log, &mut backend);
        println!(
            "Dispatched {}/{} events in {:.2}s ({} failed)",
            report.dispatched,
            report.total,
            report.elapsed.as_secs_f64(),
            report.failed
        );

        if report.state == ReplayState::Cancelled {
            println!("Playback stopped.");
            break;
        }
        if !loop_forever {
            break;
        }
        println!("\nFinished session, starting again...");
        replayer.skip_start_delay();
    }

    Ok(())
}
