use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};
use tracing_subscriber::EnvFilter;

use levelcap::audio::SampleFormat;
use levelcap::audio::capture::CpalHost;
use levelcap::audio::catalog::{Device, DeviceCatalog};
use levelcap::config::{Config, MeterScale};
use levelcap::error::LevelcapError;
use levelcap::meter::ChannelReading;
use levelcap::recorder::{MeterSnapshot, Recorder, RecorderEvent, RecorderOptions, SavedRecording};
use levelcap::state::{RecordingState, format_elapsed};
use tokio::io::AsyncBufReadExt;

const BAR_WIDTH: usize = 30;

#[derive(Parser)]
#[command(
    name = "levelcap",
    about = "Watch input levels and record them",
    long_about = "levelcap opens an audio capture device, shows live per-channel level \
        meters (running average, logarithmic level, peak and clip indicators), and \
        records the raw stream to WAV files, optionally transcoding them to MP3."
)]
struct Cli {
    /// Path to config file
    ///
    /// Defaults to ~/.config/levelcap/config.yaml if not specified.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    ///
    /// Sets the log level to debug for the levelcap crate, showing negotiated
    /// parameters, stream faults and state transitions.
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Capture device id (overrides audio.device)
    #[arg(long, global = true)]
    device: Option<String>,

    /// Channel count (overrides audio.channels)
    #[arg(long, global = true)]
    channels: Option<u16>,

    /// Sample rate in Hz (overrides audio.sample_rate)
    #[arg(long, global = true)]
    rate: Option<u32>,

    /// Sample format: S8, S16_LE, U16_LE, S24_LE or S32_LE (overrides audio.format)
    #[arg(long, global = true)]
    format: Option<SampleFormat>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List capture devices and what they can do
    ///
    /// Probes every capture endpoint for supported channel counts, sample
    /// rates and sample formats. Endpoints without a usable combination are
    /// left out. Use --pick to interactively select one and save it to your
    /// config file, or --set to write a device id directly.
    Devices {
        /// Write the given device id to the config file
        #[arg(long, conflicts_with = "pick")]
        set: Option<String>,

        /// Interactively pick a device and save it to the config file
        #[arg(long, conflicts_with = "set")]
        pick: bool,

        /// Print the device list as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show live level meters until interrupted
    ///
    /// Opens the device and redraws the meters every meter.poll_interval_ms.
    /// Nothing is written to disk. Type `r` (or `r N`) and Enter to clear
    /// the peak and clip indicators. Stop with Ctrl+C or `q`.
    Monitor,

    /// Record to a WAV (or MP3) file while showing meters
    ///
    /// Records until Ctrl+C, until --duration elapses, or until the
    /// recording.max_duration_secs cap is reached. Type `p` and Enter to
    /// pause or resume, `r [N]` to reset peaks, `q` to stop.
    Record {
        /// Destination file (default: recording.directory/rec-<timestamp>.wav)
        #[arg(long, short)]
        output: Option<PathBuf>,

        /// Stop after this many seconds
        #[arg(long)]
        duration: Option<u64>,
    },

    /// Print the format of a recorded file
    Inspect {
        /// WAV file to read
        file: PathBuf,
    },

    /// Generate shell completions
    ///
    /// Prints a completion script for the given shell to stdout.
    /// Source or install the output to enable tab completion.
    Completions {
        /// Shell to generate completions for (bash, zsh, fish, elvish, powershell)
        shell: Shell,
    },
}

fn config_path(cli: &Cli) -> PathBuf {
    cli.config.clone().unwrap_or_else(Config::default_path)
}

fn load_config(cli: &Cli) -> Result<Config, LevelcapError> {
    let mut config = Config::load(&config_path(cli))?;
    if let Some(device) = &cli.device {
        config.audio.device = Some(device.clone());
    }
    if let Some(channels) = cli.channels {
        config.audio.channels = channels;
    }
    if let Some(rate) = cli.rate {
        config.audio.sample_rate = rate;
    }
    if let Some(format) = cli.format {
        config.audio.format = format;
    }
    Ok(config)
}

/// Parameters given on the command line are used as-is instead of being
/// fitted to the device.
const fn explicit_params(cli: &Cli) -> bool {
    cli.channels.is_some() || cli.rate.is_some() || cli.format.is_some()
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("levelcap=debug,info")
    } else {
        EnvFilter::new("levelcap=info,warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    install_completions_if_missing();

    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = run(&cli);
    if let Err(e) = result {
        tracing::error!("{e}");
        std::process::exit(1);
    }
}

/// Auto-install shell completions for `$SHELL` if the completion file does not
/// already exist. Errors are ignored so that missing dirs or unsupported
/// shells never block normal operation.
fn install_completions_if_missing() {
    let Ok(shell_env) = std::env::var("SHELL") else {
        return;
    };

    let Some(home) = dirs::home_dir() else {
        return;
    };

    let (shell, path) = if shell_env.ends_with("/bash") {
        let dir = home.join(".local/share/bash-completion/completions");
        (Shell::Bash, dir.join("levelcap"))
    } else if shell_env.ends_with("/zsh") {
        (Shell::Zsh, home.join(".zfunc/_levelcap"))
    } else if shell_env.ends_with("/fish") {
        (Shell::Fish, home.join(".config/fish/completions/levelcap.fish"))
    } else {
        return;
    };

    if path.exists() {
        return;
    }

    if let Some(parent) = path.parent()
        && std::fs::create_dir_all(parent).is_err()
    {
        return;
    }

    let mut buf = Vec::new();
    generate(shell, &mut Cli::command(), "levelcap", &mut buf);

    let _ = std::fs::write(&path, buf);
}

fn run(cli: &Cli) -> Result<(), LevelcapError> {
    match &cli.command {
        Command::Devices { set, pick, json } => run_devices(cli, set.as_deref(), *pick, *json),
        Command::Monitor => run_session(cli, None, None),
        Command::Record { output, duration } => run_session(
            cli,
            Some(output.as_deref()),
            duration.map(Duration::from_secs),
        ),
        Command::Inspect { file } => run_inspect(file),
        Command::Completions { shell } => {
            generate(*shell, &mut Cli::command(), "levelcap", &mut std::io::stdout());
            Ok(())
        }
    }
}

fn print_device_list(devices: &[Device], default_id: Option<&str>) {
    for (i, device) in devices.iter().enumerate() {
        let marker = if default_id == Some(device.id.as_str()) {
            " (default)"
        } else {
            ""
        };
        println!("  {}: {}{marker}", i + 1, device.long_name);
        println!("     id:       {}", device.id);
        println!("     channels: {:?}", device.channels);
        println!("     rates:    {:?}", device.sample_rates);
        let formats: Vec<&str> = device.formats.iter().map(|f| f.name()).collect();
        println!("     formats:  {}", formats.join(", "));
    }
}

fn run_devices(cli: &Cli, set: Option<&str>, pick: bool, json: bool) -> Result<(), LevelcapError> {
    if let Some(device_id) = set {
        let path = config_path(cli);
        Config::set_audio_device(&path, device_id)?;
        println!("Set audio device to: {device_id}");
        return Ok(());
    }

    let catalog = DeviceCatalog::load(&CpalHost::new())?;
    let devices = catalog.devices();

    if json {
        let out = serde_json::to_string_pretty(devices)
            .map_err(|e| LevelcapError::Other(format!("failed to encode devices: {e}")))?;
        println!("{out}");
        return Ok(());
    }

    if devices.is_empty() {
        println!("No usable capture devices found.");
        return Ok(());
    }

    if pick {
        println!("Available capture devices:");
        print_device_list(devices, catalog.default_id());
        println!();

        print!("Select device [1-{}]: ", devices.len());
        std::io::stdout()
            .flush()
            .map_err(|e| LevelcapError::Other(format!("failed to flush stdout: {e}")))?;

        let mut input = String::new();
        std::io::stdin()
            .read_line(&mut input)
            .map_err(|e| LevelcapError::Other(format!("failed to read input: {e}")))?;

        let choice: usize = input
            .trim()
            .parse()
            .map_err(|_| LevelcapError::Other("invalid selection: enter a number".to_string()))?;

        if choice < 1 || choice > devices.len() {
            return Err(LevelcapError::Other(format!(
                "selection out of range: pick 1-{}",
                devices.len()
            )));
        }

        let selected = &devices[choice - 1].id;
        let path = config_path(cli);
        Config::set_audio_device(&path, selected)?;
        println!("Set audio device to: {selected}");
    } else {
        print_device_list(devices, catalog.default_id());
    }

    Ok(())
}

/// `output` is `Some` when recording; the inner value is the destination.
fn run_session(
    cli: &Cli,
    output: Option<Option<&Path>>,
    duration: Option<Duration>,
) -> Result<(), LevelcapError> {
    let config = load_config(cli)?;
    let options = RecorderOptions::from_config(&config);
    let mut recorder = Recorder::new(Arc::new(CpalHost::new()), options)?;

    if explicit_params(cli)
        && let Err(e) = select_explicit(&mut recorder, &config)
    {
        if e.is_retryable() {
            eprintln!("Run `levelcap devices` to see what each device supports.");
        }
        return Err(e);
    }

    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(meter_loop(&mut recorder, &config, output, duration));
    // A pending stdin read would otherwise hold the runtime open.
    rt.shutdown_background();
    result
}

fn select_explicit(recorder: &mut Recorder, config: &Config) -> Result<(), LevelcapError> {
    if let Some(device) = &config.audio.device {
        recorder.select_device(device)?;
    }
    recorder.select_params(config.audio.request())
}

/// A line typed while the meters are running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyCommand {
    /// `p`: pause a recording, or resume a paused one.
    TogglePause,
    /// `r N` resets channel N, a bare `r` resets all of them.
    Reset(Option<usize>),
    /// `q`
    Quit,
}

fn parse_key_command(line: &str) -> Option<KeyCommand> {
    let mut words = line.split_whitespace();
    let command = match words.next()? {
        "p" => KeyCommand::TogglePause,
        "r" => match words.next() {
            Some(channel) => KeyCommand::Reset(Some(channel.parse().ok()?)),
            None => KeyCommand::Reset(None),
        },
        "q" => KeyCommand::Quit,
        _ => return None,
    };
    words.next().is_none().then_some(command)
}

/// Returns `true` when the loop should end.
fn apply_key_command(recorder: &mut Recorder, command: KeyCommand) -> Result<bool, LevelcapError> {
    match command {
        KeyCommand::TogglePause => match recorder.state() {
            RecordingState::Paused => recorder.resume()?,
            _ => recorder.pause()?,
        },
        KeyCommand::Reset(Some(channel)) => recorder.reset_channel(channel)?,
        KeyCommand::Reset(None) => {
            let channels = recorder.params().map_or(0, |p| usize::from(p.channels()));
            for channel in 0..channels {
                recorder.reset_channel(channel)?;
            }
        }
        KeyCommand::Quit => return Ok(true),
    }
    Ok(false)
}

async fn meter_loop(
    recorder: &mut Recorder,
    config: &Config,
    output: Option<Option<&Path>>,
    duration: Option<Duration>,
) -> Result<(), LevelcapError> {
    let params = recorder.start()?;
    let device = recorder.device().map(|d| d.long_name.clone()).unwrap_or_default();
    eprintln!("{device}: {}", params.description());

    let dest = output.flatten();
    if output.is_some() {
        recorder.record()?;
    }
    let deadline = duration.map(|d| Instant::now() + d);

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("received Ctrl+C, shutting down...");
        let _ = shutdown_tx.send(());
    });

    let mut ticker = tokio::time::interval(config.meter.poll_interval());
    let mut input = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let mut input_open = true;
    let mut finished = false;

    while !finished {
        tokio::select! {
            _ = ticker.tick() => {
                for event in recorder.poll_events() {
                    match event {
                        RecorderEvent::RecordingFinished(closed) => {
                            let saved = recorder.save(closed, dest)?;
                            report_saved(&saved);
                            finished = true;
                        }
                        RecorderEvent::Fault { error, fatal: true } => return Err(error),
                        RecorderEvent::Fault { error, fatal: false } => {
                            eprintln!();
                            tracing::error!("{error}");
                            if output.is_some() {
                                finished = true;
                            }
                        }
                    }
                }

                if !recorder.state().is_streaming() {
                    break;
                }
                draw(&recorder.snapshot(), config.meter.scale);

                if deadline.is_some_and(|d| Instant::now() >= d) {
                    break;
                }
            }
            line = input.next_line(), if input_open => {
                match line {
                    Ok(Some(line)) => match parse_key_command(&line) {
                        Some(command) => match apply_key_command(recorder, command) {
                            Ok(quit) => finished |= quit,
                            Err(e) => tracing::warn!("{e}"),
                        },
                        None if line.trim().is_empty() => {}
                        None => tracing::warn!("unknown command {line:?} (p, r [N], q)"),
                    },
                    Ok(None) => input_open = false,
                    Err(e) => {
                        tracing::debug!("stdin closed: {e}");
                        input_open = false;
                    }
                }
            }
            _ = &mut shutdown_rx => {
                break;
            }
        }
    }
    eprintln!();

    if recorder.state().has_recording() {
        let saved = recorder.stop(dest)?;
        report_saved(&saved);
    }
    recorder.shutdown()?;
    Ok(())
}

fn report_saved(saved: &SavedRecording) {
    println!(
        "\nSaved {} ({}s, {} bytes)",
        saved.path.display(),
        format_elapsed(saved.duration),
        saved.bytes
    );
}

fn bar(level: f64) -> String {
    let filled = ((level.clamp(0.0, 100.0) / 100.0) * BAR_WIDTH as f64).round() as usize;
    format!("{}{}", "#".repeat(filled), ".".repeat(BAR_WIDTH - filled))
}

fn channel_line(index: usize, reading: &ChannelReading, scale: MeterScale) -> String {
    let level = match scale {
        MeterScale::Logarithmic => reading.log_level,
        MeterScale::Linear => reading.average,
    };
    format!(
        "{index} [{}] {level:5.1} pk {:5.1}{}",
        bar(level),
        reading.peak,
        if reading.clipped { " CLIP" } else { "     " }
    )
}

fn draw(snapshot: &MeterSnapshot, scale: MeterScale) {
    let channels: Vec<String> = snapshot
        .channels
        .iter()
        .enumerate()
        .map(|(i, r)| channel_line(i, r, scale))
        .collect();

    let mut stderr = std::io::stderr().lock();
    let _ = write!(
        stderr,
        "\r{:<10} {:>8}s  {}",
        snapshot.state.name(),
        format_elapsed(snapshot.elapsed),
        channels.join("  ")
    );
    let _ = stderr.flush();
}

fn run_inspect(file: &Path) -> Result<(), LevelcapError> {
    let reader = hound::WavReader::open(file)
        .map_err(|e| LevelcapError::Container(format!("failed to read {}: {e}", file.display())))?;
    let spec = reader.spec();
    let frames = reader.duration();
    let seconds = f64::from(frames) / f64::from(spec.sample_rate);

    println!("{}", file.display());
    println!("  channels:        {}", spec.channels);
    println!("  sample rate:     {} Hz", spec.sample_rate);
    println!("  bits per sample: {}", spec.bits_per_sample);
    println!("  sample format:   {:?}", spec.sample_format);
    println!("  frames:          {frames}");
    println!("  duration:        {seconds:.2}s");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_commands() {
        assert_eq!(parse_key_command("p"), Some(KeyCommand::TogglePause));
        assert_eq!(parse_key_command(" r 1 "), Some(KeyCommand::Reset(Some(1))));
        assert_eq!(parse_key_command("r"), Some(KeyCommand::Reset(None)));
        assert_eq!(parse_key_command("q"), Some(KeyCommand::Quit));
        assert_eq!(parse_key_command("r x"), None);
        assert_eq!(parse_key_command("p now"), None);
        assert_eq!(parse_key_command(""), None);
    }

    #[test]
    fn bars_are_clamped() {
        assert_eq!(bar(-0.0), ".".repeat(BAR_WIDTH));
        assert_eq!(bar(150.0), "#".repeat(BAR_WIDTH));
    }
}
