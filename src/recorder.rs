use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::Local;
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use serde::Serialize;

use crate::audio::catalog::{Device, DeviceCatalog};
use crate::audio::params::{BufferPlan, CaptureParams, ParamsRequest, negotiate};
use crate::audio::{CaptureHost, PcmSource};
use crate::config::{Config, SaveFormat};
use crate::container::{TempContainer, finalize};
use crate::error::{LevelcapError, Result};
use crate::meter::{ChannelReading, MeterTuning, Statistics};
use crate::state::{ElapsedClock, RecordingState, SharedState};
use crate::transcode::{Transcoder, create_transcoder};

/// Everything a `Recorder` needs besides the host.
#[derive(Clone)]
pub struct RecorderOptions {
    /// Preferred endpoint id; host default when `None`.
    pub device: Option<String>,
    /// Starting parameters, fitted to the device until the consumer picks explicit ones.
    pub request: ParamsRequest,
    pub plan: BufferPlan,
    pub tuning: MeterTuning,
    pub directory: PathBuf,
    pub temp_directory: PathBuf,
    pub max_duration: Duration,
    /// Set when recordings are delivered compressed.
    pub transcoder: Option<Arc<dyn Transcoder>>,
}

impl RecorderOptions {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            device: config.audio.device.clone(),
            request: config.audio.request(),
            plan: config.audio.plan(),
            tuning: config.meter.tuning(),
            directory: config.recording.directory(),
            temp_directory: config.recording.temp_directory(),
            max_duration: config.recording.max_duration(),
            transcoder: create_transcoder(&config.recording).map(Arc::from),
        }
    }
}

impl Default for RecorderOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// A temporary container the capture thread has closed and handed back.
#[derive(Debug, Clone)]
pub struct ClosedRecording {
    pub temp_path: PathBuf,
    pub name: String,
    pub params: CaptureParams,
    pub bytes: u64,
    pub duration: Duration,
}

/// A finished recording at its destination.
#[derive(Debug, Clone, Serialize)]
pub struct SavedRecording {
    pub path: PathBuf,
    pub bytes: u64,
    pub duration: Duration,
}

/// Something the capture thread did on its own.
#[derive(Debug)]
pub enum RecorderEvent {
    /// The time cap stopped a recording; pass it to `Recorder::save`.
    RecordingFinished(ClosedRecording),
    /// `fatal` faults stopped the session; the others only abandoned a recording.
    Fault { error: LevelcapError, fatal: bool },
}

/// What the consumer polls for.
#[derive(Debug, Clone, Serialize)]
pub struct MeterSnapshot {
    pub state: RecordingState,
    pub elapsed: Duration,
    pub channels: Vec<ChannelReading>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Record,
    Pause,
    Resume,
    Stop,
    Teardown,
}

impl Command {
    const fn name(self) -> &'static str {
        match self {
            Self::Record => "record",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Stop => "stop",
            Self::Teardown => "tear down",
        }
    }
}

type Reply = Result<Option<ClosedRecording>>;

struct Request {
    command: Command,
    reply: Sender<Reply>,
}

#[derive(Debug, Default)]
struct Shared {
    state: SharedState,
    clock: Mutex<ElapsedClock>,
}

impl Shared {
    fn clock(&self) -> MutexGuard<'_, ElapsedClock> {
        self.clock.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct Session {
    params: CaptureParams,
    stats: Arc<Statistics>,
    commands: Sender<Request>,
    handle: JoinHandle<()>,
}

/// The capture thread's side of a session.
struct CaptureLoop {
    source: Box<dyn PcmSource>,
    params: CaptureParams,
    stats: Arc<Statistics>,
    shared: Arc<Shared>,
    commands: Receiver<Request>,
    events: Sender<RecorderEvent>,
    temp_directory: PathBuf,
    max_duration: Duration,
    container: Option<TempContainer>,
}

impl CaptureLoop {
    fn run(mut self) {
        let frame_bytes = self.params.frame_bytes();
        let buffer_frames = self.params.buffer_frames();
        let mut buf = vec![0u8; self.params.buffer_bytes()];

        loop {
            loop {
                match self.commands.try_recv() {
                    Ok(request) => {
                        if self.apply(request) {
                            return;
                        }
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        tracing::debug!("recorder dropped, capture thread exiting");
                        self.shared.state.store(RecordingState::Stopping);
                        if let Some(container) = self.container.take() {
                            tracing::warn!(
                                "abandoning open recording {}",
                                container.path().display()
                            );
                            let _ = container.close();
                        }
                        return;
                    }
                }
            }

            let frames = match self.source.read(&mut buf) {
                Ok(frames) => frames,
                Err(fault) => match self.source.recover(&fault) {
                    Ok(()) => {
                        tracing::warn!("recovered from {fault}");
                        fault.frames()
                    }
                    Err(e) => {
                        tracing::error!("recovery from {fault} failed: {e}");
                        self.fail(e);
                        return;
                    }
                },
            };

            let data = &buf[..frames.min(buffer_frames) * frame_bytes];
            self.stats.process(data, &self.params);

            if self.shared.state.load() == RecordingState::Recording {
                self.append(data);
                self.enforce_time_cap();
            }
        }
    }

    /// Apply one command. Returns `true` when the thread should exit.
    fn apply(&mut self, request: Request) -> bool {
        let state = self.shared.state.load();
        let now = Instant::now();
        let mut exit = false;

        let reply = match (request.command, state) {
            (Command::Record, RecordingState::Monitoring) => {
                match TempContainer::open(&self.temp_directory, Local::now()) {
                    Ok(container) => {
                        self.container = Some(container);
                        self.shared.clock().start(now);
                        self.shared.state.store(RecordingState::Recording);
                        Ok(None)
                    }
                    Err(e) => Err(e),
                }
            }
            (Command::Pause, RecordingState::Recording) => {
                self.shared.clock().pause(now);
                self.shared.state.store(RecordingState::Paused);
                Ok(None)
            }
            (Command::Resume, RecordingState::Paused) => {
                self.shared.clock().resume(now);
                self.shared.state.store(RecordingState::Recording);
                Ok(None)
            }
            (Command::Stop, RecordingState::Recording | RecordingState::Paused) => {
                let closed = self.close_recording(now);
                self.shared.state.store(RecordingState::Monitoring);
                closed.map(Some)
            }
            (Command::Teardown, _) => {
                self.shared.state.store(RecordingState::Stopping);
                exit = true;
                if self.container.is_some() {
                    self.close_recording(now).map(Some)
                } else {
                    Ok(None)
                }
            }
            (command, from) => Err(LevelcapError::InvalidTransition {
                from: from.name().to_string(),
                command: command.name().to_string(),
            }),
        };

        let _ = request.reply.send(reply);
        exit
    }

    fn close_recording(&mut self, now: Instant) -> Result<ClosedRecording> {
        let duration = self.shared.clock().reset(now);
        let container = self
            .container
            .take()
            .ok_or_else(|| LevelcapError::Other("no recording is open".to_string()))?;
        let name = container.name().to_string();
        let bytes = container.bytes_written();
        let temp_path = container.close()?;

        Ok(ClosedRecording {
            temp_path,
            name,
            params: self.params,
            bytes,
            duration,
        })
    }

    fn append(&mut self, data: &[u8]) {
        let Some(container) = self.container.as_mut() else {
            return;
        };
        if let Err(e) = container.append(data) {
            tracing::error!("recording abandoned: {e}");
            if let Some(container) = self.container.take() {
                let _ = container.close();
            }
            self.shared.clock().reset(Instant::now());
            self.shared.state.store(RecordingState::Monitoring);
            let _ = self.events.send(RecorderEvent::Fault {
                error: e,
                fatal: false,
            });
        }
    }

    fn enforce_time_cap(&mut self) {
        let now = Instant::now();
        if self.shared.clock().elapsed(now) < self.max_duration {
            return;
        }

        tracing::info!("recording reached {}s, stopping", self.max_duration.as_secs());
        let event = match self.close_recording(now) {
            Ok(closed) => RecorderEvent::RecordingFinished(closed),
            Err(error) => RecorderEvent::Fault { error, fatal: false },
        };
        self.shared.state.store(RecordingState::Monitoring);
        let _ = self.events.send(event);
    }

    /// Unrecoverable read failure: release the device and stop.
    fn fail(mut self, error: LevelcapError) {
        let now = Instant::now();
        if self.container.is_some() {
            match self.close_recording(now) {
                Ok(closed) => {
                    let _ = self.events.send(RecorderEvent::RecordingFinished(closed));
                }
                Err(e) => tracing::error!("failed to close recording: {e}"),
            }
        }

        let Self {
            source,
            shared,
            events,
            ..
        } = self;
        drop(source);
        shared.clock().reset(now);
        shared.state.store(RecordingState::Stopped);
        let _ = events.send(RecorderEvent::Fault { error, fatal: true });
    }
}

/// Owns the capture thread and drives the recording state machine.
pub struct Recorder {
    host: Arc<dyn CaptureHost>,
    catalog: DeviceCatalog,
    options: RecorderOptions,
    device: Option<Device>,
    /// Parameters picked explicitly by the consumer; never fitted.
    request: Option<ParamsRequest>,
    shared: Arc<Shared>,
    session: Option<Session>,
    events_tx: Sender<RecorderEvent>,
    events_rx: Receiver<RecorderEvent>,
}

impl Recorder {
    pub fn new(host: Arc<dyn CaptureHost>, options: RecorderOptions) -> Result<Self> {
        let catalog = DeviceCatalog::load(host.as_ref())?;
        let (events_tx, events_rx) = crossbeam_channel::unbounded();

        Ok(Self {
            host,
            catalog,
            options,
            device: None,
            request: None,
            shared: Arc::new(Shared::default()),
            session: None,
            events_tx,
            events_rx,
        })
    }

    #[must_use]
    pub fn state(&self) -> RecordingState {
        self.shared.state.load()
    }

    #[must_use]
    pub fn devices(&self) -> &[Device] {
        self.catalog.devices()
    }

    pub fn refresh_devices(&mut self) -> Result<&[Device]> {
        self.catalog.refresh(self.host.as_ref())
    }

    /// The device of the current (or last) session.
    #[must_use]
    pub const fn device(&self) -> Option<&Device> {
        self.device.as_ref()
    }

    /// Frozen parameters of the running session.
    #[must_use]
    pub fn params(&self) -> Option<CaptureParams> {
        self.session.as_ref().map(|s| s.params)
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.shared.clock().elapsed(Instant::now())
    }

    #[must_use]
    pub fn snapshot(&self) -> MeterSnapshot {
        MeterSnapshot {
            state: self.state(),
            elapsed: self.elapsed(),
            channels: self
                .session
                .as_ref()
                .map(|s| s.stats.readings())
                .unwrap_or_default(),
        }
    }

    /// Drain events raised by the capture thread.
    pub fn poll_events(&mut self) -> Vec<RecorderEvent> {
        let events: Vec<_> = self.events_rx.try_iter().collect();
        self.reap();
        events
    }

    pub fn reset_channel(&self, channel: usize) -> Result<()> {
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| LevelcapError::Other("no capture session is running".to_string()))?;
        session.stats.reset_channel(channel)
    }

    /// Stopped -> Monitoring: open the device and start the capture thread.
    pub fn start(&mut self) -> Result<CaptureParams> {
        self.reap();
        if self.session.is_some() {
            return Err(LevelcapError::InvalidTransition {
                from: self.state().name().to_string(),
                command: "start".to_string(),
            });
        }

        let device = match &self.device {
            Some(device) => device.clone(),
            None => self.catalog.select(self.options.device.as_deref())?.clone(),
        };
        self.device = Some(device.clone());

        let request = self.request.unwrap_or_else(|| {
            let fitted = self.options.request.fit_to(&device);
            if fitted != self.options.request {
                tracing::warn!(
                    "{} cannot do {} ch / {} Hz / {}, using {} ch / {} Hz / {}",
                    device.id,
                    self.options.request.channels,
                    self.options.request.sample_rate,
                    self.options.request.format,
                    fitted.channels,
                    fitted.sample_rate,
                    fitted.format
                );
            }
            fitted
        });

        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let (commands_tx, commands_rx) = crossbeam_channel::unbounded();

        let host = Arc::clone(&self.host);
        let shared = Arc::clone(&self.shared);
        let events = self.events_tx.clone();
        let plan = self.options.plan;
        let tuning = self.options.tuning;
        let temp_directory = self.options.temp_directory.clone();
        let max_duration = self.options.max_duration;

        let handle = std::thread::Builder::new()
            .name("levelcap-capture".to_string())
            .spawn(move || {
                let opened = host.open(&device, &request, &plan).and_then(|(mut source, params)| {
                    source.start()?;
                    Ok((source, params))
                });
                let (source, params) = match opened {
                    Ok(opened) => opened,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                let stats = Arc::new(Statistics::new(&params, tuning));
                shared.state.store(RecordingState::Monitoring);
                if ready_tx.send(Ok((params, Arc::clone(&stats)))).is_err() {
                    shared.state.store(RecordingState::Stopped);
                    return;
                }

                CaptureLoop {
                    source,
                    params,
                    stats,
                    shared,
                    commands: commands_rx,
                    events,
                    temp_directory,
                    max_duration,
                    container: None,
                }
                .run();
            })?;

        match ready_rx.recv() {
            Ok(Ok((params, stats))) => {
                tracing::info!("capturing from {}: {}", self.device_id(), params.description());
                self.session = Some(Session {
                    params,
                    stats,
                    commands: commands_tx,
                    handle,
                });
                Ok(params)
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                self.shared.state.store(RecordingState::Stopped);
                Err(LevelcapError::StreamFault(
                    "capture thread exited while opening the device".to_string(),
                ))
            }
        }
    }

    /// Monitoring -> Recording.
    pub fn record(&mut self) -> Result<()> {
        self.send_command(Command::Record).map(|_| ())
    }

    /// Recording -> Paused.
    pub fn pause(&mut self) -> Result<()> {
        self.send_command(Command::Pause).map(|_| ())
    }

    /// Paused -> Recording.
    pub fn resume(&mut self) -> Result<()> {
        self.send_command(Command::Resume).map(|_| ())
    }

    /// Recording/Paused -> Monitoring, saving to `dest` (or the default name).
    pub fn stop(&mut self, dest: Option<&Path>) -> Result<SavedRecording> {
        let closed = self
            .send_command(Command::Stop)?
            .ok_or_else(|| LevelcapError::Other("no recording was open".to_string()))?;
        self.save(closed, dest)
    }

    /// Stop when recording, record when monitoring.
    pub fn toggle_record(&mut self, dest: Option<&Path>) -> Result<Option<SavedRecording>> {
        if self.state().has_recording() {
            self.stop(dest).map(Some)
        } else {
            self.record().map(|()| None)
        }
    }

    /// Tear the session down and wait for the capture thread. An open
    /// recording is saved under its default name. Calling this when nothing
    /// is running does nothing.
    pub fn shutdown(&mut self) -> Result<Option<SavedRecording>> {
        let Some(session) = self.session.take() else {
            return Ok(None);
        };

        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        let closed = if session
            .commands
            .send(Request {
                command: Command::Teardown,
                reply: reply_tx,
            })
            .is_ok()
        {
            reply_rx.recv().unwrap_or(Ok(None))
        } else {
            Ok(None)
        };

        drop(session.commands);
        if session.handle.join().is_err() {
            tracing::error!("capture thread panicked");
        }
        self.shared.clock().reset(Instant::now());
        self.shared.state.store(RecordingState::Stopped);

        match closed? {
            Some(closed) => self.save(closed, None).map(Some),
            None => Ok(None),
        }
    }

    /// Switch to another device. A running session is reopened on it, falling
    /// back to the previous device if that fails.
    pub fn select_device(&mut self, id: &str) -> Result<()> {
        self.ensure_unlocked("change device")?;
        let device = self.catalog.find(id).cloned().ok_or_else(|| {
            LevelcapError::DeviceUnavailable(format!("input device not found: {id}"))
        })?;

        let previous = self.device.replace(device);
        self.reopen(move |r| r.device = previous)
    }

    /// Pick explicit parameters. A running session is reopened with them,
    /// falling back to the previous ones if that fails.
    pub fn select_params(&mut self, request: ParamsRequest) -> Result<()> {
        self.ensure_unlocked("change parameters")?;
        if let Some(device) = &self.device {
            negotiate(device, &request, &self.options.plan, None)?;
        }

        let previous = self.request.replace(request);
        self.reopen(move |r| r.request = previous)
    }

    /// Finalize a closed recording: header + payload to the destination, then
    /// transcode when configured. A failed transcode keeps the PCM file.
    pub fn save(&self, closed: ClosedRecording, dest: Option<&Path>) -> Result<SavedRecording> {
        let format = self
            .options
            .transcoder
            .as_ref()
            .map_or(SaveFormat::Wav, |t| t.format());
        let dest = dest.map_or_else(
            || {
                self.options
                    .directory
                    .join(format!("{}.{}", closed.name, format.extension()))
            },
            Path::to_path_buf,
        );

        let pcm = match &self.options.transcoder {
            Some(_) if dest.extension().is_some_and(|e| e != "wav") => dest.with_extension("wav"),
            _ => dest.clone(),
        };
        let bytes = finalize(&closed.temp_path, &pcm, &closed.params)?;

        if pcm != dest
            && let Some(transcoder) = &self.options.transcoder
        {
            transcoder.transcode(&pcm, &dest).map_err(|e| {
                let reason = match e {
                    LevelcapError::Transcode(reason) => reason,
                    other => other.to_string(),
                };
                LevelcapError::Transcode(format!(
                    "{reason}; PCM recording kept at {}",
                    pcm.display()
                ))
            })?;
            std::fs::remove_file(&pcm)?;
        }

        Ok(SavedRecording {
            path: dest,
            bytes,
            duration: closed.duration,
        })
    }

    fn device_id(&self) -> &str {
        self.device.as_ref().map_or("<none>", |d| d.id.as_str())
    }

    fn ensure_unlocked(&self, command: &str) -> Result<()> {
        let state = self.state();
        if state.has_recording() {
            return Err(LevelcapError::InvalidTransition {
                from: state.name().to_string(),
                command: command.to_string(),
            });
        }
        Ok(())
    }

    fn reopen(&mut self, restore: impl FnOnce(&mut Self)) -> Result<()> {
        self.reap();
        if self.session.is_none() {
            return Ok(());
        }

        self.shutdown()?;
        match self.start() {
            Ok(_) => Ok(()),
            Err(e) => {
                tracing::warn!("reopen failed ({e}), restoring previous settings");
                restore(self);
                if let Err(fallback) = self.start() {
                    tracing::error!("reopen with previous settings failed: {fallback}");
                }
                Err(e)
            }
        }
    }

    fn send_command(&mut self, command: Command) -> Reply {
        self.reap();
        let Some(commands) = self.session.as_ref().map(|s| s.commands.clone()) else {
            return Err(LevelcapError::InvalidTransition {
                from: self.state().name().to_string(),
                command: command.name().to_string(),
            });
        };

        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        let sent = commands.send(Request {
            command,
            reply: reply_tx,
        });
        match sent.ok().and_then(|()| reply_rx.recv().ok()) {
            Some(reply) => reply,
            None => {
                self.reap();
                Err(LevelcapError::StreamFault("capture thread has exited".to_string()))
            }
        }
    }

    /// Join a capture thread that exited on its own. The thread stores
    /// `Stopped` only on its way out, so joining then does not block for long.
    fn reap(&mut self) {
        let exited = self.session.as_ref().is_some_and(|s| {
            s.handle.is_finished() || self.shared.state.load() == RecordingState::Stopped
        });
        if !exited {
            return;
        }
        if let Some(session) = self.session.take()
            && session.handle.join().is_err()
        {
            tracing::error!("capture thread panicked");
        }
        self.shared.state.store(RecordingState::Stopped);
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::error!("shutdown failed: {e}");
        }
    }
}
