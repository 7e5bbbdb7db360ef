#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use levelcap::audio::catalog::Device;
use levelcap::audio::params::{BufferPlan, CaptureParams, ParamsRequest, negotiate};
use levelcap::audio::{CaptureHost, PcmSource, SampleFormat, StreamFault};
use levelcap::error::{LevelcapError, Result};
use levelcap::meter::MeterTuning;
use levelcap::recorder::{Recorder, RecorderOptions};

/// One scripted read.
#[derive(Debug, Clone)]
pub enum Step {
    Data(Vec<u8>),
    Fault(StreamFault),
}

#[derive(Debug, Default)]
pub struct Counters {
    pub opens: AtomicUsize,
    pub reads: AtomicUsize,
    pub recovers: AtomicUsize,
    pub closes: AtomicUsize,
}

impl Counters {
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Acquire)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::Acquire)
    }
}

/// A capture host with one device whose first session plays back a script,
/// then silence.
pub struct ScriptedHost {
    pub device: Device,
    script: Mutex<VecDeque<Step>>,
    pub counters: Arc<Counters>,
    /// Rates the "driver" refuses at open time although they are advertised.
    pub refuse_rates: Vec<u32>,
    pub fail_recovery: bool,
}

impl ScriptedHost {
    pub fn new(script: Vec<Step>) -> Self {
        Self {
            device: Device {
                id: "hw:1,0".to_string(),
                card_name: "Scripted".to_string(),
                long_name: "Scripted USB capture".to_string(),
                channels: vec![1, 2],
                sample_rates: vec![44100, 48000],
                formats: vec![SampleFormat::S16Le],
            },
            script: Mutex::new(script.into()),
            counters: Arc::new(Counters::default()),
            refuse_rates: Vec::new(),
            fail_recovery: false,
        }
    }
}

impl CaptureHost for ScriptedHost {
    fn enumerate(&self) -> Result<Vec<Device>> {
        Ok(vec![self.device.clone()])
    }

    fn default_device_id(&self) -> Option<String> {
        Some(self.device.id.clone())
    }

    fn open(
        &self,
        device: &Device,
        request: &ParamsRequest,
        plan: &BufferPlan,
    ) -> Result<(Box<dyn PcmSource>, CaptureParams)> {
        if self.refuse_rates.contains(&request.sample_rate) {
            return Err(LevelcapError::ParameterRejected(format!(
                "driver refused {} Hz",
                request.sample_rate
            )));
        }
        let params = negotiate(device, request, plan, None)?;
        self.counters.opens.fetch_add(1, Ordering::AcqRel);

        let mut pending = self.script.lock().unwrap_or_else(PoisonError::into_inner);
        let script = std::mem::take(&mut *pending);
        drop(pending);
        let source = ScriptedSource {
            params,
            script,
            counters: Arc::clone(&self.counters),
            fail_recovery: self.fail_recovery,
        };
        Ok((Box::new(source), params))
    }
}

struct ScriptedSource {
    params: CaptureParams,
    script: VecDeque<Step>,
    counters: Arc<Counters>,
    fail_recovery: bool,
}

impl PcmSource for ScriptedSource {
    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> std::result::Result<usize, StreamFault> {
        std::thread::sleep(Duration::from_millis(1));
        buf.fill(0);
        let step = self.script.pop_front();
        let result = match step {
            Some(Step::Data(bytes)) => {
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                Ok(n / self.params.frame_bytes())
            }
            Some(Step::Fault(fault)) => Err(fault),
            None => Ok(self.params.buffer_frames()),
        };
        self.counters.reads.fetch_add(1, Ordering::AcqRel);
        result
    }

    fn recover(&mut self, fault: &StreamFault) -> Result<()> {
        self.counters.recovers.fetch_add(1, Ordering::AcqRel);
        if self.fail_recovery {
            return Err(LevelcapError::StreamFault(format!("cannot recover from {fault}")));
        }
        Ok(())
    }
}

impl Drop for ScriptedSource {
    fn drop(&mut self) {
        self.counters.closes.fetch_add(1, Ordering::AcqRel);
    }
}

pub fn options(dir: &Path) -> RecorderOptions {
    RecorderOptions {
        device: None,
        request: ParamsRequest::default(),
        plan: BufferPlan::default(),
        tuning: MeterTuning::default(),
        directory: dir.join("Recordings"),
        temp_directory: dir.join("tmp"),
        max_duration: Duration::from_secs(3600),
        transcoder: None,
    }
}

pub fn recorder(host: ScriptedHost, options: RecorderOptions) -> (Recorder, Arc<Counters>) {
    let counters = Arc::clone(&host.counters);
    let recorder = Recorder::new(Arc::new(host), options).unwrap_or_else(|e| panic!("{e}"));
    (recorder, counters)
}

/// One buffer of interleaved samples for `params`.
pub fn buffer(params: &CaptureParams, sample: impl Fn(usize, usize) -> i64) -> Vec<u8> {
    let mut out = Vec::with_capacity(params.buffer_bytes());
    for frame in 0..params.buffer_frames() {
        for channel in 0..usize::from(params.channels()) {
            out.extend(params.format().encode_sample(sample(frame, channel)));
        }
    }
    out
}

/// Parameters the scripted host resolves for the default request.
pub fn default_params() -> CaptureParams {
    let host = ScriptedHost::new(Vec::new());
    negotiate(&host.device, &ParamsRequest::default(), &BufferPlan::default(), None)
        .unwrap_or_else(|e| panic!("{e}"))
}

pub fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(2));
    }
}
