use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Stream, StreamConfig, SupportedBufferSize, SupportedStreamConfigRange};
use crossbeam_channel::{Receiver, RecvTimeoutError, bounded};

use crate::error::{LevelcapError, Result};

use super::catalog::{Device, EndpointProbe, probe_device};
use super::format::SampleFormat;
use super::params::{BufferLimits, BufferPlan, CaptureParams, ParamsRequest, negotiate};
use super::{CaptureHost, PcmSource, StreamFault};

/// Callback blocks queued between the audio thread and the reader.
const QUEUE_DEPTH: usize = 64;

impl TryFrom<cpal::SampleFormat> for SampleFormat {
    type Error = LevelcapError;

    fn try_from(format: cpal::SampleFormat) -> Result<Self> {
        match format {
            cpal::SampleFormat::I8 => Ok(Self::S8),
            cpal::SampleFormat::I16 => Ok(Self::S16Le),
            cpal::SampleFormat::U16 => Ok(Self::U16Le),
            cpal::SampleFormat::I24 => Ok(Self::S24Le),
            cpal::SampleFormat::I32 => Ok(Self::S32Le),
            other => Err(LevelcapError::UnsupportedFormat(format!("{other:?}"))),
        }
    }
}

/// cpal's `I24` is 24 bits in a 4-byte slot, which is ALSA's S24_LE.
const fn to_cpal(format: SampleFormat) -> cpal::SampleFormat {
    match format {
        SampleFormat::S8 => cpal::SampleFormat::I8,
        SampleFormat::S16Le => cpal::SampleFormat::I16,
        SampleFormat::U16Le => cpal::SampleFormat::U16,
        SampleFormat::S24Le => cpal::SampleFormat::I24,
        SampleFormat::S32Le => cpal::SampleFormat::I32,
    }
}

fn device_name(device: &cpal::Device) -> Option<String> {
    device
        .description()
        .ok()
        .map(|desc| desc.name().to_string())
}

/// Capture host backed by the platform's default cpal host (ALSA on Linux).
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalHost;

impl CpalHost {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn find_device(host: &cpal::Host, id: &str) -> Result<cpal::Device> {
        host.input_devices()
            .map_err(|e| {
                LevelcapError::DeviceUnavailable(format!("failed to enumerate input devices: {e}"))
            })?
            .find(|d| device_name(d).as_deref() == Some(id))
            .ok_or_else(|| {
                LevelcapError::DeviceUnavailable(format!("input device not found: {id}"))
            })
    }
}

impl CaptureHost for CpalHost {
    fn enumerate(&self) -> Result<Vec<Device>> {
        let host = cpal::default_host();
        let host_name = host.id().name();

        let inputs = host.input_devices().map_err(|e| {
            LevelcapError::Catalog(format!("failed to enumerate input devices: {e}"))
        })?;

        let mut devices = Vec::new();
        for device in inputs {
            let Some(name) = device_name(&device) else {
                tracing::warn!("skipping input device without a name");
                continue;
            };

            // The probe owns the config list only for the duration of this endpoint.
            let probe = match CpalProbe::new(&device, &name, host_name) {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!("skipping {name}: {e}");
                    continue;
                }
            };

            if let Some(found) = probe_device(&probe) {
                devices.push(found);
            }
        }

        Ok(devices)
    }

    fn default_device_id(&self) -> Option<String> {
        cpal::default_host()
            .default_input_device()
            .and_then(|d| device_name(&d))
    }

    fn open(
        &self,
        device: &Device,
        request: &ParamsRequest,
        plan: &BufferPlan,
    ) -> Result<(Box<dyn PcmSource>, CaptureParams)> {
        let host = cpal::default_host();
        let handle = Self::find_device(&host, &device.id)?;

        let ranges: Vec<SupportedStreamConfigRange> = handle
            .supported_input_configs()
            .map_err(|e| {
                LevelcapError::DeviceUnavailable(format!("failed to query {}: {e}", device.id))
            })?
            .collect();

        let range = matching_range(&ranges, request).ok_or_else(|| {
            LevelcapError::ParameterRejected(format!(
                "{} has no configuration for {} ch / {} Hz / {}",
                device.id, request.channels, request.sample_rate, request.format
            ))
        })?;

        let limits = match range.buffer_size() {
            SupportedBufferSize::Range { min, max } => Some(BufferLimits {
                min: *min,
                max: *max,
            }),
            SupportedBufferSize::Unknown => None,
        };

        let params = negotiate(device, request, plan, limits)?;
        let sample_format = to_cpal(params.format());

        let stream_config = StreamConfig {
            channels: params.channels(),
            sample_rate: params.sample_rate(),
            buffer_size: if limits.is_some() {
                cpal::BufferSize::Fixed(params.period_frames() as u32)
            } else {
                cpal::BufferSize::Default
            },
        };

        let (tx, rx) = bounded::<Vec<u8>>(QUEUE_DEPTH);
        let overruns = Arc::new(AtomicUsize::new(0));
        let gone = Arc::new(AtomicBool::new(false));

        let cb_overruns = Arc::clone(&overruns);
        let err_overruns = Arc::clone(&overruns);
        let err_gone = Arc::clone(&gone);

        let err_fn = move |err: cpal::StreamError| {
            if matches!(err, cpal::StreamError::DeviceNotAvailable) {
                tracing::error!("audio stream error: {err}");
                err_gone.store(true, Ordering::Release);
            } else {
                tracing::warn!("audio stream error: {err}");
                err_overruns.fetch_add(1, Ordering::AcqRel);
            }
        };

        let stream = handle
            .build_input_stream_raw(
                &stream_config,
                sample_format,
                move |data: &cpal::Data, _info: &cpal::InputCallbackInfo| {
                    // try_send to stay lock-free in the audio callback
                    if tx.try_send(data.bytes().to_vec()).is_err() {
                        cb_overruns.fetch_add(1, Ordering::AcqRel);
                    }
                },
                err_fn,
                None,
            )
            .map_err(|e| match e {
                cpal::BuildStreamError::DeviceNotAvailable => {
                    LevelcapError::DeviceUnavailable(format!("{}: {e}", device.id))
                }
                cpal::BuildStreamError::StreamConfigNotSupported
                | cpal::BuildStreamError::InvalidArgument => {
                    LevelcapError::ParameterRejected(format!("{}: {e}", device.id))
                }
                other => LevelcapError::DeviceUnavailable(format!(
                    "failed to build input stream on {}: {other}",
                    device.id
                )),
            })?;

        // Nothing flows until start(); cpal may auto-play on some backends.
        let _ = stream.pause();

        tracing::debug!(
            "opened {}: {}, period={} frames, buffer={} frames",
            device.id,
            params.description(),
            params.period_frames(),
            params.buffer_frames()
        );

        let source = CpalSource {
            stream,
            receiver: rx,
            pending: Vec::with_capacity(params.buffer_bytes() * 2),
            frame_bytes: params.frame_bytes(),
            timeout: params.buffer_duration() * 2 + Duration::from_millis(100),
            overruns,
            gone,
        };

        Ok((Box::new(source), params))
    }
}

fn matching_range<'a>(
    ranges: &'a [SupportedStreamConfigRange],
    request: &ParamsRequest,
) -> Option<&'a SupportedStreamConfigRange> {
    ranges.iter().find(|r| {
        r.channels() == request.channels
            && r.min_sample_rate() <= request.sample_rate
            && request.sample_rate <= r.max_sample_rate()
            && r.sample_format() == to_cpal(request.format)
    })
}

struct CpalProbe {
    id: String,
    card_name: String,
    long_name: String,
    ranges: Vec<SupportedStreamConfigRange>,
}

impl CpalProbe {
    fn new(device: &cpal::Device, name: &str, host_name: &str) -> Result<Self> {
        let ranges = device
            .supported_input_configs()
            .map_err(|e| LevelcapError::DeviceUnavailable(format!("failed to query configs: {e}")))?
            .collect();

        Ok(Self::from_ranges(name, host_name, ranges))
    }

    /// Ranges in layouts the pipeline cannot decode are dropped up front, so
    /// they contribute neither channel counts nor rates.
    fn from_ranges(name: &str, host_name: &str, ranges: Vec<SupportedStreamConfigRange>) -> Self {
        let ranges = ranges
            .into_iter()
            .filter(|r| SampleFormat::try_from(r.sample_format()).is_ok())
            .collect();

        Self {
            id: name.to_string(),
            card_name: name.to_string(),
            long_name: format!("{name} ({host_name})"),
            ranges,
        }
    }
}

impl EndpointProbe for CpalProbe {
    fn id(&self) -> &str {
        &self.id
    }

    fn card_name(&self) -> &str {
        &self.card_name
    }

    fn long_name(&self) -> &str {
        &self.long_name
    }

    fn channel_range(&self) -> Option<(u16, u16)> {
        let min = self.ranges.iter().map(SupportedStreamConfigRange::channels).min()?;
        let max = self.ranges.iter().map(SupportedStreamConfigRange::channels).max()?;
        Some((min, max))
    }

    fn test_channels(&self, channels: u16) -> bool {
        self.ranges.iter().any(|r| r.channels() == channels)
    }

    fn test_rate(&self, rate: u32) -> bool {
        self.ranges
            .iter()
            .any(|r| r.min_sample_rate() <= rate && rate <= r.max_sample_rate())
    }

    fn test_format(&self, format: SampleFormat) -> bool {
        self.ranges
            .iter()
            .any(|r| SampleFormat::try_from(r.sample_format()).ok() == Some(format))
    }
}

/// Turns cpal's push callbacks into blocking reads of exactly one buffer.
struct CpalSource {
    stream: Stream,
    receiver: Receiver<Vec<u8>>,
    pending: Vec<u8>,
    frame_bytes: usize,
    timeout: Duration,
    overruns: Arc<AtomicUsize>,
    gone: Arc<AtomicBool>,
}

impl PcmSource for CpalSource {
    fn start(&mut self) -> Result<()> {
        self.stream.play().map_err(|e| {
            LevelcapError::DeviceUnavailable(format!("failed to start audio stream: {e}"))
        })
    }

    fn read(&mut self, buf: &mut [u8]) -> std::result::Result<usize, StreamFault> {
        let want = buf.len();
        let deadline = Instant::now() + self.timeout;

        while self.pending.len() < want {
            if self.gone.load(Ordering::Acquire) {
                return Err(StreamFault::Disconnected("device no longer available".to_string()));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.receiver.recv_timeout(remaining) {
                Ok(block) => self.pending.extend_from_slice(&block),
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(StreamFault::Disconnected("audio callback closed".to_string()));
                }
            }
        }

        let available = self.pending.len().min(want);
        let taken = available - available % self.frame_bytes;
        buf[..taken].copy_from_slice(&self.pending[..taken]);
        buf[taken..].fill(0);
        self.pending.drain(..taken);
        let frames = taken / self.frame_bytes;

        if self.overruns.swap(0, Ordering::AcqRel) > 0 {
            return Err(StreamFault::Overrun { frames });
        }
        if taken < want {
            return Err(StreamFault::ShortRead { frames });
        }
        Ok(frames)
    }

    fn recover(&mut self, fault: &StreamFault) -> Result<()> {
        if let StreamFault::Disconnected(reason) = fault {
            return Err(LevelcapError::StreamFault(reason.clone()));
        }
        if self.gone.load(Ordering::Acquire) {
            return Err(LevelcapError::StreamFault("device no longer available".to_string()));
        }

        // Resync: whatever is queued is already stale relative to the gap.
        if matches!(fault, StreamFault::Overrun { .. }) {
            while self.receiver.try_recv().is_ok() {}
            self.pending.clear();
        }

        self.stream
            .play()
            .map_err(|e| LevelcapError::StreamFault(format!("failed to restart audio stream: {e}")))
    }
}

impl Drop for CpalSource {
    fn drop(&mut self) {
        let _ = self.stream.pause();
        tracing::debug!("capture stream closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(
        channels: u16,
        min: u32,
        max: u32,
        format: cpal::SampleFormat,
    ) -> SupportedStreamConfigRange {
        SupportedStreamConfigRange::new(
            channels,
            min,
            max,
            SupportedBufferSize::Range { min: 64, max: 8192 },
            format,
        )
    }

    #[test]
    fn cpal_formats_map_to_supported_layouts() {
        assert_eq!(
            SampleFormat::try_from(cpal::SampleFormat::I16).ok(),
            Some(SampleFormat::S16Le)
        );
        assert_eq!(
            SampleFormat::try_from(cpal::SampleFormat::U16).ok(),
            Some(SampleFormat::U16Le)
        );
        assert!(SampleFormat::try_from(cpal::SampleFormat::F32).is_err());
        assert_eq!(to_cpal(SampleFormat::S24Le), cpal::SampleFormat::I24);
        assert_eq!(cpal::SampleFormat::I24.sample_size(), SampleFormat::S24Le.sample_bytes());
        for format in [
            SampleFormat::S8,
            SampleFormat::S16Le,
            SampleFormat::U16Le,
            SampleFormat::S24Le,
            SampleFormat::S32Le,
        ] {
            let back = SampleFormat::try_from(to_cpal(format)).ok();
            assert_eq!(back, Some(format));
        }
    }

    #[test]
    fn probe_reads_config_ranges() {
        let probe = CpalProbe::from_ranges(
            "USB Mic",
            "ALSA",
            vec![
                range(1, 8000, 48000, cpal::SampleFormat::I16),
                range(2, 44100, 44100, cpal::SampleFormat::I16),
                range(2, 44100, 96000, cpal::SampleFormat::F32),
            ],
        );

        let device = probe_device(&probe).unwrap_or_else(|| panic!("expected a device"));
        assert_eq!(device.long_name, "USB Mic (ALSA)");
        assert_eq!(device.channels, vec![1, 2]);
        assert_eq!(
            device.sample_rates,
            vec![8000, 11025, 16000, 22050, 44100, 48000]
        );
        assert_eq!(device.formats, vec![SampleFormat::S16Le]);
    }

    #[test]
    fn float_only_endpoint_is_unusable() {
        let probe = CpalProbe::from_ranges(
            "Float Only",
            "ALSA",
            vec![range(2, 44100, 48000, cpal::SampleFormat::F32)],
        );
        assert!(probe_device(&probe).is_none());
    }

    #[test]
    fn matching_range_requires_exact_combination() {
        let ranges = vec![
            range(1, 8000, 48000, cpal::SampleFormat::I16),
            range(2, 44100, 44100, cpal::SampleFormat::I32),
        ];
        let ok = ParamsRequest {
            channels: 2,
            sample_rate: 44100,
            format: SampleFormat::S32Le,
        };
        assert!(matching_range(&ranges, &ok).is_some());

        let mixed = ParamsRequest {
            channels: 2,
            sample_rate: 44100,
            format: SampleFormat::S16Le,
        };
        assert!(matching_range(&ranges, &mixed).is_none());
    }
}
