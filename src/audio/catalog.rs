use serde::Serialize;

use crate::error::{LevelcapError, Result};

use super::CaptureHost;
use super::format::SampleFormat;

/// Sample rates tested against every endpoint, in display order.
pub const CANDIDATE_RATES: [u32; 9] = [
    8000, 11025, 16000, 22050, 44100, 48000, 88200, 96000, 192_000,
];

/// A capture endpoint and the parameter values it was confirmed to accept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Device {
    /// Opaque endpoint name used to reopen the device.
    pub id: String,
    pub card_name: String,
    pub long_name: String,
    pub channels: Vec<u16>,
    pub sample_rates: Vec<u32>,
    pub formats: Vec<SampleFormat>,
}

impl Device {
    #[must_use]
    pub fn supports(&self, channels: u16, sample_rate: u32, format: SampleFormat) -> bool {
        self.channels.contains(&channels)
            && self.sample_rates.contains(&sample_rate)
            && self.formats.contains(&format)
    }
}

/// Driver-side view of one endpoint while it is being probed.
///
/// Implementations hold whatever transient handle the driver needs and must
/// release it on drop; `probe_device` never streams.
pub trait EndpointProbe {
    fn id(&self) -> &str;
    fn card_name(&self) -> &str;
    fn long_name(&self) -> &str;

    /// Inclusive channel-count range the driver advertises, if any.
    fn channel_range(&self) -> Option<(u16, u16)>;

    fn test_channels(&self, channels: u16) -> bool;
    fn test_rate(&self, rate: u32) -> bool;
    fn test_format(&self, format: SampleFormat) -> bool;
}

/// Build a `Device` from a probe, or `None` if any capability list comes up empty.
pub fn probe_device(probe: &dyn EndpointProbe) -> Option<Device> {
    let channels: Vec<u16> = probe
        .channel_range()
        .map(|(min, max)| (min.max(1)..=max).filter(|&n| probe.test_channels(n)).collect())
        .unwrap_or_default();

    let sample_rates: Vec<u32> = CANDIDATE_RATES
        .into_iter()
        .filter(|&rate| probe.test_rate(rate))
        .collect();

    let formats: Vec<SampleFormat> = SampleFormat::CANDIDATES
        .into_iter()
        .filter(|&format| probe.test_format(format))
        .collect();

    if channels.is_empty() || sample_rates.is_empty() || formats.is_empty() {
        tracing::debug!(
            "skipping endpoint {}: channels={channels:?} rates={sample_rates:?} \
             formats={formats:?}",
            probe.id()
        );
        return None;
    }

    Some(Device {
        id: probe.id().to_string(),
        card_name: probe.card_name().to_string(),
        long_name: probe.long_name().to_string(),
        channels,
        sample_rates,
        formats,
    })
}

/// The list of usable capture devices, rebuilt wholesale on every refresh.
#[derive(Debug, Default)]
pub struct DeviceCatalog {
    devices: Vec<Device>,
    default_id: Option<String>,
}

impl DeviceCatalog {
    pub fn load(host: &dyn CaptureHost) -> Result<Self> {
        let mut catalog = Self::default();
        catalog.refresh(host)?;
        Ok(catalog)
    }

    pub fn refresh(&mut self, host: &dyn CaptureHost) -> Result<&[Device]> {
        let devices = host.enumerate()?;
        tracing::info!("found {} capture device(s)", devices.len());
        self.devices = devices;
        self.default_id = host.default_device_id();
        Ok(&self.devices)
    }

    #[must_use]
    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    #[must_use]
    pub fn find(&self, id: &str) -> Option<&Device> {
        self.devices.iter().find(|d| d.id == id)
    }

    #[must_use]
    pub fn default_id(&self) -> Option<&str> {
        self.default_id.as_deref()
    }

    /// Pick `preferred` if given, else the host default, else the first device.
    pub fn select(&self, preferred: Option<&str>) -> Result<&Device> {
        if let Some(id) = preferred {
            return self.find(id).ok_or_else(|| {
                LevelcapError::DeviceUnavailable(format!("input device not found: {id}"))
            });
        }

        self.default_id
            .as_deref()
            .and_then(|id| self.find(id))
            .or_else(|| self.devices.first())
            .ok_or_else(|| {
                LevelcapError::DeviceUnavailable("no capture devices available".to_string())
            })
    }
}
