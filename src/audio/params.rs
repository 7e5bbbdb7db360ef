use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LevelcapError, Result};

use super::catalog::Device;
use super::format::SampleFormat;

/// Channel count, rate and format asked for by the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamsRequest {
    pub channels: u16,
    pub sample_rate: u32,
    pub format: SampleFormat,
}

impl Default for ParamsRequest {
    /// CD quality.
    fn default() -> Self {
        Self {
            channels: 2,
            sample_rate: 44100,
            format: SampleFormat::S16Le,
        }
    }
}

impl ParamsRequest {
    /// Fit `self` to a device: each field the device cannot do is replaced by
    /// the device's first confirmed value.
    #[must_use]
    pub fn fit_to(self, device: &Device) -> Self {
        if device.supports(self.channels, self.sample_rate, self.format) {
            return self;
        }

        let channels = if device.channels.contains(&self.channels) {
            self.channels
        } else {
            device.channels.first().copied().unwrap_or(self.channels)
        };
        let sample_rate = if device.sample_rates.contains(&self.sample_rate) {
            self.sample_rate
        } else {
            device.sample_rates.first().copied().unwrap_or(self.sample_rate)
        };
        let format = if device.formats.contains(&self.format) {
            self.format
        } else {
            device.formats.first().copied().unwrap_or(self.format)
        };

        Self {
            channels,
            sample_rate,
            format,
        }
    }
}

/// How much buffering to ask the driver for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferPlan {
    pub period: Duration,
    pub periods_per_buffer: u32,
}

impl Default for BufferPlan {
    fn default() -> Self {
        Self {
            period: Duration::from_millis(20),
            periods_per_buffer: 4,
        }
    }
}

/// Period sizes (in frames) the driver will accept, inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLimits {
    pub min: u32,
    pub max: u32,
}

/// Frozen parameters of an open capture session.
///
/// All derived widths and rates are computed in `new` and cannot be changed
/// afterwards; a different configuration means a new session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureParams {
    channels: u16,
    sample_rate: u32,
    format: SampleFormat,
    sample_bytes: usize,
    frame_bytes: usize,
    byte_rate: u32,
    period_frames: usize,
    buffer_frames: usize,
}

impl CaptureParams {
    pub fn new(
        channels: u16,
        sample_rate: u32,
        format: SampleFormat,
        period_frames: usize,
        periods_per_buffer: u32,
    ) -> Result<Self> {
        if channels == 0 || sample_rate == 0 || period_frames == 0 || periods_per_buffer == 0 {
            return Err(LevelcapError::ConfigurationIncomplete(format!(
                "channels={channels} rate={sample_rate} period={period_frames} \
                 periods={periods_per_buffer}"
            )));
        }

        let sample_bytes = format.sample_bytes();
        let frame_bytes = sample_bytes * usize::from(channels);
        let byte_rate = sample_rate * frame_bytes as u32;

        Ok(Self {
            channels,
            sample_rate,
            format,
            sample_bytes,
            frame_bytes,
            byte_rate,
            period_frames,
            buffer_frames: period_frames * periods_per_buffer as usize,
        })
    }

    #[must_use]
    pub const fn channels(&self) -> u16 {
        self.channels
    }

    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    #[must_use]
    pub const fn format(&self) -> SampleFormat {
        self.format
    }

    #[must_use]
    pub const fn sample_bytes(&self) -> usize {
        self.sample_bytes
    }

    #[must_use]
    pub const fn frame_bytes(&self) -> usize {
        self.frame_bytes
    }

    #[must_use]
    pub const fn byte_rate(&self) -> u32 {
        self.byte_rate
    }

    #[must_use]
    pub const fn bits_per_sample(&self) -> u16 {
        self.format.physical_bits()
    }

    #[must_use]
    pub const fn period_frames(&self) -> usize {
        self.period_frames
    }

    /// Frames delivered by one read of the capture loop.
    #[must_use]
    pub const fn buffer_frames(&self) -> usize {
        self.buffer_frames
    }

    #[must_use]
    pub const fn buffer_bytes(&self) -> usize {
        self.buffer_frames * self.frame_bytes
    }

    /// Wall-clock time covered by one buffer.
    #[must_use]
    pub fn buffer_duration(&self) -> Duration {
        Duration::from_secs_f64(self.buffer_frames as f64 / f64::from(self.sample_rate))
    }

    #[must_use]
    pub fn description(&self) -> String {
        format!(
            "channels {} framerate {} format {} ({})",
            self.channels,
            self.sample_rate,
            self.format,
            self.format.description()
        )
    }
}

/// Resolve a request against a device's confirmed capabilities and the
/// driver's buffer limits.
pub fn negotiate(
    device: &Device,
    request: &ParamsRequest,
    plan: &BufferPlan,
    limits: Option<BufferLimits>,
) -> Result<CaptureParams> {
    if !device.channels.contains(&request.channels) {
        return Err(LevelcapError::ParameterRejected(format!(
            "{} does not capture {} channel(s) (available: {:?})",
            device.id, request.channels, device.channels
        )));
    }
    if !device.sample_rates.contains(&request.sample_rate) {
        return Err(LevelcapError::ParameterRejected(format!(
            "{} does not capture at {} Hz (available: {:?})",
            device.id, request.sample_rate, device.sample_rates
        )));
    }
    if !device.formats.contains(&request.format) {
        return Err(LevelcapError::ParameterRejected(format!(
            "{} does not capture {} (available: {:?})",
            device.id, request.format, device.formats
        )));
    }

    let wanted = (f64::from(request.sample_rate) * plan.period.as_secs_f64()).round() as u32;
    let period_frames = match limits {
        Some(BufferLimits { min, max }) if min > max => {
            return Err(LevelcapError::ParameterRejected(format!(
                "driver buffer range is empty ({min}..{max})"
            )));
        }
        Some(BufferLimits { min, max }) => wanted.clamp(min.max(1), max),
        None => wanted.max(1),
    };

    CaptureParams::new(
        request.channels,
        request.sample_rate,
        request.format,
        period_frames as usize,
        plan.periods_per_buffer,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> Device {
        Device {
            id: "hw:1,0".to_string(),
            card_name: "USB".to_string(),
            long_name: "USB Audio".to_string(),
            channels: vec![1, 2],
            sample_rates: vec![44100, 48000],
            formats: vec![SampleFormat::S16Le, SampleFormat::S24Le],
        }
    }

    fn request(channels: u16, sample_rate: u32, format: SampleFormat) -> ParamsRequest {
        ParamsRequest {
            channels,
            sample_rate,
            format,
        }
    }

    #[test]
    fn derived_fields_follow_format() {
        let p = negotiate(
            &device(),
            &request(2, 44100, SampleFormat::S24Le),
            &BufferPlan::default(),
            None,
        )
        .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(p.sample_bytes(), 4);
        assert_eq!(p.frame_bytes(), 8);
        assert_eq!(p.byte_rate(), 44100 * 8);
        assert_eq!(p.bits_per_sample(), 32);
        assert_eq!(p.period_frames(), 882);
        assert_eq!(p.buffer_frames(), 882 * 4);
        assert_eq!(p.buffer_bytes(), 882 * 4 * 8);
    }

    #[test]
    fn period_is_clamped_to_driver_limits() {
        let limits = Some(BufferLimits { min: 1024, max: 4096 });
        let p = negotiate(
            &device(),
            &request(1, 48000, SampleFormat::S16Le),
            &BufferPlan::default(),
            limits,
        )
        .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(p.period_frames(), 1024);
    }

    #[test]
    fn values_outside_capabilities_are_rejected() {
        let plan = BufferPlan::default();
        for req in [
            request(6, 44100, SampleFormat::S16Le),
            request(2, 96000, SampleFormat::S16Le),
            request(2, 44100, SampleFormat::S8),
        ] {
            let result = negotiate(&device(), &req, &plan, None);
            assert!(matches!(result, Err(LevelcapError::ParameterRejected(_))), "{req:?}");
        }
    }

    #[test]
    fn empty_driver_range_is_rejected() {
        let result = negotiate(
            &device(),
            &request(2, 44100, SampleFormat::S16Le),
            &BufferPlan::default(),
            Some(BufferLimits { min: 10, max: 5 }),
        );
        assert!(matches!(result, Err(LevelcapError::ParameterRejected(_))));
    }

    #[test]
    fn fit_to_falls_back_to_first_confirmed_value() {
        let fitted = request(8, 192_000, SampleFormat::S8).fit_to(&device());
        assert_eq!(fitted, request(1, 44100, SampleFormat::S16Le));

        let kept = ParamsRequest::default().fit_to(&device());
        assert_eq!(kept, ParamsRequest::default());
    }

    #[test]
    fn buffer_duration_is_eighty_ms_by_default() {
        let p = CaptureParams::new(2, 48000, SampleFormat::S16Le, 960, 4)
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(p.buffer_duration(), Duration::from_millis(80));
    }

    #[test]
    fn zero_values_are_incomplete() {
        let result = CaptureParams::new(0, 48000, SampleFormat::S16Le, 960, 4);
        assert!(matches!(result, Err(LevelcapError::ConfigurationIncomplete(_))));
    }
}
