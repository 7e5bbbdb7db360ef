use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;

use crate::audio::params::CaptureParams;
use crate::audio::window::SlidingWindow;
use crate::error::{LevelcapError, Result};

/// Tuning constants of the meter. Neither has a derivation; they are knobs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeterTuning {
    /// Wall-clock span of the running average.
    pub window: Duration,
    /// Decibel range mapped onto 0..100 by the logarithmic meter.
    pub log_range_db: f64,
}

impl Default for MeterTuning {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(250),
            log_range_db: 40.0,
        }
    }
}

/// Logarithmic meter value for a running average in 0..100.
///
/// Reads zero at or below 1.0 and reaches 100 at full scale when the range is 40 dB.
#[must_use]
pub fn log_level(average: f64, range_db: f64) -> f64 {
    if average > 1.0 {
        20.0 * average.log10() / range_db * 100.0
    } else {
        0.0
    }
}

/// Point-in-time copy of one channel's meter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ChannelReading {
    /// Sliding-window mean of per-buffer RMS, percent of full scale.
    pub average: f64,
    pub log_level: f64,
    /// Largest sample magnitude since the last reset, percent of full scale.
    pub peak: f64,
    pub clipped: bool,
}

#[derive(Debug, Clone)]
pub struct ChannelStats {
    window: SlidingWindow,
    log_level: f64,
    peak: f64,
    clipped: bool,
}

impl ChannelStats {
    fn new(window_len: usize) -> Self {
        Self {
            window: SlidingWindow::new(window_len),
            log_level: 0.0,
            peak: 0.0,
            clipped: false,
        }
    }

    /// Window mean in 0..=100. The running sum can drift a few ulps below
    /// zero once loud buffers are displaced by silence.
    #[must_use]
    pub fn average(&self) -> f64 {
        let sum = self.window.sum();
        if sum > 0.0 { sum.min(100.0) } else { 0.0 }
    }

    fn reset(&mut self) {
        self.peak = 0.0;
        self.clipped = false;
    }

    fn reading(&self) -> ChannelReading {
        ChannelReading {
            average: self.average(),
            log_level: self.log_level,
            peak: self.peak,
            clipped: self.clipped,
        }
    }
}

/// Per-channel loudness statistics for one capture session.
///
/// Each channel sits behind its own lock: the capture thread holds it while
/// folding one buffer into that channel, and `reset_channel` takes the same
/// lock, so a reset is never overwritten by a half-applied update and never
/// blocks the other channels.
#[derive(Debug)]
pub struct Statistics {
    channels: Vec<Mutex<ChannelStats>>,
    window_len: usize,
    tuning: MeterTuning,
}

impl Statistics {
    #[must_use]
    pub fn new(params: &CaptureParams, tuning: MeterTuning) -> Self {
        let window_len = SlidingWindow::length_for(
            tuning.window,
            params.sample_rate(),
            params.buffer_frames(),
        );
        let channels = (0..params.channels())
            .map(|_| Mutex::new(ChannelStats::new(window_len)))
            .collect();

        tracing::debug!(
            "statistics: {} channel(s), window of {window_len} buffer(s)",
            params.channels()
        );

        Self {
            channels,
            window_len,
            tuning,
        }
    }

    #[must_use]
    pub const fn window_len(&self) -> usize {
        self.window_len
    }

    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    fn lock(&self, channel: usize) -> Option<MutexGuard<'_, ChannelStats>> {
        self.channels
            .get(channel)
            .map(|m| m.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Fold one interleaved buffer into every channel. Trailing bytes that do
    /// not form a whole frame are ignored; an empty buffer changes nothing.
    pub fn process(&self, buffer: &[u8], params: &CaptureParams) {
        let frame_bytes = params.frame_bytes();
        let sample_bytes = params.sample_bytes();
        let format = params.format();
        let full_scale = format.full_scale() as f64;
        let frames = buffer.len() / frame_bytes;
        if frames == 0 {
            return;
        }
        let whole = &buffer[..frames * frame_bytes];

        for channel in 0..self.channels.len() {
            let Some(mut stats) = self.lock(channel) else {
                continue;
            };
            let offset = channel * sample_bytes;

            let mut sum_squares = 0.0f64;
            let mut buffer_peak = 0.0f64;
            let mut clipped = false;

            for frame in whole.chunks_exact(frame_bytes) {
                let value = format.decode_sample(&frame[offset..offset + sample_bytes]);
                let mut percent = value.unsigned_abs() as f64 * 100.0 / full_scale;
                if percent >= 100.0 {
                    percent = 100.0;
                    clipped = true;
                }
                sum_squares += percent * percent;
                buffer_peak = buffer_peak.max(percent);
            }

            let rms = (sum_squares / frames as f64).sqrt();
            stats.window.push(rms / self.window_len as f64);
            stats.log_level = log_level(stats.average(), self.tuning.log_range_db);
            stats.peak = stats.peak.max(buffer_peak);
            stats.clipped |= clipped;
        }
    }

    /// Clear peak and clip of one channel.
    pub fn reset_channel(&self, channel: usize) -> Result<()> {
        let mut stats = self.lock(channel).ok_or_else(|| {
            LevelcapError::Other(format!(
                "no channel {channel} (session has {})",
                self.channels.len()
            ))
        })?;
        stats.reset();
        Ok(())
    }

    #[must_use]
    pub fn reading(&self, channel: usize) -> Option<ChannelReading> {
        self.lock(channel).map(|s| s.reading())
    }

    #[must_use]
    pub fn readings(&self) -> Vec<ChannelReading> {
        (0..self.channels.len())
            .filter_map(|c| self.reading(c))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::audio::format::SampleFormat;

    fn params(channels: u16, format: SampleFormat) -> CaptureParams {
        // 48 kHz, 480-frame periods, 1 period per buffer: 10 ms buffers, 25-slot window.
        CaptureParams::new(channels, 48000, format, 480, 1).unwrap_or_else(|e| panic!("{e}"))
    }

    fn buffer(params: &CaptureParams, sample: impl Fn(usize, usize) -> i64) -> Vec<u8> {
        let mut out = Vec::with_capacity(params.buffer_bytes());
        for frame in 0..params.buffer_frames() {
            for channel in 0..usize::from(params.channels()) {
                out.extend(params.format().encode_sample(sample(frame, channel)));
            }
        }
        out
    }

    #[test]
    fn window_length_from_params() {
        let p = params(2, SampleFormat::S16Le);
        let stats = Statistics::new(&p, MeterTuning::default());
        assert_eq!(stats.window_len(), 25);
        assert_eq!(stats.channel_count(), 2);
    }

    #[test]
    fn silence_reads_zero() {
        let p = params(2, SampleFormat::S16Le);
        let stats = Statistics::new(&p, MeterTuning::default());
        let silence = buffer(&p, |_, _| 0);
        for _ in 0..10 {
            stats.process(&silence, &p);
        }
        for r in stats.readings() {
            assert_eq!(r.average, 0.0);
            assert_eq!(r.log_level, 0.0);
            assert_eq!(r.peak, 0.0);
            assert!(!r.clipped);
        }
    }

    #[test]
    fn steady_full_scale_converges_to_hundred() {
        let p = params(1, SampleFormat::S16Le);
        let stats = Statistics::new(&p, MeterTuning::default());
        let max = p.format().full_scale();
        let square = buffer(&p, |f, _| if f % 2 == 0 { max } else { -max });

        for _ in 0..stats.window_len() {
            stats.process(&square, &p);
        }
        let r = stats.reading(0).unwrap_or_else(|| panic!("no channel 0"));
        assert!((r.average - 100.0).abs() < 1e-9, "average {}", r.average);
        assert!((r.log_level - 100.0).abs() < 1e-9, "log {}", r.log_level);

        // One more buffer displaces an equal contribution.
        stats.process(&square, &p);
        let r = stats.reading(0).unwrap_or_else(|| panic!("no channel 0"));
        assert!((r.average - 100.0).abs() < 1e-9);
    }

    #[test]
    fn partial_window_scales_by_queue_length() {
        let p = params(1, SampleFormat::S16Le);
        let stats = Statistics::new(&p, MeterTuning::default());
        let max = p.format().full_scale();
        stats.process(&buffer(&p, |_, _| max), &p);

        let r = stats.reading(0).unwrap_or_else(|| panic!("no channel 0"));
        assert!((r.average - 100.0 / 25.0).abs() < 1e-9);
        assert!((r.log_level - log_level(4.0, 40.0)).abs() < 1e-9);
    }

    #[test]
    fn log_level_is_zero_at_or_below_one() {
        assert_eq!(log_level(0.0, 40.0), 0.0);
        assert_eq!(log_level(1.0, 40.0), 0.0);
        assert!((log_level(10.0, 40.0) - 50.0).abs() < 1e-9);
        assert!((log_level(100.0, 40.0) - 100.0).abs() < 1e-9);
        assert!((log_level(100.0, 80.0) - 50.0).abs() < 1e-9);
    }

    #[test]
    fn clip_sticks_until_reset() {
        for format in SampleFormat::CANDIDATES {
            let p = params(1, format);
            let stats = Statistics::new(&p, MeterTuning::default());
            let max = format.full_scale();
            stats.process(&buffer(&p, |_, _| max), &p);
            stats.process(&buffer(&p, |_, _| 0), &p);

            let r = stats.reading(0).unwrap_or_else(|| panic!("no channel 0"));
            assert!(r.clipped, "{format}");
            assert!((r.peak - 100.0).abs() < 1e-9, "{format}");

            stats.reset_channel(0).unwrap_or_else(|e| panic!("{e}"));
            let r = stats.reading(0).unwrap_or_else(|| panic!("no channel 0"));
            assert!(!r.clipped);
            assert_eq!(r.peak, 0.0);
        }
    }

    #[test]
    fn below_full_scale_does_not_clip() {
        let p = params(1, SampleFormat::S16Le);
        let stats = Statistics::new(&p, MeterTuning::default());
        stats.process(&buffer(&p, |_, _| 32766), &p);
        let r = stats.reading(0).unwrap_or_else(|| panic!("no channel 0"));
        assert!(!r.clipped);
        assert!(r.peak > 99.9 && r.peak < 100.0);
    }

    #[test]
    fn reset_is_idempotent_and_channel_local() {
        let p = params(2, SampleFormat::S16Le);
        let stats = Statistics::new(&p, MeterTuning::default());
        let max = p.format().full_scale();
        stats.process(&buffer(&p, |_, _| max), &p);

        for _ in 0..3 {
            stats.reset_channel(1).unwrap_or_else(|e| panic!("{e}"));
            let r = stats.reading(1).unwrap_or_else(|| panic!("no channel 1"));
            assert!(!r.clipped);
            assert_eq!(r.peak, 0.0);
        }

        let other = stats.reading(0).unwrap_or_else(|| panic!("no channel 0"));
        assert!(other.clipped);
        assert!((other.peak - 100.0).abs() < 1e-9);
        // Reset leaves the running average alone.
        let after = stats.reading(1).unwrap_or_else(|| panic!("no channel 1"));
        assert!(after.average > 0.0);
    }

    #[test]
    fn reset_out_of_range_is_an_error() {
        let p = params(2, SampleFormat::S16Le);
        let stats = Statistics::new(&p, MeterTuning::default());
        assert!(stats.reset_channel(2).is_err());
    }

    #[test]
    fn trailing_partial_frame_is_ignored() {
        let p = params(2, SampleFormat::S16Le);
        let stats = Statistics::new(&p, MeterTuning::default());
        stats.process(&[0xFF, 0x7F, 0xFF], &p);
        let r = stats.reading(0).unwrap_or_else(|| panic!("no channel 0"));
        assert!(!r.clipped);
        assert_eq!(r.average, 0.0);
    }

    #[test]
    fn concurrent_updates_and_resets_never_tear() {
        let p = params(2, SampleFormat::S16Le);
        let stats = Arc::new(Statistics::new(&p, MeterTuning::default()));
        let max = p.format().full_scale();
        let loud = buffer(&p, |_, _| max);
        let done = Arc::new(AtomicBool::new(false));

        let writer = {
            let stats = Arc::clone(&stats);
            std::thread::spawn(move || {
                for _ in 0..2000 {
                    stats.process(&loud, &p);
                }
            })
        };

        let resetter = {
            let stats = Arc::clone(&stats);
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                while !done.load(Ordering::Acquire) {
                    stats.reset_channel(0).unwrap_or_else(|e| panic!("{e}"));
                    // Peak and clip of a full-scale signal move together.
                    let r = stats.reading(0).unwrap_or_else(|| panic!("no channel 0"));
                    assert_eq!(r.clipped, r.peak >= 100.0, "torn read: {r:?}");
                }
            })
        };

        writer.join().unwrap_or_else(|_| panic!("writer panicked"));
        done.store(true, Ordering::Release);
        resetter.join().unwrap_or_else(|_| panic!("resetter panicked"));

        // Channel 1 was never reset and saw every buffer.
        let untouched = stats.reading(1).unwrap_or_else(|| panic!("no channel 1"));
        assert!(untouched.clipped);
        assert!((untouched.average - 100.0).abs() < 1e-6);

        stats.reset_channel(0).unwrap_or_else(|e| panic!("{e}"));
        let r = stats.reading(0).unwrap_or_else(|| panic!("no channel 0"));
        assert!(!r.clipped);
        assert_eq!(r.peak, 0.0);
    }

    #[test]
    fn drifted_sum_never_reads_negative() {
        let mut stats = ChannelStats::new(3);
        for value in [0.1, 0.2, 33.3, 0.0, 0.0, 0.0] {
            stats.window.push(value);
        }
        assert!(stats.window.sum() < 0.0);

        let r = stats.reading();
        assert_eq!(r.average, 0.0);
        assert!(r.average.is_sign_positive());
    }
}
