use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum RecordingState {
    Stopped = 0,
    /// Device open, statistics flowing, nothing persisted.
    Monitoring = 1,
    Recording = 2,
    /// Device open, statistics flowing, persistence and the clock suspended.
    Paused = 3,
    /// Teardown requested; the capture thread has not exited yet.
    Stopping = 4,
}

impl RecordingState {
    #[must_use]
    pub const fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Stopped),
            1 => Some(Self::Monitoring),
            2 => Some(Self::Recording),
            3 => Some(Self::Paused),
            4 => Some(Self::Stopping),
            _ => None,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Monitoring => "monitoring",
            Self::Recording => "recording",
            Self::Paused => "paused",
            Self::Stopping => "stopping",
        }
    }

    /// The capture thread is (or should be) reading the device.
    #[must_use]
    pub const fn is_streaming(self) -> bool {
        matches!(self, Self::Monitoring | Self::Recording | Self::Paused)
    }

    /// A temporary container is open.
    #[must_use]
    pub const fn has_recording(self) -> bool {
        matches!(self, Self::Recording | Self::Paused)
    }
}

impl fmt::Display for RecordingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// `RecordingState` readable from any thread.
#[derive(Debug)]
pub struct SharedState(AtomicU8);

impl SharedState {
    #[must_use]
    pub const fn new(state: RecordingState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    #[must_use]
    pub fn load(&self) -> RecordingState {
        RecordingState::from_u8(self.0.load(Ordering::Acquire)).unwrap_or(RecordingState::Stopped)
    }

    pub fn store(&self, state: RecordingState) {
        let previous = self.0.swap(state as u8, Ordering::AcqRel);
        if previous != state as u8 {
            tracing::info!(
                "state: {} -> {state}",
                RecordingState::from_u8(previous).unwrap_or(RecordingState::Stopped)
            );
        }
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new(RecordingState::Stopped)
    }
}

/// Recording time that accrues only while actually recording.
#[derive(Debug, Clone, Copy, Default)]
pub struct ElapsedClock {
    accrued: Duration,
    running_since: Option<Instant>,
}

impl ElapsedClock {
    /// Zero the clock and start it.
    pub fn start(&mut self, now: Instant) {
        self.accrued = Duration::ZERO;
        self.running_since = Some(now);
    }

    /// Freeze the clock, keeping what has accrued.
    pub fn pause(&mut self, now: Instant) {
        if let Some(since) = self.running_since.take() {
            self.accrued += now.saturating_duration_since(since);
        }
    }

    pub fn resume(&mut self, now: Instant) {
        if self.running_since.is_none() {
            self.running_since = Some(now);
        }
    }

    /// Stop and zero the clock, returning the total recorded time.
    pub fn reset(&mut self, now: Instant) -> Duration {
        let total = self.elapsed(now);
        *self = Self::default();
        total
    }

    #[must_use]
    pub fn elapsed(&self, now: Instant) -> Duration {
        self.accrued
            + self
                .running_since
                .map_or(Duration::ZERO, |since| now.saturating_duration_since(since))
    }
}

/// `seconds.centiseconds`, e.g. `12.34`.
#[must_use]
pub fn format_elapsed(elapsed: Duration) -> String {
    format!("{}.{:02}", elapsed.as_secs(), elapsed.subsec_millis() / 10)
}
