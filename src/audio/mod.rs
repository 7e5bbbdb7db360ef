pub mod capture;
pub mod catalog;
pub mod format;
pub mod params;
pub mod window;

use std::fmt;

use crate::error::Result;

use self::catalog::Device;
use self::params::{BufferPlan, CaptureParams, ParamsRequest};

pub use self::format::SampleFormat;

/// Something that can enumerate capture endpoints and open one of them.
pub trait CaptureHost: Send + Sync {
    /// Probe every capture endpoint. Endpoints that fail to probe are skipped;
    /// only a host-wide failure is an error.
    fn enumerate(&self) -> Result<Vec<Device>>;

    fn default_device_id(&self) -> Option<String>;

    /// Negotiate `request` against `device` and return a stream that is
    /// prepared but not yet started, together with the frozen parameters.
    fn open(
        &self,
        device: &Device,
        request: &ParamsRequest,
        plan: &BufferPlan,
    ) -> Result<(Box<dyn PcmSource>, CaptureParams)>;
}

/// A live capture stream. Dropping it closes the device.
///
/// Sources are opened and used on the capture thread only, so they need not be `Send`.
pub trait PcmSource {
    fn start(&mut self) -> Result<()>;

    /// Block until `buf` (exactly one buffer) is full and return the number of
    /// frames read.
    fn read(&mut self, buf: &mut [u8]) -> std::result::Result<usize, StreamFault>;

    /// The driver's standard recovery after a fault. An error here is fatal.
    fn recover(&mut self, fault: &StreamFault) -> Result<()>;
}

/// A read that did not deliver a clean, full buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFault {
    /// Data was lost between the device and the reader; `frames` were still read.
    Overrun { frames: usize },
    /// The device delivered fewer than a buffer's worth of frames in time.
    ShortRead { frames: usize },
    /// The stream is gone.
    Disconnected(String),
}

impl StreamFault {
    /// Frames that made it into the buffer despite the fault.
    #[must_use]
    pub const fn frames(&self) -> usize {
        match self {
            Self::Overrun { frames } | Self::ShortRead { frames } => *frames,
            Self::Disconnected(_) => 0,
        }
    }
}

impl fmt::Display for StreamFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Overrun { frames } => write!(f, "overrun ({frames} frames read)"),
            Self::ShortRead { frames } => write!(f, "short read ({frames} frames read)"),
            Self::Disconnected(reason) => write!(f, "stream disconnected: {reason}"),
        }
    }
}
