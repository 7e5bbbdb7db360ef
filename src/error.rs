use std::io;

#[derive(Debug, thiserror::Error)]
pub enum LevelcapError {
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("parameters rejected: {0}")]
    ParameterRejected(String),

    #[error("configuration incomplete: {0}")]
    ConfigurationIncomplete(String),

    #[error("unsupported sample format: {0}")]
    UnsupportedFormat(String),

    #[error("stream fault: {0}")]
    StreamFault(String),

    #[error("buffer too short: need {needed} bytes, have {len}")]
    ShortBuffer { needed: usize, len: usize },

    #[error("cannot {command} while {from}")]
    InvalidTransition { from: String, command: String },

    #[error("device catalog error: {0}")]
    Catalog(String),

    #[error("container error: {0}")]
    Container(String),

    #[error("transcode error: {0}")]
    Transcode(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("{0}")]
    Other(String),
}

impl LevelcapError {
    /// Open-time errors the consumer can answer by retrying with other parameters.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::DeviceUnavailable(_)
                | Self::ParameterRejected(_)
                | Self::ConfigurationIncomplete(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, LevelcapError>;
