use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::audio::SampleFormat;
use crate::audio::params::{BufferPlan, ParamsRequest};
use crate::error::{LevelcapError, Result};
use crate::meter::MeterTuning;

const fn default_channels() -> u16 {
    2
}

const fn default_sample_rate() -> u32 {
    44100
}

const fn default_format() -> SampleFormat {
    SampleFormat::S16Le
}

const fn default_period_ms() -> u64 {
    20
}

const fn default_periods_per_buffer() -> u32 {
    4
}

const fn default_window_ms() -> u64 {
    250
}

const fn default_log_range_db() -> f64 {
    40.0
}

const fn default_poll_interval_ms() -> u64 {
    120
}

fn default_recording_directory() -> String {
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    home.join("Recordings").to_string_lossy().to_string()
}

fn default_temp_directory() -> String {
    let data_dir = dirs::data_dir().unwrap_or_else(|| PathBuf::from(".local/share"));
    data_dir.join("levelcap/tmp").to_string_lossy().to_string()
}

const fn default_max_duration_secs() -> u64 {
    3600
}

fn default_transcoder() -> String {
    "ffmpeg".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub audio: AudioConfig,

    #[serde(default)]
    pub meter: MeterConfig,

    #[serde(default)]
    pub recording: RecordingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AudioConfig {
    /// Endpoint id; the host's default input when unset.
    pub device: Option<String>,

    #[serde(default = "default_channels")]
    pub channels: u16,

    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    #[serde(default = "default_format")]
    pub format: SampleFormat,

    #[serde(default = "default_period_ms")]
    pub period_ms: u64,

    #[serde(default = "default_periods_per_buffer")]
    pub periods_per_buffer: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            device: None,
            channels: default_channels(),
            sample_rate: default_sample_rate(),
            format: default_format(),
            period_ms: default_period_ms(),
            periods_per_buffer: default_periods_per_buffer(),
        }
    }
}

impl AudioConfig {
    #[must_use]
    pub const fn request(&self) -> ParamsRequest {
        ParamsRequest {
            channels: self.channels,
            sample_rate: self.sample_rate,
            format: self.format,
        }
    }

    #[must_use]
    pub const fn plan(&self) -> BufferPlan {
        BufferPlan {
            period: Duration::from_millis(self.period_ms),
            periods_per_buffer: self.periods_per_buffer,
        }
    }
}

/// Which meter value the terminal bar shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MeterScale {
    #[default]
    Logarithmic,
    Linear,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MeterConfig {
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    #[serde(default = "default_log_range_db")]
    pub log_range_db: f64,

    #[serde(default)]
    pub scale: MeterScale,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            log_range_db: default_log_range_db(),
            scale: MeterScale::default(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl MeterConfig {
    #[must_use]
    pub const fn tuning(&self) -> MeterTuning {
        MeterTuning {
            window: Duration::from_millis(self.window_ms),
            log_range_db: self.log_range_db,
        }
    }

    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SaveFormat {
    #[default]
    Wav,
    Mp3,
}

impl SaveFormat {
    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Wav => "wav",
            Self::Mp3 => "mp3",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecordingConfig {
    #[serde(default = "default_recording_directory")]
    pub directory: String,

    #[serde(default = "default_temp_directory")]
    pub temp_directory: String,

    #[serde(default = "default_max_duration_secs")]
    pub max_duration_secs: u64,

    #[serde(default)]
    pub save_format: SaveFormat,

    #[serde(default = "default_transcoder")]
    pub transcoder: String,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            directory: default_recording_directory(),
            temp_directory: default_temp_directory(),
            max_duration_secs: default_max_duration_secs(),
            save_format: SaveFormat::default(),
            transcoder: default_transcoder(),
        }
    }
}

impl RecordingConfig {
    #[must_use]
    pub fn directory(&self) -> PathBuf {
        Config::expand_path(&self.directory)
    }

    #[must_use]
    pub fn temp_directory(&self) -> PathBuf {
        Config::expand_path(&self.temp_directory)
    }

    #[must_use]
    pub const fn max_duration(&self) -> Duration {
        Duration::from_secs(self.max_duration_secs)
    }
}

impl Config {
    /// Load the config file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("no config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path).map_err(|e| {
            LevelcapError::Config(format!(
                "failed to read config file {}: {e}",
                path.display()
            ))
        })?;

        let config: Self = serde_yaml_ng::from_str(&contents).map_err(|e| {
            LevelcapError::Config(format!(
                "failed to parse config file {}: {e}",
                path.display()
            ))
        })?;

        Ok(config)
    }

    #[must_use]
    pub fn default_path() -> PathBuf {
        let config_dir = dirs::config_dir().unwrap_or_else(|| PathBuf::from(".config"));
        config_dir.join("levelcap/config.yaml")
    }

    /// Expand `~` in a path string to the user's home directory.
    #[must_use]
    pub fn expand_path(path: &str) -> PathBuf {
        if let Some(rest) = path.strip_prefix("~/")
            && let Some(home) = dirs::home_dir()
        {
            return home.join(rest);
        }
        PathBuf::from(path)
    }

    /// Write `audio.device` into the config file, creating it if needed.
    /// Other keys are preserved.
    pub fn set_audio_device(path: &Path, device: &str) -> Result<()> {
        use serde_yaml_ng::{Mapping, Value};

        let mut root = if path.exists() {
            let contents = std::fs::read_to_string(path).map_err(|e| {
                LevelcapError::Config(format!(
                    "failed to read config file {}: {e}",
                    path.display()
                ))
            })?;
            match serde_yaml_ng::from_str::<Value>(&contents).map_err(|e| {
                LevelcapError::Config(format!(
                    "failed to parse config file {}: {e}",
                    path.display()
                ))
            })? {
                Value::Mapping(m) => m,
                Value::Null => Mapping::new(),
                _ => {
                    return Err(LevelcapError::Config(format!(
                        "{} is not a YAML mapping",
                        path.display()
                    )));
                }
            }
        } else {
            Mapping::new()
        };

        let audio = root
            .entry(Value::String("audio".to_string()))
            .or_insert_with(|| Value::Mapping(Mapping::new()))
            .as_mapping_mut()
            .ok_or_else(|| LevelcapError::Config("audio section is not a mapping".to_string()))?;
        audio.insert(
            Value::String("device".to_string()),
            Value::String(device.to_string()),
        );

        let yaml = serde_yaml_ng::to_string(&root)
            .map_err(|e| LevelcapError::Config(format!("failed to serialize config: {e}")))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, yaml)?;
        Ok(())
    }
}
