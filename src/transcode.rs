use std::path::Path;
use std::process::{Command, Stdio};

use crate::config::{RecordingConfig, SaveFormat};
use crate::error::{LevelcapError, Result};

/// Turns a finalized PCM container into a compressed file.
pub trait Transcoder: Send + Sync {
    fn transcode(&self, source: &Path, dest: &Path) -> Result<()>;
    fn name(&self) -> &str;
    /// What `transcode` writes; decides the default file extension.
    fn format(&self) -> SaveFormat;
}

/// `ffmpeg -y -i <wav> -codec:a libmp3lame -qscale:a 2 <dest>`
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    program: String,
}

impl FfmpegTranscoder {
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Whether `<program> -version` runs and exits cleanly.
    #[must_use]
    pub fn is_available(&self) -> bool {
        Command::new(&self.program)
            .arg("-version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok_and(|s| s.success())
    }
}

impl Transcoder for FfmpegTranscoder {
    fn transcode(&self, source: &Path, dest: &Path) -> Result<()> {
        tracing::info!("transcoding {} -> {}", source.display(), dest.display());

        let output = Command::new(&self.program)
            .arg("-y")
            .arg("-i")
            .arg(source)
            .args(["-codec:a", "libmp3lame", "-qscale:a", "2"])
            .arg(dest)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| LevelcapError::Transcode(format!("failed to run {}: {e}", self.program)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let last = stderr.lines().last().unwrap_or_default();
            return Err(LevelcapError::Transcode(format!(
                "{} exited with {}: {last}",
                self.program, output.status
            )));
        }

        Ok(())
    }

    fn name(&self) -> &str {
        &self.program
    }

    fn format(&self) -> SaveFormat {
        SaveFormat::Mp3
    }
}

/// The transcoder for the configured save format, if one is needed and usable.
///
/// A missing program downgrades mp3 to wav with a warning.
#[must_use]
pub fn create_transcoder(config: &RecordingConfig) -> Option<Box<dyn Transcoder>> {
    match config.save_format {
        SaveFormat::Wav => None,
        SaveFormat::Mp3 => {
            let ffmpeg = FfmpegTranscoder::new(config.transcoder.clone());
            if ffmpeg.is_available() {
                tracing::debug!("using {} for mp3 output", ffmpeg.name());
                Some(Box::new(ffmpeg))
            } else {
                tracing::warn!(
                    "{} not found, recordings will be saved as wav",
                    config.transcoder
                );
                None
            }
        }
    }
}
