use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};

use crate::audio::params::CaptureParams;
use crate::error::{LevelcapError, Result};

pub const HEADER_LEN: usize = 44;

const FORMAT_PCM: u16 = 1;
const FMT_CHUNK_LEN: u32 = 16;

/// The canonical 44-byte RIFF/WAVE header for linear PCM.
///
/// ```text
/// 0  "RIFF"   4  size = data + 36   8  "WAVE"
/// 12 "fmt "   16 16                 20 format tag (1)   22 channels
/// 24 rate     28 byte rate          32 block align      34 bits per sample
/// 36 "data"   40 data length        44 payload...
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerHeader {
    channels: u16,
    sample_rate: u32,
    byte_rate: u32,
    block_align: u16,
    bits_per_sample: u16,
    data_len: u32,
}

impl ContainerHeader {
    pub fn new(params: &CaptureParams, data_len: u64) -> Result<Self> {
        let data_len = u32::try_from(data_len)
            .ok()
            .filter(|len| len.checked_add(36).is_some())
            .ok_or_else(|| {
                LevelcapError::Container(format!(
                    "payload of {data_len} bytes does not fit a 32-bit RIFF size"
                ))
            })?;

        Ok(Self {
            channels: params.channels(),
            sample_rate: params.sample_rate(),
            byte_rate: params.byte_rate(),
            block_align: params.frame_bytes() as u16,
            bits_per_sample: params.bits_per_sample(),
            data_len,
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
    pub const fn byte_rate(&self) -> u32 {
        self.byte_rate
    }

    #[must_use]
    pub const fn block_align(&self) -> u16 {
        self.block_align
    }

    #[must_use]
    pub const fn bits_per_sample(&self) -> u16 {
        self.bits_per_sample
    }

    #[must_use]
    pub const fn data_len(&self) -> u32 {
        self.data_len
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(b"RIFF");
        out[4..8].copy_from_slice(&(self.data_len + 36).to_le_bytes());
        out[8..12].copy_from_slice(b"WAVE");
        out[12..16].copy_from_slice(b"fmt ");
        out[16..20].copy_from_slice(&FMT_CHUNK_LEN.to_le_bytes());
        out[20..22].copy_from_slice(&FORMAT_PCM.to_le_bytes());
        out[22..24].copy_from_slice(&self.channels.to_le_bytes());
        out[24..28].copy_from_slice(&self.sample_rate.to_le_bytes());
        out[28..32].copy_from_slice(&self.byte_rate.to_le_bytes());
        out[32..34].copy_from_slice(&self.block_align.to_le_bytes());
        out[34..36].copy_from_slice(&self.bits_per_sample.to_le_bytes());
        out[36..40].copy_from_slice(b"data");
        out[40..44].copy_from_slice(&self.data_len.to_le_bytes());
        out
    }

    /// Parse a header produced by `to_bytes`. Only the canonical layout is accepted.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let header: &[u8; HEADER_LEN] = bytes
            .get(..HEADER_LEN)
            .and_then(|h| h.try_into().ok())
            .ok_or_else(|| {
                LevelcapError::Container(format!(
                    "header needs {HEADER_LEN} bytes, got {}",
                    bytes.len()
                ))
            })?;

        let u16_at = |i: usize| u16::from_le_bytes([header[i], header[i + 1]]);
        let u32_at = |i: usize| {
            u32::from_le_bytes([header[i], header[i + 1], header[i + 2], header[i + 3]])
        };

        if &header[0..4] != b"RIFF"
            || &header[8..12] != b"WAVE"
            || &header[12..16] != b"fmt "
            || &header[36..40] != b"data"
        {
            return Err(LevelcapError::Container("not a canonical WAVE header".to_string()));
        }
        if u32_at(16) != FMT_CHUNK_LEN || u16_at(20) != FORMAT_PCM {
            return Err(LevelcapError::Container("not a linear PCM WAVE header".to_string()));
        }

        let data_len = u32_at(40);
        if u32_at(4) != data_len.wrapping_add(36) {
            return Err(LevelcapError::Container(
                "RIFF size disagrees with data length".to_string(),
            ));
        }

        Ok(Self {
            channels: u16_at(22),
            sample_rate: u32_at(24),
            byte_rate: u32_at(28),
            block_align: u16_at(32),
            bits_per_sample: u16_at(34),
            data_len,
        })
    }
}

/// Raw PCM spooled to disk while a recording is in progress.
#[derive(Debug)]
pub struct TempContainer {
    path: PathBuf,
    name: String,
    writer: BufWriter<File>,
    bytes: u64,
}

impl TempContainer {
    /// Create `rec-%Y-%m-%d-%H-%M-%S` in `dir`. Never reuses an existing file.
    pub fn open(dir: &Path, started: DateTime<Local>) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|e| {
            LevelcapError::Container(format!("failed to create {}: {e}", dir.display()))
        })?;

        let stem = started.format("rec-%Y-%m-%d-%H-%M-%S").to_string();
        let mut name = stem.clone();
        let mut suffix = 0u32;

        loop {
            let path = dir.join(&name);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => {
                    tracing::debug!("recording to temporary file {}", path.display());
                    return Ok(Self {
                        path,
                        name,
                        writer: BufWriter::new(file),
                        bytes: 0,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists && suffix < 1000 => {
                    suffix += 1;
                    name = format!("{stem}-{suffix}");
                }
                Err(e) => {
                    return Err(LevelcapError::Container(format!(
                        "failed to create {}: {e}",
                        path.display()
                    )));
                }
            }
        }
    }

    /// Spool into a file that is already open.
    #[cfg(test)]
    pub(crate) fn from_file(path: PathBuf, file: File) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            path,
            name,
            writer: BufWriter::new(file),
            bytes: 0,
        }
    }

    pub fn append(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer.write_all(bytes).map_err(|e| {
            LevelcapError::Container(format!("failed to write to {}: {e}", self.path.display()))
        })?;
        self.bytes += bytes.len() as u64;
        Ok(())
    }

    /// Flush everything to disk and give back the path.
    pub fn close(mut self) -> Result<PathBuf> {
        self.writer.flush().map_err(|e| {
            LevelcapError::Container(format!("failed to flush {}: {e}", self.path.display()))
        })?;
        tracing::debug!("closed {} ({} bytes)", self.path.display(), self.bytes);
        Ok(self.path)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn bytes_written(&self) -> u64 {
        self.bytes
    }
}

/// Write `dest` as header + the raw payload in `temp`, then delete `temp`.
///
/// On failure `temp` is kept so the audio is not lost; `dest` may be partial.
pub fn finalize(temp: &Path, dest: &Path, params: &CaptureParams) -> Result<u64> {
    let data_len = fs::metadata(temp)
        .map_err(|e| LevelcapError::Container(format!("failed to stat {}: {e}", temp.display())))?
        .len();
    let header = ContainerHeader::new(params, data_len)
        .map_err(|e| LevelcapError::Container(format!("{e}; audio kept at {}", temp.display())))?;

    let source = File::open(temp)
        .map_err(|e| LevelcapError::Container(format!("failed to open {}: {e}", temp.display())))?;

    if let Some(parent) = dest.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|e| {
            LevelcapError::Container(format!(
                "failed to create {}: {e}; audio kept at {}",
                parent.display(),
                temp.display()
            ))
        })?;
    }

    let kept = |e: io::Error| {
        LevelcapError::Container(format!(
            "failed writing {}: {e}; audio kept at {}",
            dest.display(),
            temp.display()
        ))
    };

    let mut out = BufWriter::new(File::create(dest).map_err(kept)?);
    out.write_all(&header.to_bytes()).map_err(kept)?;

    let copied = io::copy(&mut source.take(data_len), &mut out).map_err(|e| {
        LevelcapError::Container(format!(
            "failed copying {} into {}: {e}",
            temp.display(),
            dest.display()
        ))
    })?;

    if copied != data_len {
        return Err(LevelcapError::Container(format!(
            "{} shrank while copying: expected {data_len} bytes, copied {copied}",
            temp.display()
        )));
    }

    out.flush().map_err(kept)?;
    out.get_ref().sync_all().map_err(kept)?;

    fs::remove_file(temp).map_err(|e| {
        LevelcapError::Container(format!("failed to remove {}: {e}", temp.display()))
    })?;

    tracing::info!("saved {} ({data_len} bytes of audio)", dest.display());
    Ok(data_len)
}
