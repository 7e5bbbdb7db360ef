use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{LevelcapError, Result};

/// Interleaved linear PCM layouts the capture pipeline understands.
///
/// Every other layout is rejected at negotiation time, so once a session is
/// open decoding cannot fail on format grounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SampleFormat {
    #[serde(rename = "S8")]
    S8,
    #[serde(rename = "S16_LE")]
    S16Le,
    #[serde(rename = "U16_LE")]
    U16Le,
    /// 24 significant bits carried in a 4-byte little-endian container.
    #[serde(rename = "S24_LE")]
    S24Le,
    #[serde(rename = "S32_LE")]
    S32Le,
}

impl SampleFormat {
    /// Probe order used when enumerating devices.
    pub const CANDIDATES: [Self; 5] = [
        Self::S8,
        Self::S16Le,
        Self::U16Le,
        Self::S24Le,
        Self::S32Le,
    ];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::S8 => "S8",
            Self::S16Le => "S16_LE",
            Self::U16Le => "U16_LE",
            Self::S24Le => "S24_LE",
            Self::S32Le => "S32_LE",
        }
    }

    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::S8 => "Signed 8 bit",
            Self::S16Le => "Signed 16 bit Little Endian",
            Self::U16Le => "Unsigned 16 bit Little Endian",
            Self::S24Le => "Signed 24 bit Little Endian",
            Self::S32Le => "Signed 32 bit Little Endian",
        }
    }

    /// Significant bits per sample.
    #[must_use]
    pub const fn bits(self) -> u16 {
        match self {
            Self::S8 => 8,
            Self::S16Le | Self::U16Le => 16,
            Self::S24Le => 24,
            Self::S32Le => 32,
        }
    }

    /// Bits each sample occupies in the byte stream.
    #[must_use]
    pub const fn physical_bits(self) -> u16 {
        match self {
            Self::S8 => 8,
            Self::S16Le | Self::U16Le => 16,
            Self::S24Le | Self::S32Le => 32,
        }
    }

    #[must_use]
    pub const fn sample_bytes(self) -> usize {
        (self.physical_bits() / 8) as usize
    }

    /// Largest positive magnitude a sample can carry: `2^(bits-1) - 1`.
    #[must_use]
    pub const fn full_scale(self) -> i64 {
        (1i64 << (self.bits() - 1)) - 1
    }

    /// Decode the sample of `channel` in `frame` from an interleaved buffer.
    ///
    /// The result is sign-extended (unsigned layouts are re-centred around
    /// zero) so callers never care about the source width.
    pub fn decode(self, buffer: &[u8], channels: u16, frame: usize, channel: usize) -> Result<i64> {
        let width = self.sample_bytes();
        let offset = (frame * usize::from(channels) + channel) * width;
        let needed = offset + width;

        match buffer.get(offset..needed) {
            Some(sample) if channel < usize::from(channels) => Ok(self.decode_sample(sample)),
            Some(_) => Err(LevelcapError::Other(format!(
                "channel {channel} out of range for {channels} channels"
            ))),
            None => Err(LevelcapError::ShortBuffer {
                needed,
                len: buffer.len(),
            }),
        }
    }

    /// Decode one sample. `sample` must be exactly `sample_bytes()` long.
    #[must_use]
    pub(crate) fn decode_sample(self, sample: &[u8]) -> i64 {
        match self {
            Self::S8 => i64::from(sample[0] as i8),
            Self::S16Le => i64::from(i16::from_le_bytes([sample[0], sample[1]])),
            Self::U16Le => i64::from(u16::from_le_bytes([sample[0], sample[1]])) - 32768,
            Self::S24Le => {
                let raw = i32::from_le_bytes([sample[0], sample[1], sample[2], sample[3]]);
                i64::from((raw << 8) >> 8)
            }
            Self::S32Le => i64::from(i32::from_le_bytes([
                sample[0], sample[1], sample[2], sample[3],
            ])),
        }
    }

    /// Encode a value into this layout. Used to synthesise test signals.
    #[must_use]
    pub fn encode_sample(self, value: i64) -> Vec<u8> {
        match self {
            Self::S8 => vec![(value as i8) as u8],
            Self::S16Le => (value as i16).to_le_bytes().to_vec(),
            Self::U16Le => ((value + 32768) as u16).to_le_bytes().to_vec(),
            Self::S24Le | Self::S32Le => (value as i32).to_le_bytes().to_vec(),
        }
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SampleFormat {
    type Err = LevelcapError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_uppercase();
        Self::CANDIDATES
            .into_iter()
            .find(|f| f.name() == wanted)
            .ok_or_else(|| {
                LevelcapError::UnsupportedFormat(format!(
                    "{s} (available: S8, S16_LE, U16_LE, S24_LE, S32_LE)"
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_of(format: SampleFormat, values: &[i64]) -> Vec<u8> {
        values.iter().flat_map(|&v| format.encode_sample(v)).collect()
    }

    #[test]
    fn full_scale_constants() {
        assert_eq!(SampleFormat::S8.full_scale(), 127);
        assert_eq!(SampleFormat::S16Le.full_scale(), 32767);
        assert_eq!(SampleFormat::U16Le.full_scale(), 32767);
        assert_eq!(SampleFormat::S24Le.full_scale(), 8_388_607);
        assert_eq!(SampleFormat::S32Le.full_scale(), 2_147_483_647);
    }

    #[test]
    fn decode_full_scale_both_polarities() {
        for format in SampleFormat::CANDIDATES {
            let max = format.full_scale();
            let buf = frame_of(format, &[max, -max]);
            let pos = format.decode(&buf, 2, 0, 0).unwrap_or_else(|e| panic!("{e}"));
            let neg = format.decode(&buf, 2, 0, 1).unwrap_or_else(|e| panic!("{e}"));
            assert_eq!(pos, max, "{format} positive");
            assert_eq!(neg.abs(), max, "{format} negative");
            assert!(neg < 0, "{format} sign");
        }
    }

    #[test]
    fn unsigned_raw_bytes_recentre() {
        // 0x0000 is the most negative value, 0x8000 is silence.
        let buf = [0x00, 0x00, 0x00, 0x80, 0xFF, 0xFF];
        let f = SampleFormat::U16Le;
        assert_eq!(f.decode(&buf, 1, 0, 0).unwrap_or_else(|e| panic!("{e}")), -32768);
        assert_eq!(f.decode(&buf, 1, 1, 0).unwrap_or_else(|e| panic!("{e}")), 0);
        assert_eq!(f.decode(&buf, 1, 2, 0).unwrap_or_else(|e| panic!("{e}")), 32767);
    }

    #[test]
    fn s24_sign_extends_from_bit_23() {
        // 0x00800000 in the container: top byte is padding, value is -2^23.
        let buf = [0x00, 0x00, 0x80, 0x00];
        let v = SampleFormat::S24Le
            .decode(&buf, 1, 0, 0)
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(v, -8_388_608);
    }

    #[test]
    fn decode_indexes_interleaved_frames() {
        let f = SampleFormat::S16Le;
        let buf = frame_of(f, &[1, 2, 3, 4, 5, 6]);
        assert_eq!(f.decode(&buf, 3, 1, 0).unwrap_or_else(|e| panic!("{e}")), 4);
        assert_eq!(f.decode(&buf, 3, 1, 2).unwrap_or_else(|e| panic!("{e}")), 6);
    }

    #[test]
    fn decode_rejects_short_buffer() {
        let err = SampleFormat::S32Le.decode(&[0, 0, 0], 1, 0, 0);
        assert!(matches!(err, Err(LevelcapError::ShortBuffer { needed: 4, len: 3 })));
    }

    #[test]
    fn parse_names() {
        assert_eq!("s16_le".parse::<SampleFormat>().ok(), Some(SampleFormat::S16Le));
        assert_eq!("S24_LE".parse::<SampleFormat>().ok(), Some(SampleFormat::S24Le));
        let err = "FLOAT_LE".parse::<SampleFormat>();
        assert!(matches!(err, Err(LevelcapError::UnsupportedFormat(_))));
    }

    #[test]
    fn widths() {
        assert_eq!(SampleFormat::S8.sample_bytes(), 1);
        assert_eq!(SampleFormat::U16Le.sample_bytes(), 2);
        assert_eq!(SampleFormat::S24Le.sample_bytes(), 4);
        assert_eq!(SampleFormat::S24Le.bits(), 24);
    }
}
