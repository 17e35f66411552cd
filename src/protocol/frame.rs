//! Voice frame codec
//!
//! Every voice payload on the wire is prefixed with a fixed 96-bit header:
//!
//! ```text
//! byte 0      [version:4][audio_format_hi:4]
//! byte 1      [audio_format_lo:4][sample_rate_15..12:4]
//! byte 2      sample_rate_11..4
//! byte 3      [sample_rate_3..0:4][channels:2][frame_type:2]
//! bytes 4-5   frame_seq (big-endian)
//! bytes 6-7   timestamp (low 16 bits of epoch seconds)
//! bytes 8-9   payload_length
//! bytes 10-11 crc16
//! ```
//!
//! The CRC is CRC-16 with the reflected polynomial `0xA001`, initial value
//! zero and no final XOR, computed over the header with the CRC field zeroed
//! followed by the payload.

use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

/// Size of the serialized frame header in bytes
pub const HEADER_LEN: usize = 12;

/// Protocol version carried in outbound frames
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Audio format identifiers carried in the header
pub mod format {
    pub const PCM: u8 = 0x01;
    pub const AAC: u8 = 0x02;
    pub const OPUS: u8 = 0x03;
    pub const MP3: u8 = 0x04;
    pub const G711A: u8 = 0x05;
    pub const G711U: u8 = 0x06;
    pub const WAV: u8 = 0x07;

    /// File extension for an audio format identifier
    #[must_use]
    pub fn extension(format: u8) -> &'static str {
        match format {
            PCM => "pcm",
            AAC => "aac",
            OPUS => "opus",
            MP3 => "mp3",
            G711A => "g711a",
            G711U => "g711u",
            WAV => "wav",
            _ => "unknown",
        }
    }
}

/// How a frame relates to the utterance it belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    /// A complete utterance in one frame
    Full,
    /// One piece of a multi-frame utterance
    Fragment,
    /// The final piece of a multi-frame utterance
    Last,
}

impl FrameType {
    /// Decode the two-bit wire value; `None` for the reserved value 0
    #[must_use]
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits & 0x03 {
            0x01 => Some(Self::Full),
            0x02 => Some(Self::Fragment),
            0x03 => Some(Self::Last),
            _ => None,
        }
    }

    /// The two-bit wire value
    #[must_use]
    pub fn bits(self) -> u8 {
        match self {
            Self::Full => 0x01,
            Self::Fragment => 0x02,
            Self::Last => 0x03,
        }
    }
}

/// Errors from decoding a framed payload
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Fewer bytes than a header needs
    #[error("short header: need {HEADER_LEN} bytes, got {0}")]
    ShortHeader(usize),

    /// Recomputed CRC disagrees with the header
    #[error("bad crc: header {header:#06x}, computed {computed:#06x}")]
    BadCrc { header: u16, computed: u16 },

    /// Declared payload length disagrees with the bytes present
    #[error("payload length mismatch: declared {declared}, got {actual}")]
    LengthMismatch { declared: u16, actual: usize },
}

/// The decoded 12-byte voice frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameHeader {
    /// Protocol version (4 bits)
    pub version: u8,
    /// Audio format identifier (see [`format`])
    pub audio_format: u8,
    /// Sample rate in Hz (16 bits)
    pub sample_rate: u16,
    /// Channel count: 1 = mono, 2 = stereo, 3 = multi (2 bits)
    pub channels: u8,
    /// Frame type bits: 1 = full, 2 = fragment, 3 = last (2 bits)
    pub frame_type: u8,
    /// Monotonically increasing per utterance, starting at 0
    pub frame_seq: u16,
    /// Low 16 bits of epoch seconds at send time
    pub timestamp: u16,
    /// Byte count of the payload following the header
    pub payload_len: u16,
    /// CRC over header-with-crc-zeroed plus payload
    pub crc16: u16,
}

impl FrameHeader {
    /// Serialize the header into its 12-byte wire form
    #[must_use]
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];

        buf[0] = ((self.version & 0x0F) << 4) | ((self.audio_format >> 4) & 0x0F);
        buf[1] = ((self.audio_format & 0x0F) << 4) | (((self.sample_rate >> 12) & 0x0F) as u8);
        buf[2] = ((self.sample_rate >> 4) & 0xFF) as u8;
        buf[3] = (((self.sample_rate & 0x0F) << 4) as u8)
            | ((self.channels & 0x03) << 2)
            | (self.frame_type & 0x03);
        buf[4..6].copy_from_slice(&self.frame_seq.to_be_bytes());
        buf[6..8].copy_from_slice(&self.timestamp.to_be_bytes());
        buf[8..10].copy_from_slice(&self.payload_len.to_be_bytes());
        buf[10..12].copy_from_slice(&self.crc16.to_be_bytes());

        buf
    }

    /// Deserialize a header from the first 12 bytes of `data`
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::ShortHeader`] if `data` is shorter than 12 bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() < HEADER_LEN {
            return Err(FrameError::ShortHeader(data.len()));
        }

        Ok(Self {
            version: (data[0] >> 4) & 0x0F,
            audio_format: ((data[0] & 0x0F) << 4) | (data[1] >> 4),
            sample_rate: (u16::from(data[1] & 0x0F) << 12)
                | (u16::from(data[2]) << 4)
                | (u16::from(data[3] >> 4) & 0x0F),
            channels: (data[3] >> 2) & 0x03,
            frame_type: data[3] & 0x03,
            frame_seq: u16::from_be_bytes([data[4], data[5]]),
            timestamp: u16::from_be_bytes([data[6], data[7]]),
            payload_len: u16::from_be_bytes([data[8], data[9]]),
            crc16: u16::from_be_bytes([data[10], data[11]]),
        })
    }
}

/// CRC-16, reflected polynomial `0xA001`, initial value 0, no final XOR
#[must_use]
pub fn crc16_maxim(data: &[u8]) -> u16 {
    let mut crc: u16 = 0x0000;
    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0xA001
            } else {
                crc >> 1
            };
        }
    }
    crc
}

/// Encode a header and payload into a framed buffer
///
/// `payload_len` and `crc16` are filled in here; whatever the caller put in
/// those fields is overwritten.
#[must_use]
pub fn encode(mut header: FrameHeader, payload: &[u8]) -> Vec<u8> {
    header.payload_len = payload.len() as u16;
    header.crc16 = 0;

    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&header.to_bytes());
    buf.extend_from_slice(payload);

    let crc = crc16_maxim(&buf);
    buf[10..12].copy_from_slice(&crc.to_be_bytes());

    buf
}

/// Decode a framed buffer into its header and payload slice
///
/// # Errors
///
/// Returns [`FrameError::ShortHeader`] when fewer than 12 bytes are present,
/// [`FrameError::BadCrc`] when the recomputed CRC disagrees with the header,
/// and [`FrameError::LengthMismatch`] when `payload_len` disagrees with the
/// bytes remaining after the header.
pub fn decode(data: &[u8]) -> Result<(FrameHeader, &[u8]), FrameError> {
    let header = FrameHeader::from_bytes(data)?;
    let payload = &data[HEADER_LEN..];

    let mut check = data.to_vec();
    check[10] = 0;
    check[11] = 0;
    let computed = crc16_maxim(&check);
    if computed != header.crc16 {
        return Err(FrameError::BadCrc {
            header: header.crc16,
            computed,
        });
    }

    if usize::from(header.payload_len) != payload.len() {
        return Err(FrameError::LengthMismatch {
            declared: header.payload_len,
            actual: payload.len(),
        });
    }

    Ok((header, payload))
}

/// Audio properties stamped into outbound frame headers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioProfile {
    /// Audio format identifier (see [`format`])
    pub format: u8,
    /// Sample rate in Hz
    pub sample_rate: u16,
    /// Channel count
    pub channels: u8,
}

impl Default for AudioProfile {
    fn default() -> Self {
        Self {
            format: format::WAV,
            sample_rate: 16_000,
            channels: 1,
        }
    }
}

/// Low 16 bits of the current epoch-seconds clock
fn wire_timestamp() -> u16 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as u16
}

/// Build a framed payload with the given frame type and sequence number
#[must_use]
fn build(seq: u16, payload: &[u8], frame_type: FrameType, profile: AudioProfile) -> Vec<u8> {
    let header = FrameHeader {
        version: PROTOCOL_VERSION,
        audio_format: profile.format,
        sample_rate: profile.sample_rate,
        channels: profile.channels,
        frame_type: frame_type.bits(),
        frame_seq: seq,
        timestamp: wire_timestamp(),
        ..FrameHeader::default()
    };
    encode(header, payload)
}

/// Build a standalone full-utterance frame (`frame_seq` 0)
#[must_use]
pub fn build_full(payload: &[u8], profile: AudioProfile) -> Vec<u8> {
    build(0, payload, FrameType::Full, profile)
}

/// Build one frame of a streamed utterance
///
/// `last` marks the final frame; intermediate frames are fragments.
#[must_use]
pub fn build_stream(seq: u16, payload: &[u8], profile: AudioProfile, last: bool) -> Vec<u8> {
    let frame_type = if last {
        FrameType::Last
    } else {
        FrameType::Fragment
    };
    build(seq, payload, frame_type, profile)
}
