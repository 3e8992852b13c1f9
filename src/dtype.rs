use std::io::{Read, Seek, SeekFrom, Write};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[macro_export]
macro_rules! peek_magic {
    ($file:ident) => {{
        let mut buf: [u8; 4] = [0; 4];
        $file
            .read_exact(&mut buf)
            .and_then(|_| $file.seek(SeekFrom::Current(-4)))
            .map(move |_| buf)
    }};
}
#[macro_export]
macro_rules! peek_byte {
    ($file:ident) => {{
        let mut buf: [u8; 1] = [0; 1];
        $file
            .read_exact(&mut buf)
            .and_then(|_| $file.seek(SeekFrom::Current(-1)))
            .map(move |_| buf[0])
    }};
}

#[derive(Debug, Error)]
pub enum OkdError {
    #[error("Invalid magic bytes after descrambling. magic={0:02X?}")]
    BadMagic([u8; 4]),
    #[error("Failed to detect the scramble pattern index.")]
    UnknownKey,
    #[error("Header ended prematurely.")]
    TruncatedHeader,
    #[error("Chunk {tag:02X?} shorter than its declared length. expected={expected}, actual={actual}")]
    TruncatedChunk {
        tag: [u8; 4],
        expected: usize,
        actual: usize,
    },
    #[error("Variable-length integer continues past its third limb.")]
    CorruptVarInt,
    #[error("Variable-length integer value out of range. value={0:#X}")]
    VarIntOutOfRange(u32),
    #[error("Malformed SysEx frame. reason={0}")]
    BadSysexFrame(&'static str),
    #[error("Unknown status byte. status={0:#04X}")]
    UnknownStatus(u8),
    #[error("P-Track {0} has no track information entry.")]
    MissingTrackInfo(u8),
    #[error("Unsupported SMF shape. reason={0}")]
    UnsupportedSmf(&'static str),
    #[error("SMF parse error: {0}")]
    SmfParse(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub trait ReadWrite {
    fn write_to_file<W: Write + Seek>(&self, writer: &mut W) -> Result<usize, OkdError>;
}

/// Binary blob
impl ReadWrite for Vec<u8> {
    fn write_to_file<W: Write + Seek>(&self, writer: &mut W) -> Result<usize, OkdError> {
        writer.write_all(self)?;
        Ok(self.len())
    }
}

/// One event of the OKD MIDI dialect. `duration` is zero except for note
/// events, which carry their key-down time next to the message bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OkdMidiMessage {
    pub delta_time: u32,
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
    pub duration: u32,
}
impl OkdMidiMessage {
    pub fn new(delta_time: u32, data: Vec<u8>, duration: u32) -> OkdMidiMessage {
        OkdMidiMessage {
            delta_time,
            data,
            duration,
        }
    }
    pub fn status_byte(&self) -> u8 {
        self.data.first().copied().unwrap_or(0x00)
    }
}

/// A dialect message relocated onto its destination port/track and
/// stamped with an absolute time, ready for standard MIDI export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbsoluteTimeMessage {
    pub time: u32,
    pub port: u8,
    pub track: u16,
    pub data: Vec<u8>,
}

pub(crate) fn peek_data_byte<R: Read + Seek>(reader: &mut R) -> Result<Option<u8>, OkdError> {
    let mut buf = [0_u8; 1];
    if reader.read_exact(&mut buf).is_err() {
        return Ok(None);
    }
    reader.seek(SeekFrom::Current(-1))?;
    if buf[0] & 0x80 == 0x80 {
        return Ok(None);
    }
    Ok(Some(buf[0]))
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &Vec<u8>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(
            &v.iter()
                .map(|b| format!("{:02x}", b))
                .collect::<Vec<String>>()
                .join(""),
        )
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        if text.len() % 2 != 0 {
            return Err(serde::de::Error::custom("odd hex string length"));
        }
        (0..text.len())
            .step_by(2)
            .map(|i| {
                u8::from_str_radix(&text[i..i + 2], 16)
                    .map_err(|_| serde::de::Error::custom("invalid hex byte"))
            })
            .collect()
    }
}
