pub mod midi;

use std::io::{Read, Seek, SeekFrom, Write};

use byteorder::ReadBytesExt;
use serde::{Deserialize, Serialize};

use crate::dtype::{OkdError, OkdMidiMessage, ReadWrite};
use crate::okd_midi::{
    at_end_of_track, read_extended_variable_int, read_variable_int, write_extended_variable_int,
    write_variable_int,
};
use crate::peek_byte;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PTrackChunk {
    pub chunk_number: u8,
    pub messages: Vec<OkdMidiMessage>,
}

fn is_note_status(status_byte: u8) -> bool {
    matches!(status_byte & 0xF0, 0x80 | 0x90)
}

/// Payload size of a channel-voice status in this dialect. Note that
/// `An`/`Cn`/`Dn` carry a single byte (the alternate-CC value resp.
/// channel pressure) and `8n` carries the note-off velocity next to the
/// note-on velocity.
fn channel_voice_data_length(status_byte: u8) -> Option<usize> {
    match status_byte & 0xF0 {
        0x80 => Some(3),
        0x90 => Some(2),
        0xA0 | 0xC0 | 0xD0 => Some(1),
        0xB0 | 0xE0 => Some(2),
        _ => None,
    }
}

impl PTrackChunk {
    pub fn read<R: Read + Seek>(
        reader: &mut R,
        chunk_number: u8,
    ) -> Result<PTrackChunk, OkdError> {
        let mut messages = Vec::new();
        loop {
            if peek_byte!(reader).is_err() {
                break;
            }
            if at_end_of_track(reader)? {
                break;
            }

            let delta_time = read_extended_variable_int(reader)?;
            let status_byte = match reader.read_u8() {
                Ok(byte) => byte,
                Err(_) => break,
            };

            if status_byte == 0xF0 {
                if let Some(data) = Self::read_sysex(reader, status_byte)? {
                    messages.push(OkdMidiMessage::new(delta_time, data, 0));
                }
                continue;
            }

            let mut data = vec![status_byte];
            let mut duration = 0;
            if let Some(data_length) = channel_voice_data_length(status_byte) {
                for _ in 0..data_length {
                    data.push(reader.read_u8()?);
                }
                if is_note_status(status_byte) {
                    duration = read_variable_int(reader)?;
                }
            } else {
                match status_byte {
                    0xF7 => {}
                    0xF8 => {
                        for _ in 0..3 {
                            data.push(reader.read_u8()?);
                        }
                    }
                    0xF9 | 0xFA => {
                        data.push(reader.read_u8()?);
                    }
                    0xFD => {}
                    0xFE => {
                        let embedded_status = match peek_byte!(reader) {
                            Ok(byte) => byte,
                            Err(_) => break,
                        };
                        let Some(data_length) = channel_voice_data_length(embedded_status)
                        else {
                            log::warn!(
                                "Raw channel-voice escape before a non-channel byte, dropping. byte={:#04X}",
                                embedded_status
                            );
                            continue;
                        };
                        data.push(reader.read_u8()?);
                        for _ in 0..data_length {
                            data.push(reader.read_u8()?);
                        }
                        if is_note_status(embedded_status) {
                            duration = read_variable_int(reader)?;
                        }
                    }
                    _ => {
                        log::warn!(
                            "Dropping P-Track event. error={}",
                            OkdError::UnknownStatus(status_byte)
                        );
                        while let Ok(byte) = peek_byte!(reader) {
                            if byte & 0x80 == 0x80 {
                                break;
                            }
                            reader.read_u8()?;
                        }
                        continue;
                    }
                }
            }

            messages.push(OkdMidiMessage::new(delta_time, data, duration));
        }

        Ok(PTrackChunk {
            chunk_number,
            messages,
        })
    }

    /// SysEx payloads frequently lack their terminator in the wild:
    /// absorb up to the next status byte, keep the message only when
    /// that byte is `F7`.
    fn read_sysex<R: Read + Seek>(
        reader: &mut R,
        status_byte: u8,
    ) -> Result<Option<Vec<u8>>, OkdError> {
        let mut data = vec![status_byte];
        loop {
            let byte = match peek_byte!(reader) {
                Ok(byte) => byte,
                Err(_) => {
                    log::warn!("SysEx message cut off by the end of the track.");
                    return Ok(None);
                }
            };
            if byte & 0x80 == 0x80 {
                if byte == 0xF7 {
                    data.push(reader.read_u8()?);
                    return Ok(Some(data));
                }
                log::warn!(
                    "Unterminated SysEx message detected, dropping. next={:#04X}",
                    byte
                );
                return Ok(None);
            }
            data.push(reader.read_u8()?);
        }
    }

    pub fn track_status_duration_shift(track_status_lossless: bool) -> u32 {
        if track_status_lossless {
            0
        } else {
            2
        }
    }
}

impl ReadWrite for PTrackChunk {
    fn write_to_file<W: Write + Seek>(&self, writer: &mut W) -> Result<usize, OkdError> {
        let mut bytes_written = 0;
        for message in &self.messages {
            bytes_written += write_extended_variable_int(writer, message.delta_time)?;
            writer.write_all(&message.data)?;
            bytes_written += message.data.len();

            let status_byte = message.status_byte();
            let note = is_note_status(status_byte)
                || (status_byte == 0xFE
                    && message.data.get(1).copied().is_some_and(is_note_status));
            if note {
                bytes_written += write_variable_int(writer, message.duration)?;
            }
        }
        writer.write_all(&[0x00; 4])?;
        Ok(bytes_written + 4)
    }
}
