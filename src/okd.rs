pub mod header;

use std::io::{Cursor, Read, Seek, SeekFrom, Write};

use byteorder::{BigEndian, WriteBytesExt};

use crate::adpcm::AdpcmChunk;
use crate::dtype::{AbsoluteTimeMessage, OkdError, ReadWrite};
use crate::m_track::MTrackChunk;
use crate::mmt_tg::MmtTg;
use crate::p_track::midi::{ports_of, to_absolute_time_track};
use crate::p_track::PTrackChunk;
use crate::peek_magic;
use crate::scramble;
use crate::track_info::{
    ExtendedPTrackInfoChunk, P3TrackInfoChunk, PTrackInfoChunk, TrackInfoEntry,
};
use self::header::{FileHeader, OkaHeader, OkdHeader, AUDIO_MAGIC, PERFORMANCE_MAGIC};

pub const CHUNK_HEADER_SIZE: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenericChunk {
    pub chunk_id: [u8; 4],
    pub data: Vec<u8>,
}

/// Every payload the chunk stream is known to carry; anything else
/// round-trips verbatim as a generic chunk.
#[derive(Debug, Clone, PartialEq)]
pub enum Chunk {
    PTrackInfo(PTrackInfoChunk),
    ExtendedPTrackInfo(ExtendedPTrackInfoChunk),
    P3TrackInfo(P3TrackInfoChunk),
    MTrack(MTrackChunk),
    PTrack(PTrackChunk),
    Adpcm(AdpcmChunk),
    Generic(GenericChunk),
}

impl Chunk {
    pub fn chunk_id(&self) -> [u8; 4] {
        match self {
            Chunk::PTrackInfo(_) => *b"YPTI",
            Chunk::ExtendedPTrackInfo(_) => *b"YPXI",
            Chunk::P3TrackInfo(_) => *b"YP3I",
            Chunk::MTrack(chunk) => [0xFF, b'M', b'R', chunk.chunk_number],
            Chunk::PTrack(chunk) => [0xFF, b'P', b'R', chunk.chunk_number],
            Chunk::Adpcm(_) => *b"YADD",
            Chunk::Generic(chunk) => chunk.chunk_id,
        }
    }

    fn write_payload<W: Write + Seek>(&self, writer: &mut W) -> Result<usize, OkdError> {
        match self {
            Chunk::PTrackInfo(chunk) => chunk.write_to_file(writer),
            Chunk::ExtendedPTrackInfo(chunk) => chunk.write_to_file(writer),
            Chunk::P3TrackInfo(chunk) => chunk.write_to_file(writer),
            Chunk::MTrack(chunk) => chunk.write_to_file(writer),
            Chunk::PTrack(chunk) => chunk.write_to_file(writer),
            Chunk::Adpcm(chunk) => chunk.write_to_file(writer),
            Chunk::Generic(chunk) => chunk.data.write_to_file(writer),
        }
    }
}

pub struct OkdFile;

impl OkdFile {
    /// Decode pipeline, first stage: locate the pre-header, detect the
    /// scramble key, descramble header and chunk data, carve off the
    /// opaque trailing region verbatim.
    pub fn descramble<R: Read + Seek>(
        reader: &mut R,
    ) -> Result<(FileHeader, Vec<u8>), OkdError> {
        scramble::absorb_spr_header(reader)?;

        let scrambled_magic = peek_magic!(reader)?;
        let (expected_magic, scramble_pattern_index) =
            match scramble::detect_scramble_pattern_index(scrambled_magic, PERFORMANCE_MAGIC) {
                Ok(index) => (PERFORMANCE_MAGIC, index),
                Err(OkdError::UnknownKey) => (
                    AUDIO_MAGIC,
                    scramble::detect_scramble_pattern_index(scrambled_magic, AUDIO_MAGIC)?,
                ),
                Err(error) => return Err(error),
            };

        let (fixed, scramble_pattern_index) =
            scramble::descramble_exact(reader, header::FIXED_HEADER_SIZE, scramble_pattern_index)?;
        if fixed[0..4] != expected_magic {
            return Err(OkdError::BadMagic([fixed[0], fixed[1], fixed[2], fixed[3]]));
        }

        if expected_magic == PERFORMANCE_MAGIC {
            let option_data_length = OkdHeader::option_data_length_of(&fixed)? as usize;
            let (option_data, scramble_pattern_index) =
                scramble::descramble_exact(reader, option_data_length, scramble_pattern_index)?;
            let header = OkdHeader::parse(&fixed, &option_data)?;
            Self::descramble_body(reader, FileHeader::Okd(header), scramble_pattern_index)
        } else {
            let header = OkaHeader::parse(&fixed)?;
            Self::descramble_body(reader, FileHeader::Oka(header), scramble_pattern_index)
        }
    }

    fn descramble_body<R: Read + Seek>(
        reader: &mut R,
        file_header: FileHeader,
        scramble_pattern_index: u8,
    ) -> Result<(FileHeader, Vec<u8>), OkdError> {
        let data_offset = file_header.data_offset();
        let data_length = file_header
            .length()
            .checked_sub(data_offset)
            .ok_or(OkdError::TruncatedHeader)?;

        let extended_data_offset = file_header.extended_data_offset();
        let extended_data_length = if file_header.has_extended_data() {
            data_length
                .checked_sub(extended_data_offset)
                .ok_or(OkdError::TruncatedHeader)?
        } else {
            0
        };
        let scrambled_length = (data_length - extended_data_length) as usize;

        let (mut body, _) =
            scramble::descramble_exact(reader, scrambled_length, scramble_pattern_index)?;
        // Trailing opaque region (ADPCM audio) passes through verbatim.
        reader.read_to_end(&mut body)?;

        Ok((file_header, body))
    }

    /// Scan a descrambled body for `tag + be32 length` frames. The scan
    /// stops at the zero trailer or when fewer than a chunk header's
    /// worth of bytes remain.
    pub fn index_chunks(buffer: &[u8]) -> Vec<(usize, usize)> {
        let mut index = Vec::new();
        let mut position = 0_usize;
        while position + CHUNK_HEADER_SIZE <= buffer.len() {
            let tag = &buffer[position..position + 4];
            if tag[0] == 0x00 && tag[1] == 0x00 && tag[2] == 0x00 {
                break;
            }
            let declared = u32::from_be_bytes([
                buffer[position + 4],
                buffer[position + 5],
                buffer[position + 6],
                buffer[position + 7],
            ]) as usize;
            let total = (CHUNK_HEADER_SIZE + declared).min(buffer.len() - position);
            index.push((position, total));
            position += total;
        }
        index
    }

    pub fn parse_generic_chunk(buffer: &[u8]) -> Result<GenericChunk, OkdError> {
        if buffer.len() < CHUNK_HEADER_SIZE {
            return Err(OkdError::TruncatedHeader);
        }
        let chunk_id = [buffer[0], buffer[1], buffer[2], buffer[3]];
        let chunk_size =
            u32::from_be_bytes([buffer[4], buffer[5], buffer[6], buffer[7]]) as usize;
        let chunk_data = &buffer[CHUNK_HEADER_SIZE..];
        if chunk_data.len() != chunk_size {
            return Err(OkdError::TruncatedChunk {
                tag: chunk_id,
                expected: chunk_size,
                actual: chunk_data.len(),
            });
        }
        Ok(GenericChunk {
            chunk_id,
            data: chunk_data.to_vec(),
        })
    }

    pub fn parse_chunk(buffer: &[u8]) -> Result<Chunk, OkdError> {
        let generic = Self::parse_generic_chunk(buffer)?;
        let chunk_id = generic.chunk_id;
        let mut reader = Cursor::new(generic.data.as_slice());

        Ok(match &chunk_id {
            b"YPTI" => Chunk::PTrackInfo(PTrackInfoChunk::read(&mut reader)?),
            b"YPXI" => Chunk::ExtendedPTrackInfo(ExtendedPTrackInfoChunk::read(&mut reader)?),
            b"YP3I" => Chunk::P3TrackInfo(P3TrackInfoChunk::read(&mut reader)?),
            b"YADD" => Chunk::Adpcm(AdpcmChunk::read(&mut reader)?),
            [0xFF, b'M', b'R', chunk_number] => {
                Chunk::MTrack(MTrackChunk::read(&mut reader, *chunk_number)?)
            }
            [0xFF, b'P', b'R', chunk_number] => {
                Chunk::PTrack(PTrackChunk::read(&mut reader, *chunk_number)?)
            }
            _ => Chunk::Generic(generic),
        })
    }

    pub fn parse_chunks(buffer: &[u8]) -> Result<Vec<Chunk>, OkdError> {
        let mut chunks = Vec::new();
        for (position, size) in Self::index_chunks(buffer) {
            chunks.push(Self::parse_chunk(&buffer[position..position + size])?);
        }
        Ok(chunks)
    }

    fn write_chunk<W: Write + Seek>(writer: &mut W, chunk: &Chunk) -> Result<usize, OkdError> {
        let mut payload_writer = Cursor::new(Vec::new());
        chunk.write_payload(&mut payload_writer)?;
        let mut payload = payload_writer.into_inner();
        if payload.len() % 2 != 0 {
            payload.push(0x00);
        }

        writer.write_all(&chunk.chunk_id())?;
        writer.write_u32::<BigEndian>(payload.len() as u32)?;
        writer.write_all(&payload)?;
        Ok(CHUNK_HEADER_SIZE + payload.len())
    }

    /// Encode pipeline: serialize the chunk stream, build a composed
    /// header around it, and scramble everything under a random key.
    /// A chunk list carrying performance tracks but no track info gets
    /// one derived in front.
    pub fn scramble<W: Write + Seek>(writer: &mut W, chunks: &[Chunk]) -> Result<(), OkdError> {
        let has_track_info = chunks.iter().any(|chunk| {
            matches!(
                chunk,
                Chunk::PTrackInfo(_) | Chunk::ExtendedPTrackInfo(_) | Chunk::P3TrackInfo(_)
            )
        });
        let p_tracks: Vec<PTrackChunk> = chunks
            .iter()
            .filter_map(|chunk| match chunk {
                Chunk::PTrack(p_track) => Some(p_track.clone()),
                _ => None,
            })
            .collect();

        let derived_chunks;
        let chunks = if !has_track_info && !p_tracks.is_empty() {
            log::info!("No track information given, deriving one from the P-Tracks.");
            let mut with_info = vec![crate::compose::track_info_from_p_tracks(&p_tracks)];
            with_info.extend_from_slice(chunks);
            derived_chunks = with_info;
            &derived_chunks[..]
        } else {
            chunks
        };

        let mut body_writer = Cursor::new(Vec::new());
        for chunk in chunks {
            Self::write_chunk(&mut body_writer, chunk)?;
        }
        body_writer.write_all(&[0x00; 4])?;
        let mut body = body_writer.into_inner();

        let okd_header = OkdHeader::composed(body.len() as u32);
        let mut header_writer = Cursor::new(Vec::new());
        okd_header.write_to_file(&mut header_writer)?;
        let mut header_bytes = header_writer.into_inner();

        let scramble_pattern_index = scramble::choose_scramble_pattern_index();
        let next_index = scramble::scramble(&mut header_bytes, scramble_pattern_index);
        scramble::scramble(&mut body, next_index);

        writer.write_all(&header_bytes)?;
        writer.write_all(&body)?;
        Ok(())
    }

    /// The container's single active track info: extended wins over
    /// short, the scoring-reference shape stands alone.
    pub fn collect_track_info(chunks: &[Chunk]) -> Vec<&dyn TrackInfoEntry> {
        if let Some(extended) = chunks.iter().find_map(|chunk| match chunk {
            Chunk::ExtendedPTrackInfo(chunk) => Some(chunk),
            _ => None,
        }) {
            return extended
                .entries
                .iter()
                .map(|entry| entry as &dyn TrackInfoEntry)
                .collect();
        }
        if let Some(short) = chunks.iter().find_map(|chunk| match chunk {
            Chunk::PTrackInfo(chunk) => Some(chunk),
            _ => None,
        }) {
            return short
                .entries
                .iter()
                .map(|entry| entry as &dyn TrackInfoEntry)
                .collect();
        }
        chunks
            .iter()
            .filter_map(|chunk| match chunk {
                Chunk::P3TrackInfo(chunk) => Some(chunk as &dyn TrackInfoEntry),
                _ => None,
            })
            .collect()
    }

    /// Decode pipeline, last stage: relocate every performance track,
    /// lift tone-generator SysEx into General MIDI controller traffic,
    /// and merge into one time-ordered message list.
    pub fn to_absolute_general_midi(
        chunks: &[Chunk],
    ) -> Result<Vec<AbsoluteTimeMessage>, OkdError> {
        let entries = Self::collect_track_info(chunks);
        let mut device = MmtTg::new();
        let mut setup_done = [false; 16];
        let mut messages: Vec<AbsoluteTimeMessage> = Vec::new();

        let mut p_track_ordinal = 0_usize;
        for chunk in chunks {
            let Chunk::PTrack(p_track) = chunk else {
                continue;
            };
            let ordinal = p_track_ordinal;
            p_track_ordinal += 1;

            let entry = entries
                .iter()
                .find(|entry| entry.track_number() == p_track.chunk_number)
                .or_else(|| entries.get(ordinal))
                .copied();
            let Some(entry) = entry else {
                log::warn!(
                    "{}",
                    OkdError::MissingTrackInfo(p_track.chunk_number)
                );
                continue;
            };

            for port in ports_of(entry.system_ex_ports()) {
                if !setup_done[port as usize] {
                    messages.extend(device.track_setup_messages(port));
                    setup_done[port as usize] = true;
                }
            }

            let absolute_time_track = to_absolute_time_track(entry, &p_track.messages);
            let mut last_sysex: Option<(u32, Vec<u8>)> = None;
            for message in absolute_time_track {
                if message.data.first() == Some(&0xF0) {
                    // The projection fans SysEx out to every listening
                    // port; the device must see each message once.
                    let key = (message.time, message.data.clone());
                    if last_sysex.as_ref() == Some(&key) {
                        continue;
                    }
                    messages.extend(device.sysex_to_general_midi(&message));
                    last_sysex = Some(key);
                } else {
                    messages.push(message);
                }
            }
        }

        messages.sort_by_key(|message| message.time);
        Ok(messages)
    }

    /// Full GM export: a parallel SMF with port metas per destination
    /// track, at the container's fixed 480 PPQ / 125 BPM base.
    pub fn to_midi(chunks: &[Chunk]) -> Result<Vec<u8>, OkdError> {
        let messages = Self::to_absolute_general_midi(chunks)?;
        crate::p_track::midi::absolute_time_track_to_smf(&messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::OkdMidiMessage;
    use crate::track_info::{PTrackInfoChannelInfoEntry, PTrackInfoEntry};

    fn sample_info_chunk() -> PTrackInfoChunk {
        let mut entry = PTrackInfoEntry {
            track_number: 0,
            track_status: 0x48,
            channel_info: vec![PTrackInfoChannelInfoEntry::default(); 16],
            system_ex_ports: 0x0001,
            ..Default::default()
        };
        for channel_info in entry.channel_info.iter_mut() {
            channel_info.ports = 0x01;
            channel_info.attribute = 255;
            channel_info.control_change_ax = 0x0B;
            channel_info.control_change_cx = 0x01;
        }
        PTrackInfoChunk {
            entries: vec![entry],
        }
    }

    fn sample_chunks() -> Vec<Chunk> {
        vec![
            Chunk::PTrackInfo(sample_info_chunk()),
            Chunk::MTrack(MTrackChunk {
                chunk_number: 0,
                messages: vec![
                    OkdMidiMessage::new(0, vec![0xF1], 0),
                    OkdMidiMessage::new(480, vec![0xF2], 0),
                ],
            }),
            Chunk::PTrack(PTrackChunk {
                chunk_number: 0,
                messages: vec![
                    OkdMidiMessage::new(0, vec![0x90, 0x3C, 0x40], 240),
                    OkdMidiMessage::new(240, vec![0xB0, 0x07, 0x64], 0),
                ],
            }),
            Chunk::Adpcm(AdpcmChunk {
                adpcms: vec![vec![0x01, 0x02, 0x03]],
            }),
            Chunk::Generic(GenericChunk {
                chunk_id: *b"YXXX",
                data: vec![0xDE, 0xAD],
            }),
        ]
    }

    #[test]
    fn container_roundtrips_through_scramble() {
        let chunks = sample_chunks();
        let mut container = Cursor::new(Vec::new());
        OkdFile::scramble(&mut container, &chunks).unwrap();

        container.set_position(0);
        let (file_header, body) = OkdFile::descramble(&mut container).unwrap();
        let FileHeader::Okd(okd_header) = &file_header else {
            panic!("expected a performance header");
        };
        assert_eq!(okd_header.adpcm_offset, 0);
        assert_eq!(okd_header.encryption_mode, 1);
        assert_eq!(okd_header.length as usize, 40 + body.len());

        let reread = OkdFile::parse_chunks(&body).unwrap();
        assert_eq!(reread, chunks);
    }

    #[test]
    fn chunk_payloads_are_padded_to_even() {
        let chunk = Chunk::Generic(GenericChunk {
            chunk_id: *b"YXXX",
            data: vec![0x01, 0x02, 0x03],
        });
        let mut writer = Cursor::new(Vec::new());
        OkdFile::write_chunk(&mut writer, &chunk).unwrap();
        let bytes = writer.into_inner();
        assert_eq!(bytes.len(), CHUNK_HEADER_SIZE + 4);
        assert_eq!(u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]), 4);
    }

    #[test]
    fn index_stops_at_the_trailer() {
        let mut body = Vec::new();
        body.extend_from_slice(b"YXXX");
        body.extend_from_slice(&2_u32.to_be_bytes());
        body.extend_from_slice(&[0xAA, 0xBB]);
        body.extend_from_slice(&[0x00; 4]);
        let index = OkdFile::index_chunks(&body);
        assert_eq!(index, vec![(0, 10)]);
    }

    #[test]
    fn extended_region_passes_through_verbatim() {
        // Build a container by hand: composed header with a nonzero
        // adpcm offset and an opaque tail behind the chunk stream.
        let mut body_writer = Cursor::new(Vec::new());
        OkdFile::write_chunk(
            &mut body_writer,
            &Chunk::Generic(GenericChunk {
                chunk_id: *b"YXXX",
                data: vec![0x55, 0x66],
            }),
        )
        .unwrap();
        body_writer.write_all(&[0x00; 4]).unwrap();
        let scrambled_part = body_writer.into_inner();
        let tail = vec![0x10, 0x20, 0x30, 0x40];

        let mut okd_header =
            OkdHeader::composed((scrambled_part.len() + tail.len()) as u32);
        okd_header.adpcm_offset = 40 + scrambled_part.len() as u32;
        let mut header_writer = Cursor::new(Vec::new());
        okd_header.write_to_file(&mut header_writer).unwrap();
        let mut header_bytes = header_writer.into_inner();

        let next = scramble::scramble(&mut header_bytes, 7);
        let mut scrambled = scrambled_part.clone();
        scramble::scramble(&mut scrambled, next);

        let mut container = header_bytes;
        container.extend_from_slice(&scrambled);
        container.extend_from_slice(&tail);

        let (file_header, b) = OkdFile::descramble(&mut Cursor::new(container)).unwrap();
        assert!(file_header.has_extended_data());
        assert_eq!(&b[..scrambled_part.len()], &scrambled_part[..]);
        assert_eq!(&b[scrambled_part.len()..], &tail[..]);
    }

    #[test]
    fn general_midi_export_contains_setup_and_notes() {
        let chunks = sample_chunks();
        let messages = OkdFile::to_absolute_general_midi(&chunks).unwrap();
        // The setup burst precedes the note events.
        assert!(messages.len() > 2);
        assert_eq!(messages[0].time, 0);
        let note_on = messages
            .iter()
            .find(|message| message.data == vec![0x90, 0x3C, 0x40])
            .unwrap();
        assert_eq!(note_on.track, 0);
        let note_off = messages
            .iter()
            .find(|message| message.data == vec![0x80, 0x3C, 0x40])
            .unwrap();
        assert_eq!(note_off.time, 240);

        let smf_bytes = OkdFile::to_midi(&chunks).unwrap();
        let smf = midly::Smf::parse(&smf_bytes).unwrap();
        assert!(!smf.tracks.is_empty());
    }
}
