use std::io::{Read, Seek, SeekFrom, Write};

use byteorder::ReadBytesExt;
use midly::Smf;
use phf::phf_map;
use serde::{Deserialize, Serialize};

use crate::dtype::{OkdError, OkdMidiMessage, ReadWrite};
use crate::midi;
use crate::okd_midi::{
    at_end_of_track, read_extended_variable_int, write_extended_variable_int,
};
use crate::peek_byte;

/// Marker statuses with a fixed payload size. `FF` (reserved, variable)
/// and `FE` (sentinel) are handled separately.
static MARKER_DATA_LENGTHS: phf::Map<u8, usize> = phf_map! {
    0xF1_u8 => 0, // measure start, implicit first beat
    0xF2_u8 => 0, // beat
    0xF3_u8 => 1, // hook boundary
    0xF4_u8 => 1, // visible guide melody page delimiter
    0xF5_u8 => 0, // two-chorus fade-out
    0xF6_u8 => 1, // song section boundary
    0xF8_u8 => 1, // ADPCM cue section boundary
    0xFE_u8 => 0,
};

/// Length of one marker tick in milliseconds equivalents: the stream
/// stores quarter ticks, interpreted at 125 BPM / 480 PPQ (1 ms/tick).
const M_TRACK_TIME_SHIFT: u32 = 2;

/// Page synthesis rule: a visible page may close once this many ticks
/// have elapsed, and only in front of a silence longer than the same
/// span.
const VISIBLE_PAGE_MIN_TICKS: u32 = 8000;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MTrackChunk {
    pub chunk_number: u8,
    pub messages: Vec<OkdMidiMessage>,
}

impl MTrackChunk {
    /// Delta times come out scaled to final ticks.
    pub fn read<R: Read + Seek>(
        reader: &mut R,
        chunk_number: u8,
    ) -> Result<MTrackChunk, OkdError> {
        let mut messages = Vec::new();
        loop {
            if peek_byte!(reader).is_err() {
                break;
            }
            if at_end_of_track(reader)? {
                break;
            }

            let delta_time = read_extended_variable_int(reader)? << M_TRACK_TIME_SHIFT;
            let status_byte = match reader.read_u8() {
                Ok(byte) => byte,
                Err(_) => break,
            };

            let mut data = vec![status_byte];
            if let Some(&data_length) = MARKER_DATA_LENGTHS.get(&status_byte) {
                for _ in 0..data_length {
                    data.push(reader.read_u8()?);
                }
            } else if status_byte == 0xFF {
                // Reserved marker, payload runs to the next status byte.
                while let Ok(byte) = peek_byte!(reader) {
                    if byte & 0x80 == 0x80 {
                        break;
                    }
                    data.push(reader.read_u8()?);
                }
            } else {
                log::warn!(
                    "Unknown M-Track status byte, resynchronizing. status_byte={:#04X}",
                    status_byte
                );
                while let Ok(byte) = peek_byte!(reader) {
                    if byte >= 0xF1 {
                        break;
                    }
                    data.push(reader.read_u8()?);
                }
                continue;
            }

            messages.push(OkdMidiMessage::new(delta_time, data, 0));
        }

        Ok(MTrackChunk {
            chunk_number,
            messages,
        })
    }

    pub fn interpret(&self) -> MTrackInterpretation {
        MTrackInterpretation::from_messages(&self.messages)
    }

    /// Synthesize the marker track for a karaoke SMF. Bars and beats
    /// follow the file's first tempo and time signature; visible pages
    /// follow the guide melody on port 1 channel 8.
    pub fn from_midi(smf: &Smf) -> Result<MTrackChunk, OkdError> {
        let ticks_per_beat = midi::get_midi_tpb(smf)?;
        let tempo = midi::get_first_tempo(smf);
        let melody_track = midi::get_port_channel_track(smf, 1, 8)
            .ok_or(OkdError::UnsupportedSmf("melody track not found"))?;

        let spans: Vec<(u32, u32)> = midi::note_spans(&smf.tracks[melody_track], 8)
            .into_iter()
            .map(|span| {
                (
                    midi::to_milli_ticks(span.start, tempo, ticks_per_beat) & !3,
                    midi::to_milli_ticks(span.end, tempo, ticks_per_beat) & !3,
                )
            })
            .collect();
        if spans.is_empty() {
            return Err(OkdError::UnsupportedSmf("melody track has no notes"));
        }
        let last_note_end = spans.iter().map(|span| span.1).max().unwrap_or(0);

        let mut events: Vec<(u32, Vec<u8>)> = Vec::new();

        // Bars and beats up to the end of the melody.
        let beats_per_measure = midi::get_first_time_signature(smf).max(1);
        let mut beat_index: u64 = 0;
        loop {
            let beat_tick = midi::to_milli_ticks(
                beat_index * ticks_per_beat as u64,
                tempo,
                ticks_per_beat,
            ) & !3;
            if beat_tick > last_note_end {
                break;
            }
            if beat_index % beats_per_measure as u64 == 0 {
                events.push((beat_tick, vec![0xF1]));
            } else {
                events.push((beat_tick, vec![0xF2]));
            }
            beat_index += 1;
        }

        // Visible guide melody pages.
        events.push((spans[0].0, vec![0xF4, 0x00]));
        let mut page_start = spans[0].0;
        for (index, &(_, end)) in spans.iter().enumerate() {
            let is_last = index + 1 == spans.len();
            if is_last {
                events.push((end, vec![0xF4, 0x03]));
                break;
            }
            let next_start = spans[index + 1].0;
            if end - page_start >= VISIBLE_PAGE_MIN_TICKS
                && next_start.saturating_sub(end) > VISIBLE_PAGE_MIN_TICKS
            {
                events.push((end, vec![0xF4, 0x01]));
                events.push((next_start, vec![0xF4, 0x00]));
                page_start = next_start;
            }
        }

        // Song section envelope.
        events.push((spans[0].0, vec![0xF6, 0x00]));
        events.push((last_note_end, vec![0xF6, 0x01]));

        events.sort_by_key(|(tick, _)| *tick);

        let mut messages = Vec::with_capacity(events.len());
        let mut last_tick = 0;
        for (tick, data) in events {
            messages.push(OkdMidiMessage::new(tick - last_tick, data, 0));
            last_tick = tick;
        }

        Ok(MTrackChunk {
            chunk_number: 0,
            messages,
        })
    }
}

impl ReadWrite for MTrackChunk {
    fn write_to_file<W: Write + Seek>(&self, writer: &mut W) -> Result<usize, OkdError> {
        let mut bytes_written = 0;
        for message in &self.messages {
            bytes_written +=
                write_extended_variable_int(writer, message.delta_time >> M_TRACK_TIME_SHIFT)?;
            writer.write_all(&message.data)?;
            bytes_written += message.data.len();
        }
        // Trailer and alignment: two zero words.
        writer.write_all(&[0x00; 8])?;
        Ok(bytes_written + 8)
    }
}

/// Musical reading of a marker stream, in final ticks (1 ms at the
/// format's fixed 125 BPM / 480 PPQ base).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MTrackInterpretation {
    pub tempos: Vec<(u32, u32)>,
    pub time_signatures: Vec<(u32, u8)>,
    pub hooks: Vec<(u32, u32)>,
    pub visible_guide_melody_delimiters: Vec<(u32, u8)>,
    pub two_chorus_fadeout_time: Option<u32>,
    pub song_section: Option<(u32, u32)>,
    pub adpcm_sections: Vec<(u32, u32)>,
}

impl MTrackInterpretation {
    pub fn from_messages(messages: &[OkdMidiMessage]) -> MTrackInterpretation {
        let mut interpretation = MTrackInterpretation::default();

        let mut tick: u32 = 0;
        let mut beat_ticks: Vec<u32> = Vec::new();
        let mut measure_beat_counts: Vec<(u32, u8)> = Vec::new();
        let mut current_measure: Option<(u32, u8)> = None;
        let mut hook_start: Option<u32> = None;
        let mut section_start: Option<u32> = None;
        let mut adpcm_start: Option<u32> = None;

        for message in messages {
            tick += message.delta_time;
            match message.status_byte() {
                0xF1 => {
                    if let Some(measure) = current_measure.take() {
                        measure_beat_counts.push(measure);
                    }
                    current_measure = Some((tick, 1));
                    beat_ticks.push(tick);
                }
                0xF2 => {
                    if let Some((_, beats)) = current_measure.as_mut() {
                        *beats += 1;
                    }
                    beat_ticks.push(tick);
                }
                0xF3 => match message.data.get(1) {
                    Some(0x00) | Some(0x02) => hook_start = Some(tick),
                    Some(0x01) | Some(0x03) => {
                        if let Some(start) = hook_start.take() {
                            interpretation.hooks.push((start, tick));
                        }
                    }
                    kind => log::warn!("Unknown hook boundary kind. kind={:?}", kind),
                },
                0xF4 => {
                    if let Some(&kind) = message.data.get(1) {
                        interpretation
                            .visible_guide_melody_delimiters
                            .push((tick, kind));
                    }
                }
                0xF5 => {
                    interpretation.two_chorus_fadeout_time.get_or_insert(tick);
                }
                0xF6 => match message.data.get(1) {
                    Some(0x00) => section_start = Some(tick),
                    Some(0x01) => {
                        if let Some(start) = section_start.take() {
                            interpretation.song_section = Some((start, tick));
                        }
                    }
                    kind => log::warn!("Unknown song section kind. kind={:?}", kind),
                },
                0xF8 => match message.data.get(1) {
                    Some(0x00) => adpcm_start = Some(tick),
                    Some(0x01) => {
                        if let Some(start) = adpcm_start.take() {
                            interpretation.adpcm_sections.push((start, tick));
                        }
                    }
                    kind => log::warn!("Unknown ADPCM section kind. kind={:?}", kind),
                },
                _ => {}
            }
        }
        // A trailing measure with no closing barline stays uncounted.

        // Tempo from beat spacing: one beat of n ticks is n milliseconds.
        let mut last_bpm = 0;
        for pair in beat_ticks.windows(2) {
            let interval = pair[1] - pair[0];
            if interval == 0 {
                continue;
            }
            let bpm = (60000.0 / interval as f64).round() as u32;
            if bpm != last_bpm {
                interpretation.tempos.push((pair[0], bpm));
                last_bpm = bpm;
            }
        }

        let mut last_beats = 0;
        for (measure_tick, beats) in measure_beat_counts {
            if beats != last_beats {
                interpretation.time_signatures.push((measure_tick, beats));
                last_beats = beats;
            }
        }

        interpretation
    }
}
