use std::collections::HashMap;

use midly::num::{u14, u15, u24, u28, u4, u7};
use midly::{
    Format, Header, MetaMessage, MidiMessage, Smf, Timing, TrackEvent, TrackEventKind,
};

use crate::dtype::{AbsoluteTimeMessage, OkdError, OkdMidiMessage};
use crate::midi;
use crate::track_info::TrackInfoEntry;

use super::PTrackChunk;

pub const CHANNEL_COUNT_PER_PORT: u16 = 16;

/// Export base: 480 PPQ at 125 BPM makes one tick one millisecond.
pub const TICKS_PER_BEAT: u16 = 480;
pub const TEMPO_MICROSECONDS_PER_BEAT: u32 = 480000;

pub(crate) fn ports_of(bitmap: u16) -> impl Iterator<Item = u8> {
    (0..16).filter(move |port| bitmap & (1 << port) != 0)
}

/// Relocate one track's dialect events onto their destination ports and
/// channels, pairing notes into on/off messages at absolute times.
///
/// Grouping is a one-shot edge flag: an `FD` event arms the alternate
/// fanout for exactly the next event. The `FE` escape strips one prefix
/// byte and bypasses the alternate-CC rewrite.
pub fn to_absolute_time_track(
    entry: &dyn TrackInfoEntry,
    messages: &[OkdMidiMessage],
) -> Vec<AbsoluteTimeMessage> {
    let duration_shift =
        PTrackChunk::track_status_duration_shift(entry.track_status().lossless_duration());

    let mut absolute_time_track: Vec<AbsoluteTimeMessage> = Vec::new();
    let mut time: u32 = 0;
    let mut is_grouping_armed = false;

    for message in messages {
        time += message.delta_time;

        let mut data: &[u8] = &message.data;
        let mut status_byte = message.status_byte();

        if status_byte == 0xFD {
            is_grouping_armed = true;
            continue;
        }

        let escaped = status_byte == 0xFE;
        if escaped {
            data = &data[1..];
            status_byte = match data.first() {
                Some(&byte) => byte,
                None => continue,
            };
        }

        if status_byte == 0xF0 {
            for port in ports_of(entry.system_ex_ports()) {
                absolute_time_track.push(AbsoluteTimeMessage {
                    time,
                    port,
                    track: port as u16 * CHANNEL_COUNT_PER_PORT,
                    data: data.to_vec(),
                });
            }
            is_grouping_armed = false;
            continue;
        }
        if status_byte & 0xF0 == 0xF0 {
            // Reserved realtime statuses have no destination channel.
            is_grouping_armed = false;
            continue;
        }

        let channel = (status_byte & 0x0F) as usize;
        let status_type = status_byte & 0xF0;

        // Alternate-CC rewrite, suppressed under the escape.
        let routing = entry.channel_routing(channel);
        let rewritten: Vec<u8>;
        let (status_type, payload): (u8, &[u8]) = if !escaped && status_type == 0xA0 {
            rewritten = vec![routing.control_change_ax, data[1]];
            (0xB0, &rewritten)
        } else if !escaped && status_type == 0xC0 {
            rewritten = vec![routing.control_change_cx, data[1]];
            (0xB0, &rewritten)
        } else {
            (status_type, &data[1..])
        };

        let group = if is_grouping_armed {
            entry.channel_group(channel)
        } else if entry.single_channel_group(channel) == 0 {
            1 << channel
        } else {
            entry.single_channel_group(channel)
        };

        for port in ports_of(routing.ports) {
            for destination in ports_of(group) {
                let track = port as u16 * CHANNEL_COUNT_PER_PORT + destination as u16;
                let status = status_type | destination;
                match status_type {
                    0x90 => {
                        let note_off_time =
                            time + (message.duration << duration_shift);
                        absolute_time_track.push(AbsoluteTimeMessage {
                            time,
                            port,
                            track,
                            data: vec![status, payload[0], payload[1]],
                        });
                        absolute_time_track.push(AbsoluteTimeMessage {
                            time: note_off_time,
                            port,
                            track,
                            data: vec![0x80 | destination, payload[0], 0x40],
                        });
                    }
                    0x80 => {
                        // Composite note with explicit note-off velocity.
                        let note_off_time =
                            time + (message.duration << duration_shift);
                        absolute_time_track.push(AbsoluteTimeMessage {
                            time,
                            port,
                            track,
                            data: vec![0x90 | destination, payload[0], payload[1]],
                        });
                        absolute_time_track.push(AbsoluteTimeMessage {
                            time: note_off_time,
                            port,
                            track,
                            data: vec![0x80 | destination, payload[0], payload[2]],
                        });
                    }
                    _ => {
                        let mut event_data = vec![status];
                        event_data.extend_from_slice(payload);
                        absolute_time_track.push(AbsoluteTimeMessage {
                            time,
                            port,
                            track,
                            data: event_data,
                        });
                    }
                }
            }
        }

        is_grouping_armed = false;
    }

    // Note-offs were appended next to their note-ons; a stable sort
    // moves them to their place while preserving arrival order inside
    // each time slot.
    absolute_time_track.sort_by_key(|message| message.time);
    absolute_time_track
}

fn channel_voice_kind(data: &[u8]) -> Option<(u4, MidiMessage)> {
    let status_byte = *data.first()?;
    let channel = u4::from(status_byte & 0x0F);
    let message = match status_byte & 0xF0 {
        0x80 => MidiMessage::NoteOff {
            key: u7::from(*data.get(1)?),
            vel: u7::from(*data.get(2)?),
        },
        0x90 => MidiMessage::NoteOn {
            key: u7::from(*data.get(1)?),
            vel: u7::from(*data.get(2)?),
        },
        0xA0 => MidiMessage::Aftertouch {
            key: u7::from(*data.get(1)?),
            vel: u7::from(*data.get(2)?),
        },
        0xB0 => MidiMessage::Controller {
            controller: u7::from(*data.get(1)?),
            value: u7::from(*data.get(2)?),
        },
        0xC0 => MidiMessage::ProgramChange {
            program: u7::from(*data.get(1)?),
        },
        0xD0 => MidiMessage::ChannelAftertouch {
            vel: u7::from(*data.get(1)?),
        },
        0xE0 => MidiMessage::PitchBend {
            bend: midly::PitchBend(u14::from(
                (*data.get(1)? as u16) | ((*data.get(2)? as u16) << 7),
            )),
        },
        _ => return None,
    };
    Some((channel, message))
}

/// Render relocated messages into a parallel SMF, one track per
/// destination slot, with `MidiPort` metas recognized by downstream
/// writers.
pub fn absolute_time_track_to_smf(
    messages: &[AbsoluteTimeMessage],
) -> Result<Vec<u8>, OkdError> {
    let track_count = messages
        .iter()
        .map(|message| message.track + 1)
        .max()
        .unwrap_or(1);

    let mut tracks: Vec<Vec<TrackEvent>> = Vec::with_capacity(track_count as usize);
    for track_index in 0..track_count {
        let mut track = Vec::new();
        if track_index == 0 {
            track.push(TrackEvent {
                delta: u28::from(0),
                kind: TrackEventKind::Meta(MetaMessage::Tempo(u24::from(
                    TEMPO_MICROSECONDS_PER_BEAT,
                ))),
            });
        }
        track.push(TrackEvent {
            delta: u28::from(0),
            kind: TrackEventKind::Meta(MetaMessage::MidiPort(u7::from(
                (track_index / CHANNEL_COUNT_PER_PORT) as u8,
            ))),
        });
        tracks.push(track);
    }

    let mut last_time = vec![0_u32; track_count as usize];
    for message in messages {
        let track_index = message.track as usize;
        let delta = message.time - last_time[track_index];

        let kind = if message.status_byte() == 0xF0 {
            TrackEventKind::SysEx(&message.data[1..])
        } else {
            match channel_voice_kind(&message.data) {
                Some((channel, midi_message)) => TrackEventKind::Midi {
                    channel,
                    message: midi_message,
                },
                None => {
                    log::warn!(
                        "Skipping unexportable message. data={:02X?}",
                        message.data
                    );
                    continue;
                }
            }
        };
        tracks[track_index].push(TrackEvent {
            delta: u28::from(delta),
            kind,
        });
        last_time[track_index] = message.time;
    }

    for track in tracks.iter_mut() {
        track.push(TrackEvent {
            delta: u28::from(0),
            kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
        });
    }

    let smf = Smf {
        header: Header {
            format: Format::Parallel,
            timing: Timing::Metrical(u15::from(TICKS_PER_BEAT)),
        },
        tracks,
    };
    let mut buffer = Vec::new();
    smf.write_std(&mut buffer)
        .map_err(|x| OkdError::SmfParse(x.to_string()))?;
    Ok(buffer)
}

impl AbsoluteTimeMessage {
    fn status_byte(&self) -> u8 {
        self.data.first().copied().unwrap_or(0x00)
    }
}

#[derive(Debug)]
enum ImportedEvent {
    Note {
        channel: u8,
        key: u8,
        on_velocity: u8,
        off_velocity: u8,
        duration: u32,
    },
    Raw(Vec<u8>),
}

impl PTrackChunk {
    /// Convert a karaoke SMF into one chunk per populated port. Stored
    /// durations use the quartered non-lossless form the platform
    /// writes (`track_status = 0x40`).
    pub fn from_midi(smf: &Smf) -> Result<Vec<PTrackChunk>, OkdError> {
        let ticks_per_beat = midi::get_midi_tpb(smf)?;
        let tempo = midi::get_first_tempo(smf);

        let mut ports: Vec<u8> = Vec::new();
        for track in &smf.tracks {
            let port = midi::get_track_port(track);
            if !ports.contains(&port)
                && track
                    .iter()
                    .any(|event| matches!(event.kind, TrackEventKind::Midi { .. }))
            {
                ports.push(port);
            }
        }
        ports.sort_unstable();

        let mut chunks = Vec::new();
        for port in ports {
            let mut events: Vec<(u32, ImportedEvent)> = Vec::new();
            for track in &smf.tracks {
                if midi::get_track_port(track) != port {
                    continue;
                }
                Self::import_track_events(track, tempo, ticks_per_beat, &mut events);
            }
            events.sort_by_key(|(time, _)| *time);

            let mut messages = Vec::with_capacity(events.len());
            let mut last_time = 0;
            for (time, imported) in events {
                let delta_time = time - last_time;
                last_time = time;
                match imported {
                    ImportedEvent::Note {
                        channel,
                        key,
                        on_velocity,
                        off_velocity,
                        duration,
                    } => {
                        let stored_duration = duration >> 2;
                        if off_velocity == 0x40 {
                            messages.push(OkdMidiMessage::new(
                                delta_time,
                                vec![0x90 | channel, key, on_velocity],
                                stored_duration,
                            ));
                        } else {
                            messages.push(OkdMidiMessage::new(
                                delta_time,
                                vec![0x80 | channel, key, on_velocity, off_velocity],
                                stored_duration,
                            ));
                        }
                    }
                    ImportedEvent::Raw(data) => {
                        messages.push(OkdMidiMessage::new(delta_time, data, 0));
                    }
                }
            }

            chunks.push(PTrackChunk {
                chunk_number: port,
                messages,
            });
        }
        Ok(chunks)
    }

    fn import_track_events(
        track: &[TrackEvent],
        tempo: u32,
        ticks_per_beat: u16,
        events: &mut Vec<(u32, ImportedEvent)>,
    ) {
        let mut held: HashMap<(u8, u8), usize> = HashMap::new();
        let mut tick: u64 = 0;
        for event in track {
            tick += event.delta.as_int() as u64;
            let time = midi::to_milli_ticks(tick, tempo, ticks_per_beat);
            match event.kind {
                TrackEventKind::Midi { channel, message } => {
                    let channel = channel.as_int();
                    match message {
                        MidiMessage::NoteOn { key, vel } if vel.as_int() > 0 => {
                            if held.contains_key(&(channel, key.as_int())) {
                                log::warn!(
                                    "Overlapping note, closing the held one. key={}",
                                    key.as_int()
                                );
                                Self::close_note(&mut held, events, channel, key.as_int(), time, 0x40);
                            }
                            events.push((
                                time,
                                ImportedEvent::Note {
                                    channel,
                                    key: key.as_int(),
                                    on_velocity: vel.as_int(),
                                    off_velocity: 0x40,
                                    duration: 0,
                                },
                            ));
                            held.insert((channel, key.as_int()), events.len() - 1);
                        }
                        MidiMessage::NoteOn { key, .. } => {
                            Self::close_note(&mut held, events, channel, key.as_int(), time, 0x40);
                        }
                        MidiMessage::NoteOff { key, vel } => {
                            Self::close_note(
                                &mut held,
                                events,
                                channel,
                                key.as_int(),
                                time,
                                vel.as_int(),
                            );
                        }
                        MidiMessage::Controller { controller, value } => {
                            events.push((
                                time,
                                ImportedEvent::Raw(vec![
                                    0xB0 | channel,
                                    controller.as_int(),
                                    value.as_int(),
                                ]),
                            ));
                        }
                        MidiMessage::ProgramChange { program } => {
                            // Cn is the alternate-CC status in this
                            // dialect; a real program change needs the
                            // raw channel-voice escape.
                            events.push((
                                time,
                                ImportedEvent::Raw(vec![0xFE, 0xC0 | channel, program.as_int()]),
                            ));
                        }
                        MidiMessage::ChannelAftertouch { vel } => {
                            events.push((
                                time,
                                ImportedEvent::Raw(vec![0xD0 | channel, vel.as_int()]),
                            ));
                        }
                        MidiMessage::PitchBend { bend } => {
                            let value = bend.0.as_int();
                            events.push((
                                time,
                                ImportedEvent::Raw(vec![
                                    0xE0 | channel,
                                    (value & 0x7F) as u8,
                                    (value >> 7) as u8,
                                ]),
                            ));
                        }
                        MidiMessage::Aftertouch { .. } => {}
                    }
                }
                TrackEventKind::SysEx(bytes) => {
                    let mut data = vec![0xF0];
                    data.extend_from_slice(bytes);
                    if data.last() != Some(&0xF7) {
                        data.push(0xF7);
                    }
                    events.push((time, ImportedEvent::Raw(data)));
                }
                _ => {}
            }
        }
    }

    fn close_note(
        held: &mut HashMap<(u8, u8), usize>,
        events: &mut [(u32, ImportedEvent)],
        channel: u8,
        key: u8,
        time: u32,
        velocity: u8,
    ) {
        let Some(index) = held.remove(&(channel, key)) else {
            log::warn!("Dangling note-off. key={}", key);
            return;
        };
        let (start, event) = &mut events[index];
        if let ImportedEvent::Note {
            duration,
            off_velocity,
            ..
        } = event
        {
            *duration = time - *start;
            *off_velocity = velocity;
        }
    }
}
