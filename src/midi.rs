use midly::{MetaMessage, MidiMessage, Smf, TrackEvent, TrackEventKind};

use crate::dtype::OkdError;

pub const DEFAULT_TEMPO: u32 = 500000;

/// Open an input SMF.
pub fn open_midi(smf_source: &[u8]) -> Result<Smf, OkdError> {
    Smf::parse(smf_source).map_err(|x| OkdError::SmfParse(x.to_string()))
}

pub fn get_midi_tpb(smf: &Smf) -> Result<u16, OkdError> {
    match smf.header.timing {
        midly::Timing::Metrical(tpb) => Ok(tpb.as_int()),
        _ => Err(OkdError::UnsupportedSmf("SMPTE timing is not supported")),
    }
}

pub fn get_first_tempo(smf: &Smf) -> u32 {
    for track in &smf.tracks {
        for event in track {
            if let TrackEventKind::Meta(MetaMessage::Tempo(tempo)) = event.kind {
                return tempo.as_int();
            }
        }
    }
    DEFAULT_TEMPO
}

/// Numerator of the first time signature meta event, defaulting to 4/4.
pub fn get_first_time_signature(smf: &Smf) -> u8 {
    for track in &smf.tracks {
        for event in track {
            if let TrackEventKind::Meta(MetaMessage::TimeSignature(numerator, _, _, _)) =
                event.kind
            {
                return numerator;
            }
        }
    }
    4
}

pub fn get_track_port(track: &[TrackEvent]) -> u8 {
    for event in track {
        if let TrackEventKind::Meta(MetaMessage::MidiPort(port)) = event.kind {
            return port.as_int();
        }
    }
    0
}

/// Index of the first track on `port` that plays notes on `channel`.
pub fn get_port_channel_track(smf: &Smf, port: u8, channel: u8) -> Option<usize> {
    for (index, track) in smf.tracks.iter().enumerate() {
        if get_track_port(track) != port {
            continue;
        }
        for event in track {
            if let TrackEventKind::Midi {
                channel: event_channel,
                message: MidiMessage::NoteOn { .. },
            } = event.kind
            {
                if event_channel.as_int() == channel {
                    return Some(index);
                }
            }
        }
    }
    None
}

/// Convert source ticks to the container's millisecond ticks
/// (480 PPQ at 125 BPM).
pub fn to_milli_ticks(ticks: u64, tempo: u32, ticks_per_beat: u16) -> u32 {
    (ticks * tempo as u64 / (ticks_per_beat as u64 * 1000)) as u32
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoteSpan {
    pub start: u64,
    pub end: u64,
    pub key: u8,
    pub on_velocity: u8,
    pub off_velocity: u8,
}

/// Pair note-ons with their note-offs on one channel, in source ticks.
/// A note-on with velocity zero closes like a note-off.
pub fn note_spans(track: &[TrackEvent], channel: u8) -> Vec<NoteSpan> {
    let mut spans: Vec<NoteSpan> = Vec::new();
    let mut held: Vec<(u8, usize)> = Vec::new();
    let mut tick: u64 = 0;

    for event in track {
        tick += event.delta.as_int() as u64;
        let TrackEventKind::Midi {
            channel: event_channel,
            message,
        } = event.kind
        else {
            continue;
        };
        if event_channel.as_int() != channel {
            continue;
        }
        match message {
            MidiMessage::NoteOn { key, vel } if vel.as_int() > 0 => {
                spans.push(NoteSpan {
                    start: tick,
                    end: tick,
                    key: key.as_int(),
                    on_velocity: vel.as_int(),
                    off_velocity: 0x40,
                });
                held.push((key.as_int(), spans.len() - 1));
            }
            MidiMessage::NoteOn { key, .. } | MidiMessage::NoteOff { key, .. } => {
                let off_velocity = match message {
                    MidiMessage::NoteOff { vel, .. } => vel.as_int(),
                    _ => 0x40,
                };
                if let Some(position) = held.iter().position(|(held_key, _)| *held_key == key.as_int())
                {
                    let (_, span_index) = held.remove(position);
                    spans[span_index].end = tick;
                    spans[span_index].off_velocity = off_velocity;
                } else {
                    log::warn!("Dangling note-off. key={}", key.as_int());
                }
            }
            _ => {}
        }
    }
    for (key, span_index) in held {
        log::warn!("Unterminated note, closing at track end. key={}", key);
        spans[span_index].end = tick;
    }

    spans.sort_by_key(|span| span.start);
    spans
}

#[cfg(test)]
mod tests {
    use super::*;
    use midly::num::{u28, u4, u7};

    fn note_event<'a>(delta: u32, on: bool, key: u8, vel: u8) -> TrackEvent<'a> {
        TrackEvent {
            delta: u28::from(delta),
            kind: TrackEventKind::Midi {
                channel: u4::from(8),
                message: if on {
                    MidiMessage::NoteOn {
                        key: u7::from(key),
                        vel: u7::from(vel),
                    }
                } else {
                    MidiMessage::NoteOff {
                        key: u7::from(key),
                        vel: u7::from(vel),
                    }
                },
            },
        }
    }

    #[test]
    fn spans_pair_on_and_off() {
        let track = vec![
            note_event(0, true, 60, 100),
            note_event(240, false, 60, 32),
            note_event(240, true, 62, 90),
            note_event(120, true, 62, 0),
        ];
        let spans = note_spans(&track, 8);
        assert_eq!(
            spans,
            vec![
                NoteSpan {
                    start: 0,
                    end: 240,
                    key: 60,
                    on_velocity: 100,
                    off_velocity: 32
                },
                NoteSpan {
                    start: 480,
                    end: 600,
                    key: 62,
                    on_velocity: 90,
                    off_velocity: 0x40
                },
            ]
        );
    }

    #[test]
    fn milli_tick_conversion() {
        // One beat at 120 BPM and 96 PPQ is 500 ms.
        assert_eq!(to_milli_ticks(96, 500000, 96), 500);
        // At the container's own base the mapping is the identity.
        assert_eq!(to_milli_ticks(480, 480000, 480), 480);
    }
}
